//! Compare declared scenario expectations against observed node state.
//!
//! The oracle knows nothing about fee policy. A scenario states what it expects
//! (a transaction is visible to some node, included in some block, cleared after
//! mining) and the oracle queries the nodes and fails with
//! [Error::ScenarioAssertion] on the first disagreement.

use crate::{
    fleet::Node,
    node::{BlockHash, Rpc, TxId},
    Error,
};
use std::fmt::{Display, Formatter};
use tracing::{debug, error};

/// A property of observed node state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// `tx` is pending in the mempool of `node`.
    Visible { node: String, tx: TxId },
    /// `tx` is part of `block` as reported by `node`.
    Included {
        node: String,
        block: BlockHash,
        tx: TxId,
    },
    /// `tx` is no longer pending in the mempool of `node`.
    Cleared { node: String, tx: TxId },
    /// Number of transactions pending at `node`.
    MempoolSize { node: String },
    /// Whether fewer than `bound` transactions are pending at `node`.
    MempoolBelow { node: String, bound: usize },
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Visible { node, tx } => write!(f, "{tx} visible at {node}"),
            Predicate::Included { node, block, tx } => {
                write!(f, "{tx} included in {block} at {node}")
            }
            Predicate::Cleared { node, tx } => write!(f, "{tx} cleared at {node}"),
            Predicate::MempoolSize { node } => write!(f, "mempool size at {node}"),
            Predicate::MempoolBelow { node, bound } => {
                write!(f, "mempool size at {node} below {bound}")
            }
        }
    }
}

fn describe<H>(node: &Node<H>) -> String {
    format!("{}/{}#{}", node.label(), node.role(), node.id())
}

/// Evaluates predicates on behalf of a named scenario.
#[derive(Clone, Debug)]
pub struct Oracle {
    scenario: String,
}

impl Oracle {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Assert whether `tx` is pending at `node`.
    pub async fn visible<H: Rpc>(
        &self,
        node: &Node<H>,
        tx: &TxId,
        expected: bool,
    ) -> Result<(), Error> {
        let actual = node.handle().raw_mempool().await?.contains(tx);
        let predicate = Predicate::Visible {
            node: describe(node),
            tx: *tx,
        };
        self.check(predicate, expected, actual)
    }

    /// Assert whether `tx` is pending at every node in `nodes`.
    pub async fn visible_at<H: Rpc>(
        &self,
        nodes: &[&Node<H>],
        tx: &TxId,
        expected: bool,
    ) -> Result<(), Error> {
        for node in nodes {
            self.visible(node, tx, expected).await?;
        }
        Ok(())
    }

    /// Assert whether `tx` is part of `block` (as known to `node`).
    pub async fn included<H: Rpc>(
        &self,
        node: &Node<H>,
        block: &BlockHash,
        tx: &TxId,
        expected: bool,
    ) -> Result<(), Error> {
        let actual = node.handle().block_transactions(block).await?.contains(tx);
        let predicate = Predicate::Included {
            node: describe(node),
            block: *block,
            tx: *tx,
        };
        self.check(predicate, expected, actual)
    }

    /// Assert whether `tx` has left the mempool of every node in `nodes`.
    pub async fn cleared<H: Rpc>(
        &self,
        nodes: &[&Node<H>],
        tx: &TxId,
        expected: bool,
    ) -> Result<(), Error> {
        for node in nodes {
            let actual = !node.handle().raw_mempool().await?.contains(tx);
            let predicate = Predicate::Cleared {
                node: describe(node),
                tx: *tx,
            };
            self.check(predicate, expected, actual)?;
        }
        Ok(())
    }

    /// Assert the number of transactions pending at every node in `nodes`.
    pub async fn mempool_size<H: Rpc>(
        &self,
        nodes: &[&Node<H>],
        expected: usize,
    ) -> Result<(), Error> {
        for node in nodes {
            let actual = node.handle().mempool_info().await?.size;
            let predicate = Predicate::MempoolSize {
                node: describe(node),
            };
            self.check(predicate, expected, actual)?;
        }
        Ok(())
    }

    /// Assert that fewer than `bound` transactions are pending at `node`.
    pub async fn mempool_below<H: Rpc>(&self, node: &Node<H>, bound: usize) -> Result<(), Error> {
        let size = node.handle().mempool_info().await?.size;
        let predicate = Predicate::MempoolBelow {
            node: describe(node),
            bound,
        };
        self.check(predicate, true, size < bound)
    }

    fn check<T: PartialEq + Display>(
        &self,
        predicate: Predicate,
        expected: T,
        actual: T,
    ) -> Result<(), Error> {
        if expected == actual {
            debug!(scenario = %self.scenario, %predicate, %actual, "assertion held");
            return Ok(());
        }
        error!(
            scenario = %self.scenario,
            %predicate,
            %expected,
            %actual,
            "assertion failed"
        );
        Err(Error::ScenarioAssertion {
            scenario: self.scenario.clone(),
            predicate,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
