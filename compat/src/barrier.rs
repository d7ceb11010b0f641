//! Wait for independently running nodes to agree on chain and mempool state.
//!
//! Nodes are black boxes reachable only over RPC, so agreement can't be observed as an
//! event. Instead, a [Barrier] repeatedly snapshots every node, returns as soon as one
//! round of snapshots agrees, and sleeps for a fixed interval between rounds. After a
//! bounded number of rounds it gives up with [Error::ConvergenceTimeout], carrying the
//! last (divergent) snapshots so that "still settling" can be told apart from "diverged".

use crate::{
    fleet::{Node, NodeId},
    node::{ChainTip, Rpc, TxId},
    Error,
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics};
use prometheus_client::metrics::counter::Counter;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    time::Duration,
};
use tracing::{debug, warn};

/// Configuration for a [Barrier].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Time to wait between snapshot rounds.
    #[serde(rename = "interval_ms", with = "crate::config::millis")]
    pub interval: Duration,

    /// Maximum number of snapshot rounds (at least one round is always taken).
    pub max_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_rounds: 60,
        }
    }
}

/// The state nodes must agree on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Identical best block (height and hash).
    ChainTips,
    /// Identical set of pending transaction ids.
    Mempools,
    /// Both of the above.
    All,
}

impl Kind {
    fn tips(&self) -> bool {
        matches!(self, Kind::ChainTips | Kind::All)
    }

    fn mempools(&self) -> bool {
        matches!(self, Kind::Mempools | Kind::All)
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Kind::ChainTips => "chain tips",
            Kind::Mempools => "mempools",
            Kind::All => "chain tips and mempools",
        };
        f.write_str(name)
    }
}

/// What a node reported in one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub node: NodeId,
    pub tip: Option<ChainTip>,
    pub mempool: Option<BTreeSet<TxId>>,
}

impl Snapshot {
    fn agrees(&self, other: &Self) -> bool {
        self.tip == other.tip && self.mempool == other.mempool
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.node)?;
        if let Some(tip) = &self.tip {
            write!(f, " tip={tip}")?;
        }
        if let Some(mempool) = &self.mempool {
            write!(f, " mempool=[")?;
            for (i, id) in mempool.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{id}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// Snapshots of every node in a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshots(pub Vec<Snapshot>);

impl Display for Snapshots {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, snapshot) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{snapshot}")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Metrics {
    rounds: Counter,
    converged: Counter,
    timeouts: Counter,
}

impl Metrics {
    fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("rounds", "Snapshot rounds polled", metrics.rounds.clone());
        context.register(
            "converged",
            "Barriers that observed agreement",
            metrics.converged.clone(),
        );
        context.register(
            "timeouts",
            "Barriers that exhausted their rounds",
            metrics.timeouts.clone(),
        );
        metrics
    }
}

/// Bounded polling convergence detection.
pub struct Barrier<E: Clock + RuntimeMetrics> {
    context: E,
    cfg: Config,
    metrics: Metrics,
}

impl<E: Clock + RuntimeMetrics> Barrier<E> {
    pub fn new(context: E, cfg: Config) -> Self {
        let metrics = Metrics::init(&context);
        Self {
            context,
            cfg,
            metrics,
        }
    }

    pub fn config(&self) -> Config {
        self.cfg
    }

    /// Replace the interval and round bound (i.e. for a slow scenario).
    pub fn set_config(&mut self, cfg: Config) {
        self.cfg = cfg;
    }

    /// Wait until all `nodes` report the same chain tip.
    pub async fn wait_chain_tips<H: Rpc>(&self, nodes: &[&Node<H>]) -> Result<usize, Error> {
        self.wait(Kind::ChainTips, nodes).await
    }

    /// Wait until all `nodes` report the same mempool contents.
    pub async fn wait_mempools<H: Rpc>(&self, nodes: &[&Node<H>]) -> Result<usize, Error> {
        self.wait(Kind::Mempools, nodes).await
    }

    /// Wait until all `nodes` report the same chain tip and mempool contents.
    pub async fn wait_all<H: Rpc>(&self, nodes: &[&Node<H>]) -> Result<usize, Error> {
        self.wait(Kind::All, nodes).await
    }

    /// Poll `nodes` until they agree on `kind`, returning the number of rounds taken.
    ///
    /// Zero or one node agrees trivially (without being polled).
    pub async fn wait<H: Rpc>(&self, kind: Kind, nodes: &[&Node<H>]) -> Result<usize, Error> {
        if nodes.len() <= 1 {
            return Ok(0);
        }
        let max_rounds = self.cfg.max_rounds.max(1);
        let mut round = 0;
        loop {
            round += 1;
            self.metrics.rounds.inc();
            let mut snapshots = Vec::with_capacity(nodes.len());
            for node in nodes {
                snapshots.push(snapshot(kind, node).await?);
            }
            if snapshots.windows(2).all(|pair| pair[0].agrees(&pair[1])) {
                self.metrics.converged.inc();
                debug!(%kind, round, nodes = nodes.len(), "converged");
                return Ok(round);
            }
            if round >= max_rounds {
                self.metrics.timeouts.inc();
                let snapshots = Snapshots(snapshots);
                warn!(%kind, round, %snapshots, "convergence timeout");
                return Err(Error::ConvergenceTimeout {
                    kind,
                    rounds: round,
                    snapshots,
                });
            }
            debug!(%kind, round, "diverged");
            self.context.sleep(self.cfg.interval).await;
        }
    }
}

async fn snapshot<H: Rpc>(kind: Kind, node: &Node<H>) -> Result<Snapshot, Error> {
    let tip = match kind.tips() {
        true => Some(node.handle().chain_tip().await?),
        false => None,
    };
    let mempool = match kind.mempools() {
        true => Some(node.handle().raw_mempool().await?),
        false => None,
    };
    Ok(Snapshot {
        node: node.id(),
        tip,
        mempool,
    })
}
