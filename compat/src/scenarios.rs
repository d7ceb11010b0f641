//! Compatibility scenarios between fee policy versions.

use crate::{
    fleet::{Node, Role},
    node::{self, Address, Amount, FeeRate, Rpc},
    oracle::Oracle,
    Backend, Error, Harness, Scenario,
};
use commonware_runtime::{Clock, Metrics};
use tracing::info;

/// Cross-version propagation and mining across three policy generations.
///
/// Every version gets a miner, a relay and a wallet, all linked in a full mesh. After
/// seeding each wallet from the legacy miner, three transfers back to the legacy miner
/// check who relays and who mines what:
///
/// 1. The legacy wallet pays the legacy rate: everyone relays it and the current miner
///    mines it.
/// 2. The current wallet pays its default rate: everyone relays it and the legacy miner
///    mines it.
/// 3. The strict wallet pays its lower rate: only current and strict nodes accept it, a
///    legacy block leaves it pending, and a current block clears it everywhere.
#[derive(Clone, Debug)]
pub struct FeeMatrix {
    pub legacy: String,
    pub current: String,
    pub strict: String,

    /// Sent from the legacy miner to every wallet before the transfers.
    pub seed: Amount,
    /// Sent by each wallet during the transfers.
    pub amount: Amount,
}

impl Default for FeeMatrix {
    fn default() -> Self {
        Self {
            legacy: "01140300".into(),
            current: "01140400".into(),
            strict: "01140500".into(),
            seed: Amount::from_coins(1_000),
            amount: Amount::from_coins(49),
        }
    }
}

impl FeeMatrix {
    /// Blocks mined before seeding (so the miner has mature funds).
    const MATURITY: u64 = 102;

    /// Blocks mined to confirm the seeds.
    const CONFIRMATIONS: u64 = 5;

    async fn legacy_to_all<E: Clock + Metrics, B: Backend>(
        &self,
        harness: &Harness<E, B>,
        oracle: &Oracle,
        target: &Address,
    ) -> Result<(), Error> {
        let wallet = harness.node(&self.legacy, Role::Wallet)?;
        let miner = harness.node(&self.current, Role::Miner)?;
        let everyone = harness.lookup(None, None)?;

        let tx = wallet
            .handle()
            .send_to_address(target, self.amount)
            .await?;
        harness.sync_all(&everyone).await?;
        oracle.visible_at(&everyone, &tx, true).await?;

        let block = mine(miner).await?;
        oracle.included(miner, &block, &tx, true).await?;
        harness.sync_all(&everyone).await?;
        oracle.mempool_size(&[wallet], 0).await?;
        oracle.cleared(&everyone, &tx, true).await
    }

    async fn current_to_all<E: Clock + Metrics, B: Backend>(
        &self,
        harness: &Harness<E, B>,
        oracle: &Oracle,
        target: &Address,
    ) -> Result<(), Error> {
        let wallet = harness.node(&self.current, Role::Wallet)?;
        let miner = harness.node(&self.legacy, Role::Miner)?;
        let everyone = harness.lookup(None, None)?;

        let tx = wallet
            .handle()
            .send_to_address(target, self.amount)
            .await?;
        harness.sync_all(&everyone).await?;
        oracle.visible_at(&everyone, &tx, true).await?;

        let block = mine(miner).await?;
        oracle.included(miner, &block, &tx, true).await?;
        harness.sync_all(&everyone).await?;
        oracle.mempool_size(&[wallet], 0).await
    }

    async fn strict_to_current<E: Clock + Metrics, B: Backend>(
        &self,
        harness: &Harness<E, B>,
        oracle: &Oracle,
        target: &Address,
    ) -> Result<(), Error> {
        let wallet = harness.node(&self.strict, Role::Wallet)?;
        let legacy_miner = harness.node(&self.legacy, Role::Miner)?;
        let current_miner = harness.node(&self.current, Role::Miner)?;
        let legacy = harness.lookup(Some(&*self.legacy), None)?;
        let mut accepting = harness.lookup(Some(&*self.current), None)?;
        accepting.extend(harness.lookup(Some(&*self.strict), None)?);
        let everyone = harness.lookup(None, None)?;

        let tx = wallet
            .handle()
            .send_to_address(target, self.amount)
            .await?;

        // Each side of the policy split settles on its own
        harness.sync_mempools(&accepting).await?;
        harness.sync_mempools(&legacy).await?;
        oracle.visible_at(&accepting, &tx, true).await?;
        oracle.mempool_size(&legacy, 0).await?;

        // A legacy block cannot include what legacy nodes never saw
        let block = mine(legacy_miner).await?;
        oracle.included(legacy_miner, &block, &tx, false).await?;
        harness.sync_blocks(&everyone).await?;
        oracle.mempool_size(&[wallet], 1).await?;

        let block = mine(current_miner).await?;
        oracle.included(current_miner, &block, &tx, true).await?;
        harness.sync_all(&everyone).await?;
        oracle.mempool_size(&[wallet], 0).await?;
        oracle.mempool_size(&everyone, 0).await
    }
}

impl Scenario for FeeMatrix {
    fn name(&self) -> &str {
        "fee_matrix"
    }

    async fn run<E: Clock + Metrics, B: Backend>(
        &self,
        harness: &mut Harness<E, B>,
    ) -> Result<(), Error> {
        harness
            .provision_versions(&[&*self.legacy, &*self.current, &*self.strict])
            .await?;
        harness.connect_all().await?;
        harness.sync_fleet().await?;

        // Fund every wallet from the legacy miner
        let oracle = Oracle::new(self.name());
        let miner = harness.node(&self.legacy, Role::Miner)?;
        let target = miner.handle().new_address().await?;
        miner.handle().generate(Self::MATURITY).await?;
        for label in [&self.legacy, &self.current, &self.strict] {
            let wallet = harness.node(label, Role::Wallet)?;
            let address = wallet.handle().new_address().await?;
            miner.handle().send_to_address(&address, self.seed).await?;
        }
        miner.handle().generate(Self::CONFIRMATIONS).await?;
        harness.sync_fleet().await?;
        info!(scenario = self.name(), "seeded wallets");

        self.legacy_to_all(harness, &oracle, &target).await?;
        self.current_to_all(harness, &oracle, &target).await?;
        self.strict_to_current(harness, &oracle, &target).await?;

        // Every version agrees in the end
        harness.sync_fleet().await?;
        Ok(())
    }
}

/// A well-paying transaction survives mempool eviction pressure.
///
/// Two linked nodes of the same capacity-limited version receive identical zero-fee
/// transactions until the mempool starts evicting. A transaction paying a multiple of
/// the relay fee must then reach both nodes. Further batches paying rising multiples of
/// the relay fee displace cheaper entries, after which the protected transaction must
/// still be pending everywhere and be mined by the second node.
#[derive(Clone, Debug)]
pub struct MempoolSpam {
    pub label: String,

    /// Size of each spam transaction (in bytes).
    pub spam_size: usize,

    /// Give up (and fail) if no eviction occurs after this many zero-fee transactions.
    pub max_spam: usize,

    /// Multiple of the relay fee paid by the protected transaction.
    pub multiplier: u64,

    /// Size of the protected transaction (in bytes).
    pub size: usize,

    /// Multiples of the relay fee paid by each batch sent after the protected transaction.
    pub pressure: Vec<u64>,

    /// Transactions sent per pressure batch.
    pub batch: usize,
}

impl Default for MempoolSpam {
    fn default() -> Self {
        Self {
            label: "mempool-spam".into(),
            spam_size: 66_000,
            max_spam: 64,
            multiplier: 25,
            size: 226,
            pressure: vec![2, 3],
            batch: 16,
        }
    }
}

impl MempoolSpam {
    /// Create one spam transaction at `fee_rate` and feed it to every node in `nodes`.
    ///
    /// Rejections are expected once the mempool floor rises.
    async fn inject<H: Rpc>(
        &self,
        creator: &Node<H>,
        nodes: &[&Node<H>],
        address: &Address,
        fee_rate: FeeRate,
    ) -> Result<(), Error> {
        let spam = creator
            .handle()
            .create_transaction(address, Amount::from_coins(1), fee_rate, self.spam_size)
            .await?;
        for node in nodes {
            match node.handle().send_raw_transaction(&spam).await {
                Ok(_) | Err(node::Error::Rejected(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl Scenario for MempoolSpam {
    fn name(&self) -> &str {
        "mempool_spam"
    }

    async fn run<E: Clock + Metrics, B: Backend>(
        &self,
        harness: &mut Harness<E, B>,
    ) -> Result<(), Error> {
        harness.provision(&self.label, Role::Wallet).await?;
        harness.provision(&self.label, Role::Miner).await?;
        harness.connect_all().await?;
        harness.sync_fleet().await?;

        let oracle = Oracle::new(self.name());
        let spammer = harness.node(&self.label, Role::Wallet)?;
        let miner = harness.node(&self.label, Role::Miner)?;
        let nodes = [spammer, miner];
        let address = spammer.handle().new_address().await?;

        // Free transactions are not relayed, so each node is fed directly
        let mut injected = 0;
        while injected < self.max_spam {
            self.inject(spammer, &nodes, &address, FeeRate::ZERO).await?;
            injected += 1;
            if spammer.handle().mempool_info().await?.size < injected {
                break;
            }
        }
        info!(scenario = self.name(), injected, "mempool under pressure");
        oracle.mempool_below(spammer, injected).await?;

        // Pay well above the floor created by eviction
        let relay_fee = spammer.handle().network_info().await?.relay_fee;
        let paying = spammer
            .handle()
            .create_transaction(
                &address,
                Amount::from_coins(1),
                relay_fee.saturating_mul(self.multiplier),
                self.size,
            )
            .await?;
        let tx = spammer.handle().send_raw_transaction(&paying).await?;
        injected += 1;
        harness.sync_mempools(&nodes).await?;
        oracle.visible_at(&nodes, &tx, true).await?;

        // Displace everything cheaper than each batch
        for multiplier in &self.pressure {
            let fee_rate = relay_fee.saturating_mul(*multiplier);
            for _ in 0..self.batch {
                self.inject(spammer, &nodes, &address, fee_rate).await?;
                injected += 1;
            }
            info!(scenario = self.name(), %fee_rate, injected, "sent pressure batch");
        }
        harness.sync_mempools(&nodes).await?;
        oracle.visible_at(&nodes, &tx, true).await?;
        for node in nodes {
            oracle.mempool_below(node, injected).await?;
        }

        let block = mine(miner).await?;
        oracle.included(miner, &block, &tx, true).await?;
        harness.sync_all(&nodes).await?;
        oracle.cleared(&nodes, &tx, true).await
    }
}

/// Produce a single block at `node`.
async fn mine<H: Rpc>(node: &Node<H>) -> Result<node::BlockHash, Error> {
    let blocks = node.handle().generate(1).await?;
    blocks
        .into_iter()
        .next()
        .ok_or_else(|| node::Error::Rejected("no block produced".into()).into())
}
