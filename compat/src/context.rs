//! Drive scenarios against a fleet of provisioned nodes.
//!
//! A [Harness] owns everything a scenario touches: the [Registry] of versions, the
//! [Fleet] started through a [Backend], the [Topology] linking it, and the [Barrier]
//! used to wait for convergence. [Harness::execute] bounds a [Scenario] by the scenario
//! timeout and stops every node it provisioned regardless of outcome.
//! Dropping an expired scenario also drops any barrier it was waiting on.

use crate::{
    barrier::{self, Barrier, Kind},
    fleet::{Fleet, Node, NodeId, Role},
    node::{Lifecycle, Linker},
    registry::Registry,
    topology::Topology,
    Error,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics};
use prometheus_client::metrics::gauge::Gauge;
use std::{collections::BTreeSet, future::Future, time::Duration};
use tracing::{error, info, warn};

/// Everything needed to start and connect nodes.
pub trait Backend: Lifecycle + Linker<<Self as Lifecycle>::Handle> {}

impl<T> Backend for T where T: Lifecycle + Linker<<T as Lifecycle>::Handle> {}

/// Configuration for a [Harness].
#[derive(Clone, Debug)]
pub struct Config {
    /// Versions nodes may be provisioned from.
    pub registry: Registry,

    /// Settle interval and round bound of every sync.
    pub barrier: barrier::Config,

    /// Maximum duration of [Harness::execute] (excluding teardown).
    pub scenario_timeout: Duration,
}

/// A script run against a [Harness].
pub trait Scenario {
    /// Name reported in assertion failures and logs.
    fn name(&self) -> &str;

    /// Provision, connect, drive and check nodes.
    ///
    /// Nodes provisioned here are torn down by [Harness::execute] regardless of outcome.
    fn run<E: Clock + Metrics, B: Backend>(
        &self,
        harness: &mut Harness<E, B>,
    ) -> impl Future<Output = Result<(), Error>>;
}

/// Owns the registry, fleet, and topology of a scenario.
pub struct Harness<E: Clock + Metrics, B: Backend> {
    context: E,
    backend: B,
    registry: Registry,
    fleet: Fleet<B::Handle>,
    topology: Topology,
    barrier: Barrier<E>,
    scenario_timeout: Duration,

    nodes: Gauge,
}

impl<E: Clock + Metrics, B: Backend> Harness<E, B> {
    pub fn new(context: E, backend: B, cfg: Config) -> Self {
        let barrier = Barrier::new(context.with_label("barrier"), cfg.barrier);
        let nodes = Gauge::default();
        context.register("nodes", "Nodes currently provisioned", nodes.clone());
        Self {
            context,
            backend,
            registry: cfg.registry,
            fleet: Fleet::new(),
            topology: Topology::new(),
            barrier,
            scenario_timeout: cfg.scenario_timeout,
            nodes,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn fleet(&self) -> &Fleet<B::Handle> {
        &self.fleet
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start a node of version `label` serving `role`.
    pub async fn provision(&mut self, label: &str, role: Role) -> Result<NodeId, Error> {
        let id = self
            .fleet
            .provision(&self.registry, &mut self.backend, label, role)
            .await?;
        self.nodes.set(self.fleet.len() as i64);
        Ok(id)
    }

    /// Start one node per role for each of `labels` (in the order given, then role order).
    pub async fn provision_versions(&mut self, labels: &[&str]) -> Result<Vec<NodeId>, Error> {
        let mut ids = Vec::with_capacity(labels.len() * Role::ALL.len());
        for label in labels {
            for role in Role::ALL {
                ids.push(self.provision(label, role).await?);
            }
        }
        Ok(ids)
    }

    /// Start one node per role for every registered version.
    pub async fn provision_all(&mut self) -> Result<Vec<NodeId>, Error> {
        let labels: Vec<String> = self.registry.labels().map(String::from).collect();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        self.provision_versions(&labels).await
    }

    /// See [Fleet::lookup].
    pub fn lookup(
        &self,
        label: Option<&str>,
        role: Option<Role>,
    ) -> Result<Vec<&Node<B::Handle>>, Error> {
        self.fleet.lookup(&self.registry, label, role)
    }

    /// The node provisioned for (`label`, `role`).
    pub fn node(&self, label: &str, role: Role) -> Result<&Node<B::Handle>, Error> {
        self.registry.resolve(label)?;
        self.fleet.find(label, role)
    }

    /// Nodes directly linked to `id`.
    pub fn peers(&self, id: NodeId) -> Result<BTreeSet<NodeId>, Error> {
        self.fleet.get(id)?;
        Ok(self.topology.peers(id))
    }

    /// Link every pair of provisioned nodes.
    pub async fn connect_all(&mut self) -> Result<(), Error> {
        self.topology
            .connect_all(&self.fleet, &mut self.backend)
            .await
    }

    /// Link exactly the given pairs (i.e. to model a partition).
    pub async fn connect_subset(&mut self, edges: &[(NodeId, NodeId)]) -> Result<(), Error> {
        self.topology
            .connect_subset(&self.fleet, &mut self.backend, edges)
            .await
    }

    /// Wait for `nodes` to agree on their chain tip.
    pub async fn sync_blocks(&self, nodes: &[&Node<B::Handle>]) -> Result<usize, Error> {
        self.barrier.wait(Kind::ChainTips, nodes).await
    }

    /// Wait for `nodes` to agree on their mempool contents.
    pub async fn sync_mempools(&self, nodes: &[&Node<B::Handle>]) -> Result<usize, Error> {
        self.barrier.wait(Kind::Mempools, nodes).await
    }

    /// Wait for `nodes` to agree on both.
    pub async fn sync_all(&self, nodes: &[&Node<B::Handle>]) -> Result<usize, Error> {
        self.barrier.wait(Kind::All, nodes).await
    }

    /// Wait for the whole fleet to agree on both.
    pub async fn sync_fleet(&self) -> Result<usize, Error> {
        let nodes: Vec<_> = self.fleet.iter().collect();
        self.barrier.wait(Kind::All, &nodes).await
    }

    /// Replace the settle interval and round bound of later syncs.
    pub fn set_barrier(&mut self, cfg: barrier::Config) {
        self.barrier.set_config(cfg);
    }

    /// Stop every node and forget all links.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        self.topology.clear();
        let result = self.fleet.teardown(&mut self.backend).await;
        self.nodes.set(0);
        result
    }

    /// Run `scenario` under the scenario timeout, then tear down whatever it provisioned.
    ///
    /// A scenario failure takes precedence over a teardown failure.
    pub async fn execute<S: Scenario>(&mut self, scenario: &S) -> Result<(), Error> {
        let name = scenario.name().to_string();
        let timeout = self.scenario_timeout;
        let context = self.context.clone();
        info!(scenario = %name, ?timeout, "running scenario");
        let result = select! {
            result = scenario.run(self) => {
                result
            },
            _ = context.sleep(timeout) => {
                Err(Error::ScenarioTimeout {
                    scenario: name.clone(),
                    timeout,
                })
            },
        };
        match &result {
            Ok(()) => info!(scenario = %name, "scenario passed"),
            Err(err) => error!(scenario = %name, ?err, "scenario failed"),
        }

        let teardown = self.teardown().await;
        if let Err(err) = &teardown {
            warn!(scenario = %name, ?err, "teardown failed");
        }
        result.and(teardown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{Config as LedgerConfig, Ledger},
        node::{Amount, Rpc},
        oracle::Oracle,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use futures::future::pending;

    fn config() -> Config {
        let mut registry = Registry::new();
        registry.register("old", ["-minrelaytxfee=1"]).unwrap();
        registry.register("new", ["-minrelaytxfee=0.001"]).unwrap();
        Config {
            registry,
            barrier: barrier::Config {
                interval: Duration::from_millis(50),
                max_rounds: 20,
            },
            scenario_timeout: Duration::from_secs(30),
        }
    }

    /// Sends one transaction through a full mesh and expects `pending` transactions at
    /// every node of the newer version.
    struct Propagate {
        pending: usize,
    }

    impl Scenario for Propagate {
        fn name(&self) -> &str {
            "propagate"
        }

        async fn run<E: Clock + Metrics, B: Backend>(
            &self,
            harness: &mut Harness<E, B>,
        ) -> Result<(), Error> {
            harness.provision_all().await?;
            harness.connect_all().await?;
            let miner = harness.node("new", Role::Miner)?;
            let wallet = harness.node("new", Role::Wallet)?;
            let address = miner.handle().new_address().await?;
            let tx = wallet
                .handle()
                .send_to_address(&address, Amount::from_coins(5))
                .await?;

            let new = harness.lookup(Some("new"), None)?;
            harness.sync_mempools(&new).await?;
            let oracle = Oracle::new(self.name());
            oracle.visible_at(&new, &tx, true).await?;
            oracle.mempool_size(&new, self.pending).await
        }
    }

    /// Never finishes.
    struct Stall;

    impl Scenario for Stall {
        fn name(&self) -> &str {
            "stall"
        }

        async fn run<E: Clock + Metrics, B: Backend>(
            &self,
            harness: &mut Harness<E, B>,
        ) -> Result<(), Error> {
            harness.provision_all().await?;
            harness.connect_all().await?;
            pending::<()>().await;
            Ok(())
        }
    }

    /// Waits on a fleet whose wallet is cut off, with a bound far past the timeout.
    struct Partitioned;

    impl Scenario for Partitioned {
        fn name(&self) -> &str {
            "partitioned"
        }

        async fn run<E: Clock + Metrics, B: Backend>(
            &self,
            harness: &mut Harness<E, B>,
        ) -> Result<(), Error> {
            harness.set_barrier(barrier::Config {
                interval: Duration::from_millis(50),
                max_rounds: 100_000,
            });
            harness.provision_versions(&["new"]).await?;
            harness.connect_subset(&[(0, 1)]).await?;
            harness.node("new", Role::Miner)?.handle().generate(3).await?;
            harness.sync_fleet().await?;
            Ok(())
        }
    }

    fn barrier_rounds(metrics: &str) -> Option<u64> {
        metrics
            .lines()
            .find_map(|line| line.strip_prefix("harness_barrier_rounds_total "))
            .and_then(|value| value.parse().ok())
    }

    #[test_traced]
    fn test_provision_all_order() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            let ids = harness.provision_all().await.unwrap();
            assert_eq!(ids, [0, 1, 2, 3, 4, 5]);
            let order: Vec<_> = harness
                .fleet()
                .iter()
                .map(|node| (node.label().to_string(), node.role()))
                .collect();
            assert_eq!(
                order,
                [
                    ("old".to_string(), Role::Miner),
                    ("old".to_string(), Role::Relay),
                    ("old".to_string(), Role::Wallet),
                    ("new".to_string(), Role::Miner),
                    ("new".to_string(), Role::Relay),
                    ("new".to_string(), Role::Wallet),
                ]
            );
            assert!(context.encode().contains("harness_nodes 6"));

            // Provisioning twice is a construction error
            assert!(matches!(
                harness.provision_all().await,
                Err(Error::DuplicateNode(_, Role::Miner))
            ));
            assert!(matches!(
                harness.node("future", Role::Miner),
                Err(Error::UnknownVersion(_))
            ));

            harness.teardown().await.unwrap();
            assert_eq!(harness.backend().running(), 0);
            assert!(context.encode().contains("harness_nodes 0"));
        });
    }

    #[test_traced]
    fn test_execute_tears_down_on_success() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            harness.execute(&Propagate { pending: 1 }).await.unwrap();
            assert!(harness.fleet().is_empty());
            assert!(harness.topology().is_empty());
            assert_eq!(harness.backend().running(), 0);

            // The harness is reusable
            harness.execute(&Propagate { pending: 1 }).await.unwrap();
        });
    }

    #[test_traced]
    fn test_execute_tears_down_on_assertion_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            let result = harness.execute(&Propagate { pending: 2 }).await;
            assert!(matches!(
                result,
                Err(Error::ScenarioAssertion { scenario, expected, actual, .. })
                    if scenario == "propagate" && expected == "2" && actual == "1"
            ));
            assert_eq!(harness.backend().running(), 0);
        });
    }

    #[test_traced]
    fn test_execute_tears_down_on_timeout() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            let start = context.current();
            let result = harness.execute(&Stall).await;
            assert!(matches!(
                result,
                Err(Error::ScenarioTimeout { scenario, timeout })
                    if scenario == "stall" && timeout == Duration::from_secs(30)
            ));
            let elapsed = context.current().duration_since(start).unwrap();
            assert!(elapsed >= Duration::from_secs(30));
            assert!(elapsed < Duration::from_secs(31));
            assert_eq!(harness.backend().running(), 0);
        });
    }

    #[test_traced]
    fn test_execute_cancels_waiting_barrier() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            let start = context.current();
            let result = harness.execute(&Partitioned).await;
            assert!(matches!(
                result,
                Err(Error::ScenarioTimeout { scenario, timeout })
                    if scenario == "partitioned" && timeout == Duration::from_secs(30)
            ));
            let elapsed = context.current().duration_since(start).unwrap();
            assert!(elapsed >= Duration::from_secs(30));
            assert!(elapsed < Duration::from_secs(31));
            assert_eq!(harness.backend().running(), 0);
            assert!(harness.fleet().is_empty());

            // The barrier was polling when the scenario expired and never polls again
            let metrics = context.encode();
            assert!(metrics.contains("harness_barrier_timeouts_total 0"));
            let rounds = barrier_rounds(&metrics).unwrap();
            assert!(rounds > 0);
            context.sleep(Duration::from_secs(10)).await;
            assert_eq!(barrier_rounds(&context.encode()), Some(rounds));
        });
    }

    #[test_traced]
    fn test_peers() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            harness.provision_versions(&["new"]).await.unwrap();
            harness.connect_subset(&[(0, 1), (1, 2)]).await.unwrap();
            assert_eq!(harness.peers(0).unwrap(), BTreeSet::from([1]));
            assert_eq!(harness.peers(1).unwrap(), BTreeSet::from([0, 2]));
            assert!(matches!(harness.peers(7), Err(Error::NodeNotFound(_))));
        });
    }

    #[test_traced]
    fn test_partition_times_out() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let ledger = Ledger::new(context.with_label("ledger"), LedgerConfig::default());
            let mut harness = Harness::new(context.with_label("harness"), ledger, config());
            harness.provision_versions(&["new"]).await.unwrap();

            // Miner and relay are linked, the wallet is cut off
            harness.connect_subset(&[(0, 1)]).await.unwrap();
            let miner = harness.node("new", Role::Miner).unwrap();
            miner.handle().generate(3).await.unwrap();

            let nodes = harness.lookup(None, None).unwrap();
            assert!(harness.sync_blocks(&nodes[..2]).await.is_ok());
            let result = harness.sync_blocks(&nodes).await;
            assert!(matches!(
                result,
                Err(Error::ConvergenceTimeout { rounds: 20, .. })
            ));

            // A per-scenario bound applies to later syncs
            harness.set_barrier(barrier::Config {
                interval: Duration::from_millis(10),
                max_rounds: 2,
            });
            let nodes = harness.lookup(None, None).unwrap();
            let result = harness.sync_blocks(&nodes).await;
            assert!(matches!(
                result,
                Err(Error::ConvergenceTimeout { rounds: 2, .. })
            ));
        });
    }
}
