//! Provision and index the nodes of a scenario.

use crate::{
    node::Lifecycle,
    registry::{ParameterSet, Registry},
    Error,
};
use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    str::FromStr,
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Position of a node in its [Fleet] (assigned sequentially at provisioning).
pub type NodeId = usize;

/// The function a node serves in a scenario.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    /// Produces blocks.
    Miner = 0,
    /// Only relays transactions and blocks.
    Relay = 1,
    /// Originates (and receives) transactions.
    Wallet = 2,
}

impl Role {
    /// Every role, in enumeration order.
    pub const ALL: [Role; 3] = [Role::Miner, Role::Relay, Role::Wallet];
}

impl TryFrom<u8> for Role {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Miner),
            1 => Ok(Role::Relay),
            2 => Ok(Role::Wallet),
            _ => Err(Error::InvalidRole(value.to_string())),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "miner" => Ok(Role::Miner),
            "relay" => Ok(Role::Relay),
            "wallet" => Ok(Role::Wallet),
            _ => Err(Error::InvalidRole(s.to_string())),
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Miner => "miner",
            Role::Relay => "relay",
            Role::Wallet => "wallet",
        };
        f.write_str(name)
    }
}

/// A provisioned node.
///
/// Links are owned by the [crate::topology::Topology] (see [crate::Harness::peers]).
pub struct Node<H> {
    id: NodeId,
    role: Role,
    parameters: Arc<ParameterSet>,
    handle: H,
}

impl<H> Node<H> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &str {
        self.parameters.label()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The [ParameterSet] the node was started with.
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

/// Nodes in provisioning order, indexed by (version label, role).
pub struct Fleet<H> {
    nodes: Vec<Node<H>>,
    index: HashMap<(String, Role), NodeId>,
}

impl<H> Default for Fleet<H> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<H> Fleet<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a node for (`label`, `role`) and append it to the fleet.
    ///
    /// Uniqueness is enforced per (version, role) pair: two versions may each have their
    /// own miner, but one version may not have two.
    pub async fn provision<L>(
        &mut self,
        registry: &Registry,
        lifecycle: &mut L,
        label: &str,
        role: Role,
    ) -> Result<NodeId, Error>
    where
        L: Lifecycle<Handle = H>,
    {
        let parameters = registry.resolve(label)?;
        let key = (label.to_string(), role);
        if self.index.contains_key(&key) {
            return Err(Error::DuplicateNode(label.to_string(), role));
        }

        // Only start the process once the request is known to be valid
        let handle = lifecycle.start_node(parameters.flags()).await?;
        let id = self.nodes.len();
        info!(id, label, %role, "provisioned node");
        self.nodes.push(Node {
            id,
            role,
            parameters,
            handle,
        });
        self.index.insert(key, id);
        Ok(id)
    }

    /// Select nodes by version label and/or role.
    ///
    /// - Neither: the whole fleet, in provisioning order.
    /// - Label only: one node per role, in role order.
    /// - Role only: one node per registered version, in registration order.
    /// - Both: the single matching node.
    pub fn lookup(
        &self,
        registry: &Registry,
        label: Option<&str>,
        role: Option<Role>,
    ) -> Result<Vec<&Node<H>>, Error> {
        match (label, role) {
            (None, None) => Ok(self.nodes.iter().collect()),
            (Some(label), None) => {
                registry.resolve(label)?;
                Role::ALL
                    .iter()
                    .map(|role| self.find(label, *role))
                    .collect()
            }
            (None, Some(role)) => registry
                .labels()
                .map(|label| self.find(label, role))
                .collect(),
            (Some(label), Some(role)) => {
                registry.resolve(label)?;
                Ok(vec![self.find(label, role)?])
            }
        }
    }

    /// Return the node provisioned for (`label`, `role`).
    pub fn find(&self, label: &str, role: Role) -> Result<&Node<H>, Error> {
        self.index
            .get(&(label.to_string(), role))
            .map(|id| &self.nodes[*id])
            .ok_or_else(|| Error::NodeNotFound(format!("{label}/{role}")))
    }

    /// Return the node with the given id.
    pub fn get(&self, id: NodeId) -> Result<&Node<H>, Error> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(format!("#{id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node<H>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stop every node (most recently provisioned first), leaving the fleet empty.
    ///
    /// Every node is stopped even if stopping an earlier one fails. The first failure
    /// is returned.
    pub async fn teardown<L>(&mut self, lifecycle: &mut L) -> Result<(), Error>
    where
        L: Lifecycle<Handle = H>,
    {
        let mut result = Ok(());
        self.index.clear();
        while let Some(node) = self.nodes.pop() {
            let Node { id, role, handle, .. } = node;
            match lifecycle.stop_node(handle).await {
                Ok(()) => debug!(id, %role, "stopped node"),
                Err(err) => {
                    warn!(id, %role, ?err, "failed to stop node");
                    if result.is_ok() {
                        result = Err(err.into());
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{Config, Ledger},
        node::Rpc,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics, Runner};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("old", ["-minrelaytxfee=1", "-blockmintxfee=0.00001"])
            .unwrap();
        registry.register("new", ["-minrelaytxfee=0.001"]).unwrap();
        registry
    }

    #[test]
    fn test_role_conversions() {
        assert_eq!(Role::try_from(0u8).unwrap(), Role::Miner);
        assert_eq!(Role::try_from(2u8).unwrap(), Role::Wallet);
        assert!(matches!(Role::try_from(3u8), Err(Error::InvalidRole(_))));
        assert_eq!("relay".parse::<Role>().unwrap(), Role::Relay);
        assert!(matches!("validator".parse::<Role>(), Err(Error::InvalidRole(_))));
        for role in Role::ALL {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
    }

    #[test_traced]
    fn test_provision_and_lookup() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry();
            let mut ledger = Ledger::new(context.with_label("ledger"), Config::default());
            let mut fleet = Fleet::new();
            for label in ["old", "new"] {
                for role in Role::ALL {
                    fleet
                        .provision(&registry, &mut ledger, label, role)
                        .await
                        .unwrap();
                }
            }
            assert_eq!(fleet.len(), 6);

            // Everything, in provisioning order
            let all = fleet.lookup(&registry, None, None).unwrap();
            assert_eq!(all.iter().map(|n| n.id()).collect::<Vec<_>>(), [0, 1, 2, 3, 4, 5]);

            // By version, in role order
            let new = fleet.lookup(&registry, Some("new"), None).unwrap();
            assert_eq!(
                new.iter().map(|n| n.role()).collect::<Vec<_>>(),
                Role::ALL.to_vec()
            );
            assert!(new.iter().all(|n| n.label() == "new"));

            // By role, in registration order
            let wallets = fleet.lookup(&registry, None, Some(Role::Wallet)).unwrap();
            assert_eq!(
                wallets.iter().map(|n| n.label()).collect::<Vec<_>>(),
                ["old", "new"]
            );

            // Exact
            let miner = fleet
                .lookup(&registry, Some("old"), Some(Role::Miner))
                .unwrap();
            assert_eq!(miner.len(), 1);
            assert_eq!(miner[0].id(), 0);
        });
    }

    #[test_traced]
    fn test_lookup_reports_started_flags() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry();
            let mut ledger = Ledger::new(context.with_label("ledger"), Config::default());
            let mut fleet = Fleet::new();
            for label in ["old", "new"] {
                for role in Role::ALL {
                    fleet
                        .provision(&registry, &mut ledger, label, role)
                        .await
                        .unwrap();
                }
            }
            for label in ["old", "new"] {
                let expected = registry.resolve(label).unwrap();
                for role in Role::ALL {
                    let node = fleet.lookup(&registry, Some(label), Some(role)).unwrap()[0];
                    assert_eq!(node.parameters(), expected.as_ref());
                    assert_eq!(
                        ledger.flags(node.handle()).unwrap(),
                        expected.flags().to_vec()
                    );
                }
            }

            // The node applies what it was started with
            let old = fleet.find("old", Role::Relay).unwrap();
            let info = old.handle().network_info().await.unwrap();
            assert_eq!(info.relay_fee.per_kb_amount(), "1".parse().unwrap());
        });
    }

    #[test_traced]
    fn test_provision_errors() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry();
            let mut ledger = Ledger::new(context.with_label("ledger"), Config::default());
            let mut fleet = Fleet::new();
            fleet
                .provision(&registry, &mut ledger, "old", Role::Miner)
                .await
                .unwrap();

            // Same version and role
            assert!(matches!(
                fleet.provision(&registry, &mut ledger, "old", Role::Miner).await,
                Err(Error::DuplicateNode(label, Role::Miner)) if label == "old"
            ));

            // Another version may have its own miner
            fleet
                .provision(&registry, &mut ledger, "new", Role::Miner)
                .await
                .unwrap();

            // Unregistered version
            assert!(matches!(
                fleet.provision(&registry, &mut ledger, "future", Role::Miner).await,
                Err(Error::UnknownVersion(_))
            ));

            // Rejected requests never start a process
            assert_eq!(ledger.running(), 2);
            assert_eq!(fleet.len(), 2);
        });
    }

    #[test_traced]
    fn test_lookup_errors() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry();
            let mut ledger = Ledger::new(context.with_label("ledger"), Config::default());
            let mut fleet = Fleet::new();
            fleet
                .provision(&registry, &mut ledger, "old", Role::Miner)
                .await
                .unwrap();

            assert!(matches!(
                fleet.lookup(&registry, Some("future"), None),
                Err(Error::UnknownVersion(_))
            ));
            assert!(matches!(
                fleet.lookup(&registry, Some("old"), Some(Role::Wallet)),
                Err(Error::NodeNotFound(_))
            ));
            assert!(matches!(
                fleet.lookup(&registry, Some("old"), None),
                Err(Error::NodeNotFound(_))
            ));
            assert!(matches!(
                fleet.lookup(&registry, None, Some(Role::Miner)),
                Err(Error::NodeNotFound(key)) if key == "new/miner"
            ));
            assert!(matches!(fleet.get(7), Err(Error::NodeNotFound(_))));
        });
    }

    #[test_traced]
    fn test_teardown_stops_everything() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry();
            let mut ledger = Ledger::new(context.with_label("ledger"), Config::default());
            let mut fleet = Fleet::new();
            for role in Role::ALL {
                fleet
                    .provision(&registry, &mut ledger, "new", role)
                    .await
                    .unwrap();
            }
            assert_eq!(ledger.running(), 3);

            fleet.teardown(&mut ledger).await.unwrap();
            assert!(fleet.is_empty());
            assert_eq!(ledger.running(), 0);

            // The fleet can be reused
            fleet
                .provision(&registry, &mut ledger, "new", Role::Miner)
                .await
                .unwrap();
            assert_eq!(fleet.get(0).unwrap().role(), Role::Miner);
        });
    }
}
