//! Peer links between the nodes of a [Fleet].

use crate::{
    fleet::{Fleet, NodeId},
    node::Linker,
    Error,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Symmetric adjacency over fleet node ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    links: BTreeSet<(NodeId, NodeId)>,
}

fn edge(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `a` and `b`, returning whether a new link was established.
    ///
    /// Linking an already linked pair does nothing.
    pub async fn connect<H, L>(
        &mut self,
        fleet: &Fleet<H>,
        linker: &mut L,
        a: NodeId,
        b: NodeId,
    ) -> Result<bool, Error>
    where
        L: Linker<H>,
    {
        if a == b {
            return Err(Error::SelfLink(a));
        }
        let (first, second) = (fleet.get(a)?, fleet.get(b)?);
        if self.links.contains(&edge(a, b)) {
            debug!(a, b, "already linked");
            return Ok(false);
        }
        linker.link_peers(first.handle(), second.handle()).await?;
        self.links.insert(edge(a, b));
        debug!(a, b, "linked");
        Ok(true)
    }

    /// Link every pair of distinct nodes in the fleet (a full mesh).
    pub async fn connect_all<H, L>(&mut self, fleet: &Fleet<H>, linker: &mut L) -> Result<(), Error>
    where
        L: Linker<H>,
    {
        let mut created = 0;
        for a in 0..fleet.len() {
            for b in (a + 1)..fleet.len() {
                if self.connect(fleet, linker, a, b).await? {
                    created += 1;
                }
            }
        }
        info!(nodes = fleet.len(), created, "connected full mesh");
        Ok(())
    }

    /// Link exactly the given pairs.
    ///
    /// Every edge is validated before any link is made, so a bad edge leaves the
    /// topology untouched.
    pub async fn connect_subset<H, L>(
        &mut self,
        fleet: &Fleet<H>,
        linker: &mut L,
        edges: &[(NodeId, NodeId)],
    ) -> Result<(), Error>
    where
        L: Linker<H>,
    {
        for (a, b) in edges {
            if a == b {
                return Err(Error::SelfLink(*a));
            }
            fleet.get(*a)?;
            fleet.get(*b)?;
        }
        for (a, b) in edges {
            self.connect(fleet, linker, *a, *b).await?;
        }
        info!(edges = edges.len(), "connected subset");
        Ok(())
    }

    pub fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.contains(&edge(a, b))
    }

    /// Nodes directly linked to `id`.
    pub fn peers(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.links
            .iter()
            .filter_map(|(a, b)| match (*a == id, *b == id) {
                (true, _) => Some(*b),
                (_, true) => Some(*a),
                _ => None,
            })
            .collect()
    }

    /// Partition `nodes` into connected components (ordered by smallest member).
    pub fn components(&self, nodes: impl IntoIterator<Item = NodeId>) -> Vec<BTreeSet<NodeId>> {
        // Union-find over the requested nodes
        let mut parent: BTreeMap<NodeId, NodeId> = nodes.into_iter().map(|id| (id, id)).collect();
        fn root(parent: &mut BTreeMap<NodeId, NodeId>, id: NodeId) -> NodeId {
            let mut current = id;
            while parent[&current] != current {
                current = parent[&current];
            }
            parent.insert(id, current);
            current
        }
        for (a, b) in &self.links {
            if !parent.contains_key(a) || !parent.contains_key(b) {
                continue;
            }
            let (ra, rb) = (root(&mut parent, *a), root(&mut parent, *b));
            if ra != rb {
                parent.insert(ra.max(rb), ra.min(rb));
            }
        }
        let mut components: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let ids: Vec<NodeId> = parent.keys().copied().collect();
        for id in ids {
            let root = root(&mut parent, id);
            components.entry(root).or_default().insert(id);
        }
        components.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }
}
