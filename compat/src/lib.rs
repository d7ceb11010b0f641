//! Validate fee and relay policy compatibility across versioned ledger nodes.
//!
//! A scenario provisions a fleet of nodes (one per version and [Role]), links them,
//! drives transactions and blocks through their RPC surface, waits for their chains
//! and mempools to settle, and then asserts which nodes saw, mined, or dropped each
//! transaction. Policy differences between versions, not network reachability, are
//! the variable under test.
//!
//! # Overview
//!
//! - [registry::Registry]: policy flags per version label.
//! - [fleet::Fleet]: nodes started from those flags, indexed by (version, role).
//! - [topology::Topology]: peer links between nodes (a full mesh by default).
//! - [barrier::Barrier]: bounded polling until nodes agree on tips and/or mempools.
//! - [oracle::Oracle]: compares declared expectations with observed state.
//! - [Harness]: owns all of the above and runs a [Scenario] with guaranteed teardown.
//!
//! Nodes are reached only through the collaborator traits in [node]. [mocks] provides
//! a simulated ledger network implementing them on top of `commonware-runtime`.
//!
//! # Status
//!
//! `commonware-compat` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use std::time::Duration;
use thiserror::Error;

pub mod barrier;
pub mod config;
mod context;
pub use context::{Backend, Config, Harness, Scenario};
pub mod fleet;
pub mod mocks;
pub mod node;
pub mod oracle;
pub mod registry;
pub mod scenarios;
pub mod topology;

pub use fleet::{NodeId, Role};

/// Errors that can occur when running a scenario.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown version: {0}")]
    UnknownVersion(String),
    #[error("invalid role: {0}")]
    InvalidRole(String),
    #[error("duplicate version: {0}")]
    DuplicateVersion(String),
    #[error("duplicate node: {0}/{1}")]
    DuplicateNode(String, Role),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("cannot link node {0} to itself")]
    SelfLink(NodeId),
    #[error("{kind} did not converge after {rounds} rounds: {snapshots}")]
    ConvergenceTimeout {
        kind: barrier::Kind,
        rounds: usize,
        snapshots: barrier::Snapshots,
    },
    #[error("scenario {scenario} failed: expected {predicate} = {expected}, got {actual}")]
    ScenarioAssertion {
        scenario: String,
        predicate: oracle::Predicate,
        expected: String,
        actual: String,
    },
    #[error("scenario {scenario} timed out after {timeout:?}")]
    ScenarioTimeout { scenario: String, timeout: Duration },
    #[error("node error: {0}")]
    Node(#[from] node::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
}
