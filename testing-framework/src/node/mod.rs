// File: testing-framework/src/node/mod.rs
//
// Node Boundary
//
// The payment-channel node is an external process. The harness only needs to
// start it (optionally armed with a crash checkpoint), observe whether it is
// still alive, restart it, ask it to send a transfer, and read its view of a
// channel. `NodeController` covers the process lifecycle and `NodeApi` the
// HTTP surface; both are traits so scenario logic runs unchanged against a
// simulated network in tests.

/// HTTP client for the node API
pub mod api;
/// OS-process node controller
pub mod process;

pub use api::HttpNodeApi;
pub use process::{ProcessNodeController, ProcessSettings};

use crate::provisioning::NodeDescriptor;
use crate::types::{amount_serde, Address, Amount};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from node process control or the node API
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node executable cannot be used
    #[error("Invalid node executable {path}: {reason}")]
    InvalidExecutable {
        /// Executable path
        path: PathBuf,
        /// What is wrong
        reason: String,
    },

    /// The node data directory cannot be used
    #[error("Invalid data directory {path}: {reason}")]
    InvalidDataDir {
        /// Directory path
        path: PathBuf,
        /// What is wrong
        reason: String,
    },

    /// Spawning the process failed
    #[error("Failed to start node {node}: {source}")]
    Spawn {
        /// Node name
        node: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The node is already running under this controller
    #[error("Node {0} is already running")]
    AlreadyRunning(String),

    /// The controller does not know this node
    #[error("Unknown node {0}")]
    UnknownNode(String),

    /// Process control I/O failed
    #[error("Process control failed for {node}: {source}")]
    Io {
        /// Node name
        node: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The node process exited before its API came up
    #[error("Node {0} exited during startup")]
    ExitedDuringStartup(String),

    /// The node API did not come up in time
    #[error("Node {node} not ready after {waited_ms} ms")]
    NotReady {
        /// Node name
        node: String,
        /// Startup timeout that elapsed
        waited_ms: u64,
    },

    /// The node API answered with an error or not at all
    #[error("Node {node} API error: {message}")]
    Api {
        /// Node name
        node: String,
        /// Error description
        message: String,
    },
}

/// Named internal checkpoint at which an armed node terminates itself
///
/// The name is opaque to the harness; it is only passed to the node process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrashCheckpoint(String);

impl CrashCheckpoint {
    /// Wrap a checkpoint name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Checkpoint name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{"QuitEvent":"<name>"}` as passed on the node command line
    pub fn condition_quit_json(&self) -> String {
        serde_json::json!({ "QuitEvent": self.0 }).to_string()
    }
}

impl fmt::Display for CrashCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node's view of one of its channels
///
/// `balance`/`locked_amount` are the viewing node's side, the `partner_*`
/// fields the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelView {
    /// Channel partner
    #[serde(rename = "partner_address")]
    pub partner: Address,
    /// Channel token
    #[serde(rename = "token_address")]
    pub token: Address,
    /// Own balance
    #[serde(with = "amount_serde", default)]
    pub balance: Amount,
    /// Partner balance
    #[serde(with = "amount_serde", default)]
    pub partner_balance: Amount,
    /// Own locked amount
    #[serde(with = "amount_serde", default)]
    pub locked_amount: Amount,
    /// Partner locked amount
    #[serde(with = "amount_serde", default)]
    pub partner_locked_amount: Amount,
    /// Channel state as reported by the node
    #[serde(default)]
    pub state: String,
}

impl ChannelView {
    /// The same channel seen from the partner's side
    pub fn swapped(self, viewer: Address) -> Self {
        Self {
            partner: viewer,
            token: self.token,
            balance: self.partner_balance,
            partner_balance: self.balance,
            locked_amount: self.partner_locked_amount,
            partner_locked_amount: self.locked_amount,
            state: self.state,
        }
    }
}

/// Lifecycle control of node processes
#[async_trait]
pub trait NodeController: Send + Sync {
    /// Start `node` normally
    async fn start(&self, node: &NodeDescriptor) -> Result<(), NodeError>;

    /// Start `node` armed to exit when it reaches `checkpoint`
    async fn start_with_crash_condition(
        &self,
        node: &NodeDescriptor,
        checkpoint: &CrashCheckpoint,
    ) -> Result<(), NodeError>;

    /// Whether the node process is alive right now
    async fn is_running(&self, node: &NodeDescriptor) -> Result<bool, NodeError>;

    /// Start `node` again without any crash condition, stopping it first if alive
    async fn restart(&self, node: &NodeDescriptor) -> Result<(), NodeError>;

    /// Stop `node` if it is running
    async fn stop(&self, node: &NodeDescriptor) -> Result<(), NodeError>;

    /// Kill every node process, including strays from earlier runs
    async fn kill_all(&self) -> Result<(), NodeError>;
}

/// Node API used by scenarios
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Ask `source` to send `amount` of `token` to `target`
    ///
    /// Fire-and-forget: returns once the request has been handed off, not when
    /// the transfer completes.
    async fn transfer(
        &self,
        source: &NodeDescriptor,
        target: &Address,
        token: &Address,
        amount: Amount,
    ) -> Result<(), NodeError>;

    /// Whether `node` answers API requests yet
    async fn is_ready(&self, node: &NodeDescriptor) -> bool;

    /// `node`'s view of its channel with `partner` on `token`
    async fn channel_view(
        &self,
        node: &NodeDescriptor,
        partner: &Address,
        token: &Address,
    ) -> Result<Option<ChannelView>, NodeError>;
}
