//! # PCN Testing Framework
//!
//! Provisioning and crash-recovery testing for payment channel networks.
//!
//! ## Architecture Overview
//!
//! - **Provisioning**: deploys or reuses the settlement and token contracts,
//!   funds node accounts and deposits both sides of every channel, with
//!   per-account nonce leasing and a shared allowance cache so concurrent
//!   workers never collide.
//! - **Scenarios**: start nodes, arm one with a crash checkpoint, trigger a
//!   transfer, verify the crash, restart and check the recovered channel
//!   lock state against the legal outcomes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pcn_testing_framework::prelude::*;
//!
//! let env = EnvConfig::load("env.yaml")?;
//! let keys = Arc::new(KeyStore::open(&env.keystore_path, &passphrase)?);
//! let chain: Arc<dyn ChainClient> =
//!     Arc::new(RpcChainClient::new(RpcChainConfig::new(&env.eth_rpc_endpoint))?);
//! let provisioner = Provisioner::new(chain, keys, env.provisioning.clone());
//! let topology = provisioner.provision(&env, nodes.as_ref()).await?;
//! ```
//!
//! ## Design Principles
//!
//! 1. **No nonce collisions**: one leased sequence number per submission
//! 2. **Aggregated failures**: a parallel phase reports every failed worker
//! 3. **Deterministic waits**: every scenario wait goes through [`Clock`]

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Shared value types: addresses, hashes, amounts
pub mod types;

/// Encrypted account keystore
pub mod keystore;

/// Chain access: trait, JSON-RPC client and in-process dev chain
pub mod chain;

/// Environment configuration
pub mod config;

/// Core orchestration - provides Clock and the parallel task group
pub mod orchestrator;

/// Contract deployment, funding and channel deposits
pub mod provisioning;

/// Node process control and node API
pub mod node;

/// Channel state snapshots
pub mod probe;

/// Channel lock invariant checkers
pub mod invariants;

/// Crash scenario definitions and runner
pub mod scenarios;

/// Artifacts and summaries of scenario runs
pub mod utilities;

/// Convenient re-exports for common usage
pub mod prelude;

// Re-export commonly used types at crate root
pub use orchestrator::{Clock, PausedClock, SystemClock};
pub use provisioning::{Provisioner, TestTopology};
pub use scenarios::{ScenarioResult, ScenarioRunner, ScenarioSpec};

/// Framework version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Framework version descriptor
pub const FRAMEWORK_VERSION: &str = "PCN Testing Framework";
