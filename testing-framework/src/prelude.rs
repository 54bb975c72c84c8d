// File: testing-framework/src/prelude.rs
//
// Prelude
//
// `use pcn_testing_framework::prelude::*;` brings in everything a case or an
// integration test usually needs.

pub use std::sync::Arc;
pub use tokio::time::Duration;

pub use crate::chain::{
    Call, ChainClient, ChainError, ContractKind, DevChain, OnChainChannel, Receipt,
    RpcChainClient, RpcChainConfig, TxKind,
};
pub use crate::config::{
    ChannelConfig, ContractRef, EnvConfig, NodeConfig, ProvisionSettings, ScenarioTiming,
    TokenConfig,
};
pub use crate::invariants::{ChannelExpectation, LockPattern, Outcome};
pub use crate::keystore::{Account, KeyStore, Passphrase};
pub use crate::node::{
    ChannelView, CrashCheckpoint, HttpNodeApi, NodeApi, NodeController, NodeError,
    ProcessNodeController, ProcessSettings,
};
pub use crate::orchestrator::{Clock, PausedClock, SystemClock, TaskGroup};
pub use crate::probe::{ChannelSnapshot, ChannelStateProbe, LockSource};
pub use crate::provisioning::{
    AllowanceCache, NodeDescriptor, NonceAllocator, ProvisionError, Provisioner, TestTopology,
};
pub use crate::scenarios::{
    crash_case_send_06, FailureCause, ScenarioResult, ScenarioRunner, ScenarioSpec,
    ScenarioState, Verdict,
};
pub use crate::types::{Address, Amount, TxHash};
pub use crate::utilities::{print_result_summary, ScenarioArtifact};
