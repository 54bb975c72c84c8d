//! Crash/restart scenarios
//!
//! A scenario is a YAML file describing one fault-injection case:
//!
//! ```yaml
//! name: CrashCaseSend06
//! start: [N2, N6, N7]
//! crash:
//!   node: N3
//!   checkpoint: EventSendRefundTransferAfter
//! transfer:
//!   source: N2
//!   target: N6
//!   token: T1
//!   amount: 45
//! probe:
//!   - [N2, N3]
//!   - [N6, N3]
//!   - [N2, N7]
//!   - [N3, N7]
//! outcomes:
//!   - channels:
//!       - {a: N2, b: N3, expect: lock_both}
//!       - {a: N6, b: N3, expect: no_lock}
//!       - {a: N2, b: N7, expect: {lock_side: {node: N2}}}
//!       - {a: N3, b: N7, expect: {lock_side: {node: N3}}}
//! timing:
//!   crash_grace_ms: 3000
//!   recovery_ms: 30000
//! ```

pub mod builtin;
pub mod parser;
pub mod result;
pub mod runner;

pub use builtin::crash_case_send_06;
pub use parser::{ChannelPair, CrashSpec, ScenarioError, ScenarioSpec, TransferSpec};
pub use result::{FailureCause, ScenarioResult, ScenarioState, StateVisit, Verdict};
pub use runner::ScenarioRunner;
