//! Scenario outcome types
//!
//! A run never returns a Rust error: every failure, expected or not, ends in a
//! [`ScenarioResult`] whose [`FailureCause`] names what went wrong.

use crate::probe::ChannelSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Observed state matched a legal outcome
    Pass,
    /// Anything else
    Fail,
}

/// States of the crash/restart state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    /// Nothing started yet
    Idle,
    /// Plain nodes, then the armed node, are being started
    NodesStarting,
    /// Transfer request sent to the source node
    TransferTriggered,
    /// Polling the armed node inside the grace window
    AwaitingCrash,
    /// The armed node is down
    CrashVerified,
    /// Channels snapshotted with the node down
    StateCapturedPreRestart,
    /// Restarting the crashed node without a crash condition
    Restarting,
    /// Hard wait for the node to resume the interrupted exchange
    AwaitingRecovery,
    /// Channels snapshotted after recovery
    StateCapturedPostRestart,
    /// Terminal
    Evaluated(Verdict),
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioState::Idle => f.write_str("Idle"),
            ScenarioState::NodesStarting => f.write_str("NodesStarting"),
            ScenarioState::TransferTriggered => f.write_str("TransferTriggered"),
            ScenarioState::AwaitingCrash => f.write_str("AwaitingCrash"),
            ScenarioState::CrashVerified => f.write_str("CrashVerified"),
            ScenarioState::StateCapturedPreRestart => f.write_str("StateCapturedPreRestart"),
            ScenarioState::Restarting => f.write_str("Restarting"),
            ScenarioState::AwaitingRecovery => f.write_str("AwaitingRecovery"),
            ScenarioState::StateCapturedPostRestart => f.write_str("StateCapturedPostRestart"),
            ScenarioState::Evaluated(Verdict::Pass) => f.write_str("Evaluated(Pass)"),
            ScenarioState::Evaluated(Verdict::Fail) => f.write_str("Evaluated(Fail)"),
        }
    }
}

/// One visited state and when it was entered, relative to the run start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVisit {
    /// State entered
    pub state: ScenarioState,
    /// Milliseconds since the run started
    pub at_ms: u64,
}

/// Why a scenario failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The armed node was still up at the end of the grace window
    NodeDidNotCrash {
        /// Armed node
        node: String,
        /// Grace window in milliseconds
        grace_ms: u64,
    },
    /// Post-recovery state outside the legal outcomes
    InvariantViolated {
        /// Observed channel states
        observed: String,
        /// Legal outcomes
        expected: String,
    },
    /// A further restart changed the recovered state
    UnstableAfterRestart {
        /// State after the first recovery
        before: String,
        /// State after the second recovery
        after: String,
    },
    /// Unexpected error at a transition
    StepFailed {
        /// State being entered or executed
        state: ScenarioState,
        /// Error text
        cause: String,
    },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::NodeDidNotCrash { node, grace_ms } => write!(
                f,
                "node {} did not crash as expected within {} ms",
                node, grace_ms
            ),
            FailureCause::InvariantViolated { observed, expected } => write!(
                f,
                "invariant violated: observed [{}], expected one of [{}]",
                observed, expected
            ),
            FailureCause::UnstableAfterRestart { before, after } => write!(
                f,
                "state changed after another restart: before [{}], after [{}]",
                before, after
            ),
            FailureCause::StepFailed { state, cause } => {
                write!(f, "step {} failed: {}", state, cause)
            }
        }
    }
}

/// Complete record of one scenario run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Case name
    pub case_name: String,
    /// Final verdict
    pub verdict: Verdict,
    /// Failure cause when the verdict is `Fail`
    pub cause: Option<FailureCause>,
    /// Name of the matched outcome when the verdict is `Pass`
    pub matched_outcome: Option<String>,
    /// Snapshots taken with the crashed node down
    pub before_restart: Vec<ChannelSnapshot>,
    /// Snapshots taken after recovery
    pub after_restart: Vec<ChannelSnapshot>,
    /// Snapshots taken after the idempotent restart, when enabled
    pub after_second_restart: Option<Vec<ChannelSnapshot>>,
    /// Visited states in order
    pub states: Vec<StateVisit>,
    /// Wall clock start
    pub started_at: DateTime<Utc>,
    /// Run duration on the scenario clock
    pub duration_ms: u64,
}

impl ScenarioResult {
    /// Whether the run passed
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Last visited state
    pub fn final_state(&self) -> Option<ScenarioState> {
        self.states.last().map(|v| v.state)
    }

    /// Whether `state` was visited
    pub fn visited(&self, state: ScenarioState) -> bool {
        self.states.iter().any(|v| v.state == state)
    }

    /// `SUCCESS` or `FAILED`
    pub fn status_word(&self) -> &'static str {
        if self.passed() {
            "SUCCESS"
        } else {
            "FAILED"
        }
    }
}

/// Snapshots joined for reports
pub fn describe_snapshots(snapshots: &[ChannelSnapshot]) -> String {
    snapshots
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ScenarioState::Evaluated(Verdict::Fail)).unwrap();
        assert_eq!(json, r#"{"evaluated":"fail"}"#);
        let json = serde_json::to_string(&ScenarioState::AwaitingCrash).unwrap();
        assert_eq!(json, r#""awaiting_crash""#);
    }

    #[test]
    fn test_cause_display() {
        let cause = FailureCause::NodeDidNotCrash {
            node: "N3".into(),
            grace_ms: 3000,
        };
        assert_eq!(
            cause.to_string(),
            "node N3 did not crash as expected within 3000 ms"
        );
        let json = serde_json::to_value(&cause).unwrap();
        assert_eq!(json["kind"], "node_did_not_crash");
    }
}
