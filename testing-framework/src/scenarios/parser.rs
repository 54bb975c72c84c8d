// File: testing-framework/src/scenarios/parser.rs
//
// Crash scenario definitions
//
// A scenario names the nodes to start, the single node started with a crash
// checkpoint, the transfer that drives the protocol into that checkpoint, the
// channels to probe and the legal outcomes after recovery.

use crate::config::ScenarioTiming;
use crate::invariants::{LockPattern, Outcome};
use crate::node::CrashCheckpoint;
use crate::provisioning::TestTopology;
use crate::types::{amount_serde, Amount};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Scenario definition errors
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Scenario file could not be read
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Scenario YAML is malformed
    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Scenario references a node the topology lacks
    #[error("Scenario {scenario} references unknown node {node}")]
    UnknownNode {
        /// Scenario name
        scenario: String,
        /// Node name
        node: String,
    },

    /// Scenario references a token the topology lacks
    #[error("Scenario {scenario} references unknown token {token}")]
    UnknownToken {
        /// Scenario name
        scenario: String,
        /// Token name
        token: String,
    },

    /// Scenario is inconsistent
    #[error("Invalid scenario {scenario}: {reason}")]
    Invalid {
        /// Scenario name
        scenario: String,
        /// Reason
        reason: String,
    },
}

/// Node started with a crash checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashSpec {
    /// Node name
    pub node: String,
    /// Checkpoint at which the node quits
    pub checkpoint: CrashCheckpoint,
}

/// Transfer that drives the protocol into the checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    /// Sending node
    pub source: String,
    /// Receiving node
    pub target: String,
    /// Token name
    pub token: String,
    /// Amount, also the default lock amount of every outcome
    #[serde(with = "amount_serde")]
    pub amount: Amount,
}

/// Channel pair to probe, written `[N2, N3]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPair(pub String, pub String);

impl ChannelPair {
    /// Pair of `a` and `b`
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self(a.into(), b.into())
    }

    /// Whether this is the pair `x`,`y` in either order
    pub fn joins(&self, x: &str, y: &str) -> bool {
        (self.0 == x && self.1 == y) || (self.0 == y && self.1 == x)
    }
}

/// One crash scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Case name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Nodes started without a crash condition, in order
    #[serde(default)]
    pub start: Vec<String>,
    /// Node started with a crash condition after the others
    pub crash: CrashSpec,
    /// Triggering transfer
    pub transfer: TransferSpec,
    /// Channels snapshotted before and after the restart
    pub probe: Vec<ChannelPair>,
    /// Legal states after recovery
    pub outcomes: Vec<Outcome>,
    /// Grace, recovery and poll intervals
    #[serde(default)]
    pub timing: ScenarioTiming,
    /// Restart once more and require an unchanged state
    #[serde(default)]
    pub verify_idempotent_restart: bool,
}

impl ScenarioSpec {
    /// Parse a scenario from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, ScenarioError> {
        let spec: ScenarioSpec = serde_yaml::from_str(yaml)?;
        spec.validate_shape()?;
        Ok(spec)
    }

    /// Read and parse a scenario file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Every node involved, start order first, crash node last
    pub fn involved_nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.start.iter().map(String::as_str).collect();
        nodes.push(&self.crash.node);
        nodes
    }

    fn invalid(&self, reason: impl Into<String>) -> ScenarioError {
        ScenarioError::Invalid {
            scenario: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Checks that need no topology
    pub fn validate_shape(&self) -> Result<(), ScenarioError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("empty name"));
        }
        if self.start.contains(&self.crash.node) {
            return Err(self.invalid(format!(
                "{} is both started plain and with a crash condition",
                self.crash.node
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.start.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(self.invalid(format!("{} is started twice", dup)));
        }
        if self.crash.checkpoint.as_str().is_empty() {
            return Err(self.invalid("empty crash checkpoint"));
        }
        if self.transfer.amount == 0 {
            return Err(self.invalid("transfer amount must be positive"));
        }
        if self.probe.is_empty() {
            return Err(self.invalid("no channel to probe"));
        }
        if self.outcomes.is_empty() {
            return Err(self.invalid("no legal outcome"));
        }
        if self.timing.liveness_poll_ms == 0 {
            return Err(self.invalid("liveness poll interval must be positive"));
        }

        for (index, outcome) in self.outcomes.iter().enumerate() {
            let name = outcome.display_name(index);
            for pair in &self.probe {
                if !outcome.channels.iter().any(|c| pair.joins(&c.a, &c.b)) {
                    return Err(self.invalid(format!(
                        "{} leaves channel({},{}) unspecified",
                        name, pair.0, pair.1
                    )));
                }
            }
            for expectation in &outcome.channels {
                if !self.probe.iter().any(|p| p.joins(&expectation.a, &expectation.b)) {
                    return Err(self.invalid(format!(
                        "{} expects channel({},{}) which is not probed",
                        name, expectation.a, expectation.b
                    )));
                }
                if let LockPattern::LockSide { node } = &expectation.expect {
                    if *node != expectation.a && *node != expectation.b {
                        return Err(self.invalid(format!(
                            "{}: {} is not a participant of channel({},{})",
                            name, node, expectation.a, expectation.b
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check every name against the provisioned topology
    pub fn validate_against(&self, topology: &TestTopology) -> Result<(), ScenarioError> {
        self.validate_shape()?;

        let unknown = |node: &str| ScenarioError::UnknownNode {
            scenario: self.name.clone(),
            node: node.to_string(),
        };
        let names = self
            .involved_nodes()
            .into_iter()
            .chain([self.transfer.source.as_str(), self.transfer.target.as_str()])
            .chain(self.probe.iter().flat_map(|p| [p.0.as_str(), p.1.as_str()]));
        for name in names {
            if topology.node(name).is_none() {
                return Err(unknown(name));
            }
        }
        if topology.token(&self.transfer.token).is_none() {
            return Err(ScenarioError::UnknownToken {
                scenario: self.name.clone(),
                token: self.transfer.token.clone(),
            });
        }
        Ok(())
    }
}
