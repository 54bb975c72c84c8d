//! Channel lock invariants
//!
//! A scenario lists its legal post-recovery outcomes. Each outcome assigns a
//! lock pattern to every probed channel:
//! - `no_lock`: neither side holds a lock
//! - `lock_both`: both sides lock the transfer amount
//! - `lock_side { node }`: only `node` locks the transfer amount
//!
//! The observed snapshots pass when they match at least one outcome
//! completely. Snapshots without lock information never match.

use crate::probe::ChannelSnapshot;
use crate::types::{opt_amount_serde, Amount};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Expected lock state of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPattern {
    /// No lock on either side
    NoLock,
    /// Both sides lock the amount
    LockBoth,
    /// Only `node` locks the amount
    LockSide {
        /// Locking participant
        node: String,
    },
}

impl fmt::Display for LockPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPattern::NoLock => f.write_str("no lock"),
            LockPattern::LockBoth => f.write_str("locked on both sides"),
            LockPattern::LockSide { node } => write!(f, "locked on {}'s side only", node),
        }
    }
}

/// Pattern expected on the channel between `a` and `b`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelExpectation {
    /// One participant
    pub a: String,
    /// Other participant
    pub b: String,
    /// Expected pattern
    pub expect: LockPattern,
    /// Lock amount; defaults to the scenario transfer amount
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_amount_serde")]
    pub amount: Option<Amount>,
}

impl ChannelExpectation {
    /// `channel(a,b) <pattern>`
    pub fn describe(&self, default_amount: Amount) -> String {
        let amount = self.amount.unwrap_or(default_amount);
        match self.expect {
            LockPattern::NoLock => format!("channel({},{}) {}", self.a, self.b, self.expect),
            _ => format!(
                "channel({},{}) {} {}",
                self.a, self.b, self.expect, amount
            ),
        }
    }
}

/// One legal combination of channel states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Optional outcome name for reports
    #[serde(default)]
    pub name: Option<String>,
    /// Expected pattern per channel
    pub channels: Vec<ChannelExpectation>,
}

impl Outcome {
    /// Name or a positional fallback
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("outcome #{}", index + 1))
    }

    /// Human-readable expectation
    pub fn describe(&self, default_amount: Amount) -> String {
        self.channels
            .iter()
            .map(|c| c.describe(default_amount))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Check one snapshot against one expectation
///
/// Returns the reason for a mismatch.
pub fn check_channel(
    snapshot: &ChannelSnapshot,
    expectation: &ChannelExpectation,
    default_amount: Amount,
) -> Result<(), String> {
    if !snapshot.locks_observed() {
        return Err(format!(
            "{}: locks unobservable, both participants are down",
            snapshot.label()
        ));
    }
    let amount = expectation.amount.unwrap_or(default_amount);
    let (a, b) = (snapshot.locked_a, snapshot.locked_b);

    let ok = match &expectation.expect {
        LockPattern::NoLock => a == 0 && b == 0,
        LockPattern::LockBoth => a == amount && b == amount,
        LockPattern::LockSide { node } => match snapshot.locked_by(node) {
            Some(locked) => {
                let other = if *node == snapshot.a { b } else { a };
                locked == amount && other == 0
            }
            None => {
                return Err(format!(
                    "{}: {} is not a participant",
                    snapshot.label(),
                    node
                ))
            }
        },
    };

    if ok {
        Ok(())
    } else {
        Err(format!(
            "{}: expected {}, observed locked {}/{}",
            snapshot.label(),
            expectation.describe(default_amount),
            a,
            b
        ))
    }
}

/// Check every expectation of `outcome` against `snapshots`
pub fn check_outcome(
    snapshots: &[ChannelSnapshot],
    outcome: &Outcome,
    default_amount: Amount,
) -> Result<(), Vec<String>> {
    let mut mismatches = Vec::new();
    for expectation in &outcome.channels {
        match snapshots
            .iter()
            .find(|s| s.joins(&expectation.a, &expectation.b))
        {
            Some(snapshot) => {
                if let Err(reason) = check_channel(snapshot, expectation, default_amount) {
                    mismatches.push(reason);
                }
            }
            None => mismatches.push(format!(
                "channel({},{}) was not probed",
                expectation.a, expectation.b
            )),
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(mismatches)
    }
}

/// Index of the first outcome matched by `snapshots`
///
/// On failure, returns the mismatch reasons of every outcome.
pub fn evaluate_outcomes(
    snapshots: &[ChannelSnapshot],
    outcomes: &[Outcome],
    default_amount: Amount,
) -> Result<usize, Vec<(String, Vec<String>)>> {
    let mut rejected = Vec::with_capacity(outcomes.len());
    for (index, outcome) in outcomes.iter().enumerate() {
        match check_outcome(snapshots, outcome, default_amount) {
            Ok(()) => return Ok(index),
            Err(reasons) => rejected.push((outcome.display_name(index), reasons)),
        }
    }
    Err(rejected)
}
