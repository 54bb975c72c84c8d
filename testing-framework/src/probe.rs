// File: testing-framework/src/probe.rs
//
// Channel State Probe
//
// Reads one channel between two nodes on one token. Deposits always come from
// the settlement contract. Lock amounts live off-chain, so they are read from
// the first participant whose node is up and knows the channel; when that is
// the second participant its view is swapped so `a`/`b` keep their meaning.
// With both participants down the snapshot is chain-only and carries no lock
// information.

use crate::chain::{ChainClient, ChainError};
use crate::node::{NodeApi, NodeController, NodeError};
use crate::provisioning::NodeDescriptor;
use crate::types::{amount_serde, opt_amount_serde, Address, Amount};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Probe failures
#[derive(Debug, Error)]
pub enum ProbeError {
    /// On-chain read failed
    #[error("Chain read failed: {0}")]
    Chain(#[from] ChainError),

    /// Liveness query or node API call failed
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Where the lock amounts of a snapshot came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSource {
    /// View of this running participant
    Node(String),
    /// No participant could be asked; locks are unknown
    ChainOnly,
}

/// State of one channel at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// First participant name
    pub a: String,
    /// Second participant name
    pub b: String,
    /// Token
    pub token: Address,
    /// Whether the settlement contract knows the channel
    pub on_chain: bool,
    /// Deposit of `a`
    #[serde(with = "amount_serde")]
    pub deposit_a: Amount,
    /// Deposit of `b`
    #[serde(with = "amount_serde")]
    pub deposit_b: Amount,
    /// Amount locked by `a` (zero when chain-only)
    #[serde(with = "amount_serde")]
    pub locked_a: Amount,
    /// Amount locked by `b` (zero when chain-only)
    #[serde(with = "amount_serde")]
    pub locked_b: Amount,
    /// Off-chain balance of `a`, when a node answered
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_amount_serde")]
    pub balance_a: Option<Amount>,
    /// Off-chain balance of `b`, when a node answered
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_amount_serde")]
    pub balance_b: Option<Amount>,
    /// Origin of the lock amounts
    pub source: LockSource,
}

impl ChannelSnapshot {
    /// `channel(a,b)`
    pub fn label(&self) -> String {
        format!("channel({},{})", self.a, self.b)
    }

    /// Whether lock amounts are known
    pub fn locks_observed(&self) -> bool {
        !matches!(self.source, LockSource::ChainOnly)
    }

    /// Whether this snapshot is of the pair `x`,`y` in either order
    pub fn joins(&self, x: &str, y: &str) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }

    /// Amount locked by participant `name`
    pub fn locked_by(&self, name: &str) -> Option<Amount> {
        if name == self.a {
            Some(self.locked_a)
        } else if name == self.b {
            Some(self.locked_b)
        } else {
            None
        }
    }

    /// Deposits, locks and observability, for before/after comparisons
    pub fn lock_state(&self) -> (Amount, Amount, Amount, Amount, bool) {
        (
            self.deposit_a,
            self.deposit_b,
            self.locked_a,
            self.locked_b,
            self.locks_observed(),
        )
    }
}

impl fmt::Display for ChannelSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deposit {}/{} ",
            self.label(),
            self.deposit_a,
            self.deposit_b
        )?;
        match &self.source {
            LockSource::Node(node) => write!(
                f,
                "locked {}/{} (seen by {})",
                self.locked_a, self.locked_b, node
            ),
            LockSource::ChainOnly => f.write_str("locks unobservable (both participants down)"),
        }
    }
}

/// Read-only channel state reader
#[derive(Clone)]
pub struct ChannelStateProbe {
    chain: Arc<dyn ChainClient>,
    nodes: Arc<dyn NodeController>,
    api: Arc<dyn NodeApi>,
    settlement: Address,
}

impl ChannelStateProbe {
    /// Probe reading `settlement` through `chain` and node views through `api`
    pub fn new(
        chain: Arc<dyn ChainClient>,
        nodes: Arc<dyn NodeController>,
        api: Arc<dyn NodeApi>,
        settlement: Address,
    ) -> Self {
        Self {
            chain,
            nodes,
            api,
            settlement,
        }
    }

    /// Snapshot the channel between `a` and `b` on `token`
    pub async fn snapshot(
        &self,
        a: &NodeDescriptor,
        b: &NodeDescriptor,
        token: &Address,
    ) -> Result<ChannelSnapshot, ProbeError> {
        let on_chain = self
            .chain
            .channel(&self.settlement, token, &a.address, &b.address)
            .await?;

        let mut snapshot = ChannelSnapshot {
            a: a.name.clone(),
            b: b.name.clone(),
            token: *token,
            on_chain: on_chain.exists,
            deposit_a: on_chain.deposit_a,
            deposit_b: on_chain.deposit_b,
            locked_a: 0,
            locked_b: 0,
            balance_a: None,
            balance_b: None,
            source: LockSource::ChainOnly,
        };

        for (viewer, partner, swap) in [(a, b, false), (b, a, true)] {
            if !self.nodes.is_running(viewer).await? {
                continue;
            }
            let Some(view) = self
                .api
                .channel_view(viewer, &partner.address, token)
                .await?
            else {
                continue;
            };
            let view = if swap { view.swapped(viewer.address) } else { view };
            snapshot.locked_a = view.locked_amount;
            snapshot.locked_b = view.partner_locked_amount;
            snapshot.balance_a = Some(view.balance);
            snapshot.balance_b = Some(view.partner_balance);
            snapshot.source = LockSource::Node(viewer.name.clone());
            break;
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{}", snapshot);
        }
        Ok(snapshot)
    }
}
