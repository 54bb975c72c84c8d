// File: testing-framework/src/provisioning/allowance.rs
//
// Allowance Cache
//
// Concurrent channel-side deposits from the same owner on the same token all
// need the settlement contract to hold an allowance. The cache records the
// allowance granted per (spender, owner, token) and grants a multiple of the
// requested amount, so most deposits find their allowance already in place.
// The lock is held across approve + wait-for-mined, and the cache is checked
// again once the lock is held, so two flows never both approve for one key.

use super::nonce::NonceAllocator;
use crate::chain::{Call, ChainClient, ChainError};
use crate::keystore::Account;
use crate::types::{Address, Amount};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cache key: who may spend whose tokens of which contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowanceKey {
    /// Spender (the settlement contract)
    pub spender: Address,
    /// Token owner
    pub owner: Address,
    /// Token contract
    pub token: Address,
}

/// Result of [`AllowanceCache::ensure_allowance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowanceOutcome {
    /// A recorded grant already covered the amount; nothing was submitted
    Cached {
        /// Recorded grant
        granted: Amount,
    },
    /// An approval was submitted and mined
    Approved {
        /// Newly granted allowance
        granted: Amount,
    },
}

impl AllowanceOutcome {
    /// Allowance on record after the call
    pub fn granted(&self) -> Amount {
        match self {
            AllowanceOutcome::Cached { granted } | AllowanceOutcome::Approved { granted } => {
                *granted
            }
        }
    }
}

/// Per-run memo of granted allowances
pub struct AllowanceCache {
    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
    multiplier: u32,
    granted: Mutex<HashMap<AllowanceKey, Amount>>,
}

impl AllowanceCache {
    /// Cache submitting approvals through `chain` with nonces from `nonces`
    pub fn new(chain: Arc<dyn ChainClient>, nonces: Arc<NonceAllocator>, multiplier: u32) -> Self {
        Self {
            chain,
            nonces,
            multiplier: multiplier.max(1),
            granted: Mutex::new(HashMap::new()),
        }
    }

    /// Allowance multiplier
    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Recorded grant for `key`
    pub async fn recorded(&self, key: &AllowanceKey) -> Option<Amount> {
        self.granted.lock().await.get(key).copied()
    }

    /// Make sure `spender` may move at least `amount` of `owner`'s `token`
    ///
    /// On a miss, approves `amount * multiplier` and waits for it to be mined.
    /// A failed approval leaves the cache untouched and is returned to the
    /// caller, whose deposit must then fail.
    pub async fn ensure_allowance(
        &self,
        owner: &Account,
        spender: &Address,
        token: &Address,
        amount: Amount,
    ) -> Result<AllowanceOutcome, ChainError> {
        let key = AllowanceKey {
            spender: *spender,
            owner: owner.address(),
            token: *token,
        };

        let mut granted = self.granted.lock().await;
        if let Some(&existing) = granted.get(&key) {
            if existing >= amount {
                return Ok(AllowanceOutcome::Cached { granted: existing });
            }
        }

        let value = amount.saturating_mul(Amount::from(self.multiplier));
        let nonce = self.nonces.lease(&key.owner).await?;
        let tx = self
            .chain
            .send_transaction(
                owner,
                nonce,
                Call::Approve {
                    token: *token,
                    spender: *spender,
                    amount: value,
                },
            )
            .await?;
        self.chain.wait_mined(&tx).await?;

        granted.insert(key, value);
        info!(
            "approve account {} {} tokens to {} success",
            key.owner.short(),
            value,
            spender.short()
        );
        Ok(AllowanceOutcome::Approved { granted: value })
    }
}
