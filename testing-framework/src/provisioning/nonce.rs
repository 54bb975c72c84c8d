// File: testing-framework/src/provisioning/nonce.rs
//
// Nonce Allocator
//
// Hands out per-account transaction sequence numbers to concurrent
// submitters. The first lease for an account reads the chain's pending nonce;
// later leases increment a cached counter. Each account has its own async
// mutex, so submitters of one account are serialized only for the duration of
// the lease while different accounts never contend.

use crate::chain::{ChainClient, ChainError};
use crate::types::Address;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-run sequence number allocator
///
/// Leased numbers are never handed out again, even if the transaction that
/// used them fails: the high-water mark only moves forward.
pub struct NonceAllocator {
    chain: Arc<dyn ChainClient>,
    // None until the first successful chain query
    next: DashMap<Address, Arc<Mutex<Option<u64>>>>,
}

impl NonceAllocator {
    /// Allocator reading initial nonces from `chain`
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            next: DashMap::new(),
        }
    }

    fn slot(&self, account: &Address) -> Arc<Mutex<Option<u64>>> {
        self.next
            .entry(*account)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Lease the next sequence number for `account`
    ///
    /// A failed chain query leases nothing and leaves the allocator unchanged;
    /// the next call queries the chain again.
    pub async fn lease(&self, account: &Address) -> Result<u64, ChainError> {
        // The DashMap shard guard is released before awaiting
        let slot = self.slot(account);
        let mut next = slot.lock().await;

        let nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let pending = self.chain.pending_nonce(account).await?;
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Nonce for {} starts at {}", account.short(), pending);
                }
                pending
            }
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Next number that would be leased, if the account has been seen
    pub async fn peek(&self, account: &Address) -> Option<u64> {
        let slot = self.next.get(account).map(|entry| entry.value().clone())?;
        let next = slot.lock().await;
        *next
    }
}
