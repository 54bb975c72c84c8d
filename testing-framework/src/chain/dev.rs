//! DevChain - in-process development chain
//!
//! Implements [`ChainClient`] entirely in memory so provisioning and scenario
//! logic can be exercised without an external node. The behaviour that matters
//! to the harness is modelled faithfully:
//!
//! - Per-account sequence numbers: a transaction executes only when its nonce is
//!   the next expected one. Future nonces wait in a queue; stale or duplicate
//!   nonces are rejected at submission.
//! - ERC20-like tokens: balances, allowances overwritten by `approve`, and
//!   deposits that consume allowance via transfer-from.
//! - Channel deposits held by the settlement contract.
//!
//! Failure injection lets tests drive the error paths: reverting the next N
//! transactions of a kind (their nonce is consumed), dropping the next N
//! submissions of a kind before they reach the pool (their nonce stays unused),
//! failing all reads, and rejecting all submissions.
//!
//! # Example
//!
//! ```rust,ignore
//! let chain = Arc::new(DevChain::new());
//! let deployer = Account::generate(None);
//! let token = chain
//!     .deploy_contract(&deployer, 0, ContractKind::Token {
//!         initial_supply: 1_000,
//!         symbol: "TKN".into(),
//!         decimals: 0,
//!     })
//!     .await?;
//! assert_eq!(chain.token_balance(&token, &deployer.address()).await?, 1_000);
//! ```

use super::{Call, ChainClient, ChainError, ContractKind, OnChainChannel, Receipt};
use crate::keystore::Account;
use crate::types::{Address, Amount, TxHash};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;

/// Transaction categories counted and targeted by failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    /// Settlement contract deployment
    DeploySettlement,
    /// Token deployment
    DeployToken,
    /// Token transfer
    Transfer,
    /// Allowance grant
    Approve,
    /// Channel deposit
    Deposit,
}

impl From<&Call> for TxKind {
    fn from(call: &Call) -> Self {
        match call {
            Call::Deploy(ContractKind::Settlement) => TxKind::DeploySettlement,
            Call::Deploy(ContractKind::Token { .. }) => TxKind::DeployToken,
            Call::Transfer { .. } => TxKind::Transfer,
            Call::Approve { .. } => TxKind::Approve,
            Call::Deposit { .. } => TxKind::Deposit,
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    balances: HashMap<Address, Amount>,
    // (owner, spender) -> allowance
    allowances: HashMap<(Address, Address), Amount>,
}

#[derive(Debug, Default)]
struct ChannelRecord {
    deposits: HashMap<Address, Amount>,
    settle_timeout: u64,
}

#[derive(Debug, Default)]
struct SettlementState {
    // (token, lower participant, higher participant)
    channels: HashMap<(Address, Address, Address), ChannelRecord>,
}

#[derive(Debug)]
enum Contract {
    Settlement(SettlementState),
    Token(TokenState),
}

#[derive(Debug)]
struct PendingTx {
    hash: TxHash,
    from: Address,
    nonce: u64,
    call: Call,
}

#[derive(Debug, Default)]
struct State {
    block: u64,
    next_nonce: HashMap<Address, u64>,
    queued: HashMap<Address, BTreeMap<u64, PendingTx>>,
    known: HashSet<TxHash>,
    receipts: HashMap<TxHash, Receipt>,
    contracts: HashMap<Address, Contract>,
    executed: HashMap<TxKind, usize>,
    fail_next: HashMap<TxKind, usize>,
    drop_next: HashMap<TxKind, usize>,
    fail_reads: bool,
    reject_sends: Option<String>,
}

/// In-memory chain used by tests and local dry runs
#[derive(Debug, Default)]
pub struct DevChain {
    state: Mutex<State>,
    mined: Notify,
    mining_delay: Duration,
}

fn channel_key(token: Address, a: Address, b: Address) -> (Address, Address, Address) {
    if a <= b {
        (token, a, b)
    } else {
        (token, b, a)
    }
}

impl DevChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `wait_mined` call by `delay` to mimic block time
    pub fn with_mining_delay(mut self, delay: Duration) -> Self {
        self.mining_delay = delay;
        self
    }

    /// Revert the next `count` transactions of `kind`
    pub fn fail_next(&self, kind: TxKind, count: usize) {
        *self.state.lock().fail_next.entry(kind).or_default() += count;
    }

    /// Lose the next `count` submissions of `kind` as if the connection reset
    ///
    /// The submission errors and never reaches the pool, so the nonce it
    /// carried stays unused.
    pub fn drop_next_send(&self, kind: TxKind, count: usize) {
        *self.state.lock().drop_next.entry(kind).or_default() += count;
    }

    /// Make every read (including nonce queries) fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Reject every submission with `reason`, or accept again with `None`
    pub fn set_reject_sends(&self, reason: Option<String>) {
        self.state.lock().reject_sends = reason;
    }

    /// Number of executed transactions of `kind` (successful or reverted)
    pub fn tx_count(&self, kind: TxKind) -> usize {
        self.state
            .lock()
            .executed
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Number of executed transactions of all kinds
    pub fn total_tx_count(&self) -> usize {
        self.state.lock().executed.values().sum()
    }

    /// Current block number
    pub fn block_number(&self) -> u64 {
        self.state.lock().block
    }

    /// Transactions accepted but waiting for an earlier nonce
    pub fn queued_count(&self, address: &Address) -> usize {
        self.state
            .lock()
            .queued
            .get(address)
            .map(|q| q.len())
            .unwrap_or_default()
    }

    fn check_reads(state: &State) -> Result<(), ChainError> {
        if state.fail_reads {
            return Err(ChainError::Unreachable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn token_mut<'a>(
        contracts: &'a mut HashMap<Address, Contract>,
        token: &Address,
    ) -> Result<&'a mut TokenState, String> {
        match contracts.get_mut(token) {
            Some(Contract::Token(state)) => Ok(state),
            _ => Err(format!("no token contract at {}", token)),
        }
    }

    fn execute(contracts: &mut HashMap<Address, Contract>, tx: &PendingTx) -> Result<Option<Address>, String> {
        match &tx.call {
            Call::Deploy(kind) => {
                let mut seed = tx.from.as_bytes().to_vec();
                seed.extend_from_slice(&tx.nonce.to_be_bytes());
                let address = Address::from_public_key(&seed);
                let contract = match kind {
                    ContractKind::Settlement => Contract::Settlement(SettlementState::default()),
                    ContractKind::Token { initial_supply, .. } => {
                        let mut token = TokenState::default();
                        token.balances.insert(tx.from, *initial_supply);
                        Contract::Token(token)
                    }
                };
                contracts.insert(address, contract);
                Ok(Some(address))
            }
            Call::Transfer { token, to, amount } => {
                let state = Self::token_mut(contracts, token)?;
                let balance = state.balances.entry(tx.from).or_default();
                if *balance < *amount {
                    return Err(format!(
                        "insufficient balance: {} < {}",
                        balance, amount
                    ));
                }
                *balance -= amount;
                *state.balances.entry(*to).or_default() += amount;
                Ok(None)
            }
            Call::Approve {
                token,
                spender,
                amount,
            } => {
                let state = Self::token_mut(contracts, token)?;
                state.allowances.insert((tx.from, *spender), *amount);
                Ok(None)
            }
            Call::Deposit {
                settlement,
                token,
                participant,
                partner,
                amount,
                settle_timeout,
            } => {
                if *participant != tx.from {
                    return Err("participant must be the sender".to_string());
                }
                if participant == partner {
                    return Err("channel participants must differ".to_string());
                }
                if !matches!(contracts.get(settlement), Some(Contract::Settlement(_))) {
                    return Err(format!("no settlement contract at {}", settlement));
                }

                {
                    let state = Self::token_mut(contracts, token)?;
                    let allowance = state
                        .allowances
                        .get(&(tx.from, *settlement))
                        .copied()
                        .unwrap_or_default();
                    if allowance < *amount {
                        return Err(format!(
                            "insufficient allowance: {} < {}",
                            allowance, amount
                        ));
                    }
                    let balance = state.balances.get(&tx.from).copied().unwrap_or_default();
                    if balance < *amount {
                        return Err(format!(
                            "insufficient balance: {} < {}",
                            balance, amount
                        ));
                    }
                    state.allowances.insert((tx.from, *settlement), allowance - amount);
                    state.balances.insert(tx.from, balance - amount);
                    *state.balances.entry(*settlement).or_default() += amount;
                }

                if let Some(Contract::Settlement(settlement_state)) = contracts.get_mut(settlement) {
                    let record = settlement_state
                        .channels
                        .entry(channel_key(*token, *participant, *partner))
                        .or_insert_with(|| ChannelRecord {
                            deposits: HashMap::new(),
                            settle_timeout: *settle_timeout,
                        });
                    *record.deposits.entry(*participant).or_default() += amount;
                }
                Ok(None)
            }
        }
    }

    /// Execute every queued transaction of `from` whose nonce is now next
    fn drain_queue(state: &mut State, from: &Address) {
        loop {
            let expected = state.next_nonce.get(from).copied().unwrap_or_default();
            let Some(tx) = state.queued.get_mut(from).and_then(|q| q.remove(&expected)) else {
                break;
            };

            let kind = TxKind::from(&tx.call);
            *state.executed.entry(kind).or_default() += 1;
            state.block += 1;

            let injected = match state.fail_next.get_mut(&kind) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };

            let outcome = if injected {
                Err("injected failure".to_string())
            } else {
                Self::execute(&mut state.contracts, &tx)
            };

            let receipt = match outcome {
                Ok(contract_address) => Receipt {
                    tx: tx.hash,
                    block: state.block,
                    success: true,
                    contract_address,
                    revert_reason: None,
                },
                Err(reason) => {
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!(
                            "DevChain: {} from {} nonce {} reverted: {}",
                            tx.call.label(),
                            tx.from.short(),
                            tx.nonce,
                            reason
                        );
                    }
                    Receipt {
                        tx: tx.hash,
                        block: state.block,
                        success: false,
                        contract_address: None,
                        revert_reason: Some(reason),
                    }
                }
            };

            state.receipts.insert(tx.hash, receipt);
            state.next_nonce.insert(*from, expected + 1);
        }
    }
}

#[async_trait]
impl ChainClient for DevChain {
    async fn pending_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        Ok(state.next_nonce.get(address).copied().unwrap_or_default())
    }

    async fn send_transaction(
        &self,
        from: &Account,
        nonce: u64,
        call: Call,
    ) -> Result<TxHash, ChainError> {
        let sender = from.address();
        let hash = {
            let mut state = self.state.lock();
            if let Some(reason) = &state.reject_sends {
                return Err(ChainError::Unreachable(reason.clone()));
            }
            if let Some(remaining) = state.drop_next.get_mut(&TxKind::from(&call)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ChainError::Unreachable(format!(
                        "connection reset while sending {} nonce {}",
                        call.label(),
                        nonce
                    )));
                }
            }

            let expected = state.next_nonce.get(&sender).copied().unwrap_or_default();
            if nonce < expected {
                return Err(ChainError::Rejected(format!(
                    "nonce too low: {} < {} for {}",
                    nonce, expected, sender
                )));
            }
            if state
                .queued
                .get(&sender)
                .is_some_and(|q| q.contains_key(&nonce))
            {
                return Err(ChainError::Rejected(format!(
                    "nonce {} already pending for {}",
                    nonce, sender
                )));
            }

            let mut preimage = sender.as_bytes().to_vec();
            preimage.extend_from_slice(&nonce.to_be_bytes());
            preimage.extend_from_slice(
                serde_json::to_string(&call)
                    .map_err(|e| ChainError::InvalidResponse(e.to_string()))?
                    .as_bytes(),
            );
            let hash = TxHash::digest(&preimage);

            state.known.insert(hash);
            state.queued.entry(sender).or_default().insert(
                nonce,
                PendingTx {
                    hash,
                    from: sender,
                    nonce,
                    call,
                },
            );
            Self::drain_queue(&mut state, &sender);
            hash
        };

        self.mined.notify_waiters();
        Ok(hash)
    }

    async fn wait_mined(&self, tx: &TxHash) -> Result<Receipt, ChainError> {
        if !self.mining_delay.is_zero() {
            tokio::time::sleep(self.mining_delay).await;
        }

        loop {
            let notified = self.mined.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if let Some(receipt) = state.receipts.get(tx) {
                    if receipt.success {
                        return Ok(receipt.clone());
                    }
                    return Err(ChainError::Reverted {
                        tx: *tx,
                        reason: receipt
                            .revert_reason
                            .clone()
                            .unwrap_or_else(|| "reverted".to_string()),
                    });
                }
                if !state.known.contains(tx) {
                    return Err(ChainError::UnknownTransaction(*tx));
                }
            }

            notified.await;
        }
    }

    async fn token_balance(&self, token: &Address, owner: &Address) -> Result<Amount, ChainError> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        match state.contracts.get(token) {
            Some(Contract::Token(t)) => Ok(t.balances.get(owner).copied().unwrap_or_default()),
            _ => Err(ChainError::Rpc {
                code: -32000,
                message: format!("no token contract at {}", token),
            }),
        }
    }

    async fn allowance(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<Amount, ChainError> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        match state.contracts.get(token) {
            Some(Contract::Token(t)) => Ok(t
                .allowances
                .get(&(*owner, *spender))
                .copied()
                .unwrap_or_default()),
            _ => Err(ChainError::Rpc {
                code: -32000,
                message: format!("no token contract at {}", token),
            }),
        }
    }

    async fn channel(
        &self,
        settlement: &Address,
        token: &Address,
        a: &Address,
        b: &Address,
    ) -> Result<OnChainChannel, ChainError> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        let Some(Contract::Settlement(settlement_state)) = state.contracts.get(settlement) else {
            return Err(ChainError::Rpc {
                code: -32000,
                message: format!("no settlement contract at {}", settlement),
            });
        };
        Ok(settlement_state
            .channels
            .get(&channel_key(*token, *a, *b))
            .map(|record| OnChainChannel {
                exists: true,
                deposit_a: record.deposits.get(a).copied().unwrap_or_default(),
                deposit_b: record.deposits.get(b).copied().unwrap_or_default(),
                settle_timeout: record.settle_timeout,
            })
            .unwrap_or_default())
    }

    async fn code_exists(&self, address: &Address) -> Result<bool, ChainError> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        Ok(state.contracts.contains_key(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn token_kind(supply: Amount) -> ContractKind {
        ContractKind::Token {
            initial_supply: supply,
            symbol: "TKN".into(),
            decimals: 0,
        }
    }

    #[tokio::test]
    async fn test_deploy_and_transfer() {
        let chain = DevChain::new();
        let alice = Account::from_secret([1; 32], None);
        let bob = Account::from_secret([2; 32], None);

        let token = chain.deploy_contract(&alice, 0, token_kind(1_000)).await.unwrap();
        assert!(chain.code_exists(&token).await.unwrap());

        let tx = chain
            .send_transaction(
                &alice,
                1,
                Call::Transfer {
                    token,
                    to: bob.address(),
                    amount: 400,
                },
            )
            .await
            .unwrap();
        chain.wait_mined(&tx).await.unwrap();

        assert_eq!(chain.token_balance(&token, &alice.address()).await.unwrap(), 600);
        assert_eq!(chain.token_balance(&token, &bob.address()).await.unwrap(), 400);
        assert_eq!(chain.pending_nonce(&alice.address()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_nonces_rejected() {
        let chain = DevChain::new();
        let alice = Account::from_secret([1; 32], None);
        chain.deploy_contract(&alice, 0, ContractKind::Settlement).await.unwrap();

        let err = chain
            .send_transaction(&alice, 0, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));

        // Nonce 5 queues behind the gap; resubmitting it is a collision
        chain
            .send_transaction(&alice, 5, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap();
        let err = chain
            .send_transaction(&alice, 5, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));
        assert_eq!(chain.queued_count(&alice.address()), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_nonces_execute_in_order() {
        let chain = Arc::new(DevChain::new());
        let alice = Arc::new(Account::from_secret([1; 32], None));

        let later = chain
            .send_transaction(&alice, 1, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap();

        let waiter = {
            let chain = chain.clone();
            tokio::spawn(async move { chain.wait_mined(&later).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        chain
            .send_transaction(&alice, 0, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap();
        let receipt = waiter.await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(chain.pending_nonce(&alice.address()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_deposit_requires_allowance() {
        let chain = DevChain::new();
        let alice = Account::from_secret([1; 32], None);
        let bob = Account::from_secret([2; 32], None);
        let token = chain.deploy_contract(&alice, 0, token_kind(1_000)).await.unwrap();
        let settlement = chain
            .deploy_contract(&alice, 1, ContractKind::Settlement)
            .await
            .unwrap();

        let deposit = Call::Deposit {
            settlement,
            token,
            participant: alice.address(),
            partner: bob.address(),
            amount: 100,
            settle_timeout: 100,
        };
        let tx = chain.send_transaction(&alice, 2, deposit.clone()).await.unwrap();
        assert!(matches!(
            chain.wait_mined(&tx).await,
            Err(ChainError::Reverted { .. })
        ));

        let tx = chain
            .send_transaction(
                &alice,
                3,
                Call::Approve {
                    token,
                    spender: settlement,
                    amount: 150,
                },
            )
            .await
            .unwrap();
        chain.wait_mined(&tx).await.unwrap();
        let tx = chain.send_transaction(&alice, 4, deposit).await.unwrap();
        chain.wait_mined(&tx).await.unwrap();

        let channel = chain
            .channel(&settlement, &token, &bob.address(), &alice.address())
            .await
            .unwrap();
        assert!(channel.exists);
        assert_eq!(channel.deposit_a, 0);
        assert_eq!(channel.deposit_b, 100);
        assert_eq!(channel.settle_timeout, 100);
        assert_eq!(
            chain
                .allowance(&token, &alice.address(), &settlement)
                .await
                .unwrap(),
            50
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let chain = DevChain::new();
        let alice = Account::from_secret([1; 32], None);
        chain.fail_next(TxKind::DeploySettlement, 1);

        let err = chain
            .deploy_contract(&alice, 0, ContractKind::Settlement)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Reverted { .. }));
        // The reverted transaction still consumed its nonce
        assert_eq!(chain.pending_nonce(&alice.address()).await.unwrap(), 1);
        assert_eq!(chain.tx_count(TxKind::DeploySettlement), 1);

        chain.set_fail_reads(true);
        assert!(chain.pending_nonce(&alice.address()).await.is_err());
        chain.set_fail_reads(false);

        chain.set_reject_sends(Some("down".into()));
        assert!(matches!(
            chain
                .send_transaction(&alice, 1, Call::Deploy(ContractKind::Settlement))
                .await,
            Err(ChainError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_send_leaves_a_nonce_gap() {
        let chain = DevChain::new();
        let alice = Account::from_secret([2; 32], None);
        chain.drop_next_send(TxKind::DeploySettlement, 1);

        let err = chain
            .send_transaction(&alice, 0, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Unreachable(ref m) if m.contains("nonce 0")));
        assert_eq!(chain.tx_count(TxKind::DeploySettlement), 0);

        // The next nonce waits behind the unused one
        chain
            .send_transaction(&alice, 1, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap();
        assert_eq!(chain.queued_count(&alice.address()), 1);
        assert_eq!(chain.pending_nonce(&alice.address()).await.unwrap(), 0);

        // Resending the gap nonce unblocks the queue
        chain
            .send_transaction(&alice, 0, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap();
        assert_eq!(chain.queued_count(&alice.address()), 0);
        assert_eq!(chain.pending_nonce(&alice.address()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let chain = DevChain::new();
        assert!(matches!(
            chain.wait_mined(&TxHash::zero()).await,
            Err(ChainError::UnknownTransaction(_))
        ));
    }
}
