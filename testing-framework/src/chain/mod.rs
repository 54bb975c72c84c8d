// File: testing-framework/src/chain/mod.rs
//
// Chain Client Boundary
//
// The harness talks to exactly one chain RPC endpoint and one settlement
// contract ABI per run. This module defines that boundary as a trait so the
// provisioner and the state probe work unchanged against a real endpoint
// (`RpcChainClient`) or the in-process development chain (`DevChain`).

/// In-process development chain implementing [`ChainClient`]
pub mod dev;
/// JSON-RPC chain client
pub mod rpc;

pub use dev::{DevChain, TxKind};
pub use rpc::{RpcChainClient, RpcChainConfig};

use crate::keystore::Account;
use crate::types::{amount_serde, Address, Amount, TxHash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a chain client
///
/// Every variant is fatal to the current harness phase; transient and fatal
/// failures are deliberately not distinguished.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Endpoint could not be reached
    #[error("Chain endpoint unreachable: {0}")]
    Unreachable(String),

    /// Endpoint answered with an RPC-level error
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },

    /// Transaction rejected before inclusion
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// Transaction mined but reverted
    #[error("Transaction {tx} failed: {reason}")]
    Reverted {
        /// Failed transaction
        tx: TxHash,
        /// Revert reason
        reason: String,
    },

    /// Transaction hash is not known to the chain
    #[error("Unknown transaction {0}")]
    UnknownTransaction(TxHash),

    /// A deployment receipt carries no contract address
    #[error("Transaction {0} did not create a contract")]
    NoContractAddress(TxHash),

    /// Response could not be decoded
    #[error("Invalid chain response: {0}")]
    InvalidResponse(String),
}

/// Contract kinds the harness deploys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "contract", rename_all = "snake_case")]
pub enum ContractKind {
    /// Settlement contract holding all channels
    Settlement,
    /// ERC20-like token minted to the deployer
    Token {
        /// Supply minted to the deployer
        #[serde(with = "amount_serde")]
        initial_supply: Amount,
        /// Token symbol
        symbol: String,
        /// Display decimals
        decimals: u8,
    },
}

/// State-changing calls the harness submits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    /// Deploy a new contract
    Deploy(ContractKind),
    /// Token transfer from the sender
    Transfer {
        /// Token contract
        token: Address,
        /// Recipient
        to: Address,
        /// Amount
        #[serde(with = "amount_serde")]
        amount: Amount,
    },
    /// Grant `spender` an allowance over the sender's tokens
    Approve {
        /// Token contract
        token: Address,
        /// Spender (the settlement contract)
        spender: Address,
        /// Allowance value
        #[serde(with = "amount_serde")]
        amount: Amount,
    },
    /// Deposit into the channel between sender and partner, opening it if needed
    Deposit {
        /// Settlement contract
        settlement: Address,
        /// Token of the channel
        token: Address,
        /// Depositing participant (the sender)
        participant: Address,
        /// Channel partner
        partner: Address,
        /// Deposit amount
        #[serde(with = "amount_serde")]
        amount: Amount,
        /// Settlement timeout used when opening the channel
        settle_timeout: u64,
    },
}

impl Call {
    /// Short label for log lines
    pub fn label(&self) -> &'static str {
        match self {
            Call::Deploy(ContractKind::Settlement) => "deploy_settlement",
            Call::Deploy(ContractKind::Token { .. }) => "deploy_token",
            Call::Transfer { .. } => "transfer",
            Call::Approve { .. } => "approve",
            Call::Deposit { .. } => "deposit",
        }
    }
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction hash
    pub tx: TxHash,
    /// Block it was mined in
    pub block: u64,
    /// Whether execution succeeded
    pub success: bool,
    /// Contract created by a deployment
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Revert reason on failure
    #[serde(default)]
    pub revert_reason: Option<String>,
}

/// Channel as recorded by the settlement contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OnChainChannel {
    /// Whether the channel has been opened
    pub exists: bool,
    /// Deposit of the first queried participant
    #[serde(with = "amount_serde")]
    pub deposit_a: Amount,
    /// Deposit of the second queried participant
    #[serde(with = "amount_serde")]
    pub deposit_b: Amount,
    /// Settlement timeout
    pub settle_timeout: u64,
}

/// Chain RPC boundary consumed by the harness
///
/// Implementations must give a definitive confirmed/failed answer for every
/// submitted transaction. `wait_mined` has no timeout: a stalled chain stalls
/// the caller.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Next sequence number the chain expects from `address`, counting pending
    /// transactions
    async fn pending_nonce(&self, address: &Address) -> Result<u64, ChainError>;

    /// Sign `call` with `from`'s key at sequence number `nonce` and submit it
    async fn send_transaction(
        &self,
        from: &Account,
        nonce: u64,
        call: Call,
    ) -> Result<TxHash, ChainError>;

    /// Block until `tx` is mined; a reverted transaction is an error
    async fn wait_mined(&self, tx: &TxHash) -> Result<Receipt, ChainError>;

    /// Token balance of `owner`
    async fn token_balance(&self, token: &Address, owner: &Address) -> Result<Amount, ChainError>;

    /// Allowance granted by `owner` to `spender`
    async fn allowance(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<Amount, ChainError>;

    /// Channel between `a` and `b` on `token`, deposits reported in `(a, b)` order
    async fn channel(
        &self,
        settlement: &Address,
        token: &Address,
        a: &Address,
        b: &Address,
    ) -> Result<OnChainChannel, ChainError>;

    /// Whether contract code exists at `address`
    async fn code_exists(&self, address: &Address) -> Result<bool, ChainError>;

    /// Deploy a contract and wait for it to be mined
    async fn deploy_contract(
        &self,
        from: &Account,
        nonce: u64,
        kind: ContractKind,
    ) -> Result<Address, ChainError> {
        let tx = self
            .send_transaction(from, nonce, Call::Deploy(kind))
            .await?;
        let receipt = self.wait_mined(&tx).await?;
        receipt
            .contract_address
            .ok_or(ChainError::NoContractAddress(tx))
    }
}
