//! JSON-RPC chain client
//!
//! Talks JSON-RPC 2.0 over HTTP to the single chain endpoint of a test run.
//! State-changing calls are wrapped in a signed envelope: the account's ed25519
//! key signs the SHA3-256 digest of the canonical JSON of `{from, nonce, call}`.
//!
//! No request is retried. Every failure surfaces as a [`ChainError`] and is
//! fatal to the current harness phase.

use super::{Call, ChainClient, ChainError, OnChainChannel, Receipt};
use crate::keystore::Account;
use crate::types::{Address, Amount, TxHash};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha3::{Digest, Sha3_256};
use std::time::Duration;
use url::Url;

/// Configuration of the RPC client
#[derive(Debug, Clone)]
pub struct RpcChainConfig {
    /// Chain RPC endpoint, `host:port` or a full URL
    pub endpoint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Interval between receipt polls in `wait_mined`
    pub receipt_poll_interval: Duration,
}

impl RpcChainConfig {
    /// Default configuration for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            receipt_poll_interval: Duration::from_millis(500),
        }
    }
}

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Value,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// JSON-RPC error structure
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct UnsignedEnvelope<'a> {
    from: Address,
    nonce: u64,
    call: &'a Call,
}

/// Signed transaction envelope submitted to the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Sender address
    pub from: Address,
    /// Sender sequence number
    pub nonce: u64,
    /// Submitted call
    pub call: Call,
    /// Hex ed25519 verifying key of the sender
    pub public_key: String,
    /// Hex ed25519 signature over [`SignedEnvelope::signing_digest`]
    pub signature: String,
}

impl SignedEnvelope {
    /// Sign `call` for `account` at `nonce`
    pub fn sign(account: &Account, nonce: u64, call: Call) -> Result<Self, ChainError> {
        let digest = Self::signing_digest(account.address(), nonce, &call)?;
        Ok(Self {
            from: account.address(),
            nonce,
            public_key: hex::encode(account.public_key()),
            signature: hex::encode(account.sign(&digest)),
            call,
        })
    }

    /// SHA3-256 of the canonical JSON of `{from, nonce, call}`
    pub fn signing_digest(from: Address, nonce: u64, call: &Call) -> Result<[u8; 32], ChainError> {
        let payload = serde_json::to_vec(&UnsignedEnvelope { from, nonce, call })
            .map_err(|e| ChainError::InvalidResponse(format!("cannot encode call: {}", e)))?;
        Ok(Sha3_256::digest(&payload).into())
    }
}

fn parse_result<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, ChainError> {
    serde_json::from_value(value)
        .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", method, e)))
}

fn parse_amount(method: &str, value: Value) -> Result<Amount, ChainError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ChainError::InvalidResponse(format!("{}: invalid amount '{}'", method, s))),
        Value::Number(n) => n
            .as_u64()
            .map(Amount::from)
            .ok_or_else(|| ChainError::InvalidResponse(format!("{}: invalid amount {}", method, n))),
        other => Err(ChainError::InvalidResponse(format!(
            "{}: expected amount, got {}",
            method, other
        ))),
    }
}

fn into_result(method: &str, response: JsonRpcResponse) -> Result<Value, ChainError> {
    if let Some(error) = response.error {
        return Err(ChainError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    response
        .result
        .ok_or_else(|| ChainError::InvalidResponse(format!("{}: no result in response", method)))
}

/// Chain client backed by a JSON-RPC endpoint
pub struct RpcChainClient {
    client: Client,
    url: Url,
    config: RpcChainConfig,
}

impl RpcChainClient {
    /// Build a client; the endpoint is not contacted until the first call
    pub fn new(config: RpcChainConfig) -> Result<Self, ChainError> {
        let endpoint = config.endpoint.trim();
        let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            Url::parse(endpoint)
        } else {
            Url::parse(&format!("http://{}", endpoint))
        }
        .map_err(|e| ChainError::Unreachable(format!("invalid endpoint '{}': {}", endpoint, e)))?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connection_timeout)
            .build()
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            url,
            config,
        })
    }

    /// Endpoint URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: rand::random::<u32>(),
            method,
            params,
        };

        if log::log_enabled!(log::Level::Debug) {
            debug!("JSON-RPC {} -> {}", method, self.url);
        }

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Unreachable(format!(
                        "request timeout after {:?}",
                        self.config.request_timeout
                    ))
                } else {
                    ChainError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(ChainError::Unreachable(format!(
                "HTTP error {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown error")
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", method, e)))?;
        into_result(method, body)
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn pending_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        let value = self.request("chain_pendingNonce", json!([address])).await?;
        parse_result("chain_pendingNonce", value)
    }

    async fn send_transaction(
        &self,
        from: &Account,
        nonce: u64,
        call: Call,
    ) -> Result<TxHash, ChainError> {
        let label = call.label();
        let envelope = SignedEnvelope::sign(from, nonce, call)?;
        let value = self
            .request("chain_sendTransaction", json!([envelope]))
            .await
            .map_err(|e| match e {
                ChainError::Rpc { message, .. } => ChainError::Rejected(message),
                other => other,
            })?;
        let tx: TxHash = parse_result("chain_sendTransaction", value)?;
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Submitted {} from {} nonce {}: {}",
                label,
                from.address().short(),
                nonce,
                tx
            );
        }
        Ok(tx)
    }

    async fn wait_mined(&self, tx: &TxHash) -> Result<Receipt, ChainError> {
        loop {
            let value = self.request("chain_getReceipt", json!([tx])).await?;
            if !value.is_null() {
                let receipt: Receipt = parse_result("chain_getReceipt", value)?;
                if receipt.success {
                    return Ok(receipt);
                }
                return Err(ChainError::Reverted {
                    tx: *tx,
                    reason: receipt
                        .revert_reason
                        .unwrap_or_else(|| "reverted".to_string()),
                });
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    async fn token_balance(&self, token: &Address, owner: &Address) -> Result<Amount, ChainError> {
        let value = self.request("token_balanceOf", json!([token, owner])).await?;
        parse_amount("token_balanceOf", value)
    }

    async fn allowance(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<Amount, ChainError> {
        let value = self
            .request("token_allowance", json!([token, owner, spender]))
            .await?;
        parse_amount("token_allowance", value)
    }

    async fn channel(
        &self,
        settlement: &Address,
        token: &Address,
        a: &Address,
        b: &Address,
    ) -> Result<OnChainChannel, ChainError> {
        let value = self
            .request("settlement_getChannel", json!([settlement, token, a, b]))
            .await?;
        if value.is_null() {
            return Ok(OnChainChannel::default());
        }
        parse_result("settlement_getChannel", value)
    }

    async fn code_exists(&self, address: &Address) -> Result<bool, ChainError> {
        let value = self.request("chain_codeExists", json!([address])).await?;
        parse_result("chain_codeExists", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn test_envelope_signature_verifies() {
        let account = Account::from_secret([7; 32], None);
        let call = Call::Transfer {
            token: Address::new([1; 20]),
            to: Address::new([2; 20]),
            amount: 5_000_000,
        };
        let envelope = SignedEnvelope::sign(&account, 3, call.clone()).unwrap();
        assert_eq!(envelope.from, account.address());

        let key_bytes: [u8; 32] = hex::decode(&envelope.public_key).unwrap().try_into().unwrap();
        let sig_bytes: [u8; 64] = hex::decode(&envelope.signature).unwrap().try_into().unwrap();
        let key = VerifyingKey::from_bytes(&key_bytes).unwrap();
        let digest = SignedEnvelope::signing_digest(account.address(), 3, &call).unwrap();
        key.verify(&digest, &Signature::from_bytes(&sig_bytes)).unwrap();

        // A different nonce yields a different digest
        let other = SignedEnvelope::signing_digest(account.address(), 4, &call).unwrap();
        assert!(key.verify(&other, &Signature::from_bytes(&sig_bytes)).is_err());
    }

    #[test]
    fn test_rpc_error_is_surfaced() {
        let response: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nonce too low"}}"#,
        )
        .unwrap();
        assert_eq!(
            into_result("chain_sendTransaction", response).unwrap_err(),
            ChainError::Rpc {
                code: -32000,
                message: "nonce too low".into()
            }
        );

        let empty: JsonRpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(matches!(
            into_result("x", empty),
            Err(ChainError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_amount_forms() {
        assert_eq!(parse_amount("m", json!("1000")).unwrap(), 1000);
        assert_eq!(parse_amount("m", json!(45)).unwrap(), 45);
        assert!(parse_amount("m", json!(true)).is_err());
        assert!(parse_amount("m", json!("-1")).is_err());
    }

    #[test]
    fn test_endpoint_without_scheme() {
        let client = RpcChainClient::new(RpcChainConfig::new("127.0.0.1:8545")).unwrap();
        assert_eq!(client.url().as_str(), "http://127.0.0.1:8545/");
    }
}
