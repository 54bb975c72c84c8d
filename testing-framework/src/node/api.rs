//! HTTP node API client
//!
//! - `POST {host}/api/1/transfers/{token}/{target}` with
//!   `{"amount": .., "fee": 0, "is_direct": false}` triggers a transfer.
//! - `GET {host}/api/1/channels` lists the node's channels.
//!
//! Transfers are fire-and-forget: the request runs on a background task, so a
//! node that crashes mid-request never blocks the scenario.

use super::{ChannelView, NodeApi, NodeError};
use crate::provisioning::NodeDescriptor;
use crate::types::{Address, Amount};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct TransferRequest {
    amount: Amount,
    fee: u64,
    is_direct: bool,
}

/// Node API over HTTP
#[derive(Clone)]
pub struct HttpNodeApi {
    client: Client,
}

impl HttpNodeApi {
    /// Client with a per-request timeout
    pub fn new(request_timeout: Duration) -> Result<Self, NodeError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NodeError::Api {
                node: "<client>".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// URL of the transfer endpoint
    pub fn transfer_url(node: &NodeDescriptor, token: &Address, target: &Address) -> String {
        format!("{}/api/1/transfers/{}/{}", node.api_url(), token, target)
    }

    /// URL of the channel list endpoint
    pub fn channels_url(node: &NodeDescriptor) -> String {
        format!("{}/api/1/channels", node.api_url())
    }

    /// Every channel `node` knows about
    pub async fn channels(&self, node: &NodeDescriptor) -> Result<Vec<ChannelView>, NodeError> {
        let api_error = |message: String| NodeError::Api {
            node: node.name.clone(),
            message,
        };

        let response = self
            .client
            .get(Self::channels_url(node))
            .send()
            .await
            .map_err(|e| api_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(api_error(format!("HTTP {}", response.status().as_u16())));
        }
        response
            .json::<Vec<ChannelView>>()
            .await
            .map_err(|e| api_error(format!("invalid channel list: {}", e)))
    }
}

#[async_trait]
impl NodeApi for HttpNodeApi {
    async fn transfer(
        &self,
        source: &NodeDescriptor,
        target: &Address,
        token: &Address,
        amount: Amount,
    ) -> Result<(), NodeError> {
        let url = Self::transfer_url(source, token, target);
        let body = TransferRequest {
            amount,
            fee: 0,
            is_direct: false,
        };
        let request = self.client.post(&url).json(&body);
        let node = source.name.clone();

        debug!("{} sends {} of {} to {}", node, amount, token.short(), target.short());
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Transfer request to {} accepted", node);
                }
                Ok(response) => {
                    warn!(
                        "Transfer request to {} returned HTTP {}",
                        node,
                        response.status().as_u16()
                    );
                }
                Err(e) => warn!("Transfer request to {} failed: {}", node, e),
            }
        });
        Ok(())
    }

    async fn is_ready(&self, node: &NodeDescriptor) -> bool {
        self.channels(node).await.is_ok()
    }

    async fn channel_view(
        &self,
        node: &NodeDescriptor,
        partner: &Address,
        token: &Address,
    ) -> Result<Option<ChannelView>, NodeError> {
        Ok(self
            .channels(node)
            .await?
            .into_iter()
            .find(|c| c.partner == *partner && c.token == *token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let node = NodeDescriptor {
            name: "N2".into(),
            address: Address::new([2; 20]),
            api_host: "127.0.0.1:6002".into(),
            listen_host: "127.0.0.1:60020".into(),
        };
        let token = Address::new([7; 20]);
        let target = Address::new([6; 20]);

        assert_eq!(
            HttpNodeApi::transfer_url(&node, &token, &target),
            format!("http://127.0.0.1:6002/api/1/transfers/{}/{}", token, target)
        );
        assert_eq!(
            HttpNodeApi::channels_url(&node),
            "http://127.0.0.1:6002/api/1/channels"
        );
    }

    #[test]
    fn test_transfer_body() {
        let body = serde_json::to_value(TransferRequest {
            amount: 45,
            fee: 0,
            is_direct: false,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"amount": 45, "fee": 0, "is_direct": false}));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_api_error() {
        let api = HttpNodeApi::new(Duration::from_millis(200)).unwrap();
        let node = NodeDescriptor {
            name: "N9".into(),
            address: Address::new([9; 20]),
            api_host: "127.0.0.1:1".into(),
            listen_host: "127.0.0.1:10".into(),
        };
        let err = api
            .channel_view(&node, &Address::new([2; 20]), &Address::new([7; 20]))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Api { node, .. } if node == "N9"));
        assert!(!api.is_ready(&node).await);
    }
}
