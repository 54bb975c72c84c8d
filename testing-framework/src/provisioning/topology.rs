// File: testing-framework/src/provisioning/topology.rs
//
// Test Topology
//
// The provisioned environment handed to scenarios: named nodes, tokens with
// their contract addresses, and the channels that were opened. Built once by
// the provisioner and read-only afterwards.

use crate::config::{ChannelConfig, EnvConfig, NodeConfig};
use crate::types::{amount_serde, Address, Amount};
use serde::{Deserialize, Serialize};

/// A node of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique name
    pub name: String,
    /// Account address
    pub address: Address,
    /// API endpoint, `host:port`
    pub api_host: String,
    /// Protocol listen endpoint
    pub listen_host: String,
}

impl NodeDescriptor {
    /// Base URL of the node API
    pub fn api_url(&self) -> String {
        if self.api_host.starts_with("http://") || self.api_host.starts_with("https://") {
            self.api_host.clone()
        } else {
            format!("http://{}", self.api_host)
        }
    }
}

impl From<&NodeConfig> for NodeDescriptor {
    fn from(node: &NodeConfig) -> Self {
        Self {
            name: node.name.clone(),
            address: node.address,
            api_host: node.api_host.clone(),
            listen_host: node.listen_host(),
        }
    }
}

/// A token of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDescriptor {
    /// Unique name
    pub name: String,
    /// Token contract address
    pub address: Address,
    /// Deployed by this run (`false` when reused)
    pub deployed: bool,
}

/// A channel opened during provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// First participant name
    pub a: String,
    /// Second participant name
    pub b: String,
    /// Token name
    pub token: String,
    /// Deposit of `a`
    #[serde(with = "amount_serde")]
    pub deposit_a: Amount,
    /// Deposit of `b`
    #[serde(with = "amount_serde")]
    pub deposit_b: Amount,
    /// Settlement timeout
    pub settle_timeout: u64,
}

impl ChannelSpec {
    /// Whether this channel joins `x` and `y`, in either order
    pub fn joins(&self, x: &str, y: &str) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

impl From<&ChannelConfig> for ChannelSpec {
    fn from(channel: &ChannelConfig) -> Self {
        Self {
            a: channel.a.clone(),
            b: channel.b.clone(),
            token: channel.token.clone(),
            deposit_a: channel.deposit_a,
            deposit_b: channel.deposit_b,
            settle_timeout: channel.settle_timeout,
        }
    }
}

/// Provisioned environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTopology {
    /// Case name of the environment
    pub case_name: String,
    /// Settlement contract address
    pub settlement: Address,
    /// Nodes in configuration order
    pub nodes: Vec<NodeDescriptor>,
    /// Tokens in configuration order
    pub tokens: Vec<TokenDescriptor>,
    /// Channels that were opened
    pub channels: Vec<ChannelSpec>,
}

impl TestTopology {
    /// Topology with the nodes of `config` and no tokens or channels yet
    pub fn from_config(config: &EnvConfig, settlement: Address) -> Self {
        Self {
            case_name: config.case_name.clone(),
            settlement,
            nodes: config.nodes.iter().map(NodeDescriptor::from).collect(),
            tokens: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Node by name
    pub fn node(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Node by account address
    pub fn node_by_address(&self, address: &Address) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.address == *address)
    }

    /// Token by name
    pub fn token(&self, name: &str) -> Option<&TokenDescriptor> {
        self.tokens.iter().find(|t| t.name == name)
    }

    /// Channel joining `x` and `y` on `token`
    pub fn channel_between(&self, x: &str, y: &str, token: &str) -> Option<&ChannelSpec> {
        self.channels
            .iter()
            .find(|c| c.token == token && c.joins(x, y))
    }

    /// Whether any token was reused instead of deployed
    pub fn uses_reused_token(&self) -> bool {
        self.tokens.iter().any(|t| !t.deployed)
    }

    /// Pretty JSON for the structured log dump
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
