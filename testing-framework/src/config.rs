// File: testing-framework/src/config.rs
//
// Test Environment Configuration
//
// One YAML document describes a test environment: where the node executable
// and keystore live, which chain endpoint to use, and the node/token/channel
// topology to provision. Every tunable that used to be a hardcoded constant
// (funding amount, allowance multiplier, crash and recovery intervals) has a
// default here and can be overridden per environment or per scenario.

use crate::types::{amount_serde, Address, Amount};
use log::debug;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default values for configuration
pub mod defaults {
    use crate::types::Amount;

    pub const CASE_NAME: &str = "DefaultName";
    pub const NODE_EXECUTABLE: &str = "photon";
    pub const DATA_DIR: &str = ".photon";
    pub const KEYSTORE_PATH: &str = "testdata/casemanager-keystore";
    pub const ETH_RPC_ENDPOINT: &str = "http://127.0.0.1:8545";
    pub const LOGS_PATH: &str = "log";
    pub const VERBOSITY: u8 = 5;
    pub const DEBUG: bool = true;

    // Provisioning
    pub const FUNDING_AMOUNT: Amount = 5_000_000;
    pub const ALLOWANCE_MULTIPLIER: u32 = 100;
    pub const TOKEN_INITIAL_SUPPLY: Amount = 500_000_000;
    pub const TOKEN_SYMBOL: &str = "TST";
    pub const TOKEN_DECIMALS: u8 = 0;
    pub const SKIP_CHANNELS_ON_REUSED_TOKENS: bool = true;

    // Scenario timing
    pub const CRASH_GRACE_MS: u64 = 3_000;
    pub const RECOVERY_MS: u64 = 30_000;
    pub const LIVENESS_POLL_MS: u64 = 500;
    pub const STARTUP_MS: u64 = 15_000;
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Cannot read config {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// YAML could not be parsed
    #[error("Invalid config {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },

    /// Two nodes share a name
    #[error("Duplicate node name '{0}'")]
    DuplicateNode(String),

    /// Two tokens share a name
    #[error("Duplicate token name '{0}'")]
    DuplicateToken(String),

    /// A channel references an unknown node
    #[error("Channel {channel} references unknown node '{node}'")]
    UnknownNode {
        /// Channel label
        channel: String,
        /// Missing node
        node: String,
    },

    /// A channel references an unknown token
    #[error("Channel {channel} references unknown token '{token}'")]
    UnknownToken {
        /// Channel label
        channel: String,
        /// Missing token
        token: String,
    },

    /// A channel names the same node twice
    #[error("Channel {0} has identical participants")]
    SelfChannel(String),

    /// Any other invalid value
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

/// A contract that is either freshly deployed or reused at a known address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractRef {
    /// Deploy a fresh contract (`"new"`)
    New,
    /// Reuse the contract at this address
    Existing(Address),
}

impl ContractRef {
    /// Whether this asks for a fresh deployment
    pub fn is_new(&self) -> bool {
        matches!(self, ContractRef::New)
    }
}

impl Default for ContractRef {
    fn default() -> Self {
        ContractRef::New
    }
}

impl fmt::Display for ContractRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractRef::New => f.write_str("new"),
            ContractRef::Existing(address) => write!(f, "{}", address),
        }
    }
}

impl Serialize for ContractRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContractRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.trim().eq_ignore_ascii_case("new") {
            return Ok(ContractRef::New);
        }
        s.parse().map(ContractRef::Existing).map_err(de::Error::custom)
    }
}

/// One node of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name (`N2`)
    pub name: String,
    /// Node account address; its key must be in the keystore
    pub address: Address,
    /// API endpoint, `host:port`
    pub api_host: String,
    /// Protocol listen endpoint; defaults to the API endpoint with a trailing `0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_host: Option<String>,
}

impl NodeConfig {
    /// Effective listen endpoint
    pub fn listen_host(&self) -> String {
        self.listen_host
            .clone()
            .unwrap_or_else(|| format!("{}0", self.api_host))
    }
}

/// One token of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Unique token name
    pub name: String,
    /// `"new"` or the address of an existing token
    #[serde(default)]
    pub address: ContractRef,
}

/// One bidirectionally funded channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// First participant (node name)
    pub a: String,
    /// Second participant (node name)
    pub b: String,
    /// Token name
    pub token: String,
    /// Deposit of `a`
    #[serde(with = "amount_serde")]
    pub deposit_a: Amount,
    /// Deposit of `b`
    #[serde(with = "amount_serde")]
    pub deposit_b: Amount,
    /// Settlement timeout in blocks
    pub settle_timeout: u64,
}

impl ChannelConfig {
    /// `a-b@token`
    pub fn label(&self) -> String {
        format!("{}-{}@{}", self.a, self.b, self.token)
    }
}

/// Provisioning tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionSettings {
    /// Tokens transferred to every node account for a fresh token
    #[serde(default = "default_funding_amount", with = "amount_serde")]
    pub funding_amount: Amount,
    /// Over-provisioning factor applied to every approval
    #[serde(default = "default_allowance_multiplier")]
    pub allowance_multiplier: u32,
    /// Supply minted to the deployer for a fresh token
    #[serde(default = "default_token_initial_supply", with = "amount_serde")]
    pub token_initial_supply: Amount,
    /// Symbol of fresh tokens
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,
    /// Decimals of fresh tokens
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,
    /// Skip channel creation when any configured token is reused
    #[serde(default = "default_skip_channels_on_reused_tokens")]
    pub skip_channels_on_reused_tokens: bool,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            funding_amount: defaults::FUNDING_AMOUNT,
            allowance_multiplier: defaults::ALLOWANCE_MULTIPLIER,
            token_initial_supply: defaults::TOKEN_INITIAL_SUPPLY,
            token_symbol: defaults::TOKEN_SYMBOL.to_string(),
            token_decimals: defaults::TOKEN_DECIMALS,
            skip_channels_on_reused_tokens: defaults::SKIP_CHANNELS_ON_REUSED_TOKENS,
        }
    }
}

/// Scenario wait intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTiming {
    /// How long the crash checkpoint has to fire after the transfer
    #[serde(default = "default_crash_grace_ms")]
    pub crash_grace_ms: u64,
    /// Hard wait after restarting the crashed node
    #[serde(default = "default_recovery_ms")]
    pub recovery_ms: u64,
    /// Liveness poll period inside the grace window
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
    /// How long a started node has to answer on its API
    #[serde(default = "default_startup_ms")]
    pub startup_ms: u64,
}

impl ScenarioTiming {
    /// Crash grace interval
    pub fn crash_grace(&self) -> Duration {
        Duration::from_millis(self.crash_grace_ms)
    }

    /// Recovery interval
    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }

    /// Startup readiness timeout
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// Liveness poll interval, never zero
    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms.max(1))
    }
}

impl Default for ScenarioTiming {
    fn default() -> Self {
        Self {
            crash_grace_ms: defaults::CRASH_GRACE_MS,
            recovery_ms: defaults::RECOVERY_MS,
            liveness_poll_ms: defaults::LIVENESS_POLL_MS,
            startup_ms: defaults::STARTUP_MS,
        }
    }
}

/// Complete description of a test environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Name used for log sinks and reports
    #[serde(default = "default_case_name")]
    pub case_name: String,
    /// Node executable
    #[serde(default = "default_node_executable")]
    pub node_executable: PathBuf,
    /// Per-node persisted state directory name
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Keystore directory
    #[serde(default = "default_keystore_path")]
    pub keystore_path: PathBuf,
    /// Password file for the keystore, passed through to nodes as well
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    /// Chain RPC endpoint
    #[serde(default = "default_eth_rpc_endpoint")]
    pub eth_rpc_endpoint: String,
    /// Settlement contract: `"new"` or an existing address
    #[serde(default)]
    pub settlement_contract: ContractRef,
    /// Account that deploys and funds; defaults to the first keystore account
    #[serde(default)]
    pub deployer: Option<Address>,
    /// Node log verbosity
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
    /// Debug mode: leave nodes running after a case
    #[serde(default = "default_debug")]
    pub debug: bool,
    /// Directory for per-case and per-node logs
    #[serde(default = "default_logs_path")]
    pub logs_path: PathBuf,
    /// Nodes, in configuration order
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Tokens, in configuration order
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    /// Channels to open
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Provisioning tunables
    #[serde(default)]
    pub provisioning: ProvisionSettings,
}

// Default functions for serde
fn default_case_name() -> String {
    defaults::CASE_NAME.to_string()
}
fn default_node_executable() -> PathBuf {
    PathBuf::from(defaults::NODE_EXECUTABLE)
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}
fn default_keystore_path() -> PathBuf {
    PathBuf::from(defaults::KEYSTORE_PATH)
}
fn default_eth_rpc_endpoint() -> String {
    defaults::ETH_RPC_ENDPOINT.to_string()
}
fn default_verbosity() -> u8 {
    defaults::VERBOSITY
}
fn default_debug() -> bool {
    defaults::DEBUG
}
fn default_logs_path() -> PathBuf {
    PathBuf::from(defaults::LOGS_PATH)
}
fn default_funding_amount() -> Amount {
    defaults::FUNDING_AMOUNT
}
fn default_allowance_multiplier() -> u32 {
    defaults::ALLOWANCE_MULTIPLIER
}
fn default_token_initial_supply() -> Amount {
    defaults::TOKEN_INITIAL_SUPPLY
}
fn default_token_symbol() -> String {
    defaults::TOKEN_SYMBOL.to_string()
}
fn default_token_decimals() -> u8 {
    defaults::TOKEN_DECIMALS
}
fn default_skip_channels_on_reused_tokens() -> bool {
    defaults::SKIP_CHANNELS_ON_REUSED_TOKENS
}
fn default_crash_grace_ms() -> u64 {
    defaults::CRASH_GRACE_MS
}
fn default_recovery_ms() -> u64 {
    defaults::RECOVERY_MS
}
fn default_liveness_poll_ms() -> u64 {
    defaults::LIVENESS_POLL_MS
}
fn default_startup_ms() -> u64 {
    defaults::STARTUP_MS
}

impl EnvConfig {
    /// Minimal environment with defaults and no topology
    pub fn new(case_name: impl Into<String>) -> Self {
        Self {
            case_name: case_name.into(),
            node_executable: default_node_executable(),
            data_dir: default_data_dir(),
            keystore_path: default_keystore_path(),
            password_file: None,
            eth_rpc_endpoint: default_eth_rpc_endpoint(),
            settlement_contract: ContractRef::New,
            deployer: None,
            verbosity: defaults::VERBOSITY,
            debug: defaults::DEBUG,
            logs_path: default_logs_path(),
            nodes: Vec::new(),
            tokens: Vec::new(),
            channels: Vec::new(),
            provisioning: ProvisionSettings::default(),
        }
    }

    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Loaded env '{}' from {}: {} nodes, {} tokens, {} channels",
                config.case_name,
                path.display(),
                config.nodes.len(),
                config.tokens.len(),
                config.channels.len()
            );
        }
        Ok(config)
    }

    /// Check the topology invariants and obviously broken values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eth_rpc_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "eth_rpc_endpoint",
                reason: "endpoint is empty".to_string(),
            });
        }
        if self.provisioning.allowance_multiplier == 0 {
            return Err(ConfigError::Invalid {
                field: "provisioning.allowance_multiplier",
                reason: "multiplier must be at least 1".to_string(),
            });
        }

        let mut node_names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "nodes.name",
                    reason: "node name is empty".to_string(),
                });
            }
            if node.api_host.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "nodes.api_host",
                    reason: format!("node {} has no API endpoint", node.name),
                });
            }
            if !node_names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
        }

        let mut token_names = HashSet::new();
        for token in &self.tokens {
            if !token_names.insert(token.name.as_str()) {
                return Err(ConfigError::DuplicateToken(token.name.clone()));
            }
        }

        for channel in &self.channels {
            for node in [&channel.a, &channel.b] {
                if !node_names.contains(node.as_str()) {
                    return Err(ConfigError::UnknownNode {
                        channel: channel.label(),
                        node: node.clone(),
                    });
                }
            }
            if !token_names.contains(channel.token.as_str()) {
                return Err(ConfigError::UnknownToken {
                    channel: channel.label(),
                    token: channel.token.clone(),
                });
            }
            if channel.a == channel.b {
                return Err(ConfigError::SelfChannel(channel.label()));
            }
        }
        Ok(())
    }

    /// Node by name
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Log file of a node process
    pub fn node_log_path(&self, node: &str) -> PathBuf {
        self.logs_path.join(format!("{}.log", node))
    }
}
