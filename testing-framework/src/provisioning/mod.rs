// File: testing-framework/src/provisioning/mod.rs
//
// Provisioner
//
// Builds the on-chain side of a test environment from an `EnvConfig`:
//
// 1. Resolve or deploy the settlement contract
// 2. Resolve or deploy each token; fresh tokens fund every node account in
//    parallel, one task per account
// 3. Open every configured channel in parallel, one task per non-zero side:
//    ensure allowance, deposit, wait for it to be mined
// 4. Kill stale node processes and clear persisted node state
//
// Every step is fatal on error. There is no rollback; provisioning again is
// the recovery path.

/// Allowance memo shared by deposit workers
pub mod allowance;
/// Persisted node state removal
pub mod cleanup;
/// Per-account sequence numbers
pub mod nonce;
/// Provisioned topology description
pub mod topology;

pub use allowance::{AllowanceCache, AllowanceKey, AllowanceOutcome};
pub use nonce::NonceAllocator;
pub use topology::{ChannelSpec, NodeDescriptor, TestTopology, TokenDescriptor};

use crate::chain::{Call, ChainClient, ChainError, ContractKind};
use crate::config::{ConfigError, ContractRef, EnvConfig, ProvisionSettings, TokenConfig};
use crate::keystore::{Account, KeyStore, KeyStoreError};
use crate::node::{NodeController, NodeError};
use crate::orchestrator::{PhaseFailure, TaskGroup};
use crate::types::{Address, Amount};
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

/// Provisioning failures; each one aborts the whole run
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invalid configuration or topology
    #[error("Invalid topology: {0}")]
    Config(#[from] ConfigError),

    /// Keystore problem (no deployer account, ...)
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// A configured node has no key in the keystore
    #[error("No keystore account for node {node} ({address})")]
    MissingAccount {
        /// Node name
        node: String,
        /// Node address
        address: Address,
    },

    /// A chain call failed
    #[error("Chain call failed during {step}: {source}")]
    Chain {
        /// What was being done
        step: String,
        /// Underlying error
        #[source]
        source: ChainError,
    },

    /// A contract deployment failed
    #[error("Failed to deploy {contract}: {source}")]
    DeployFailed {
        /// Contract description
        contract: String,
        /// Underlying error
        #[source]
        source: ChainError,
    },

    /// A configured contract address has no code
    #[error("No contract code at {0}")]
    NoContract(Address),

    /// A funding transfer failed
    #[error("Failed to fund {account}: {source}")]
    FundingFailed {
        /// Recipient
        account: Address,
        /// Underlying error
        #[source]
        source: ChainError,
    },

    /// An approval for a deposit failed
    #[error("Approval for channel {channel} by {owner} failed: {source}")]
    ApprovalFailed {
        /// Channel label
        channel: String,
        /// Depositing account
        owner: Address,
        /// Underlying error
        #[source]
        source: ChainError,
    },

    /// A channel deposit failed
    #[error("Deposit into channel {channel} by {owner} failed: {source}")]
    DepositFailed {
        /// Channel label
        channel: String,
        /// Depositing account
        owner: Address,
        /// Underlying error
        #[source]
        source: ChainError,
    },

    /// One or more workers of a parallel phase failed
    #[error(transparent)]
    Phase(#[from] PhaseFailure),

    /// Stale node processes could not be killed
    #[error("Cleanup failed: {0}")]
    Node(#[from] NodeError),

    /// Persisted node state could not be removed
    #[error("Cannot clear node data: {0}")]
    Io(#[from] std::io::Error),
}

fn chain_step(step: impl Into<String>) -> impl FnOnce(ChainError) -> ProvisionError {
    let step = step.into();
    move |source| ProvisionError::Chain { step, source }
}

/// Per-run provisioning orchestrator
///
/// Owns the run's [`NonceAllocator`] and [`AllowanceCache`]; two provisioners
/// in the same process share nothing.
pub struct Provisioner {
    chain: Arc<dyn ChainClient>,
    keys: Arc<KeyStore>,
    nonces: Arc<NonceAllocator>,
    allowances: Arc<AllowanceCache>,
    settings: ProvisionSettings,
}

impl Provisioner {
    /// Provisioner submitting through `chain` with keys from `keys`
    pub fn new(chain: Arc<dyn ChainClient>, keys: Arc<KeyStore>, settings: ProvisionSettings) -> Self {
        let nonces = Arc::new(NonceAllocator::new(chain.clone()));
        let allowances = Arc::new(AllowanceCache::new(
            chain.clone(),
            nonces.clone(),
            settings.allowance_multiplier,
        ));
        Self {
            chain,
            keys,
            nonces,
            allowances,
            settings,
        }
    }

    /// Chain handle, shared with the state probe
    pub fn chain(&self) -> Arc<dyn ChainClient> {
        self.chain.clone()
    }

    /// Nonce allocator of this run
    pub fn nonces(&self) -> &Arc<NonceAllocator> {
        &self.nonces
    }

    /// Allowance cache of this run
    pub fn allowances(&self) -> &Arc<AllowanceCache> {
        &self.allowances
    }

    /// Provisioning tunables
    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Provision `config` and return the resulting topology
    pub async fn provision(
        &self,
        config: &EnvConfig,
        nodes: &dyn NodeController,
    ) -> Result<TestTopology, ProvisionError> {
        config.validate()?;
        info!("Start to prepare env for {}...", config.case_name);

        let deployer = self.keys.deployer(config.deployer)?;
        self.check_node_accounts(config)?;

        let settlement = self
            .resolve_settlement(&deployer, config.settlement_contract)
            .await?;
        info!("Load settlement contract SUCCESS: {}", settlement);

        let mut topology = TestTopology::from_config(config, settlement);
        info!("Load Nodes SUCCESS");

        let recipients: Vec<Address> = topology.nodes.iter().map(|n| n.address).collect();
        for token in &config.tokens {
            let descriptor = self.resolve_token(&deployer, token, &recipients).await?;
            topology.tokens.push(descriptor);
        }
        info!("Load Tokens SUCCESS");

        topology.channels = self.open_channels(&topology, config).await?;

        self.cleanup(config, nodes).await?;

        info!("Env Prepare SUCCESS");
        Ok(topology)
    }

    fn check_node_accounts(&self, config: &EnvConfig) -> Result<(), ProvisionError> {
        for node in &config.nodes {
            if !self.keys.contains(&node.address) {
                return Err(ProvisionError::MissingAccount {
                    node: node.name.clone(),
                    address: node.address,
                });
            }
        }
        Ok(())
    }

    /// Deploy the settlement contract or verify the configured one
    pub async fn resolve_settlement(
        &self,
        deployer: &Account,
        contract: ContractRef,
    ) -> Result<Address, ProvisionError> {
        match contract {
            ContractRef::New => {
                let nonce = self
                    .nonces
                    .lease(&deployer.address())
                    .await
                    .map_err(chain_step("settlement deployment nonce"))?;
                let address = self
                    .chain
                    .deploy_contract(deployer, nonce, ContractKind::Settlement)
                    .await
                    .map_err(|source| ProvisionError::DeployFailed {
                        contract: "settlement contract".to_string(),
                        source,
                    })?;
                info!("deploy settlement contract complete... address={}", address);
                Ok(address)
            }
            ContractRef::Existing(address) => {
                let exists = self
                    .chain
                    .code_exists(&address)
                    .await
                    .map_err(chain_step("settlement lookup"))?;
                if !exists {
                    return Err(ProvisionError::NoContract(address));
                }
                Ok(address)
            }
        }
    }

    /// Deploy and fund a fresh token, or reuse an existing one
    pub async fn resolve_token(
        &self,
        deployer: &Arc<Account>,
        token: &TokenConfig,
        recipients: &[Address],
    ) -> Result<TokenDescriptor, ProvisionError> {
        match token.address {
            ContractRef::New => {
                let nonce = self
                    .nonces
                    .lease(&deployer.address())
                    .await
                    .map_err(chain_step("token deployment nonce"))?;
                let address = self
                    .chain
                    .deploy_contract(
                        deployer,
                        nonce,
                        ContractKind::Token {
                            initial_supply: self.settings.token_initial_supply,
                            symbol: self.settings.token_symbol.clone(),
                            decimals: self.settings.token_decimals,
                        },
                    )
                    .await
                    .map_err(|source| ProvisionError::DeployFailed {
                        contract: format!("token {}", token.name),
                        source,
                    })?;
                info!("New Token {} = {}", token.name, address);

                self.fund_accounts(deployer, &address, recipients).await?;
                Ok(TokenDescriptor {
                    name: token.name.clone(),
                    address,
                    deployed: true,
                })
            }
            ContractRef::Existing(address) => {
                info!("Reusing token {} = {}", token.name, address);
                Ok(TokenDescriptor {
                    name: token.name.clone(),
                    address,
                    deployed: false,
                })
            }
        }
    }

    /// Transfer the funding amount of `token` to every recipient in parallel
    pub async fn fund_accounts(
        &self,
        deployer: &Arc<Account>,
        token: &Address,
        recipients: &[Address],
    ) -> Result<(), ProvisionError> {
        let amount = self.settings.funding_amount;
        let mut group = TaskGroup::new(format!("funding {}", token.short()));

        for recipient in recipients.iter().copied() {
            let chain = self.chain.clone();
            let nonces = self.nonces.clone();
            let deployer = deployer.clone();
            let token = *token;
            group.spawn(format!("fund {}", recipient.short()), async move {
                let fail = |source| ProvisionError::FundingFailed {
                    account: recipient,
                    source,
                };
                let nonce = nonces.lease(&deployer.address()).await.map_err(fail)?;
                let tx = chain
                    .send_transaction(
                        &deployer,
                        nonce,
                        Call::Transfer {
                            token,
                            to: recipient,
                            amount,
                        },
                    )
                    .await
                    .map_err(fail)?;
                chain.wait_mined(&tx).await.map_err(fail)?;
                Ok::<_, ProvisionError>(())
            });
        }
        group.join().await?;

        for recipient in recipients {
            let balance = self
                .chain
                .token_balance(token, recipient)
                .await
                .map_err(chain_step("balance check"))?;
            info!("account {} has token {}", recipient.short(), balance);
        }
        Ok(())
    }

    /// Open every configured channel, one task per non-zero side
    pub async fn open_channels(
        &self,
        topology: &TestTopology,
        config: &EnvConfig,
    ) -> Result<Vec<ChannelSpec>, ProvisionError> {
        let specs: Vec<ChannelSpec> = config.channels.iter().map(ChannelSpec::from).collect();
        if specs.is_empty() {
            return Ok(specs);
        }
        if self.settings.skip_channels_on_reused_tokens && topology.uses_reused_token() {
            warn!("use old token, do not create channel...");
            return Ok(specs);
        }

        let mut group = TaskGroup::new("channel deposits");
        for spec in &specs {
            let label = format!("{}-{}@{}", spec.a, spec.b, spec.token);
            let token = topology
                .token(&spec.token)
                .ok_or_else(|| ConfigError::UnknownToken {
                    channel: label.clone(),
                    token: spec.token.clone(),
                })?
                .address;
            let a = self.node_account(topology, &spec.a, &label)?;
            let b = self.node_account(topology, &spec.b, &label)?;

            info!(
                "createchannel between {}-{}, token={}",
                a.address().short(),
                b.address().short(),
                token.short()
            );

            for (owner, partner, amount) in [
                (a.clone(), b.address(), spec.deposit_a),
                (b.clone(), a.address(), spec.deposit_b),
            ] {
                if amount == 0 {
                    continue;
                }
                let side = DepositSide {
                    chain: self.chain.clone(),
                    nonces: self.nonces.clone(),
                    allowances: self.allowances.clone(),
                    settlement: topology.settlement,
                    token,
                    owner,
                    partner,
                    amount,
                    settle_timeout: spec.settle_timeout,
                    channel: label.clone(),
                };
                group.spawn(
                    format!("{} side {}", label, side.owner.address().short()),
                    side.run(),
                );
            }
        }
        group.join().await?;

        info!("Load and create channels SUCCESS");
        Ok(specs)
    }

    fn node_account(
        &self,
        topology: &TestTopology,
        name: &str,
        channel: &str,
    ) -> Result<Arc<Account>, ProvisionError> {
        let node = topology.node(name).ok_or_else(|| ConfigError::UnknownNode {
            channel: channel.to_string(),
            node: name.to_string(),
        })?;
        self.keys
            .get(&node.address)
            .map_err(|_| ProvisionError::MissingAccount {
                node: node.name.clone(),
                address: node.address,
            })
    }

    /// Kill stale nodes and clear their persisted state
    pub async fn cleanup(
        &self,
        config: &EnvConfig,
        nodes: &dyn NodeController,
    ) -> Result<(), ProvisionError> {
        nodes.kill_all().await?;
        if let Some(name) = config.data_dir.file_name() {
            cleanup::clear_history_data(&config.data_dir, name)?;
        }
        Ok(())
    }
}

/// One side of one channel: approve if needed, deposit, wait
struct DepositSide {
    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
    allowances: Arc<AllowanceCache>,
    settlement: Address,
    token: Address,
    owner: Arc<Account>,
    partner: Address,
    amount: Amount,
    settle_timeout: u64,
    channel: String,
}

impl DepositSide {
    async fn run(self) -> Result<(), ProvisionError> {
        let owner = self.owner.address();
        self.allowances
            .ensure_allowance(&self.owner, &self.settlement, &self.token, self.amount)
            .await
            .map_err(|source| ProvisionError::ApprovalFailed {
                channel: self.channel.clone(),
                owner,
                source,
            })?;

        let deposit_failed = |source| ProvisionError::DepositFailed {
            channel: self.channel.clone(),
            owner,
            source,
        };
        let nonce = self.nonces.lease(&owner).await.map_err(deposit_failed)?;
        let tx = self
            .chain
            .send_transaction(
                &self.owner,
                nonce,
                Call::Deposit {
                    settlement: self.settlement,
                    token: self.token,
                    participant: owner,
                    partner: self.partner,
                    amount: self.amount,
                    settle_timeout: self.settle_timeout,
                },
            )
            .await
            .map_err(deposit_failed)?;
        self.chain.wait_mined(&tx).await.map_err(deposit_failed)?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "{} deposited {} into {} with {}",
                owner.short(),
                self.amount,
                self.channel,
                self.partner.short()
            );
        }
        Ok(())
    }
}
