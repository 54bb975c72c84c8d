// Shared fixtures: a four-node send06 environment on the in-process dev chain
// and a simulated node network implementing both node seams.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pcn_testing_framework::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use tempfile::TempDir;

pub const TOKEN: &str = "T1";
pub const DEPOSIT: Amount = 300;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn account(seed: u8, name: &str) -> Account {
    Account::from_secret([seed; 32], Some(name.to_string()))
}

/// Environment ready to provision on a [`DevChain`]
pub struct Fixture {
    pub chain: Arc<DevChain>,
    pub keys: Arc<KeyStore>,
    pub deployer: Address,
    pub config: EnvConfig,
    pub data: TempDir,
}

impl Fixture {
    /// N2, N3, N6, N7 with channels N2-N3, N3-N6, N2-N7, N3-N7 on a fresh token
    pub fn send06() -> Self {
        let deployer = account(1, "deployer");
        let nodes = [
            ("N2", account(2, "N2")),
            ("N3", account(3, "N3")),
            ("N6", account(6, "N6")),
            ("N7", account(7, "N7")),
        ];
        let data = tempfile::tempdir().unwrap();

        let mut config = EnvConfig::new("CrashCaseSend06");
        config.eth_rpc_endpoint = "dev".into();
        config.data_dir = data.path().join(".photon");
        config.logs_path = data.path().join("log");
        config.deployer = Some(deployer.address());
        config.nodes = nodes
            .iter()
            .enumerate()
            .map(|(i, (name, account))| NodeConfig {
                name: name.to_string(),
                address: account.address(),
                api_host: format!("127.0.0.1:{}", 6000 + i),
                listen_host: None,
            })
            .collect();
        config.tokens = vec![TokenConfig {
            name: TOKEN.into(),
            address: ContractRef::New,
        }];
        config.channels = [("N2", "N3"), ("N3", "N6"), ("N2", "N7"), ("N3", "N7")]
            .into_iter()
            .map(|(a, b)| ChannelConfig {
                a: a.into(),
                b: b.into(),
                token: TOKEN.into(),
                deposit_a: DEPOSIT,
                deposit_b: DEPOSIT,
                settle_timeout: 100,
            })
            .collect();

        let deployer_address = deployer.address();
        let keys = KeyStore::from_accounts(
            std::iter::once(deployer).chain(nodes.into_iter().map(|(_, a)| a)),
        );
        Self {
            chain: Arc::new(DevChain::new()),
            keys: Arc::new(keys),
            deployer: deployer_address,
            config,
            data,
        }
    }

    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            self.chain.clone(),
            self.keys.clone(),
            self.config.provisioning.clone(),
        )
    }

    /// Provision with a throwaway controller
    pub async fn provision(&self) -> TestTopology {
        let nodes = SimNetwork::default();
        self.provisioner()
            .provision(&self.config, &nodes)
            .await
            .unwrap()
    }
}

/// Lock held by `locker` in its channel with `partner`
#[derive(Debug, Clone, Copy)]
pub struct Lock {
    pub locker: &'static str,
    pub partner: &'static str,
    pub amount: Amount,
}

pub fn lock(locker: &'static str, partner: &'static str, amount: Amount) -> Lock {
    Lock {
        locker,
        partner,
        amount,
    }
}

#[derive(Default)]
struct SimState {
    names: HashMap<Address, String>,
    channels: HashSet<(String, String)>,
    running: HashMap<String, bool>,
    armed: HashMap<String, CrashCheckpoint>,
    locks: HashMap<(String, String), Amount>,
    crash_fires: bool,
    crash_delay: Duration,
    // name -> API startup delay, `None` for never
    startup: HashMap<String, Option<Duration>>,
    started_at: HashMap<String, tokio::time::Instant>,
    on_transfer: Vec<Lock>,
    on_restart: VecDeque<Vec<Lock>>,
    started: Vec<String>,
    restarts: Vec<String>,
    transfers: Vec<(String, Address, Amount)>,
    kill_all_calls: usize,
}

impl SimState {
    fn ready(&self, name: &str) -> bool {
        if !self.running.get(name).copied().unwrap_or(false) {
            return false;
        }
        match (self.startup.get(name), self.started_at.get(name)) {
            (None, _) => true,
            (Some(Some(delay)), Some(at)) => at.elapsed() >= *delay,
            _ => false,
        }
    }

    fn apply(&mut self, locks: &[Lock]) {
        for l in locks {
            self.locks
                .insert((l.locker.to_string(), l.partner.to_string()), l.amount);
        }
    }
}

/// Simulated nodes
///
/// An armed node goes down `crash_delay` after a transfer is triggered, unless
/// the crash is disabled. Scripted locks are applied on the transfer and on
/// each restart. A node with a startup delay refuses API calls until the delay
/// has passed since it was started.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new(topology: &TestTopology) -> Self {
        let sim = Self::default();
        {
            let mut state = sim.state.lock();
            state.crash_fires = true;
            for node in &topology.nodes {
                state.names.insert(node.address, node.name.clone());
            }
            for channel in &topology.channels {
                state.channels.insert(pair(&channel.a, &channel.b));
            }
        }
        sim
    }

    pub fn crash_fires(self, fires: bool) -> Self {
        self.state.lock().crash_fires = fires;
        self
    }

    pub fn crash_delay(self, delay: Duration) -> Self {
        self.state.lock().crash_delay = delay;
        self
    }

    pub fn ready_after(self, node: &str, delay: Duration) -> Self {
        self.state.lock().startup.insert(node.to_string(), Some(delay));
        self
    }

    pub fn never_ready(self, node: &str) -> Self {
        self.state.lock().startup.insert(node.to_string(), None);
        self
    }

    pub fn on_transfer(self, locks: Vec<Lock>) -> Self {
        self.state.lock().on_transfer = locks;
        self
    }

    pub fn on_restart(self, locks: Vec<Lock>) -> Self {
        self.state.lock().on_restart.push_back(locks);
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.state.lock().restarts.clone()
    }

    pub fn armed_checkpoint(&self, node: &str) -> Option<CrashCheckpoint> {
        self.state.lock().armed.get(node).cloned()
    }

    pub fn transfers(&self) -> Vec<(String, Address, Amount)> {
        self.state.lock().transfers.clone()
    }

    pub fn kill_all_calls(&self) -> usize {
        self.state.lock().kill_all_calls
    }

    pub fn set_running(&self, node: &str, running: bool) {
        self.state.lock().running.insert(node.to_string(), running);
    }
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[async_trait]
impl NodeController for SimNetwork {
    async fn start(&self, node: &NodeDescriptor) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        if state.running.get(&node.name).copied().unwrap_or(false) {
            return Err(NodeError::AlreadyRunning(node.name.clone()));
        }
        state.running.insert(node.name.clone(), true);
        state
            .started_at
            .insert(node.name.clone(), tokio::time::Instant::now());
        state.started.push(node.name.clone());
        Ok(())
    }

    async fn start_with_crash_condition(
        &self,
        node: &NodeDescriptor,
        checkpoint: &CrashCheckpoint,
    ) -> Result<(), NodeError> {
        self.start(node).await?;
        self.state
            .lock()
            .armed
            .insert(node.name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn is_running(&self, node: &NodeDescriptor) -> Result<bool, NodeError> {
        Ok(self
            .state
            .lock()
            .running
            .get(&node.name)
            .copied()
            .unwrap_or(false))
    }

    async fn restart(&self, node: &NodeDescriptor) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.armed.remove(&node.name);
        state.running.insert(node.name.clone(), true);
        state
            .started_at
            .insert(node.name.clone(), tokio::time::Instant::now());
        state.restarts.push(node.name.clone());
        if let Some(locks) = state.on_restart.pop_front() {
            state.apply(&locks);
        }
        Ok(())
    }

    async fn stop(&self, node: &NodeDescriptor) -> Result<(), NodeError> {
        self.state.lock().running.insert(node.name.clone(), false);
        Ok(())
    }

    async fn kill_all(&self) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        for running in state.running.values_mut() {
            *running = false;
        }
        state.kill_all_calls += 1;
        Ok(())
    }
}

#[async_trait]
impl NodeApi for SimNetwork {
    async fn transfer(
        &self,
        source: &NodeDescriptor,
        target: &Address,
        _token: &Address,
        amount: Amount,
    ) -> Result<(), NodeError> {
        let (armed, fires, delay) = {
            let mut state = self.state.lock();
            if !state.ready(&source.name) {
                return Err(NodeError::Api {
                    node: source.name.clone(),
                    message: "connection refused".into(),
                });
            }
            state.transfers.push((source.name.clone(), *target, amount));
            let locks = state.on_transfer.clone();
            state.apply(&locks);
            (
                state.armed.keys().cloned().collect::<Vec<_>>(),
                state.crash_fires,
                state.crash_delay,
            )
        };
        if !fires {
            return Ok(());
        }
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state.lock();
            for node in armed {
                state.running.insert(node, false);
            }
        });
        Ok(())
    }

    async fn is_ready(&self, node: &NodeDescriptor) -> bool {
        self.state.lock().ready(&node.name)
    }

    async fn channel_view(
        &self,
        node: &NodeDescriptor,
        partner: &Address,
        token: &Address,
    ) -> Result<Option<ChannelView>, NodeError> {
        let state = self.state.lock();
        let Some(partner_name) = state.names.get(partner).cloned() else {
            return Ok(None);
        };
        if !state.channels.contains(&pair(&node.name, &partner_name)) {
            return Ok(None);
        }
        let locked = |locker: &str, other: &str| {
            state
                .locks
                .get(&(locker.to_string(), other.to_string()))
                .copied()
                .unwrap_or(0)
        };
        Ok(Some(ChannelView {
            partner: *partner,
            token: *token,
            balance: DEPOSIT,
            partner_balance: DEPOSIT,
            locked_amount: locked(&node.name, &partner_name),
            partner_locked_amount: locked(&partner_name, &node.name),
            state: "opened".into(),
        }))
    }
}
