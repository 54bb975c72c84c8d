// File: testing-framework/src/node/process.rs
//
// OS-Process Node Controller
//
// Spawns the node executable once per node with its account, endpoints,
// keystore and chain settings. A node armed with a crash checkpoint also gets
// `--debugcrash --conditionquit '{"QuitEvent":"<checkpoint>"}'`. Output of
// each node goes to `<logs>/<node>.log`. Liveness is the real process state,
// read with `try_wait` on the tracked child.

use super::{CrashCheckpoint, NodeController, NodeError};
use crate::config::EnvConfig;
use crate::provisioning::NodeDescriptor;
use crate::types::Address;
use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Everything needed to build a node command line
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// Node executable
    pub executable: PathBuf,
    /// Persisted state directory
    pub data_dir: PathBuf,
    /// Keystore directory
    pub keystore_path: PathBuf,
    /// Keystore password file
    pub password_file: Option<PathBuf>,
    /// Chain RPC endpoint
    pub eth_rpc_endpoint: String,
    /// Settlement contract
    pub settlement: Address,
    /// Node log verbosity
    pub verbosity: u8,
    /// Directory for node log files
    pub logs_path: PathBuf,
    /// Extra arguments appended to every command line
    pub extra_args: Vec<String>,
}

impl ProcessSettings {
    /// Settings for the nodes of `config` using `settlement`
    pub fn from_env(config: &EnvConfig, settlement: Address) -> Self {
        Self {
            executable: config.node_executable.clone(),
            data_dir: config.data_dir.clone(),
            keystore_path: config.keystore_path.clone(),
            password_file: config.password_file.clone(),
            eth_rpc_endpoint: config.eth_rpc_endpoint.clone(),
            settlement,
            verbosity: config.verbosity,
            logs_path: config.logs_path.clone(),
            extra_args: Vec::new(),
        }
    }

    /// Command-line arguments for `node`
    pub fn args(&self, node: &NodeDescriptor, checkpoint: Option<&CrashCheckpoint>) -> Vec<String> {
        let mut args = vec![
            "--datadir".to_string(),
            self.data_dir.display().to_string(),
            "--api-address".to_string(),
            node.api_host.clone(),
            "--listen-address".to_string(),
            node.listen_host.clone(),
            "--address".to_string(),
            node.address.to_string(),
            "--keystore-path".to_string(),
            self.keystore_path.display().to_string(),
            "--registry-contract-address".to_string(),
            self.settlement.to_string(),
            "--eth-rpc-endpoint".to_string(),
            self.eth_rpc_endpoint.clone(),
            "--verbosity".to_string(),
            self.verbosity.to_string(),
            "--debug".to_string(),
        ];
        if let Some(password_file) = &self.password_file {
            args.push("--password-file".to_string());
            args.push(password_file.display().to_string());
        }
        if let Some(checkpoint) = checkpoint {
            args.push("--debugcrash".to_string());
            args.push("--conditionquit".to_string());
            args.push(checkpoint.condition_quit_json());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn check_executable(&self) -> Result<(), NodeError> {
        // Bare names are resolved through PATH at spawn time
        if self.executable.components().count() > 1 && !self.executable.is_file() {
            return Err(NodeError::InvalidExecutable {
                path: self.executable.clone(),
                reason: "not a file".to_string(),
            });
        }
        Ok(())
    }

    fn check_data_dir(&self) -> Result<(), NodeError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(NodeError::InvalidDataDir {
                path: self.data_dir.clone(),
                reason: "path is empty".to_string(),
            });
        }
        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(NodeError::InvalidDataDir {
                path: self.data_dir.clone(),
                reason: "not a directory".to_string(),
            });
        }
        std::fs::create_dir_all(&self.data_dir).map_err(|e| NodeError::InvalidDataDir {
            path: self.data_dir.clone(),
            reason: e.to_string(),
        })
    }

    fn executable_name(&self) -> Option<String> {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Node controller spawning real processes
pub struct ProcessNodeController {
    settings: ProcessSettings,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessNodeController {
    /// Controller for `settings`
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Command-line settings
    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    fn log_file(&self, node: &str) -> Result<(std::fs::File, std::fs::File), NodeError> {
        let io = |source| NodeError::Io {
            node: node.to_string(),
            source,
        };
        std::fs::create_dir_all(&self.settings.logs_path).map_err(io)?;
        let path = self.settings.logs_path.join(format!("{}.log", node));
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io)?;
        let stderr = stdout.try_clone().map_err(io)?;
        Ok((stdout, stderr))
    }

    async fn spawn(
        &self,
        node: &NodeDescriptor,
        checkpoint: Option<&CrashCheckpoint>,
    ) -> Result<(), NodeError> {
        self.settings.check_executable()?;
        self.settings.check_data_dir()?;

        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&node.name) {
            let alive = child
                .try_wait()
                .map_err(|source| NodeError::Io {
                    node: node.name.clone(),
                    source,
                })?
                .is_none();
            if alive {
                return Err(NodeError::AlreadyRunning(node.name.clone()));
            }
        }

        let (stdout, stderr) = self.log_file(&node.name)?;
        let child = Command::new(&self.settings.executable)
            .args(self.settings.args(node, checkpoint))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| NodeError::Spawn {
                node: node.name.clone(),
                source,
            })?;

        match checkpoint {
            Some(checkpoint) => info!(
                "Node {} started (pid {:?}) with crash checkpoint {}",
                node.name,
                child.id(),
                checkpoint
            ),
            None => info!("Node {} started (pid {:?})", node.name, child.id()),
        }
        children.insert(node.name.clone(), child);
        Ok(())
    }
}

#[async_trait]
impl NodeController for ProcessNodeController {
    async fn start(&self, node: &NodeDescriptor) -> Result<(), NodeError> {
        self.spawn(node, None).await
    }

    async fn start_with_crash_condition(
        &self,
        node: &NodeDescriptor,
        checkpoint: &CrashCheckpoint,
    ) -> Result<(), NodeError> {
        self.spawn(node, Some(checkpoint)).await
    }

    async fn is_running(&self, node: &NodeDescriptor) -> Result<bool, NodeError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&node.name) else {
            return Ok(false);
        };
        match child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(status)) => {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Node {} exited with {}", node.name, status);
                }
                Ok(false)
            }
            Err(source) => Err(NodeError::Io {
                node: node.name.clone(),
                source,
            }),
        }
    }

    async fn restart(&self, node: &NodeDescriptor) -> Result<(), NodeError> {
        self.stop(node).await?;
        self.spawn(node, None).await
    }

    async fn stop(&self, node: &NodeDescriptor) -> Result<(), NodeError> {
        let child = self.children.lock().await.remove(&node.name);
        if let Some(mut child) = child {
            if child
                .try_wait()
                .map_err(|source| NodeError::Io {
                    node: node.name.clone(),
                    source,
                })?
                .is_none()
            {
                child.kill().await.map_err(|source| NodeError::Io {
                    node: node.name.clone(),
                    source,
                })?;
                info!("Node {} stopped", node.name);
            }
        }
        Ok(())
    }

    async fn kill_all(&self) -> Result<(), NodeError> {
        let tracked: Vec<(String, Child)> = self.children.lock().await.drain().collect();
        for (name, mut child) in tracked {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill node {}: {}", name, e);
            }
        }

        // Stray processes from earlier runs are not tracked
        if let Some(name) = self.settings.executable_name() {
            match Command::new("killall")
                .arg("-9")
                .arg(&name)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
            {
                Ok(_) => {}
                Err(e) => warn!("killall {} failed: {}", name, e),
            }
        }
        info!("Kill all nodes SUCCESS");
        Ok(())
    }
}
