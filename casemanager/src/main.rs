mod logger;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use logger::{CaseLog, LogLevel};
use pcn_testing_framework::keystore::KdfParams;
use pcn_testing_framework::prelude::*;
use pcn_testing_framework::scenarios::builtin;
use pcn_testing_framework::utilities::{render_run_summary, ScenarioArtifact};
use std::path::{Path, PathBuf};

/// Request timeout of the node API client
const NODE_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Case manager CLI
#[derive(Parser, Debug)]
#[command(name = "casemanager")]
#[command(about = "Provision payment channel test environments and run crash cases")]
pub struct Cli {
    /// Set log level
    #[clap(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    /// Disable the usage of colors in log
    #[clap(long, global = true)]
    disable_log_color: bool,

    /// Logs directory, overrides the environment file
    #[clap(long, global = true)]
    logs_path: Option<PathBuf>,

    /// Chain RPC endpoint, overrides the environment file
    #[clap(long, global = true)]
    eth_rpc_endpoint: Option<String>,

    /// Keystore password file, overrides the environment file
    #[clap(long, global = true)]
    password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy contracts, fund accounts, open channels and print the topology
    Provision {
        /// Environment file
        #[clap(long)]
        env: PathBuf,
    },
    /// Provision, then run crash cases one after another
    Run {
        /// Environment file
        #[clap(long)]
        env: PathBuf,
        /// Scenario file or built-in case name; repeatable
        #[clap(long = "case", required = true)]
        cases: Vec<String>,
        /// Write a JSON artifact per case into this directory
        #[clap(long)]
        artifacts: Option<PathBuf>,
    },
    /// Create a keystore account
    NewAccount {
        /// Keystore directory
        #[clap(long)]
        keystore: PathBuf,
        /// Account name
        #[clap(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let case_log = CaseLog::default();
    logger::init(cli.log_level.into(), !cli.disable_log_color, case_log.clone())?;

    match &cli.command {
        Command::Provision { env } => {
            let env = load_env(&cli, env)?;
            case_log.switch_to(&env.logs_path, &env.case_name)?;
            let (_, topology) = provision(&env).await?;
            println!("{}", topology.to_pretty_json()?);
            case_log.close();
            Ok(())
        }
        Command::Run {
            env,
            cases,
            artifacts,
        } => {
            let env = load_env(&cli, env)?;
            run(&env, cases, artifacts.as_deref(), &case_log).await
        }
        Command::NewAccount { keystore, name } => {
            let passphrase = passphrase_source(cli.password_file.clone()).resolve()?;
            let address =
                KeyStore::create_account(keystore, &passphrase, name.clone(), KdfParams::default())?;
            println!("{}", address);
            Ok(())
        }
    }
}

fn passphrase_source(password_file: Option<PathBuf>) -> Passphrase {
    match password_file {
        Some(path) => Passphrase::File(path),
        None => Passphrase::Prompt,
    }
}

fn load_env(cli: &Cli, path: &Path) -> Result<EnvConfig> {
    let mut env = EnvConfig::load(path)
        .with_context(|| format!("Failed to load environment {}", path.display()))?;
    if let Some(endpoint) = &cli.eth_rpc_endpoint {
        env.eth_rpc_endpoint = endpoint.clone();
    }
    if let Some(file) = &cli.password_file {
        env.password_file = Some(file.clone());
    }
    if let Some(logs) = &cli.logs_path {
        env.logs_path = logs.clone();
    }
    Ok(env)
}

async fn provision(env: &EnvConfig) -> Result<(Arc<dyn ChainClient>, TestTopology)> {
    let keys = KeyStore::unlock(&env.keystore_path, &passphrase_source(env.password_file.clone()))
        .context("Failed to unlock keystore")?;
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(RpcChainConfig::new(
        env.eth_rpc_endpoint.clone(),
    ))?);

    let provisioner = Provisioner::new(chain.clone(), Arc::new(keys), env.provisioning.clone());
    // Provisioning only kills stale nodes, which needs no settlement address
    let reaper = ProcessNodeController::new(ProcessSettings::from_env(env, Address::zero()));
    let topology = match provisioner.provision(env, &reaper).await {
        Ok(topology) => topology,
        Err(e @ ProvisionError::MissingAccount { .. }) => {
            return Err(anyhow::Error::new(e).context(
                "Provisioning failed; create node accounts with `casemanager new-account` \
                 and put their addresses in the environment file",
            ))
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Provisioning failed")),
    };
    Ok((chain, topology))
}

fn load_case(name: &str, topology: &TestTopology) -> Result<ScenarioSpec> {
    let path = Path::new(name);
    if path.is_file() {
        return ScenarioSpec::load(path).with_context(|| format!("Failed to load case {}", name));
    }
    let Some(token) = topology.tokens.first() else {
        bail!("Built-in case {} needs a token in the environment", name);
    };
    builtin::builtin(name, &token.name)
        .with_context(|| format!("{} is neither a scenario file nor a built-in case", name))
}

async fn run(
    env: &EnvConfig,
    cases: &[String],
    artifacts: Option<&Path>,
    case_log: &CaseLog,
) -> Result<()> {
    case_log.switch_to(&env.logs_path, &env.case_name)?;
    let (chain, topology) = provision(env).await?;
    let specs = cases
        .iter()
        .map(|name| load_case(name, &topology))
        .collect::<Result<Vec<_>>>()?;

    let nodes: Arc<dyn NodeController> = Arc::new(ProcessNodeController::new(
        ProcessSettings::from_env(env, topology.settlement),
    ));
    let api: Arc<dyn NodeApi> = Arc::new(HttpNodeApi::new(NODE_API_TIMEOUT)?);
    let probe = ChannelStateProbe::new(chain, nodes.clone(), api.clone(), topology.settlement);
    let runner = ScenarioRunner::new(
        Arc::new(topology),
        nodes,
        api,
        probe,
        Arc::new(SystemClock),
    )
    .kill_nodes_after(!env.debug);

    let mut results = Vec::with_capacity(specs.len());
    for spec in &specs {
        let log_path = case_log.switch_to(&env.logs_path, &spec.name)?;
        info!("Case {} logging to {}", spec.name, log_path.display());

        let result = runner.run(spec).await;
        print_result_summary(&result);
        if let Some(dir) = artifacts {
            match ScenarioArtifact::new(runner.topology(), &result).save(dir).await {
                Ok(path) => info!("Artifact saved to {}", path.display()),
                Err(e) => error!("Failed to save artifact for {}: {:#}", spec.name, e),
            }
        }
        case_log.close();
        results.push(result);
    }

    print!("{}", render_run_summary(&results));
    let failed = results.iter().filter(|r| !r.passed()).count();
    if failed > 0 {
        bail!("{} of {} cases failed", failed, results.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shipped(file: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("cases").join(file)
    }

    #[test]
    fn test_shipped_case_matches_builtin() {
        let spec = ScenarioSpec::load(shipped("crash_case_send_06.yaml")).unwrap();
        assert_eq!(spec, crash_case_send_06("T1"));
    }

    #[test]
    fn test_shipped_environment_is_valid() {
        let env = EnvConfig::load(shipped("send06.env.yaml")).unwrap();
        assert_eq!(env.nodes.len(), 4);
        assert_eq!(env.channels.len(), 4);
        assert_eq!(env.provisioning.allowance_multiplier, 100);
    }

    #[tokio::test]
    async fn test_shipped_environment_needs_its_keystore_accounts() {
        let env = EnvConfig::load(shipped("send06.env.yaml")).unwrap();
        let keys = KeyStore::from_accounts([Account::generate(Some("deployer".into()))]);
        let chain = Arc::new(DevChain::new());
        let provisioner = Provisioner::new(chain.clone(), Arc::new(keys), env.provisioning.clone());
        let reaper = ProcessNodeController::new(ProcessSettings::from_env(&env, Address::zero()));

        let err = provisioner.provision(&env, &reaper).await.unwrap_err();
        assert!(matches!(err, ProvisionError::MissingAccount { ref node, .. } if node == "N2"));
        assert_eq!(chain.total_tx_count(), 0);
    }

    #[test]
    fn test_cli_overrides_environment() {
        let cli = Cli::parse_from([
            "casemanager",
            "--eth-rpc-endpoint",
            "http://10.0.0.1:8545",
            "--logs-path",
            "/tmp/cases",
            "run",
            "--env",
            "env.yaml",
            "--case",
            "CrashCaseSend06",
        ]);
        let env = load_env(&cli, &shipped("send06.env.yaml")).unwrap();
        assert_eq!(env.eth_rpc_endpoint, "http://10.0.0.1:8545");
        assert_eq!(env.logs_path, PathBuf::from("/tmp/cases"));
        assert!(matches!(cli.command, Command::Run { ref cases, .. } if cases.len() == 1));
    }
}
