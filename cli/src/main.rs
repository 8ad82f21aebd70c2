//! gcp-opwait command line front end.
//!
//! Subcommands:
//! - `gcp-opwait wait`: poll a long-running operation URL until it finishes
//! - `gcp-opwait iam merge`: coalesce the bindings of a policy JSON file
//! - `gcp-opwait iam diff`: show bindings present in only one of two policies

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gcp_opwait::{
    GcpClient, OperationKind, OperationWaiter, Policy, PollOptions, ProviderConfig,
    merge_bindings, missing_bindings,
};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "gcp-opwait.toml";

#[derive(Parser)]
#[command(
    name = "gcp-opwait",
    version,
    about = "Wait on Google Cloud operations and merge or diff IAM policies"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll an operation until it is done, fails, or the timeout passes
    Wait {
        /// Operation URL (a Compute/SQL selfLink, or {base}{name} for other APIs)
        #[arg(long)]
        url: String,
        /// Operation wire format: common, compute or sql
        #[arg(long, default_value = "common")]
        kind: String,
        /// Give up after this many seconds [default: polling.timeout_secs from config]
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Seconds between polls [default: polling.interval_secs from config]
        #[arg(long)]
        interval_secs: Option<u64>,
        /// Path to gcp-opwait.toml [default: ./gcp-opwait.toml or ~/.config/gcp-opwait/gcp-opwait.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// IAM policy helpers working on policy JSON files
    Iam {
        #[command(subcommand)]
        command: IamCommands,
    },
}

#[derive(Subcommand)]
enum IamCommands {
    /// Print the policy with one binding per role and condition
    Merge { policy: PathBuf },
    /// Print bindings present in only one policy; exits 1 when they differ
    Diff { a: PathBuf, b: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // RUST_LOG controls verbosity
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Wait {
            url,
            kind,
            timeout_secs,
            interval_secs,
            config,
        } => {
            let mut config = load_config(resolve_config(config)).await?;
            apply_poll_overrides(&mut config, timeout_secs, interval_secs)?;
            run_wait(config, &url, &kind).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Iam {
            command: IamCommands::Merge { policy },
        } => {
            let mut policy = read_policy(&policy).await?;
            policy.bindings = merge_bindings(&policy.bindings);
            println!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Iam {
            command: IamCommands::Diff { a, b },
        } => {
            let a = read_policy(&a).await?;
            let b = read_policy(&b).await?;
            let missing = missing_bindings(&a.bindings, &b.bindings);
            println!("{}", serde_json::to_string_pretty(&missing)?);
            Ok(if missing.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

/// Fetch the operation once, then poll it to a terminal state.
///
/// Ctrl-C abandons the local wait; the operation keeps running server-side.
async fn run_wait(config: ProviderConfig, url: &str, kind: &str) -> Result<()> {
    let kind: OperationKind = kind.parse()?;
    let options = PollOptions::from_config(&config);

    let client = GcpClient::new(config)?;
    let initial = client.get_operation(url, kind).await?;
    let base = url
        .strip_suffix(initial.name.as_str())
        .unwrap_or(url)
        .to_string();
    let query = client.operation_query(kind, &base, &initial)?;
    tracing::info!(operation = %initial.name, url = %query.url(), "waiting for operation");

    let mut waiter = OperationWaiter::new(format!("operation {}", initial.name), options);
    let op = tokio::select! {
        result = waiter.wait(&query, initial) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; the operation continues server-side");
            return Err(anyhow::anyhow!("interrupted while waiting for operation"));
        }
    };

    tracing::info!(operation = %op.name, queries = waiter.queries(), "operation done");
    match op.response {
        Some(response) => println!("{}", serde_json::to_string_pretty(&response)?),
        None => println!("{}", op.name),
    }
    Ok(())
}

/// Flags override `[polling]` and go through the same validation as the file.
fn apply_poll_overrides(
    config: &mut ProviderConfig,
    timeout_secs: Option<u64>,
    interval_secs: Option<u64>,
) -> gcp_opwait::Result<()> {
    if let Some(secs) = timeout_secs {
        config.polling.timeout_secs = secs;
    }
    if let Some(secs) = interval_secs {
        config.polling.interval_secs = secs;
    }
    config.validate()
}

/// Resolve config file path: explicit flag → ./gcp-opwait.toml → ~/.config/gcp-opwait/gcp-opwait.toml.
///
/// `None` means no file; configuration then comes from the environment alone.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }

    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }

    dirs::config_dir()
        .map(|dir| dir.join("gcp-opwait").join(CONFIG_FILE))
        .filter(|path| path.exists())
}

/// Load the file (if any) and fill gaps from the environment; validation is left
/// to the caller so command-line overrides are checked too.
async fn load_config(path: Option<PathBuf>) -> Result<ProviderConfig> {
    let mut config = match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            ProviderConfig::load(&path).await?
        }
        None => ProviderConfig::default(),
    };
    config.apply_env_defaults();
    Ok(config)
}

async fn read_policy(path: &Path) -> Result<Policy> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read policy file {:?}: {}", path, e))?;
    let policy = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse policy file {:?}: {}", path, e))?;
    Ok(policy)
}
