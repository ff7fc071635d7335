mod file_agency;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use cvg_reconcile::{CancellationToken, Maintenance, SyncConfig};
use cvg_storage::{FjallEngine, MemEngine, StorageEngine};
use cvg_types::ServerId;

use crate::file_agency::FileAgency;

#[derive(clap::Parser, Debug)]
#[command(
    name = "cvg-node",
    about = "Keeps this server's databases and shards converged with the Plan"
)]
struct Cli {
    /// Overrides `node.server_id`.
    #[arg(long)]
    server_id: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Run a single pass and exit; non-zero when the pass left errors.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    server_id: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Backend {
    Fjall,
    Memory,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    backend: Backend,
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct AgencyConfig {
    plan_path: PathBuf,
    current_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    node: NodeConfig,
    storage: StorageConfig,
    sync: SyncConfig,
    agency: AgencyConfig,
    observability: ObservabilityConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("CONVERGE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(ref server_id) = cli.server_id {
        config.node.server_id = server_id.clone();
    }
    if let Some(ref data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    anyhow::ensure!(!config.node.server_id.is_empty(), "node.server_id must not be empty");
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(
        server_id = %config.node.server_id,
        backend = ?config.storage.backend,
        plan = %config.agency.plan_path.display(),
        "node starting"
    );

    match config.storage.backend {
        Backend::Fjall => {
            let engine = FjallEngine::open(&config.storage.data_dir).with_context(|| {
                format!("failed to open local state at {}", config.storage.data_dir.display())
            })?;
            run(Arc::new(engine), &config, cli.once).await
        }
        Backend::Memory => run(Arc::new(MemEngine::new()), &config, cli.once).await,
    }
}

async fn run<E: StorageEngine>(engine: Arc<E>, config: &Config, once: bool) -> anyhow::Result<()> {
    let server = ServerId::new(config.node.server_id.clone());
    let maintenance = Maintenance::new(engine, server, &config.sync);
    let agency = FileAgency::new(
        config.agency.plan_path.clone(),
        config.agency.current_path.clone(),
        config.sync.current_root.clone(),
    );
    let cancel = CancellationToken::new();

    if once {
        let report =
            maintenance.run_once(&agency, &cancel).await.context("maintenance pass failed")?;
        anyhow::ensure!(report.is_clean(), "{} entities did not converge", report.error_count());
        return Ok(());
    }

    let stop = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                stop.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "cannot listen for ctrl-c"),
        }
    });

    maintenance.run(&agency, config.sync.interval(), cancel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        use clap::Parser;
        Cli::parse_from(std::iter::once("cvg-node").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_load() {
        let config = load_config(&cli(&[])).unwrap();
        assert_eq!(config.storage.backend, Backend::Fjall);
        assert_eq!(config.sync.current_root, "/arango/Current");
        assert!(!config.sync.retract_stale);
        assert_eq!(config.observability.log_format, "pretty");
    }

    #[test]
    fn file_and_flags_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[storage]\nbackend = \"memory\"\n[sync]\nretract_stale = true\ninterval_ms = 50\n",
        )
        .unwrap();

        let config = load_config(&cli(&[
            "--config",
            path.to_str().unwrap(),
            "--server-id",
            "PRMR-1",
            "--data-dir",
            "/tmp/x",
        ]))
        .unwrap();
        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.node.server_id, "PRMR-1");
        assert!(config.sync.retract_stale);
        assert_eq!(config.sync.interval_ms, 50);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(&cli(&["--config", "/nonexistent/node.toml"])).is_err());
    }
}
