pub mod batch;
pub mod discovery;
pub mod plan;
pub mod repo;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use serde::Serialize;
use tracing::debug;

use convoy_core::config::ConvoyConfig;
use convoy_core::discovery::DiscoveryManager;
use convoy_core::error::ConvoyError;
use convoy_core::store::MigrationStore;
use convoy_core::store::sqlite::SqliteStore;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Summarize repository statuses, batches and the latest discovery run
    Status(status::StatusArgs),
    /// Inspect and recover discovery runs
    #[command(subcommand)]
    Discovery(discovery::DiscoveryCommand),
    /// Manage migration batches
    #[command(subcommand)]
    Batch(batch::BatchCommand),
    /// Inspect and update individual repositories
    #[command(subcommand)]
    Repo(repo::RepoCommand),
    /// Propose dependency-ordered waves and pilot candidates
    #[command(subcommand)]
    Plan(plan::PlanCommand),
}

/// Options shared by every command.
#[derive(Debug)]
pub struct Global {
    pub config: PathBuf,
    pub db: Option<PathBuf>,
    pub json: bool,
}

/// An opened store plus the loaded configuration.
#[derive(Debug)]
pub struct Session {
    pub config: ConvoyConfig,
    pub store: Arc<dyn MigrationStore>,
    pub json: bool,
}

impl Session {
    /// Load config, open the store and reclaim stuck discovery runs.
    pub async fn open(global: &Global) -> anyhow::Result<Self> {
        let config = ConvoyConfig::load(&global.config)
            .map_err(ConvoyError::from)
            .with_context(|| format!("Cannot load config: {}", global.config.display()))?;

        let db_path = global.db.clone().unwrap_or_else(|| config.store.path.clone());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create database directory: {}", parent.display()))?;
        }
        let store: Arc<dyn MigrationStore> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Cannot open database: {}", db_path.display()))?,
        );

        let recovered = DiscoveryManager::new(Arc::clone(&store))
            .recover_on_startup(&config.discovery)
            .await
            .context("Failed to recover stuck discovery runs")?;
        if recovered > 0 {
            eprintln!("Recovered {recovered} stuck discovery run(s)");
        }
        debug!(db = %db_path.display(), "Session opened");

        Ok(Self {
            config,
            store,
            json: global.json,
        })
    }

    /// Print `value` as JSON when `--json` was given, else run `text`.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text(value);
        }
        Ok(())
    }
}

pub async fn run(global: &Global, cmd: Command) -> anyhow::Result<()> {
    let session = Session::open(global).await?;
    match cmd {
        Command::Status(args) => status::run(&session, args).await,
        Command::Discovery(cmd) => discovery::run(&session, cmd).await,
        Command::Batch(cmd) => batch::run(&session, cmd).await,
        Command::Repo(cmd) => repo::run(&session, cmd).await,
        Command::Plan(cmd) => plan::run(&session, cmd).await,
    }
}

/// Format an optional timestamp for tables.
pub fn when(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}
