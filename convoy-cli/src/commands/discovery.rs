use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;

use convoy_core::discovery::{DiscoveryManager, DiscoveryRunner, DiscoverySource};
use convoy_core::error::ConvoyError;
use convoy_core::types::{DiscoveredRepository, DiscoveryRun};

use super::Session;

#[derive(Subcommand, Debug)]
pub enum DiscoveryCommand {
    /// Show the active run, or the most recent one
    Status,
    /// Cancel the active run regardless of age
    Reset,
    /// Cancel the active run if it has been running longer than the timeout
    Recover(RecoverArgs),
    /// Run discovery from an inventory file (JSON list of repositories)
    Import(ImportArgs),
}

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Stuck threshold in seconds (default: `[discovery] stuck_timeout_secs`)
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Inventory file
    pub file: PathBuf,

    /// Run target recorded on the discovery run
    #[arg(long, default_value = "inventory")]
    pub target: String,
}

#[derive(Debug, Serialize)]
struct Cancelled {
    cancelled: u64,
}

#[derive(Debug, Serialize)]
struct Imported {
    recorded: u64,
    errors: usize,
    cancelled: bool,
}

pub async fn run(session: &Session, cmd: DiscoveryCommand) -> anyhow::Result<()> {
    let manager = DiscoveryManager::new(Arc::clone(&session.store));
    match cmd {
        DiscoveryCommand::Status => {
            let latest = manager
                .get_latest()
                .await
                .context("Failed to read discovery runs")?;
            session.emit(&latest, |run| match run {
                Some(run) => print_run(run),
                None => println!("No discovery run recorded"),
            })
        }
        DiscoveryCommand::Reset => {
            let cancelled = manager.force_reset().await.context("Force reset failed")?;
            session.emit(&Cancelled { cancelled }, |c| {
                if c.cancelled == 0 {
                    println!("No active discovery run");
                } else {
                    println!("Cancelled {} active discovery run", c.cancelled);
                }
            })
        }
        DiscoveryCommand::Recover(args) => {
            let timeout = args.timeout_secs.map_or_else(
                || session.config.discovery.stuck_timeout(),
                Duration::from_secs,
            );
            let cancelled = manager
                .recover_stuck(timeout)
                .await
                .context("Stuck-run recovery failed")?;
            session.emit(&Cancelled { cancelled }, |c| {
                println!("Recovered {} stuck discovery run(s)", c.cancelled);
            })
        }
        DiscoveryCommand::Import(args) => import(session, &args).await,
    }
}

async fn import(session: &Session, args: &ImportArgs) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Cannot read inventory: {}", args.file.display()))?;
    let repositories: Vec<DiscoveredRepository> = serde_json::from_str(&text)
        .with_context(|| format!("Cannot parse inventory: {}", args.file.display()))?;
    let source = InventorySource { repositories };

    let runner = DiscoveryRunner::new(Arc::clone(&session.store));
    let stats = runner
        .run(&source, &args.target)
        .await
        .context("Discovery failed")?;

    let imported = Imported {
        recorded: stats.repositories_recorded,
        errors: stats.errors.len(),
        cancelled: stats.cancelled,
    };
    session.emit(&imported, |i| {
        println!("Recorded {} repositories ({} errors)", i.recorded, i.errors);
        if i.cancelled {
            println!("Run was cancelled before finishing");
        }
    })
}

/// Repositories read from an inventory file.
#[derive(Debug)]
struct InventorySource {
    repositories: Vec<DiscoveredRepository>,
}

#[async_trait::async_trait]
impl DiscoverySource for InventorySource {
    async fn list_repositories(&self, _target: &str) -> convoy_core::error::Result<Vec<String>> {
        Ok(self
            .repositories
            .iter()
            .map(|r| r.full_name.clone())
            .collect())
    }

    async fn describe(&self, full_name: &str) -> convoy_core::error::Result<DiscoveredRepository> {
        self.repositories
            .iter()
            .find(|r| r.full_name == full_name)
            .cloned()
            .ok_or_else(|| ConvoyError::Source(format!("{full_name} missing from inventory")))
    }
}

pub fn print_run(run: &DiscoveryRun) {
    println!("  Discovery run #{} ({})", run.id, run.target);
    println!("    Status:   {} / {}", run.status, run.phase);
    println!("    Started:  {}", super::when(Some(run.started_at)));
    println!("    Finished: {}", super::when(run.completed_at));
    println!(
        "    Repos:    {}/{}  Orgs: {}/{}",
        run.processed_repos, run.total_repos, run.processed_orgs, run.total_orgs
    );
    if run.error_count > 0 {
        println!(
            "    Errors:   {} (last: {})",
            run.error_count,
            run.last_error.as_deref().unwrap_or("-")
        );
    } else if let Some(last) = &run.last_error {
        println!("    Note:     {last}");
    }
}
