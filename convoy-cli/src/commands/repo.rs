use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};

use convoy_core::ledger::Ledger;
use convoy_core::status::RepositoryStatus;
use convoy_core::types::{Repository, RepositoryFilter};

use super::Session;

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// List repositories
    List(ListArgs),
    /// Show one repository and its dependency edges
    Show(NameArgs),
    /// Write a repository status (re-derives its batch)
    SetStatus(SetStatusArgs),
    /// Roll a repository back and detach it from its batch
    Rollback(RollbackArgs),
    /// Show a repository's migration history
    History(NameArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only repositories in this status (repeatable)
    #[arg(long)]
    pub status: Vec<RepositoryStatus>,

    /// Only repositories in this organization
    #[arg(long)]
    pub org: Option<String>,

    /// Only repositories that can be added to a batch
    #[arg(long)]
    pub available: bool,

    #[arg(long)]
    pub limit: Option<u32>,
}

#[derive(Args, Debug)]
pub struct NameArgs {
    pub name: String,
}

#[derive(Args, Debug)]
pub struct SetStatusArgs {
    pub name: String,
    pub status: RepositoryStatus,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    pub name: String,

    /// Recorded on the audit entry
    #[arg(long, default_value = "Rolled back by operator")]
    pub reason: String,
}

pub async fn run(session: &Session, cmd: RepoCommand) -> anyhow::Result<()> {
    let ledger = Ledger::new(Arc::clone(&session.store));
    match cmd {
        RepoCommand::List(args) => {
            let filter = RepositoryFilter {
                statuses: args.status,
                organization: args.org,
                limit: args.limit,
                ..Default::default()
            };
            let repos = if args.available {
                ledger.available_for_batch(&filter).await
            } else {
                ledger.find(&filter).await
            }
            .context("Failed to list repositories")?;
            session.emit(&repos, |repos| {
                for repo in repos {
                    print_row(repo);
                }
            })
        }
        RepoCommand::Show(args) => {
            let repo = ledger.require(&args.name).await?;
            let edges = session
                .store
                .get_dependencies(&args.name)
                .await
                .context("Failed to read dependencies")?;
            let dependents = ledger.dependents(&args.name).await?;
            let detail = serde_json::json!({
                "repository": repo,
                "dependencies": edges,
                "dependents": dependents,
            });
            session.emit(&detail, |_| {
                print_row(&repo);
                println!("  Rollbacks: {}", repo.rollback_count);
                println!("  Migrated:  {}", super::when(repo.migrated_at));
                for edge in &edges {
                    let scope = if edge.is_local { "local" } else { "external" };
                    println!(
                        "  -> {} ({}, {scope})",
                        edge.dependency_full_name, edge.dependency_type
                    );
                }
                for name in &dependents {
                    println!("  <- {name}");
                }
            })
        }
        RepoCommand::SetStatus(args) => {
            let repo = ledger
                .set_status(&args.name, args.status)
                .await
                .context("Failed to set repository status")?;
            session.emit(&repo, print_row)
        }
        RepoCommand::Rollback(args) => {
            let repo = ledger
                .rollback(&args.name, &args.reason)
                .await
                .context("Rollback failed")?;
            session.emit(&repo, |r| {
                println!("Rolled back {} (rollback #{})", r.full_name, r.rollback_count);
            })
        }
        RepoCommand::History(args) => {
            ledger.require(&args.name).await?;
            let history = ledger.history(&args.name).await?;
            session.emit(&history, |entries| {
                if entries.is_empty() {
                    println!("No history for {}", args.name);
                }
                for entry in entries {
                    println!(
                        "{}  {:<9} {:<11} {}",
                        super::when(Some(entry.started_at)),
                        entry.phase,
                        entry.status,
                        entry.message.as_deref().unwrap_or("")
                    );
                }
            })
        }
    }
}

fn print_row(repo: &Repository) {
    let batch = repo
        .batch_id
        .map_or_else(|| "-".to_string(), |id| format!("#{id}"));
    let complexity = repo
        .complexity_score
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    println!(
        "{:<48} {:<22} batch {:<6} complexity {complexity}",
        repo.full_name, repo.status, batch
    );
}
