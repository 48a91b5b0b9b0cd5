use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;

use convoy_core::batch::BatchAggregator;
use convoy_core::ledger::Ledger;
use convoy_core::status::BatchStatus;
use convoy_core::types::{Batch, BatchFilter, BatchId, BatchKind, NewBatch, Repository};

use super::Session;

#[derive(Subcommand, Debug)]
pub enum BatchCommand {
    /// Create an empty batch
    Create(CreateArgs),
    /// List batches
    List(ListArgs),
    /// Show a batch and its members
    Show(IdArgs),
    /// Add repositories to a batch (moving them out of any other batch)
    Add(MembersArgs),
    /// Remove repositories from a batch
    Remove(MembersArgs),
    /// Set a batch status explicitly (execution pipeline transitions)
    SetStatus(SetStatusArgs),
    /// Delete a batch, returning its members to the pool
    Delete(IdArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub name: String,

    /// pilot, wave or custom
    #[arg(long, default_value = "custom")]
    pub kind: BatchKind,

    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<BatchStatus>,

    #[arg(long)]
    pub kind: Option<BatchKind>,
}

#[derive(Args, Debug)]
pub struct IdArgs {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct MembersArgs {
    pub id: i64,

    /// Repository full names
    #[arg(required = true)]
    pub repositories: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SetStatusArgs {
    pub id: i64,
    pub status: BatchStatus,
}

#[derive(Debug, Serialize)]
struct BatchDetail {
    batch: Batch,
    members: Vec<Repository>,
}

#[derive(Debug, Serialize)]
struct Membership {
    batch: Batch,
    affected: u64,
}

pub async fn run(session: &Session, cmd: BatchCommand) -> anyhow::Result<()> {
    let batches = BatchAggregator::new(Arc::clone(&session.store));
    match cmd {
        BatchCommand::Create(args) => {
            let mut new = NewBatch::new(args.name, args.kind);
            new.description = args.description;
            let batch = batches.create(&new).await.context("Failed to create batch")?;
            session.emit(&batch, |b| println!("Created batch #{} '{}'", b.id, b.name))
        }
        BatchCommand::List(args) => {
            let filter = BatchFilter {
                status: args.status,
                kind: args.kind,
            };
            let list = batches.list(&filter).await.context("Failed to list batches")?;
            session.emit(&list, |list| {
                if list.is_empty() {
                    println!("No batches");
                }
                for b in list {
                    println!(
                        "#{:<4} {:<24} {:<7} {:<22} {:>4} repos",
                        b.id.0, b.name, b.kind, b.status, b.repository_count
                    );
                }
            })
        }
        BatchCommand::Show(args) => {
            let id = BatchId(args.id);
            let batch = batches.require(id).await?;
            let members = batches.members(id).await.context("Failed to list members")?;
            session.emit(&BatchDetail { batch, members }, |d| {
                print_batch(&d.batch);
                for repo in &d.members {
                    println!("    {:<48} {}", repo.full_name, repo.status);
                }
            })
        }
        BatchCommand::Add(args) => {
            let ids = Ledger::new(Arc::clone(&session.store))
                .resolve_ids(&args.repositories)
                .await?;
            let id = BatchId(args.id);
            // Unknown batches are a silent no-op in the core; the CLI reports them.
            batches.require(id).await?;
            let affected = batches.add_repositories(id, &ids).await?;
            let batch = batches.require(id).await?;
            session.emit(&Membership { batch, affected }, |m| {
                println!("Added {} repositories", m.affected);
                print_batch(&m.batch);
            })
        }
        BatchCommand::Remove(args) => {
            let ids = Ledger::new(Arc::clone(&session.store))
                .resolve_ids(&args.repositories)
                .await?;
            let id = BatchId(args.id);
            batches.require(id).await?;
            let affected = batches.remove_repositories(id, &ids).await?;
            let batch = batches.require(id).await?;
            session.emit(&Membership { batch, affected }, |m| {
                println!("Removed {} repositories", m.affected);
                print_batch(&m.batch);
            })
        }
        BatchCommand::SetStatus(args) => {
            let batch = batches
                .set_status(BatchId(args.id), args.status)
                .await
                .context("Failed to set batch status")?;
            session.emit(&batch, print_batch)
        }
        BatchCommand::Delete(args) => {
            let id = BatchId(args.id);
            if !batches.delete(id).await? {
                anyhow::bail!("Batch not found: {id}");
            }
            session.emit(&id, |id| println!("Deleted batch #{id}"))
        }
    }
}

fn print_batch(batch: &Batch) {
    println!("Batch #{} '{}' ({})", batch.id, batch.name, batch.kind);
    println!("  Status:       {}", batch.status);
    println!("  Repositories: {}", batch.repository_count);
    println!("  Started:      {}", super::when(batch.started_at));
    println!("  Completed:    {}", super::when(batch.completed_at));
}
