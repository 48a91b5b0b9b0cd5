use std::collections::BTreeMap;

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use convoy_core::status::RepositoryStatus;
use convoy_core::types::{Batch, BatchFilter, DiscoveryRun};

use super::Session;

#[derive(Args, Debug)]
pub struct StatusArgs {}

#[derive(Debug, Serialize)]
struct Summary {
    repositories: u64,
    by_status: BTreeMap<RepositoryStatus, u64>,
    batches: Vec<Batch>,
    discovery: Option<DiscoveryRun>,
}

pub async fn run(session: &Session, _args: StatusArgs) -> anyhow::Result<()> {
    let store = session.store.as_ref();
    let by_status = store
        .status_counts()
        .await
        .context("Failed to read repository counts")?;
    let batches = store
        .list_batches(&BatchFilter::default())
        .await
        .context("Failed to list batches")?;
    let discovery = store
        .latest_discovery()
        .await
        .context("Failed to read discovery runs")?;

    let summary = Summary {
        repositories: by_status.values().sum(),
        by_status,
        batches,
        discovery,
    };

    session.emit(&summary, |s| {
        println!("Convoy status");
        println!();
        println!("  Repositories: {} total", s.repositories);
        for (status, count) in &s.by_status {
            println!("    {status:<24} {count:>6}");
        }
        println!();

        println!("  Batches: {}", s.batches.len());
        for batch in &s.batches {
            println!(
                "    #{:<4} {:<24} {:<22} {:>4} repos",
                batch.id.0, batch.name, batch.status, batch.repository_count
            );
        }
        println!();

        match &s.discovery {
            Some(run) => super::discovery::print_run(run),
            None => println!("  Discovery: never run"),
        }
    })
}
