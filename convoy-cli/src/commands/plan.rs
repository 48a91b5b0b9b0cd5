use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};

use convoy_core::schedule::WaveScheduler;

use super::Session;

#[derive(Subcommand, Debug)]
pub enum PlanCommand {
    /// Partition pending repositories into dependency-ordered waves
    Waves(WavesArgs),
    /// Rank pending repositories by pilot risk (lower is safer)
    Pilots(PilotsArgs),
}

#[derive(Args, Debug)]
pub struct WavesArgs {
    /// Only plan repositories in this organization
    #[arg(long)]
    pub org: Option<String>,

    /// Repositories per wave (default: `[scheduling] wave_size`)
    #[arg(long)]
    pub wave_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct PilotsArgs {
    #[arg(long)]
    pub org: Option<String>,

    /// How many candidates (default: `[scheduling] pilot_count`)
    #[arg(long)]
    pub count: Option<usize>,
}

pub async fn run(session: &Session, cmd: PlanCommand) -> anyhow::Result<()> {
    let scheduler =
        WaveScheduler::from_config(Arc::clone(&session.store), &session.config.scheduling);
    match cmd {
        PlanCommand::Waves(args) => {
            let wave_size = args.wave_size.unwrap_or(session.config.scheduling.wave_size);
            let plan = scheduler
                .plan_waves(args.org.as_deref(), wave_size)
                .await
                .context("Wave planning failed")?;
            session.emit(&plan, |plan| {
                if plan.waves.is_empty() {
                    println!("No pending repositories to plan");
                } else {
                    print!("{plan}");
                }
            })
        }
        PlanCommand::Pilots(args) => {
            let count = args.count.unwrap_or(session.config.scheduling.pilot_count);
            let pilots = scheduler
                .find_pilot_candidates(args.org.as_deref(), count)
                .await
                .context("Pilot ranking failed")?;
            session.emit(&pilots, |pilots| {
                for (rank, c) in pilots.iter().enumerate() {
                    println!(
                        "{:>3}. {:<48} score {:>5}  deps {}{}{}",
                        rank + 1,
                        c.full_name,
                        c.score,
                        c.local_dependency_count,
                        if c.is_archived { "  archived" } else { "" },
                        if c.is_fork { "  fork" } else { "" },
                    );
                }
            })
        }
    }
}
