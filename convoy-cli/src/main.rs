use std::path::PathBuf;

use clap::Parser;
use convoy_core::error::{ConvoyError, StoreError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "convoy",
    version,
    about = "Plan and recover bulk repository migrations"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Configuration file
    #[arg(long, global = true, env = "CONVOY_CONFIG", default_value = "convoy.toml")]
    config: PathBuf,

    /// Database location (overrides `[store] path`)
    #[arg(long, global = true, env = "CONVOY_DB")]
    db: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into an exit code.
///
/// Exit codes:
///   0  success
///   1  general/unknown error
///   2  configuration error
///   3  repository, batch or run not found
///   4  database error
///   5  conflict (discovery already running, duplicate batch)
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(core) = err.chain().find_map(|e| e.downcast_ref::<ConvoyError>()) {
        return match core {
            _ if core.is_not_found() => 3,
            _ if core.is_conflict() => 5,
            ConvoyError::Config(_) => 2,
            ConvoyError::Store(StoreError::Sqlite(_) | StoreError::Migration(_)) => 4,
            _ => 1,
        };
    }

    let lower = format!("{err:#}").to_lowercase();
    if lower.contains("config") {
        2
    } else if lower.contains("not found") {
        3
    } else if lower.contains("database") || lower.contains("sqlite") {
        4
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    let global = commands::Global {
        config: cli.config,
        db: cli.db,
        json: cli.json,
    };
    match runtime.block_on(commands::run(&global, cli.command)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use convoy_core::error::{ConfigError, DiscoveryError, LedgerError};
    use convoy_core::types::{BatchId, DiscoveryRunId};

    fn wrapped(err: ConvoyError) -> anyhow::Error {
        Err::<(), _>(err).context("Command failed").unwrap_err()
    }

    #[test]
    fn exit_code_not_found() {
        let err = wrapped(LedgerError::BatchNotFound(BatchId(4)).into());
        assert_eq!(classify_exit_code(&err), 3);
    }

    #[test]
    fn exit_code_conflict() {
        let err = wrapped(
            DiscoveryError::AlreadyRunning {
                id: DiscoveryRunId(1),
                target: "acme".into(),
            }
            .into(),
        );
        assert_eq!(classify_exit_code(&err), 5);
    }

    #[test]
    fn exit_code_config() {
        let err = wrapped(ConfigError::Invalid("wave_size".into()).into());
        assert_eq!(classify_exit_code(&err), 2);
        let err = anyhow::anyhow!("Cannot load config: convoy.toml");
        assert_eq!(classify_exit_code(&err), 2);
    }

    #[test]
    fn exit_code_database() {
        let err = wrapped(StoreError::Migration("schema version 9".into()).into());
        assert_eq!(classify_exit_code(&err), 4);
        let err = anyhow::anyhow!("Cannot open database: /tmp/x.db");
        assert_eq!(classify_exit_code(&err), 4);
    }

    #[test]
    fn exit_code_general() {
        let err = anyhow::anyhow!("Something unexpected happened");
        assert_eq!(classify_exit_code(&err), 1);
    }
}
