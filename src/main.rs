// ABOUTME: CLI entry point for changeset-replicator
// ABOUTME: Parses commands, sets up logging and configuration, and routes to handlers

use anyhow::Context;
use changeset_replicator::commands::{
    self, ApplyArgs, BatchArgs, ConcatArgs, DumpArgs, InvertArgs, RecordArgs,
};
use changeset_replicator::config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "changeset-replicator")]
#[command(about = "Record, inspect, invert, merge and replay SQLite changesets", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a config.toml with [session], [batch] and [apply] settings
    #[arg(long, global = true, env = "CHANGESET_REPLICATOR_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run SQL against a database and record the changes it makes
    Record(RecordArgs),
    /// Print the rows of a changeset
    Dump(DumpArgs),
    /// Write the changeset that undoes another
    Invert(InvertArgs),
    /// Merge two changesets into one
    Concat(ConcatArgs),
    /// Replay a changeset against a database
    Apply(ApplyArgs),
    /// Check whether changesets touch the same rows (exit status 2 if so)
    Batch(BatchArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Record(args) => commands::record::command(args, &config),
        Commands::Dump(args) => commands::dump::command(args),
        Commands::Invert(args) => commands::invert::command(args),
        Commands::Concat(args) => commands::concat::command(args),
        Commands::Apply(args) => commands::apply::command(args, &config),
        Commands::Batch(args) => {
            if commands::batch::command(args, &config)? {
                std::process::exit(commands::batch::CONFLICT_EXIT_CODE);
            }
            Ok(())
        }
    }
}
