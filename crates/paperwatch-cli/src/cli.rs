//! CLI argument definitions (clap derive).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "paperwatch",
    about = "Scientific-paper digest pipeline: fetch, dedup, filter, score, rank"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file
    /// (default: $PAPERWATCH_CONFIG or ./paperwatch.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Suppress info logs (only warnings and errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a digest over the configured keywords and print it
    Post,
    /// Run an explicit boolean query, bypassing digest history
    Search {
        /// Query, e.g. '"single cell" AND RNA NOT clinical'
        query: String,
    },
    /// Prune old history entries, cached scores and search records
    Cleanup {
        /// Age cutoff in days (default: storage.cache_days)
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Validate the configuration file and report problems
    CheckConfig,
    /// Manage keyword subscriptions
    Subscriptions {
        #[command(subcommand)]
        action: SubscriptionAction,
    },
}

#[derive(Subcommand)]
pub enum SubscriptionAction {
    /// Add a subscription for an owner (user or channel reference)
    Add {
        owner: String,
        #[arg(required = true, num_args = 1..)]
        keywords: Vec<String>,
    },
    /// List all subscriptions
    List,
    /// Remove a subscription by id
    Remove { id: i64 },
}
