//! Paperwatch — scientific-paper digest pipeline.
//! Entry point for the CLI binary.

mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, SubscriptionAction};
use paperwatch_common::config::Config;
use paperwatch_pipeline::{Digest, Pipeline};
use paperwatch_store::HistoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let default_filter = if args.verbose {
        "paperwatch=debug,info"
    } else if args.quiet {
        "warn"
    } else {
        "paperwatch=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Command::CheckConfig = args.command {
        return check_config(&config);
    }

    let store = Arc::new(HistoryStore::open(&config.storage.database_path)?);
    let cache_days = config.storage.cache_days;
    let pipeline = Pipeline::new(config, store.clone())?;

    match args.command {
        Command::Post => {
            let digest = pipeline.run_digest().await?;
            print!("{}", render_digest(&digest));
        }
        Command::Search { query } => {
            let digest = pipeline.search(&query).await?;
            print!("{}", render_digest(&digest));
        }
        Command::Cleanup { older_than_days } => {
            let days = older_than_days.unwrap_or(cache_days);
            let stats = pipeline.cleanup(days).await?;
            println!(
                "Removed {} history entries, {} cached scores, {} search records (older than {days} days)",
                stats.history_removed, stats.scores_removed, stats.searches_removed
            );
        }
        Command::Subscriptions { action } => match action {
            SubscriptionAction::Add { owner, keywords } => {
                let sub = store
                    .add_subscription(owner, keywords, chrono::Utc::now())
                    .await?;
                println!("Added subscription {} for {}: {}", sub.id, sub.owner_ref, sub.keywords.join(", "));
            }
            SubscriptionAction::List => {
                let subs = store.list_subscriptions().await?;
                if subs.is_empty() {
                    println!("No subscriptions.");
                }
                for sub in subs {
                    println!(
                        "{:>4}  {:<20}  {}",
                        sub.id,
                        sub.owner_ref,
                        sub.keywords.join(", ")
                    );
                }
            }
            SubscriptionAction::Remove { id } => {
                if store.remove_subscription(id).await? {
                    println!("Removed subscription {id}.");
                } else {
                    anyhow::bail!("no subscription with id {id}");
                }
            }
        },
        Command::CheckConfig => unreachable!("handled above"),
    }

    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    let problems = config.validate();
    if problems.is_empty() {
        info!("Configuration OK");
        println!("Configuration OK.");
        return Ok(());
    }
    for problem in &problems {
        println!("problem: {problem}");
    }
    anyhow::bail!("{} configuration problem(s) found", problems.len())
}

fn render_digest(digest: &Digest) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let report = &digest.report;

    if digest.papers.is_empty() {
        let _ = writeln!(out, "No new papers.");
    }
    for paper in &digest.papers {
        let _ = writeln!(
            out,
            "{:>2}. {} [{}]",
            paper.final_rank + 1,
            paper.paper.title,
            paper.paper.journal
        );
        if let (Some(score), Some(explanation)) = (paper.llm_score, &paper.llm_explanation) {
            let _ = writeln!(out, "    relevance {score:.2}: {explanation}");
        }
        if let Some(date) = paper.paper.published {
            let _ = writeln!(out, "    published {date}  {}", paper.paper.url);
        } else if !paper.paper.url.is_empty() {
            let _ = writeln!(out, "    {}", paper.paper.url);
        }
    }

    for section in &digest.sections {
        let _ = writeln!(
            out,
            "\nSubscription {} ({}):",
            section.subscription.id,
            section.subscription.keywords.join(", ")
        );
        for paper in &section.papers {
            let _ = writeln!(out, "  - {} [{}]", paper.paper.title, paper.paper.journal);
        }
    }

    let mut notes = Vec::new();
    for failure in &report.source_failures {
        notes.push(format!("{} unavailable: {}", failure.source.as_str(), failure.message));
    }
    if report.scoring_degraded {
        notes.push("LLM scoring incomplete; order may rely on fallback signals".to_string());
    }
    if report.semantic_degraded {
        notes.push("semantic matching unavailable".to_string());
    }
    if report.deadline_hit {
        notes.push("run deadline reached; results are partial".to_string());
    }
    if report.suppressed > 0 {
        notes.push(format!("{} paper(s) already digested recently", report.suppressed));
    }
    if !notes.is_empty() {
        let _ = writeln!(out, "\nnotes:");
        for note in notes {
            let _ = writeln!(out, "  - {note}");
        }
    }

    out
}
