// ABOUTME: CLI entry point for mls-replicator
// ABOUTME: Parses commands, loads configuration and drives replication passes

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mls_replicator::{ReplicationMode, Replicator, ReplicatorConfig, ResourceKind, RunStats};

#[derive(Parser)]
#[command(name = "mls-replicator")]
#[command(about = "Incrementally replicate MLS Grid resources into local JSON files", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML config file
    #[arg(long, env = "MLS_REPLICATOR_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// OriginatingSystemName to replicate (overrides the config file)
    #[arg(long, env = "MLSGRID_SYSTEM", global = true)]
    system: Option<String>,
    /// Directory holding cursors and replicated output
    #[arg(long, env = "MLS_REPLICATOR_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,
    /// MLS Grid API base URL
    #[arg(long, env = "MLSGRID_API_URL", global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a single resource kind
    Replicate {
        #[arg(long, value_enum)]
        resource: ResourceKind,
        /// Full pass instead of resuming from the stored cursor
        #[arg(long)]
        initial: bool,
        /// Use the debug profile (small pages, bounded page count)
        #[arg(long)]
        debug: bool,
        /// Stop after this many pages
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Replicate every resource kind
    ReplicateAll {
        /// Full pass instead of resuming from the stored cursors
        #[arg(long)]
        initial: bool,
        /// Use the debug profile (small pages, bounded page count)
        #[arg(long)]
        debug: bool,
        /// Replicate kinds concurrently instead of one after another
        #[arg(long)]
        concurrent: bool,
    },
    /// Show stored change cursors
    Cursor {
        #[arg(long, value_enum)]
        resource: Option<ResourceKind>,
    },
    /// Delete all cursors and replicated output
    Reset {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional; MLSGRID_API_TOKEN and the env-backed flags may come from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = match &cli.config {
        Some(path) => ReplicatorConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ReplicatorConfig::default(),
    };
    if let Some(system) = cli.system {
        config.system = system;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = Some(state_dir);
    }
    if let Some(api_url) = cli.api_url {
        config.api_base_url = api_url;
    }

    match cli.command {
        Commands::Replicate {
            resource,
            initial,
            debug,
            max_iterations,
        } => {
            config.debug |= debug;
            if let Some(cap) = max_iterations {
                config.max_iterations = Some(cap);
                config.debug_profile.max_iterations = cap;
            }
            let replicator = build_replicator(config)?;
            let stats = replicator
                .replicate(resource, ReplicationMode::from_initial_flag(initial))
                .await
                .with_context(|| format!("Replication of {} failed", resource))?;
            print_summary(&[stats]);
            Ok(())
        }
        Commands::ReplicateAll {
            initial,
            debug,
            concurrent,
        } => {
            config.debug |= debug;
            let replicator = build_replicator(config)?;
            let mode = ReplicationMode::from_initial_flag(initial);
            let result = if concurrent {
                replicator
                    .replicate_concurrently(&ResourceKind::ALL, mode)
                    .await
            } else {
                replicator.replicate_all(mode).await
            };
            let stats = result.context("Replication failed")?;
            print_summary(&stats);
            Ok(())
        }
        Commands::Cursor { resource } => {
            let replicator = Replicator::from_config(config)?;
            for (kind, cursor) in replicator.cursors().await? {
                if resource.is_some_and(|r| r != kind) {
                    continue;
                }
                println!("{:<10} {}", kind, cursor.as_deref().unwrap_or("unset"));
            }
            Ok(())
        }
        Commands::Reset { yes } => {
            use dialoguer::{theme::ColorfulTheme, Confirm};

            let state_dir = config.state_dir();
            if !yes {
                let confirmed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!(
                        "Delete all cursors and replicated data under {}?",
                        state_dir.display()
                    ))
                    .default(false)
                    .interact()
                    .context("Failed to read confirmation")?;
                if !confirmed {
                    println!("Reset cancelled.");
                    return Ok(());
                }
            }
            let replicator = Replicator::from_config(config)?;
            replicator.cleanup().await?;
            println!("Removed cursors and output under {}", state_dir.display());
            Ok(())
        }
    }
}

/// Production replicator with Ctrl+C wired to a graceful stop between pages.
/// A second Ctrl+C exits immediately.
fn build_replicator(config: ReplicatorConfig) -> anyhow::Result<Replicator> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            if shutdown_tx.send_replace(true) {
                eprintln!("Interrupted again, exiting without waiting for the current page");
                std::process::exit(130);
            }
            tracing::info!("Received shutdown signal, finishing current page");
        }
    });

    Ok(Replicator::from_config(config)
        .context("Invalid replicator configuration")?
        .with_shutdown(shutdown_rx))
}

fn print_summary(stats: &[RunStats]) {
    println!();
    println!("========================================");
    println!("Replication complete");
    println!("========================================");
    for s in stats {
        println!(
            "  {:<10} {:>8} records  {:>5} pages  cursor {}  ({:?})",
            s.resource,
            s.records,
            s.pages,
            s.final_cursor.as_deref().unwrap_or("unchanged"),
            s.stop_reason
        );
    }
}
