//! taplive CLI - live bar dashboards from the command line
//!
//! Usage:
//!   taplive watch --event 7 --event 8   Stream composed dashboard views as JSON lines
//!   taplive snapshot --event 7          Fetch totals and top products once
//!   taplive config init [PATH]          Write the default configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use taplive_core::{LiveConfig, SubjectId, DEFAULT_CONFIG_FILE};
use taplive_sync::{DashboardView, LiveDashboard, SyncContext};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "taplive")]
#[command(author, version, about = "Live sales dashboards for event bars")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount live dashboards and print every view change until Ctrl-C
    Watch {
        /// Event to watch (repeatable)
        #[arg(short, long = "event", value_name = "ID", required = true)]
        events: Vec<SubjectId>,
    },

    /// Fetch totals and top products once
    Snapshot {
        /// Event to fetch
        #[arg(short, long, value_name = "ID")]
        event: SubjectId,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration
    Init {
        /// Target path (defaults to ./taplive.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for JSON output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Watch { events } => cmd_watch(&cli.config, events).await,
        Commands::Snapshot { event } => cmd_snapshot(&cli.config, event).await,
        Commands::Config { action } => match action {
            ConfigCommands::Init { path, force } => cmd_config_init(path, force),
        },
    }
}

fn load_context(path: &Path) -> Result<SyncContext> {
    let config = LiveConfig::load_or_default(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    debug!("Using backend {}", config.backend.api_base_url);
    SyncContext::from_config(config).context("Failed to set up the sync engine")
}

async fn cmd_watch(config_path: &Path, events: Vec<SubjectId>) -> Result<()> {
    let context = load_context(config_path)?;
    let (views_tx, mut views_rx) = mpsc::unbounded_channel::<DashboardView>();

    let mut dashboards: Vec<LiveDashboard> = Vec::with_capacity(events.len());
    for event in events {
        let dashboard = context.mount(event);
        let mut view = dashboard.view();
        let views_tx = views_tx.clone();
        tokio::spawn(async move {
            let current = view.borrow_and_update().clone();
            if views_tx.send(current).is_err() {
                return;
            }
            while view.changed().await.is_ok() {
                let next = view.borrow_and_update().clone();
                if views_tx.send(next).is_err() {
                    break;
                }
            }
        });
        dashboards.push(dashboard);
    }
    drop(views_tx);

    info!("Watching {} dashboard(s); press Ctrl-C to stop", dashboards.len());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            view = views_rx.recv() => match view {
                Some(view) => println!("{}", serde_json::to_string(&view)?),
                None => break,
            },
        }
    }

    for dashboard in &mut dashboards {
        dashboard.stop().await;
    }
    Ok(())
}

async fn cmd_snapshot(config_path: &Path, event: SubjectId) -> Result<()> {
    let context = load_context(config_path)?;
    let limit = context.config().refresh.top_products_limit;

    let snapshot = context
        .fetcher()
        .fetch_totals(event)
        .await
        .with_context(|| format!("Failed to fetch totals for event {}", event))?;
    let ranking = context
        .fetcher()
        .fetch_top_products(event, limit)
        .await
        .with_context(|| format!("Failed to fetch top products for event {}", event))?;

    let output = serde_json::json!({
        "eventId": event,
        "fetchedAt": snapshot.fetched_at,
        "totals": snapshot.totals,
        "topProducts": ranking.items,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_config_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    LiveConfig::write_default(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["taplive", "watch", "--event", "7", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Watch { ref events } if events == &[7]));

        let cli = Cli::try_parse_from(["taplive", "config", "init", "-v"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn test_verbose_defaults_off() {
        let cli = Cli::try_parse_from(["taplive", "snapshot", "--event", "3"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }
}
