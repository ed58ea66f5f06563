use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use cpstats_core::{AggregateSnapshot, ConfigRecord, PlatformConfig};
use cpstats_storage::ConfigStore;
use cpstats_sync::{
    export_file_name, render_export, run_once_from_env, EngineConfig, ExportFormat,
    RefreshController,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpstats")]
#[command(about = "Competitive programming stats aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch with the stored usernames and print the snapshot.
    Fetch,
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        auto_refresh: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
    Export {
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        /// File or directory; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Auto refresh until Ctrl-C, logging each completed batch.
    Watch,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    /// Replace the whole record; omitted platforms are cleared.
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[arg(long, default_value = "")]
    leetcode: String,
    #[arg(long, default_value = "")]
    codechef: String,
    #[arg(long, default_value = "")]
    hackerrank: String,
    #[arg(long, default_value = "")]
    codeforces: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Fetch) {
        Commands::Fetch => {
            let snapshot = run_once_from_env().await?;
            if let Some(summary) = snapshot.error_summary() {
                warn!(errors = %summary, "some platforms failed");
            }
            println!("{}", serde_json_pretty(&snapshot)?);
        }
        Commands::Serve { port, auto_refresh } => {
            let mut engine = engine;
            engine.auto_refresh |= auto_refresh;
            let port = port.unwrap_or(engine.web_port);
            let controller = engine.start_controller(engine.adapters()?).await?;
            cpstats_web::serve(controller, port, shutdown_signal()).await?;
        }
        Commands::Config(ConfigCommand::Show) => {
            let config = engine
                .config_store()
                .get()
                .await
                .with_context(|| format!("reading {}", engine.config_path.display()))?;
            println!("{}", serde_json_pretty(&config.to_record())?);
        }
        Commands::Config(ConfigCommand::Set(args)) => {
            let record = ConfigRecord {
                leetcode: args.leetcode,
                codechef: args.codechef,
                hackerrank: args.hackerrank,
                codeforces: args.codeforces,
            };
            let config = PlatformConfig::from_record(&record)?;
            engine
                .config_store()
                .set(&config)
                .await
                .with_context(|| format!("writing {}", engine.config_path.display()))?;
            println!(
                "configuration saved: {} platform(s) configured",
                config.configured().len()
            );
        }
        Commands::Export { format, out } => {
            let snapshot = run_once_from_env().await?;
            let body = render_export(&snapshot, format).context("rendering export")?;
            match out {
                Some(path) => {
                    let path = if path.is_dir() {
                        path.join(export_file_name(format, Utc::now().date_naive()))
                    } else {
                        path
                    };
                    tokio::fs::write(&path, body)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("export written: {}", path.display());
                }
                None => println!("{body}"),
            }
        }
        Commands::Watch => {
            let mut engine = engine;
            engine.auto_refresh = true;
            let controller = engine.start_controller(engine.adapters()?).await?;
            watch_batches(&controller, shutdown_signal()).await;
            controller.set_auto_refresh(false).await?;
        }
    }

    Ok(())
}

/// Logs the startup snapshot, then each completed batch until `shutdown` resolves.
async fn watch_batches(controller: &RefreshController, shutdown: impl Future<Output = ()>) -> usize {
    let mut snapshots = controller.subscribe_snapshot();
    let mut logged = 0;
    let startup = snapshots.borrow_and_update().clone();
    if let Some(snapshot) = startup {
        log_snapshot(&snapshot);
        logged += 1;
    }
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = snapshots.borrow_and_update().clone();
                if let Some(snapshot) = latest {
                    log_snapshot(&snapshot);
                    logged += 1;
                }
            }
        }
    }
    logged
}

fn log_snapshot(snapshot: &AggregateSnapshot) {
    let summary = snapshot.summary();
    info!(
        batch_id = %snapshot.batch_id(),
        total_problems = summary.total_problems,
        platforms = summary.platforms_reporting,
        errors = snapshot.errors().len(),
        "snapshot updated"
    );
}

fn serde_json_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
