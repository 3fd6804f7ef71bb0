use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Sync job-portal tabs into the master job sheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass over every enabled tab.
    Sync,
    /// Print a markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Serve the dashboard.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = jobsync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} status={} new={} updated={} unchanged={} failed_tabs={} reports={}",
                summary.run_id,
                summary.status_label(),
                summary.new_jobs,
                summary.updated_jobs,
                summary.unchanged_jobs,
                summary.failed_tabs.len(),
                summary.reports_dir.as_deref().unwrap_or("not written"),
            );
        }
        Commands::Report { runs, workspace } => {
            let root = workspace.unwrap_or_else(jobsync_sync::workspace_root_from_env);
            println!("{}", jobsync_sync::report_recent_markdown(runs, Some(root))?);
        }
        Commands::Serve => {
            jobsync_web::serve_from_env().await?;
        }
    }

    Ok(())
}
