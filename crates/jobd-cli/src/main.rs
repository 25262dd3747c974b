use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobd_core::{JobListing, RawListing, Source};
use jobd_notify::DispatchOutcome;
use jobd_sync::{build_orchestrator, start_scheduler, RunStatus, SourceRegistry, SyncConfig};
use jobd_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "jobd=info,jobd_sync=info,jobd_adapters=info,jobd_notify=info,jobd_storage=info,sqlx=warn";

#[derive(Debug, Parser)]
#[command(name = "jobd")]
#[command(about = "JobDaemon: watches internship boards and announces new postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run at startup and on schedule, serving the health listener.
    Daemon,
    /// Run the pipeline once and print the report.
    Once,
    /// List configured sources.
    Sources,
    /// Send a sample `[TEST]` listing through the configured notifier.
    NotifyTest,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => daemon(config).await?,
        Commands::Once => {
            let orchestrator = build_orchestrator(&config).await?;
            match orchestrator.run_once().await {
                RunStatus::Finished(report) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&report).context("serializing run report")?
                    );
                }
                RunStatus::Skipped => println!("run skipped: another run is in progress"),
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\t{:?}\t{:?}\t{}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.mode,
                    source.freshness,
                    source.url
                );
            }
        }
        Commands::NotifyTest => {
            let notifier = config.notifier(true)?;
            let listing = sample_listing().context("building sample listing")?;
            match notifier.dispatch(&listing).await {
                DispatchOutcome::Failed(reason) => anyhow::bail!("test notification failed: {reason}"),
                outcome => println!("test notification: {outcome:?}"),
            }
        }
    }

    Ok(())
}

async fn daemon(config: SyncConfig) -> Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    let orchestrator = Arc::new(build_orchestrator(&config).await?);
    let mut scheduler = start_scheduler(Arc::clone(&orchestrator), &config.schedule).await?;

    jobd_web::serve(AppState::new(orchestrator), port, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "listening for ctrl-c failed");
        }
        info!("shutdown requested");
    })
    .await?;

    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn sample_listing() -> Option<JobListing> {
    JobListing::from_raw(
        Source::InternList,
        RawListing {
            title: Some("Software Engineering Intern".to_string()),
            company: Some("JobDaemon".to_string()),
            location: Some("Remote".to_string()),
            date: Some(chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()),
            salary: Some("$40/hr".to_string()),
            work_model: Some("Remote".to_string()),
            link: Some("https://example.com/jobd/test-listing".to_string()),
        },
    )
}
