//! Run orchestration: source registry, configuration, aggregation, the single-flight
//! orchestrator and its schedule.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobd_adapters::{AdapterDeps, DownloadConfig, GridConfig, PlaywrightConfig, SourceConfig};
use jobd_notify::{DigestWriter, DiscordWebhookNotifier, LogNotifier, Notifier};
use jobd_storage::{HttpClientConfig, HttpFetcher, SqliteSeenStore};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod aggregator;
pub mod orchestrator;

#[cfg(test)]
mod tests_support;

pub use aggregator::{merge_listings, Aggregation, Aggregator, SourceFailure};
pub use orchestrator::{Orchestrator, RunError, RunOutcome, RunReport, RunStatus, StatusSnapshot};

pub const CRATE_NAME: &str = "jobd-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut ids = std::collections::HashSet::new();
        for source in &registry.sources {
            if !ids.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id `{}`", source.source_id);
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub schedule: String,
    pub dispatch_delay: Duration,
    pub reports_dir: PathBuf,
    pub download_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub node_bin: String,
    pub headless: bool,
    pub discord_webhook_url: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "sqlite://jobs.db"),
            sources_path: PathBuf::from(env_or("JOBD_SOURCES", "sources.yaml")),
            schedule: env_or("JOBD_SCHEDULE", "0 */10 * * * *"),
            dispatch_delay: Duration::from_millis(env_parse("JOBD_DISPATCH_DELAY_MS", 2000)),
            reports_dir: PathBuf::from(env_or("JOBD_REPORTS_DIR", "./reports")),
            download_dir: PathBuf::from(env_or("JOBD_DOWNLOAD_DIR", "./downloads")),
            user_agent: env_or("JOBD_USER_AGENT", "jobd/0.1"),
            http_timeout_secs: env_parse("JOBD_HTTP_TIMEOUT_SECS", 20),
            node_bin: env_or("JOBD_NODE_BIN", "node"),
            headless: std::env::var("JOBD_HEADLESS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn adapter_deps(&self) -> Result<AdapterDeps> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(AdapterDeps {
            http: Arc::new(http),
            browser: PlaywrightConfig {
                node_bin: self.node_bin.clone(),
                headless: self.headless,
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            },
            grid: GridConfig::default(),
            download: DownloadConfig {
                dir: self.download_dir.clone(),
                ..Default::default()
            },
        })
    }

    /// The Discord webhook when configured, otherwise log output.
    pub fn notifier(&self, test: bool) -> Result<Arc<dyn Notifier>> {
        match &self.discord_webhook_url {
            Some(url) => {
                let notifier = DiscordWebhookNotifier::new(url.clone(), self.http_timeout())?;
                Ok(Arc::new(if test { notifier.for_test() } else { notifier }))
            }
            None => {
                warn!("DISCORD_WEBHOOK_URL not set; new listings will only be logged");
                Ok(Arc::new(LogNotifier))
            }
        }
    }
}

/// Wires store, adapters and collaborators from configuration.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<Orchestrator> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let store = SqliteSeenStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening seen-store at {}", config.database_url))?;
    let aggregator = Aggregator::from_registry(&registry, &config.adapter_deps()?);
    info!(sources = ?aggregator.source_ids(), "registered sources");

    Ok(Orchestrator::new(
        aggregator,
        Arc::new(store),
        config.notifier(false)?,
        Arc::new(DigestWriter::new(config.reports_dir.clone())),
    )
    .with_dispatch_delay(config.dispatch_delay))
}

/// Runs once right away, then on `schedule`. Overlapping ticks are absorbed by the
/// orchestrator's run flag.
pub async fn start_scheduler(orchestrator: Arc<Orchestrator>, schedule: &str) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;

    let tick_orchestrator = Arc::clone(&orchestrator);
    let job = Job::new_async(schedule, move |_uuid, _lock| {
        let orchestrator = Arc::clone(&tick_orchestrator);
        Box::pin(async move {
            orchestrator.run_once().await;
        })
    })
    .with_context(|| format!("creating run job for schedule `{schedule}`"))?;
    scheduler.add(job).await.context("adding run job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(schedule, "scheduler started");

    tokio::spawn(async move {
        orchestrator.run_once().await;
    });
    Ok(scheduler)
}
