//! Bulk CSV export behind a button: trigger, wait for the file, parse by header, delete.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::NaiveDate;
use jobd_core::{is_placeholder, normalize_posting_date, FreshnessPolicy, JobListing, RawListing, Source};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::playwright::{PlaywrightConfig, PlaywrightSession};
use crate::{retain_fresh, AdapterContext, AdapterError, ColumnMap};

/// Browsers write in-flight downloads under one of these extensions.
const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "part", "tmp", "download"];

#[async_trait]
pub trait ExportTrigger: Send {
    async fn trigger_export(&mut self) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub dir: PathBuf,
    pub attempts: usize,
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("downloads"),
            attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Click path that opens the export. Defaults follow the Airtable shared-view menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSelectors {
    pub frame: Option<String>,
    pub clicks: Vec<String>,
}

impl Default for ExportSelectors {
    fn default() -> Self {
        Self {
            frame: Some(r#"iframe[src*="airtable.com/embed"]"#.to_string()),
            clicks: vec![
                r#"[aria-label="View menu"]"#.to_string(),
                "li:has-text(\"Download CSV\")".to_string(),
            ],
        }
    }
}

/// Size and modification time of a directory entry; a rewrite of an existing path
/// changes at least one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

async fn snapshot_dir(dir: &Path) -> Result<HashMap<PathBuf, Fingerprint>, AdapterError> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = HashMap::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        files.insert(entry.path(), Fingerprint::of(&meta));
    }
    Ok(files)
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PARTIAL_SUFFIXES.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Removes in-flight leftovers from interrupted downloads.
async fn clear_partials(dir: &Path, source_id: &str) -> Result<(), AdapterError> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_partial(&path) {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => debug!(source_id, path = %path.display(), "removed partial download"),
            Err(err) => warn!(source_id, path = %path.display(), error = %err, "could not remove partial download"),
        }
    }
    Ok(())
}

/// A completed download: a non-empty regular file, not partial, that is either new
/// since `before` or was rewritten in place.
async fn find_completed(
    dir: &Path,
    before: &HashMap<PathBuf, Fingerprint>,
) -> Result<Option<PathBuf>, AdapterError> {
    let mut candidates = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_partial(&path) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        if before.get(&path) == Some(&Fingerprint::of(&meta)) {
            continue;
        }
        candidates.push(path);
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Fires the trigger and polls `config.dir`, re-triggering after each attempt that
/// produced nothing.
pub async fn wait_for_download<T>(
    trigger: &mut T,
    config: &DownloadConfig,
    source_id: &str,
) -> Result<PathBuf, AdapterError>
where
    T: ExportTrigger + ?Sized,
{
    fs::create_dir_all(&config.dir).await?;
    clear_partials(&config.dir, source_id).await?;
    let before = snapshot_dir(&config.dir).await?;

    for attempt in 1..=config.attempts {
        trigger.trigger_export().await?;
        let deadline = Instant::now() + config.attempt_timeout;
        loop {
            if let Some(path) = find_completed(&config.dir, &before).await? {
                info!(source_id, attempt, path = %path.display(), "export downloaded");
                return Ok(path);
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(config.poll_interval).await;
        }
        warn!(source_id, attempt, "no export file yet");
    }

    clear_partials(&config.dir, source_id).await?;
    Err(AdapterError::DownloadTimedOut {
        attempts: config.attempts,
    })
}

/// Header-mapped CSV parse. Records need a real title and company; dates are normalized
/// to ISO with unknown formats counted as `today`.
pub fn parse_export_csv<R: Read>(reader: R, today: NaiveDate) -> Result<Vec<JobListing>, AdapterError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| AdapterError::Message(format!("export has no readable header row: {e}")))?
        .clone();
    let columns = ColumnMap::from_headers(headers.iter());

    let mut listings = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(line = line + 2, error = %err, "skipping unreadable export row");
                continue;
            }
        };
        let raw = columns.assemble(|_, idx| record.get(idx).map(str::to_string));
        let usable = |value: &Option<String>| value.as_deref().is_some_and(|v| !is_placeholder(v));
        if !usable(&raw.title) || !usable(&raw.company) {
            continue;
        }

        let date = normalize_posting_date(raw.date.as_deref().unwrap_or_default(), today);
        let raw = RawListing {
            date: Some(date.format("%Y-%m-%d").to_string()),
            ..raw
        };
        if let Some(listing) = JobListing::from_raw(Source::InternList, raw) {
            listings.push(listing);
        }
    }
    Ok(listings)
}

/// Parses the downloaded file and removes it whether or not parsing succeeded.
pub async fn consume_download(path: &Path, today: NaiveDate) -> Result<Vec<JobListing>, AdapterError> {
    let parsed = match fs::read(path).await {
        Ok(bytes) => parse_export_csv(bytes.as_slice(), today),
        Err(err) => Err(err.into()),
    };
    if let Err(err) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "could not delete export file");
    }
    parsed
}

pub struct ExportAdapter {
    pub source_id: String,
    pub url: String,
    pub freshness: FreshnessPolicy,
    pub selectors: ExportSelectors,
    pub browser: PlaywrightConfig,
    pub download: DownloadConfig,
}

impl ExportAdapter {
    pub async fn fetch_listings(&self, ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError> {
        fs::create_dir_all(&self.download.dir).await?;
        let browser = PlaywrightConfig {
            download_dir: Some(self.download.dir.clone()),
            ..self.browser.clone()
        };
        let mut session = PlaywrightSession::launch(&browser).await?;
        let downloaded = async {
            session.goto(&self.url).await?;
            let mut menu = session.export_menu(&self.selectors);
            wait_for_download(&mut menu, &self.download, &self.source_id).await
        }
        .await;
        session.close().await;

        let listings = consume_download(&downloaded?, ctx.today).await?;
        Ok(retain_fresh(listings, self.freshness, ctx.today, &self.source_id))
    }
}
