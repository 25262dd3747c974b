//! Source adapter contract plus the three production adapter shapes: static HTML tables,
//! a virtualized grid read by scrolling a browser session, and a bulk CSV export.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use jobd_core::{FreshnessPolicy, JobListing, RawListing, Source};
use jobd_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

pub mod export;
pub mod grid;
pub mod playwright;
pub mod table;

pub use export::{DownloadConfig, ExportAdapter, ExportSelectors, ExportTrigger};
pub use grid::{GridAdapter, GridConfig, GridSelectors, GridSurface, PaneSnapshot};
pub use playwright::{PlaywrightConfig, PlaywrightSession};
pub use table::{TableAdapter, TableColumns};

pub const CRATE_NAME: &str = "jobd-adapters";

/// Per-run facts handed to every adapter. `today` is fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub today: NaiveDate,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            today: Local::now().date_naive(),
        }
    }

    pub fn for_day(today: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            today,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("browser driver: {0}")]
    Browser(String),
    #[error("no completed export appeared after {attempts} attempts")]
    DownloadTimedOut { attempts: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a source produced this run. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(Vec<JobListing>),
    Failed { reason: String },
}

impl FetchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failed { .. })
    }

    pub fn into_listings(self) -> Vec<JobListing> {
        match self {
            FetchOutcome::Fetched(listings) => listings,
            FetchOutcome::Failed { .. } => Vec::new(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn source(&self) -> Source;

    async fn try_fetch(&self, ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError>;

    /// Never fails: errors are logged once with the source identity and reported as
    /// [`FetchOutcome::Failed`].
    async fn fetch(&self, ctx: &AdapterContext) -> FetchOutcome {
        match self.try_fetch(ctx).await {
            Ok(listings) => {
                info!(source_id = self.source_id(), count = listings.len(), "source fetched");
                FetchOutcome::Fetched(listings)
            }
            Err(err) => {
                error!(
                    source_id = self.source_id(),
                    run_id = %ctx.run_id,
                    error = %err,
                    "source fetch failed; continuing with no listings from it"
                );
                FetchOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Table,
    Grid,
    Export,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    pub url: String,
    /// Required: every source states how its dates are judged.
    pub freshness: FreshnessPolicy,
    #[serde(default)]
    pub columns: TableColumns,
    #[serde(default)]
    pub grid: GridSelectors,
    #[serde(default)]
    pub export: ExportSelectors,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Shared collaborators that adapters are built from.
#[derive(Clone)]
pub struct AdapterDeps {
    pub http: Arc<HttpFetcher>,
    pub browser: PlaywrightConfig,
    pub grid: GridConfig,
    pub download: DownloadConfig,
}

pub enum Adapter {
    Table(TableAdapter),
    Grid(GridAdapter),
    Export(ExportAdapter),
}

#[async_trait]
impl SourceAdapter for Adapter {
    fn source_id(&self) -> &str {
        match self {
            Adapter::Table(a) => &a.source_id,
            Adapter::Grid(a) => &a.source_id,
            Adapter::Export(a) => &a.source_id,
        }
    }

    fn source(&self) -> Source {
        match self {
            Adapter::Table(_) => Source::GitHub,
            Adapter::Grid(_) | Adapter::Export(_) => Source::InternList,
        }
    }

    async fn try_fetch(&self, ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError> {
        match self {
            Adapter::Table(a) => a.fetch_listings(ctx).await,
            Adapter::Grid(a) => a.fetch_listings(ctx).await,
            Adapter::Export(a) => a.fetch_listings(ctx).await,
        }
    }
}

pub fn adapter_for_source(config: &SourceConfig, deps: &AdapterDeps) -> Adapter {
    match config.mode {
        SourceMode::Table => Adapter::Table(TableAdapter {
            source_id: config.source_id.clone(),
            url: config.url.clone(),
            freshness: config.freshness,
            columns: config.columns,
            http: Arc::clone(&deps.http),
        }),
        SourceMode::Grid => Adapter::Grid(GridAdapter {
            source_id: config.source_id.clone(),
            url: config.url.clone(),
            freshness: config.freshness,
            selectors: config.grid.clone(),
            browser: deps.browser.clone(),
            grid: deps.grid,
        }),
        SourceMode::Export => Adapter::Export(ExportAdapter {
            source_id: config.source_id.clone(),
            url: config.url.clone(),
            freshness: config.freshness,
            selectors: config.export.clone(),
            browser: deps.browser.clone(),
            download: deps.download.clone(),
        }),
    }
}

/// Keeps listings whose date marker passes `policy`. Only a count of the dropped
/// listings is logged.
pub fn retain_fresh(
    listings: Vec<JobListing>,
    policy: FreshnessPolicy,
    today: NaiveDate,
    source_id: &str,
) -> Vec<JobListing> {
    let total = listings.len();
    let fresh = listings
        .into_iter()
        .filter(|listing| policy.is_fresh(&listing.date, today))
        .collect::<Vec<_>>();
    debug!(
        source_id,
        ?policy,
        kept = fresh.len(),
        stale = total - fresh.len(),
        "freshness filter applied"
    );
    fresh
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Title,
    Company,
    Location,
    Date,
    Salary,
    WorkModel,
    Link,
}

/// Header spellings seen across exports and the grid widget, compared lowercase with
/// whitespace collapsed.
const HEADER_VARIANTS: &[(Column, &[&str])] = &[
    (Column::Title, &["position title", "title", "job title", "role", "position"]),
    (Column::Company, &["company", "company name", "employer"]),
    (Column::Location, &["location", "locations", "city"]),
    (
        Column::Date,
        &["date", "date posted", "posted", "posting date", "posted on"],
    ),
    (
        Column::Salary,
        &["salary", "pay", "compensation", "hourly rate", "salary range"],
    ),
    (
        Column::WorkModel,
        &["work model", "workplace", "work type", "remote", "work arrangement"],
    ),
    (
        Column::Link,
        &["apply", "apply link", "application link", "link", "url", "apply url"],
    ),
];

fn header_key(header: &str) -> String {
    header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(':')
        .to_lowercase()
}

/// Header name -> column position. The first header matching a column wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    indices: HashMap<Column, usize>,
}

impl ColumnMap {
    pub fn from_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut indices = HashMap::new();
        for (idx, header) in headers.into_iter().enumerate() {
            let key = header_key(header.as_ref());
            let matched = HEADER_VARIANTS
                .iter()
                .find(|(_, variants)| variants.contains(&key.as_str()));
            if let Some((column, _)) = matched {
                indices.entry(*column).or_insert(idx);
            }
        }
        Self { indices }
    }

    pub fn get(&self, column: Column) -> Option<usize> {
        self.indices.get(&column).copied()
    }

    /// Builds a raw listing by asking `cell` for each mapped column's value.
    pub fn assemble<F>(&self, mut cell: F) -> RawListing
    where
        F: FnMut(Column, usize) -> Option<String>,
    {
        let mut pick = |column: Column| self.get(column).and_then(|idx| cell(column, idx));
        RawListing {
            title: pick(Column::Title),
            company: pick(Column::Company),
            location: pick(Column::Location),
            date: pick(Column::Date),
            salary: pick(Column::Salary),
            work_model: pick(Column::WorkModel),
            link: pick(Column::Link),
        }
    }
}

#[cfg(test)]
pub(crate) fn workspace_fixture(relative: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(relative)
}
