//! Durable seen-listing store + HTTP fetch utilities for jobd.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobd_core::JobListing;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobd-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("seen-store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Append-only record of listing ids that have already been announced.
///
/// Callers serialize access; implementations need no internal locking.
#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn has(&self, id: &str) -> Result<bool, StoreError>;

    /// Insert-if-absent. Recording an existing id is a no-op.
    async fn record(&self, listing: &JobListing) -> Result<(), StoreError>;
}

/// Snapshot of a listing as it looked when first observed.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SeenEntry {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub date: String,
    pub salary: String,
    pub work_model: String,
    pub source: String,
    pub link: String,
    pub first_seen_at: String,
}

#[derive(Debug, Clone)]
pub struct SqliteSeenStore {
    pool: SqlitePool,
}

impl SqliteSeenStore {
    /// Opens (creating if needed) the store at `database_url`, e.g. `sqlite://jobs.db`.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_listings (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT NOT NULL,
                date TEXT NOT NULL,
                salary TEXT NOT NULL,
                work_model TEXT NOT NULL,
                source TEXT NOT NULL,
                link TEXT NOT NULL,
                first_seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SeenEntry>, StoreError> {
        let entry = sqlx::query_as::<_, SeenEntry>("SELECT * FROM seen_listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM seen_listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SeenStore for SqliteSeenStore {
    async fn has(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM seen_listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record(&self, listing: &JobListing) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO seen_listings (id, title, company, location, date, salary, work_model, source, link, first_seen_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&listing.id)
        .bind(&listing.title)
        .bind(&listing.company)
        .bind(&listing.location)
        .bind(&listing.date)
        .bind(&listing.salary)
        .bind(&listing.work_model)
        .bind(listing.source.label())
        .bind(&listing.link)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Statuses worth another try: throttling, request timeout and server-side errors.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// `Retry-After` in its delay-seconds form; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (0-based). A server-supplied `Retry-After`
    /// replaces the doubling schedule; both are capped at `max_delay`.
    pub fn next_delay(&self, retry: usize, server_hint: Option<Duration>) -> Duration {
        let delay = server_hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Page fetcher with bounded exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("building reqwest client: {e}"))?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0usize;
        loop {
            let exhausted = retry >= self.backoff.max_retries;
            let hint = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if exhausted || !is_transient_status(status) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    let hint = retry_after(resp.headers());
                    warn!(retry, status = status.as_u16(), ?hint, "transient http status");
                    hint
                }
                Err(err) => {
                    if exhausted || !is_transient_error(&err) {
                        return Err(FetchError::Request(err));
                    }
                    warn!(retry, error = %err, "transient request error");
                    None
                }
            };

            tokio::time::sleep(self.backoff.next_delay(retry, hint)).await;
            retry += 1;
        }
    }
}
