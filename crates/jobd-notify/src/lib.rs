//! Outbound collaborators: per-listing notifiers and the per-run batch summary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use askama::Template;
use async_trait::async_trait;
use chrono::{Local, Utc};
use jobd_core::JobListing;
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobd-notify";

const EMBED_COLOR: u32 = 0x9b59ff;
const DIVIDER: &str = "⋆⁺₊⋆ ━━━━━━━━━━━━━━━━━━⊱༒︎ • ༒︎⊰━━━━━━━━━━━━━━━━━━ ⋆⁺₊⋆";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered,
    Skipped(String),
    Failed(String),
}

impl DispatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DispatchOutcome::Failed(_))
    }
}

/// Per-listing delivery. Implementations report problems as [`DispatchOutcome`]
/// instead of returning errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, listing: &JobListing) -> DispatchOutcome;

    async fn announce_batch(&self, _count: usize) -> DispatchOutcome {
        DispatchOutcome::Delivered
    }
}

/// Receives every run's new listings once, after per-listing dispatch.
#[async_trait]
pub trait BatchSummary: Send + Sync {
    async fn summarize(&self, run_id: Uuid, listings: &[JobListing]) -> DispatchOutcome;
}

/// Discord message body for one listing, with an optional `[TEST]` marker.
pub fn listing_payload(listing: &JobListing, test: bool) -> serde_json::Value {
    let prefix = if test { "**[TEST]** " } else { "" };
    let content = [
        DIVIDER.to_string(),
        String::new(),
        format!("{prefix}**New Internship** (From {})", listing.source),
        format!("**Role:** {}", listing.title),
        format!("**Company:** {}", listing.company),
        format!("**Location:** {}", listing.location),
        format!("**Work Model:** {}", listing.work_model),
        format!("**Date Posted:** {}", listing.date),
        format!("**Salary:** {}", listing.salary),
        format!("**Link:** {}", listing.link),
        String::new(),
        DIVIDER.to_string(),
    ]
    .join("\n");

    let field = |name: &str, value: &str| json!({ "name": name, "value": value, "inline": false });
    json!({
        "content": content,
        "embeds": [{
            "title": listing.title,
            "description": "New SWE internship posted!",
            "color": EMBED_COLOR,
            "fields": [
                field("Company", &listing.company),
                field("Location", &listing.location),
                field("Work Model", &listing.work_model),
                field("Date Posted", &listing.date),
                field("Salary", &listing.salary),
            ],
            "timestamp": Utc::now().to_rfc3339(),
        }],
    })
}

/// `@everyone` header that precedes a batch, stamped like `[November 26, 2025 | 3:05PM]`.
pub fn announce_payload<Tz>(now: chrono::DateTime<Tz>) -> serde_json::Value
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let stamp = now.format("[%B %-d, %Y | %-I:%M%p]");
    json!({ "content": format!("@everyone\n\n**New Internship Postings {stamp}**") })
}

pub struct DiscordWebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
    test: bool,
}

impl DiscordWebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            test: false,
        })
    }

    /// Marks every message from this notifier as a test.
    pub fn for_test(mut self) -> Self {
        self.test = true;
        self
    }

    async fn post(&self, payload: &serde_json::Value) -> DispatchOutcome {
        match self.client.post(&self.webhook_url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => DispatchOutcome::Delivered,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                DispatchOutcome::Failed(format!("webhook returned {status}: {body}"))
            }
            Err(err) => DispatchOutcome::Failed(format!("webhook request failed: {err}")),
        }
    }
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
    async fn dispatch(&self, listing: &JobListing) -> DispatchOutcome {
        let outcome = self.post(&listing_payload(listing, self.test)).await;
        if let DispatchOutcome::Failed(reason) = &outcome {
            warn!(listing_id = %listing.id, reason = %reason, "discord notification failed");
        }
        outcome
    }

    async fn announce_batch(&self, count: usize) -> DispatchOutcome {
        let outcome = self.post(&announce_payload(Local::now())).await;
        if let DispatchOutcome::Failed(reason) = &outcome {
            warn!(count, reason = %reason, "discord batch ping failed");
        }
        outcome
    }
}

/// Stand-in notifier when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn dispatch(&self, listing: &JobListing) -> DispatchOutcome {
        info!(
            listing_id = %listing.id,
            title = %listing.title,
            company = %listing.company,
            source = %listing.source,
            link = %listing.link,
            "new listing"
        );
        DispatchOutcome::Delivered
    }

    async fn announce_batch(&self, count: usize) -> DispatchOutcome {
        info!(count, "new listings found");
        DispatchOutcome::Delivered
    }
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate<'a> {
    run_id: String,
    generated_at: String,
    listings: &'a [JobListing],
}

fn digest_markdown(run_id: Uuid, generated_at: &str, listings: &[JobListing]) -> String {
    let mut out = format!(
        "# New Internships Found ({})\n\n- Run ID: `{}`\n- Generated: {}\n\n",
        listings.len(),
        run_id,
        generated_at
    );
    for listing in listings {
        out.push_str(&format!(
            "## {}\n\n- Company: {}\n- Location: {}\n- Work Model: {}\n- Salary: {}\n- Source: {}\n- Link: {}\n\n",
            listing.title,
            listing.company,
            listing.location,
            listing.work_model,
            listing.salary,
            listing.source,
            listing.link
        ));
    }
    out
}

/// Writes `digest.html`, `digest.md` and `new_listings.json` under `<reports_dir>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct DigestWriter {
    reports_dir: PathBuf,
}

impl DigestWriter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub async fn write(&self, run_id: Uuid, listings: &[JobListing]) -> Result<PathBuf> {
        let dir = self.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let generated_at = Utc::now().to_rfc3339();
        let html = DigestTemplate {
            run_id: run_id.to_string(),
            generated_at: generated_at.clone(),
            listings,
        }
        .render()
        .context("rendering digest.html")?;
        fs::write(dir.join("digest.html"), html)
            .await
            .context("writing digest.html")?;

        fs::write(dir.join("digest.md"), digest_markdown(run_id, &generated_at, listings))
            .await
            .context("writing digest.md")?;

        let json = serde_json::to_vec_pretty(&json!({
            "run_id": run_id,
            "generated_at": generated_at,
            "listings": listings,
        }))
        .context("serializing new listings")?;
        fs::write(dir.join("new_listings.json"), json)
            .await
            .context("writing new_listings.json")?;

        Ok(dir)
    }
}

#[async_trait]
impl BatchSummary for DigestWriter {
    async fn summarize(&self, run_id: Uuid, listings: &[JobListing]) -> DispatchOutcome {
        if listings.is_empty() {
            return DispatchOutcome::Skipped("empty batch".to_string());
        }
        match self.write(run_id, listings).await {
            Ok(dir) => {
                info!(%run_id, count = listings.len(), path = %dir.display(), "digest written");
                DispatchOutcome::Delivered
            }
            Err(err) => {
                warn!(%run_id, error = %err, "digest write failed");
                DispatchOutcome::Failed(format!("{err:#}"))
            }
        }
    }
}
