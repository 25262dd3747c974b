//! Static HTML tables such as rendered GitHub READMEs.

use std::sync::Arc;

use jobd_core::{FreshnessPolicy, JobListing, RawListing, Source};
use jobd_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{retain_fresh, AdapterContext, AdapterError};

/// Company cell marker meaning "same company as the row above".
const CONTINUATION_MARK: &str = "↳";

/// Fixed cell positions for a README table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableColumns {
    pub company: usize,
    pub title: usize,
    pub location: usize,
    pub date: Option<usize>,
}

impl Default for TableColumns {
    fn default() -> Self {
        Self {
            company: 0,
            title: 1,
            location: 2,
            date: Some(4),
        }
    }
}

pub struct TableAdapter {
    pub source_id: String,
    pub url: String,
    pub freshness: FreshnessPolicy,
    pub columns: TableColumns,
    pub http: Arc<HttpFetcher>,
}

impl TableAdapter {
    pub async fn fetch_listings(&self, ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError> {
        let page = self.http.fetch_text(&self.source_id, &self.url).await?;
        let listings = parse_table_listings(&page.body, &self.columns)?;
        debug!(source_id = %self.source_id, rows = listings.len(), "table parsed");
        Ok(retain_fresh(listings, self.freshness, ctx.today, &self.source_id))
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector `{css}`: {e}")))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<Vec<_>>().join(" ")
}

/// Rows with fewer than three cells or without an absolute link are skipped.
pub fn parse_table_listings(html: &str, columns: &TableColumns) -> Result<Vec<JobListing>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table tbody tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector(r#"a[href^="http"]"#)?;

    let mut listings = Vec::new();
    let mut previous_company: Option<String> = None;

    for row in document.select(&row_sel) {
        let cells = row.select(&cell_sel).map(|c| cell_text(&c)).collect::<Vec<_>>();
        if cells.len() < 3 {
            continue;
        }
        let at = |idx: usize| cells.get(idx).map(|c| c.trim().to_string());

        let mut company = at(columns.company);
        if company.as_deref() == Some(CONTINUATION_MARK) {
            company = previous_company.clone();
        } else if company.as_deref().is_some_and(|c| !c.is_empty()) {
            previous_company = company.clone();
        }

        let Some(link) = row
            .select(&link_sel)
            .find_map(|a| a.value().attr("href"))
            .map(str::to_string)
        else {
            continue;
        };

        let raw = RawListing {
            title: at(columns.title),
            company,
            location: at(columns.location),
            date: columns.date.and_then(at),
            link: Some(link),
            ..Default::default()
        };
        if let Some(listing) = JobListing::from_raw(Source::GitHub, raw) {
            listings.push(listing);
        }
    }

    Ok(listings)
}
