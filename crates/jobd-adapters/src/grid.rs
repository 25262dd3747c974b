//! Virtualized spreadsheet grid read by scrolling and re-scraping until no new rows show up.
//!
//! The widget renders a frozen left pane (row id + title) and a scrolling right pane
//! (row id + every other column). Rows are emitted only when both halves are visible.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use jobd_core::{normalize_posting_date, FreshnessPolicy, JobListing, RawListing, Source};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::playwright::{PlaywrightConfig, PlaywrightSession};
use crate::{retain_fresh, AdapterContext, AdapterError, Column, ColumnMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCell {
    pub text: String,
    #[serde(default)]
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeftRow {
    pub row_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightRow {
    pub row_id: String,
    pub cells: Vec<GridCell>,
}

/// Whatever is currently rendered in the grid viewport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneSnapshot {
    #[serde(default)]
    pub headers: Vec<String>,
    pub left: Vec<LeftRow>,
    pub right: Vec<RightRow>,
}

#[async_trait]
pub trait GridSurface: Send {
    async fn visible_rows(&mut self) -> Result<PaneSnapshot, AdapterError>;
    async fn scroll_forward(&mut self) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    pub settle: Duration,
    pub idle_limit: usize,
    pub max_iterations: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(1500),
            idle_limit: 5,
            max_iterations: 30,
        }
    }
}

/// CSS selectors for the embedded grid. Defaults target the Airtable shared-view embed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSelectors {
    pub frame: Option<String>,
    pub left_rows: String,
    pub left_title: String,
    pub right_rows: String,
    pub row_id_attr: String,
    pub cells: String,
    pub headers: String,
    pub scroller: String,
}

impl Default for GridSelectors {
    fn default() -> Self {
        Self {
            frame: Some(r#"iframe[src*="airtable.com/embed"]"#.to_string()),
            left_rows: ".dataLeftPane .dataRow[data-rowid]".to_string(),
            left_title: ".cell.primary".to_string(),
            right_rows: ".dataRightPane .dataRow[data-rowid]".to_string(),
            row_id_attr: "data-rowid".to_string(),
            cells: ".cell[data-columnid]".to_string(),
            headers: ".headerRightPane .cell[data-columnid]".to_string(),
            scroller: ".dataRightPane .antiscroll-inner".to_string(),
        }
    }
}

/// Joins left and right panes on row id, in right-pane order.
pub fn correlate_panes(snapshot: &PaneSnapshot) -> Vec<RawListing> {
    let columns = ColumnMap::from_headers(&snapshot.headers);
    let titles = snapshot
        .left
        .iter()
        .map(|row| (row.row_id.as_str(), row.title.as_str()))
        .collect::<HashMap<_, _>>();

    snapshot
        .right
        .iter()
        .filter_map(|row| {
            let title = titles.get(row.row_id.as_str())?;
            let mut raw = columns.assemble(|column, idx| {
                let cell = row.cells.get(idx)?;
                match (column, &cell.href) {
                    (Column::Link, Some(href)) => Some(href.clone()),
                    _ => Some(cell.text.clone()),
                }
            });
            raw.title = Some(title.to_string());
            if raw.link.is_none() {
                raw.link = row.cells.iter().find_map(|cell| cell.href.clone());
            }
            Some(raw)
        })
        .collect()
}

/// Scrolls until `idle_limit` consecutive passes add nothing, or `max_iterations` passes
/// have run. The result is reversed so the oldest posting comes first.
pub async fn collect_grid<S>(
    surface: &mut S,
    config: &GridConfig,
    source: Source,
    source_id: &str,
) -> Result<Vec<JobListing>, AdapterError>
where
    S: GridSurface + ?Sized,
{
    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    let mut idle_passes = 0usize;

    for iteration in 1..=config.max_iterations {
        let snapshot = surface.visible_rows().await?;
        let mut added = 0usize;
        for raw in correlate_panes(&snapshot) {
            let Some(listing) = JobListing::from_raw(source, raw) else {
                continue;
            };
            if seen.insert(listing.id.clone()) {
                collected.push(listing);
                added += 1;
            }
        }
        debug!(source_id, iteration, added, total = collected.len(), "grid pass");

        if added == 0 {
            idle_passes += 1;
            if idle_passes >= config.idle_limit {
                info!(source_id, iteration, total = collected.len(), "grid exhausted");
                break;
            }
        } else {
            idle_passes = 0;
        }

        if iteration == config.max_iterations {
            warn!(source_id, iteration, "grid iteration cap reached");
            break;
        }
        surface.scroll_forward().await?;
        tokio::time::sleep(config.settle).await;
    }

    collected.reverse();
    Ok(collected)
}

/// Grid dates are normalized to ISO so the exact-date policy can compare them.
fn normalize_dates(listings: Vec<JobListing>, today: NaiveDate) -> Vec<JobListing> {
    listings
        .into_iter()
        .map(|mut listing| {
            listing.date = normalize_posting_date(&listing.date, today)
                .format("%Y-%m-%d")
                .to_string();
            listing
        })
        .collect()
}

pub struct GridAdapter {
    pub source_id: String,
    pub url: String,
    pub freshness: FreshnessPolicy,
    pub selectors: GridSelectors,
    pub browser: PlaywrightConfig,
    pub grid: GridConfig,
}

impl GridAdapter {
    pub async fn fetch_listings(&self, ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError> {
        let mut session = PlaywrightSession::launch(&self.browser).await?;
        let collected = async {
            session.goto(&self.url).await?;
            let mut pane = session.grid(&self.selectors);
            collect_grid(&mut pane, &self.grid, Source::InternList, &self.source_id).await
        }
        .await;
        session.close().await;

        let listings = normalize_dates(collected?, ctx.today);
        Ok(retain_fresh(listings, self.freshness, ctx.today, &self.source_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves a scripted sequence of snapshots; the last one repeats forever.
    struct ScriptedGrid {
        frames: Vec<PaneSnapshot>,
        reads: usize,
        scrolls: usize,
    }

    impl ScriptedGrid {
        fn new(frames: Vec<PaneSnapshot>) -> Self {
            Self {
                frames,
                reads: 0,
                scrolls: 0,
            }
        }
    }

    #[async_trait]
    impl GridSurface for ScriptedGrid {
        async fn visible_rows(&mut self) -> Result<PaneSnapshot, AdapterError> {
            let idx = self.reads.min(self.frames.len() - 1);
            self.reads += 1;
            Ok(self.frames[idx].clone())
        }

        async fn scroll_forward(&mut self) -> Result<(), AdapterError> {
            self.scrolls += 1;
            Ok(())
        }
    }

    fn headers() -> Vec<String> {
        ["Date", "Apply", "Company", "Location"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn frame(ids: std::ops::Range<usize>) -> PaneSnapshot {
        let mut snapshot = PaneSnapshot {
            headers: headers(),
            ..Default::default()
        };
        for n in ids {
            let row_id = format!("rec{n}");
            snapshot.left.push(LeftRow {
                row_id: row_id.clone(),
                title: format!("Intern {n}"),
            });
            snapshot.right.push(RightRow {
                row_id,
                cells: vec![
                    GridCell {
                        text: "11/26/25".into(),
                        href: None,
                    },
                    GridCell {
                        text: "Apply".into(),
                        href: Some(format!("https://jobs.example/{n}?utm_source=intern-list")),
                    },
                    GridCell {
                        text: format!("Company {n}"),
                        href: None,
                    },
                    GridCell {
                        text: "Remote".into(),
                        href: None,
                    },
                ],
            });
        }
        snapshot
    }

    fn fast() -> GridConfig {
        GridConfig {
            settle: Duration::from_millis(1),
            ..GridConfig::default()
        }
    }

    #[test]
    fn rows_need_both_panes() {
        let mut snapshot = frame(0..3);
        snapshot.left.remove(1);
        snapshot.right.remove(2);
        let raws = correlate_panes(&snapshot);
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].title.as_deref(), Some("Intern 0"));
        assert_eq!(raws[0].company.as_deref(), Some("Company 0"));
        assert_eq!(raws[0].link.as_deref(), Some("https://jobs.example/0?utm_source=intern-list"));
    }

    #[test]
    fn link_falls_back_to_first_href_without_apply_header() {
        let mut snapshot = frame(0..1);
        snapshot.headers = vec!["Date".into(), "Posting".into(), "Company".into()];
        let raws = correlate_panes(&snapshot);
        assert_eq!(raws[0].link.as_deref(), Some("https://jobs.example/0?utm_source=intern-list"));
    }

    #[tokio::test]
    async fn stops_after_five_idle_passes_and_reverses() {
        // passes 1-4 each reveal three new rows, passes 5-9 reveal nothing new
        let frames = vec![frame(0..3), frame(3..6), frame(6..9), frame(9..12), frame(9..12)];
        let mut grid = ScriptedGrid::new(frames);

        let listings = collect_grid(&mut grid, &fast(), Source::InternList, "internlist-grid")
            .await
            .unwrap();

        assert_eq!(grid.reads, 9);
        assert_eq!(grid.scrolls, 8);
        assert_eq!(listings.len(), 12);
        assert_eq!(listings[0].title, "Intern 11");
        assert_eq!(listings[11].title, "Intern 0");
        assert_eq!(listings[11].link, "https://jobs.example/0");
    }

    #[tokio::test]
    async fn iteration_cap_bounds_endless_grids() {
        struct Endless {
            next: usize,
        }

        #[async_trait]
        impl GridSurface for Endless {
            async fn visible_rows(&mut self) -> Result<PaneSnapshot, AdapterError> {
                let start = self.next;
                self.next += 2;
                Ok(frame(start..start + 2))
            }

            async fn scroll_forward(&mut self) -> Result<(), AdapterError> {
                Ok(())
            }
        }

        let mut grid = Endless { next: 0 };
        let listings = collect_grid(&mut grid, &fast(), Source::InternList, "internlist-grid")
            .await
            .unwrap();
        assert_eq!(listings.len(), 60);
        assert_eq!(grid.next, 60);
    }

    #[tokio::test]
    async fn surface_errors_fail_the_collection() {
        struct Gone;

        #[async_trait]
        impl GridSurface for Gone {
            async fn visible_rows(&mut self) -> Result<PaneSnapshot, AdapterError> {
                Err(AdapterError::Browser("frame detached".into()))
            }

            async fn scroll_forward(&mut self) -> Result<(), AdapterError> {
                Ok(())
            }
        }

        let err = collect_grid(&mut Gone, &fast(), Source::InternList, "internlist-grid")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("frame detached"));
    }

    #[test]
    fn grid_dates_normalize_to_iso() {
        let today = NaiveDate::from_ymd_opt(2025, 11, 26).unwrap();
        let listing = JobListing::from_raw(
            Source::InternList,
            RawListing {
                title: Some("Intern".into()),
                date: Some("11/26/25".into()),
                link: Some("https://jobs.example/1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let normalized = normalize_dates(vec![listing], today);
        assert_eq!(normalized[0].date, "2025-11-26");
        assert!(FreshnessPolicy::ExactDate.is_fresh(&normalized[0].date, today));
    }
}
