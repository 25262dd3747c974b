use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobd_adapters::AdapterContext;
use jobd_core::JobListing;
use jobd_notify::{BatchSummary, Notifier};
use jobd_storage::{SeenStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{Aggregator, SourceFailure};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub already_seen: usize,
    pub new_listings: usize,
    pub dispatch_failures: usize,
    pub source_failures: Vec<SourceFailure>,
    pub outcome: RunOutcome,
}

impl RunReport {
    fn started(ctx: &AdapterContext) -> Self {
        Self {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
            candidates: 0,
            already_seen: 0,
            new_listings: 0,
            dispatch_failures: 0,
            source_failures: Vec::new(),
            outcome: RunOutcome::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Another run held the flag; nothing was read, written or sent.
    Skipped,
    Finished(RunReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub last_run: Option<RunReport>,
}

/// Clears the run flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    aggregator: Aggregator,
    store: Arc<dyn SeenStore>,
    notifier: Arc<dyn Notifier>,
    summary: Arc<dyn BatchSummary>,
    dispatch_delay: Duration,
    running: AtomicBool,
    last_report: RwLock<Option<RunReport>>,
}

impl Orchestrator {
    pub fn new(
        aggregator: Aggregator,
        store: Arc<dyn SeenStore>,
        notifier: Arc<dyn Notifier>,
        summary: Arc<dyn BatchSummary>,
    ) -> Self {
        Self {
            aggregator,
            store,
            notifier,
            summary,
            dispatch_delay: Duration::from_secs(2),
            running: AtomicBool::new(false),
            last_report: RwLock::new(None),
        }
    }

    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn last_report(&self) -> Option<RunReport> {
        self.last_report.read().await.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.is_running(),
            last_run: self.last_report().await,
        }
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(&self.running))
    }

    /// One pipeline pass. Returns [`RunStatus::Skipped`] immediately if a run is
    /// already in progress.
    pub async fn run_once(&self) -> RunStatus {
        let Some(_guard) = self.try_begin() else {
            info!("run already in progress; skipping tick");
            return RunStatus::Skipped;
        };

        let ctx = AdapterContext::new(Uuid::new_v4());
        let span = info_span!("run", run_id = %ctx.run_id);
        let report = self.execute(&ctx).instrument(span).await;

        *self.last_report.write().await = Some(report.clone());
        RunStatus::Finished(report)
    }

    async fn execute(&self, ctx: &AdapterContext) -> RunReport {
        info!(today = %ctx.today, "run started");
        let mut report = RunReport::started(ctx);

        if let Err(err) = self.pipeline(ctx, &mut report).await {
            error!(error = %err, "run aborted; next tick will retry");
            report.outcome = RunOutcome::Failed(err.to_string());
        }
        report.finished_at = Utc::now();

        info!(
            candidates = report.candidates,
            already_seen = report.already_seen,
            new_listings = report.new_listings,
            dispatch_failures = report.dispatch_failures,
            source_failures = report.source_failures.len(),
            outcome = ?report.outcome,
            "run finished"
        );
        report
    }

    async fn pipeline(&self, ctx: &AdapterContext, report: &mut RunReport) -> Result<(), RunError> {
        let aggregation = self.aggregator.aggregate(ctx).await;
        report.candidates = aggregation.listings.len();
        report.source_failures = aggregation.failures;

        let mut fresh: Vec<JobListing> = Vec::new();
        for listing in aggregation.listings {
            if self.store.has(&listing.id).await? {
                report.already_seen += 1;
            } else {
                fresh.push(listing);
            }
        }

        if fresh.is_empty() {
            info!("no new listings");
            return Ok(());
        }

        let announced = self.notifier.announce_batch(fresh.len()).await;
        if announced.is_failure() {
            warn!(count = fresh.len(), outcome = ?announced, "batch announcement failed");
        }

        for listing in &fresh {
            self.store.record(listing).await?;
            report.new_listings += 1;

            let outcome = self.notifier.dispatch(listing).await;
            if outcome.is_failure() {
                report.dispatch_failures += 1;
                warn!(listing_id = %listing.id, outcome = ?outcome, "dispatch failed; continuing");
            }
            tokio::time::sleep(self.dispatch_delay).await;
        }

        let summarized = self.summary.summarize(ctx.run_id, &fresh).await;
        if summarized.is_failure() {
            warn!(count = fresh.len(), outcome = ?summarized, "batch summary failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{
        listing, BlockingAdapter, FlakyStore, RecordingNotifier, RecordingSummary, StaticAdapter,
    };
    use jobd_adapters::SourceAdapter;
    use jobd_storage::SqliteSeenStore;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        notifier: Arc<RecordingNotifier>,
        summary: Arc<RecordingSummary>,
    }

    fn harness(adapters: Vec<Arc<dyn SourceAdapter>>, store: Arc<dyn SeenStore>, notifier: RecordingNotifier) -> Harness {
        let notifier = Arc::new(notifier);
        let summary = Arc::new(RecordingSummary::default());
        let orchestrator = Orchestrator::new(
            Aggregator::new(adapters),
            store,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&summary) as Arc<dyn BatchSummary>,
        )
        .with_dispatch_delay(Duration::ZERO);
        Harness {
            orchestrator: Arc::new(orchestrator),
            notifier,
            summary,
        }
    }

    fn finished(status: RunStatus) -> RunReport {
        match status {
            RunStatus::Finished(report) => report,
            RunStatus::Skipped => panic!("run was skipped"),
        }
    }

    fn three_listings() -> Vec<JobListing> {
        vec![
            listing("https://a.dev/1", "Intern 1"),
            listing("https://a.dev/2", "Intern 2"),
            listing("https://a.dev/3", "Intern 3"),
        ]
    }

    #[tokio::test]
    async fn only_unseen_listings_are_persisted_and_dispatched_in_order() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        store.record(&listing("https://a.dev/1", "Intern 1")).await.unwrap();

        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", three_listings()))],
            Arc::clone(&store) as Arc<dyn SeenStore>,
            RecordingNotifier::default(),
        );

        let report = finished(h.orchestrator.run_once().await);
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.already_seen, 1);
        assert_eq!(report.new_listings, 2);

        assert_eq!(h.notifier.dispatched(), vec!["https://a.dev/2", "https://a.dev/3"]);
        assert_eq!(h.notifier.announced(), vec![2]);
        assert_eq!(h.summary.batches(), vec![vec!["https://a.dev/2", "https://a.dev/3"]]);
        assert!(store.has("https://a.dev/2").await.unwrap());
        assert!(store.has("https://a.dev/3").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 3);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn second_run_finds_nothing_new() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", three_listings()))],
            store,
            RecordingNotifier::default(),
        );

        finished(h.orchestrator.run_once().await);
        let second = finished(h.orchestrator.run_once().await);
        assert_eq!(second.new_listings, 0);
        assert_eq!(second.already_seen, 3);
        assert_eq!(h.notifier.dispatched().len(), 3);
        assert_eq!(h.summary.batches().len(), 1);
        assert_eq!(h.orchestrator.last_report().await, Some(second));
    }

    #[tokio::test]
    async fn tick_during_a_run_is_skipped_without_side_effects() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        let blocking = Arc::new(BlockingAdapter::new(three_listings()));
        let h = harness(
            vec![Arc::clone(&blocking) as Arc<dyn SourceAdapter>],
            Arc::clone(&store) as Arc<dyn SeenStore>,
            RecordingNotifier::default(),
        );

        let first = tokio::spawn({
            let orchestrator = Arc::clone(&h.orchestrator);
            async move { orchestrator.run_once().await }
        });
        blocking.entered.notified().await;

        assert!(h.orchestrator.is_running());
        assert_eq!(h.orchestrator.run_once().await, RunStatus::Skipped);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(h.notifier.dispatched().is_empty());

        blocking.release.notify_one();
        let report = finished(first.await.unwrap());
        assert_eq!(report.new_listings, 3);
        assert_eq!(blocking.calls(), 1);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn store_failure_aborts_the_run_and_the_next_run_proceeds() {
        let store = Arc::new(FlakyStore::failing_first(1));
        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", three_listings()))],
            store,
            RecordingNotifier::default(),
        );

        let failed = finished(h.orchestrator.run_once().await);
        assert!(matches!(failed.outcome, RunOutcome::Failed(_)));
        assert_eq!(failed.new_listings, 0);
        assert!(h.notifier.dispatched().is_empty());
        assert!(h.summary.batches().is_empty());
        assert!(!h.orchestrator.is_running());

        let recovered = finished(h.orchestrator.run_once().await);
        assert_eq!(recovered.outcome, RunOutcome::Completed);
        assert_eq!(recovered.new_listings, 3);
    }

    #[tokio::test]
    async fn insert_failure_mid_batch_stops_before_dispatching_that_listing() {
        let store = Arc::new(FlakyStore::failing_record(2));
        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", three_listings()))],
            Arc::clone(&store) as Arc<dyn SeenStore>,
            RecordingNotifier::default(),
        );

        let report = finished(h.orchestrator.run_once().await);
        assert!(matches!(report.outcome, RunOutcome::Failed(_)));
        assert_eq!(report.new_listings, 1);
        assert_eq!(h.notifier.announced(), vec![3]);
        assert_eq!(h.notifier.dispatched(), vec!["https://a.dev/1"]);
        assert!(h.summary.batches().is_empty());
        assert!(store.contains("https://a.dev/1"));
        assert!(!store.contains("https://a.dev/2"));
        assert!(!store.contains("https://a.dev/3"));
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn dispatch_failure_only_costs_that_listing() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", three_listings()))],
            Arc::clone(&store) as Arc<dyn SeenStore>,
            RecordingNotifier::failing_on("https://a.dev/2"),
        );

        let report = finished(h.orchestrator.run_once().await);
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.new_listings, 3);
        assert_eq!(report.dispatch_failures, 1);
        assert_eq!(
            h.notifier.dispatched(),
            vec!["https://a.dev/1", "https://a.dev/2", "https://a.dev/3"]
        );
        assert_eq!(h.summary.batches().len(), 1);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failing_sources_are_reported_but_not_fatal() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        let h = harness(
            vec![
                Arc::new(StaticAdapter::failing("simplify-summer2026", "HTTP 503")),
                Arc::new(StaticAdapter::new("internlist", three_listings())),
            ],
            store,
            RecordingNotifier::default(),
        );

        let report = finished(h.orchestrator.run_once().await);
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.new_listings, 3);
        assert_eq!(report.source_failures.len(), 1);
        assert_eq!(report.source_failures[0].source_id, "simplify-summer2026");
    }

    #[tokio::test]
    async fn empty_runs_skip_announce_and_summary() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", Vec::new()))],
            store,
            RecordingNotifier::default(),
        );

        let report = finished(h.orchestrator.run_once().await);
        assert_eq!(report.candidates, 0);
        assert!(h.notifier.announced().is_empty());
        assert!(h.summary.batches().is_empty());
    }

    #[tokio::test]
    async fn status_snapshot_serializes_last_run() {
        let store = Arc::new(SqliteSeenStore::in_memory().await.unwrap());
        let h = harness(
            vec![Arc::new(StaticAdapter::new("internlist", three_listings()))],
            store,
            RecordingNotifier::default(),
        );
        assert!(h.orchestrator.status().await.last_run.is_none());

        finished(h.orchestrator.run_once().await);
        let json = serde_json::to_value(h.orchestrator.status().await).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["last_run"]["new_listings"], 3);
        assert_eq!(json["last_run"]["outcome"]["status"], "completed");
    }
}
