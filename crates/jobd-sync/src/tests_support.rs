use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use jobd_adapters::{AdapterContext, AdapterError, SourceAdapter};
use jobd_core::{JobListing, RawListing, Source};
use jobd_notify::{BatchSummary, DispatchOutcome, Notifier};
use jobd_storage::{SeenStore, StoreError};
use tokio::sync::Notify;
use uuid::Uuid;

pub fn listing(link: &str, title: &str) -> JobListing {
    JobListing::from_raw(
        Source::InternList,
        RawListing {
            title: Some(title.to_string()),
            company: Some("Acme".to_string()),
            date: Some("2025-11-26".to_string()),
            link: Some(link.to_string()),
            ..Default::default()
        },
    )
    .unwrap()
}

pub struct StaticAdapter {
    id: String,
    result: Result<Vec<JobListing>, String>,
}

impl StaticAdapter {
    pub fn new(id: &str, listings: Vec<JobListing>) -> Self {
        Self {
            id: id.to_string(),
            result: Ok(listings),
        }
    }

    pub fn failing(id: &str, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            result: Err(reason.to_string()),
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> Source {
        Source::InternList
    }

    async fn try_fetch(&self, _ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError> {
        self.result.clone().map_err(AdapterError::Message)
    }
}

/// Parks inside `try_fetch` until `release` is notified.
pub struct BlockingAdapter {
    listings: Vec<JobListing>,
    pub entered: Notify,
    pub release: Notify,
    calls: AtomicUsize,
}

impl BlockingAdapter {
    pub fn new(listings: Vec<JobListing>) -> Self {
        Self {
            listings,
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for BlockingAdapter {
    fn source_id(&self) -> &str {
        "blocking"
    }

    fn source(&self) -> Source {
        Source::InternList
    }

    async fn try_fetch(&self, _ctx: &AdapterContext) -> Result<Vec<JobListing>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.listings.clone())
    }
}

/// In-memory store that can report itself unavailable: for the first `failures`
/// lookups, or on the `n`-th (1-based) insert.
#[derive(Default)]
pub struct FlakyStore {
    failures: AtomicUsize,
    record_fails_on: Option<usize>,
    records: AtomicUsize,
    seen: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn failing_record(n: usize) -> Self {
        Self {
            record_fails_on: Some(n),
            ..Default::default()
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl SeenStore for FlakyStore {
    async fn has(&self, id: &str) -> Result<bool, StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(sqlx::Error::PoolClosed));
        }
        Ok(self.seen.lock().unwrap().contains(id))
    }

    async fn record(&self, listing: &JobListing) -> Result<(), StoreError> {
        let call = self.records.fetch_add(1, Ordering::SeqCst) + 1;
        if self.record_fails_on == Some(call) {
            return Err(StoreError::Unavailable(sqlx::Error::PoolClosed));
        }
        self.seen.lock().unwrap().insert(listing.id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    fail_on: Option<String>,
    dispatched: Mutex<Vec<String>>,
    announced: Mutex<Vec<usize>>,
}

impl RecordingNotifier {
    pub fn failing_on(id: &str) -> Self {
        Self {
            fail_on: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn announced(&self) -> Vec<usize> {
        self.announced.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dispatch(&self, listing: &JobListing) -> DispatchOutcome {
        self.dispatched.lock().unwrap().push(listing.id.clone());
        if self.fail_on.as_deref() == Some(listing.id.as_str()) {
            DispatchOutcome::Failed("webhook returned 500".to_string())
        } else {
            DispatchOutcome::Delivered
        }
    }

    async fn announce_batch(&self, count: usize) -> DispatchOutcome {
        self.announced.lock().unwrap().push(count);
        DispatchOutcome::Delivered
    }
}

#[derive(Default)]
pub struct RecordingSummary {
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingSummary {
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSummary for RecordingSummary {
    async fn summarize(&self, _run_id: Uuid, listings: &[JobListing]) -> DispatchOutcome {
        self.batches
            .lock()
            .unwrap()
            .push(listings.iter().map(|l| l.id.clone()).collect());
        DispatchOutcome::Delivered
    }
}
