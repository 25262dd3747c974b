use std::collections::HashMap;
use std::sync::Arc;

use jobd_adapters::{adapter_for_source, AdapterContext, AdapterDeps, FetchOutcome, SourceAdapter};
use jobd_core::JobListing;
use serde::Serialize;
use tracing::{debug, info};

use crate::SourceRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub reason: String,
}

/// Merged, deduplicated candidates plus the sources that produced nothing this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub listings: Vec<JobListing>,
    pub failures: Vec<SourceFailure>,
}

pub struct Aggregator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl Aggregator {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self { adapters }
    }

    /// One adapter per enabled registry entry, in registry order.
    pub fn from_registry(registry: &SourceRegistry, deps: &AdapterDeps) -> Self {
        let adapters = registry
            .enabled()
            .map(|source| Arc::new(adapter_for_source(source, deps)) as Arc<dyn SourceAdapter>)
            .collect();
        Self { adapters }
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    /// Runs every adapter in turn; a failing adapter contributes nothing but its failure.
    pub async fn aggregate(&self, ctx: &AdapterContext) -> Aggregation {
        let mut batches = Vec::with_capacity(self.adapters.len());
        let mut failures = Vec::new();

        for adapter in &self.adapters {
            match adapter.fetch(ctx).await {
                FetchOutcome::Fetched(listings) => batches.push(listings),
                FetchOutcome::Failed { reason } => failures.push(SourceFailure {
                    source_id: adapter.source_id().to_string(),
                    reason,
                }),
            }
        }

        let fetched = batches.iter().map(Vec::len).sum::<usize>();
        let listings = merge_listings(batches);
        info!(
            sources = self.adapters.len(),
            failed = failures.len(),
            fetched,
            candidates = listings.len(),
            "aggregation complete"
        );
        Aggregation { listings, failures }
    }
}

/// Drops listings without a link, then keeps one listing per id: the last one seen,
/// placed where that id first appeared.
pub fn merge_listings<I>(batches: I) -> Vec<JobListing>
where
    I: IntoIterator<Item = Vec<JobListing>>,
{
    let mut merged: Vec<JobListing> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut linkless = 0usize;

    for listing in batches.into_iter().flatten() {
        if !listing.has_link() {
            linkless += 1;
            continue;
        }
        match positions.get(&listing.id) {
            Some(&idx) => merged[idx] = listing,
            None => {
                positions.insert(listing.id.clone(), merged.len());
                merged.push(listing);
            }
        }
    }

    if linkless > 0 {
        debug!(linkless, "dropped listings without an application link");
    }
    merged
}
