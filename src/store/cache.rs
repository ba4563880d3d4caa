//! Single-flight charm metadata cache
//!
//! Concurrently look up charm data from the charm store, deduplicating
//! in-flight and repeated fetches process-wide. Entries are keyed by the
//! revision-stripped canonical charm id; each key's state only ever moves
//! Pending → Ready, and a Ready outcome (success or failure) is shared
//! read-only with every caller.
//!
//! [`CharmStoreCache::resolve`] hands back a [`MetadataHandle`] immediately;
//! awaiting the handle is the only suspension point. One exclusion lock
//! covers the read-check-and-insert, so at most one fetch task exists per
//! key no matter how many callers race. Field extraction happens in the
//! handle after completion, outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::charm::CharmStoreId;
use crate::error::{BundleError, Result};
use crate::store::CharmSource;

/// Outcome of one remote fetch, shared by every waiter on its key
pub type FetchOutcome = Result<Arc<JsonValue>>;

/// Callback invoked exactly once per distinct failing fetch
pub type FetchCallback = Arc<dyn Fn(&BundleError) + Send + Sync>;

enum CacheEntry {
    Pending(watch::Receiver<Option<FetchOutcome>>),
    Ready(FetchOutcome),
}

/// Process-wide deduplicating cache over a [`CharmSource`]
///
/// Cheap to clone; clones share the same entry map.
#[derive(Clone)]
pub struct CharmStoreCache {
    source: Arc<dyn CharmSource>,
    series: String,
    on_error: Option<FetchCallback>,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CharmStoreCache {
    pub fn new(
        source: Arc<dyn CharmSource>,
        series: impl Into<String>,
        on_error: Option<FetchCallback>,
    ) -> Self {
        CharmStoreCache {
            source,
            series: series.into(),
            on_error,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The cache key for a charm reference: bare names are qualified with
    /// the configured series, then canonicalized without revision
    pub fn cache_key(&self, name: &str) -> String {
        let bare = name.strip_prefix("cs:").unwrap_or(name);
        if bare.contains('/') {
            CharmStoreId::parse(bare).canonical()
        } else {
            CharmStoreId::parse(&format!("{}/{bare}", self.series)).canonical()
        }
    }

    /// Resolve charm metadata, deduplicating against any in-flight or
    /// completed fetch for the same charm
    ///
    /// With a `field`, the handle resolves to that key of the entity's
    /// charm-metadata document; without, to the whole entity document.
    /// Must be called within a tokio runtime.
    pub fn resolve(&self, name: &str, field: Option<&str>) -> MetadataHandle {
        let key = self.cache_key(name);
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(&key) {
            let source = match entry {
                CacheEntry::Ready(outcome) => HandleSource::Ready(outcome.clone()),
                CacheEntry::Pending(rx) => HandleSource::Waiting(rx.clone()),
            };
            return MetadataHandle::new(source, field);
        }

        let (tx, rx) = watch::channel(None);
        entries.insert(key.clone(), CacheEntry::Pending(rx.clone()));
        drop(entries);
        self.spawn_fetch(key, tx);
        MetadataHandle::new(HandleSource::Waiting(rx), field)
    }

    /// Resolve the whole entity document for a charm
    pub fn entity(&self, name: &str) -> MetadataHandle {
        self.resolve(name, None)
    }

    /// Resolve a charm's summary text
    pub fn summary(&self, name: &str) -> MetadataHandle {
        self.resolve(name, Some("Summary"))
    }

    /// Resolve many charms with at most one remote query for the ones not
    /// already known or in flight
    pub fn resolve_batch(&self, names: &[String]) -> BatchHandle {
        let mut parts = Vec::new();
        let mut fresh = Vec::new();
        let mut seen = HashSet::new();

        {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for name in names {
                let key = self.cache_key(name);
                if !seen.insert(key.clone()) {
                    continue;
                }
                match entries.get(&key) {
                    Some(CacheEntry::Ready(outcome)) => {
                        parts.push((key, HandleSource::Ready(outcome.clone())));
                    }
                    Some(CacheEntry::Pending(rx)) => {
                        parts.push((key, HandleSource::Waiting(rx.clone())));
                    }
                    None => {
                        let (tx, rx) = watch::channel(None);
                        entries.insert(key.clone(), CacheEntry::Pending(rx.clone()));
                        parts.push((key.clone(), HandleSource::Waiting(rx)));
                        fresh.push((key, tx));
                    }
                }
            }
        }

        if !fresh.is_empty() {
            self.spawn_batch_fetch(fresh);
        }
        BatchHandle { parts }
    }

    fn finish(&self, key: String, outcome: FetchOutcome, tx: &watch::Sender<Option<FetchOutcome>>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, CacheEntry::Ready(outcome.clone()));
        let _ = tx.send(Some(outcome));
    }

    fn spawn_fetch(&self, key: String, tx: watch::Sender<Option<FetchOutcome>>) {
        let cache = self.clone();
        tokio::spawn(async move {
            debug!(charm = %key, "fetching charm entity");
            let outcome = match cache.source.fetch_one(&key).await {
                Ok(entity) => Ok(Arc::new(entity)),
                Err(err) => {
                    warn!(charm = %key, error = %err, "charm fetch failed");
                    if let Some(cb) = &cache.on_error {
                        cb(&err);
                    }
                    Err(err)
                }
            };
            cache.finish(key, outcome, &tx);
        });
    }

    fn spawn_batch_fetch(&self, fresh: Vec<(String, watch::Sender<Option<FetchOutcome>>)>) {
        let cache = self.clone();
        let ids: Vec<String> = fresh.iter().map(|(key, _)| key.clone()).collect();
        tokio::spawn(async move {
            debug!(count = ids.len(), "batch charm metadata fetch");
            match cache.source.fetch_many(&ids).await {
                Ok(body) => {
                    let results = index_batch_response(&body);
                    for (key, tx) in fresh {
                        let outcome = results.get(&key).cloned().ok_or_else(|| {
                            BundleError::MissingResult { id: key.clone() }
                        });
                        cache.finish(key, outcome, &tx);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "batch charm fetch failed");
                    if let Some(cb) = &cache.on_error {
                        cb(&err);
                    }
                    for (key, tx) in fresh {
                        cache.finish(key, Err(err.clone()), &tx);
                    }
                }
            }
        });
    }
}

/// Map each entity in a batch response to its revision-stripped canonical id
fn index_batch_response(body: &JsonValue) -> HashMap<String, Arc<JsonValue>> {
    let mut results = HashMap::new();
    let Some(map) = body.as_object() else {
        return results;
    };
    for (requested, entity) in map {
        let shared = Arc::new(entity.clone());
        if let Some(id) = entity.get("Id").and_then(JsonValue::as_str) {
            results.insert(CharmStoreId::parse(id).canonical(), Arc::clone(&shared));
        }
        // response keys are the requested ids; keep them as a fallback
        results
            .entry(CharmStoreId::parse(requested).canonical())
            .or_insert(shared);
    }
    results
}

pub(crate) enum HandleSource {
    Ready(FetchOutcome),
    Waiting(watch::Receiver<Option<FetchOutcome>>),
}

async fn resolve_outcome(source: HandleSource) -> FetchOutcome {
    match source {
        HandleSource::Ready(outcome) => outcome,
        HandleSource::Waiting(mut rx) => loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            if rx.changed().await.is_err() {
                break Err(BundleError::LookupInterrupted);
            }
        },
    }
}

/// Future-like handle to one charm metadata lookup
pub struct MetadataHandle {
    source: HandleSource,
    field: Option<String>,
}

impl MetadataHandle {
    fn new(source: HandleSource, field: Option<&str>) -> Self {
        MetadataHandle {
            source,
            field: field.map(String::from),
        }
    }

    /// Whether the underlying fetch has completed (successfully or not)
    pub fn is_ready(&self) -> bool {
        match &self.source {
            HandleSource::Ready(_) => true,
            HandleSource::Waiting(rx) => rx.borrow().is_some(),
        }
    }

    /// Wait for the fetch and extract the requested field
    ///
    /// Every handle for the same charm observes the same fetch outcome. A
    /// field missing from a successfully fetched entity is an error on this
    /// handle only; the entity itself stays cached.
    pub async fn wait(self) -> Result<JsonValue> {
        let MetadataHandle { source, field } = self;
        let entity = resolve_outcome(source).await?;
        match field {
            None => Ok((*entity).clone()),
            Some(field) => entity
                .get("Meta")
                .and_then(|meta| meta.get("charm-metadata"))
                .and_then(|md| md.get(&field))
                .cloned()
                .ok_or(BundleError::MissingField { field }),
        }
    }
}

/// Future-like handle to a batch lookup
pub struct BatchHandle {
    parts: Vec<(String, HandleSource)>,
}

impl BatchHandle {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Wait for every constituent fetch, yielding per-charm outcomes keyed
    /// by canonical id
    pub async fn wait(self) -> Vec<(String, FetchOutcome)> {
        let mut outcomes = Vec::with_capacity(self.parts.len());
        for (key, source) in self.parts {
            outcomes.push((key, resolve_outcome(source).await));
        }
        outcomes
    }
}
