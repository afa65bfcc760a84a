//! Grouped, idempotent upserts of canonical events and predicate-driven bulk deletes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use racefeed_core::CanonicalEvent;
use racefeed_storage::{Document, DocumentStore, StoreError, StoredDocument, WriteOp};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_UPSERT_BATCH_SIZE: usize = 25;
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 500;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("document store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub created: usize,
    pub updated: usize,
    pub write_failed: usize,
    pub groups_committed: usize,
    pub groups_failed: usize,
}

impl UpsertCounts {
    pub fn absorb(&mut self, other: &UpsertCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.write_failed += other.write_failed;
        self.groups_committed += other.groups_committed;
        self.groups_failed += other.groups_failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteCounts {
    pub scanned: usize,
    pub deleted: usize,
    pub unreadable: usize,
    pub failed: usize,
    pub batches_committed: usize,
}

/// Selects stored records for [`BatchUpsertWriter::delete_where`].
pub trait RecordPredicate: Send + Sync {
    fn describe(&self) -> String;
    fn matches(&self, document: &StoredDocument) -> bool;
}

fn string_at<'a>(document: &'a Document, path: &[&str]) -> Option<&'a str> {
    let (first, rest) = path.split_first()?;
    let mut value = document.get(*first)?;
    for segment in rest {
        value = value.get(*segment)?;
    }
    value.as_str()
}

/// Matches records that are *outside* a US state.
///
/// A record is in the state when `location.state`, `address.state`,
/// `address.state_province`, a string `location` or `address_text` equals the
/// state code or mentions the state name, ignoring case.
#[derive(Debug, Clone)]
pub struct RegionPredicate {
    state_code: String,
    state_name: String,
}

impl RegionPredicate {
    const STATE_FIELDS: &'static [&'static [&'static str]] = &[
        &["location", "state"],
        &["address", "state"],
        &["address", "state_province"],
        &["location"],
        &["address_text"],
    ];

    pub fn new(state_code: &str, state_name: &str) -> Self {
        Self {
            state_code: state_code.trim().to_uppercase(),
            state_name: state_name.trim().to_uppercase(),
        }
    }

    pub fn california() -> Self {
        Self::new("CA", "California")
    }

    pub fn contains(&self, document: &Document) -> bool {
        Self::STATE_FIELDS
            .iter()
            .filter_map(|path| string_at(document, path))
            .map(|value| value.trim().to_uppercase())
            .any(|value| {
                value == self.state_code
                    || (!self.state_name.is_empty() && value.contains(&self.state_name))
            })
    }
}

impl RecordPredicate for RegionPredicate {
    fn describe(&self) -> String {
        format!("outside {}", self.state_code)
    }

    fn matches(&self, document: &StoredDocument) -> bool {
        !self.contains(&document.data)
    }
}

/// Matches records whose `source` provenance equals the given label.
#[derive(Debug, Clone)]
pub struct SourcePredicate {
    provenance: String,
}

impl SourcePredicate {
    pub fn new(provenance: impl Into<String>) -> Self {
        Self {
            provenance: provenance.into(),
        }
    }
}

impl RecordPredicate for SourcePredicate {
    fn describe(&self) -> String {
        format!("source = {}", self.provenance)
    }

    fn matches(&self, document: &StoredDocument) -> bool {
        document.data.get("source").and_then(JsonValue::as_str) == Some(self.provenance.as_str())
    }
}

struct PendingWrite {
    id: String,
    document: Document,
    exists: bool,
    /// Later events in the same group that replaced this write.
    replaced: usize,
}

pub struct BatchUpsertWriter {
    store: Arc<dyn DocumentStore>,
    collection: String,
    batch_size: usize,
    delete_batch_size: usize,
    clock: Clock,
}

impl BatchUpsertWriter {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            batch_size: DEFAULT_UPSERT_BATCH_SIZE,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_batch_sizes(mut self, upsert: usize, delete: usize) -> Self {
        self.batch_size = upsert.max(1);
        self.delete_batch_size = delete.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Writes `events` in groups of `batch_size`, one atomic batch per group.
    ///
    /// A failed group is counted and skipped; only an unavailable store aborts.
    pub async fn upsert(&self, events: Vec<CanonicalEvent>) -> Result<UpsertCounts, WriterError> {
        let mut totals = UpsertCounts::default();
        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            let group: Vec<_> = events.by_ref().take(self.batch_size).collect();
            let counts = self.upsert_group(group).await?;
            totals.absorb(&counts);
        }
        Ok(totals)
    }

    async fn upsert_group(&self, group: Vec<CanonicalEvent>) -> Result<UpsertCounts, WriterError> {
        let now = (self.clock)();
        let mut counts = UpsertCounts::default();
        let mut pending: Vec<PendingWrite> = Vec::with_capacity(group.len());
        let mut slots: HashMap<String, usize> = HashMap::new();

        for event in group {
            if let Some(&slot) = slots.get(&event.id) {
                let write = &mut pending[slot];
                match stamped_document(&event, write.exists, now) {
                    Ok(document) => {
                        write.document = document;
                        write.replaced += 1;
                    }
                    Err(err) => {
                        counts.write_failed += 1;
                        warn!(id = %event.id, error = %err, "event could not be serialized");
                    }
                }
                continue;
            }

            let exists = match self.store.get(&self.collection, &event.id).await {
                Ok(existing) => existing.is_some(),
                Err(err) if err.is_unavailable() => return Err(WriterError::StoreUnavailable(err)),
                Err(err) => {
                    counts.write_failed += 1;
                    warn!(id = %event.id, error = %err, "existence check failed; skipping event");
                    continue;
                }
            };
            match stamped_document(&event, exists, now) {
                Ok(document) => {
                    slots.insert(event.id.clone(), pending.len());
                    pending.push(PendingWrite {
                        id: event.id,
                        document,
                        exists,
                        replaced: 0,
                    });
                }
                Err(err) => {
                    counts.write_failed += 1;
                    warn!(id = %event.id, error = %err, "event could not be serialized");
                }
            }
        }

        if pending.is_empty() {
            return Ok(counts);
        }

        let created = pending.iter().filter(|w| !w.exists).count();
        let updated = pending.iter().map(|w| usize::from(w.exists) + w.replaced).sum::<usize>();
        let ops: Vec<WriteOp> = pending
            .into_iter()
            .map(|w| WriteOp::Set {
                id: w.id,
                document: w.document,
                merge: w.exists,
            })
            .collect();

        match self.store.batch_commit(&self.collection, ops).await {
            Ok(()) => {
                counts.created += created;
                counts.updated += updated;
                counts.groups_committed += 1;
                info!(
                    collection = %self.collection,
                    created,
                    updated,
                    write_failed = counts.write_failed,
                    "committed upsert group"
                );
            }
            Err(err) if err.is_unavailable() => return Err(WriterError::StoreUnavailable(err)),
            Err(err) => {
                counts.write_failed += created + updated;
                counts.groups_failed += 1;
                warn!(collection = %self.collection, error = %err, "upsert group rejected; continuing with next group");
            }
        }
        Ok(counts)
    }

    /// Deletes every stored record `predicate` matches, in independent batches.
    pub async fn delete_where(
        &self,
        predicate: &dyn RecordPredicate,
    ) -> Result<DeleteCounts, WriterError> {
        let mut counts = DeleteCounts::default();
        let mut batch: Vec<String> = Vec::new();
        let mut stream = self.store.stream_all(&self.collection);

        while let Some(item) = stream.next().await {
            match item {
                Ok(document) => {
                    counts.scanned += 1;
                    if predicate.matches(&document) {
                        batch.push(document.id);
                    }
                    if batch.len() >= self.delete_batch_size {
                        self.commit_deletes(std::mem::take(&mut batch), &mut counts)
                            .await?;
                    }
                }
                Err(err) if err.is_unavailable() => return Err(WriterError::StoreUnavailable(err)),
                Err(err) => {
                    counts.unreadable += 1;
                    warn!(collection = %self.collection, error = %err, "unreadable stored record skipped");
                }
            }
        }
        if !batch.is_empty() {
            self.commit_deletes(batch, &mut counts).await?;
        }

        info!(
            collection = %self.collection,
            predicate = %predicate.describe(),
            scanned = counts.scanned,
            deleted = counts.deleted,
            failed = counts.failed,
            "delete pass finished"
        );
        Ok(counts)
    }

    async fn commit_deletes(
        &self,
        ids: Vec<String>,
        counts: &mut DeleteCounts,
    ) -> Result<(), WriterError> {
        let size = ids.len();
        let ops = ids.into_iter().map(|id| WriteOp::Delete { id }).collect();
        match self.store.batch_commit(&self.collection, ops).await {
            Ok(()) => {
                counts.deleted += size;
                counts.batches_committed += 1;
                info!(collection = %self.collection, size, total = counts.deleted, "committed delete batch");
                Ok(())
            }
            Err(err) if err.is_unavailable() => Err(WriterError::StoreUnavailable(err)),
            Err(err) => {
                counts.failed += size;
                warn!(collection = %self.collection, size, error = %err, "delete batch rejected");
                Ok(())
            }
        }
    }
}

/// Creates carry both timestamps; updates omit `created` so the merge keeps the original.
fn stamped_document(
    event: &CanonicalEvent,
    exists: bool,
    now: DateTime<Utc>,
) -> Result<Document, serde_json::Error> {
    let mut event = event.clone();
    event.last_updated = Some(now);
    event.created = if exists { None } else { Some(now) };
    match serde_json::to_value(&event)? {
        JsonValue::Object(document) => Ok(document),
        other => Err(serde::ser::Error::custom(format!(
            "event serialized to {other} instead of an object"
        ))),
    }
}
