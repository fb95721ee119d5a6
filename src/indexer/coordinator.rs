//! Index coordinator: the single writer to the vector and text indices.
//!
//! Every write record resolves against the version ledger first (last-writer-wins by
//! version), then both sub-writes are attempted under the id's slot lock with bounded
//! retries. Partial outcomes are returned as typed errors and left fault-marked in the
//! ledger until a later write of the same or higher version reconciles them.
//!
//! The slot lock is writer-only. Queries read the state each write publishes when it
//! finishes, so they never wait on store I/O or retry backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::indexer::ledger::{
    DEFAULT_SHARDS, FaultKind, FaultMark, LEDGER_FILE, StoreKind, VersionLedger,
};
use crate::indexer::retry::{RetryFailure, RetryPolicy};
use crate::model::types::{
    ClassMap, EntityClass, IndexWriteRecord, StructuredAttributes, WriteOperation,
};
use crate::search::ann_index::AnnHit;
use crate::search::text_index::{SearchFilters, TextHit, TextIndexStore, TextStoreResult};
use crate::search::vector_index::{
    VECTOR_SNAPSHOT_EXT, VectorIndexStore, VectorStoreError, VectorStoreResult,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub retry: RetryPolicy,
    /// Max records drained per propagation cycle.
    pub propagation_batch: usize,
    /// Version ledger shard count.
    pub shards: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            propagation_batch: 256,
            shards: DEFAULT_SHARDS,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
    #[error("{class} {id}: vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        class: EntityClass,
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error(
        "{class} {id} v{version}: degraded consistency, {succeeded} index written but {failed} index failed: {cause}"
    )]
    DegradedConsistency {
        class: EntityClass,
        id: String,
        version: u64,
        succeeded: StoreKind,
        failed: StoreKind,
        cause: String,
    },
    #[error("{class} {id} v{version}: index write failed: {cause}")]
    IndexWriteFailed {
        class: EntityClass,
        id: String,
        version: u64,
        cause: String,
    },
}

impl CoordinatorError {
    /// Whether the record was fault-marked and should be re-applied later.
    pub fn is_fault_marked(&self) -> bool {
        !matches!(self, CoordinatorError::DimensionMismatch { .. })
    }
}

impl Serialize for CoordinatorError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result of a write that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Both stores now reflect this version.
    Applied,
    /// A previously fault-marked version was re-applied cleanly.
    Reconciled,
    /// Same version as the last clean apply; nothing written.
    Duplicate,
    /// Older than a version already seen; discarded.
    Stale { latest: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub applied: u64,
    pub reconciled: u64,
    pub duplicate: u64,
    pub stale: u64,
    pub rejected: u64,
    pub degraded: u64,
    pub failed: u64,
    pub fault_marks: usize,
    pub tracked_ids: usize,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    reconciled: AtomicU64,
    duplicate: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    degraded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wakes read-your-write waiters after each clean apply.
#[derive(Default)]
struct Visibility {
    epoch: Mutex<u64>,
    changed: Condvar,
}

impl Visibility {
    fn publish(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.changed.notify_all();
    }
}

pub struct IndexCoordinator {
    vectors: ClassMap<Arc<dyn VectorIndexStore>>,
    texts: ClassMap<Arc<dyn TextIndexStore>>,
    config: CoordinatorConfig,
    ledger: VersionLedger,
    visibility: Visibility,
    counters: Counters,
}

impl IndexCoordinator {
    pub fn new(
        vectors: ClassMap<Arc<dyn VectorIndexStore>>,
        texts: ClassMap<Arc<dyn TextIndexStore>>,
        config: CoordinatorConfig,
    ) -> Self {
        let ledger = VersionLedger::new(config.shards);
        Self {
            vectors,
            texts,
            config,
            ledger,
            visibility: Visibility::default(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// Read-only handle for the query path.
    pub fn reader(self: &Arc<Self>) -> IndexReader {
        IndexReader {
            coordinator: Arc::clone(self),
        }
    }

    /// Apply one write record to both indices.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::DimensionMismatch`]: rejected before any I/O, not retried,
    ///   not fault-marked.
    /// - [`CoordinatorError::DegradedConsistency`]: exactly one sub-write landed.
    /// - [`CoordinatorError::IndexWriteFailed`]: neither sub-write landed.
    pub fn apply(&self, record: IndexWriteRecord) -> Result<ApplyOutcome, CoordinatorError> {
        self.check_dimension(&record)?;
        let IndexWriteRecord {
            id,
            class,
            version,
            operation,
        } = record;

        let cell = self.ledger.slot(class, &id);
        let mut slot = cell.lock();

        if let Some(latest) = slot.highest_seen()
            && version < latest
        {
            Counters::bump(&self.counters.stale);
            debug!(class = %class, id = %id, version, latest, "stale write discarded");
            return Ok(ApplyOutcome::Stale { latest });
        }
        let reconciling = slot.fault.as_ref().is_some_and(|f| f.version == version);
        if !reconciling && slot.applied == Some(version) {
            Counters::bump(&self.counters.duplicate);
            debug!(class = %class, id = %id, version, "duplicate write ignored");
            return Ok(ApplyOutcome::Duplicate);
        }

        let is_delete = matches!(operation, WriteOperation::Delete);
        let (vector_result, text_result, attributes) = match operation {
            WriteOperation::Upsert {
                vector,
                document,
                attributes,
            } => {
                let attributes = attributes.normalized();
                let vector_result = self.retry_vector("vector_upsert", class, || {
                    self.vectors
                        .get(class)
                        .upsert(vec![(id.clone(), vector.clone())])
                        .map(|_| ())
                });
                let text_result = self.retry_text("text_upsert", class, || {
                    self.texts
                        .get(class)
                        .upsert(&id, version, &document, &attributes)
                });
                (vector_result, text_result, Some(attributes))
            }
            WriteOperation::Delete => {
                let ids = [id.clone()];
                let vector_result = self.retry_vector("vector_delete", class, || {
                    self.vectors.get(class).delete(&ids).map(|_| ())
                });
                let text_result =
                    self.retry_text("text_delete", class, || self.texts.get(class).delete(&id));
                (vector_result, text_result, None)
            }
        };

        if vector_result.is_ok() {
            slot.attributes = attributes.map(Arc::new);
        }

        let failure = match (vector_result, text_result) {
            (Ok(()), Ok(())) => None,
            (Ok(()), Err(text_err)) => Some((
                FaultKind::Degraded {
                    failed: StoreKind::Text,
                },
                text_err,
            )),
            (Err(vector_err), Ok(())) => Some((
                FaultKind::Degraded {
                    failed: StoreKind::Vector,
                },
                vector_err,
            )),
            (Err(vector_err), Err(text_err)) => Some((
                FaultKind::Failed,
                format!("vector: {vector_err}; text: {text_err}"),
            )),
        };

        let Some((kind, cause)) = failure else {
            slot.applied = Some(version);
            slot.tombstone = is_delete;
            slot.fault = None;
            cell.publish(&slot);
            drop(slot);
            self.visibility.publish();

            let outcome = if reconciling {
                Counters::bump(&self.counters.reconciled);
                ApplyOutcome::Reconciled
            } else {
                Counters::bump(&self.counters.applied);
                ApplyOutcome::Applied
            };
            debug!(
                class = %class,
                id = %id,
                version,
                op = if is_delete { "delete" } else { "upsert" },
                outcome = ?outcome,
                "write applied"
            );
            return Ok(outcome);
        };

        slot.fault = Some(FaultMark {
            class,
            id: id.clone(),
            version,
            kind: kind.clone(),
            cause: cause.clone(),
            marked_at: Utc::now(),
        });
        cell.publish(&slot);
        drop(slot);

        match kind {
            FaultKind::Degraded { failed } => {
                Counters::bump(&self.counters.degraded);
                let succeeded = match failed {
                    StoreKind::Vector => StoreKind::Text,
                    StoreKind::Text => StoreKind::Vector,
                };
                warn!(
                    class = %class,
                    id = %id,
                    version,
                    %succeeded,
                    %failed,
                    cause = %cause,
                    "degraded consistency; id fault-marked"
                );
                Err(CoordinatorError::DegradedConsistency {
                    class,
                    id,
                    version,
                    succeeded,
                    failed,
                    cause,
                })
            }
            FaultKind::Failed => {
                Counters::bump(&self.counters.failed);
                error!(
                    class = %class,
                    id = %id,
                    version,
                    cause = %cause,
                    "index write failed; id fault-marked"
                );
                Err(CoordinatorError::IndexWriteFailed {
                    class,
                    id,
                    version,
                    cause,
                })
            }
        }
    }

    /// Reject an upsert whose vector does not match the class dimension. Counted as
    /// rejected; nothing is written or fault-marked.
    pub fn check_dimension(&self, record: &IndexWriteRecord) -> Result<(), CoordinatorError> {
        let WriteOperation::Upsert { vector, .. } = &record.operation else {
            return Ok(());
        };
        let expected = self.vectors.get(record.class).dimension();
        if vector.len() == expected {
            return Ok(());
        }
        Counters::bump(&self.counters.rejected);
        warn!(
            class = %record.class,
            id = %record.id,
            version = record.version,
            expected,
            actual = vector.len(),
            "write rejected: vector dimension mismatch"
        );
        Err(CoordinatorError::DimensionMismatch {
            class: record.class,
            id: record.id.clone(),
            expected,
            actual: vector.len(),
        })
    }

    fn retry_vector(
        &self,
        op: &str,
        class: EntityClass,
        f: impl FnMut() -> VectorStoreResult<()>,
    ) -> Result<(), String> {
        self.config
            .retry
            .run(op, f, VectorStoreError::is_transient)
            .map_err(|failure: RetryFailure<VectorStoreError>| {
                format!("{} (class {class}, {} attempts)", failure.error, failure.attempts)
            })
    }

    fn retry_text(
        &self,
        op: &str,
        class: EntityClass,
        f: impl FnMut() -> TextStoreResult<()>,
    ) -> Result<(), String> {
        self.config
            .retry
            .run(op, f, |e| e.is_transient())
            .map_err(|failure| {
                format!("{} (class {class}, {} attempts)", failure.error, failure.attempts)
            })
    }

    /// Block until `version` (or higher) of the id is cleanly applied.
    /// Returns `false` on timeout.
    ///
    /// The check reads published ledger state only, so `timeout` bounds the wait even
    /// while a write to the same id is still inside its store calls.
    pub fn wait_visible(
        &self,
        class: EntityClass,
        id: &str,
        version: u64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut epoch = self.visibility.epoch.lock();
        loop {
            if self
                .ledger
                .version_of(class, id)
                .is_some_and(|applied| applied >= version)
            {
                return true;
            }
            if self
                .visibility
                .changed
                .wait_until(&mut epoch, deadline)
                .timed_out()
            {
                return self
                    .ledger
                    .version_of(class, id)
                    .is_some_and(|applied| applied >= version);
            }
        }
    }

    pub fn fault_marks(&self) -> Vec<FaultMark> {
        self.ledger.fault_marks()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CoordinatorStats {
            applied: load(&self.counters.applied),
            reconciled: load(&self.counters.reconciled),
            duplicate: load(&self.counters.duplicate),
            stale: load(&self.counters.stale),
            rejected: load(&self.counters.rejected),
            degraded: load(&self.counters.degraded),
            failed: load(&self.counters.failed),
            fault_marks: self.ledger.fault_marks().len(),
            tracked_ids: self.ledger.len(),
        }
    }

    pub fn vector_store(&self, class: EntityClass) -> &Arc<dyn VectorIndexStore> {
        self.vectors.get(class)
    }

    pub fn text_store(&self, class: EntityClass) -> &Arc<dyn TextIndexStore> {
        self.texts.get(class)
    }

    /// Persist vector snapshots and the version ledger into `dir`.
    ///
    /// The text index persists on its own and is not copied.
    pub fn checkpoint(&self, dir: &Path) -> Result<CheckpointSummary> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;

        let mut vectors = 0;
        for class in EntityClass::ALL {
            let store = self.vectors.get(class);
            let path = vector_snapshot_path(dir, class);
            store
                .snapshot(&path)
                .with_context(|| format!("writing {class} vector snapshot"))?;
            vectors += store.len();
        }
        let ledger_entries = self.ledger.save(&dir.join(LEDGER_FILE))?;

        let summary = CheckpointSummary {
            vectors,
            ledger_entries,
            fault_marks: self.ledger.fault_marks().len(),
        };
        info!(
            dir = %dir.display(),
            vectors = summary.vectors,
            ledger_entries = summary.ledger_entries,
            fault_marks = summary.fault_marks,
            "checkpoint written"
        );
        Ok(summary)
    }

    /// Load the version ledger from a checkpoint directory, if one was written.
    /// Vector snapshots are loaded by whoever builds the stores.
    pub fn restore_ledger(&self, dir: &Path) -> Result<usize> {
        let path = dir.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let restored = self.ledger.restore(VersionLedger::load_entries(&path)?);
        info!(dir = %dir.display(), entries = restored, "version ledger restored");
        Ok(restored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub vectors: usize,
    pub ledger_entries: usize,
    pub fault_marks: usize,
}

pub fn vector_snapshot_path(dir: &Path, class: EntityClass) -> PathBuf {
    dir.join(format!("{class}.{VECTOR_SNAPSHOT_EXT}"))
}

/// Read-only view of the indices and the ledger. The query path never mutates.
#[derive(Clone)]
pub struct IndexReader {
    coordinator: Arc<IndexCoordinator>,
}

impl IndexReader {
    pub fn dimension(&self, class: EntityClass) -> usize {
        self.coordinator.vectors.get(class).dimension()
    }

    pub fn search_vectors(
        &self,
        class: EntityClass,
        query: &[f32],
        k: usize,
    ) -> VectorStoreResult<Vec<AnnHit>> {
        self.coordinator.vectors.get(class).search(query, k)
    }

    pub fn search_text(
        &self,
        class: EntityClass,
        filters: &SearchFilters,
        query_text: Option<&str>,
        k: usize,
    ) -> TextStoreResult<Vec<TextHit>> {
        self.coordinator
            .texts
            .get(class)
            .search(filters, query_text, k)
    }

    pub fn version_of(&self, class: EntityClass, id: &str) -> Option<u64> {
        self.coordinator.ledger.version_of(class, id)
    }

    pub fn attributes_of(&self, class: EntityClass, id: &str) -> Option<Arc<StructuredAttributes>> {
        self.coordinator.ledger.attributes_of(class, id)
    }

    pub fn wait_visible(
        &self,
        class: EntityClass,
        id: &str,
        version: u64,
        timeout: Duration,
    ) -> bool {
        self.coordinator.wait_visible(class, id, version, timeout)
    }
}
