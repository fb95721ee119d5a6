//! Version ledger: per-(class, id) write state shared by the coordinator (writer) and
//! the planner (reader).
//!
//! The table is sharded by id hash. A shard lock is held only long enough to find or
//! create a slot. Each slot has two halves:
//!
//! - a writer mutex, held by the coordinator across both store writes of one record, so
//!   same-id writers serialize on the slot alone;
//! - a published copy of the slot state, swapped in under a short `RwLock` once the
//!   writer has decided the outcome. Readers only ever touch this copy, so a query never
//!   waits on a write's store I/O or retry backoff.

use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};

use crate::model::types::{EntityClass, StructuredAttributes};

pub const LEDGER_FILE: &str = "ledger.msgpack";
pub const LEDGER_FORMAT_VERSION: u16 = 1;
pub const DEFAULT_SHARDS: usize = 64;

/// Which of the two indices an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Vector,
    Text,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Vector => f.write_str("vector"),
            StoreKind::Text => f.write_str("text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// One sub-write landed, the other did not.
    Degraded { failed: StoreKind },
    /// Neither sub-write landed.
    Failed,
}

/// A write that did not complete cleanly and must be re-applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultMark {
    pub class: EntityClass,
    pub id: String,
    pub version: u64,
    pub kind: FaultKind,
    pub cause: String,
    pub marked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct IdSlot {
    /// Last version applied to both stores.
    pub applied: Option<u64>,
    pub tombstone: bool,
    /// Attributes of the version currently in the vector store.
    pub attributes: Option<Arc<StructuredAttributes>>,
    pub fault: Option<FaultMark>,
}

impl IdSlot {
    /// Highest version ever accepted for this id, clean or faulted.
    pub fn highest_seen(&self) -> Option<u64> {
        let faulted = self.fault.as_ref().map(|f| f.version);
        self.applied.max(faulted)
    }
}

/// One id's entry: writer-side state plus the copy readers see.
#[derive(Debug, Default)]
pub(crate) struct SlotCell {
    state: Mutex<IdSlot>,
    published: RwLock<IdSlot>,
}

impl SlotCell {
    /// Writer access. May be held across store I/O; readers never take it.
    pub fn lock(&self) -> MutexGuard<'_, IdSlot> {
        self.state.lock()
    }

    /// Make `state` the version readers observe.
    pub fn publish(&self, state: &IdSlot) {
        *self.published.write() = state.clone();
    }

    pub fn read<T>(&self, f: impl FnOnce(&IdSlot) -> T) -> T {
        f(&self.published.read())
    }
}

/// Serialized form of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub class: EntityClass,
    pub id: String,
    pub applied: Option<u64>,
    pub tombstone: bool,
    pub attributes: Option<StructuredAttributes>,
    pub fault: Option<FaultMark>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerSnapshot {
    format_version: u16,
    saved_at: DateTime<Utc>,
    entries: Vec<LedgerEntry>,
}

type SlotKey = (EntityClass, String);
type Shard = FxHashMap<SlotKey, Arc<SlotCell>>;

pub struct VersionLedger {
    shards: Vec<Mutex<Shard>>,
}

impl VersionLedger {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(Shard::default()))
                .collect(),
        }
    }

    fn shard_for(&self, class: EntityClass, id: &str) -> &Mutex<Shard> {
        let mut hasher = FxHasher::default();
        class.hash(&mut hasher);
        id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Slot for an id, created on first use.
    pub(crate) fn slot(&self, class: EntityClass, id: &str) -> Arc<SlotCell> {
        let mut shard = self.shard_for(class, id).lock();
        Arc::clone(shard.entry((class, id.to_string())).or_default())
    }

    pub(crate) fn get(&self, class: EntityClass, id: &str) -> Option<Arc<SlotCell>> {
        let shard = self.shard_for(class, id).lock();
        shard.get(&(class, id.to_string())).map(Arc::clone)
    }

    /// Last cleanly applied version, as published. Never waits on an in-flight write.
    pub fn version_of(&self, class: EntityClass, id: &str) -> Option<u64> {
        self.get(class, id).and_then(|slot| slot.read(|s| s.applied))
    }

    pub fn attributes_of(&self, class: EntityClass, id: &str) -> Option<Arc<StructuredAttributes>> {
        self.get(class, id)
            .and_then(|slot| slot.read(|s| s.attributes.clone()))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all_slots(&self) -> Vec<(SlotKey, Arc<SlotCell>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            out.extend(shard.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Outstanding fault marks ordered by (class, id).
    pub fn fault_marks(&self) -> Vec<FaultMark> {
        self.all_slots()
            .into_iter()
            .filter_map(|(_, slot)| slot.read(|s| s.fault.clone()))
            .collect()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.all_slots()
            .into_iter()
            .map(|((class, id), slot)| {
                slot.read(|s| LedgerEntry {
                    class,
                    id,
                    applied: s.applied,
                    tombstone: s.tombstone,
                    attributes: s.attributes.as_deref().cloned(),
                    fault: s.fault.clone(),
                })
            })
            .collect()
    }

    /// Replace the slot state for every entry given.
    pub fn restore(&self, entries: Vec<LedgerEntry>) -> usize {
        let count = entries.len();
        for entry in entries {
            let cell = self.slot(entry.class, &entry.id);
            let mut slot = cell.lock();
            slot.applied = entry.applied;
            slot.tombstone = entry.tombstone;
            slot.attributes = entry.attributes.map(Arc::new);
            slot.fault = entry.fault;
            cell.publish(&slot);
        }
        count
    }

    /// Write a MessagePack snapshot; the file is replaced atomically.
    pub fn save(&self, path: &Path) -> Result<usize> {
        let entries = self.entries();
        let count = entries.len();
        let snapshot = LedgerSnapshot {
            format_version: LEDGER_FORMAT_VERSION,
            saved_at: Utc::now(),
            entries,
        };

        let tmp = path.with_extension("msgpack.tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("creating ledger snapshot {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            rmp_serde::encode::write_named(&mut writer, &snapshot)
                .context("encoding ledger snapshot")?;
            writer.flush().context("flushing ledger snapshot")?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("replacing ledger snapshot {}", path.display()))?;
        Ok(count)
    }

    /// Read a snapshot written by [`VersionLedger::save`].
    pub fn load_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
        let file = File::open(path)
            .with_context(|| format!("opening ledger snapshot {}", path.display()))?;
        let snapshot: LedgerSnapshot = rmp_serde::decode::from_read(BufReader::new(file))
            .with_context(|| format!("decoding ledger snapshot {}", path.display()))?;
        if snapshot.format_version != LEDGER_FORMAT_VERSION {
            bail!(
                "unsupported ledger format version {} in {}",
                snapshot.format_version,
                path.display()
            );
        }
        Ok(snapshot.entries)
    }
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn slot_is_shared_per_id() {
        let ledger = VersionLedger::new(4);
        let a = ledger.slot(EntityClass::Candidate, "c1");
        let b = ledger.slot(EntityClass::Candidate, "c1");
        assert!(Arc::ptr_eq(&a, &b));
        let other_class = ledger.slot(EntityClass::Posting, "c1");
        assert!(!Arc::ptr_eq(&a, &other_class));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn highest_seen_includes_faults() {
        let mut slot = IdSlot {
            applied: Some(3),
            ..Default::default()
        };
        assert_eq!(slot.highest_seen(), Some(3));
        slot.fault = Some(FaultMark {
            class: EntityClass::Candidate,
            id: "c1".into(),
            version: 5,
            kind: FaultKind::Failed,
            cause: "down".into(),
            marked_at: Utc::now(),
        });
        assert_eq!(slot.highest_seen(), Some(5));
    }

    #[test]
    fn readers_see_published_state_while_writer_holds_slot() {
        let ledger = VersionLedger::new(4);
        let cell = ledger.slot(EntityClass::Candidate, "c1");
        let mut slot = cell.lock();
        slot.applied = Some(1);
        cell.publish(&slot);

        // Writer still holds the slot and has moved on to an unpublished version.
        slot.applied = Some(2);
        assert_eq!(ledger.version_of(EntityClass::Candidate, "c1"), Some(1));
        assert_eq!(ledger.entries()[0].applied, Some(1));

        cell.publish(&slot);
        drop(slot);
        assert_eq!(ledger.version_of(EntityClass::Candidate, "c1"), Some(2));
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE);

        let ledger = VersionLedger::new(8);
        {
            let cell = ledger.slot(EntityClass::Posting, "p1");
            let mut slot = cell.lock();
            slot.applied = Some(2);
            slot.tombstone = true;
            cell.publish(&slot);
        }
        {
            let cell = ledger.slot(EntityClass::Candidate, "c1");
            let mut slot = cell.lock();
            slot.applied = Some(7);
            slot.attributes = Some(Arc::new(StructuredAttributes {
                remote: true,
                ..Default::default()
            }));
            cell.publish(&slot);
        }
        assert_eq!(ledger.save(&path).unwrap(), 2);

        let restored = VersionLedger::new(2);
        restored.restore(VersionLedger::load_entries(&path).unwrap());
        assert_eq!(restored.entries(), ledger.entries());
        assert_eq!(restored.version_of(EntityClass::Candidate, "c1"), Some(7));
        assert!(restored.attributes_of(EntityClass::Candidate, "c1").unwrap().remote);
        assert_eq!(restored.version_of(EntityClass::Candidate, "missing"), None);
    }
}
