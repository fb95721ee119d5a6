//! Vector index store: the per-class nearest-neighbor store consulted by the planner
//! and written by the index coordinator.
//!
//! [`VectorIndexStore`] is the seam the coordinator and planner depend on;
//! [`AnnVectorStore`] is the in-process implementation over [`IvfIndex`].

use std::fmt;
use std::path::Path;

use parking_lot::RwLock;
use thiserror::Error;

use crate::search::ann_index::{AnnHit, DistanceMetric, IvfIndex, IvfParams, IvfStats};

/// File extension for vector snapshots.
pub const VECTOR_SNAPSHOT_EXT: &str = "ivf";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VectorStoreError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Search against an index holding no vectors. Distinct from "no match".
    #[error("vector index is empty")]
    EmptyIndex,
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
    #[error("vector snapshot error: {0}")]
    Snapshot(String),
}

impl VectorStoreError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VectorStoreError::Unavailable(_))
    }
}

pub type VectorStoreResult<T> = Result<T, VectorStoreError>;

/// Nearest-neighbor store for one entity class.
///
/// # Thread Safety
///
/// Implementations must tolerate concurrent searches alongside writes; a search
/// sees each id either before or after a concurrent write, never a mix.
pub trait VectorIndexStore: Send + Sync {
    /// Fixed embedding dimension for this class.
    fn dimension(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    /// Insert or replace vectors by id. A batch containing any vector of the wrong
    /// dimension is rejected as a whole with [`VectorStoreError::DimensionMismatch`].
    fn upsert(&self, items: Vec<(String, Vec<f32>)>) -> VectorStoreResult<usize>;

    /// Remove ids. Absent ids are ignored. Returns how many were removed.
    fn delete(&self, ids: &[String]) -> VectorStoreResult<usize>;

    /// Up to `k` nearest ids ordered by `(distance asc, id asc)`.
    ///
    /// # Errors
    ///
    /// - [`VectorStoreError::EmptyIndex`] when the store holds no vectors.
    /// - [`VectorStoreError::DimensionMismatch`] for a query of the wrong length.
    fn search(&self, query: &[f32], k: usize) -> VectorStoreResult<Vec<AnnHit>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> IvfStats;

    /// Persist the current contents to `path`.
    fn snapshot(&self, path: &Path) -> VectorStoreResult<()>;
}

/// IVF-backed in-process vector store.
#[derive(Debug)]
pub struct AnnVectorStore {
    index: RwLock<IvfIndex>,
}

impl AnnVectorStore {
    pub fn new(dimension: usize, metric: DistanceMetric, params: IvfParams) -> Self {
        Self {
            index: RwLock::new(IvfIndex::new(dimension, metric, params)),
        }
    }

    /// Restore from a snapshot, checking it matches the configured dimension and metric.
    pub fn load(path: &Path, dimension: usize, metric: DistanceMetric) -> VectorStoreResult<Self> {
        let index = IvfIndex::load(path)?;
        if index.dimension() != dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: dimension,
                actual: index.dimension(),
            });
        }
        if index.metric() != metric {
            return Err(VectorStoreError::Snapshot(format!(
                "{}: snapshot metric {} does not match configured {metric}",
                path.display(),
                index.metric()
            )));
        }
        Ok(Self {
            index: RwLock::new(index),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.read().contains(id)
    }
}

impl VectorIndexStore for AnnVectorStore {
    fn dimension(&self) -> usize {
        self.index.read().dimension()
    }

    fn metric(&self) -> DistanceMetric {
        self.index.read().metric()
    }

    fn upsert(&self, items: Vec<(String, Vec<f32>)>) -> VectorStoreResult<usize> {
        self.index.write().upsert(items)
    }

    fn delete(&self, ids: &[String]) -> VectorStoreResult<usize> {
        let mut index = self.index.write();
        Ok(ids.iter().filter(|id| index.remove(id)).count())
    }

    fn search(&self, query: &[f32], k: usize) -> VectorStoreResult<Vec<AnnHit>> {
        let (hits, stats) = self.index.read().search_with_stats(query, k)?;
        tracing::trace!(
            probes = stats.probes,
            scanned = stats.candidates_scanned,
            returned = stats.k_returned,
            took_us = stats.search_time_us,
            "vector search"
        );
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.index.read().len()
    }

    fn stats(&self) -> IvfStats {
        self.index.read().stats()
    }

    fn snapshot(&self, path: &Path) -> VectorStoreResult<()> {
        self.index.read().save(path)
    }
}

/// Summary of a vector store for display and logging.
#[derive(Debug, Clone)]
pub struct VectorStoreInfo {
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub size: usize,
    pub trained: bool,
}

impl VectorStoreInfo {
    pub fn from_store(store: &dyn VectorIndexStore) -> Self {
        let stats = store.stats();
        Self {
            dimension: stats.dimension,
            metric: stats.metric,
            size: stats.size,
            trained: stats.trained,
        }
    }
}

impl fmt::Display for VectorStoreInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.trained { "ivf" } else { "flat" };
        write!(
            f,
            "{} vectors, dim {}, {} ({mode})",
            self.size, self.dimension, self.metric
        )
    }
}
