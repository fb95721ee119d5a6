//! IVF-Flat approximate nearest neighbor index.
//!
//! Vectors are partitioned into inverted lists around k-means centroids. A query
//! probes the `n_probe` lists whose centroids are closest and scores every vector in
//! those lists exactly.
//!
//! ## Lifecycle
//!
//! - Below `train_threshold` vectors there are no centroids and search is an exact
//!   flat scan.
//! - When the population reaches the threshold, and again every time it doubles,
//!   centroids are retrained and every vector is reassigned.
//!
//! ## Trade-offs
//!
//! - **Recall**: bounded by `n_probe / n_lists`; `n_probe == n_lists` is exact.
//! - **Exact duplicates**: a stored vector and an identical query resolve to the same
//!   first-probed list (same ordering function, ties broken by list index), so an
//!   identical query always scans the stored vector.
//! - **Determinism**: training seeds are evenly spaced over id-sorted vectors, so two
//!   indices fed the same data end up with the same centroids.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::search::vector_index::VectorStoreError;

/// Magic bytes for IVF snapshot files.
pub const IVF_MAGIC: [u8; 4] = *b"TMIV";

/// IVF snapshot format version.
pub const IVF_VERSION: u16 = 1;

pub const DEFAULT_N_LISTS: usize = 64;
pub const DEFAULT_N_PROBE: usize = 8;
pub const DEFAULT_TRAIN_THRESHOLD: usize = 2048;
pub const DEFAULT_KMEANS_ITERATIONS: usize = 10;

/// Distance metric, fixed per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in `[0, 2]`. Vectors are L2-normalized on insert.
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
}

impl DistanceMetric {
    /// Put a raw vector into the form the index stores and compares.
    pub fn prepare(self, vector: &[f32]) -> Vec<f32> {
        match self {
            DistanceMetric::Cosine => {
                let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    vector.iter().map(|x| x / norm).collect()
                } else {
                    vector.to_vec()
                }
            }
            DistanceMetric::L2 => vector.to_vec(),
        }
    }

    /// Distance between two prepared vectors.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                (1.0 - dot).max(0.0)
            }
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
        }
    }
}

/// IVF tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvfParams {
    /// Number of inverted lists (centroids).
    pub n_lists: usize,
    /// Lists probed per query (higher = better recall, slower).
    pub n_probe: usize,
    /// Population at which centroids are first trained.
    pub train_threshold: usize,
    /// Lloyd iterations per training run.
    pub kmeans_iterations: usize,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            n_lists: DEFAULT_N_LISTS,
            n_probe: DEFAULT_N_PROBE,
            train_threshold: DEFAULT_TRAIN_THRESHOLD,
            kmeans_iterations: DEFAULT_KMEANS_ITERATIONS,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnHit {
    pub id: String,
    pub distance: f32,
}

/// Statistics from a single search.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnnSearchStats {
    /// Total vectors in the index.
    pub index_size: usize,
    pub dimension: usize,
    /// Lists probed for this query (0 for a flat scan).
    pub probes: usize,
    /// Lists in the index (0 before training).
    pub lists: usize,
    /// Vectors scored exactly.
    pub candidates_scanned: usize,
    pub k_requested: usize,
    pub k_returned: usize,
    pub search_time_us: u64,
    /// Whether any list was skipped.
    pub is_approximate: bool,
}

/// Index-level diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IvfStats {
    pub size: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub lists: usize,
    pub n_probe: usize,
    pub trained: bool,
    pub largest_list: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    vector: Vec<f32>,
    list: usize,
}

/// In-memory IVF-Flat index over string ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    metric: DistanceMetric,
    params: IvfParams,
    entries: FxHashMap<String, StoredVector>,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<String>>,
    /// Population at the last training run.
    trained_at: usize,
}

impl IvfIndex {
    pub fn new(dimension: usize, metric: DistanceMetric, params: IvfParams) -> Self {
        Self {
            dimension,
            metric,
            params,
            entries: FxHashMap::default(),
            centroids: Vec::new(),
            lists: Vec::new(),
            trained_at: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or replace vectors. The batch is validated as a whole before anything
    /// is written. Returns the number of ids whose stored vector changed.
    pub fn upsert(&mut self, items: Vec<(String, Vec<f32>)>) -> Result<usize, VectorStoreError> {
        if let Some((_, bad)) = items.iter().find(|(_, v)| v.len() != self.dimension) {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        let mut changed = 0;
        for (id, raw) in items {
            let vector = self.metric.prepare(&raw);
            if let Some(existing) = self.entries.get(&id)
                && existing.vector == vector
            {
                continue;
            }
            self.remove_from_list(&id);
            let list = self.nearest_list(&vector);
            if let Some(list_idx) = list {
                self.lists[list_idx].push(id.clone());
            }
            self.entries.insert(
                id,
                StoredVector {
                    vector,
                    list: list.unwrap_or(0),
                },
            );
            changed += 1;
        }

        if changed > 0 {
            self.maybe_retrain();
        }
        Ok(changed)
    }

    /// Remove an id. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.entries.contains_key(id) {
            return false;
        }
        self.remove_from_list(id);
        self.entries.remove(id);
        true
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<AnnHit>, VectorStoreError> {
        let (hits, _stats) = self.search_with_stats(query, k)?;
        Ok(hits)
    }

    /// Search and report how much of the index was touched.
    pub fn search_with_stats(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<(Vec<AnnHit>, AnnSearchStats), VectorStoreError> {
        if self.entries.is_empty() {
            return Err(VectorStoreError::EmptyIndex);
        }
        if query.len() != self.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let start = Instant::now();
        let mut stats = AnnSearchStats {
            index_size: self.entries.len(),
            dimension: self.dimension,
            lists: self.centroids.len(),
            k_requested: k,
            ..AnnSearchStats::default()
        };
        if k == 0 {
            return Ok((Vec::new(), stats));
        }

        let query = self.metric.prepare(query);
        let mut hits: Vec<AnnHit> = if self.centroids.is_empty() {
            self.entries
                .iter()
                .map(|(id, stored)| AnnHit {
                    id: id.clone(),
                    distance: self.metric.distance(&query, &stored.vector),
                })
                .collect()
        } else {
            let probes = self.params.n_probe.clamp(1, self.centroids.len());
            stats.probes = probes;
            stats.is_approximate = probes < self.centroids.len();
            self.ranked_lists(&query)
                .into_iter()
                .take(probes)
                .flat_map(|list_idx| self.lists[list_idx].iter())
                .filter_map(|id| {
                    self.entries.get(id).map(|stored| AnnHit {
                        id: id.clone(),
                        distance: self.metric.distance(&query, &stored.vector),
                    })
                })
                .collect()
        };
        stats.candidates_scanned = hits.len();

        hits.sort_by(compare_hits);
        hits.truncate(k);

        stats.k_returned = hits.len();
        stats.search_time_us = start.elapsed().as_micros() as u64;
        Ok((hits, stats))
    }

    pub fn stats(&self) -> IvfStats {
        IvfStats {
            size: self.entries.len(),
            dimension: self.dimension,
            metric: self.metric,
            lists: self.centroids.len(),
            n_probe: self.params.n_probe,
            trained: self.is_trained(),
            largest_list: self.lists.iter().map(Vec::len).max().unwrap_or(0),
        }
    }

    /// Write a snapshot (magic, format version, MessagePack body).
    ///
    /// The body goes to a sibling temp file that is renamed over `path`, so an
    /// interrupted save leaves the previous snapshot in place.
    pub fn save(&self, path: &Path) -> Result<(), VectorStoreError> {
        let tmp = snapshot_tmp_path(path);
        {
            let file = File::create(&tmp).map_err(|e| snapshot_err(&tmp, e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(&IVF_MAGIC)
                .and_then(|()| writer.write_all(&IVF_VERSION.to_le_bytes()))
                .map_err(|e| snapshot_err(&tmp, e))?;
            rmp_serde::encode::write(&mut writer, self).map_err(|e| snapshot_err(&tmp, e))?;
            writer
                .into_inner()
                .map_err(|e| snapshot_err(&tmp, e.into_error()))?
                .sync_all()
                .map_err(|e| snapshot_err(&tmp, e))?;
        }
        std::fs::rename(&tmp, path).map_err(|e| snapshot_err(path, e))?;
        Ok(())
    }

    /// Read a snapshot written by [`IvfIndex::save`].
    pub fn load(path: &Path) -> Result<Self, VectorStoreError> {
        let file = File::open(path).map_err(|e| snapshot_err(path, e))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| snapshot_err(path, e))?;
        if magic != IVF_MAGIC {
            return Err(VectorStoreError::Snapshot(format!(
                "{}: invalid magic bytes",
                path.display()
            )));
        }
        let mut version = [0u8; 2];
        reader
            .read_exact(&mut version)
            .map_err(|e| snapshot_err(path, e))?;
        let version = u16::from_le_bytes(version);
        if version != IVF_VERSION {
            return Err(VectorStoreError::Snapshot(format!(
                "{}: unsupported snapshot version {version}",
                path.display()
            )));
        }

        rmp_serde::decode::from_read(reader).map_err(|e| snapshot_err(path, e))
    }

    fn remove_from_list(&mut self, id: &str) {
        let Some(stored) = self.entries.get(id) else {
            return;
        };
        if let Some(list) = self.lists.get_mut(stored.list)
            && let Some(pos) = list.iter().position(|member| member == id)
        {
            list.swap_remove(pos);
        }
    }

    fn nearest_list(&self, vector: &[f32]) -> Option<usize> {
        self.centroids
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, self.metric.distance(vector, c)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(idx, _)| idx)
    }

    /// List indices ordered by centroid distance, ties by index. The first element is
    /// always what [`Self::nearest_list`] returns for the same vector.
    fn ranked_lists(&self, vector: &[f32]) -> Vec<usize> {
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, self.metric.distance(vector, c)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(idx, _)| idx).collect()
    }

    fn maybe_retrain(&mut self) {
        let len = self.entries.len();
        if self.params.n_lists <= 1
            || len < self.params.train_threshold
            || len < self.trained_at.saturating_mul(2)
        {
            return;
        }
        self.train();
    }

    /// Retrain centroids with deterministic k-means and reassign every vector.
    pub fn train(&mut self) {
        let len = self.entries.len();
        let k = self.params.n_lists.min(len);
        if k == 0 {
            return;
        }

        let mut ids: Vec<&String> = self.entries.keys().collect();
        ids.sort();
        let vectors: Vec<&[f32]> = ids
            .iter()
            .map(|id| self.entries[*id].vector.as_slice())
            .collect();

        let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| vectors[i * len / k].to_vec()).collect();
        let metric = self.metric;

        for _ in 0..self.params.kmeans_iterations.max(1) {
            let assignment: Vec<usize> = vectors
                .par_iter()
                .map(|v| nearest_centroid(metric, &centroids, v))
                .collect();

            let mut sums = vec![vec![0.0f32; self.dimension]; k];
            let mut counts = vec![0usize; k];
            for (v, &c) in vectors.iter().zip(&assignment) {
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                    *s += x;
                }
            }

            let mut moved = false;
            for (c, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
                // Empty clusters keep their previous centroid.
                if count == 0 {
                    continue;
                }
                let mean: Vec<f32> = sum.iter().map(|s| s / count as f32).collect();
                let mean = metric.prepare(&mean);
                if mean != centroids[c] {
                    moved = true;
                    centroids[c] = mean;
                }
            }
            if !moved {
                break;
            }
        }

        let assignment: Vec<usize> = vectors
            .par_iter()
            .map(|v| nearest_centroid(metric, &centroids, v))
            .collect();
        let owned_ids: Vec<String> = ids.into_iter().cloned().collect();

        let mut lists = vec![Vec::new(); k];
        for (id, list) in owned_ids.into_iter().zip(assignment) {
            if let Some(stored) = self.entries.get_mut(&id) {
                stored.list = list;
            }
            lists[list].push(id);
        }

        self.centroids = centroids;
        self.lists = lists;
        self.trained_at = len;

        tracing::debug!(
            size = len,
            lists = k,
            dimension = self.dimension,
            "IVF centroids trained"
        );
    }
}

fn nearest_centroid(metric: DistanceMetric, centroids: &[Vec<f32>], v: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, metric.distance(v, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn compare_hits(a: &AnnHit, b: &AnnHit) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.id.cmp(&b.id))
}

fn snapshot_tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn snapshot_err(path: &Path, err: impl std::fmt::Display) -> VectorStoreError {
    VectorStoreError::Snapshot(format!("{}: {err}", path.display()))
}
