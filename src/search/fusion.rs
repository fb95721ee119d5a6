//! Fusion ranking: combine vector distance, text score and structured features into one
//! deterministic ordering.
//!
//! Every signal is mapped into `[0, 1]` before weighting:
//!
//! - vector: `1 / (1 + distance)`
//! - text: min-max over the batch, or reciprocal rank `(k + 1) / (k + rank)`
//! - structured features are already ratios
//!
//! Weights are non-negative, so a candidate's fused score never decreases when any
//! weight grows.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::types::{MatchCandidate, SignalBreakdown, StructuredFeatures};

pub const DEFAULT_RRF_K: f32 = 60.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextNormalization {
    /// Batch-local min-max; a constant batch maps to 1.0.
    #[default]
    MinMax,
    /// Position in the text ranking, `(k + 1) / (k + rank)`.
    ReciprocalRank,
}

/// Per-signal weights. All must be finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub vector: f32,
    pub text: f32,
    pub skill: f32,
    pub seniority: f32,
    pub geo: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            text: 0.3,
            skill: 0.1,
            seniority: 0.05,
            geo: 0.05,
        }
    }
}

impl FusionWeights {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f32)> {
        [
            ("vector", self.vector),
            ("text", self.text),
            ("skill", self.skill),
            ("seniority", self.seniority),
            ("geo", self.geo),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub weights: FusionWeights,
    pub text_normalization: TextNormalization,
    /// Smoothing constant for reciprocal-rank normalization.
    pub rrf_k: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            text_normalization: TextNormalization::default(),
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

/// Merged per-id signals handed over by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub id: String,
    pub vector_distance: Option<f32>,
    pub text_score: Option<f32>,
    pub structured_features: StructuredFeatures,
    pub version: u64,
}

impl RawCandidate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vector_distance: None,
            text_score: None,
            structured_features: StructuredFeatures::default(),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FusionRanker {
    config: FusionConfig,
}

impl FusionRanker {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Score, order and truncate. Output ranks are 1-based.
    pub fn rank(&self, candidates: Vec<RawCandidate>, top_k: usize) -> Vec<MatchCandidate> {
        if top_k == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let text_norm = self.normalized_text(&candidates);
        let w = &self.config.weights;

        let mut scored: Vec<MatchCandidate> = candidates
            .into_iter()
            .zip(text_norm)
            .map(|(c, text)| {
                let features = c.structured_features;
                let signals = SignalBreakdown {
                    vector: w.vector * c.vector_distance.map_or(0.0, vector_similarity),
                    text: w.text * text.unwrap_or(0.0),
                    skill: w.skill * feature(features.skill_overlap),
                    seniority: w.seniority * feature(features.seniority_match),
                    geo: w.geo * feature(features.geo_match),
                };
                MatchCandidate {
                    id: c.id,
                    vector_distance: c.vector_distance,
                    text_score: c.text_score,
                    structured_features: features,
                    fused_score: finite_or_zero(signals.total()),
                    rank: 0,
                    version: c.version,
                    signals,
                }
            })
            .collect();

        scored.sort_by(compare_fused);
        scored.truncate(top_k);
        for (idx, candidate) in scored.iter_mut().enumerate() {
            candidate.rank = idx + 1;
        }
        scored
    }

    /// Normalized text signal per candidate, in input order.
    fn normalized_text(&self, candidates: &[RawCandidate]) -> Vec<Option<f32>> {
        let present: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.text_score.map(|s| (idx, finite_or_zero(s))))
            .collect();
        let mut out = vec![None; candidates.len()];

        match self.config.text_normalization {
            TextNormalization::MinMax => {
                let raw: Vec<f32> = present.iter().map(|(_, s)| *s).collect();
                for ((idx, _), norm) in present.iter().zip(normalize_scores(&raw)) {
                    out[*idx] = Some(norm);
                }
            }
            TextNormalization::ReciprocalRank => {
                let mut order = present;
                order.sort_by(|a, b| {
                    b.1.total_cmp(&a.1)
                        .then_with(|| candidates[a.0].id.cmp(&candidates[b.0].id))
                });
                for (pos, (idx, _)) in order.into_iter().enumerate() {
                    out[idx] = Some(reciprocal_rank(pos + 1, self.config.rrf_k));
                }
            }
        }
        out
    }
}

/// Map a distance to a similarity in `(0, 1]`.
pub fn vector_similarity(distance: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    1.0 / (1.0 + distance.max(0.0))
}

/// `(k + 1) / (k + rank)` for a 1-based rank; the top hit scores 1.0.
pub fn reciprocal_rank(rank: usize, k: f32) -> f32 {
    (k + 1.0) / (k + rank as f32)
}

/// Normalize scores to `[0, 1]` using min-max scaling.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if range.abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores.iter().map(|&s| (s - min) / range).collect()
}

/// Fused score desc, version desc, id asc.
pub fn compare_fused(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    finite_or_zero(b.fused_score)
        .total_cmp(&finite_or_zero(a.fused_score))
        .then_with(|| b.version.cmp(&a.version))
        .then_with(|| a.id.cmp(&b.id))
}

fn feature(value: Option<f32>) -> f32 {
    value.map_or(0.0, |v| finite_or_zero(v).clamp(0.0, 1.0))
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() { value } else { 0.0 }
}
