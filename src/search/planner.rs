//! Query planner: turns a retrieval request into calls against the vector and text
//! indices, merges what comes back and hands it to the fusion ranker.
//!
//! The query path is read-only. It goes through an [`IndexReader`] and never touches
//! the coordinator's write side.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::indexer::coordinator::IndexReader;
use crate::model::types::{EntityClass, MatchCandidate, StructuredAttributes};
use crate::search::ann_index::AnnHit;
use crate::search::features::{MatchProfile, compute_features};
use crate::search::fusion::{FusionConfig, FusionRanker, RawCandidate};
use crate::search::text_index::{SearchFilters, TextHit};
use crate::search::vector_index::VectorStoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Each source is asked for `top_k * over_fetch_factor` hits...
    pub over_fetch_factor: usize,
    /// ...but never fewer than this.
    pub min_candidates: usize,
    /// Default read-your-write wait.
    pub staleness_timeout_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            over_fetch_factor: 4,
            min_candidates: 50,
            staleness_timeout_ms: 2_000,
        }
    }
}

impl PlannerConfig {
    pub fn breadth(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.over_fetch_factor.max(1))
            .max(self.min_candidates)
    }
}

/// Require that a given write is visible before the query runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadYourWrite {
    pub class: EntityClass,
    pub id: String,
    pub version: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    /// Class of the entities being retrieved.
    #[serde(alias = "source_class")]
    pub class: EntityClass,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub query_vector: Option<Vec<f32>>,
    pub top_k: usize,
    /// The entity being matched against, for structured features.
    #[serde(default)]
    pub profile: Option<MatchProfile>,
    #[serde(default)]
    pub read_your_write: Option<ReadYourWrite>,
}

impl RetrievalRequest {
    pub fn new(class: EntityClass, top_k: usize) -> Self {
        Self {
            class,
            filters: SearchFilters::default(),
            query_text: None,
            query_vector: None,
            top_k,
            profile: None,
            read_your_write: None,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.query_vector = Some(vector);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_profile(mut self, profile: MatchProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    fn text(&self) -> Option<&str> {
        self.query_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<MatchCandidate>,
    /// At least one source failed or a read-your-write wait timed out.
    pub partial: bool,
}

/// What the planner will ask of each source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryPlan {
    pub class: EntityClass,
    pub top_k: usize,
    /// Hits requested from the vector index, if consulted.
    pub vector_breadth: Option<usize>,
    /// Hits requested from the text index, if consulted.
    pub text_breadth: Option<usize>,
    /// Whether text hits carry a score. Filter-only lookups only add candidates.
    pub text_scored: bool,
    pub filtered: bool,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("query vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("all consulted sources unavailable: {0}")]
    SourcesUnavailable(String),
    #[error("query cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked between query stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), QueryError> {
        if self.is_cancelled() {
            Err(QueryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct QueryPlanner {
    reader: IndexReader,
    ranker: FusionRanker,
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(reader: IndexReader, fusion: FusionConfig, config: PlannerConfig) -> Self {
        Self {
            reader,
            ranker: FusionRanker::new(fusion),
            config,
        }
    }

    /// Validate a request and decide which sources to consult. Performs no I/O.
    pub fn plan(&self, request: &RetrievalRequest) -> Result<QueryPlan, QueryError> {
        if request.top_k == 0 {
            return Err(QueryError::InvalidQuery("top_k must be at least 1".into()));
        }
        let has_text = request.text().is_some();
        if request.query_vector.is_none() && !has_text {
            return Err(QueryError::InvalidQuery(
                "a query needs a vector or query text; filters alone only narrow results".into(),
            ));
        }
        if let Some(vector) = &request.query_vector {
            let expected = self.reader.dimension(request.class);
            if vector.len() != expected {
                return Err(QueryError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let breadth = self.config.breadth(request.top_k);
        let filtered = !request.filters.is_empty();
        Ok(QueryPlan {
            class: request.class,
            top_k: request.top_k,
            vector_breadth: request.query_vector.as_ref().map(|_| breadth),
            text_breadth: (has_text || filtered).then_some(breadth),
            text_scored: has_text,
            filtered,
        })
    }

    pub fn query(&self, request: &RetrievalRequest) -> Result<QueryResponse, QueryError> {
        self.query_with_cancel(request, &CancellationToken::default())
    }

    pub fn query_with_cancel(
        &self,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        let plan = self.plan(request)?;
        debug!(
            class = %plan.class,
            top_k = plan.top_k,
            vector_breadth = ?plan.vector_breadth,
            text_breadth = ?plan.text_breadth,
            filtered = plan.filtered,
            "query planned"
        );
        cancel.check()?;

        let mut partial = false;
        if let Some(ryw) = &request.read_your_write {
            let timeout = Duration::from_millis(
                ryw.timeout_ms.unwrap_or(self.config.staleness_timeout_ms),
            );
            if !self
                .reader
                .wait_visible(ryw.class, &ryw.id, ryw.version, timeout)
            {
                warn!(
                    class = %ryw.class,
                    id = %ryw.id,
                    version = ryw.version,
                    timeout_ms = timeout.as_millis() as u64,
                    "read-your-write wait timed out; serving partial results"
                );
                partial = true;
            }
            cancel.check()?;
        }

        let filters = request.filters.clone().normalized();
        let (vector_result, text_result) = rayon::join(
            || {
                plan.vector_breadth.map(|k| {
                    let query = request.query_vector.as_deref().unwrap_or_default();
                    match self.reader.search_vectors(plan.class, query, k) {
                        Err(VectorStoreError::EmptyIndex) => Ok(Vec::new()),
                        other => other.map_err(|e| e.to_string()),
                    }
                })
            },
            || {
                plan.text_breadth.map(|k| {
                    self.reader
                        .search_text(plan.class, &filters, request.text(), k)
                        .map_err(|e| e.to_string())
                })
            },
        );
        cancel.check()?;

        let mut consulted = 0;
        let mut failures = Vec::new();
        let vector_hits = take_source("vector", vector_result, &mut consulted, &mut failures);
        let text_hits = take_source("text", text_result, &mut consulted, &mut failures);
        if consulted > 0 && failures.len() == consulted {
            return Err(QueryError::SourcesUnavailable(failures.join("; ")));
        }
        if !failures.is_empty() {
            warn!(
                class = %plan.class,
                failures = %failures.join("; "),
                "source failed; serving single-source results"
            );
            partial = true;
        }

        let candidates = self.merge(&plan, request, &filters, vector_hits, text_hits);
        cancel.check()?;

        let results = self.ranker.rank(candidates, plan.top_k);
        debug!(
            class = %plan.class,
            returned = results.len(),
            partial,
            "query complete"
        );
        Ok(QueryResponse { results, partial })
    }

    /// Union of both hit lists keyed by id. Vector hits are filtered with the ledger's
    /// attributes so both paths honor the same filters.
    fn merge(
        &self,
        plan: &QueryPlan,
        request: &RetrievalRequest,
        filters: &SearchFilters,
        vector_hits: Vec<AnnHit>,
        text_hits: Vec<TextHit>,
    ) -> Vec<RawCandidate> {
        let class = plan.class;
        let mut merged: BTreeMap<String, (RawCandidate, Option<Arc<StructuredAttributes>>)> =
            BTreeMap::new();

        for hit in vector_hits {
            let attrs = self.reader.attributes_of(class, &hit.id);
            let matches = match attrs.as_deref() {
                Some(a) => filters.matches(a),
                None => filters.matches(&StructuredAttributes::default()),
            };
            if !matches {
                continue;
            }
            let mut candidate = RawCandidate::new(hit.id.clone());
            candidate.vector_distance = Some(hit.distance);
            merged.insert(hit.id, (candidate, attrs));
        }

        for hit in text_hits {
            let entry = merged.entry(hit.id.clone()).or_insert_with(|| {
                let attrs = self.reader.attributes_of(class, &hit.id);
                (RawCandidate::new(hit.id.clone()), attrs)
            });
            if plan.text_scored {
                entry.0.text_score = Some(hit.score);
            }
        }

        merged
            .into_values()
            .map(|(mut candidate, attrs)| {
                candidate.version = self.reader.version_of(class, &candidate.id).unwrap_or(0);
                if let Some(profile) = &request.profile {
                    let attrs = attrs.as_deref().cloned().unwrap_or_default();
                    candidate.structured_features = compute_features(profile, class, &attrs);
                }
                candidate
            })
            .collect()
    }
}

fn take_source<T>(
    name: &str,
    result: Option<Result<Vec<T>, String>>,
    consulted: &mut usize,
    failures: &mut Vec<String>,
) -> Vec<T> {
    match result {
        None => Vec::new(),
        Some(Ok(hits)) => {
            *consulted += 1;
            hits
        }
        Some(Err(err)) => {
            *consulted += 1;
            failures.push(format!("{name}: {err}"));
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadth_is_over_fetched_with_floor() {
        let config = PlannerConfig::default();
        assert_eq!(config.breadth(5), 50);
        assert_eq!(config.breadth(20), 80);
        let config = PlannerConfig {
            over_fetch_factor: 0,
            min_candidates: 0,
            ..PlannerConfig::default()
        };
        assert_eq!(config.breadth(7), 7);
    }

    #[test]
    fn blank_query_text_is_no_signal() {
        let request = RetrievalRequest::new(EntityClass::Posting, 5).with_text("   ");
        assert_eq!(request.text(), None);
        let request = RetrievalRequest::new(EntityClass::Posting, 5).with_text(" rust ");
        assert_eq!(request.text(), Some("rust"));
    }

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert_eq!(token.check(), Ok(()));
        clone.cancel();
        assert_eq!(token.check(), Err(QueryError::Cancelled));
    }

    #[test]
    fn request_accepts_source_class_alias() {
        let request: RetrievalRequest = serde_json::from_str(
            r#"{"source_class": "candidate", "top_k": 3, "query_text": "rust"}"#,
        )
        .unwrap();
        assert_eq!(request.class, EntityClass::Candidate);
        assert!(request.filters.is_empty());
    }
}
