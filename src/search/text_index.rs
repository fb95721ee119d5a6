//! Text index contract: structured filters plus scored full-text match.
//!
//! The engine only depends on [`TextIndexStore`]. The SQLite FTS5 adapter lives in
//! [`crate::search::sqlite_text`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::types::{Seniority, StructuredAttributes, TextDocument, normalize_skill};

#[derive(Debug, Error)]
pub enum TextStoreError {
    #[error("text store unavailable: {0}")]
    Unavailable(String),
    #[error("text store backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("text store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TextStoreError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TextStoreError::Unavailable(_) => true,
            TextStoreError::Backend(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type TextStoreResult<T> = Result<T, TextStoreError>;

/// Structured filters shared by the text store and the planner's vector-path filtering.
///
/// Every set field must hold for an entity to match; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Skills the entity must all have.
    pub skills: BTreeSet<String>,
    /// Case-insensitive substring of the entity location.
    pub location: Option<String>,
    /// Exact (declared or estimated) seniority.
    pub seniority: Option<Seniority>,
    pub min_years: Option<f32>,
    pub remote: Option<bool>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
            && self.location.is_none()
            && self.seniority.is_none()
            && self.min_years.is_none()
            && self.remote.is_none()
    }

    pub fn normalized(mut self) -> Self {
        self.skills = self
            .skills
            .iter()
            .map(|s| normalize_skill(s))
            .filter(|s| !s.is_empty())
            .collect();
        self.location = self
            .location
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty());
        self
    }

    /// Evaluate against normalized attributes.
    pub fn matches(&self, attrs: &StructuredAttributes) -> bool {
        if !self
            .skills
            .iter()
            .all(|skill| attrs.skills.contains(&normalize_skill(skill)))
        {
            return false;
        }
        if let Some(wanted) = &self.location {
            let wanted = wanted.trim().to_lowercase();
            match &attrs.location {
                Some(loc) if loc.to_lowercase().contains(&wanted) => {}
                _ => return false,
            }
        }
        if let Some(level) = self.seniority
            && attrs.effective_seniority() != Some(level)
        {
            return false;
        }
        if let Some(min) = self.min_years
            && attrs.years_experience.is_none_or(|years| years < min)
        {
            return false;
        }
        if let Some(remote) = self.remote
            && attrs.remote != remote
        {
            return false;
        }
        true
    }
}

/// One text search hit. Higher scores are better.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextHit {
    pub id: String,
    pub score: f32,
}

/// Structured/full-text store for one entity class.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the planner searches from several threads
/// while the coordinator writes.
pub trait TextIndexStore: Send + Sync {
    /// Up to `top_k` filter-matching documents ordered by descending score (ties by id).
    ///
    /// With no query text every filter-matching document scores the same.
    fn search(
        &self,
        filters: &SearchFilters,
        query_text: Option<&str>,
        top_k: usize,
    ) -> TextStoreResult<Vec<TextHit>>;

    /// Insert or replace the document for `id`.
    fn upsert(
        &self,
        id: &str,
        version: u64,
        document: &TextDocument,
        attributes: &StructuredAttributes,
    ) -> TextStoreResult<()>;

    /// Remove `id`. Absent ids are a no-op.
    fn delete(&self, id: &str) -> TextStoreResult<()>;

    fn len(&self) -> TextStoreResult<usize>;

    /// Short name used in logs and stats.
    fn name(&self) -> &str;
}
