//! Search layer facade.
//!
//! - **[`ann_index`]**: IVF-Flat approximate nearest neighbor index with snapshots.
//! - **[`vector_index`]**: `VectorIndexStore` trait and the ANN-backed store.
//! - **[`text_index`]**: `TextIndexStore` trait, structured filters and text hits.
//! - **[`sqlite_text`]**: SQLite FTS5 adapter for the text store.
//! - **[`features`]**: Skill, seniority and geo match features.
//! - **[`fusion`]**: Weighted score fusion and deterministic ranking.
//! - **[`planner`]**: Query planning, fan-out and result merging.

pub mod ann_index;
pub mod features;
pub mod fusion;
pub mod planner;
pub mod sqlite_text;
pub mod text_index;
pub mod vector_index;
