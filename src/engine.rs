//! Wires stores, coordinator and planner together from an [`EngineConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::EngineConfig;
use crate::indexer::coordinator::{
    ApplyOutcome, CheckpointSummary, CoordinatorError, CoordinatorStats, IndexCoordinator,
    vector_snapshot_path,
};
use crate::indexer::worker::{PropagationHandle, PropagationReport, PropagationWorker};
use crate::model::types::{ClassMap, EntityClass, IndexWriteRecord};
use crate::search::ann_index::IvfStats;
use crate::search::planner::{QueryError, QueryPlanner, QueryResponse, RetrievalRequest};
use crate::search::sqlite_text::{SqliteTextIndex, TEXT_DB_FILE};
use crate::search::text_index::TextIndexStore;
use crate::search::vector_index::{AnnVectorStore, VectorIndexStore};

/// Default data directory (`~/.local/share/talent-match` on Linux).
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "talent-match", "talent-match")
        .map_or_else(|| PathBuf::from("talent-match-data"), |dirs| dirs.data_dir().to_path_buf())
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub coordinator: CoordinatorStats,
    pub vectors: ClassMap<IvfStats>,
    pub text_documents: ClassMap<usize>,
}

pub struct Engine {
    coordinator: Arc<IndexCoordinator>,
    planner: QueryPlanner,
    data_dir: Option<PathBuf>,
}

impl Engine {
    /// Build an engine over caller-supplied stores.
    pub fn with_stores(
        config: &EngineConfig,
        vectors: ClassMap<Arc<dyn VectorIndexStore>>,
        texts: ClassMap<Arc<dyn TextIndexStore>>,
    ) -> Self {
        let coordinator = Arc::new(IndexCoordinator::new(
            vectors,
            texts,
            config.coordinator.clone(),
        ));
        let planner = QueryPlanner::new(
            coordinator.reader(),
            config.fusion.clone(),
            config.planner.clone(),
        );
        Self {
            coordinator,
            planner,
            data_dir: None,
        }
    }

    /// Fresh in-memory engine; nothing is persisted.
    pub fn in_memory(config: &EngineConfig) -> Result<Self> {
        let vectors = ClassMap::from_fn(|class| new_vector_store(config, class));
        let texts = text_stores(
            SqliteTextIndex::open_in_memory(EntityClass::Candidate)?,
            SqliteTextIndex::open_in_memory(EntityClass::Posting)?,
        );
        Ok(Self::with_stores(config, vectors, texts))
    }

    /// Open (or create) a persistent engine under `data_dir`, restoring the last
    /// checkpoint if there is one.
    pub fn open(data_dir: &Path, config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let vectors = ClassMap::from_fn(|class| -> Result<Arc<dyn VectorIndexStore>> {
            let path = vector_snapshot_path(data_dir, class);
            if !path.exists() {
                return Ok(new_vector_store(config, class));
            }
            let store: Arc<dyn VectorIndexStore> = Arc::new(
                AnnVectorStore::load(
                    &path,
                    *config.vector.dimensions.get(class),
                    config.vector.metric,
                )
                .with_context(|| format!("loading {class} vector snapshot"))?,
            );
            Ok(store)
        })
        .try_map(|_, store| store)?;

        let db_path = data_dir.join(TEXT_DB_FILE);
        let texts = text_stores(
            SqliteTextIndex::open(&db_path, EntityClass::Candidate)
                .with_context(|| format!("opening text index {}", db_path.display()))?,
            SqliteTextIndex::open(&db_path, EntityClass::Posting)
                .with_context(|| format!("opening text index {}", db_path.display()))?,
        );

        let mut engine = Self::with_stores(config, vectors, texts);
        let restored = engine.coordinator.restore_ledger(data_dir)?;
        engine.data_dir = Some(data_dir.to_path_buf());
        info!(
            data_dir = %data_dir.display(),
            ledger_entries = restored,
            candidates = engine.coordinator.vector_store(EntityClass::Candidate).len(),
            postings = engine.coordinator.vector_store(EntityClass::Posting).len(),
            "engine opened"
        );
        Ok(engine)
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn apply(&self, record: IndexWriteRecord) -> Result<ApplyOutcome, CoordinatorError> {
        self.coordinator.apply(record)
    }

    pub fn query(&self, request: &RetrievalRequest) -> Result<QueryResponse, QueryError> {
        self.planner.query(request)
    }

    /// Start a propagation worker feeding this engine's coordinator.
    pub fn spawn_propagation(&self) -> Result<(PropagationHandle, JoinHandle<PropagationReport>)> {
        PropagationWorker::spawn(Arc::clone(&self.coordinator))
            .context("spawning propagation worker")
    }

    /// Checkpoint into the engine's data directory.
    pub fn checkpoint(&self) -> Result<CheckpointSummary> {
        let dir = self
            .data_dir
            .as_deref()
            .context("in-memory engine has no data directory to checkpoint into")?;
        self.coordinator.checkpoint(dir)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let text_documents = ClassMap::from_fn(|class| self.coordinator.text_store(class).len())
            .try_map(|class, count| count.with_context(|| format!("counting {class} documents")))?;
        Ok(EngineStats {
            coordinator: self.coordinator.stats(),
            vectors: ClassMap::from_fn(|class| self.coordinator.vector_store(class).stats()),
            text_documents,
        })
    }
}

fn new_vector_store(config: &EngineConfig, class: EntityClass) -> Arc<dyn VectorIndexStore> {
    Arc::new(AnnVectorStore::new(
        *config.vector.dimensions.get(class),
        config.vector.metric,
        config.vector.ivf.clone(),
    ))
}

fn text_stores(
    candidate: SqliteTextIndex,
    posting: SqliteTextIndex,
) -> ClassMap<Arc<dyn TextIndexStore>> {
    ClassMap {
        candidate: Arc::new(candidate),
        posting: Arc::new(posting),
    }
}
