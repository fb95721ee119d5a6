#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use talent_match::config::EngineConfig;
use talent_match::engine::Engine;
use talent_match::indexer::retry::RetryPolicy;
use talent_match::model::types::{
    ClassMap, EntityClass, IndexWriteRecord, Seniority, StructuredAttributes, TextDocument,
};
use talent_match::search::ann_index::{AnnHit, DistanceMetric, IvfParams, IvfStats};
use talent_match::search::sqlite_text::SqliteTextIndex;
use talent_match::search::text_index::{
    SearchFilters, TextHit, TextIndexStore, TextStoreError, TextStoreResult,
};
use talent_match::search::vector_index::{
    AnnVectorStore, VectorIndexStore, VectorStoreError, VectorStoreResult,
};

/// Captures tracing output for tests.
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Config with small dimensions and no retry sleeps.
pub fn test_config(dimension: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.vector.dimensions = ClassMap::from_fn(|_| dimension);
    config.coordinator.retry = RetryPolicy::immediate(2);
    config.planner.staleness_timeout_ms = 50;
    config
}

/// Unit vector along `axis`, optionally nudged along the next axis.
pub fn axis(dimension: usize, axis: usize, nudge: f32) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[axis % dimension] = 1.0;
    v[(axis + 1) % dimension] += nudge;
    v
}

pub fn attrs(skills: &[&str], seniority: Option<Seniority>, location: Option<&str>) -> StructuredAttributes {
    StructuredAttributes {
        skills: skills.iter().map(|s| s.to_string()).collect(),
        seniority,
        location: location.map(str::to_string),
        ..StructuredAttributes::default()
    }
}

/// Dense pseudo-random vector in `[-1, 1)^dimension`, deterministic per seed.
pub fn dense(dimension: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    (0..dimension)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

pub fn remote(mut attributes: StructuredAttributes) -> StructuredAttributes {
    attributes.remote = true;
    attributes
}

pub fn candidate(id: &str, version: u64, vector: Vec<f32>, headline: &str) -> IndexWriteRecord {
    IndexWriteRecord::upsert(
        EntityClass::Candidate,
        id,
        version,
        vector,
        TextDocument::new(headline, format!("{headline} with production experience")),
        StructuredAttributes::default(),
    )
}

pub fn posting(
    id: &str,
    version: u64,
    vector: Vec<f32>,
    headline: &str,
    attributes: StructuredAttributes,
) -> IndexWriteRecord {
    IndexWriteRecord::upsert(
        EntityClass::Posting,
        id,
        version,
        vector,
        TextDocument::new(headline, format!("We are hiring: {headline}")),
        attributes,
    )
}

/// Switchable failure injection shared between a test and a wrapped store.
#[derive(Clone, Default)]
pub struct FailSwitch {
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FailSwitch {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failing.load(Ordering::SeqCst)
    }
}

/// Text store that fails every call while its switch is on.
pub struct FlakyTextStore {
    inner: SqliteTextIndex,
    switch: FailSwitch,
}

impl FlakyTextStore {
    pub fn new(class: EntityClass, switch: FailSwitch) -> Self {
        Self {
            inner: SqliteTextIndex::open_in_memory(class).unwrap(),
            switch,
        }
    }

    fn check(&self) -> TextStoreResult<()> {
        if self.switch.trip() {
            return Err(TextStoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

impl TextIndexStore for FlakyTextStore {
    fn search(
        &self,
        filters: &SearchFilters,
        query_text: Option<&str>,
        top_k: usize,
    ) -> TextStoreResult<Vec<TextHit>> {
        self.check()?;
        self.inner.search(filters, query_text, top_k)
    }

    fn upsert(
        &self,
        id: &str,
        version: u64,
        document: &TextDocument,
        attributes: &StructuredAttributes,
    ) -> TextStoreResult<()> {
        self.check()?;
        self.inner.upsert(id, version, document, attributes)
    }

    fn delete(&self, id: &str) -> TextStoreResult<()> {
        self.check()?;
        self.inner.delete(id)
    }

    fn len(&self) -> TextStoreResult<usize> {
        self.inner.len()
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Vector store that fails every call while its switch is on.
pub struct FlakyVectorStore {
    inner: AnnVectorStore,
    switch: FailSwitch,
}

impl FlakyVectorStore {
    pub fn new(dimension: usize, switch: FailSwitch) -> Self {
        Self {
            inner: AnnVectorStore::new(dimension, DistanceMetric::Cosine, IvfParams::default()),
            switch,
        }
    }

    fn check(&self) -> VectorStoreResult<()> {
        if self.switch.trip() {
            return Err(VectorStoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

impl VectorIndexStore for FlakyVectorStore {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn metric(&self) -> DistanceMetric {
        self.inner.metric()
    }

    fn upsert(&self, items: Vec<(String, Vec<f32>)>) -> VectorStoreResult<usize> {
        self.check()?;
        self.inner.upsert(items)
    }

    fn delete(&self, ids: &[String]) -> VectorStoreResult<usize> {
        self.check()?;
        self.inner.delete(ids)
    }

    fn search(&self, query: &[f32], k: usize) -> VectorStoreResult<Vec<AnnHit>> {
        self.check()?;
        self.inner.search(query, k)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn stats(&self) -> IvfStats {
        self.inner.stats()
    }

    fn snapshot(&self, path: &Path) -> VectorStoreResult<()> {
        self.inner.snapshot(path)
    }
}

/// Engine whose stores fail on demand.
pub struct FlakyEngine {
    pub engine: Engine,
    pub vectors: FailSwitch,
    pub texts: FailSwitch,
}

pub fn flaky_engine(dimension: usize) -> FlakyEngine {
    let vectors = FailSwitch::default();
    let texts = FailSwitch::default();
    let vector_stores = ClassMap::from_fn(|_| {
        Arc::new(FlakyVectorStore::new(dimension, vectors.clone())) as Arc<dyn VectorIndexStore>
    });
    let text_stores = ClassMap::from_fn(|class| {
        Arc::new(FlakyTextStore::new(class, texts.clone())) as Arc<dyn TextIndexStore>
    });
    let engine = Engine::with_stores(&test_config(dimension), vector_stores, text_stores);
    FlakyEngine {
        engine,
        vectors,
        texts,
    }
}

/// Vector store whose upserts sleep for a configurable delay before landing.
pub struct SlowVectorStore {
    inner: AnnVectorStore,
    delay_ms: Arc<AtomicU64>,
}

impl VectorIndexStore for SlowVectorStore {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn metric(&self) -> DistanceMetric {
        self.inner.metric()
    }

    fn upsert(&self, items: Vec<(String, Vec<f32>)>) -> VectorStoreResult<usize> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.inner.upsert(items)
    }

    fn delete(&self, ids: &[String]) -> VectorStoreResult<usize> {
        self.inner.delete(ids)
    }

    fn search(&self, query: &[f32], k: usize) -> VectorStoreResult<Vec<AnnHit>> {
        self.inner.search(query, k)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn stats(&self) -> IvfStats {
        self.inner.stats()
    }

    fn snapshot(&self, path: &Path) -> VectorStoreResult<()> {
        self.inner.snapshot(path)
    }
}

/// Engine whose vector upserts can be slowed down on demand.
pub struct SlowEngine {
    pub engine: Engine,
    delay_ms: Arc<AtomicU64>,
}

impl SlowEngine {
    pub fn set_write_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

pub fn slow_engine(dimension: usize) -> SlowEngine {
    let delay_ms = Arc::new(AtomicU64::new(0));
    let vector_stores = ClassMap::from_fn(|_| {
        Arc::new(SlowVectorStore {
            inner: AnnVectorStore::new(dimension, DistanceMetric::Cosine, IvfParams::default()),
            delay_ms: Arc::clone(&delay_ms),
        }) as Arc<dyn VectorIndexStore>
    });
    let text_stores = ClassMap::from_fn(|class| {
        Arc::new(SqliteTextIndex::open_in_memory(class).unwrap()) as Arc<dyn TextIndexStore>
    });
    let engine = Engine::with_stores(&test_config(dimension), vector_stores, text_stores);
    SlowEngine { engine, delay_ms }
}
