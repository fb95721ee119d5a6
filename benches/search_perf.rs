use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use talent_match::config::EngineConfig;
use talent_match::engine::Engine;
use talent_match::model::types::{
    ClassMap, EntityClass, IndexWriteRecord, StructuredAttributes, TextDocument,
};
use talent_match::search::ann_index::{DistanceMetric, IvfIndex, IvfParams};
use talent_match::search::fusion::{FusionConfig, FusionRanker, RawCandidate};
use talent_match::search::planner::RetrievalRequest;

const DIM: usize = 64;
const SKILLS: &[&str] = &["rust", "go", "python", "kafka", "postgres", "react", "k8s"];

fn vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..DIM)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / u32::MAX as f32) - 0.25
        })
        .collect()
}

fn record(i: u64) -> IndexWriteRecord {
    let skill = SKILLS[i as usize % SKILLS.len()];
    let attributes = StructuredAttributes {
        skills: [skill.to_string()].into_iter().collect(),
        years_experience: Some((i % 12) as f32),
        ..StructuredAttributes::default()
    };
    IndexWriteRecord::upsert(
        EntityClass::Candidate,
        format!("c{i}"),
        1,
        vector(i),
        TextDocument::new(
            format!("{skill} engineer"),
            format!("candidate {i} builds {skill} services"),
        ),
        attributes,
    )
}

fn seeded_engine(count: u64) -> Engine {
    let mut config = EngineConfig::default();
    config.vector.dimensions = ClassMap::from_fn(|_| DIM);
    let engine = Engine::in_memory(&config).expect("engine");
    for i in 0..count {
        engine.apply(record(i)).expect("apply");
    }
    engine
}

fn bench_ivf_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("ivf_search");
    for size in [1_000u64, 5_000] {
        let mut index = IvfIndex::new(DIM, DistanceMetric::Cosine, IvfParams::default());
        index
            .upsert((0..size).map(|i| (format!("c{i}"), vector(i))).collect())
            .expect("upsert");
        let query = vector(size + 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(index.search(&query, 20).expect("search")));
        });
    }
    group.finish();
}

fn bench_fusion(c: &mut Criterion) {
    let ranker = FusionRanker::new(FusionConfig::default());
    c.bench_function("fusion_rank_200", |b| {
        b.iter_batched(
            || {
                (0..200u64)
                    .map(|i| {
                        let mut candidate = RawCandidate::new(format!("c{i}"));
                        candidate.vector_distance = (i % 3 != 0).then_some(i as f32 / 200.0);
                        candidate.text_score = (i % 2 == 0).then_some(1.0 + (i % 17) as f32);
                        candidate.version = 1;
                        candidate
                    })
                    .collect::<Vec<_>>()
            },
            |candidates| black_box(ranker.rank(candidates, 20)),
            BatchSize::SmallInput,
        );
    });
}

fn bench_hybrid_query(c: &mut Criterion) {
    let engine = seeded_engine(2_000);
    let request = RetrievalRequest::new(EntityClass::Candidate, 10)
        .with_vector(vector(42))
        .with_text("kafka engineer");
    c.bench_function("hybrid_query_2000", |b| {
        b.iter(|| black_box(engine.query(&request).expect("query")));
    });
}

fn bench_apply(c: &mut Criterion) {
    c.bench_function("apply_100_upserts", |b| {
        b.iter_batched(
            || seeded_engine(0),
            |engine| {
                for i in 0..100 {
                    engine.apply(record(i)).expect("apply");
                }
                engine
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    search_perf,
    bench_ivf_search,
    bench_fusion,
    bench_hybrid_query,
    bench_apply
);
criterion_main!(search_perf);
