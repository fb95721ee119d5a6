use proptest::prelude::*;
use talent_match::model::types::StructuredFeatures;
use talent_match::search::ann_index::{DistanceMetric, IvfIndex, IvfParams};
use talent_match::search::fusion::{
    FusionConfig, FusionRanker, RawCandidate, TextNormalization, compare_fused,
};

const TOP_K: usize = 10;

type Signals = (Option<f32>, Option<f32>, Option<f32>, u64);

fn signals_strategy() -> impl Strategy<Value = Vec<Signals>> {
    prop::collection::vec(
        (
            prop::option::of(0.0f32..2.0),
            prop::option::of(0.0f32..40.0),
            prop::option::of(0.0f32..1.0),
            1u64..5,
        ),
        1..40,
    )
}

fn candidates(signals: &[Signals]) -> Vec<RawCandidate> {
    signals
        .iter()
        .enumerate()
        .map(|(i, (distance, text, skill, version))| {
            let mut candidate = RawCandidate::new(format!("id{i:03}"));
            candidate.vector_distance = *distance;
            candidate.text_score = *text;
            candidate.structured_features = StructuredFeatures {
                skill_overlap: *skill,
                ..StructuredFeatures::default()
            };
            candidate.version = *version;
            candidate
        })
        .collect()
}

fn ranker(normalization: TextNormalization) -> FusionRanker {
    FusionRanker::new(FusionConfig {
        text_normalization: normalization,
        ..FusionConfig::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ranking_is_a_deterministic_total_order(signals in signals_strategy()) {
        for normalization in [TextNormalization::MinMax, TextNormalization::ReciprocalRank] {
            let ranker = ranker(normalization);
            let forward = ranker.rank(candidates(&signals), TOP_K);
            let mut reversed_input = candidates(&signals);
            reversed_input.reverse();
            let reversed = ranker.rank(reversed_input, TOP_K);

            prop_assert_eq!(&forward, &reversed);
            prop_assert_eq!(forward.len(), signals.len().min(TOP_K));
            for (idx, hit) in forward.iter().enumerate() {
                prop_assert_eq!(hit.rank, idx + 1);
            }
            for pair in forward.windows(2) {
                prop_assert!(compare_fused(&pair[0], &pair[1]).is_lt());
            }
        }
    }

    #[test]
    fn fused_score_is_sum_of_bounded_signals(signals in signals_strategy()) {
        let config = FusionConfig::default();
        let weights = config.weights;
        let ranked = FusionRanker::new(config).rank(candidates(&signals), usize::MAX);
        for hit in &ranked {
            prop_assert!((hit.fused_score - hit.signals.total()).abs() < 1e-5);
            prop_assert!(hit.signals.vector >= 0.0 && hit.signals.vector <= weights.vector + 1e-6);
            prop_assert!(hit.signals.text >= 0.0 && hit.signals.text <= weights.text + 1e-6);
            prop_assert!(hit.signals.skill >= 0.0 && hit.signals.skill <= weights.skill + 1e-6);
            if hit.vector_distance.is_none() {
                prop_assert_eq!(hit.signals.vector, 0.0);
            }
        }
    }

    #[test]
    fn raising_a_weight_never_lowers_any_score(
        signals in signals_strategy(),
        which in 0usize..5,
        bump in 0.0f32..2.0,
    ) {
        let base = FusionConfig::default();
        let mut raised = base.clone();
        let weights = &mut raised.weights;
        let slot = match which {
            0 => &mut weights.vector,
            1 => &mut weights.text,
            2 => &mut weights.skill,
            3 => &mut weights.seniority,
            _ => &mut weights.geo,
        };
        *slot += bump;

        let before = FusionRanker::new(base).rank(candidates(&signals), usize::MAX);
        let after = FusionRanker::new(raised).rank(candidates(&signals), usize::MAX);
        for hit in &before {
            let raised_hit = after.iter().find(|h| h.id == hit.id).unwrap();
            prop_assert!(raised_hit.fused_score + 1e-6 >= hit.fused_score);
        }
    }

    #[test]
    fn closer_vector_never_lowers_score(signals in signals_strategy()) {
        let ranker = ranker(TextNormalization::MinMax);
        let before = ranker.rank(candidates(&signals), usize::MAX);

        let mut improved = candidates(&signals);
        improved[0].vector_distance = Some(improved[0].vector_distance.map_or(0.0, |d| d / 2.0));
        let after = ranker.rank(improved, usize::MAX);

        let score = |hits: &[talent_match::model::types::MatchCandidate]| {
            hits.iter().find(|h| h.id == "id000").map(|h| h.fused_score)
        };
        prop_assert!(score(&after).unwrap() >= score(&before).unwrap());
    }

    #[test]
    fn stored_vectors_are_recalled_exactly(
        vectors in prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 16), 40..120)
    ) {
        let params = IvfParams {
            n_lists: 8,
            n_probe: 1,
            train_threshold: 32,
            kmeans_iterations: 4,
        };
        let mut index = IvfIndex::new(16, DistanceMetric::Cosine, params);
        let items: Vec<(String, Vec<f32>)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("v{i}"), v.clone()))
            .collect();
        index.upsert(items).unwrap();
        prop_assert!(index.is_trained());

        for vector in &vectors {
            let hits = index.search(vector, 1).unwrap();
            prop_assert_eq!(hits.len(), 1);
            prop_assert!(hits[0].distance < 1e-4, "distance {}", hits[0].distance);
        }
    }
}
