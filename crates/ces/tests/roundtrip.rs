use proptest::prelude::*;
use weft_ces::{CesError, Pipeline, PipelineConfig};

fn pipeline() -> Pipeline {
    Pipeline::with_key([0x11; 32], PipelineConfig::default()).unwrap()
}

#[test]
fn four_kib_pattern_survives_three_dropped_shards() {
    let data: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let p = pipeline();

    let shards = p.process(&data).unwrap();
    assert_eq!(shards.len(), 12);

    let mut present = vec![true; 12];
    for dropped in [3usize, 7, 11] {
        present[dropped] = false;
    }
    assert_eq!(p.reconstruct(&shards, &present).unwrap(), data);
}

#[test]
fn below_k_fails_with_insufficient_shards() {
    let p = pipeline();
    let shards = p.process(b"needs eight of twelve").unwrap();

    let mut present = vec![false; 12];
    for slot in present.iter_mut().take(7) {
        *slot = true;
    }
    assert_eq!(
        p.reconstruct(&shards, &present),
        Err(CesError::InsufficientShards { present: 7, needed: 8 })
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn round_trip_all_present(data in proptest::collection::vec(any::<u8>(), 1..16_384)) {
        let p = pipeline();
        let shards = p.process(&data).unwrap();
        let present = vec![true; shards.len()];
        prop_assert_eq!(p.reconstruct(&shards, &present).unwrap(), data);
    }

    #[test]
    fn round_trip_any_k_subset(
        data in proptest::collection::vec(any::<u8>(), 1..8_192),
        seed in any::<u64>(),
    ) {
        let p = pipeline();
        let shards = p.process(&data).unwrap();

        // Drop exactly m = 4 pseudo-randomly chosen shards.
        let mut present = vec![true; 12];
        let mut state = seed | 1;
        let mut dropped = 0;
        while dropped < 4 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let idx = (state >> 33) as usize % 12;
            if present[idx] {
                present[idx] = false;
                dropped += 1;
            }
        }
        prop_assert_eq!(p.reconstruct(&shards, &present).unwrap(), data);
    }
}
