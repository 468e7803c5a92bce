//! Property-based invariants of the merge kernel: coverage, no duplication,
//! later-version-wins, tombstone elision.

mod common;

use std::collections::BTreeMap;

use common::*;
use proptest::prelude::*;
use seamer::config::MergeConfig;
use seamer::segment::Tombstone;
use seamer::types::SeriesPath;
use tempfile::tempdir;

#[derive(Debug, Clone)]
struct UnseqSpec {
    start: i64,
    len: i64,
    offset: f64,
    version: i64,
}

fn unseq_spec() -> impl Strategy<Value = UnseqSpec> {
    (0i64..180, 1i64..60, 1u32..1000, 2i64..50).prop_map(|(start, len, off, version)| UnseqSpec {
        start,
        len,
        offset: off as f64,
        version,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_squeeze_coverage_and_no_duplicates(
        specs in proptest::collection::vec(unseq_spec(), 0..4),
        tombstone_end in proptest::option::of(0i64..200),
    ) {
        let dir = tempdir().unwrap();
        let data = dir.path().join("0");
        std::fs::create_dir_all(&data).unwrap();
        let s0 = SeriesPath::new("root.sg.d1", "s0");

        // Two disjoint sequence files over [0, 200), version 1.
        let seq_a = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(0..=99, 0.0))]);
        let seq_b = write_segment(&data.join("2-2-0.seg"), 1, &[(&s0, &f64_points(100..=199, 0.0))]);

        let mut unseq = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            let end = spec.start + spec.len - 1;
            unseq.push(write_segment(
                &data.join(format!("{}-{}-0.seg", i + 3, i + 3)),
                spec.version,
                &[(&s0, &f64_points(spec.start..=end, spec.offset))],
            ));
        }
        if let Some(end) = tombstone_end {
            // Applies to the first sequence file only; version beats all chunks.
            seq_a.append_tombstone(&Tombstone::new(s0.clone(), end, 1_000)).unwrap();
        }

        // Expected: sequence base, overridden where a tombstone or unsequence
        // write applies. Among unsequence writes the higher (version,
        // insertion order) wins; any unsequence write beats the sequence one.
        let mut expected: BTreeMap<i64, f64> = (0..=199).map(|t| (t, t as f64)).collect();
        if let Some(end) = tombstone_end {
            for t in 0..=end.min(99) {
                expected.remove(&t);
            }
        }
        let mut unseq_best: BTreeMap<i64, (i64, usize, f64)> = BTreeMap::new();
        for (i, spec) in specs.iter().enumerate() {
            for t in spec.start..spec.start + spec.len {
                let candidate = (spec.version, i, t as f64 + spec.offset);
                let slot = unseq_best.entry(t).or_insert(candidate);
                if (candidate.0, candidate.1) >= (slot.0, slot.1) {
                    *slot = candidate;
                }
            }
        }
        for (t, (_, _, v)) in unseq_best {
            expected.insert(t, v);
        }

        let config = MergeConfig { chunk_merge_point_threshold: -1, ..MergeConfig::default() };
        let setup = merge_setup(dir.path(), config, catalogue_f64(&[&s0]));
        let report = run_merge(
            &setup,
            vec![seq_a, seq_b],
            unseq,
            vec![s0.clone()],
            true,
            true,
            &data,
        );
        prop_assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

        let got = read_series(&report.new_segments[0].path(), &s0);
        // No duplication: strictly increasing timestamps.
        prop_assert!(got.windows(2).all(|w| w[1].0 > w[0].0));
        // Coverage: exactly the expected timestamp->value mapping.
        let got_map: BTreeMap<i64, f64> = got.into_iter().collect();
        prop_assert_eq!(got_map, expected);
    }

    #[test]
    fn prop_inplace_matches_squeeze(
        specs in proptest::collection::vec(unseq_spec(), 1..3),
    ) {
        let s0 = SeriesPath::new("root.sg.d1", "s0");

        let run = |squeeze: bool| -> BTreeMap<i64, f64> {
            let dir = tempdir().unwrap();
            let data = dir.path().join("0");
            std::fs::create_dir_all(&data).unwrap();

            let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(0..=199, 0.0))]);
            let mut unseq = Vec::new();
            for (i, spec) in specs.iter().enumerate() {
                let end = spec.start + spec.len - 1;
                unseq.push(write_segment(
                    &data.join(format!("{}-{}-0.seg", i + 2, i + 2)),
                    spec.version,
                    &[(&s0, &f64_points(spec.start..=end, spec.offset))],
                ));
            }

            let config = MergeConfig { chunk_merge_point_threshold: -1, ..MergeConfig::default() };
            let setup = merge_setup(dir.path(), config, catalogue_f64(&[&s0]));
            let report = run_merge(&setup, vec![seq.clone()], unseq, vec![s0.clone()], squeeze, squeeze, &data);
            assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

            let path = if squeeze { report.new_segments[0].path() } else { seq.path() };
            read_series(&path, &s0).into_iter().collect()
        };

        // Both commit strategies express the same merge semantics.
        prop_assert_eq!(run(false), run(true));
    }
}
