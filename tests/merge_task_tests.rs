//! End-to-end merge scenarios over real segment files.

mod common;

use common::*;
use seamer::config::MergeConfig;
use seamer::segment::Tombstone;
use seamer::types::SeriesPath;
use tempfile::tempdir;

fn small_chunk_config() -> MergeConfig {
    MergeConfig {
        // fixture chunks are tiny; disable the "big enough" check
        chunk_merge_point_threshold: -1,
        ..MergeConfig::default()
    }
}

#[test]
fn test_simple_overlay_inplace() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");
    let s1 = SeriesPath::new("root.sg.d1", "s1");

    // s0 is overlapped by unsequence data, s1 is untouched.
    let seq = write_segment(
        &data.join("1-1-0.seg"),
        1,
        &[(&s0, &f64_points(1..=10, 0.0)), (&s1, &f64_points(1..=10, 0.0))],
    );
    let unseq = write_segment(&data.join("2-2-0.seg"), 2, &[(&s0, &f64_points(5..=15, 100.0))]);
    let unseq_path = unseq.path();

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0, &s1]));
    let report = run_merge(
        &setup,
        vec![seq.clone()],
        vec![unseq],
        vec![s0.clone(), s1.clone()],
        false,
        false,
        &data,
    );
    assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

    // The sequence file took the next merge generation; the unseq input is gone.
    assert_eq!(seq.name().merge_count, 1);
    assert!(seq.path().ends_with("1-1-1.seg"));
    assert!(!unseq_path.exists());

    let got = read_series(&seq.path(), &s0);
    let mut expected: Vec<(i64, f64)> = (1..=4).map(|t| (t, t as f64)).collect();
    expected.extend((5..=15).map(|t| (t, t as f64 + 100.0)));
    assert_eq!(got, expected);

    // The untouched series survives verbatim.
    let got_s1 = read_series(&seq.path(), &s1);
    assert_eq!(got_s1, (1..=10).map(|t| (t, t as f64)).collect::<Vec<_>>());

    // Journal is gone after a committed merge.
    assert!(!dir.path().join("merge.log").exists());
}

#[test]
fn test_deletion_during_merge() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(1..=100, 0.0))]);
    seq.append_tombstone(&Tombstone::new(s0.clone(), 49, 10_000)).unwrap();

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0]));
    let report = run_merge(&setup, vec![seq.clone()], vec![], vec![s0.clone()], false, false, &data);
    assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

    let got = read_series(&seq.path(), &s0);
    assert_eq!(got.len(), 51);
    assert_eq!(got.first().unwrap().0, 50);
    assert_eq!(got.last().unwrap().0, 100);
    // Tombstones were applied, so the mods sidecar does not survive the commit.
    assert!(!seq.mods_path().exists());
}

#[test]
fn test_multiple_overlapping_unseq() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(1..=10, 0.0))]);
    let unseq_a = write_segment(&data.join("2-2-0.seg"), 2, &[(&s0, &f64_points(1..=10, 10_000.0))]);
    let unseq_b = write_segment(&data.join("3-3-0.seg"), 3, &[(&s0, &f64_points(15..=15, 135.0))]);

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0]));
    let report = run_merge(
        &setup,
        vec![seq.clone()],
        vec![unseq_a, unseq_b],
        vec![s0.clone()],
        false,
        false,
        &data,
    );
    assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

    let got = read_series(&seq.path(), &s0);
    let mut expected: Vec<(i64, f64)> = (1..=10).map(|t| (t, t as f64 + 10_000.0)).collect();
    expected.push((15, 150.0));
    assert_eq!(got, expected);
}

#[test]
fn test_squeeze_preserves_value_offset() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    // Five sequence files of 100 points each.
    let mut seq = Vec::new();
    for i in 0..5i64 {
        seq.push(write_segment(
            &data.join(format!("{}-{}-0.seg", i + 1, i + 1)),
            1,
            &[(&s0, &f64_points(i * 100..=(i * 100 + 99), 0.0))],
        ));
    }
    // One overlay over the first half, one (newer) over everything.
    let unseq_half =
        write_segment(&data.join("6-6-0.seg"), 10, &[(&s0, &f64_points(0..=249, 10_000.0))]);
    let unseq_all =
        write_segment(&data.join("7-7-0.seg"), 20, &[(&s0, &f64_points(0..=499, 20_000.0))]);

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0]));
    let report = run_merge(
        &setup,
        seq.clone(),
        vec![unseq_half, unseq_all],
        vec![s0.clone()],
        true,
        true,
        &data,
    );
    assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

    // Inputs retired, exactly one new output.
    assert_eq!(report.new_segments.len(), 1);
    for input in &seq {
        assert!(!input.path().exists());
    }
    let output = &report.new_segments[0];
    assert_eq!(output.name().version, 1);
    assert_eq!(output.name().merge_count, 1);

    let got = read_series(&output.path(), &s0);
    assert_eq!(got.len(), 500);
    for (t, v) in got {
        assert!((v - (t as f64 + 20_000.0)).abs() < 0.001, "t={} v={}", t, v);
    }

    // The output's ancestor set absorbed every input generation.
    let ancestors = output.descriptor().ancestors;
    for gen in 1..=7i64 {
        assert!(ancestors.contains(&gen), "missing ancestor {}", gen);
    }
    assert!(!dir.path().join("merge.squeeze.log").exists());
}

#[test]
fn test_unseq_only_series_lands_in_last_file() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");
    let s1 = SeriesPath::new("root.sg.d1", "s1");

    // s1 exists only in the unsequence population.
    let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(1..=10, 0.0))]);
    let unseq = write_segment(&data.join("2-2-0.seg"), 2, &[(&s1, &f64_points(3..=7, 500.0))]);

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0, &s1]));
    let report = run_merge(
        &setup,
        vec![seq.clone()],
        vec![unseq],
        vec![s0.clone(), s1.clone()],
        false,
        false,
        &data,
    );
    assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);

    let got = read_series(&seq.path(), &s1);
    assert_eq!(got, (3..=7).map(|t| (t, t as f64 + 500.0)).collect::<Vec<_>>());
}

#[test]
fn test_tie_timestamp_unseq_wins() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(1..=5, 0.0))]);
    // Exactly one overlapping timestamp.
    let unseq = write_segment(&data.join("2-2-0.seg"), 2, &[(&s0, &f64_points(3..=3, 900.0))]);

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0]));
    let report = run_merge(&setup, vec![seq.clone()], vec![unseq], vec![s0.clone()], false, false, &data);
    assert!(report.outcome.is_success());

    let got = read_series(&seq.path(), &s0);
    assert_eq!(
        got,
        vec![(1, 1.0), (2, 2.0), (3, 903.0), (4, 4.0), (5, 5.0)]
    );
    // No duplicated timestamps, strictly increasing.
    assert!(got.windows(2).all(|w| w[1].0 > w[0].0));
}

#[test]
fn test_skip_keeps_untouched_file_unrenamed() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    // No unsequence data, no tombstones, big-enough chunk: everything skips
    // and the file is left completely untouched.
    let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(1..=10, 0.0))]);
    let original_path = seq.path();

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0]));
    let report = run_merge(&setup, vec![seq.clone()], vec![], vec![s0.clone()], false, false, &data);
    assert!(report.outcome.is_success());

    // unmerged > merged, zero merged chunks: no rewrite, no rename.
    assert_eq!(seq.name().merge_count, 0);
    assert!(original_path.exists());
    assert_eq!(read_series(&original_path, &s0).len(), 10);
}

#[test]
fn test_force_full_merge_rewrites_everything() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("0");
    std::fs::create_dir_all(&data).unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    let seq = write_segment(&data.join("1-1-0.seg"), 1, &[(&s0, &f64_points(1..=10, 0.0))]);

    let setup = merge_setup(dir.path(), small_chunk_config(), catalogue_f64(&[&s0]));
    let report = run_merge(&setup, vec![seq.clone()], vec![], vec![s0.clone()], false, true, &data);
    assert!(report.outcome.is_success());

    // full merge disables the skip case: the chunk was copied and the file
    // was swapped to the next merge generation.
    assert_eq!(seq.name().merge_count, 1);
    assert_eq!(read_series(&seq.path(), &s0).len(), 10);
}
