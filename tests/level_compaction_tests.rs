//! Background leveled compaction over a real data directory.

mod common;

use std::time::Duration;

use common::*;
use seamer::config::MergeConfig;
use seamer::levels::LeveledCompactor;
use seamer::segment::SegmentName;
use seamer::types::SeriesPath;
use tempfile::tempdir;

fn compactor_config() -> MergeConfig {
    MergeConfig {
        chunk_merge_point_threshold: -1,
        seq_level_num: 2,
        seq_file_num_in_each_level: 4,
        unseq_level_num: 1,
        enable_unseq_compaction: true,
        // the tests drive passes explicitly
        merge_interval: Duration::from_secs(3600),
        ..MergeConfig::default()
    }
}

#[test]
fn test_level_promotion_from_ten_level0_files() {
    let dir = tempdir().unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");
    let catalogue = catalogue_f64(&[&s0]);

    let compactor =
        LeveledCompactor::open(dir.path(), catalogue, compactor_config()).unwrap();
    let seq_dir = compactor.sequence_dir(0);
    std::fs::create_dir_all(&seq_dir).unwrap();

    // Ten sealed level-0 files with disjoint, ordered ranges.
    for i in 0..10i64 {
        let seg = write_segment(
            &seq_dir.join(format!("{}-{}-0.seg", i + 1, i + 1)),
            1,
            &[(&s0, &f64_points(i * 100..=(i * 100 + 99), 0.0))],
        );
        compactor.install(seg, true).unwrap();
    }

    // Drain the backlog: each pass promotes at most one batch per level.
    while compactor.compact_blocking().unwrap() {}

    // Cap 4: two promotions consumed 8 files, two stragglers stay at level 0.
    assert!(compactor.level_file_count(0, 0, true) <= 3);
    assert_eq!(compactor.level_file_count(0, 1, true), 2);

    // Level-1 outputs carry mergeN == 1 in their names.
    let segments = compactor.segments(true);
    let promoted: Vec<SegmentName> = segments
        .iter()
        .map(|s| s.name())
        .filter(|n| n.merge_count == 1)
        .collect();
    assert_eq!(promoted.len(), 2);

    // Coverage: every input timestamp survives exactly once with its value.
    let mut all: Vec<(i64, f64)> = Vec::new();
    for seg in &segments {
        all.extend(read_series(&seg.path(), &s0));
    }
    all.sort_by_key(|(t, _)| *t);
    assert_eq!(all.len(), 1000);
    for (i, (t, v)) in all.iter().enumerate() {
        assert_eq!(*t, i as i64);
        assert_eq!(*v, i as f64);
    }
}

#[test]
fn test_unseq_collapse_into_sequence() {
    let dir = tempdir().unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");
    let catalogue = catalogue_f64(&[&s0]);

    let compactor =
        LeveledCompactor::open(dir.path(), catalogue, compactor_config()).unwrap();
    let seq_dir = compactor.sequence_dir(0);
    let unseq_dir = compactor.unsequence_dir(0);
    std::fs::create_dir_all(&seq_dir).unwrap();
    std::fs::create_dir_all(&unseq_dir).unwrap();

    let seq = write_segment(&seq_dir.join("1-1-0.seg"), 1, &[(&s0, &f64_points(0..=99, 0.0))]);
    let unseq =
        write_segment(&unseq_dir.join("2-2-0.seg"), 5, &[(&s0, &f64_points(40..=59, 1000.0))]);
    let unseq_path = unseq.path();
    compactor.install(seq, true).unwrap();
    compactor.install(unseq, false).unwrap();

    assert!(compactor.compact_blocking().unwrap());

    // The unsequence population is drained into the sequence files.
    assert!(compactor.segments(false).is_empty());
    assert!(!unseq_path.exists());

    let seq_segments = compactor.segments(true);
    assert_eq!(seq_segments.len(), 1);
    let got = read_series(&seq_segments[0].path(), &s0);
    assert_eq!(got.len(), 100);
    for (t, v) in got {
        let expected = if (40..=59).contains(&t) { t as f64 + 1000.0 } else { t as f64 };
        assert_eq!(v, expected, "t={}", t);
    }
}

#[test]
fn test_unseq_levels_promote_independently() {
    let dir = tempdir().unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    // Two unsequence levels: level 0 promotes within the population instead
    // of collapsing into sequence.
    let config = MergeConfig {
        unseq_level_num: 2,
        unseq_file_num_in_each_level: 2,
        enable_unseq_compaction: false,
        ..compactor_config()
    };
    let compactor = LeveledCompactor::open(dir.path(), catalogue_f64(&[&s0]), config).unwrap();
    let unseq_dir = compactor.unsequence_dir(0);
    std::fs::create_dir_all(&unseq_dir).unwrap();

    // Overlapping unsequence files; the later one carries the higher version.
    let a = write_segment(&unseq_dir.join("1-1-0.seg"), 1, &[(&s0, &f64_points(0..=49, 0.0))]);
    let b = write_segment(&unseq_dir.join("2-2-0.seg"), 9, &[(&s0, &f64_points(25..=74, 500.0))]);
    compactor.install(a, false).unwrap();
    compactor.install(b, false).unwrap();

    while compactor.compact_blocking().unwrap() {}

    assert_eq!(compactor.level_file_count(0, 0, false), 0);
    assert_eq!(compactor.level_file_count(0, 1, false), 1);

    let promoted = compactor.segments(false);
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].name().merge_count, 1);

    // Later-version-wins applied during the promotion.
    let got = read_series(&promoted[0].path(), &s0);
    assert_eq!(got.len(), 75);
    for (t, v) in got {
        let expected = if (25..=74).contains(&t) { t as f64 + 500.0 } else { t as f64 };
        assert_eq!(v, expected, "t={}", t);
    }
}

#[test]
fn test_compactor_restart_rebuilds_index_from_filenames() {
    let dir = tempdir().unwrap();
    let s0 = SeriesPath::new("root.sg.d1", "s0");

    {
        let compactor = LeveledCompactor::open(
            dir.path(),
            catalogue_f64(&[&s0]),
            compactor_config(),
        )
        .unwrap();
        let seq_dir = compactor.sequence_dir(0);
        std::fs::create_dir_all(&seq_dir).unwrap();
        for i in 0..3i64 {
            let seg = write_segment(
                &seq_dir.join(format!("{}-{}-0.seg", i + 1, i + 1)),
                1,
                &[(&s0, &f64_points(i * 10..=(i * 10 + 9), 0.0))],
            );
            compactor.install(seg, true).unwrap();
        }
    }

    // Reopen: the scan classifies files by their embedded merge generation.
    let compactor = LeveledCompactor::open(
        dir.path(),
        catalogue_f64(&[&s0]),
        compactor_config(),
    )
    .unwrap();
    assert_eq!(compactor.level_file_count(0, 0, true), 3);
    assert_eq!(compactor.level_file_count(0, 1, true), 0);
    assert_eq!(compactor.failed_merge_count(), 0);
}
