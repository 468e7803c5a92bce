//! Shared fixtures for the merge integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use seamer::catalogue::InMemoryCatalogue;
use seamer::config::MergeConfig;
use seamer::format::{SegmentReader, SegmentWriter};
use seamer::resource::MergeResource;
use seamer::scheduler::MergeScheduler;
use seamer::segment::{Segment, INPLACE_MERGE_SUFFIX, SQUEEZE_MERGE_SUFFIX};
use seamer::task::{MergeEnv, MergeReport, MergeTask};
use seamer::telemetry::noop_event_listener;
use seamer::types::{DataType, FieldValue, SeriesPath, TimeValuePair};

pub fn f64_points(range: std::ops::RangeInclusive<i64>, offset: f64) -> Vec<TimeValuePair> {
    range
        .map(|t| TimeValuePair::new(t, FieldValue::Float64(t as f64 + offset)))
        .collect()
}

/// Writes a sealed segment file without opening a handle on it (usable for
/// temp-suffixed paths that do not parse as segment names).
pub fn write_segment_file(path: &Path, version: i64, chunks: &[(&SeriesPath, &[TimeValuePair])]) {
    let mut writer = SegmentWriter::create(path).unwrap();
    for (series, points) in chunks {
        writer
            .append_points(series, DataType::Float64, version, points)
            .unwrap();
    }
    writer.seal().unwrap();
}

/// Writes a sealed segment containing one chunk per (series, points) entry.
pub fn write_segment(
    path: &Path,
    version: i64,
    chunks: &[(&SeriesPath, &[TimeValuePair])],
) -> Arc<Segment> {
    write_segment_file(path, version, chunks);
    Arc::new(Segment::open(path).unwrap())
}

/// All live points of one series in one sealed file, in index order.
pub fn read_series(path: &Path, series: &SeriesPath) -> Vec<(i64, f64)> {
    let reader = SegmentReader::open(path).unwrap();
    let mut out = Vec::new();
    for meta in reader.chunk_metadata(series) {
        let chunk = reader.read_chunk(&meta).unwrap();
        for p in chunk.decode().unwrap() {
            match p.value {
                FieldValue::Float64(v) => out.push((p.timestamp, v)),
                other => panic!("unexpected value {:?}", other),
            }
        }
    }
    out
}

pub fn catalogue_f64(series: &[&SeriesPath]) -> Arc<InMemoryCatalogue> {
    let mut cat = InMemoryCatalogue::new();
    for s in series {
        cat.register((*s).clone(), DataType::Float64).unwrap();
    }
    Arc::new(cat)
}

pub struct TestMergeSetup {
    pub env: Arc<MergeEnv>,
    pub scheduler: MergeScheduler,
}

pub fn merge_setup(sys_dir: &Path, config: MergeConfig, catalogue: Arc<InMemoryCatalogue>) -> TestMergeSetup {
    let config = config.sanitized();
    let scheduler =
        MergeScheduler::new(config.merge_thread_num, config.merge_chunk_sub_thread_num).unwrap();
    let env = Arc::new(MergeEnv {
        config,
        catalogue,
        sys_dir: sys_dir.to_path_buf(),
    });
    TestMergeSetup { env, scheduler }
}

/// Runs one merge task over an explicit working set and waits for its report.
#[allow(clippy::too_many_arguments)]
pub fn run_merge(
    setup: &TestMergeSetup,
    seq: Vec<Arc<Segment>>,
    unseq: Vec<Arc<Segment>>,
    series: Vec<SeriesPath>,
    squeeze: bool,
    full_merge: bool,
    output_dir: &Path,
) -> MergeReport {
    for segment in seq.iter().chain(unseq.iter()) {
        assert!(segment.try_reserve(), "fixture segment already reserved");
    }
    let suffix = if squeeze { SQUEEZE_MERGE_SUFFIX } else { INPLACE_MERGE_SUFFIX };
    let resource = MergeResource::new(
        seq,
        unseq,
        setup.env.catalogue.clone(),
        noop_event_listener(),
        suffix,
        setup.env.config.time_lower_bound,
        setup.env.config.reader_cache_cap,
    );
    let task = MergeTask {
        env: setup.env.clone(),
        resource,
        task_name: "test-merge".to_string(),
        full_merge,
        squeeze,
        concurrent_merge_series_num: setup.env.config.concurrent_merge_series_num,
        output_dir: output_dir.to_path_buf(),
        output_name: None,
        series,
        cancel: Arc::new(AtomicBool::new(false)),
    };
    setup.scheduler.submit_and_wait(task).unwrap()
}
