//! Background leveled compaction.
//!
//! Per partition the compactor keeps an ordered list of sequence levels and an
//! insertion-ordered list of unsequence levels. Newly sealed files enter level
//! 0; when a level fills past its configured file count, the oldest files are
//! merged into one file at the next level. The filename-embedded merge
//! generation is the source of truth for tier placement. Unsequence data is
//! either leveled independently and joined at the top, or (with a single
//! unsequence level) collapsed straight into the sequence population.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::catalogue::Catalogue;
use crate::config::MergeConfig;
use crate::error::MergeError;
use crate::recover::recover_storage_group;
use crate::resource::MergeResource;
use crate::scheduler::MergeScheduler;
use crate::segment::{Segment, SegmentName, INPLACE_MERGE_SUFFIX, SQUEEZE_MERGE_SUFFIX};
use crate::selector::FileSelector;
use crate::task::{MergeEnv, MergeTask};
use crate::telemetry::MergeEvent;
use crate::types::SeriesPath;

const SEQUENCE_DIR: &str = "sequence";
const UNSEQUENCE_DIR: &str = "unsequence";

#[derive(Debug)]
enum CompactorCmd {
    Maybe,
    Force { ack: mpsc::Sender<Result<bool, MergeError>> },
    Shutdown,
}

#[derive(Debug, Default)]
struct PartitionLevels {
    // sorted by (partition, filename order) within each level
    seq: Vec<Vec<Arc<Segment>>>,
    // insertion-ordered within each level
    unseq: Vec<Vec<Arc<Segment>>>,
}

impl PartitionLevels {
    fn new(seq_levels: usize, unseq_levels: usize) -> Self {
        Self {
            seq: (0..seq_levels).map(|_| Vec::new()).collect(),
            unseq: (0..unseq_levels).map(|_| Vec::new()).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct CompactorStats {
    failed_merges: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// The background compactor and the level index it owns.
#[derive(Debug)]
pub struct LeveledCompactor {
    inner: Arc<CompactorInner>,
    cmd_tx: mpsc::Sender<CompactorCmd>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct CompactorInner {
    env: Arc<MergeEnv>,
    scheduler: MergeScheduler,
    data_dir: PathBuf,
    state: Mutex<HashMap<u64, PartitionLevels>>,
    stats: CompactorStats,
}

impl LeveledCompactor {
    /// Replays any mid-flight merge journal, scans the data directory into
    /// the level index, and starts the poll loop.
    pub fn open(
        data_dir: impl AsRef<Path>,
        catalogue: Arc<dyn Catalogue>,
        config: MergeConfig,
    ) -> Result<Self, MergeError> {
        let config = config.sanitized();
        let data_dir = data_dir.as_ref().to_path_buf();
        let sys_dir = data_dir.join("sys");
        fs::create_dir_all(&sys_dir)?;
        fs::create_dir_all(data_dir.join(SEQUENCE_DIR))?;
        fs::create_dir_all(data_dir.join(UNSEQUENCE_DIR))?;

        // The journal is consumed before any other component becomes writable.
        let recovery = recover_storage_group(
            &sys_dir,
            &config.event_listener,
            config.continue_merge_after_reboot,
        )?;

        let scheduler =
            MergeScheduler::new(config.merge_thread_num, config.merge_chunk_sub_thread_num)?;
        let env = Arc::new(MergeEnv {
            config,
            catalogue,
            sys_dir,
        });

        let inner = Arc::new(CompactorInner {
            env,
            scheduler,
            data_dir,
            state: Mutex::new(HashMap::new()),
            stats: CompactorStats::default(),
        });
        inner.scan_existing()?;

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let loop_inner = Arc::clone(&inner);
        let interval = loop_inner.env.config.merge_interval;
        let handle = thread::Builder::new()
            .name("seamer-compactor".to_string())
            .spawn(move || loop {
                match cmd_rx.recv_timeout(interval) {
                    Ok(CompactorCmd::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                        break
                    }
                    Ok(CompactorCmd::Force { ack }) => {
                        let _ = ack.send(loop_inner.run_pass());
                    }
                    Ok(CompactorCmd::Maybe) | Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(e) = loop_inner.run_pass() {
                            loop_inner.record_failure(&e);
                        }
                    }
                }
            })
            .map_err(|e| MergeError::BackgroundTaskError(e.to_string()))?;

        let compactor = Self {
            inner,
            cmd_tx,
            handle: Mutex::new(Some(handle)),
        };
        if recovery.resume.is_some() {
            // Inputs survived the rollback; the next pass redoes the merge.
            let _ = compactor.cmd_tx.send(CompactorCmd::Maybe);
        }
        Ok(compactor)
    }

    pub fn sequence_dir(&self, partition: u64) -> PathBuf {
        self.inner
            .data_dir
            .join(SEQUENCE_DIR)
            .join(partition.to_string())
    }

    pub fn unsequence_dir(&self, partition: u64) -> PathBuf {
        self.inner
            .data_dir
            .join(UNSEQUENCE_DIR)
            .join(partition.to_string())
    }

    /// Installs a newly sealed segment into the level index.
    pub fn install(&self, segment: Arc<Segment>, sequence: bool) -> Result<(), MergeError> {
        let mut state = self.inner.state.lock()?;
        self.inner.insert_locked(&mut state, segment, sequence);
        let _ = self.cmd_tx.send(CompactorCmd::Maybe);
        Ok(())
    }

    /// All segments of one population, highest level first.
    pub fn segments(&self, sequence: bool) -> Vec<Arc<Segment>> {
        let state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for levels in state.values() {
            let lists = if sequence { &levels.seq } else { &levels.unseq };
            for level in lists.iter().rev() {
                out.extend(level.iter().cloned());
            }
        }
        out
    }

    /// Segments of one partition/level (tests and introspection).
    pub fn level_file_count(&self, partition: u64, level: usize, sequence: bool) -> usize {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| {
                state.get(&partition).map(|levels| {
                    let lists = if sequence { &levels.seq } else { &levels.unseq };
                    lists.get(level).map(|l| l.len()).unwrap_or(0)
                })
            })
            .unwrap_or(0)
    }

    /// Runs one compaction pass now and waits for it.
    pub fn compact_blocking(&self) -> Result<bool, MergeError> {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(CompactorCmd::Force { ack: tx })
            .map_err(|e| MergeError::BackgroundTaskError(format!("compactor is down: {}", e)))?;
        rx.recv()
            .map_err(|e| MergeError::BackgroundTaskError(format!("compactor is down: {}", e)))?
    }

    /// Failed merge attempts since startup (user-visible error surface).
    pub fn failed_merge_count(&self) -> u64 {
        self.inner.stats.failed_merges.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.stats.last_error.lock().ok().and_then(|e| e.clone())
    }
}

impl Drop for LeveledCompactor {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(CompactorCmd::Shutdown);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        self.inner.scheduler.shutdown();
    }
}

impl CompactorInner {
    fn scan_existing(&self) -> Result<(), MergeError> {
        let mut state = self.state.lock()?;
        for (top, sequence) in [(SEQUENCE_DIR, true), (UNSEQUENCE_DIR, false)] {
            let top_dir = self.data_dir.join(top);
            for entry in fs::read_dir(&top_dir)? {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                for file in fs::read_dir(entry.path())? {
                    let file = file?;
                    let name = file.file_name().to_string_lossy().into_owned();
                    if SegmentName::parse(&name).is_err() {
                        continue;
                    }
                    match Segment::open(file.path()) {
                        Ok(segment) => {
                            self.insert_locked(&mut state, Arc::new(segment), sequence)
                        }
                        Err(e) => self.env.config.event_listener.on_event(
                            MergeEvent::CompactionFailed {
                                error: format!(
                                    "skipping unreadable segment {}: {}",
                                    file.path().display(),
                                    e
                                ),
                            },
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    fn insert_locked(
        &self,
        state: &mut HashMap<u64, PartitionLevels>,
        segment: Arc<Segment>,
        sequence: bool,
    ) {
        let config = &self.env.config;
        let levels = state.entry(segment.partition()).or_insert_with(|| {
            PartitionLevels::new(config.seq_level_num, config.unseq_level_num)
        });
        if sequence {
            let level = (segment.name().tier() as usize).min(config.seq_level_num - 1);
            let list = &mut levels.seq[level];
            list.push(segment);
            list.sort_by_key(|s| (s.partition(), s.name()));
        } else {
            let level = (segment.name().tier() as usize).min(config.unseq_level_num - 1);
            levels.unseq[level].push(segment);
        }
    }

    fn remove_locked(
        state: &mut HashMap<u64, PartitionLevels>,
        partition: u64,
        ids: &[u64],
    ) {
        if let Some(levels) = state.get_mut(&partition) {
            for list in levels.seq.iter_mut().chain(levels.unseq.iter_mut()) {
                list.retain(|s| !ids.contains(&s.id()));
            }
        }
    }

    fn record_failure(&self, e: &MergeError) {
        self.stats.failed_merges.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.stats.last_error.lock() {
            *last = Some(e.to_string());
        }
        self.env
            .config
            .event_listener
            .on_event(MergeEvent::CompactionFailed { error: e.to_string() });
    }

    /// One pass over every partition. Returns whether any merge ran.
    fn run_pass(&self) -> Result<bool, MergeError> {
        let partitions: Vec<u64> = {
            let state = self.state.lock()?;
            state.keys().copied().collect()
        };
        let mut did_merge = false;
        for partition in partitions {
            did_merge |= self.compact_partition(partition)?;
        }
        Ok(did_merge)
    }

    fn compact_partition(&self, partition: u64) -> Result<bool, MergeError> {
        let config = &self.env.config;

        // Fork the closed, unreserved file lists under the index lock.
        let (forked_seq, forked_unseq) = {
            let state = self.state.lock()?;
            let Some(levels) = state.get(&partition) else {
                return Ok(false);
            };
            let fork = |lists: &Vec<Vec<Arc<Segment>>>| -> Vec<Vec<Arc<Segment>>> {
                lists
                    .iter()
                    .map(|level| {
                        level
                            .iter()
                            .filter(|s| s.is_sealed() && !s.is_deleted() && !s.is_merging())
                            .cloned()
                            .collect()
                    })
                    .collect()
            };
            (fork(&levels.seq), fork(&levels.unseq))
        };

        let mut did_merge = false;

        // Sequence levels: promote the oldest cap-many files upward.
        for level in 0..config.seq_level_num.saturating_sub(1) {
            if forked_seq[level].len() >= config.seq_file_num_in_each_level {
                let inputs: Vec<Arc<Segment>> = forked_seq[level]
                    [..config.seq_file_num_in_each_level]
                    .to_vec();
                match self.promote_level(partition, inputs, (level + 1) as u32, true) {
                    Ok(ran) => did_merge |= ran,
                    Err(e) => self.record_failure(&e),
                }
            }
        }

        // Unsequence: either collapse into sequence or level independently.
        if config.enable_unseq_compaction
            && config.unseq_level_num <= 1
            && !forked_unseq[0].is_empty()
        {
            match self.merge_unseq_into_seq(partition, forked_unseq[0].clone()) {
                Ok(ran) => did_merge |= ran,
                Err(e) => self.record_failure(&e),
            }
        } else {
            for level in 0..config.unseq_level_num.saturating_sub(1) {
                if forked_unseq[level].len() >= config.unseq_file_num_in_each_level {
                    let inputs: Vec<Arc<Segment>> = forked_unseq[level]
                        [..config.unseq_file_num_in_each_level]
                        .to_vec();
                    // The top unsequence level is only ever joined into the
                    // sequence population, never promoted further.
                    let result = if config.enable_unseq_compaction
                        && level + 2 == config.unseq_level_num
                    {
                        self.merge_unseq_into_seq(partition, inputs)
                    } else {
                        self.promote_level(partition, inputs, (level + 1) as u32, false)
                    };
                    match result {
                        Ok(ran) => did_merge |= ran,
                        Err(e) => self.record_failure(&e),
                    }
                }
            }
        }
        Ok(did_merge)
    }

    /// Merges `inputs` into one file at `target_level` of the same population.
    fn promote_level(
        &self,
        partition: u64,
        inputs: Vec<Arc<Segment>>,
        target_level: u32,
        sequence: bool,
    ) -> Result<bool, MergeError> {
        if !reserve_all(&inputs) {
            return Ok(false);
        }
        let config = &self.env.config;
        let listener = config.event_listener.clone();
        listener.on_event(MergeEvent::LevelPromotionStarted {
            partition,
            level: target_level as usize - 1,
            inputs: inputs.len(),
        });

        let output_name = inputs[0].name().promoted(target_level);
        let output_dir = self
            .data_dir
            .join(if sequence { SEQUENCE_DIR } else { UNSEQUENCE_DIR })
            .join(partition.to_string());

        let (seq_inputs, unseq_inputs) = if sequence {
            (inputs.clone(), Vec::new())
        } else {
            (Vec::new(), inputs.clone())
        };
        let resource = MergeResource::new(
            seq_inputs,
            unseq_inputs,
            self.env.catalogue.clone(),
            listener.clone(),
            SQUEEZE_MERGE_SUFFIX,
            config.time_lower_bound,
            config.reader_cache_cap,
        );
        let series = match collect_series(&resource, self.env.catalogue.as_ref()) {
            Ok(series) => series,
            Err(e) => {
                release_all(&inputs);
                return Err(e);
            }
        };

        let task = MergeTask {
            env: Arc::clone(&self.env),
            resource,
            task_name: format!("level-{}-{}-p{}", target_level - 1, target_level, partition),
            full_merge: true,
            squeeze: true,
            concurrent_merge_series_num: config.concurrent_merge_series_num,
            output_dir: output_dir.clone(),
            output_name: Some(output_name),
            series,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let report = match self.scheduler.submit_and_wait(task) {
            Ok(report) => report,
            Err(e) => {
                release_all(&inputs);
                return Err(e);
            }
        };

        if report.outcome.is_success() {
            let output = report
                .new_segments
                .first()
                .cloned()
                .ok_or_else(|| MergeError::Internal("squeeze task returned no output".into()))?;
            let ids: Vec<u64> = inputs.iter().map(|s| s.id()).collect();
            {
                let mut state = self.state.lock()?;
                Self::remove_locked(&mut state, partition, &ids);
                self.insert_locked(&mut state, output.clone(), sequence);
            }
            listener.on_event(MergeEvent::LevelPromoted {
                partition,
                level: target_level as usize,
                output: output.path(),
            });
            Ok(true)
        } else {
            release_all(&inputs);
            Err(MergeError::BackgroundTaskError(format!(
                "level promotion failed: {:?}",
                report.outcome
            )))
        }
    }

    /// The "full" path: overlay a batch of unsequence files onto the sequence
    /// population via the configured commit strategy.
    fn merge_unseq_into_seq(
        &self,
        partition: u64,
        unseq_inputs: Vec<Arc<Segment>>,
    ) -> Result<bool, MergeError> {
        let config = &self.env.config;
        let listener = config.event_listener.clone();
        let strategy = config.seq_merge_file_strategy;

        let seq_candidates: Vec<Arc<Segment>> = {
            let state = self.state.lock()?;
            let Some(levels) = state.get(&partition) else {
                return Ok(false);
            };
            levels
                .seq
                .iter()
                .flatten()
                .filter(|s| s.is_sealed() && !s.is_deleted() && !s.is_merging())
                .cloned()
                .collect()
        };
        if seq_candidates.is_empty() {
            return Ok(false);
        }

        let suffix = if strategy.is_squeeze() {
            SQUEEZE_MERGE_SUFFIX
        } else {
            INPLACE_MERGE_SUFFIX
        };
        let mut resource = MergeResource::new(
            seq_candidates,
            unseq_inputs,
            self.env.catalogue.clone(),
            listener.clone(),
            suffix,
            config.time_lower_bound,
            config.reader_cache_cap,
        );

        // Loose bound first; if nothing fits, retry with the tight estimate.
        let mut selection = {
            let selector = FileSelector::new(
                &resource,
                config.merge_memory_budget,
                config.merge_file_selection_time_budget,
                false,
                config.concurrent_merge_series_num,
            );
            if strategy.is_max_series() {
                selector.select_max_series(&listener)?
            } else {
                selector.select_max_files(&listener)?
            }
        };
        if selection.is_empty() {
            let selector = FileSelector::new(
                &resource,
                config.merge_memory_budget,
                config.merge_file_selection_time_budget,
                true,
                config.concurrent_merge_series_num,
            );
            selection = if strategy.is_max_series() {
                selector.select_max_series(&listener)?
            } else {
                selector.select_max_files(&listener)?
            };
        }
        if selection.is_empty() {
            return Ok(false);
        }

        let selected_seq = selection.seq.clone();
        let selected_unseq = selection.unseq.clone();
        let all_selected: Vec<Arc<Segment>> = selected_seq
            .iter()
            .chain(selected_unseq.iter())
            .cloned()
            .collect();
        if !reserve_all(&all_selected) {
            return Ok(false);
        }
        if let Err(e) = resource.set_files(selected_seq.clone(), selected_unseq.clone()) {
            release_all(&all_selected);
            return Err(e);
        }
        let series = match collect_series(&resource, self.env.catalogue.as_ref()) {
            Ok(series) => series,
            Err(e) => {
                release_all(&all_selected);
                return Err(e);
            }
        };

        let output_dir = self
            .data_dir
            .join(SEQUENCE_DIR)
            .join(partition.to_string());
        let task = MergeTask {
            env: Arc::clone(&self.env),
            resource,
            task_name: format!("unseq-merge-p{}", partition),
            full_merge: config.force_full_merge,
            squeeze: strategy.is_squeeze(),
            concurrent_merge_series_num: selection.concurrent_merge_series_num,
            output_dir,
            output_name: None,
            series,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let report = match self.scheduler.submit_and_wait(task) {
            Ok(report) => report,
            Err(e) => {
                release_all(&all_selected);
                return Err(e);
            }
        };

        if !report.outcome.is_success() {
            release_all(&all_selected);
            return Err(MergeError::BackgroundTaskError(format!(
                "unsequence merge failed: {:?}",
                report.outcome
            )));
        }

        let mut state = self.state.lock()?;
        if strategy.is_squeeze() {
            let ids: Vec<u64> = all_selected.iter().map(|s| s.id()).collect();
            Self::remove_locked(&mut state, partition, &ids);
            for output in &report.new_segments {
                self.insert_locked(&mut state, output.clone(), true);
            }
        } else {
            // Inplace: unsequence inputs are gone; sequence files were
            // renamed to the next merge generation, which may move their tier.
            let ids: Vec<u64> = selected_unseq.iter().map(|s| s.id()).collect();
            Self::remove_locked(&mut state, partition, &ids);
            let seq_ids: Vec<u64> = selected_seq.iter().map(|s| s.id()).collect();
            Self::remove_locked(&mut state, partition, &seq_ids);
            for seq in selected_seq {
                self.insert_locked(&mut state, seq, true);
            }
        }
        Ok(true)
    }
}

fn reserve_all(segments: &[Arc<Segment>]) -> bool {
    for (i, segment) in segments.iter().enumerate() {
        if !segment.try_reserve() {
            for taken in &segments[..i] {
                taken.release_reservation();
            }
            return false;
        }
    }
    true
}

fn release_all(segments: &[Arc<Segment>]) {
    for segment in segments {
        segment.release_reservation();
    }
}

/// The series to merge, in catalogue order, restricted to those present in
/// the working set. An uncatalogued series in an input is an error rather
/// than silent data loss.
fn collect_series(
    resource: &MergeResource,
    catalogue: &dyn Catalogue,
) -> Result<Vec<SeriesPath>, MergeError> {
    use std::collections::BTreeSet;
    let mut present: BTreeSet<SeriesPath> = BTreeSet::new();
    for segment in resource.seq_files().iter().chain(resource.unseq_files().iter()) {
        let reader = resource.reader(segment)?;
        present.extend(reader.all_series());
    }
    let mut ordered = Vec::with_capacity(present.len());
    for series in catalogue.all_series() {
        if present.remove(&series) {
            ordered.push(series);
        }
    }
    if let Some(unknown) = present.into_iter().next() {
        return Err(MergeError::SeriesNotFound(unknown.to_string()));
    }
    Ok(ordered)
}
