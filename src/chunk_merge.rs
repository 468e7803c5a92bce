//! The inner merge kernel.
//!
//! For a batch of same-device series, walks every sequence segment of the
//! working set in order. Each segment's chunk-metadata lists are partitioned
//! round-robin across sub-workers, each holding a min-heap keyed by
//! `(chunk start time, series index)`. A popped chunk lands in one of five
//! cases: skipped (left in place), copied verbatim, decoded into the unclosed
//! buffer, merged point-by-point with the unsequence stream, or the buffer is
//! flushed once it is big enough.
//!
//! Sub-workers run on the shared rayon pool; the submitting thread
//! participates via `scope`, so a saturated pool degrades to inline execution
//! instead of deadlocking. All writes to the output writer take its lock;
//! chunk fetches go through a provider that deduplicates concurrent reads of
//! the same chunk.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::MergeError;
use crate::format::{Chunk, ChunkMetadata, SegmentReader, SegmentWriter};
use crate::journal::{JournalEntry, MergeJournal};
use crate::point_reader::UnseqPointReader;
use crate::resource::{MergeContext, MergeResource};
use crate::segment::Segment;
use crate::types::{DataType, SeriesPath, TimeValuePair, Timestamp};

/// Where merged chunks go.
#[derive(Debug, Clone)]
pub enum MergeOutputMode {
    /// One temp writer per sequence file (inplace commit).
    PerSeqFile,
    /// One shared output file (squeeze commit and level promotion).
    Single(Arc<Mutex<SegmentWriter>>),
}

#[derive(Debug)]
pub struct ChunkMerger<'a> {
    pub resource: &'a MergeResource,
    pub context: &'a MergeContext,
    pub journal: &'a Mutex<MergeJournal>,
    pub pool: &'a rayon::ThreadPool,
    pub output: MergeOutputMode,
    pub full_merge: bool,
    pub min_chunk_point_num: i64,
    pub sub_task_num: usize,
    pub concurrent_merge_series_num: usize,
    pub cancel: &'a AtomicBool,
}

impl<'a> ChunkMerger<'a> {
    /// Merges every series in the batch list across the whole working set.
    pub fn merge_series(&self, all_series: &[SeriesPath]) -> Result<(), MergeError> {
        for seq in self.resource.seq_files() {
            self.context.init_file(seq.id())?;
        }
        for group in split_by_device(all_series) {
            for batch in group.chunks(self.concurrent_merge_series_num.max(1)) {
                if self.cancel.load(Ordering::Relaxed) {
                    return Err(MergeError::Cancelled);
                }
                self.merge_batch(batch)?;
            }
        }
        Ok(())
    }

    fn merge_batch(&self, batch: &[SeriesPath]) -> Result<(), MergeError> {
        self.journal
            .lock()?
            .log(&JournalEntry::TsStart { series: batch.to_vec() })?;

        let unseq_readers = self.resource.unseq_readers(batch)?;
        let mut states: Vec<Option<SeriesMergeState>> = Vec::with_capacity(batch.len());
        for (series, unseq) in batch.iter().zip(unseq_readers) {
            let data_type = self.resource.data_type(series)?;
            let out_version = unseq.max_version();
            states.push(Some(SeriesMergeState {
                series: series.clone(),
                data_type,
                unseq,
                out_version,
            }));
        }

        let seq_files: Vec<Arc<Segment>> = self.resource.seq_files().to_vec();
        for (i, seq) in seq_files.iter().enumerate() {
            let is_last_file = i + 1 == seq_files.len();
            self.merge_batch_one_file(seq, is_last_file, &mut states)?;
        }
        if seq_files.is_empty() {
            self.drain_unseq_only(&mut states)?;
        }

        self.journal.lock()?.log(&JournalEntry::TsEnd)?;
        Ok(())
    }

    /// With an empty sequence working set (unsequence level promotion) the
    /// whole stream goes straight into the single output.
    fn drain_unseq_only(
        &self,
        states: &mut [Option<SeriesMergeState>],
    ) -> Result<(), MergeError> {
        let MergeOutputMode::Single(writer) = &self.output else {
            return Ok(());
        };
        for slot in states.iter_mut() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(MergeError::Cancelled);
            }
            let Some(state) = slot.as_mut() else { continue };
            let mut buffer: Vec<TimeValuePair> = Vec::new();
            loop {
                let point = match state.unseq.current() {
                    Some(p) => p.clone(),
                    None => break,
                };
                state.unseq.advance();
                buffer.push(point);
                let full = self.min_chunk_point_num > 0
                    && buffer.len() as i64 >= self.min_chunk_point_num;
                if full || state.unseq.current().is_none() {
                    let points = std::mem::take(&mut buffer);
                    self.context.inc_points_written(points.len() as u64);
                    let mut w = writer.lock()?;
                    w.append_points(
                        &state.series,
                        state.data_type,
                        state.out_version,
                        &points,
                    )?;
                    drop(w);
                    self.context.inc_chunks_written();
                }
            }
        }
        Ok(())
    }

    fn merge_batch_one_file(
        &self,
        seq: &Arc<Segment>,
        is_last_file: bool,
        states: &mut [Option<SeriesMergeState>],
    ) -> Result<(), MergeError> {
        let device = match states.iter().flatten().next() {
            Some(state) => state.series.device.clone(),
            None => return Ok(()),
        };
        let device_range = seq.device_range(&device);
        if device_range.is_none() && !is_last_file {
            return Ok(());
        }

        // Gather this file's chunk lists and apply its tombstones.
        let mut work_items: Vec<(usize, Vec<ChunkMetadata>)> = Vec::new();
        for (idx, slot) in states.iter_mut().enumerate() {
            let Some(state) = slot.as_mut() else { continue };
            let tombstones = self.resource.modifications(seq, &state.series)?;
            let mut metas = self.resource.chunk_metadata(&state.series, seq)?;
            for meta in metas.iter_mut() {
                for t in &tombstones {
                    if t.version > meta.version && t.end_time > meta.deleted_at {
                        meta.deleted_at = t.end_time;
                    }
                }
            }
            // A series absent from the last file but with pending unsequence
            // data still needs a chunk there.
            if metas.is_empty() && !(is_last_file && state.unseq.current().is_some()) {
                continue;
            }
            work_items.push((idx, metas));
        }
        if work_items.is_empty() {
            return Ok(());
        }

        // Unsequence points earlier than the device's recorded start pull the
        // committed descriptor's min time down.
        let mut pulled_min = device_range.map(|(min, _)| min);
        for (idx, _) in &work_items {
            if let Some(state) = states[*idx].as_ref() {
                if let Some(tv) = state.unseq.current() {
                    pulled_min = Some(match pulled_min {
                        Some(min) => min.min(tv.timestamp),
                        None => tv.timestamp,
                    });
                }
            }
        }

        let writer = match &self.output {
            MergeOutputMode::PerSeqFile => self.resource.temp_writer(seq)?,
            MergeOutputMode::Single(w) => w.clone(),
        };
        let reader = self.resource.reader(seq)?;
        let provider = ChunkProvider::new(reader);

        // Round-robin the batch across sub-workers; each series belongs to
        // exactly one worker.
        let sub_tasks = self.sub_task_num.max(1);
        let mut workers: Vec<SubWorker> = (0..sub_tasks.min(work_items.len()))
            .map(|_| SubWorker::new())
            .collect();
        let worker_count = workers.len();
        for (i, (idx, metas)) in work_items.into_iter().enumerate() {
            let state = states[idx]
                .take()
                .ok_or_else(|| MergeError::Internal("series state taken twice".to_string()))?;
            workers[i % worker_count].series.push(SeriesWork {
                slot: idx,
                state,
                metas,
                pos: 0,
                pt_written: 0,
                buffer: Vec::new(),
            });
        }

        let merged = AtomicU64::new(0);
        let unmerged = AtomicU64::new(0);
        let shared = FileMergeShared {
            merger: self,
            provider: &provider,
            writer: &writer,
            seq_id: seq.id(),
            seq_path: seq.path(),
            is_last_file,
            merged: &merged,
            unmerged: &unmerged,
        };

        self.pool.scope(|scope| {
            for worker in workers.iter_mut() {
                let shared = &shared;
                scope.spawn(move |_| {
                    let result = worker.run(shared);
                    worker.result = result;
                });
            }
        });

        // Hand the series states back for the next file, surfacing the first
        // worker error.
        let mut first_error = None;
        for worker in workers {
            if let Err(e) = worker.result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            for work in worker.series {
                states[work.slot] = Some(work.state);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.context.add_merged_chunks(seq.id(), merged.load(Ordering::Relaxed))?;
        self.context
            .add_unmerged_chunks(seq.id(), unmerged.load(Ordering::Relaxed))?;

        if merged.load(Ordering::Relaxed) > 0 {
            let (path, position) = {
                let mut w = writer.lock()?;
                w.sync()?;
                (w.path().to_path_buf(), w.position())
            };
            self.journal
                .lock()?
                .log(&JournalEntry::FilePosition { file: path, offset: position })?;

            if matches!(self.output, MergeOutputMode::PerSeqFile) {
                if let (Some(min), Some(_)) = (pulled_min, device_range) {
                    seq.update_descriptor(|d| d.pull_down_start_time(&device, min));
                }
            }
        }
        Ok(())
    }
}

struct SeriesMergeState {
    series: SeriesPath,
    data_type: DataType,
    unseq: UnseqPointReader,
    out_version: i64,
}

struct SeriesWork {
    slot: usize,
    state: SeriesMergeState,
    metas: Vec<ChunkMetadata>,
    pos: usize,
    pt_written: u64,
    buffer: Vec<TimeValuePair>,
}

/// Everything a sub-worker needs for one (file, batch) pass.
struct FileMergeShared<'s, 'a> {
    merger: &'s ChunkMerger<'a>,
    provider: &'s ChunkProvider,
    writer: &'s Arc<Mutex<SegmentWriter>>,
    seq_id: u64,
    seq_path: std::path::PathBuf,
    is_last_file: bool,
    merged: &'s AtomicU64,
    unmerged: &'s AtomicU64,
}

struct SubWorker {
    series: Vec<SeriesWork>,
    result: Result<(), MergeError>,
}

impl SubWorker {
    fn new() -> Self {
        Self { series: Vec::new(), result: Ok(()) }
    }

    fn run(&mut self, shared: &FileMergeShared<'_, '_>) -> Result<(), MergeError> {
        // Min-heap over (current chunk start time, series position in batch).
        let mut heap: BinaryHeap<Reverse<(Timestamp, usize, usize)>> = BinaryHeap::new();
        for (i, work) in self.series.iter().enumerate() {
            if let Some(meta) = work.metas.first() {
                heap.push(Reverse((meta.start_time, work.slot, i)));
            }
        }

        while let Some(Reverse((_, _, i))) = heap.pop() {
            if shared.merger.cancel.load(Ordering::Relaxed) {
                return Err(MergeError::Cancelled);
            }
            let work = &mut self.series[i];
            merge_one_chunk(work, shared)?;

            work.pos += 1;
            if let Some(meta) = work.metas.get(work.pos) {
                heap.push(Reverse((meta.start_time, work.slot, i)));
            } else {
                finish_series_in_file(work, shared)?;
            }
        }

        // Series with no chunks in this file: on the last file their pending
        // unsequence data still has to be drained.
        if shared.is_last_file {
            for work in self.series.iter_mut().filter(|w| w.metas.is_empty()) {
                if shared.merger.cancel.load(Ordering::Relaxed) {
                    return Err(MergeError::Cancelled);
                }
                finish_series_in_file(work, shared)?;
            }
        }
        Ok(())
    }
}

/// Applies one of the five merge cases to the chunk at `work.pos`.
fn merge_one_chunk(
    work: &mut SeriesWork,
    shared: &FileMergeShared<'_, '_>,
) -> Result<(), MergeError> {
    let meta = work.metas[work.pos].clone();
    let is_last_chunk = work.pos + 1 == work.metas.len();
    let merger = shared.merger;

    let modified = meta.is_tombstoned();
    let overflowed = work
        .state
        .unseq
        .current()
        .map_or(false, |tv| tv.timestamp <= meta.end_time);
    let too_small = work.pt_written > 0
        || (merger.min_chunk_point_num >= 0
            && (meta.point_count as i64) < merger.min_chunk_point_num
            && !is_last_chunk);

    let untouched = !too_small && !overflowed && !modified;

    // Case 1: leave the chunk where it is.
    if !merger.full_merge && untouched {
        shared.unmerged.fetch_add(1, Ordering::Relaxed);
        merger
            .context
            .record_unmerged_chunk(shared.seq_id, &work.state.series, meta.start_time)?;
        return Ok(());
    }

    // Case 2: copy the chunk verbatim, no decode.
    if merger.full_merge && untouched {
        let Some(chunk) = fetch_chunk(shared, &meta)? else {
            return Ok(());
        };
        {
            let mut w = shared.writer.lock()?;
            w.append_raw(&chunk)?;
        }
        merger.context.inc_points_written(meta.point_count as u64);
        merger.context.inc_chunks_written();
        shared.merged.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    // Cases 3/4: decode, optionally interleaving the unsequence stream.
    let Some(chunk) = fetch_chunk(shared, &meta)? else {
        return Ok(());
    };
    let points = chunk.decode()?;
    work.state.out_version = work.state.out_version.max(meta.version);

    let written = if overflowed {
        write_with_unseq(work, points)
    } else {
        let n = points.len() as u64;
        work.buffer.extend(points);
        n
    };
    work.pt_written += written;
    shared.merged.fetch_add(1, Ordering::Relaxed);
    merger.context.inc_points_written(written);

    // Case 5: flush the unclosed buffer once it is big enough.
    let threshold = merger.min_chunk_point_num;
    if (threshold > 0 && work.pt_written >= threshold as u64)
        || (threshold < 0 && work.pt_written > 0)
    {
        flush_buffer(work, shared)?;
    }
    Ok(())
}

/// After a series' last chunk in the current file: drain the remaining
/// unsequence points (last file only) and flush whatever is still buffered.
fn finish_series_in_file(
    work: &mut SeriesWork,
    shared: &FileMergeShared<'_, '_>,
) -> Result<(), MergeError> {
    if shared.is_last_file && work.state.unseq.current().is_some() {
        let mut drained = 0u64;
        while let Some(tv) = work.state.unseq.current() {
            let tv = tv.clone();
            work.state.unseq.advance();
            work.buffer.push(tv);
            drained += 1;
        }
        work.pt_written += drained;
        shared.merged.fetch_add(1, Ordering::Relaxed);
        shared.merger.context.inc_points_written(drained);
    }
    if work.pt_written > 0 {
        flush_buffer(work, shared)?;
    }
    Ok(())
}

/// Fetches through the shared provider. A corrupt chunk is reported, skipped,
/// and contributes nothing to the output.
fn fetch_chunk(
    shared: &FileMergeShared<'_, '_>,
    meta: &ChunkMetadata,
) -> Result<Option<Chunk>, MergeError> {
    match shared.provider.require(meta) {
        Ok(chunk) => Ok(Some(Chunk { meta: meta.clone(), raw: chunk.raw })),
        Err(MergeError::Corruption { .. }) => {
            shared
                .merger
                .resource
                .report_corrupt_chunk(meta, shared.seq_path.clone());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Interleaves decoded sequence points with the series' unsequence stream.
/// An unsequence point at the same timestamp replaces the sequence point.
fn write_with_unseq(work: &mut SeriesWork, points: Vec<TimeValuePair>) -> u64 {
    let mut written = 0u64;
    for p in points {
        let mut overwrite = false;
        loop {
            let Some(u) = work.state.unseq.current() else { break };
            if u.timestamp > p.timestamp {
                break;
            }
            let u = u.clone();
            if u.timestamp == p.timestamp {
                overwrite = true;
            }
            work.state.unseq.advance();
            work.buffer.push(u);
            written += 1;
        }
        if !overwrite {
            work.buffer.push(p);
            written += 1;
        }
    }
    written
}

fn flush_buffer(
    work: &mut SeriesWork,
    shared: &FileMergeShared<'_, '_>,
) -> Result<(), MergeError> {
    if work.buffer.is_empty() {
        work.pt_written = 0;
        return Ok(());
    }
    let points = std::mem::take(&mut work.buffer);
    {
        let mut w = shared.writer.lock()?;
        w.append_points(
            &work.state.series,
            work.state.data_type,
            work.state.out_version,
            &points,
        )?;
    }
    shared.merger.context.inc_chunks_written();
    work.pt_written = 0;
    Ok(())
}

/// Groups series by device, preserving first-seen device order and the given
/// order within each device.
pub fn split_by_device(series: &[SeriesPath]) -> Vec<Vec<SeriesPath>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<SeriesPath>> = HashMap::new();
    for s in series {
        if !groups.contains_key(&s.device) {
            order.push(s.device.clone());
        }
        groups.entry(s.device.clone()).or_default().push(s.clone());
    }
    order
        .into_iter()
        .filter_map(|device| groups.remove(&device))
        .collect()
}

/// Deduplicating chunk fetcher shared by the sub-workers of one file pass.
/// `require` either returns the in-flight fetch of the same chunk or fetches
/// once and notifies every waiter. Chunks are not cached after delivery.
pub(crate) struct ChunkProvider {
    reader: Arc<SegmentReader>,
    inflight: Mutex<HashMap<u64, Arc<FetchSlot>>>,
}

struct FetchSlot {
    done: Mutex<Option<Result<Chunk, FetchFailure>>>,
    cv: Condvar,
}

#[derive(Clone)]
struct FetchFailure {
    corruption: bool,
    message: String,
}

impl ChunkProvider {
    pub(crate) fn new(reader: Arc<SegmentReader>) -> Self {
        Self { reader, inflight: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn require(&self, meta: &ChunkMetadata) -> Result<Chunk, MergeError> {
        enum Role {
            Fetcher(Arc<FetchSlot>),
            Waiter(Arc<FetchSlot>),
        }

        let role = {
            let mut inflight = self.inflight.lock()?;
            match inflight.get(&meta.offset) {
                Some(slot) => Role::Waiter(slot.clone()),
                None => {
                    let slot = Arc::new(FetchSlot {
                        done: Mutex::new(None),
                        cv: Condvar::new(),
                    });
                    inflight.insert(meta.offset, slot.clone());
                    Role::Fetcher(slot)
                }
            }
        };

        match role {
            Role::Fetcher(slot) => {
                let result = self.reader.read_chunk(meta);
                {
                    let mut done = slot.done.lock()?;
                    *done = Some(match &result {
                        Ok(chunk) => Ok(chunk.clone()),
                        Err(e) => Err(FetchFailure {
                            corruption: matches!(e, MergeError::Corruption { .. }),
                            message: e.to_string(),
                        }),
                    });
                }
                slot.cv.notify_all();
                self.inflight.lock()?.remove(&meta.offset);
                result
            }
            Role::Waiter(slot) => {
                let mut done = slot.done.lock()?;
                while done.is_none() {
                    done = slot.cv.wait(done)?;
                }
                match done.as_ref() {
                    Some(Ok(chunk)) => Ok(chunk.clone()),
                    Some(Err(failure)) if failure.corruption => Err(MergeError::Corruption {
                        details: failure.message.clone(),
                        series: Some(meta.series.to_string()),
                        timestamp: Some(meta.start_time),
                    }),
                    Some(Err(failure)) => {
                        Err(MergeError::BackgroundTaskError(failure.message.clone()))
                    }
                    None => Err(MergeError::Internal(
                        "chunk fetch slot emptied before delivery".to_string(),
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_by_device_groups_and_preserves_order() {
        let series = vec![
            SeriesPath::new("d2", "s0"),
            SeriesPath::new("d1", "s0"),
            SeriesPath::new("d2", "s1"),
        ];
        let groups = split_by_device(&series);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![SeriesPath::new("d2", "s0"), SeriesPath::new("d2", "s1")]);
        assert_eq!(groups[1], vec![SeriesPath::new("d1", "s0")]);
    }
}
