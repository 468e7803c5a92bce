//! Working-set management for one merge task.
//!
//! `MergeResource` owns the selected sequence/unsequence segment lists and
//! caches the expensive handles a merge keeps re-using: open readers (bounded
//! by an LRU), lazily created temp-file writers, and per-segment tombstone
//! lists. `MergeContext` is the per-run mutable aggregate the committer reads
//! after the chunk kernel finishes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::catalogue::Catalogue;
use crate::error::MergeError;
use crate::format::{ChunkMetadata, SegmentReader, SegmentWriter};
use crate::point_reader::UnseqPointReader;
use crate::segment::{sidecar_path, Segment, Tombstone};
use crate::telemetry::{MergeEvent, MergeEventListener};
use crate::types::{DataType, SeriesPath, Timestamp};

#[derive(Debug)]
struct ReaderCache {
    cap: usize,
    readers: HashMap<u64, Arc<SegmentReader>>,
    // front = least recently used
    order: VecDeque<u64>,
}

impl ReaderCache {
    fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), readers: HashMap::new(), order: VecDeque::new() }
    }

    fn touch(&mut self, id: u64) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id);
    }

    fn get_or_open(&mut self, segment: &Segment) -> Result<Arc<SegmentReader>, MergeError> {
        let id = segment.id();
        if let Some(reader) = self.readers.get(&id).cloned() {
            self.touch(id);
            return Ok(reader);
        }
        let reader = Arc::new(SegmentReader::open(segment.path())?);
        self.readers.insert(id, reader.clone());
        self.touch(id);
        while self.readers.len() > self.cap {
            let Some(evict) = self.order.pop_front() else { break };
            self.readers.remove(&evict);
        }
        Ok(reader)
    }

    fn remove(&mut self, id: u64) {
        self.readers.remove(&id);
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
    }

    fn clear(&mut self) {
        self.readers.clear();
        self.order.clear();
    }
}

/// Files and cached handles of one merge task.
#[derive(Debug)]
pub struct MergeResource {
    seq_files: Vec<Arc<Segment>>,
    unseq_files: Vec<Arc<Segment>>,
    readers: Mutex<ReaderCache>,
    writers: Mutex<HashMap<u64, Arc<Mutex<SegmentWriter>>>>,
    modifications: Mutex<HashMap<u64, Vec<Tombstone>>>,
    catalogue: Arc<dyn Catalogue>,
    listener: Arc<dyn MergeEventListener>,
    temp_suffix: &'static str,
}

impl MergeResource {
    /// Builds the working set from candidate lists. A segment participates
    /// only if it is sealed, not deleted, and its newest data is past the
    /// retention horizon.
    pub fn new(
        seq_candidates: Vec<Arc<Segment>>,
        unseq_candidates: Vec<Arc<Segment>>,
        catalogue: Arc<dyn Catalogue>,
        listener: Arc<dyn MergeEventListener>,
        temp_suffix: &'static str,
        time_lower_bound: Timestamp,
        reader_cache_cap: usize,
    ) -> Self {
        let eligible = |s: &Arc<Segment>| {
            s.is_sealed()
                && !s.is_deleted()
                && s.max_end_time().map(|t| t > time_lower_bound).unwrap_or(false)
        };
        Self {
            seq_files: seq_candidates.into_iter().filter(|s| eligible(s)).collect(),
            unseq_files: unseq_candidates.into_iter().filter(|s| eligible(s)).collect(),
            readers: Mutex::new(ReaderCache::new(reader_cache_cap)),
            writers: Mutex::new(HashMap::new()),
            modifications: Mutex::new(HashMap::new()),
            catalogue,
            listener,
            temp_suffix,
        }
    }

    pub fn seq_files(&self) -> &[Arc<Segment>] {
        &self.seq_files
    }

    pub fn unseq_files(&self) -> &[Arc<Segment>] {
        &self.unseq_files
    }

    pub fn catalogue(&self) -> &Arc<dyn Catalogue> {
        &self.catalogue
    }

    pub fn data_type(&self, series: &SeriesPath) -> Result<DataType, MergeError> {
        self.catalogue.data_type(series)
    }

    /// Narrows the working set to the selector's choice and drops readers of
    /// files that fell out of it.
    pub fn set_files(
        &mut self,
        seq: Vec<Arc<Segment>>,
        unseq: Vec<Arc<Segment>>,
    ) -> Result<(), MergeError> {
        self.seq_files = seq;
        self.unseq_files = unseq;
        let keep: Vec<u64> = self
            .seq_files
            .iter()
            .chain(self.unseq_files.iter())
            .map(|s| s.id())
            .collect();
        let mut cache = self.readers.lock()?;
        let stale: Vec<u64> = cache
            .readers
            .keys()
            .copied()
            .filter(|id| !keep.contains(id))
            .collect();
        for id in stale {
            cache.remove(id);
        }
        Ok(())
    }

    /// Opens (or returns the cached) reader of a segment.
    pub fn reader(&self, segment: &Segment) -> Result<Arc<SegmentReader>, MergeError> {
        self.readers.lock()?.get_or_open(segment)
    }

    /// Closes and forgets the reader of a segment (must precede any rename).
    pub fn remove_reader(&self, segment: &Segment) -> Result<(), MergeError> {
        self.readers.lock()?.remove(segment.id());
        Ok(())
    }

    /// Returns the temp-file writer of a sequence segment, creating
    /// `<path><suffix>` on first call. Idempotent per segment.
    pub fn temp_writer(
        &self,
        segment: &Segment,
    ) -> Result<Arc<Mutex<SegmentWriter>>, MergeError> {
        let mut writers = self.writers.lock()?;
        if let Some(writer) = writers.get(&segment.id()) {
            return Ok(writer.clone());
        }
        let path = sidecar_path(&segment.path(), self.temp_suffix);
        let writer = Arc::new(Mutex::new(SegmentWriter::create(path)?));
        writers.insert(segment.id(), writer.clone());
        Ok(writer)
    }

    /// The temp writer, if one was ever created for this segment.
    pub fn existing_temp_writer(
        &self,
        segment: &Segment,
    ) -> Result<Option<Arc<Mutex<SegmentWriter>>>, MergeError> {
        Ok(self.writers.lock()?.get(&segment.id()).cloned())
    }

    /// Detaches the temp writer for sealing/consumption by the committer.
    pub fn take_temp_writer(
        &self,
        segment: &Segment,
    ) -> Result<Option<Arc<Mutex<SegmentWriter>>>, MergeError> {
        Ok(self.writers.lock()?.remove(&segment.id()))
    }

    /// Removes the temp writer of a segment and deletes its file.
    pub fn remove_file_and_writer(&self, segment: &Segment) -> Result<(), MergeError> {
        let writer = self.writers.lock()?.remove(&segment.id());
        if let Some(writer) = writer {
            match Arc::try_unwrap(writer) {
                Ok(inner) => inner.into_inner()?.abort()?,
                Err(shared) => {
                    // Writer still referenced elsewhere; delete by path.
                    let path = shared.lock()?.path().to_path_buf();
                    drop(shared);
                    if path.exists() {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Chunk metadata of one series in one segment. Deliberately not cached;
    /// each series is visited once per merge.
    pub fn chunk_metadata(
        &self,
        series: &SeriesPath,
        segment: &Segment,
    ) -> Result<Vec<ChunkMetadata>, MergeError> {
        Ok(self.reader(segment)?.chunk_metadata(series))
    }

    /// Tombstones applicable to `series` in `segment`, removed from the
    /// in-memory cache on return. A series is visited at most once per merge,
    /// so a second call for the same pair returns empty.
    pub fn modifications(
        &self,
        segment: &Segment,
        series: &SeriesPath,
    ) -> Result<Vec<Tombstone>, MergeError> {
        use std::collections::hash_map::Entry;
        let mut cache = self.modifications.lock()?;
        let all = match cache.entry(segment.id()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(segment.read_tombstones()?),
        };
        let mut matching = Vec::new();
        all.retain(|t| {
            if t.path == *series {
                matching.push(t.clone());
                false
            } else {
                true
            }
        });
        Ok(matching)
    }

    /// Constructs one ordered unsequence point stream per series in the batch.
    pub fn unseq_readers(
        &self,
        batch: &[SeriesPath],
    ) -> Result<Vec<UnseqPointReader>, MergeError> {
        let mut readers = Vec::with_capacity(batch.len());
        for series in batch {
            readers.push(UnseqPointReader::build(series, self)?);
        }
        Ok(readers)
    }

    pub(crate) fn report_corrupt_chunk(&self, meta: &ChunkMetadata, path: std::path::PathBuf) {
        self.listener.on_event(MergeEvent::CorruptChunkSkipped {
            path,
            series: meta.series.to_string(),
            offset: meta.offset,
        });
    }

    /// Closes all cached readers and writers. Idempotent; close errors are
    /// reported through the event listener and suppressed so cleanup runs to
    /// completion.
    pub fn release(&self) {
        match self.readers.lock() {
            Ok(mut cache) => cache.clear(),
            Err(e) => self.listener.on_event(MergeEvent::ResourceCloseFailed {
                error: e.to_string(),
            }),
        }
        match self.writers.lock() {
            Ok(mut writers) => writers.clear(),
            Err(e) => self.listener.on_event(MergeEvent::ResourceCloseFailed {
                error: e.to_string(),
            }),
        }
        if let Ok(mut mods) = self.modifications.lock() {
            mods.clear();
        }
    }
}

/// Per-run mutable aggregate: which chunks each sequence file kept unmerged,
/// how many chunks went each way, and write totals. Owned by one merge task
/// and discarded at its end.
#[derive(Debug, Default)]
pub struct MergeContext {
    unmerged_chunk_start_times: Mutex<HashMap<u64, HashMap<SeriesPath, Vec<Timestamp>>>>,
    merged_chunk_count: Mutex<HashMap<u64, u64>>,
    unmerged_chunk_count: Mutex<HashMap<u64, u64>>,
    total_points_written: AtomicU64,
    total_chunks_written: AtomicU64,
}

impl MergeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_file(&self, segment_id: u64) -> Result<(), MergeError> {
        self.unmerged_chunk_start_times
            .lock()?
            .entry(segment_id)
            .or_default();
        Ok(())
    }

    pub fn record_unmerged_chunk(
        &self,
        segment_id: u64,
        series: &SeriesPath,
        start_time: Timestamp,
    ) -> Result<(), MergeError> {
        self.unmerged_chunk_start_times
            .lock()?
            .entry(segment_id)
            .or_default()
            .entry(series.clone())
            .or_default()
            .push(start_time);
        Ok(())
    }

    pub fn unmerged_start_times(
        &self,
        segment_id: u64,
    ) -> Result<HashMap<SeriesPath, Vec<Timestamp>>, MergeError> {
        Ok(self
            .unmerged_chunk_start_times
            .lock()?
            .get(&segment_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn add_merged_chunks(&self, segment_id: u64, n: u64) -> Result<(), MergeError> {
        *self.merged_chunk_count.lock()?.entry(segment_id).or_insert(0) += n;
        Ok(())
    }

    pub fn add_unmerged_chunks(&self, segment_id: u64, n: u64) -> Result<(), MergeError> {
        *self.unmerged_chunk_count.lock()?.entry(segment_id).or_insert(0) += n;
        Ok(())
    }

    pub fn merged_chunks(&self, segment_id: u64) -> u64 {
        self.merged_chunk_count
            .lock()
            .map(|m| m.get(&segment_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn unmerged_chunks(&self, segment_id: u64) -> u64 {
        self.unmerged_chunk_count
            .lock()
            .map(|m| m.get(&segment_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn inc_points_written(&self, n: u64) {
        self.total_points_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_chunks_written(&self) {
        self.total_chunks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_points_written(&self) -> u64 {
        self.total_points_written.load(Ordering::Relaxed)
    }

    pub fn total_chunks_written(&self) -> u64 {
        self.total_chunks_written.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        if let Ok(mut m) = self.unmerged_chunk_start_times.lock() {
            m.clear();
        }
        if let Ok(mut m) = self.merged_chunk_count.lock() {
            m.clear();
        }
        if let Ok(mut m) = self.unmerged_chunk_count.lock() {
            m.clear();
        }
    }
}
