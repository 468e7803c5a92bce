//! Inplace commit: swap each sequence file with its merge output.
//!
//! For every sequence file of the working set the committer picks the cheaper
//! direction: if at least as many chunks were merged as were left in place,
//! the unmerged chunks are appended to the temp file and the temp file
//! replaces the original; otherwise the original is truncated back to its
//! data end and the merged chunks are appended to it. Either way the chosen
//! branch is journaled before the first destructive byte, and the successor
//! file takes the next merge-generation name.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::MergeError;
use crate::format::{sealed_data_end, SegmentReader, SegmentWriter};
use crate::journal::{CommitMode, JournalEntry, MergeJournal};
use crate::resource::{MergeContext, MergeResource};
use crate::segment::{sync_dir, Segment};
use crate::telemetry::{MergeEvent, MergeEventListener};

#[derive(Debug)]
pub struct FileCommitter<'a> {
    pub resource: &'a MergeResource,
    pub context: &'a MergeContext,
    pub journal: &'a Mutex<MergeJournal>,
    pub listener: &'a Arc<dyn MergeEventListener>,
    pub cancel: &'a AtomicBool,
}

impl<'a> FileCommitter<'a> {
    /// Commits every sequence file, then journals `MergeEnd`.
    pub fn commit_files(&self) -> Result<(), MergeError> {
        for seq in self.resource.seq_files().to_vec() {
            // File boundary is the cancellation point: a started file commit
            // always runs to its journaled end.
            if self.cancel.load(Ordering::Relaxed) {
                return Err(MergeError::Cancelled);
            }

            let merged = self.context.merged_chunks(seq.id());
            let unmerged = self.context.unmerged_chunks(seq.id());
            if merged == 0 && unmerged == 0 {
                // Nothing of this file participated; drop its temp output.
                self.resource.remove_file_and_writer(&seq)?;
                continue;
            }

            self.listener.on_event(MergeEvent::FileCommitStarted {
                path: seq.path(),
                merged_chunks: merged,
                unmerged_chunks: unmerged,
            });
            if merged >= unmerged {
                self.move_unmerged_to_new(&seq)?;
            } else {
                self.move_merged_to_old(&seq)?;
            }
            self.listener.on_event(MergeEvent::FileCommitted { path: seq.path() });
        }

        self.journal.lock()?.log(&JournalEntry::MergeEnd)?;
        Ok(())
    }

    /// Appends the unmerged chunks to the temp file, seals it, and atomically
    /// replaces the original with it under the successor name.
    fn move_unmerged_to_new(&self, seq: &Arc<Segment>) -> Result<(), MergeError> {
        let writer = self.resource.temp_writer(seq)?;

        self.journal.lock()?.log(&JournalEntry::FileMergeStart {
            file: seq.path(),
            truncate_pos: 0,
            mode: CommitMode::MoveUnmergedToNew,
        })?;

        if self.context.unmerged_chunks(seq.id()) > 0 {
            let start_times = self.context.unmerged_start_times(seq.id())?;
            let mut by_series: Vec<_> = start_times.into_iter().collect();
            by_series.sort_by(|a, b| a.0.cmp(&b.0));

            let reader = self.resource.reader(seq)?;
            for (series, times) in by_series {
                if times.is_empty() {
                    continue;
                }
                let metas = reader.chunk_metadata(&series);
                let mut w = writer.lock()?;
                let mut chunk_idx = 0;
                for start in times {
                    while chunk_idx < metas.len() {
                        let meta = &metas[chunk_idx];
                        chunk_idx += 1;
                        if meta.start_time == start {
                            let chunk = reader.read_chunk(meta)?;
                            w.append_raw(&chunk)?;
                            self.context.inc_points_written(meta.point_count as u64);
                            break;
                        }
                    }
                }
            }
        }

        drop(writer);
        let writer = self
            .resource
            .take_temp_writer(seq)?
            .ok_or_else(|| MergeError::Internal("temp writer vanished before commit".to_string()))?;
        let writer = Arc::try_unwrap(writer).map_err(|_| {
            MergeError::Internal("temp writer still shared at commit time".to_string())
        })?;
        let writer = writer.into_inner()?;
        let temp_path = writer.path().to_path_buf();
        let sealed_descriptor = writer.seal()?;

        self.update_ancestors(seq);
        seq.update_descriptor(|d| d.device_ranges = sealed_descriptor.device_ranges.clone());

        self.journal.lock()?.log(&JournalEntry::FileMergeEnd)?;

        // Swap: readers of the old file are closed before the rename, so
        // concurrent readers see either the old view or the new, never a mix.
        self.resource.remove_reader(seq)?;
        let old_path = seq.path();
        fs::remove_file(&old_path)?;
        let next = seq.name().next_merge();
        let new_path = old_path.with_file_name(next.file_name());
        fs::rename(&temp_path, &new_path)?;
        if let Some(dir) = new_path.parent() {
            sync_dir(dir)?;
        }
        seq.adopt_replacement(new_path, next)?;
        Ok(())
    }

    /// Truncates the original back to its data end, appends the merged chunks
    /// from the temp file, and re-seals it under the successor name.
    fn move_merged_to_old(&self, seq: &Arc<Segment>) -> Result<(), MergeError> {
        if self.context.merged_chunks(seq.id()) == 0 {
            self.resource.remove_file_and_writer(seq)?;
            return Ok(());
        }

        let temp = self.resource.take_temp_writer(seq)?.ok_or_else(|| {
            MergeError::InconsistentState(format!(
                "merged chunks recorded for {} but no temp writer exists",
                seq.path().display()
            ))
        })?;
        let temp = Arc::try_unwrap(temp).map_err(|_| {
            MergeError::Internal("temp writer still shared at commit time".to_string())
        })?;
        let temp = temp.into_inner()?;
        let temp_path = temp.path().to_path_buf();
        temp.seal()?;

        // Readers of the file must be gone before it is mutated.
        self.resource.remove_reader(seq)?;

        let truncate_pos = sealed_data_end(&seq.path())?;
        self.journal.lock()?.log(&JournalEntry::FileMergeStart {
            file: seq.path(),
            truncate_pos,
            mode: CommitMode::MoveMergedToOld,
        })?;

        let (mut old_writer, _) = SegmentWriter::force_append(&seq.path())?;
        // Chunks that were rewritten into the temp file disappear from the
        // index; their bytes stay behind as unreachable dead space.
        let keep = self.context.unmerged_start_times(seq.id())?;
        old_writer.retain_chunks(&keep);

        let temp_reader = SegmentReader::open(&temp_path)?;
        for series in temp_reader.all_series() {
            for meta in temp_reader.chunk_metadata(&series) {
                let chunk = temp_reader.read_chunk(&meta)?;
                old_writer.append_raw(&chunk)?;
            }
        }
        drop(temp_reader);

        let sealed_descriptor = old_writer.seal()?;
        self.update_ancestors(seq);
        seq.update_descriptor(|d| d.device_ranges = sealed_descriptor.device_ranges.clone());

        self.journal.lock()?.log(&JournalEntry::FileMergeEnd)?;

        fs::remove_file(&temp_path)?;
        seq.rename_to(seq.name().next_merge())?;
        Ok(())
    }

    /// The committed file absorbs data from every unsequence input, so their
    /// ancestor generations all flow into its set (ancestor sets only grow).
    fn update_ancestors(&self, seq: &Arc<Segment>) {
        let mut incoming: Vec<i64> = Vec::new();
        for unseq in self.resource.unseq_files() {
            let d = unseq.descriptor();
            incoming.extend(d.ancestors.iter().copied());
            incoming.push(unseq.name().generation);
        }
        seq.update_descriptor(|d| d.ancestors.extend(incoming.iter().copied()));
    }
}
