//! Squeeze commit: one brand-new output segment for the whole working set.
//!
//! The chunk kernel runs in single-output, full-merge mode (nothing may stay
//! behind in the inputs), the output is built under a `.merge.squeeze` suffix
//! and renamed on commit. Inputs are retired by the task only after the
//! journal records the final path durably.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk_merge::{ChunkMerger, MergeOutputMode};
use crate::error::MergeError;
use crate::format::SegmentWriter;
use crate::journal::{JournalEntry, MergeJournal};
use crate::resource::{MergeContext, MergeResource};
use crate::segment::{
    sidecar_path, sync_dir, write_descriptor_atomic, Segment, SegmentName, RESOURCE_SUFFIX,
    SQUEEZE_MERGE_SUFFIX,
};
use crate::telemetry::{MergeEvent, MergeEventListener};
use crate::types::SeriesPath;

#[derive(Debug)]
pub struct SqueezeMerger<'a> {
    pub resource: &'a MergeResource,
    pub context: &'a MergeContext,
    pub journal: &'a Mutex<MergeJournal>,
    pub pool: &'a rayon::ThreadPool,
    pub listener: &'a Arc<dyn MergeEventListener>,
    pub min_chunk_point_num: i64,
    pub sub_task_num: usize,
    pub concurrent_merge_series_num: usize,
    pub cancel: &'a AtomicBool,
}

impl<'a> SqueezeMerger<'a> {
    /// Runs the kernel into a single output under `output_dir` and commits it.
    /// `name_override` pins the output name (level promotion); otherwise the
    /// name is `{now}-{min input version}-{max input mergeN + 1}`.
    pub fn merge(
        &self,
        series: &[SeriesPath],
        output_dir: &Path,
        name_override: Option<SegmentName>,
    ) -> Result<Arc<Segment>, MergeError> {
        let name = name_override.unwrap_or_else(|| self.output_name());
        let final_path = output_dir.join(name.file_name());
        let temp_path = sidecar_path(&final_path, SQUEEZE_MERGE_SUFFIX);

        let writer = Arc::new(Mutex::new(SegmentWriter::create(&temp_path)?));
        let merger = ChunkMerger {
            resource: self.resource,
            context: self.context,
            journal: self.journal,
            pool: self.pool,
            output: MergeOutputMode::Single(writer.clone()),
            // everything must land in the new file, so the skip case is off
            full_merge: true,
            min_chunk_point_num: self.min_chunk_point_num,
            sub_task_num: self.sub_task_num,
            concurrent_merge_series_num: self.concurrent_merge_series_num,
            cancel: self.cancel,
        };
        if let Err(e) = merger.merge_series(series) {
            drop(merger);
            if let Ok(mutex) = Arc::try_unwrap(writer) {
                if let Ok(w) = mutex.into_inner() {
                    let _ = w.abort();
                }
            }
            return Err(e);
        }
        drop(merger);

        let writer = Arc::try_unwrap(writer).map_err(|_| {
            MergeError::Internal("squeeze writer still shared after kernel".to_string())
        })?;
        let writer = writer.into_inner()?;
        let mut descriptor = writer.seal()?;

        // The output holds data from every input, so every ancestor flows in.
        for input in self
            .resource
            .seq_files()
            .iter()
            .chain(self.resource.unseq_files().iter())
        {
            let d = input.descriptor();
            descriptor.ancestors.extend(d.ancestors.iter().copied());
            descriptor.ancestors.insert(input.name().generation);
        }
        descriptor.ancestors.insert(name.generation);

        // The final path is journaled durably before the rename; recovery can
        // then either finish the promotion or retire leftover inputs.
        self.journal
            .lock()?
            .log(&JournalEntry::NewFile { path: final_path.clone() })?;

        std::fs::rename(&temp_path, &final_path)?;
        write_descriptor_atomic(&sidecar_path(&final_path, RESOURCE_SUFFIX), &descriptor)?;
        if let Some(dir) = final_path.parent() {
            sync_dir(dir)?;
        }

        self.listener
            .on_event(MergeEvent::SqueezeOutputInstalled { path: final_path.clone() });
        Ok(Arc::new(Segment::open(&final_path)?))
    }

    fn output_name(&self) -> SegmentName {
        let inputs = || {
            self.resource
                .seq_files()
                .iter()
                .chain(self.resource.unseq_files().iter())
        };
        let min_version = inputs().map(|s| s.name().version).min().unwrap_or(0);
        let max_merge = inputs().map(|s| s.name().merge_count).max().unwrap_or(0);
        SegmentName::new(now_ms(), min_version, max_merge + 1)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Retires a consumed input after the output is durable: removes the file and
/// its sidecars, releasing the reservation.
pub(crate) fn retire_input(segment: &Segment) -> Result<(), MergeError> {
    segment.delete_from_disk()?;
    segment.release_reservation();
    Ok(())
}
