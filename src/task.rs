//! One merge task: `PLAN → READ → WRITE → COMMIT → DONE`, with `ABORT`
//! reachable from any non-terminal state. Only the commit phase performs
//! destructive renames; an abort before it rolls back by deleting temp files
//! and the journal, an abort inside it leaves the journal for startup
//! recovery to finish or undo the half-done swap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::catalogue::Catalogue;
use crate::chunk_merge::{ChunkMerger, MergeOutputMode};
use crate::commit::FileCommitter;
use crate::config::MergeConfig;
use crate::error::MergeError;
use crate::journal::{JournalEntry, MergeJournal};
use crate::resource::{MergeContext, MergeResource};
use crate::segment::{sidecar_path, Segment, SegmentName, INPLACE_MERGE_SUFFIX};
use crate::squeeze::{retire_input, SqueezeMerger};
use crate::telemetry::{merge_metrics, MergeEvent};
use crate::types::SeriesPath;

/// Explicit environment threaded through the merge call chain instead of
/// ambient singletons.
#[derive(Debug)]
pub struct MergeEnv {
    pub config: MergeConfig,
    pub catalogue: Arc<dyn Catalogue>,
    /// Storage-group system directory holding the merge journal.
    pub sys_dir: PathBuf,
}

/// Observable exit code of a merge task.
#[derive(Debug)]
pub enum MergeOutcome {
    Success { new_files: Vec<PathBuf> },
    /// Retry next cycle.
    TransientFailure(String),
    /// Requires operator intervention.
    FatalFailure(String),
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MergeOutcome::Success { .. })
    }
}

/// Everything the submitter learns when a task finishes.
#[derive(Debug)]
pub struct MergeReport {
    pub task_name: String,
    pub outcome: MergeOutcome,
    pub seq_files: Vec<Arc<Segment>>,
    pub unseq_files: Vec<Arc<Segment>>,
    /// Squeeze outputs; empty for inplace commits (inputs were updated).
    pub new_segments: Vec<Arc<Segment>>,
    pub points_written: u64,
    pub chunks_written: u64,
}

pub type MergeCallback = Box<dyn FnOnce(MergeReport) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskPhase {
    Plan,
    Read,
    Write,
    Commit,
    Done,
}

/// A planned merge over an already-selected, already-reserved working set.
pub struct MergeTask {
    pub env: Arc<MergeEnv>,
    pub resource: MergeResource,
    pub task_name: String,
    pub full_merge: bool,
    pub squeeze: bool,
    pub concurrent_merge_series_num: usize,
    /// Partition directory receiving a squeeze output.
    pub output_dir: PathBuf,
    /// Pinned output name (level promotion); `None` derives the squeeze name.
    pub output_name: Option<SegmentName>,
    /// Series to merge, grouped by device in catalogue order.
    pub series: Vec<SeriesPath>,
    pub cancel: Arc<AtomicBool>,
}

impl MergeTask {
    /// Runs the task to completion on the calling thread, fanning chunk work
    /// out over `pool`. Never panics across the boundary; all failures fold
    /// into the returned report.
    pub fn run(mut self, pool: &rayon::ThreadPool) -> MergeReport {
        let listener = self.env.config.event_listener.clone();
        listener.on_event(MergeEvent::MergeTaskStarted {
            task: self.task_name.clone(),
            seq_files: self.resource.seq_files().len(),
            unseq_files: self.resource.unseq_files().len(),
        });
        let started = Instant::now();
        let context = MergeContext::new();

        let mut phase = TaskPhase::Plan;
        let result = self.do_merge(pool, &context, &mut phase);
        let outcome = match result {
            Ok(new_segments) => {
                merge_metrics::record_merge_duration(started.elapsed());
                merge_metrics::record_points_written(context.total_points_written());
                merge_metrics::record_chunks_written(context.total_chunks_written());
                listener.on_event(MergeEvent::MergeTaskFinished {
                    task: self.task_name.clone(),
                    points_written: context.total_points_written(),
                    chunks_written: context.total_chunks_written(),
                });
                self.cleanup(phase, true);
                let new_files = new_segments.iter().map(|s| s.path()).collect();
                return MergeReport {
                    task_name: self.task_name,
                    outcome: MergeOutcome::Success { new_files },
                    seq_files: self.resource.seq_files().to_vec(),
                    unseq_files: self.resource.unseq_files().to_vec(),
                    new_segments,
                    points_written: context.total_points_written(),
                    chunks_written: context.total_chunks_written(),
                };
            }
            Err(MergeError::Cancelled) => {
                listener.on_event(MergeEvent::MergeTaskCancelled {
                    task: self.task_name.clone(),
                });
                MergeOutcome::TransientFailure("cancelled".to_string())
            }
            Err(e) => {
                merge_metrics::record_merge_failed();
                let fatal = !e.is_transient();
                listener.on_event(MergeEvent::MergeTaskFailed {
                    task: self.task_name.clone(),
                    error: e.to_string(),
                    fatal,
                });
                if fatal {
                    MergeOutcome::FatalFailure(e.to_string())
                } else {
                    MergeOutcome::TransientFailure(e.to_string())
                }
            }
        };

        self.cleanup(phase, false);
        MergeReport {
            task_name: self.task_name,
            outcome,
            seq_files: self.resource.seq_files().to_vec(),
            unseq_files: self.resource.unseq_files().to_vec(),
            new_segments: Vec::new(),
            points_written: context.total_points_written(),
            chunks_written: context.total_chunks_written(),
        }
    }

    fn do_merge(
        &mut self,
        pool: &rayon::ThreadPool,
        context: &MergeContext,
        phase: &mut TaskPhase,
    ) -> Result<Vec<Arc<Segment>>, MergeError> {
        let config = &self.env.config;
        let journal = Mutex::new(MergeJournal::create(&self.env.sys_dir, self.squeeze)?);
        journal.lock()?.log(&JournalEntry::Files {
            seq: self.resource.seq_files().iter().map(|s| s.path()).collect(),
            unseq: self.resource.unseq_files().iter().map(|s| s.path()).collect(),
        })?;
        journal.lock()?.log(&JournalEntry::MergeStart)?;

        *phase = TaskPhase::Read;
        let cancel_result: Result<Vec<Arc<Segment>>, MergeError> = if self.squeeze {
            *phase = TaskPhase::Write;
            let merger = SqueezeMerger {
                resource: &self.resource,
                context,
                journal: &journal,
                pool,
                listener: &config.event_listener,
                min_chunk_point_num: config.chunk_merge_point_threshold,
                sub_task_num: config.merge_chunk_sub_thread_num,
                concurrent_merge_series_num: self.concurrent_merge_series_num,
                cancel: &self.cancel,
            };
            let output = merger.merge(&self.series, &self.output_dir, self.output_name)?;

            *phase = TaskPhase::Commit;
            // Inputs are retired only now that NewFile is durable.
            for input in self
                .resource
                .seq_files()
                .iter()
                .chain(self.resource.unseq_files().iter())
            {
                retire_input(input)?;
            }
            journal.lock()?.log(&JournalEntry::MergeEnd)?;
            Ok(vec![output])
        } else {
            *phase = TaskPhase::Write;
            let merger = ChunkMerger {
                resource: &self.resource,
                context,
                journal: &journal,
                pool,
                output: MergeOutputMode::PerSeqFile,
                full_merge: self.full_merge,
                min_chunk_point_num: config.chunk_merge_point_threshold,
                sub_task_num: config.merge_chunk_sub_thread_num,
                concurrent_merge_series_num: self.concurrent_merge_series_num,
                cancel: &self.cancel,
            };
            merger.merge_series(&self.series)?;

            *phase = TaskPhase::Commit;
            let committer = FileCommitter {
                resource: &self.resource,
                context,
                journal: &journal,
                listener: &config.event_listener,
                cancel: &self.cancel,
            };
            committer.commit_files()?;

            // The sequence files absorbed the unsequence population; retire
            // it. With no sequence files nothing absorbed anything, so the
            // unsequence inputs stay.
            if !self.resource.seq_files().is_empty() {
                for unseq in self.resource.unseq_files() {
                    retire_input(unseq)?;
                }
            }
            Ok(Vec::new())
        };

        let outputs = match cancel_result {
            Ok(outputs) => outputs,
            Err(MergeError::Cancelled) => {
                // Journal the cancellation so a crash during cleanup still
                // rolls back at the next startup.
                journal.lock()?.log(&JournalEntry::Cancel)?;
                return Err(MergeError::Cancelled);
            }
            Err(e) => return Err(e),
        };

        *phase = TaskPhase::Done;
        let journal = journal.into_inner()?;
        journal.close_and_delete()?;
        Ok(outputs)
    }

    /// Deletes temp outputs, releases reservations, and (when the failure
    /// happened before the destructive phase) removes the journal. A failure
    /// inside COMMIT keeps the journal so startup recovery can finish or undo
    /// the half-done swap.
    fn cleanup(&mut self, phase: TaskPhase, success: bool) {
        let listener = self.env.config.event_listener.clone();
        self.resource.release();

        for seq in self.resource.seq_files() {
            let temp = sidecar_path(&seq.path(), INPLACE_MERGE_SUFFIX);
            if !success && temp.exists() {
                if let Err(e) = std::fs::remove_file(&temp) {
                    listener.on_event(MergeEvent::ResourceCloseFailed { error: e.to_string() });
                }
            }
            seq.release_reservation();
        }
        for unseq in self.resource.unseq_files() {
            unseq.release_reservation();
        }
        if !success {
            let journal_path =
                crate::journal::journal_path(&self.env.sys_dir, self.squeeze);
            let keep_journal = phase == TaskPhase::Commit;
            if !keep_journal && journal_path.exists() {
                if let Err(e) = std::fs::remove_file(&journal_path) {
                    listener.on_event(MergeEvent::ResourceCloseFailed { error: e.to_string() });
                }
            }
        }
    }
}
