use std::sync::Arc;
use std::time::Duration;

use crate::telemetry::{noop_event_listener, MergeEventListener};
use crate::types::Timestamp;

/// How a sequence-population merge commits its output.
///
/// `Inplace*` back-patches merged chunks into the input files (or swaps an
/// input for its temp file, whichever moves less data). `Squeeze*` writes one
/// brand-new file containing the union of all inputs. The `MaxFiles` /
/// `MaxSeries` suffix picks the file-selection optimization target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqMergeFileStrategy {
    InplaceMaxFiles,
    InplaceMaxSeries,
    SqueezeMaxFiles,
    SqueezeMaxSeries,
    SimpleMaxFiles,
}

impl SeqMergeFileStrategy {
    /// Whether this strategy commits through the single-output squeeze path.
    pub fn is_squeeze(self) -> bool {
        matches!(
            self,
            SeqMergeFileStrategy::SqueezeMaxFiles
                | SeqMergeFileStrategy::SqueezeMaxSeries
                | SeqMergeFileStrategy::SimpleMaxFiles
        )
    }

    /// Whether selection should maximize concurrently merged series instead of files.
    pub fn is_max_series(self) -> bool {
        matches!(
            self,
            SeqMergeFileStrategy::InplaceMaxSeries | SeqMergeFileStrategy::SqueezeMaxSeries
        )
    }
}

/// Commit strategy for size-driven compaction (level promotion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeMergeFileStrategy {
    SimpleMaxFiles,
}

/// Selection optimization target for size-driven compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSelectorStrategy {
    MaxFiles,
    MaxSeries,
}

/// Configuration options for the merge engine.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Number of top-level merge worker threads; clamped to at least 1.
    pub merge_thread_num: usize,
    /// Chunk-merge sub-workers available to each task.
    pub merge_chunk_sub_thread_num: usize,
    /// Number of series merged concurrently within one task.
    pub concurrent_merge_series_num: usize,
    /// Memory budget in bytes for file selection.
    pub merge_memory_budget: u64,
    /// Wall-clock cap on file selection.
    pub merge_file_selection_time_budget: Duration,
    /// Minimum chunk size considered "big enough" to copy verbatim; `-1`
    /// disables the check. Also the flush threshold for the in-memory chunk
    /// writer (`min_chunk_point_num`).
    pub chunk_merge_point_threshold: i64,
    /// Commit strategy for sequence merges.
    pub seq_merge_file_strategy: SeqMergeFileStrategy,
    /// Commit strategy for size-driven compaction.
    pub size_merge_file_strategy: SizeMergeFileStrategy,
    /// Selection target for size-driven compaction.
    pub merge_size_selector_strategy: SizeSelectorStrategy,
    /// If true, the chunk merger never leaves chunks unmerged (the "Skip" case
    /// is disabled).
    pub force_full_merge: bool,
    /// Whether startup recovery re-submits a rolled-back mid-flight merge.
    pub continue_merge_after_reboot: bool,
    /// Poll interval of the background leveled compactor.
    pub merge_interval: Duration,
    /// Number of sequence levels.
    pub seq_level_num: usize,
    /// Number of unsequence levels.
    pub unseq_level_num: usize,
    /// Files per sequence level before promotion triggers.
    pub seq_file_num_in_each_level: usize,
    /// Files per unsequence level before promotion triggers.
    pub unseq_file_num_in_each_level: usize,
    /// Whether unsequence data is ever merged into the sequence population at
    /// the level boundary.
    pub enable_unseq_compaction: bool,
    /// Retention horizon: segments whose newest data is at or below this bound
    /// are never selected. `i64::MIN` disables the filter.
    pub time_lower_bound: Timestamp,
    /// Cap on concurrently open segment readers per merge (LRU-evicted beyond).
    pub reader_cache_cap: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn MergeEventListener>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            merge_thread_num: 1,
            merge_chunk_sub_thread_num: 4,
            concurrent_merge_series_num: 1,
            merge_memory_budget: 2 * 1024 * 1024 * 1024,
            merge_file_selection_time_budget: Duration::from_secs(30),
            chunk_merge_point_threshold: 100_000,
            seq_merge_file_strategy: SeqMergeFileStrategy::InplaceMaxFiles,
            size_merge_file_strategy: SizeMergeFileStrategy::SimpleMaxFiles,
            merge_size_selector_strategy: SizeSelectorStrategy::MaxFiles,
            force_full_merge: false,
            continue_merge_after_reboot: false,
            merge_interval: Duration::from_secs(2),
            seq_level_num: 2,
            unseq_level_num: 1,
            seq_file_num_in_each_level: 4,
            unseq_file_num_in_each_level: 4,
            enable_unseq_compaction: true,
            time_lower_bound: i64::MIN,
            reader_cache_cap: 64,
            event_listener: noop_event_listener(),
        }
    }
}

impl MergeConfig {
    /// Normalizes nonsensical values the way the engine expects them: thread
    /// counts and level shapes are clamped to at least 1.
    pub fn sanitized(mut self) -> Self {
        self.merge_thread_num = self.merge_thread_num.max(1);
        self.merge_chunk_sub_thread_num = self.merge_chunk_sub_thread_num.max(1);
        self.concurrent_merge_series_num = self.concurrent_merge_series_num.max(1);
        self.seq_level_num = self.seq_level_num.max(1);
        self.unseq_level_num = self.unseq_level_num.max(1);
        self.seq_file_num_in_each_level = self.seq_file_num_in_each_level.max(1);
        self.unseq_file_num_in_each_level = self.unseq_file_num_in_each_level.max(1);
        self.reader_cache_cap = self.reader_cache_cap.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_zeroes() {
        let cfg = MergeConfig {
            merge_thread_num: 0,
            merge_chunk_sub_thread_num: 0,
            seq_level_num: 0,
            ..MergeConfig::default()
        }
        .sanitized();
        assert_eq!(cfg.merge_thread_num, 1);
        assert_eq!(cfg.merge_chunk_sub_thread_num, 1);
        assert_eq!(cfg.seq_level_num, 1);
    }

    #[test]
    fn test_strategy_classification() {
        assert!(SeqMergeFileStrategy::SqueezeMaxFiles.is_squeeze());
        assert!(SeqMergeFileStrategy::SimpleMaxFiles.is_squeeze());
        assert!(!SeqMergeFileStrategy::InplaceMaxFiles.is_squeeze());
        assert!(SeqMergeFileStrategy::InplaceMaxSeries.is_max_series());
        assert!(!SeqMergeFileStrategy::SimpleMaxFiles.is_max_series());
    }
}
