//! Memory-bounded file selection.
//!
//! Walks the sequence population in filename order and greedily extends the
//! working set while the estimated memory cost stays under budget. Every
//! admitted sequence segment pulls in the unsequence segments overlapping it.
//! The "max series" variant wraps the same walk, shrinking the number of
//! concurrently merged series until a non-empty selection fits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::MergeError;
use crate::resource::MergeResource;
use crate::segment::Segment;
use crate::telemetry::{merge_metrics, MergeEvent, MergeEventListener};

/// The working set chosen for one merge task.
#[derive(Debug, Default)]
pub struct Selection {
    pub seq: Vec<Arc<Segment>>,
    pub unseq: Vec<Arc<Segment>>,
    /// Series merged concurrently within the task (1 for max-files mode).
    pub concurrent_merge_series_num: usize,
    /// Estimated memory cost of the selection in bytes.
    pub total_cost: u64,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

#[derive(Debug)]
pub struct FileSelector<'r> {
    resource: &'r MergeResource,
    memory_budget: u64,
    time_budget: Duration,
    tight_bound: bool,
    concurrent_merge_series_num: usize,
}

impl<'r> FileSelector<'r> {
    pub fn new(
        resource: &'r MergeResource,
        memory_budget: u64,
        time_budget: Duration,
        tight_bound: bool,
        concurrent_merge_series_num: usize,
    ) -> Self {
        Self {
            resource,
            memory_budget,
            time_budget,
            tight_bound,
            concurrent_merge_series_num: concurrent_merge_series_num.max(1),
        }
    }

    /// Maximizes the number of files merged in one pass. Returns an empty
    /// selection when not even one sequence segment fits the budget or the
    /// time budget elapsed first.
    pub fn select_max_files(
        &self,
        listener: &Arc<dyn MergeEventListener>,
    ) -> Result<Selection, MergeError> {
        let selection = self.select_scaled(1, 1, self.concurrent_merge_series_num)?;
        self.report(&selection, listener);
        Ok(selection)
    }

    /// Maximizes the number of series merged concurrently: starts from the
    /// full series count and halves it until the scaled working-set cost fits
    /// the budget.
    pub fn select_max_series(
        &self,
        listener: &Arc<dyn MergeEventListener>,
    ) -> Result<Selection, MergeError> {
        let total_series = self.resource.catalogue().all_series().len().max(1);
        let mut series_num = total_series;
        loop {
            let selection = self.select_scaled(series_num, total_series, series_num)?;
            if !selection.is_empty() || series_num == 1 {
                self.report(&selection, listener);
                return Ok(selection);
            }
            series_num /= 2;
        }
    }

    fn report(&self, selection: &Selection, listener: &Arc<dyn MergeEventListener>) {
        if selection.is_empty() {
            listener.on_event(MergeEvent::SelectionEmpty {
                reason: "no sequence segment fits the memory budget".to_string(),
            });
        } else {
            merge_metrics::record_selection_cost(selection.total_cost);
            listener.on_event(MergeEvent::SelectionCompleted {
                seq_selected: selection.seq.len(),
                unseq_selected: selection.unseq.len(),
                cost: selection.total_cost,
            });
        }
    }

    /// One greedy walk with every cost scaled by `scale_num / scale_den` (the
    /// fraction of series a pass would hold in memory at once).
    fn select_scaled(
        &self,
        scale_num: usize,
        scale_den: usize,
        concurrent_merge_series_num: usize,
    ) -> Result<Selection, MergeError> {
        let start = Instant::now();

        let mut seq_candidates: Vec<Arc<Segment>> = self
            .resource
            .seq_files()
            .iter()
            .filter(|s| !s.is_merging())
            .cloned()
            .collect();
        // Deterministic walk order regardless of how candidates were gathered.
        seq_candidates.sort_by_key(|s| (s.partition(), s.name()));

        let mut selected_seq: Vec<Arc<Segment>> = Vec::new();
        let mut selected_unseq: Vec<Arc<Segment>> = Vec::new();
        let mut selected_unseq_ids: HashSet<u64> = HashSet::new();

        let mut total_cost = 0u64;
        // Only one sequence file is read at a time, so the read cost of the
        // largest one is counted once.
        let mut max_seq_read_cost = 0u64;

        for seq in seq_candidates {
            if start.elapsed() >= self.time_budget {
                break;
            }

            let reader = self.resource.reader(&seq)?;
            let metadata_cost = scale(reader.metadata_size(), scale_num, scale_den);
            let read_cost = if self.tight_bound {
                scale(self.tight_seq_cost(&seq)?, scale_num, scale_den)
            } else {
                metadata_cost
            };
            let read_delta = read_cost.saturating_sub(max_seq_read_cost);

            // Unsequence segments overlapping this candidate and not selected yet.
            let seq_descriptor = seq.descriptor();
            let mut new_unseq: Vec<Arc<Segment>> = Vec::new();
            let mut unseq_cost = 0u64;
            for unseq in self.resource.unseq_files() {
                if unseq.is_merging() || selected_unseq_ids.contains(&unseq.id()) {
                    continue;
                }
                if unseq.descriptor().overlaps(&seq_descriptor) {
                    unseq_cost += scale(self.unseq_cost(unseq)?, scale_num, scale_den);
                    new_unseq.push(unseq.clone());
                }
            }

            let added = metadata_cost + read_delta + unseq_cost;
            if total_cost + added >= self.memory_budget {
                break;
            }

            total_cost += added;
            max_seq_read_cost = max_seq_read_cost.max(read_cost);
            for unseq in new_unseq {
                selected_unseq_ids.insert(unseq.id());
                selected_unseq.push(unseq);
            }
            selected_seq.push(seq);
        }

        Ok(Selection {
            seq: selected_seq,
            unseq: selected_unseq,
            concurrent_merge_series_num,
            total_cost,
        })
    }

    /// Tight read-cost bound: the index bytes of every series actually present
    /// plus the largest single chunk the pass would buffer.
    fn tight_seq_cost(&self, segment: &Segment) -> Result<u64, MergeError> {
        let reader = self.resource.reader(segment)?;
        let mut cost = 0u64;
        for series in reader.all_series() {
            cost += reader.series_metadata_size(&series);
        }
        Ok(cost + reader.max_chunk_size())
    }

    /// Unsequence files are held decoded in memory for the whole pass: loose
    /// bound is the file size, tight bound the chunk-data bytes alone.
    fn unseq_cost(&self, segment: &Segment) -> Result<u64, MergeError> {
        let reader = self.resource.reader(segment)?;
        Ok(if self.tight_bound {
            reader.data_end_offset()
        } else {
            reader.file_size()
        })
    }
}

fn scale(cost: u64, num: usize, den: usize) -> u64 {
    if den == 0 {
        return cost;
    }
    ((cost as u128 * num as u128) / den as u128) as u64
}
