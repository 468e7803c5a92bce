//! Ordered point stream over the unsequence population for one series.
//!
//! All unsequence chunks touching the series are unioned behind a minimum-
//! timestamp heap. At a tie timestamp the point from the higher-version chunk
//! wins; if versions also tie, the later-inserted chunk wins. Tombstones are
//! applied while the chunks are decoded, so consumers never see deleted
//! points. Finite; restartable only by re-constructing.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::MergeError;
use crate::resource::MergeResource;
use crate::types::{SeriesPath, TimeValuePair, Timestamp};

struct SourceCursor {
    points: Vec<TimeValuePair>,
    pos: usize,
    version: i64,
    priority: usize,
}

impl SourceCursor {
    fn current_key(&self) -> Option<HeapKey> {
        self.points
            .get(self.pos)
            .map(|p| (p.timestamp, Reverse(self.version), Reverse(self.priority)))
    }
}

type HeapKey = (Timestamp, Reverse<i64>, Reverse<usize>);

pub struct UnseqPointReader {
    cursors: Vec<SourceCursor>,
    heap: BinaryHeap<Reverse<(HeapKey, usize)>>,
    current: Option<TimeValuePair>,
}

impl UnseqPointReader {
    /// Collects every unsequence chunk of `series` from the working set.
    /// Corrupt chunks are reported and skipped.
    pub fn build(series: &SeriesPath, resource: &MergeResource) -> Result<Self, MergeError> {
        let mut cursors = Vec::new();
        let mut priority = 0usize;
        for segment in resource.unseq_files() {
            let reader = resource.reader(segment)?;
            let mut metas = reader.chunk_metadata(series);
            if metas.is_empty() {
                continue;
            }
            let tombstones = resource.modifications(segment, series)?;
            for meta in metas.iter_mut() {
                for t in &tombstones {
                    if t.version > meta.version && t.end_time > meta.deleted_at {
                        meta.deleted_at = t.end_time;
                    }
                }
            }
            for meta in metas {
                let chunk = match reader.read_chunk(&meta) {
                    Ok(chunk) => chunk,
                    Err(MergeError::Corruption { .. }) => {
                        resource.report_corrupt_chunk(&meta, segment.path());
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let points = chunk.decode()?;
                if points.is_empty() {
                    continue;
                }
                cursors.push(SourceCursor {
                    points,
                    pos: 0,
                    version: meta.version,
                    priority,
                });
                priority += 1;
            }
        }

        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (idx, cursor) in cursors.iter().enumerate() {
            if let Some(key) = cursor.current_key() {
                heap.push(Reverse((key, idx)));
            }
        }

        let mut reader = Self { cursors, heap, current: None };
        reader.advance();
        Ok(reader)
    }

    #[cfg(test)]
    fn from_raw(sources: Vec<(Vec<TimeValuePair>, i64)>) -> Self {
        let cursors: Vec<SourceCursor> = sources
            .into_iter()
            .enumerate()
            .map(|(priority, (points, version))| SourceCursor {
                points,
                pos: 0,
                version,
                priority,
            })
            .collect();
        let mut heap = BinaryHeap::new();
        for (idx, cursor) in cursors.iter().enumerate() {
            if let Some(key) = cursor.current_key() {
                heap.push(Reverse((key, idx)));
            }
        }
        let mut reader = Self { cursors, heap, current: None };
        reader.advance();
        reader
    }

    /// The point the stream is positioned on, if any.
    pub fn current(&self) -> Option<&TimeValuePair> {
        self.current.as_ref()
    }

    /// Highest chunk version feeding this stream (0 when empty); merged
    /// output chunks carry at least this version so later tie-breaks keep
    /// preferring them.
    pub fn max_version(&self) -> i64 {
        self.cursors.iter().map(|c| c.version).max().unwrap_or(0)
    }

    /// Moves to the next distinct timestamp, resolving ties by version then
    /// insertion order.
    pub fn advance(&mut self) {
        let Some(Reverse((key, idx))) = self.heap.pop() else {
            self.current = None;
            return;
        };
        let ts = key.0;
        let winner = self.cursors[idx].points[self.cursors[idx].pos].clone();
        self.step_cursor(idx);

        // Consume every other occurrence of the winning timestamp.
        while let Some(&Reverse(((t, _, _), dup_idx))) = self.heap.peek() {
            if t != ts {
                break;
            }
            self.heap.pop();
            self.step_cursor(dup_idx);
        }
        self.current = Some(winner);
    }

    fn step_cursor(&mut self, idx: usize) {
        self.cursors[idx].pos += 1;
        if let Some(key) = self.cursors[idx].current_key() {
            self.heap.push(Reverse((key, idx)));
        }
    }
}

impl Iterator for UnseqPointReader {
    type Item = TimeValuePair;

    fn next(&mut self) -> Option<Self::Item> {
        let out = self.current.take();
        if out.is_some() {
            self.advance();
        }
        out
    }
}

impl std::fmt::Debug for UnseqPointReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnseqPointReader")
            .field("sources", &self.cursors.len())
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    fn pts(values: &[(i64, f64)]) -> Vec<TimeValuePair> {
        values
            .iter()
            .map(|&(t, v)| TimeValuePair::new(t, FieldValue::Float64(v)))
            .collect()
    }

    #[test]
    fn test_orders_across_sources() {
        let reader = UnseqPointReader::from_raw(vec![
            (pts(&[(1, 10.0), (5, 50.0)]), 1),
            (pts(&[(2, 20.0), (3, 30.0)]), 1),
        ]);
        let out: Vec<i64> = reader.map(|p| p.timestamp).collect();
        assert_eq!(out, vec![1, 2, 3, 5]);
    }

    #[test]
    fn test_tie_higher_version_wins() {
        let reader = UnseqPointReader::from_raw(vec![
            (pts(&[(5, 1.0)]), 7),
            (pts(&[(5, 2.0)]), 3),
        ]);
        let out: Vec<TimeValuePair> = reader.collect();
        assert_eq!(out, pts(&[(5, 1.0)]));
    }

    #[test]
    fn test_tie_same_version_later_insertion_wins() {
        let reader = UnseqPointReader::from_raw(vec![
            (pts(&[(5, 1.0)]), 2),
            (pts(&[(5, 2.0)]), 2),
        ]);
        let out: Vec<TimeValuePair> = reader.collect();
        assert_eq!(out, pts(&[(5, 2.0)]));
    }

    #[test]
    fn test_each_timestamp_emitted_once() {
        let reader = UnseqPointReader::from_raw(vec![
            (pts(&[(1, 1.0), (2, 2.0), (3, 3.0)]), 1),
            (pts(&[(2, 20.0), (3, 30.0), (4, 40.0)]), 5),
            (pts(&[(3, 300.0)]), 9),
        ]);
        let out: Vec<TimeValuePair> = reader.collect();
        assert_eq!(out, pts(&[(1, 1.0), (2, 20.0), (3, 300.0), (4, 40.0)]));
    }

    #[test]
    fn test_empty_is_immediately_exhausted() {
        let mut reader = UnseqPointReader::from_raw(vec![]);
        assert!(reader.current().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_current_advance_protocol() {
        let mut reader = UnseqPointReader::from_raw(vec![(pts(&[(1, 1.0), (9, 9.0)]), 1)]);
        assert_eq!(reader.current().unwrap().timestamp, 1);
        reader.advance();
        assert_eq!(reader.current().unwrap().timestamp, 9);
        reader.advance();
        assert!(reader.current().is_none());
    }
}
