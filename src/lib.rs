#![doc = r#"
seamer: Compaction/Merge Engine for Time-Series Segment Stores

This crate provides the merge core of a time-series storage system: it rewrites
the ordered ("sequence") and overlapping ("unsequence") segment populations of
a storage group into fewer, larger, non-overlapping segment files. It combines:
- Multi-way ordered merge across segments honouring per-series deletion tombstones
- Memory-bounded file selection (max-files and max-series strategies)
- A crash-safe rewrite protocol with a write-ahead merge journal and two commit
  strategies (in-place chunk back-patch vs. whole-file squeeze)
- A bounded-parallelism scheduler fanning merge work out across series while
  serializing writes per output file
- A tiered background compactor promoting files between levels

See the README for usage examples and more details.
"#]
// Declare modules
pub mod catalogue;
pub mod chunk_merge;
pub mod commit;
pub mod config;
pub mod error;
pub mod format;
pub mod journal;
pub mod levels;
pub mod point_reader;
pub mod recover;
pub mod resource;
pub mod scheduler;
pub mod segment;
pub mod selector;
pub mod squeeze;
pub mod task;
pub mod telemetry;
pub mod types;

/// Background compactor and level index; main entry point.
pub use crate::levels::LeveledCompactor;
/// Configuration options for the merge engine.
pub use crate::config::{MergeConfig, SeqMergeFileStrategy};
/// Error type for merge operations.
pub use crate::error::MergeError;
/// Schema catalogue consumed by the merge core.
pub use crate::catalogue::{Catalogue, InMemoryCatalogue};
/// Segment handle and filename identity.
pub use crate::segment::{Segment, SegmentName, Tombstone};
/// Structured event hook for observability.
pub use crate::telemetry::{MergeEvent, MergeEventListener};
/// Scalar value model.
pub use crate::types::{DataType, FieldValue, SeriesPath, TimeValuePair, Timestamp};
