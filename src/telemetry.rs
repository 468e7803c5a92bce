use std::path::PathBuf;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not
/// acceptable for production. Instead, callers can provide an implementation
/// that forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait MergeEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: MergeEvent);
}

/// Structured events emitted by the merge engine.
#[derive(Debug, Clone)]
pub enum MergeEvent {
    MergeTaskStarted { task: String, seq_files: usize, unseq_files: usize },
    MergeTaskFinished { task: String, points_written: u64, chunks_written: u64 },
    MergeTaskFailed { task: String, error: String, fatal: bool },
    MergeTaskCancelled { task: String },

    SelectionCompleted { seq_selected: usize, unseq_selected: usize, cost: u64 },
    SelectionEmpty { reason: String },

    FileCommitStarted { path: PathBuf, merged_chunks: u64, unmerged_chunks: u64 },
    FileCommitted { path: PathBuf },
    SqueezeOutputInstalled { path: PathBuf },

    CorruptChunkSkipped { path: PathBuf, series: String, offset: u64 },
    ResourceCloseFailed { error: String },

    LevelPromotionStarted { partition: u64, level: usize, inputs: usize },
    LevelPromoted { partition: u64, level: usize, output: PathBuf },
    CompactionFailed { error: String },

    RecoveryStarted { journal: PathBuf },
    RecoveryRolledBack { journal: PathBuf },
    RecoveryCompleted { journal: PathBuf },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl MergeEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: MergeEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn MergeEventListener> {
    Arc::new(NoopEventListener)
}

/// Production-grade metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is effectively a no-op until a recorder is installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
pub mod merge_metrics {
    use std::time::Duration;

    #[cfg(feature = "prometheus")]
    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use std::sync::atomic::{AtomicBool, Ordering};
    #[cfg(feature = "prometheus")]
    use std::sync::{Arc, Mutex};
    #[cfg(feature = "prometheus")]
    use std::thread::JoinHandle;

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Notes:
    // - Counters are exposed as `<name>_total` by the Prometheus exporter.
    // - Histograms are exposed as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const MERGE_POINTS_WRITTEN: &str = "seamer_merge_points_written";
    pub const MERGE_CHUNKS_WRITTEN: &str = "seamer_merge_chunks_written";
    pub const MERGE_TASKS_FAILED: &str = "seamer_merge_tasks_failed";
    pub const MERGE_DURATION_SECONDS: &str = "seamer_merge_duration_seconds";
    pub const MERGE_SELECTION_COST_BYTES: &str = "seamer_merge_selection_cost_bytes";
    pub const RECOVERY_ROLLBACKS: &str = "seamer_recovery_rollbacks";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        ///
        /// The upkeep thread periodically calls `run_upkeep()` to keep exporter internals healthy
        /// (e.g. histogram maintenance). This is required when using `install_recorder`.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("seamer-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_points_written(points: u64) {
        if points > 0 {
            ::metrics::counter!(MERGE_POINTS_WRITTEN).increment(points);
        }
    }

    #[inline]
    pub fn record_chunks_written(chunks: u64) {
        if chunks > 0 {
            ::metrics::counter!(MERGE_CHUNKS_WRITTEN).increment(chunks);
        }
    }

    #[inline]
    pub fn record_merge_failed() {
        ::metrics::counter!(MERGE_TASKS_FAILED).increment(1);
    }

    #[inline]
    pub fn record_merge_duration(duration: Duration) {
        ::metrics::histogram!(MERGE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_selection_cost(bytes: u64) {
        ::metrics::gauge!(MERGE_SELECTION_COST_BYTES).set(bytes as f64);
    }

    #[inline]
    pub fn record_recovery_rollback() {
        ::metrics::counter!(RECOVERY_ROLLBACKS).increment(1);
    }

    #[cfg(feature = "prometheus")]
    fn describe_all() {
        // Counters
        describe_counter!(
            MERGE_POINTS_WRITTEN,
            Unit::Count,
            "Total number of points written by merge tasks."
        );
        describe_counter!(
            MERGE_CHUNKS_WRITTEN,
            Unit::Count,
            "Total number of chunks written by merge tasks."
        );
        describe_counter!(
            MERGE_TASKS_FAILED,
            Unit::Count,
            "Total number of merge task attempts that failed."
        );
        describe_counter!(
            RECOVERY_ROLLBACKS,
            Unit::Count,
            "Total number of mid-flight merges rolled back during startup recovery."
        );

        // Histograms
        describe_histogram!(
            MERGE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall-clock duration of completed merge tasks."
        );

        // Gauges
        describe_gauge!(
            MERGE_SELECTION_COST_BYTES,
            Unit::Bytes,
            "Estimated memory cost of the most recent file selection."
        );
    }
}
