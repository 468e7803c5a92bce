//! Bounded merge execution.
//!
//! A fixed pool of worker threads consumes submitted merge tasks from a
//! shared channel; each running task fans its chunk work out over one shared
//! rayon sub-pool. `scope` makes the submitting worker execute sub-work
//! itself when the sub-pool is saturated, so tasks can never starve their own
//! sub-workers. Cancellation is cooperative: every task carries a flag it
//! checks at chunk and file boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::error::MergeError;
use crate::task::{MergeCallback, MergeReport, MergeTask};

enum WorkerCmd {
    Run { task: MergeTask, callback: Option<MergeCallback> },
    Shutdown,
}

/// Handle for cancelling one submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancel: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct MergeScheduler {
    cmd_tx: mpsc::Sender<WorkerCmd>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sub_pool: Arc<rayon::ThreadPool>,
    active: Mutex<Vec<Weak<AtomicBool>>>,
}

impl MergeScheduler {
    pub fn new(merge_thread_num: usize, merge_chunk_sub_thread_num: usize) -> Result<Self, MergeError> {
        let threads = merge_thread_num.max(1);
        let sub_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(merge_chunk_sub_thread_num.max(1))
                .thread_name(|i| format!("seamer-merge-sub-{}", i))
                .build()
                .map_err(|e| MergeError::BackgroundTaskError(e.to_string()))?,
        );

        let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCmd>();
        let cmd_rx = Arc::new(Mutex::new(cmd_rx));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = Arc::clone(&cmd_rx);
            let pool = Arc::clone(&sub_pool);
            let handle = thread::Builder::new()
                .name(format!("seamer-merge-{}", i))
                .spawn(move || loop {
                    let cmd = {
                        let guard = match rx.lock() {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        guard.recv()
                    };
                    match cmd {
                        Ok(WorkerCmd::Run { task, callback }) => {
                            let report = task.run(&pool);
                            if let Some(callback) = callback {
                                callback(report);
                            }
                        }
                        Ok(WorkerCmd::Shutdown) | Err(_) => break,
                    }
                })
                .map_err(|e| MergeError::BackgroundTaskError(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            cmd_tx,
            workers: Mutex::new(workers),
            sub_pool,
            active: Mutex::new(Vec::new()),
        })
    }

    /// The shared sub-worker pool (for callers running a task inline).
    pub fn sub_pool(&self) -> &rayon::ThreadPool {
        &self.sub_pool
    }

    /// Queues a task; the callback fires on the worker thread that ran it.
    pub fn submit(
        &self,
        task: MergeTask,
        callback: Option<MergeCallback>,
    ) -> Result<TaskHandle, MergeError> {
        let cancel = task.cancel.clone();
        {
            let mut active = self.active.lock()?;
            active.retain(|w| w.strong_count() > 0);
            active.push(Arc::downgrade(&cancel));
        }
        self.cmd_tx
            .send(WorkerCmd::Run { task, callback })
            .map_err(|e| MergeError::BackgroundTaskError(format!("scheduler is down: {}", e)))?;
        Ok(TaskHandle { cancel })
    }

    /// Queues a task and blocks until its report is in.
    pub fn submit_and_wait(&self, task: MergeTask) -> Result<MergeReport, MergeError> {
        let (tx, rx) = mpsc::channel();
        self.submit(
            task,
            Some(Box::new(move |report| {
                let _ = tx.send(report);
            })),
        )?;
        rx.recv()
            .map_err(|e| MergeError::BackgroundTaskError(format!("task dropped: {}", e)))
    }

    /// Signals cancellation to every task still holding its flag.
    pub fn cancel_all(&self) {
        if let Ok(active) = self.active.lock() {
            for weak in active.iter() {
                if let Some(flag) = weak.upgrade() {
                    flag.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Cancels everything and joins the workers.
    pub fn shutdown(&self) {
        self.cancel_all();
        let worker_count = self.workers.lock().map(|w| w.len()).unwrap_or(0);
        for _ in 0..worker_count {
            let _ = self.cmd_tx.send(WorkerCmd::Shutdown);
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_cancellation_flag() {
        let handle = TaskHandle { cancel: Arc::new(AtomicBool::new(false)) };
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_scheduler_starts_and_shuts_down() {
        let scheduler = MergeScheduler::new(2, 2).unwrap();
        scheduler.shutdown();
        // Shutdown twice is harmless.
        scheduler.shutdown();
    }
}
