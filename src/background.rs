//! Background worker thread.
//!
//! Drives compaction and graph persistence off the writer's critical
//! path. One thread, fed over a channel; long-running work checks the
//! cancellation flag between phases and surrenders with the manifest
//! in its pre-operation state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::engine::EngineShared;

/// Work items the engine hands to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    MaybeCompact,
    PersistGraph,
    Shutdown,
}

pub(crate) struct BackgroundWorker {
    tx: Sender<Task>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn spawn(shared: Arc<EngineShared>) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::clone(&cancel);

        let handle = std::thread::Builder::new()
            .name("svdb-background".into())
            .spawn(move || {
                for task in rx.iter() {
                    match task {
                        Task::Shutdown => break,
                        _ if cancel_flag.load(Ordering::Acquire) => break,
                        Task::MaybeCompact => {
                            let threshold = shared.options.compaction_threshold;
                            if let Err(err) =
                                shared.compact_background(threshold, Some(&cancel_flag))
                            {
                                tracing::error!(%err, "background compaction failed");
                            }
                        }
                        Task::PersistGraph => {
                            if let Err(err) = shared.persist_graph() {
                                tracing::error!(%err, "graph persistence failed");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn background thread");

        Self {
            tx,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn submit(&self, task: Task) {
        let _ = self.tx.send(task);
    }

    /// Signal cancellation, drain, and join.
    pub fn shutdown(mut self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.tx.send(Task::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.tx.send(Task::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::engine::Engine;

    #[test]
    fn test_background_compaction_converges() {
        use crate::error::SvdbError;

        let mut opts = EngineOptions::new(2);
        opts.memtable_max_records = 4;
        opts.compaction_threshold = 2;
        opts.background_compaction = true;
        let engine = Engine::ephemeral(opts).unwrap();

        for i in 0..64u32 {
            let id = format!("id_{}", i);
            // The worker's brief commit window can reject a writer;
            // retrying is the caller's contract.
            loop {
                match engine.store(id.as_bytes(), vec![i as f32, 0.0]) {
                    Ok(_) => break,
                    Err(SvdbError::ConcurrentModification) => std::thread::yield_now(),
                    Err(err) => panic!("store failed: {}", err),
                }
            }
        }
        for i in (0..64u32).step_by(7) {
            let id = format!("id_{}", i);
            assert_eq!(engine.get(id.as_bytes()).unwrap()[0], i as f32);
        }
        // Close joins the worker, so every queued pass has finished.
        assert!(engine.segment_count() >= 1);
        engine.close().unwrap();
    }

    #[test]
    fn test_worker_shutdown_is_clean() {
        let mut opts = EngineOptions::new(2);
        opts.background_compaction = true;
        let engine = Engine::ephemeral(opts).unwrap();
        engine.store(b"a", vec![1.0, 2.0]).unwrap();
        engine.close().unwrap();
    }
}
