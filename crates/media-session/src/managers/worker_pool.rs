//! Worker pool.
//!
//! Owns a fixed set of mediasoup workers created at startup and hands them out
//! round-robin. Every worker's `on_dead` callback feeds one monitor task, which
//! hands an unexpected worker death to the pool's [`WorkerDeathHandler`].
//!
//! A dead worker takes every router on it down with it, and the resources the
//! managers index for those routers can no longer be trusted. The production
//! handler therefore terminates the process after a short grace period and
//! leaves recovery to the orchestrator.

use crate::errors::SessionError;
use crate::observability::metrics;
use mediasoup::worker::{Worker, WorkerId, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Reaction to a media worker dying unexpectedly.
#[async_trait::async_trait]
pub trait WorkerDeathHandler: Send + Sync {
    async fn on_worker_death(&self, worker_id: WorkerId, reason: String);
}

/// Default death handler: waits `grace`, then exits the process with status 1.
#[derive(Debug, Clone)]
pub struct ExitProcess {
    grace: Duration,
}

impl ExitProcess {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait::async_trait]
impl WorkerDeathHandler for ExitProcess {
    async fn on_worker_death(&self, worker_id: WorkerId, reason: String) {
        error!(
            target: "ms.pool",
            worker_id = %worker_id,
            reason = %reason,
            grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
            "Media worker died, terminating process"
        );
        tokio::time::sleep(self.grace).await;
        std::process::exit(1);
    }
}

/// Worker id and exit reason, sent from a worker's `on_dead` callback.
type DeathReport = (WorkerId, String);

/// Round-robin pool of media workers.
pub struct WorkerPool {
    num_workers: usize,
    settings: WorkerSettings,
    death_handler: Arc<dyn WorkerDeathHandler>,
    manager: WorkerManager,
    workers: RwLock<Vec<Worker>>,
    cursor: AtomicUsize,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        num_workers: usize,
        settings: WorkerSettings,
        death_handler: Arc<dyn WorkerDeathHandler>,
    ) -> Self {
        Self {
            num_workers,
            settings,
            death_handler,
            manager: WorkerManager::new(),
            workers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            monitor: Mutex::new(None),
        }
    }

    /// Spawn every worker. Fails if the pool is already running.
    ///
    /// If any worker fails to start, the ones already started are closed and
    /// the pool stays uninitialized.
    #[instrument(skip_all, name = "ms.pool.init", fields(num_workers = self.num_workers))]
    pub async fn init(&self) -> Result<(), SessionError> {
        let mut workers = self.workers.write().await;
        if !workers.is_empty() {
            return Err(SessionError::Conflict(
                "worker pool already initialized".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(SessionError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let mut spawned = Vec::with_capacity(self.num_workers);
        for index in 0..self.num_workers {
            match self.manager.create_worker(self.settings.clone()).await {
                Ok(worker) => spawned.push(worker),
                Err(e) => {
                    error!(target: "ms.pool", index, error = %e, "Failed to start media worker");
                    // Dropping the started workers closes them.
                    return Err(SessionError::Engine(format!(
                        "worker {index} failed to start: {e}"
                    )));
                }
            }
        }

        let (deaths, reports) = mpsc::unbounded_channel();
        for worker in &spawned {
            let deaths = deaths.clone();
            let worker_id = worker.id();
            worker
                .on_dead(move |exit| {
                    let reason = match exit {
                        Ok(()) => "worker exited".to_string(),
                        Err(e) => e.to_string(),
                    };
                    let _ = deaths.send((worker_id, reason));
                })
                .detach();
        }
        *self.monitor.lock().await = Some(spawn_death_monitor(
            reports,
            Arc::clone(&self.death_handler),
        ));

        *workers = spawned;
        self.cursor.store(0, Ordering::SeqCst);
        metrics::set_workers_active(workers.len());

        info!(
            target: "ms.pool",
            num_workers = workers.len(),
            worker_ids = ?workers.iter().map(Worker::id).collect::<Vec<_>>(),
            "Worker pool initialized"
        );
        Ok(())
    }

    /// Next worker in round-robin order.
    pub async fn get_next_worker(&self) -> Result<Worker, SessionError> {
        let workers = self.workers.read().await;
        let len = workers.len();
        if len == 0 {
            return Err(SessionError::PoolUninitialized);
        }

        let index = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some((c + 1) % len))
            .unwrap_or_default()
            % len;

        workers
            .get(index)
            .cloned()
            .ok_or(SessionError::PoolUninitialized)
    }

    /// Release every worker and empty the pool. Idempotent.
    ///
    /// A worker closes once its routers are gone too. Workers released here
    /// are not reported to the death handler.
    #[instrument(skip_all, name = "ms.pool.close")]
    pub async fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.write().await);
        if workers.is_empty() {
            return;
        }

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }

        self.cursor.store(0, Ordering::SeqCst);
        metrics::set_workers_active(0);
        info!(target: "ms.pool", num_workers = workers.len(), "Worker pool closed");
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Snapshot of the running workers, in creation order.
    pub async fn workers(&self) -> Vec<Worker> {
        self.workers.read().await.clone()
    }
}

fn spawn_death_monitor(
    mut reports: mpsc::UnboundedReceiver<DeathReport>,
    handler: Arc<dyn WorkerDeathHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((worker_id, reason)) = reports.recv().await {
            warn!(
                target: "ms.pool",
                worker_id = %worker_id,
                reason = %reason,
                "Media worker died unexpectedly"
            );
            metrics::record_worker_death();
            handler.on_worker_death(worker_id, reason).await;
        }
    })
}

/// Death handlers for tests.
pub mod mock {
    use super::*;
    use tokio::sync::mpsc;

    /// Forwards every death notification to a channel instead of exiting.
    pub struct RecordingDeathHandler {
        sender: mpsc::UnboundedSender<(WorkerId, String)>,
    }

    impl RecordingDeathHandler {
        /// Handler plus the receiving end of its notifications.
        #[must_use]
        pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<(WorkerId, String)>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Arc::new(Self { sender }), receiver)
        }
    }

    #[async_trait::async_trait]
    impl WorkerDeathHandler for RecordingDeathHandler {
        async fn on_worker_death(&self, worker_id: WorkerId, reason: String) {
            let _ = self.sender.send((worker_id, reason));
        }
    }
}
