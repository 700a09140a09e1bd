//! Background worker pool: claim → process → complete/fail.
//!
//! Each worker owns one loop. Stop is cooperative: a worker finishes the task
//! it is running (whose extractor in turn stops starting new ranges) and then
//! exits. Idle waits and backoffs end early when stop is requested; a `claim`
//! in progress is never abandoned, so no task is left Processing by a worker
//! that walked away from it.

use crate::config::PipelineConfig;
use crate::processor::Processor;
use crate::store::{QueueStore, StoreError};
use crate::task::{Task, TaskId, TaskResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const RESULT_WRITE_ATTEMPTS: u32 = 3;

/// Read side of a stop request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires. Used by the synchronous path.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn channel() -> (StopTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (StopTrigger { tx }, ShutdownSignal { rx: Some(rx) })
    }

    /// True once stop was requested, or once the trigger was dropped.
    pub fn is_stopped(&self) -> bool {
        match &self.rx {
            None => false,
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
        }
    }

    /// Resolves when stop is requested.
    pub async fn wait(&self) {
        match &self.rx {
            None => std::future::pending::<()>().await,
            Some(rx) => {
                let mut rx = rx.clone();
                // Err means the trigger is gone, which counts as stop.
                let _ = rx.wait_for(|stopped| *stopped).await;
            }
        }
    }
}

/// Write side of a stop request.
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

impl StopTrigger {
    pub fn stop(&self) {
        // Receivers may already be gone.
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Handle to running workers and the expiry sweeper.
pub struct WorkerPool {
    trigger: StopTrigger,
    workers: usize,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` loops plus one sweeper on the current runtime.
    pub fn start(
        store: Arc<dyn QueueStore>,
        processor: Arc<Processor>,
        config: &PipelineConfig,
    ) -> Self {
        let (trigger, signal) = ShutdownSignal::channel();
        let timing = Timing {
            poll: config.poll_interval(),
            backoff: config.queue_backoff(),
        };

        let workers = config.workers.max(1);
        let mut joins = Vec::with_capacity(workers + 1);
        for worker_id in 0..workers {
            let store = Arc::clone(&store);
            let processor = Arc::clone(&processor);
            let signal = signal.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, store, processor, signal, timing).await;
            }));
        }

        let purge_every = config.purge_interval();
        joins.push(tokio::spawn(async move {
            sweeper_loop(store, signal, purge_every).await;
        }));

        info!("Started {} workers", workers);
        Self {
            trigger,
            workers,
            joins,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Ask every loop to exit after its current task. Does not wait.
    pub fn request_stop(&self) {
        self.trigger.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.joins.iter().all(JoinHandle::is_finished)
    }

    /// Request stop and wait for every loop to exit.
    pub async fn stop(self) {
        self.request_stop();
        for join in self.joins {
            if let Err(e) = join.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

#[derive(Clone, Copy)]
struct Timing {
    poll: Duration,
    backoff: Duration,
}

/// Sleep for `period` unless stop comes first. Returns true on stop.
async fn pause(signal: &ShutdownSignal, period: Duration) -> bool {
    tokio::select! {
        biased;
        _ = signal.wait() => true,
        _ = sleep(period) => false,
    }
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn QueueStore>,
    processor: Arc<Processor>,
    signal: ShutdownSignal,
    timing: Timing,
) {
    debug!("worker-{} up", worker_id);
    while !signal.is_stopped() {
        match store.claim().await {
            Ok(Some(task)) => run_task(worker_id, &store, &processor, &signal, timing, task).await,
            Ok(None) => {
                if pause(&signal, timing.poll).await {
                    break;
                }
            }
            Err(StoreError::Decryption { id }) => {
                error!("worker-{}: payload of {} does not decrypt", worker_id, id);
                let outcome = Err("Task payload could not be decrypted".to_string());
                write_outcome(worker_id, &store, &id, outcome, timing.backoff).await;
            }
            Err(e) => {
                warn!(
                    "worker-{}: queue unavailable ({}), retrying in {}ms",
                    worker_id,
                    e,
                    timing.backoff.as_millis()
                );
                if pause(&signal, timing.backoff).await {
                    break;
                }
            }
        }
    }
    debug!("worker-{} down", worker_id);
}

async fn run_task(
    worker_id: usize,
    store: &Arc<dyn QueueStore>,
    processor: &Arc<Processor>,
    signal: &ShutdownSignal,
    timing: Timing,
    task: Task,
) {
    info!("worker-{}: processing {}", worker_id, task.id);
    let Task { id, payload, .. } = task;

    // A panic in the pipeline must still leave the task terminal.
    let processor = Arc::clone(processor);
    let signal = signal.clone();
    let dispatch = tokio::spawn(async move { processor.run(&payload, &signal).await });

    let outcome = match dispatch.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => {
            error!("worker-{}: {} failed: {}", worker_id, id, e);
            Err(e.to_string())
        }
        Err(join) => {
            error!("worker-{}: {} aborted: {}", worker_id, id, join);
            Err(format!("Processing aborted: {join}"))
        }
    };
    write_outcome(worker_id, store, &id, outcome, timing.backoff).await;
}

/// Persist a task's outcome. Only `Unavailable` is worth retrying.
async fn write_outcome(
    worker_id: usize,
    store: &Arc<dyn QueueStore>,
    id: &TaskId,
    outcome: Result<TaskResult, String>,
    backoff: Duration,
) {
    for attempt in 1..=RESULT_WRITE_ATTEMPTS {
        let written = match &outcome {
            Ok(result) => store.complete(id, result).await,
            Err(message) => store.fail(id, message).await,
        };
        match written {
            Ok(()) => {
                debug!(
                    "worker-{}: {} {}",
                    worker_id,
                    id,
                    if outcome.is_ok() { "completed" } else { "failed" }
                );
                return;
            }
            Err(StoreError::Unavailable(reason)) if attempt < RESULT_WRITE_ATTEMPTS => {
                warn!(
                    "worker-{}: writing result of {} failed (attempt {}/{}): {}",
                    worker_id, id, attempt, RESULT_WRITE_ATTEMPTS, reason
                );
                sleep(backoff * attempt).await;
            }
            Err(e) => {
                error!("worker-{}: result of {} lost: {}", worker_id, id, e);
                return;
            }
        }
    }
}

async fn sweeper_loop(store: Arc<dyn QueueStore>, signal: ShutdownSignal, every: Duration) {
    loop {
        if pause(&signal, every).await {
            break;
        }
        match store.purge_expired().await {
            Ok(0) => {}
            Ok(n) => info!("Purged {} expired tasks", n),
            Err(e) => warn!("Expiry sweep failed: {}", e),
        }
    }
}
