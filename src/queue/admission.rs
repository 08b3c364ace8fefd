//! Bounded admission queue with a fixed worker budget.
//!
//! Work is accepted into a bounded FIFO channel and pulled off by a single
//! dispatcher task. The dispatcher waits for one of `max_workers` semaphore
//! permits before spawning each unit of work, so at most `max_workers` units
//! run at once and the rest stay queued in the channel. Results are picked up
//! by polling [`AdmissionQueue::await_result`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::task::{Outcome, TaskEntry, TaskId, TaskSnapshot, TaskStatus};
use crate::sync::lock;
use crate::telemetry;
use crate::types::QueueStats;
use crate::{MimirError, Result};

/// Configuration for an [`AdmissionQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue capacity is twice this value. Default: 10.
    pub max_concurrent: usize,
    /// Units of work allowed to run at once. Default: 4.
    pub max_workers: usize,
    /// How long `submit` waits for queue space before rejecting. Default: 30s.
    pub queue_timeout: Duration,
    /// Interval at which `await_result` checks the task table. Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_workers: 4,
            queue_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl QueueConfig {
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn capacity(&self) -> usize {
        (self.max_concurrent * 2).max(1)
    }
}

struct QueuedTask<T> {
    id: TaskId,
    work: BoxFuture<'static, Result<T>>,
    timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    queued: u64,
    active: u64,
}

/// State shared by the queue handle, the dispatcher and every worker.
///
/// The task table and the counters have separate locks; no code path holds
/// both at once.
struct Shared<T> {
    tasks: Mutex<HashMap<TaskId, TaskEntry<T>>>,
    counters: Mutex<Counters>,
    workers: Arc<Semaphore>,
    shutdown: Notify,
    config: QueueConfig,
}

impl<T: Send + 'static> Shared<T> {
    fn start(&self, id: TaskId) {
        if let Some(entry) = lock(&self.tasks).get_mut(&id) {
            entry.start();
        }
        let mut counters = lock(&self.counters);
        counters.queued = counters.queued.saturating_sub(1);
        counters.active += 1;
    }

    fn complete(&self, id: TaskId, outcome: Outcome<T>) {
        let status = match &outcome {
            Outcome::Value(_) => TaskStatus::Completed,
            Outcome::Failed(_) => TaskStatus::Failed,
            Outcome::TimedOut(_) => TaskStatus::TimedOut,
        };
        if let Outcome::Failed(message) = &outcome {
            warn!(task = %id, error = %message, "task failed");
        }

        match lock(&self.tasks).get_mut(&id) {
            Some(entry) => entry.finish(outcome),
            None => debug!(task = %id, "dropping result of abandoned task"),
        }

        {
            let mut counters = lock(&self.counters);
            counters.active = counters.active.saturating_sub(1);
            match status {
                TaskStatus::Completed => counters.completed += 1,
                TaskStatus::TimedOut => {
                    counters.timed_out += 1;
                    counters.failed += 1;
                }
                _ => counters.failed += 1,
            }
        }
        metrics::counter!(telemetry::QUEUE_TASKS_TOTAL, "status" => status.as_str()).increment(1);
    }

    /// Fail a task that was accepted but will never run.
    fn abandon(&self, id: TaskId) {
        if let Some(entry) = lock(&self.tasks).get_mut(&id) {
            entry.finish(Outcome::Failed("admission queue shut down".to_string()));
        }
        let mut counters = lock(&self.counters);
        counters.queued = counters.queued.saturating_sub(1);
        counters.failed += 1;
        metrics::counter!(telemetry::QUEUE_TASKS_TOTAL, "status" => "abandoned").increment(1);
    }
}

/// Admission-controlled executor for units of work producing `T`.
///
/// Must be created inside a Tokio runtime; the dispatcher is spawned on
/// construction.
pub struct AdmissionQueue<T> {
    shared: Arc<Shared<T>>,
    sender: Mutex<Option<mpsc::Sender<QueuedTask<T>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> AdmissionQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity());
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            shutdown: Notify::new(),
            config,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), receiver));
        info!(
            capacity = shared.config.capacity(),
            workers = shared.config.max_workers,
            "admission queue started"
        );

        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Enqueue a unit of work.
    ///
    /// Waits at most `queue_timeout` for space in the queue, then fails with
    /// [`MimirError::QueueFull`]. `timeout` bounds the work's own execution
    /// once a worker picks it up. `priority` is recorded but dispatch is FIFO.
    pub async fn submit<F>(&self, work: F, priority: u8, timeout: Option<Duration>) -> Result<TaskId>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let sender = lock(&self.sender).clone().ok_or(MimirError::ShuttingDown)?;
        let id = TaskId::new();

        lock(&self.shared.tasks).insert(id, TaskEntry::queued(priority, timeout));
        {
            let mut counters = lock(&self.shared.counters);
            counters.total += 1;
            counters.queued += 1;
        }

        let task = QueuedTask {
            id,
            work: work.boxed(),
            timeout,
        };
        let queue_timeout = self.shared.config.queue_timeout;
        match sender.send_timeout(task, queue_timeout).await {
            Ok(()) => {
                debug!(task = %id, priority, "task queued");
                Ok(id)
            }
            Err(e) => {
                lock(&self.shared.tasks).remove(&id);
                {
                    let mut counters = lock(&self.shared.counters);
                    counters.queued = counters.queued.saturating_sub(1);
                    counters.failed += 1;
                }
                let (reason, err) = match e {
                    SendTimeoutError::Timeout(_) => (
                        "full",
                        MimirError::QueueFull {
                            waited: queue_timeout,
                        },
                    ),
                    SendTimeoutError::Closed(_) => ("shutdown", MimirError::ShuttingDown),
                };
                metrics::counter!(telemetry::QUEUE_REJECTIONS_TOTAL, "reason" => reason)
                    .increment(1);
                warn!(task = %id, reason, "task rejected");
                Err(err)
            }
        }
    }

    /// Wait for a task's result, polling the task table.
    ///
    /// A terminal result is delivered once and removed; asking again yields
    /// [`MimirError::TaskNotFound`]. When `timeout` elapses the entry is
    /// dropped and [`MimirError::ResultTimeout`] returned, but the work itself
    /// is not cancelled: it keeps its worker until it finishes on its own.
    pub async fn await_result(&self, id: TaskId, timeout: Duration) -> Result<T> {
        let started = tokio::time::Instant::now();

        loop {
            {
                let mut tasks = lock(&self.shared.tasks);
                match tasks.get(&id).map(|entry| entry.status) {
                    None => return Err(MimirError::TaskNotFound(id)),
                    Some(status) if status.is_terminal() => {
                        let outcome = tasks.remove(&id).and_then(|entry| entry.outcome);
                        return match outcome {
                            Some(Outcome::Value(value)) => Ok(value),
                            Some(Outcome::Failed(message)) => {
                                Err(MimirError::TaskFailed { task_id: id, message })
                            }
                            Some(Outcome::TimedOut(limit)) => Err(MimirError::TaskTimedOut {
                                task_id: id,
                                timeout: limit,
                            }),
                            None => Err(MimirError::TaskFailed {
                                task_id: id,
                                message: "task finished without a result".to_string(),
                            }),
                        };
                    }
                    Some(_) => {}
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                lock(&self.shared.tasks).remove(&id);
                warn!(task = %id, waited_ms = waited.as_millis() as u64, "stopped waiting for task result");
                return Err(MimirError::ResultTimeout { task_id: id, waited });
            }
            tokio::time::sleep(self.shared.config.poll_interval.min(timeout - waited)).await;
        }
    }

    /// Current state of a task, if it is still in the active table.
    pub fn status(&self, id: TaskId) -> Option<TaskSnapshot> {
        lock(&self.shared.tasks).get(&id).map(|entry| entry.snapshot(id))
    }

    pub fn stats(&self) -> QueueStats {
        let (queue_size, running) = match lock(&self.sender).as_ref() {
            Some(sender) => (sender.max_capacity() - sender.capacity(), true),
            None => (0, false),
        };
        let counters = lock(&self.shared.counters);
        QueueStats {
            total_requests: counters.total,
            completed_requests: counters.completed,
            failed_requests: counters.failed,
            timed_out_requests: counters.timed_out,
            queued_requests: counters.queued,
            active_requests: counters.active,
            queue_size,
            max_concurrent: self.shared.config.max_concurrent,
            max_workers: self.shared.config.max_workers,
            running,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.sender).is_some()
    }

    /// Stop accepting work and stop the dispatcher.
    ///
    /// Tasks still waiting in the queue are marked failed. With a `grace`
    /// period, waits up to that long for running work to finish; running work
    /// is never cancelled.
    pub async fn shutdown(&self, grace: Option<Duration>) {
        let sender = lock(&self.sender).take();
        drop(sender);
        self.shared.shutdown.notify_one();

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "admission dispatcher ended abnormally");
            }
        }

        if let Some(grace) = grace {
            let permits = u32::try_from(self.shared.config.max_workers.max(1)).unwrap_or(u32::MAX);
            match tokio::time::timeout(grace, self.shared.workers.acquire_many(permits)).await {
                Ok(_) => debug!("admission workers drained"),
                Err(_) => {
                    let active = lock(&self.shared.counters).active;
                    warn!(active, grace_ms = grace.as_millis() as u64, "shutdown grace elapsed with work still running");
                }
            }
        }
        info!("admission queue stopped");
    }
}

impl<T> Drop for AdmissionQueue<T> {
    fn drop(&mut self) {
        self.shared.shutdown.notify_one();
    }
}

async fn dispatch<T: Send + 'static>(shared: Arc<Shared<T>>, mut receiver: mpsc::Receiver<QueuedTask<T>>) {
    loop {
        let task = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => break,
            next = receiver.recv() => match next {
                Some(task) => task,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => {
                shared.abandon(task.id);
                break;
            }
            permit = Arc::clone(&shared.workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    shared.abandon(task.id);
                    break;
                }
            },
        };

        shared.start(task.id);
        tokio::spawn(run(Arc::clone(&shared), task, permit));
    }

    receiver.close();
    while let Ok(task) = receiver.try_recv() {
        shared.abandon(task.id);
    }
    debug!("admission dispatcher stopped");
}

async fn run<T: Send + 'static>(shared: Arc<Shared<T>>, task: QueuedTask<T>, _permit: OwnedSemaphorePermit) {
    let QueuedTask { id, work, timeout } = task;
    debug!(task = %id, "task running");

    let guarded = AssertUnwindSafe(work).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(finished) => into_outcome(finished),
            Err(_) => Outcome::TimedOut(limit),
        },
        None => into_outcome(guarded.await),
    };

    shared.complete(id, outcome);
}

fn into_outcome<T>(
    finished: std::result::Result<Result<T>, Box<dyn std::any::Any + Send>>,
) -> Outcome<T> {
    match finished {
        Ok(Ok(value)) => Outcome::Value(value),
        Ok(Err(e)) => Outcome::Failed(e.to_string()),
        Err(panic) => Outcome::Failed(panic_message(panic.as_ref())),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
