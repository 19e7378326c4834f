// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance worker registry.
//!
//! Every instance gets a single consumer task that runs the instance's work
//! in submission order, one unit at a time. Different instances run
//! concurrently.
//!
//! ```text
//!  enqueue(I1, a) ─┐                 ┌──────────────┐
//!  enqueue(I1, b) ─┼─► I1 queue ───► │ I1 consumer  │  a, then b
//!                  │                 └──────────────┘
//!  enqueue(I2, c) ─┴─► I2 queue ───► │ I2 consumer  │  c, alongside a/b
//! ```
//!
//! Workers are cached per process. When the cache is over capacity an idle
//! worker (nothing queued or running) is retired; a worker with pending work
//! is never retired. Once the cache is shut down it spawns no new workers:
//! work submitted afterwards resolves to [`EngineError::WorkAbandoned`].

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::error::{EngineError, Result};
use crate::ids::{InstanceId, ProcessId};

/// A unit of instance work.
pub type InstanceTask = BoxFuture<'static, Result<()>>;

tokio::task_local! {
    static CURRENT_WORKER: InstanceId;
}

struct Job {
    task: InstanceTask,
    done: oneshot::Sender<Result<()>>,
}

struct Queue {
    tx: Option<mpsc::UnboundedSender<Job>>,
    pending: usize,
}

/// Handle resolving when a unit of work finishes.
#[must_use = "dropping the completion does not cancel the work"]
#[derive(Debug)]
pub struct WorkCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

impl WorkCompletion {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    fn abandoned() -> Self {
        let (done, rx) = oneshot::channel();
        drop(done);
        Self { rx }
    }

    /// Wait for the work's result.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(EngineError::WorkAbandoned))
    }
}

/// Serial executor for one instance.
pub struct InstanceWorker {
    instance_id: InstanceId,
    queue: Mutex<Queue>,
    last_used_ms: AtomicI64,
}

impl std::fmt::Debug for InstanceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("InstanceWorker")
            .field("instance_id", &self.instance_id)
            .field("pending", &queue.pending)
            .field("retired", &queue.tx.is_none())
            .finish()
    }
}

impl InstanceWorker {
    fn spawn(instance_id: InstanceId) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self::with_sender(instance_id, Some(tx));
        tokio::spawn(Arc::clone(&worker).run(rx));
        worker
    }

    fn retired(instance_id: InstanceId) -> Arc<Self> {
        Self::with_sender(instance_id, None)
    }

    fn with_sender(instance_id: InstanceId, tx: Option<mpsc::UnboundedSender<Job>>) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            queue: Mutex::new(Queue { tx, pending: 0 }),
            last_used_ms: AtomicI64::new(now_ms()),
        })
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Job>) {
        trace!(instance_id = self.instance_id, "Instance worker started");
        while let Some(job) = rx.recv().await {
            let outcome = CURRENT_WORKER
                .scope(self.instance_id, AssertUnwindSafe(job.task).catch_unwind())
                .await
                .unwrap_or_else(|_| {
                    error!(instance_id = self.instance_id, "Instance work panicked");
                    Err(EngineError::WorkPanicked {
                        instance_id: self.instance_id,
                    })
                });

            {
                let mut queue = self.queue.lock();
                queue.pending = queue.pending.saturating_sub(1);
            }
            self.touch();
            let _ = job.done.send(outcome);
        }
        trace!(instance_id = self.instance_id, "Instance worker stopped");
    }

    /// Instance this worker serves.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Units queued or running.
    pub fn pending(&self) -> usize {
        self.queue.lock().pending
    }

    /// Whether the calling task is this worker's consumer.
    pub fn is_current(&self) -> bool {
        CURRENT_WORKER
            .try_with(|id| *id == self.instance_id)
            .unwrap_or(false)
    }

    /// Queue `task` behind the work already submitted.
    pub fn enqueue(&self, task: InstanceTask) -> Result<WorkCompletion> {
        self.try_enqueue(task).map_err(|_| EngineError::WorkAbandoned)
    }

    /// Run `work` right away on the calling task.
    ///
    /// Only allowed from this worker's own consumer, i.e. from inside work
    /// that was enqueued on it; anywhere else fails with
    /// [`EngineError::NotOnWorker`].
    pub async fn execute_inline<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.is_current() {
            return Err(EngineError::NotOnWorker {
                instance_id: self.instance_id,
            });
        }
        self.touch();
        work.await
    }

    fn try_enqueue(&self, task: InstanceTask) -> std::result::Result<WorkCompletion, InstanceTask> {
        let (done, rx) = oneshot::channel();
        let mut queue = self.queue.lock();
        let Some(tx) = queue.tx.as_ref() else {
            return Err(task);
        };
        match tx.send(Job { task, done }) {
            Ok(()) => {
                queue.pending += 1;
                Ok(WorkCompletion::new(rx))
            }
            Err(mpsc::error::SendError(job)) => Err(job.task),
        }
    }

    /// Stop accepting work if nothing is pending. Queued work still drains.
    fn retire_if_idle(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue.pending == 0 {
            queue.tx = None;
            true
        } else {
            false
        }
    }

    fn retire(&self) {
        self.queue.lock().tx = None;
    }

    fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-process cache of instance workers.
#[derive(Debug)]
pub struct InstanceWorkerCache {
    process_id: ProcessId,
    capacity: usize,
    workers: Mutex<HashMap<InstanceId, Arc<InstanceWorker>>>,
    closed: AtomicBool,
}

impl InstanceWorkerCache {
    /// Create a cache keeping up to `capacity` workers before retiring idle ones.
    pub fn new(process_id: ProcessId, capacity: usize) -> Self {
        Self {
            process_id,
            capacity: capacity.max(1),
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Worker of `instance_id`, created on first use.
    ///
    /// Must be called within a tokio runtime. After [`shutdown`](Self::shutdown)
    /// the returned worker rejects all work.
    pub fn get(&self, instance_id: InstanceId) -> Arc<InstanceWorker> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(&instance_id) {
            worker.touch();
            return Arc::clone(worker);
        }
        if self.is_closed() {
            return InstanceWorker::retired(instance_id);
        }
        if workers.len() >= self.capacity {
            self.evict_idle(&mut workers);
        }
        let worker = InstanceWorker::spawn(instance_id);
        workers.insert(instance_id, Arc::clone(&worker));
        debug!(
            process_id = %self.process_id,
            instance_id,
            workers = workers.len(),
            "Instance worker created"
        );
        worker
    }

    /// Queue `task` on the worker of `instance_id`.
    ///
    /// On a shut down cache the task is dropped and the completion resolves
    /// to [`EngineError::WorkAbandoned`].
    pub fn enqueue(&self, instance_id: InstanceId, task: InstanceTask) -> WorkCompletion {
        let mut task = task;
        loop {
            let worker = self.get(instance_id);
            match worker.try_enqueue(task) {
                Ok(completion) => return completion,
                Err(_) if self.is_closed() => {
                    debug!(
                        process_id = %self.process_id,
                        instance_id,
                        "Work submitted after shutdown abandoned"
                    );
                    return WorkCompletion::abandoned();
                }
                Err(returned) => {
                    // Retired between lookup and submission.
                    task = returned;
                    let mut workers = self.workers.lock();
                    if workers
                        .get(&instance_id)
                        .is_some_and(|current| Arc::ptr_eq(current, &worker))
                    {
                        workers.remove(&instance_id);
                    }
                }
            }
        }
    }

    /// Completion resolving once everything queued so far for `instance_id` has run.
    pub fn barrier(&self, instance_id: InstanceId) -> WorkCompletion {
        self.enqueue(instance_id, Box::pin(async { Ok(()) }))
    }

    /// Number of cached workers.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether no worker is cached.
    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Whether a worker for `instance_id` is cached.
    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.workers.lock().contains_key(&instance_id)
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Retire every worker and stop spawning new ones. Work already queued
    /// still runs on its original worker.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut workers = self.workers.lock();
            self.closed.store(true, Ordering::Release);
            workers.drain().map(|(_, w)| w).collect()
        };
        for worker in &drained {
            worker.retire();
        }
        debug!(process_id = %self.process_id, retired = drained.len(), "Instance workers retired");
    }

    fn evict_idle(&self, workers: &mut HashMap<InstanceId, Arc<InstanceWorker>>) {
        let mut idle: Vec<(i64, InstanceId)> = workers
            .values()
            .filter(|w| w.pending() == 0)
            .map(|w| (w.last_used_ms(), w.instance_id))
            .collect();
        idle.sort_unstable();

        for (_, instance_id) in idle {
            if workers.len() < self.capacity {
                break;
            }
            let retired = workers
                .get(&instance_id)
                .is_some_and(|worker| worker.retire_if_idle());
            if retired {
                workers.remove(&instance_id);
                trace!(process_id = %self.process_id, instance_id, "Idle instance worker retired");
            }
        }
    }
}

impl Drop for InstanceWorkerCache {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().values() {
            worker.retire();
        }
    }
}
