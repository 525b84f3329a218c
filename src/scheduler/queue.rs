//! Dispatch queue - priority intake in front of the routing engine
//!
//! Tasks live in an arena keyed by id (`DashMap`), so every status change
//! happens under that task's entry lock. The intake only holds immutable
//! ordering keys `(priority desc, created_at asc, seq asc)` pointing into the
//! arena. Routing workers pop the smallest key, route against the current
//! snapshot and hand queued tasks to the [`Executor`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::executor::Executor;
use super::routing::route;
use super::scoring::ScoringWeights;
use super::snapshot::SnapshotStore;
use super::{DEFAULT_MAX_SNAPSHOT_AGE_SECS, DEFAULT_QUEUE_CAPACITY};
use crate::task::{Payload, Task, TaskError, TaskPriority, TaskStatus};

/// Errors returned synchronously by queue operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidState(#[from] TaskError),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("cluster snapshot is stale ({age_ms} ms old, limit {max_age_ms} ms)")]
    StaleSnapshot { age_ms: u64, max_age_ms: u64 },

    #[error("task '{task_id}' waited {waited_ms} ms in queue (limit {max_latency_ms} ms)")]
    QueueTimeout {
        task_id: String,
        waited_ms: u64,
        max_latency_ms: u64,
    },

    #[error("Task '{task_id}' is still {status}")]
    NotFinished { task_id: String, status: TaskStatus },

    #[error("Dispatch queue is closed")]
    Closed,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum tasks waiting in the intake; `None` is unbounded
    pub queue_capacity: Option<usize>,

    /// Refuse to route against snapshots older than this
    pub max_snapshot_age: Option<Duration>,

    /// Scoring weights passed to the routing engine
    pub scoring: ScoringWeights,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            max_snapshot_age: Some(Duration::from_secs(DEFAULT_MAX_SNAPSHOT_AGE_SECS)),
            scoring: ScoringWeights::default(),
        }
    }
}

/// Per-status task counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub routing: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending
            + self.routing
            + self.queued
            + self.running
            + self.completed
            + self.failed
            + self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IntakeKey {
    priority: Reverse<TaskPriority>,
    created_at: DateTime<Utc>,
    seq: u64,
}

struct IntakeEntry {
    task_id: String,
    // Released when the entry leaves the intake
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct Intake {
    order: BTreeMap<IntakeKey, IntakeEntry>,
    index: HashMap<String, IntakeKey>,
}

impl Intake {
    fn remove(&mut self, task_id: &str) -> bool {
        match self.index.remove(task_id) {
            Some(key) => self.order.remove(&key).is_some(),
            None => false,
        }
    }

    fn pop_first(&mut self) -> Option<IntakeEntry> {
        let (_, entry) = self.order.pop_first()?;
        self.index.remove(&entry.task_id);
        Some(entry)
    }
}

/// Priority-ordered, concurrency-safe task intake
pub struct DispatchQueue {
    tasks: DashMap<String, Task>,
    intake: Mutex<Intake>,
    notify: Notify,
    capacity: Option<Arc<Semaphore>>,
    seq: AtomicU64,
    closed: AtomicBool,
    snapshots: SnapshotStore,
    executor: Arc<dyn Executor>,
    config: QueueConfig,
    span: Span,
}

impl DispatchQueue {
    pub fn new(snapshots: SnapshotStore, executor: Arc<dyn Executor>, config: QueueConfig) -> Self {
        let capacity = config
            .queue_capacity
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            tasks: DashMap::new(),
            intake: Mutex::new(Intake::default()),
            notify: Notify::new(),
            capacity,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            snapshots,
            executor,
            config,
            span: info_span!("dispatch_queue"),
        }
    }

    /// Scope all queue logging under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Route a pending task immediately and return it in its new state
    ///
    /// Routing failures and stale snapshots are not errors: the returned
    /// task is `failed` with the reason in `error`. Only contract violations
    /// (task not pending, already held in a later state) are `Err`.
    pub async fn submit(&self, task: Task) -> Result<Task, DispatchError> {
        self.submit_inner(task).instrument(self.span.clone()).await
    }

    async fn submit_inner(&self, task: Task) -> Result<Task, DispatchError> {
        ensure_pending(&task)?;
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let id = task.id().to_string();
        match self.tasks.entry(id.clone()) {
            Entry::Occupied(mut held) => {
                // Already enqueued and still waiting: take it out of the intake
                // and route it now. Anything past pending is a retry too late.
                held.get_mut().mark_routing()?;
            }
            Entry::Vacant(slot) => {
                let mut task = task;
                task.mark_routing()?;
                slot.insert(task);
            }
        }
        self.intake.lock().await.remove(&id);

        self.route_task(&id).await
    }

    /// Add a pending task to the priority intake; returns its id
    ///
    /// Suspends while the intake is at capacity. Enqueueing a task that is
    /// already waiting is a no-op.
    pub async fn enqueue(&self, task: Task) -> Result<String, DispatchError> {
        self.enqueue_inner(task).instrument(self.span.clone()).await
    }

    async fn enqueue_inner(&self, task: Task) -> Result<String, DispatchError> {
        ensure_pending(&task)?;
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let id = task.id().to_string();
        if let Some(held) = self.tasks.get(&id) {
            ensure_pending(&held)?;
            debug!(task = %id, "task already waiting in intake");
            return Ok(id);
        }

        let permit = match &self.capacity {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DispatchError::Closed)?,
            ),
            None => None,
        };

        let key = IntakeKey {
            priority: Reverse(task.priority()),
            created_at: task.created_at(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };

        match self.tasks.entry(id.clone()) {
            Entry::Occupied(held) => {
                // Raced with another enqueue/submit of the same task
                ensure_pending(held.get())?;
                return Ok(id);
            }
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }

        {
            let mut intake = self.intake.lock().await;
            intake.index.insert(id.clone(), key);
            intake.order.insert(
                key,
                IntakeEntry {
                    task_id: id.clone(),
                    _permit: permit,
                },
            );
        }

        debug!(task = %id, priority = ?key.priority.0, "task enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Route the highest-priority waiting task, if any
    ///
    /// Entries cancelled while waiting are discarded.
    pub async fn dispatch_next(&self) -> Option<Task> {
        self.dispatch_next_inner().instrument(self.span.clone()).await
    }

    async fn dispatch_next_inner(&self) -> Option<Task> {
        loop {
            let entry = self.intake.lock().await.pop_first()?;
            let id = entry.task_id;

            let claimed = match self.tasks.get_mut(&id) {
                Some(mut task) if task.status() == TaskStatus::Pending => task.mark_routing().is_ok(),
                Some(task) => {
                    debug!(task = %id, status = %task.status(), "skipping intake entry");
                    false
                }
                None => false,
            };

            if !claimed {
                continue;
            }

            match self.route_task(&id).await {
                Ok(task) => return Some(task),
                Err(e) => warn!(task = %id, "routing aborted: {}", e),
            }
        }
    }

    /// Route a task that is already in `routing` and apply the outcome
    async fn route_task(&self, id: &str) -> Result<Task, DispatchError> {
        let snapshot = self.snapshots.wait_ready().await;

        let task = self
            .tasks
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;

        let stale = self.config.max_snapshot_age.and_then(|max_age| {
            snapshot.is_stale(max_age).then(|| DispatchError::StaleSnapshot {
                age_ms: snapshot.age().as_millis() as u64,
                max_age_ms: max_age.as_millis() as u64,
            })
        });

        let outcome = match stale {
            Some(err) => Err(err.to_string()),
            None => route(&task, snapshot.spec(), Some(&self.config.scoring))
                .map(|decision| decision.node)
                .map_err(|failure| failure.to_string()),
        };

        let handoff = {
            let mut held = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;

            if held.status() != TaskStatus::Routing {
                info!(task = %id, status = %held.status(), "routing result discarded");
                return Ok(held.clone());
            }

            match outcome {
                Ok(node) => {
                    held.mark_queued(node.clone())?;
                    info!(task = %id, task_type = %held.task_type(), node = %node, "task routed");
                    Some(held.clone())
                }
                Err(reason) => {
                    warn!(task = %id, task_type = %held.task_type(), "task failed: {}", reason);
                    held.mark_failed(reason)?;
                    None
                }
            }
        };

        if let Some(task) = handoff {
            match self.executor.dispatch(task).await {
                Ok(()) => {
                    // A cancel that landed during the hand-off reached the
                    // executor first; repeat it so it follows the dispatch.
                    let cancelled = self
                        .tasks
                        .get(id)
                        .is_some_and(|t| t.status() == TaskStatus::Cancelled);
                    if cancelled {
                        debug!(task = %id, "cancelled during hand-off, resending cancel");
                        if let Err(e) = self.executor.cancel(id).await {
                            warn!(task = %id, "cancel not delivered to executor: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!(task = %id, "executor hand-off failed: {}", e);
                    if let Some(mut held) = self.tasks.get_mut(id) {
                        if held.status() == TaskStatus::Queued {
                            held.mark_failed(format!("executor hand-off failed: {}", e))?;
                        }
                    }
                }
            }
        }

        self.get(id)
            .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a task in any non-terminal state
    ///
    /// Waiting and routing tasks never reach the executor afterwards.
    /// Queued and running tasks also get a best-effort cancel forwarded to
    /// the executor.
    pub async fn cancel(&self, id: &str) -> Result<Task, DispatchError> {
        self.cancel_inner(id).instrument(self.span.clone()).await
    }

    async fn cancel_inner(&self, id: &str) -> Result<Task, DispatchError> {
        let (previous, task) = {
            let mut held = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;
            let previous = held.status();
            held.cancel()?;
            (previous, held.clone())
        };

        self.intake.lock().await.remove(id);

        if matches!(previous, TaskStatus::Queued | TaskStatus::Running) {
            if let Err(e) = self.executor.cancel(id).await {
                warn!(task = %id, "cancel not delivered to executor: {}", e);
            }
        }

        info!(task = %id, from = %previous, "task cancelled");
        Ok(task)
    }

    // =========================================================================
    // Executor callbacks
    // =========================================================================

    /// The executor started the task
    ///
    /// Fails the task instead when it waited in `queued` longer than its
    /// `max_latency_ms`.
    pub fn mark_running(&self, id: &str) -> Result<Task, DispatchError> {
        let _enter = self.span.enter();
        let mut held = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;

        if let Some(timeout) = queue_timeout(&held, Utc::now()) {
            warn!(task = %id, "{}", timeout);
            held.mark_failed(timeout.to_string())?;
            return Err(timeout);
        }

        held.mark_running()?;
        debug!(task = %id, node = held.assigned_node().unwrap_or("-"), "task running");
        Ok(held.clone())
    }

    pub fn mark_completed(&self, id: &str, result: Option<Payload>) -> Result<Task, DispatchError> {
        let _enter = self.span.enter();
        let mut held = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;
        held.mark_completed(result)?;
        info!(task = %id, duration_ms = held.duration_ms(), "task completed");
        Ok(held.clone())
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<Task, DispatchError> {
        let _enter = self.span.enter();
        let mut held = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;
        let error = error.into();
        warn!(task = %id, "task failed: {}", error);
        held.mark_failed(error)?;
        Ok(held.clone())
    }

    /// Fail every queued task that has outlived its `max_latency_ms`
    pub fn expire_overdue(&self) -> Vec<Task> {
        let _enter = self.span.enter();
        let now = Utc::now();
        let mut expired = Vec::new();
        for mut held in self.tasks.iter_mut() {
            if let Some(timeout) = queue_timeout(&held, now) {
                warn!(task = %held.id(), "{}", timeout);
                if held.mark_failed(timeout.to_string()).is_ok() {
                    expired.push(held.clone());
                }
            }
        }
        expired
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Drop a completed, failed or cancelled task from the queue
    pub fn remove(&self, id: &str) -> Result<Task, DispatchError> {
        if let Some((_, task)) = self.tasks.remove_if(id, |_, t| t.status().is_terminal()) {
            debug!(parent: &self.span, task = %id, status = %task.status(), "task removed");
            return Ok(task);
        }
        match self.tasks.get(id) {
            Some(held) => Err(DispatchError::NotFinished {
                task_id: id.to_string(),
                status: held.status(),
            }),
            None => Err(DispatchError::TaskNotFound(id.to_string())),
        }
    }

    /// Drop every finished task that finished at least `older_than` ago
    ///
    /// Returns the number of tasks removed.
    pub fn evict_finished(&self, older_than: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let mut evicted = 0;
        self.tasks.retain(|_, task| {
            let expired = task.status().is_terminal()
                && task.completed_at().is_some_and(|at| at <= cutoff);
            if expired {
                evicted += 1;
            }
            !expired
        });

        if evicted > 0 {
            debug!(parent: &self.span, evicted, "evicted finished tasks");
        }
        evicted
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    /// All known tasks, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| t.created_at());
        tasks
    }

    /// Number of entries waiting in the intake
    pub async fn pending_len(&self) -> usize {
        self.intake.lock().await.order.len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in self.tasks.iter() {
            match task.status() {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Routing => stats.routing += 1,
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop accepting tasks and wake anyone waiting for capacity
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(semaphore) = &self.capacity {
            semaphore.close();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn `count` routing workers draining the intake
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> WorkerPool {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let count = count.max(1);

        let handles = (0..count)
            .map(|worker| {
                let queue = Arc::clone(self);
                let shutdown = shutdown_rx.clone();
                let span = info_span!(parent: &self.span, "routing_worker", worker);
                tokio::spawn(queue.run_worker(shutdown).instrument(span))
            })
            .collect();

        info!(parent: &self.span, "started {} routing worker(s)", count);

        WorkerPool {
            shutdown: shutdown_tx,
            handles,
        }
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Never interrupted mid-route: shutdown is only observed while idle
            if self.dispatch_next_inner().await.is_some() {
                continue;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("routing worker stopped");
    }
}

/// Handle to a set of routing workers
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and wait for every worker to finish its current task
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!("routing worker panicked: {}", e);
            }
        }
    }
}

fn ensure_pending(task: &Task) -> Result<(), TaskError> {
    if task.status() == TaskStatus::Pending {
        Ok(())
    } else {
        Err(TaskError::InvalidStateTransition {
            task_id: task.id().to_string(),
            from: task.status(),
            to: TaskStatus::Routing,
        })
    }
}

/// Queue-latency violation for a queued task, if any
fn queue_timeout(task: &Task, now: DateTime<Utc>) -> Option<DispatchError> {
    if task.status() != TaskStatus::Queued {
        return None;
    }
    let max_latency_ms = task.constraints().max_latency_ms?;
    let queued_at = task.queued_at()?;
    let waited_ms = (now - queued_at).num_milliseconds().max(0) as u64;
    (waited_ms > max_latency_ms).then(|| DispatchError::QueueTimeout {
        task_id: task.id().to_string(),
        waited_ms,
        max_latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Accelerator, AcceleratorType, Capability, ClusterSpec, NodeSpec};
    use crate::scheduler::executor::{ChannelExecutor, ExecutorError, ExecutorEvent, LoggingExecutor};
    use crate::scheduler::snapshot::ClusterSnapshot;
    use crate::task::TaskConstraints;
    use async_trait::async_trait;

    fn cluster() -> ClusterSpec {
        ClusterSpec::new("lab")
            .with_node(
                NodeSpec::new("A", "a")
                    .online()
                    .with_capability(Capability::LlmInference)
                    .with_accelerator(Accelerator::new(AcceleratorType::Nvidia, "3090").with_utilization(80.0)),
            )
            .with_node(
                NodeSpec::new("B", "b")
                    .online()
                    .with_capability(Capability::LlmInference)
                    .with_accelerator(Accelerator::new(AcceleratorType::Nvidia, "3090").with_utilization(20.0)),
            )
    }

    fn queue_with(executor: Arc<dyn Executor>, config: QueueConfig) -> DispatchQueue {
        DispatchQueue::new(SnapshotStore::with_spec(cluster()), executor, config)
    }

    fn queue() -> DispatchQueue {
        queue_with(Arc::new(LoggingExecutor), QueueConfig::default())
    }

    /// Holds each dispatch until the gate opens and records event order
    #[derive(Default)]
    struct GatedExecutor {
        gate: Notify,
        entered: Notify,
        events: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for GatedExecutor {
        async fn dispatch(&self, task: Task) -> Result<(), ExecutorError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.events.lock().unwrap().push(format!("dispatch:{}", task.id()));
            Ok(())
        }

        async fn cancel(&self, task_id: &str) -> Result<(), ExecutorError> {
            self.events.lock().unwrap().push(format!("cancel:{}", task_id));
            Ok(())
        }
    }

    struct RejectingExecutor;

    #[async_trait]
    impl Executor for RejectingExecutor {
        async fn dispatch(&self, task: Task) -> Result<(), ExecutorError> {
            Err(ExecutorError::Rejected(task.id().to_string(), "busy".into()))
        }

        async fn cancel(&self, _task_id: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_routes_and_queues() {
        let queue = queue();
        let task = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.assigned_node(), Some("B"));
        assert!(task.queued_at().is_some());
    }

    #[tokio::test]
    async fn test_submit_failure_marks_failed() {
        let queue = queue();
        let task = queue.submit(Task::new(Capability::Embeddings)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task
            .error()
            .unwrap()
            .starts_with("no node satisfies capability/constraints"));
        assert!(task.assigned_node().is_none());
    }

    #[tokio::test]
    async fn test_submit_twice_rejected() {
        let queue = queue();
        let task = Task::new(Capability::LlmInference);
        let retry = task.clone();

        queue.submit(task).await.unwrap();
        let err = queue.submit(retry).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidState(TaskError::InvalidStateTransition {
                from: TaskStatus::Queued,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_submit_while_routing_rejected() {
        let store = SnapshotStore::new();
        let queue = Arc::new(DispatchQueue::new(
            store.clone(),
            Arc::new(LoggingExecutor),
            QueueConfig::default(),
        ));
        let task = Task::new(Capability::LlmInference);
        let retry = task.clone();

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(task).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.stats().routing, 1);

        let err = queue.submit(retry).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidState(TaskError::InvalidStateTransition {
                from: TaskStatus::Routing,
                ..
            })
        ));

        store.publish(cluster());
        let routed = first.await.unwrap().unwrap();
        assert_eq!(routed.status(), TaskStatus::Queued);
        assert_eq!(queue.stats().total(), 1);
    }

    #[tokio::test]
    async fn test_submit_non_pending_rejected() {
        let queue = queue();
        let routed = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        let err = queue.submit(routed).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = queue();
        let low = Task::new(Capability::LlmInference).with_priority(TaskPriority::Low);
        let normal_1 = Task::new(Capability::LlmInference);
        let critical = Task::new(Capability::LlmInference).with_priority(TaskPriority::Critical);
        let normal_2 = Task::new(Capability::LlmInference);
        let expected = vec![
            critical.id().to_string(),
            normal_1.id().to_string(),
            normal_2.id().to_string(),
            low.id().to_string(),
        ];

        for task in [low, normal_1, critical, normal_2] {
            queue.enqueue(task).await.unwrap();
        }
        assert_eq!(queue.pending_len().await, 4);

        let mut order = Vec::new();
        while let Some(task) = queue.dispatch_next().await {
            assert_eq!(task.status(), TaskStatus::Queued);
            order.push(task.id().to_string());
        }
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_pending() {
        let queue = queue();
        let task = Task::new(Capability::LlmInference);
        queue.enqueue(task.clone()).await.unwrap();
        queue.enqueue(task).await.unwrap();
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_skips_handoff() {
        let (executor, mut rx) = ChannelExecutor::new(8);
        let queue = queue_with(Arc::new(executor), QueueConfig::default());

        let id = queue.enqueue(Task::new(Capability::LlmInference)).await.unwrap();
        let cancelled = queue.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);
        assert_eq!(queue.pending_len().await, 0);

        assert!(queue.dispatch_next().await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_running_forwards_to_executor() {
        let (executor, mut rx) = ChannelExecutor::new(8);
        let queue = queue_with(Arc::new(executor), QueueConfig::default());

        let task = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ExecutorEvent::Dispatch(_))));

        queue.mark_running(task.id()).unwrap();
        queue.cancel(task.id()).await.unwrap();

        match rx.recv().await {
            Some(ExecutorEvent::Cancel(id)) => assert_eq!(id, task.id()),
            other => panic!("expected cancel, got {:?}", other),
        }
        assert!(queue.mark_completed(task.id(), None).is_err());
    }

    #[tokio::test]
    async fn test_cancel_terminal_rejected() {
        let queue = queue();
        let failed = queue.submit(Task::new(Capability::Storage)).await.unwrap();
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert!(matches!(
            queue.cancel(failed.id()).await,
            Err(DispatchError::InvalidState(_))
        ));
        assert!(matches!(
            queue.cancel("nope").await,
            Err(DispatchError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_handoff_resends_cancel() {
        let executor = Arc::new(GatedExecutor::default());
        let queue = Arc::new(queue_with(executor.clone(), QueueConfig::default()));
        let task = Task::new(Capability::LlmInference);
        let id = task.id().to_string();

        let submitted = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(task).await })
        };
        executor.entered.notified().await;
        assert_eq!(queue.get(&id).unwrap().status(), TaskStatus::Queued);

        queue.cancel(&id).await.unwrap();
        executor.gate.notify_one();

        let task = submitted.await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        let events = executor.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                format!("cancel:{}", id),
                format!("dispatch:{}", id),
                format!("cancel:{}", id),
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_only_finished_tasks() {
        let queue = queue();
        let queued = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        let failed = queue.submit(Task::new(Capability::Storage)).await.unwrap();

        assert_eq!(
            queue.remove(queued.id()),
            Err(DispatchError::NotFinished {
                task_id: queued.id().to_string(),
                status: TaskStatus::Queued,
            })
        );

        let removed = queue.remove(failed.id()).unwrap();
        assert_eq!(removed.status(), TaskStatus::Failed);
        assert!(queue.get(failed.id()).is_none());
        assert!(matches!(
            queue.remove(failed.id()),
            Err(DispatchError::TaskNotFound(_))
        ));
        assert_eq!(queue.stats().total(), 1);
    }

    #[tokio::test]
    async fn test_evict_finished_bounds_arena() {
        let queue = queue();
        for _ in 0..1000 {
            let id = queue.enqueue(Task::new(Capability::LlmInference)).await.unwrap();
            queue.cancel(&id).await.unwrap();
        }
        let live = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        assert_eq!(queue.tasks().len(), 1001);

        // Nothing finished an hour ago yet
        assert_eq!(queue.evict_finished(Duration::from_secs(3600)), 0);

        assert_eq!(queue.evict_finished(Duration::ZERO), 1000);
        let remaining = queue.tasks();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), live.id());
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_evict_respects_completion_time() {
        let queue = queue();
        let old = queue.submit(Task::new(Capability::Storage)).await.unwrap();
        let recent = queue.submit(Task::new(Capability::Storage)).await.unwrap();
        {
            let mut held = queue.tasks.get_mut(old.id()).unwrap();
            let created = held.created_at();
            held.set_timestamps(
                created,
                None,
                Some(Utc::now() - chrono::Duration::seconds(600)),
            );
        }

        assert_eq!(queue.evict_finished(Duration::from_secs(60)), 1);
        assert!(queue.get(old.id()).is_none());
        assert!(queue.get(recent.id()).is_some());
    }

    #[tokio::test]
    async fn test_executor_lifecycle() {
        let queue = queue();
        let task = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();

        let running = queue.mark_running(task.id()).unwrap();
        assert!(running.started_at().is_some());

        let done = queue
            .mark_completed(task.id(), Some(Payload::Text("hello".into())))
            .unwrap();
        assert_eq!(done.status(), TaskStatus::Completed);
        assert!(done.duration_ms().is_some());
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_queue_latency_timeout() {
        let queue = queue();
        let task = Task::new(Capability::LlmInference)
            .with_constraints(TaskConstraints::default().max_latency(1_000));
        let id = queue.submit(task).await.unwrap().id().to_string();

        queue
            .tasks
            .get_mut(&id)
            .unwrap()
            .set_queued_at(Utc::now() - chrono::Duration::seconds(5));

        let err = queue.mark_running(&id).unwrap_err();
        assert!(matches!(err, DispatchError::QueueTimeout { max_latency_ms: 1_000, .. }));

        let task = queue.get(&id).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().contains("waited"));
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let queue = queue();
        let slow = Task::new(Capability::LlmInference)
            .with_constraints(TaskConstraints::default().max_latency(10));
        let unbounded = Task::new(Capability::LlmInference);
        let slow_id = queue.submit(slow).await.unwrap().id().to_string();
        queue.submit(unbounded).await.unwrap();

        queue
            .tasks
            .get_mut(&slow_id)
            .unwrap()
            .set_queued_at(Utc::now() - chrono::Duration::seconds(1));

        let expired = queue.expire_overdue();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), slow_id);
        assert_eq!(queue.stats().queued, 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_fails_task() {
        let store = SnapshotStore::new();
        store.publish_snapshot(ClusterSnapshot::taken_at(
            cluster(),
            Utc::now() - chrono::Duration::seconds(600),
        ));
        let queue = DispatchQueue::new(store, Arc::new(LoggingExecutor), QueueConfig::default());

        let task = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().contains("stale"));
    }

    #[tokio::test]
    async fn test_staleness_check_disabled() {
        let store = SnapshotStore::new();
        store.publish_snapshot(ClusterSnapshot::taken_at(
            cluster(),
            Utc::now() - chrono::Duration::seconds(600),
        ));
        let config = QueueConfig {
            max_snapshot_age: None,
            ..QueueConfig::default()
        };
        let queue = DispatchQueue::new(store, Arc::new(LoggingExecutor), config);
        let task = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_rejected_handoff_fails_task() {
        let queue = queue_with(Arc::new(RejectingExecutor), QueueConfig::default());
        let task = queue.submit(Task::new(Capability::LlmInference)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().contains("hand-off"));
    }

    #[tokio::test]
    async fn test_bounded_capacity_suspends() {
        let config = QueueConfig {
            queue_capacity: Some(1),
            ..QueueConfig::default()
        };
        let queue = Arc::new(queue_with(Arc::new(LoggingExecutor), config));
        queue.enqueue(Task::new(Capability::LlmInference)).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(Task::new(Capability::LlmInference)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        queue.dispatch_next().await.unwrap();
        let id = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(queue.get(&id).unwrap().status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = queue();
        queue.close();
        assert_eq!(
            queue.enqueue(Task::new(Capability::LlmInference)).await,
            Err(DispatchError::Closed)
        );
    }

    #[tokio::test]
    async fn test_workers_drain_intake() {
        let queue = Arc::new(queue());
        let pool = queue.spawn_workers(2);
        assert_eq!(pool.len(), 2);

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(queue.enqueue(Task::new(Capability::LlmInference)).await.unwrap());
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().queued < ids.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.shutdown().await;
        for id in ids {
            assert_eq!(queue.get(&id).unwrap().status(), TaskStatus::Queued);
        }
    }

    #[tokio::test]
    async fn test_routing_waits_for_first_snapshot() {
        let store = SnapshotStore::new();
        let queue = Arc::new(DispatchQueue::new(
            store.clone(),
            Arc::new(LoggingExecutor),
            QueueConfig::default(),
        ));

        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(Task::new(Capability::LlmInference)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(queue.stats().routing, 1);

        store.publish(cluster());
        let task = pending.await.unwrap().unwrap();
        assert_eq!(task.assigned_node(), Some("B"));
    }
}
