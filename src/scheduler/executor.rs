//! Hand-off boundary to whatever actually runs a routed task
//!
//! The dispatch queue calls [`Executor::dispatch`] once per task that reaches
//! `queued`. Execution itself lives outside this crate; the executor reports
//! progress back through the queue's `mark_*` callbacks.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::task::Task;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Executor is closed")]
    Closed,

    #[error("Executor rejected task '{0}': {1}")]
    Rejected(String, String),
}

/// Control messages emitted by [`ChannelExecutor`]
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// A task reached `queued` and should be started on its assigned node
    Dispatch(Task),
    /// Best-effort request to stop a running task
    Cancel(String),
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Receive a task in `queued` status with `assigned_node` set
    async fn dispatch(&self, task: Task) -> Result<(), ExecutorError>;

    /// Forward a cancellation for a task that may already be running
    ///
    /// A cancel can overtake the dispatch of the same task. When that
    /// happens the queue sends the cancel again once the dispatch returns,
    /// so the last event for an id is always the cancel.
    async fn cancel(&self, task_id: &str) -> Result<(), ExecutorError>;
}

/// Executor that forwards every event onto an mpsc channel
#[derive(Clone)]
pub struct ChannelExecutor {
    tx: mpsc::Sender<ExecutorEvent>,
}

impl ChannelExecutor {
    /// Create the executor and the receiving end for the external runner
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Executor for ChannelExecutor {
    async fn dispatch(&self, task: Task) -> Result<(), ExecutorError> {
        self.tx
            .send(ExecutorEvent::Dispatch(task))
            .await
            .map_err(|_| ExecutorError::Closed)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ExecutorError> {
        self.tx
            .send(ExecutorEvent::Cancel(task_id.to_string()))
            .await
            .map_err(|_| ExecutorError::Closed)
    }
}

/// Executor that only logs hand-offs (dry runs and the CLI)
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl Executor for LoggingExecutor {
    async fn dispatch(&self, task: Task) -> Result<(), ExecutorError> {
        info!(
            task = %task.id(),
            node = task.assigned_node().unwrap_or("-"),
            "task handed off (no executor attached)"
        );
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ExecutorError> {
        info!(task = %task_id, "cancellation requested (no executor attached)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Capability;

    #[tokio::test]
    async fn test_channel_executor_forwards() {
        let (executor, mut rx) = ChannelExecutor::new(4);
        let task = Task::new(Capability::Training);
        let id = task.id().to_string();

        executor.dispatch(task).await.unwrap();
        executor.cancel(&id).await.unwrap();

        match rx.recv().await {
            Some(ExecutorEvent::Dispatch(t)) => assert_eq!(t.id(), id),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await {
            Some(ExecutorEvent::Cancel(t)) => assert_eq!(t, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_executor_closed() {
        let (executor, rx) = ChannelExecutor::new(1);
        drop(rx);
        let result = executor.dispatch(Task::new(Capability::Storage)).await;
        assert!(matches!(result, Err(ExecutorError::Closed)));
    }

    #[tokio::test]
    async fn test_logging_executor_accepts() {
        tokio_test::assert_ok!(LoggingExecutor.dispatch(Task::new(Capability::Storage)).await);
        tokio_test::assert_ok!(LoggingExecutor.cancel("abc").await);
    }
}
