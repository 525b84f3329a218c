//! # Task Scheduling
//!
//! Routing engine and dispatch queue.
//!
//! ## Flow
//!
//! ```text
//!   submit / enqueue
//!          │
//!          ▼
//!   ┌──────────────┐   pop (priority, created_at, seq)
//!   │ DispatchQueue│──────────────────────────┐
//!   └──────────────┘                          ▼
//!          ▲                          ┌───────────────┐
//!          │ mark_running/completed   │ select_node   │◄── SnapshotStore
//!          │                          └───────────────┘
//!   ┌──────────────┐      queued task         │
//!   │   Executor   │◄─────────────────────────┘
//!   └──────────────┘
//! ```
//!
//! Routing is a pure function of one task and one [`ClusterSnapshot`]; it
//! never awaits and never mutates its inputs.

pub mod executor;
pub mod queue;
pub mod routing;
pub mod scoring;
pub mod snapshot;

pub use executor::{ChannelExecutor, Executor, ExecutorError, ExecutorEvent, LoggingExecutor};
pub use queue::{DispatchError, DispatchQueue, QueueConfig, QueueStats, WorkerPool};
pub use routing::{
    rank_candidates, route, select_node, select_node_with, FailureDetail, RoutingDecision,
    RoutingFailure,
};
pub use scoring::{
    calculate_node_score, compare_node_scores, NodeScore, ScoreBreakdown, ScoringWeights,
    WARM_MODEL_BONUS,
};
pub use snapshot::{ClusterSnapshot, SnapshotStore};

/// Default number of routing workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default bound on waiting tasks
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default snapshot freshness bound in seconds
pub const DEFAULT_MAX_SNAPSHOT_AGE_SECS: u64 = 120;
