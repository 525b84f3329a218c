//! Cluster snapshots shared between telemetry and routing
//!
//! A [`SnapshotStore`] holds the latest [`ClusterSnapshot`] behind a
//! `tokio::sync::watch` channel. Publishing replaces the whole snapshot, so a
//! routing decision always sees one consistent topology.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::hardware::ClusterSpec;

/// An immutable point-in-time view of the cluster
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    spec: ClusterSpec,
    taken_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    /// Snapshot taken now
    pub fn new(spec: ClusterSpec) -> Self {
        Self::taken_at(spec, Utc::now())
    }

    pub fn taken_at(spec: ClusterSpec, taken_at: DateTime<Utc>) -> Self {
        Self { spec, taken_at }
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Time since the snapshot was taken (zero if the clock went backwards)
    pub fn age(&self) -> Duration {
        (Utc::now() - self.taken_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

/// Latest-snapshot cell with change notification
#[derive(Clone)]
pub struct SnapshotStore {
    tx: Arc<watch::Sender<Option<Arc<ClusterSnapshot>>>>,
}

impl SnapshotStore {
    /// Empty store; routing waits until the first publish
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Store pre-loaded with `spec`
    pub fn with_spec(spec: ClusterSpec) -> Self {
        let store = Self::new();
        store.publish(spec);
        store
    }

    /// Replace the current snapshot with a fresh one taken now
    pub fn publish(&self, spec: ClusterSpec) -> Arc<ClusterSnapshot> {
        self.publish_snapshot(ClusterSnapshot::new(spec))
    }

    pub fn publish_snapshot(&self, snapshot: ClusterSnapshot) -> Arc<ClusterSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(Some(snapshot.clone()));
        snapshot
    }

    /// Current snapshot, if any has been published
    pub fn current(&self) -> Option<Arc<ClusterSnapshot>> {
        self.tx.borrow().clone()
    }

    /// Wait until a snapshot is available
    pub async fn wait_ready(&self) -> Arc<ClusterSnapshot> {
        if let Some(snapshot) = self.current() {
            return snapshot;
        }
        let mut rx = self.tx.subscribe();
        loop {
            let latest = rx.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                return snapshot;
            }
            // The sender is owned by `self`, so the channel cannot close here.
            let _ = rx.changed().await;
        }
    }

    /// Receiver notified on every publish
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClusterSnapshot>>> {
        self.tx.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
