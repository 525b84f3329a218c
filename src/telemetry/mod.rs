//! Topology telemetry
//!
//! Collaborators that produce [`ClusterSpec`] values for the routing core.
//! Transport (SSH, the Proxmox HTTP API) stays outside the crate; this module
//! holds the source abstraction, a periodic refresher that publishes into a
//! [`SnapshotStore`], and pure parsers/mergers for the data those transports
//! return.

pub mod local;
pub mod nvidia;
pub mod proxmox;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::hardware::{ClusterSpec, TopologyError};
use crate::scheduler::SnapshotStore;

pub use local::{infer_capabilities, probe_local_node};
pub use nvidia::{apply_gpu_status, parse_nvidia_smi_csv, query_local_gpus, GpuStatus};
pub use proxmox::{apply_pve_status, parse_pve_nodes, PveNodeStatus};

/// Default topology refresh interval in seconds
pub const REFRESH_INTERVAL_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to parse line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Something that can produce the current cluster topology
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<ClusterSpec, TelemetryError>;
}

/// Fixed topology, typically loaded from the config file
#[derive(Debug, Clone)]
pub struct StaticSource {
    spec: ClusterSpec,
}

impl StaticSource {
    pub fn new(spec: ClusterSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl TopologySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<ClusterSpec, TelemetryError> {
        Ok(self.spec.clone())
    }
}

/// Configured topology overlaid with live readings from this machine's GPUs
///
/// `node` names the entry in the base topology that this process runs on.
#[derive(Debug, Clone)]
pub struct LocalGpuSource {
    base: ClusterSpec,
    node: String,
}

impl LocalGpuSource {
    pub fn new(base: ClusterSpec, node: impl Into<String>) -> Self {
        Self {
            base,
            node: node.into(),
        }
    }
}

#[async_trait]
impl TopologySource for LocalGpuSource {
    fn name(&self) -> &str {
        "local-gpu"
    }

    async fn fetch(&self) -> Result<ClusterSpec, TelemetryError> {
        let gpus = query_local_gpus().await?;
        let mut spec = self.base.clone();
        match spec.node_mut(&self.node) {
            Some(node) => apply_gpu_status(node, &gpus),
            None => return Err(TopologyError::UnknownNode(self.node.clone()).into()),
        }
        Ok(spec)
    }
}

/// Configuration for the topology refresher
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    /// Seconds between refreshes (default: 30)
    pub interval_secs: u64,

    /// Consecutive failures before logging at error level
    pub max_retries: u32,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval_secs: REFRESH_INTERVAL_SECS,
            max_retries: 3,
        }
    }
}

impl RefresherConfig {
    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }
}

/// Background task publishing fresh snapshots from a [`TopologySource`]
pub struct TopologyRefresher {
    source: Arc<dyn TopologySource>,
    store: SnapshotStore,
    config: RefresherConfig,
}

impl TopologyRefresher {
    pub fn new(source: Arc<dyn TopologySource>, store: SnapshotStore, config: RefresherConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Fetch, validate and publish one snapshot
    ///
    /// On failure the previously published snapshot stays in place.
    pub async fn refresh_once(&self) -> Result<(), TelemetryError> {
        let spec = self.source.fetch().await?;
        spec.validate()?;
        let online = spec.online_count();
        let total = spec.nodes.len();
        self.store.publish(spec);
        debug!(source = self.source.name(), online, total, "published cluster snapshot");
        Ok(())
    }

    /// Refresh immediately, then every interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let mut consecutive_failures = 0u32;

        info!(
            "Starting topology refresher: source={}, interval={}s",
            self.source.name(),
            self.config.interval_secs
        );

        loop {
            match self.refresh_once().await {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!("Topology refresh recovered after {} failures", consecutive_failures);
                    }
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_retries {
                        error!(
                            "Topology refresh failed {} consecutive times: {}",
                            consecutive_failures, e
                        );
                    } else {
                        warn!("Topology refresh failed (attempt {}): {}", consecutive_failures, e);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Topology refresher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn a topology refresher as a background task
///
/// Returns a shutdown sender that stops the loop.
pub fn spawn_refresher(
    source: Arc<dyn TopologySource>,
    store: SnapshotStore,
    config: RefresherConfig,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = TopologyRefresher::new(source, store, config);

    tokio::spawn(async move {
        refresher.run(shutdown_rx).await;
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::NodeSpec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TopologySource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self) -> Result<ClusterSpec, TelemetryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(ClusterSpec::new("first"))
            } else {
                Err(TelemetryError::CommandFailed {
                    command: "ssh".into(),
                    message: "unreachable".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_static_source_publishes() {
        let store = SnapshotStore::new();
        let refresher = TopologyRefresher::new(
            Arc::new(StaticSource::new(ClusterSpec::new("lab"))),
            store.clone(),
            RefresherConfig::default(),
        );
        refresher.refresh_once().await.unwrap();
        assert_eq!(store.current().unwrap().spec().name, "lab");
    }

    #[tokio::test]
    async fn test_invalid_topology_not_published() {
        let store = SnapshotStore::with_spec(ClusterSpec::new("good"));
        let dup = ClusterSpec::new("bad")
            .with_node(NodeSpec::new("a", "h1"))
            .with_node(NodeSpec::new("a", "h2"));
        let refresher = TopologyRefresher::new(
            Arc::new(StaticSource::new(dup)),
            store.clone(),
            RefresherConfig::default(),
        );

        let err = refresher.refresh_once().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Topology(TopologyError::DuplicateNode(_))));
        assert_eq!(store.current().unwrap().spec().name, "good");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_snapshot() {
        let store = SnapshotStore::new();
        let refresher = TopologyRefresher::new(
            Arc::new(FlakySource {
                calls: AtomicU32::new(0),
            }),
            store.clone(),
            RefresherConfig::default(),
        );

        refresher.refresh_once().await.unwrap();
        assert!(refresher.refresh_once().await.is_err());
        assert_eq!(store.current().unwrap().spec().name, "first");
    }

    #[tokio::test]
    async fn test_spawn_refresher_publishes_and_stops() {
        let store = SnapshotStore::new();
        let shutdown = spawn_refresher(
            Arc::new(StaticSource::new(ClusterSpec::new("bg"))),
            store.clone(),
            RefresherConfig::default().with_interval(3600),
        );

        let snapshot = tokio::time::timeout(Duration::from_secs(1), store.wait_ready())
            .await
            .unwrap();
        assert_eq!(snapshot.spec().name, "bg");
        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_local_gpu_source_unknown_node() {
        let source = LocalGpuSource::new(ClusterSpec::new("lab"), "ghost");
        assert!(source.fetch().await.is_err());
    }

    #[test]
    fn test_refresher_config_defaults() {
        let config = RefresherConfig::default();
        assert_eq!(config.interval_secs, REFRESH_INTERVAL_SECS);
        assert_eq!(config.max_retries, 3);
    }
}
