//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::{InitArgs, RunArgs, TaskArgs};
use crate::config::{default_config_path, load_config_file, ConfigError, OrchestratorConfig};
use crate::hardware::{Capability, ClusterSpec, NodeSpec};
use crate::scheduler::{
    rank_candidates, DispatchError, DispatchQueue, LoggingExecutor, NodeScore, ScoringWeights,
    SnapshotStore,
};
use crate::task::{ParamValue, Payload, Task, TaskConstraints};
use crate::telemetry::{probe_local_node, LocalGpuSource, TelemetryError, TopologySource};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Config already exists at {0} (use --force to overwrite)")]
    AlreadyExists(PathBuf),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Config
// ============================================================================

/// Config path from `--config`, or the default location
pub fn resolve_config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf).unwrap_or_else(default_config_path)
}

pub fn load_orchestrator_config(path: Option<&Path>) -> CommandResult<OrchestratorConfig> {
    Ok(load_config_file(&resolve_config_path(path))?)
}

/// Build the starter config written by `init`
pub fn init_config(args: &InitArgs) -> OrchestratorConfig {
    let mut cluster = ClusterSpec::new(args.name.clone());
    cluster.proxmox_host = args.proxmox_host.clone();
    cluster.proxmox_user = args.user.clone();
    if args.with_local {
        cluster.nodes.push(probe_local_node(None));
    }
    OrchestratorConfig::new(cluster)
}

// ============================================================================
// Status
// ============================================================================

/// Summary for `pve-orch status`
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub proxmox_host: Option<String>,
    pub nodes: usize,
    pub online: usize,
    pub gpus: u32,
    /// Online nodes per capability, every capability listed
    pub coverage: BTreeMap<Capability, usize>,
}

pub fn cluster_status(cluster: &ClusterSpec) -> ClusterStatus {
    let coverage = Capability::ALL
        .iter()
        .map(|cap| (*cap, cluster.nodes_with_capability(*cap).len()))
        .collect();

    ClusterStatus {
        name: cluster.name.clone(),
        proxmox_host: cluster.proxmox_host.clone(),
        nodes: cluster.nodes.len(),
        online: cluster.online_count(),
        gpus: cluster
            .nodes
            .iter()
            .filter(|n| n.online)
            .map(NodeSpec::gpu_count)
            .sum(),
        coverage,
    }
}

/// Nodes shown by `pve-orch nodes`
pub fn filter_nodes(
    cluster: &ClusterSpec,
    capability: Option<Capability>,
    include_offline: bool,
) -> Vec<&NodeSpec> {
    cluster
        .nodes
        .iter()
        .filter(|n| include_offline || n.online)
        .filter(|n| capability.map_or(true, |c| n.has_capability(c)))
        .collect()
}

// ============================================================================
// Tasks
// ============================================================================

/// Parse a `key=value` task parameter
///
/// Values are typed by shape: `true`/`false`, integers, floats, else text.
pub fn parse_param(s: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }

    let value = value.trim();
    let value = if let Ok(b) = value.parse::<bool>() {
        ParamValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        ParamValue::Int(i)
    } else if let Ok(f) = value.parse::<f64>() {
        ParamValue::Float(f)
    } else {
        ParamValue::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

/// Build a pending task from CLI arguments
pub fn build_task(args: &TaskArgs) -> Task {
    let mut constraints = TaskConstraints::default();
    if let Some(node) = &args.node {
        constraints = constraints.prefer(node.clone());
    }
    for node in &args.exclude {
        constraints = constraints.exclude(node.clone());
    }
    if let Some(gb) = args.min_vram {
        constraints = constraints.min_vram(gb);
    }
    if let Some(ms) = args.max_latency_ms {
        constraints = constraints.max_latency(ms);
    }
    if args.require_warm {
        constraints = constraints.warm_only();
    }

    let mut task = Task::new(args.task_type)
        .with_priority(args.priority)
        .with_constraints(constraints);
    if let Some(model) = &args.model {
        task = task.with_model(model.clone());
    }
    task
}

/// Routing report for `pve-orch route`
#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub task_type: Capability,
    pub model: Option<String>,
    pub selected: Option<String>,
    pub ranking: Vec<NodeScore>,
    pub error: Option<String>,
}

pub fn explain_route(task: &Task, cluster: &ClusterSpec, weights: &ScoringWeights) -> RouteReport {
    let (selected, ranking, error) = match rank_candidates(task, cluster, Some(weights)) {
        Ok(ranking) => (ranking.first().map(|s| s.node.clone()), ranking, None),
        Err(failure) => (None, Vec::new(), Some(failure.to_string())),
    };

    RouteReport {
        task_type: task.task_type(),
        model: task.model().map(str::to_string),
        selected,
        ranking,
        error,
    }
}

/// Route a task through a one-shot dispatch queue
///
/// With `--local-gpus NODE`, live nvidia-smi readings are merged into that
/// node before routing. Hand-off goes to the logging executor.
pub async fn run_task(config: &OrchestratorConfig, args: &RunArgs) -> CommandResult<Task> {
    let cluster = match &args.local_gpus {
        Some(node) => {
            LocalGpuSource::new(config.cluster.clone(), node.clone())
                .fetch()
                .await?
        }
        None => config.cluster.clone(),
    };

    let mut task = build_task(&args.task);
    if !args.input.is_empty() {
        task = task.with_input(Payload::Text(args.input.clone()));
    }
    for (key, value) in &args.params {
        task = task.with_param(key.clone(), value.clone());
    }

    let queue = DispatchQueue::new(
        SnapshotStore::with_spec(cluster),
        Arc::new(LoggingExecutor),
        config.scheduler.queue_config(),
    );
    Ok(queue.submit(task).await?)
}
