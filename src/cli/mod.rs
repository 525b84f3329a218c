//! CLI module for pve-orch
//!
//! Subcommands:
//! - `pve-orch status` - Cluster summary from the config file
//! - `pve-orch nodes` - List nodes, optionally by capability
//! - `pve-orch route` - Show where a task would go (`--explain` for the ranking)
//! - `pve-orch run` - Route a task through the dispatch queue
//! - `pve-orch discover --local` - Probe this machine and print a node entry
//! - `pve-orch init` - Write a starter config file

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::hardware::Capability;
use crate::task::{ParamValue, TaskPriority};

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "pve-orch")]
#[command(about = "AI-native task routing for Proxmox VE clusters")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to cluster config (default: ~/.pve-orch/cluster.yaml)
    #[arg(long, global = true, env = "PVE_ORCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show cluster status
    Status,

    /// List cluster nodes
    Nodes(NodesArgs),

    /// Show which node a task would be routed to
    Route(RouteArgs),

    /// Submit a task and report its routing outcome
    Run(RunArgs),

    /// Discover hardware and print a node entry
    Discover(DiscoverArgs),

    /// Write a starter cluster config
    Init(InitArgs),
}

/// Arguments for the nodes command
#[derive(Parser, Debug)]
pub struct NodesArgs {
    /// Only nodes advertising this capability
    #[arg(short, long)]
    pub capability: Option<Capability>,

    /// Include offline nodes
    #[arg(short, long)]
    pub all: bool,
}

/// Task description shared by `route` and `run`
#[derive(Args, Debug, Clone)]
pub struct TaskArgs {
    /// Task type (e.g. llm-inference, speech-to-text)
    pub task_type: Capability,

    /// Model the task needs
    #[arg(short, long)]
    pub model: Option<String>,

    /// Preferred node
    #[arg(short, long)]
    pub node: Option<String>,

    /// Never route to this node (repeatable)
    #[arg(short = 'x', long = "exclude")]
    pub exclude: Vec<String>,

    /// Minimum accelerator memory in GB
    #[arg(long)]
    pub min_vram: Option<f64>,

    /// Only consider nodes already serving the model
    #[arg(long)]
    pub require_warm: bool,

    /// Maximum time in queue before failing, in milliseconds
    #[arg(long)]
    pub max_latency_ms: Option<u64>,

    /// Priority: low, normal, high, critical
    #[arg(long, default_value = "normal")]
    pub priority: TaskPriority,
}

/// Arguments for the route command
#[derive(Parser, Debug)]
pub struct RouteArgs {
    #[command(flatten)]
    pub task: TaskArgs,

    /// Show every candidate with its score breakdown
    #[arg(long)]
    pub explain: bool,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub task: TaskArgs,

    /// Text input for the task
    #[arg(default_value = "")]
    pub input: String,

    /// Task parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, ParamValue)>,

    /// Overlay live readings from local nvidia-smi onto this node first
    #[arg(long, value_name = "NODE")]
    pub local_gpus: Option<String>,
}

/// Arguments for the discover command
#[derive(Parser, Debug)]
pub struct DiscoverArgs {
    /// Probe the machine this command runs on
    #[arg(long, required = true)]
    pub local: bool,

    /// Node name (default: hostname)
    #[arg(long)]
    pub name: Option<String>,
}

/// Arguments for the init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Cluster name
    #[arg(long, default_value = "homelab")]
    pub name: String,

    /// Proxmox API host
    #[arg(long)]
    pub proxmox_host: Option<String>,

    /// Proxmox API user
    #[arg(long, default_value = "root@pam")]
    pub user: String,

    /// Add this machine as the first node
    #[arg(long)]
    pub with_local: bool,

    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
}
