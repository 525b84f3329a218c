//! # pve-orch
//!
//! Routes AI workloads (LLM inference, image/video generation, speech-to-text,
//! embeddings, training, preprocessing, storage) to the best-suited node of a
//! heterogeneous Proxmox VE cluster.
//!
//! - [`hardware`]: cluster topology model
//! - [`task`]: task model and lifecycle state machine
//! - [`scheduler`]: routing engine, snapshot store and dispatch queue
//! - [`telemetry`]: topology sources and hardware readings
//! - [`config`]: cluster config file
//! - [`cli`]: command-line front end

pub mod cli;
pub mod config;
pub mod hardware;
pub mod scheduler;
pub mod task;
pub mod telemetry;

pub use hardware::{
    Accelerator, AcceleratorType, Capability, ClusterSpec, NodeSpec, PowerState, ServiceEndpoint,
    TopologyError,
};
pub use scheduler::{
    select_node, DispatchError, DispatchQueue, Executor, QueueConfig, RoutingFailure,
    SnapshotStore,
};
pub use task::{ParamValue, Payload, Task, TaskConstraints, TaskError, TaskPriority, TaskStatus};
