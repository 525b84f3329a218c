//! Hardware capability registry - describes what each node can do
//!
//! A [`ClusterSpec`] is an immutable snapshot of the cluster topology. It is
//! produced by the config loader or a telemetry collaborator and read by the
//! routing engine. Runtime values that have not been reported are kept as
//! `None` rather than defaulted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when building or querying a topology
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Node '{0}' not found in cluster")]
    UnknownNode(String),

    #[error("Node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("Unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("Node '{node}' accelerator '{model}': {reason}")]
    InvalidAccelerator {
        node: String,
        model: String,
        reason: String,
    },
}

/// Vendor family of an accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorType {
    Nvidia,
    Tenstorrent,
    Amd,
    Intel,
    Cpu,
}

impl AcceleratorType {
    /// Whether this is a discrete accelerator (anything but the host CPU)
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, AcceleratorType::Cpu)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorType::Nvidia => "nvidia",
            AcceleratorType::Tenstorrent => "tenstorrent",
            AcceleratorType::Amd => "amd",
            AcceleratorType::Intel => "intel",
            AcceleratorType::Cpu => "cpu",
        }
    }
}

impl fmt::Display for AcceleratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One class of compute device on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accelerator {
    /// Vendor family
    #[serde(rename = "type")]
    pub accelerator_type: AcceleratorType,

    /// Device model (e.g. "RTX 3090", "Wormhole n150")
    pub model: String,

    /// Number of identical devices
    #[serde(default = "default_count")]
    pub count: u32,

    /// Memory per device in GB, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_gb: Option<f64>,

    /// Utilization percentage (0.0 - 100.0), None until reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization_pct: Option<f64>,

    /// Memory in use across all devices in GB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_gb: Option<f64>,

    /// Hottest device temperature in Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

fn default_count() -> u32 {
    1
}

impl Accelerator {
    /// Create an accelerator with no runtime readings
    pub fn new(accelerator_type: AcceleratorType, model: impl Into<String>) -> Self {
        Self {
            accelerator_type,
            model: model.into(),
            count: 1,
            vram_gb: None,
            utilization_pct: None,
            memory_used_gb: None,
            temperature_c: None,
        }
    }

    /// Set the device count (clamped to at least one)
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count.max(1);
        self
    }

    /// Set memory per device
    pub fn with_vram_gb(mut self, vram_gb: f64) -> Self {
        self.vram_gb = Some(vram_gb);
        self
    }

    /// Set the current utilization
    pub fn with_utilization(mut self, pct: f64) -> Self {
        self.utilization_pct = Some(pct);
        self
    }

    /// Check `count >= 1` and a finite utilization within 0-100
    pub fn check(&self) -> Result<(), String> {
        if self.count == 0 {
            return Err("count must be at least 1".to_string());
        }
        match self.utilization_pct {
            Some(pct) if !pct.is_finite() || !(0.0..=100.0).contains(&pct) => {
                Err(format!("utilization {} outside 0-100", pct))
            }
            _ => Ok(()),
        }
    }

    /// True only if VRAM is known and at least `min_gb`
    pub fn has_vram_at_least(&self, min_gb: f64) -> bool {
        self.vram_gb.is_some_and(|v| v >= min_gb)
    }
}

/// A category of work a node can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    LlmInference,
    ImageGeneration,
    VideoGeneration,
    SpeechToText,
    Embeddings,
    Training,
    Preprocessing,
    Storage,
}

impl Capability {
    /// Every capability, in declaration order
    pub const ALL: [Capability; 8] = [
        Capability::LlmInference,
        Capability::ImageGeneration,
        Capability::VideoGeneration,
        Capability::SpeechToText,
        Capability::Embeddings,
        Capability::Training,
        Capability::Preprocessing,
        Capability::Storage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LlmInference => "llm-inference",
            Capability::ImageGeneration => "image-generation",
            Capability::VideoGeneration => "video-generation",
            Capability::SpeechToText => "speech-to-text",
            Capability::Embeddings => "embeddings",
            Capability::Training => "training",
            Capability::Preprocessing => "preprocessing",
            Capability::Storage => "storage",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TopologyError::UnknownCapability(s.to_string()))
    }
}

/// A running service on a node (e.g. vLLM, Triton, Whisper)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Service name
    pub name: String,

    /// Port the service listens on
    pub port: u16,

    /// Wire protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Identifiers of the models currently loaded
    #[serde(default)]
    pub models: BTreeSet<String>,

    /// Result of the last health probe
    #[serde(default)]
    pub healthy: bool,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            protocol: default_protocol(),
            models: BTreeSet::new(),
            healthy: false,
        }
    }

    /// Add a loaded model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }

    /// Set health
    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }
}

/// Power state as reported by the hypervisor or Wake-on-LAN tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Sleeping,
    #[default]
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Sleeping => "sleeping",
            PowerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Hardware specification of a cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique name within the cluster
    pub name: String,

    /// Address the node is reached on
    pub host: String,

    /// Proxmox node name, if managed by Proxmox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxmox_node: Option<String>,

    /// VM/CT id, if the node runs inside Proxmox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,

    #[serde(default)]
    pub accelerators: Vec<Accelerator>,

    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_tb: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailscale_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan_ip: Option<String>,

    /// Whether the node is reachable; only online nodes are routed to
    #[serde(default)]
    pub online: bool,

    #[serde(default)]
    pub power_state: PowerState,

    /// MAC address for Wake-on-LAN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wol_mac: Option<String>,
}

impl NodeSpec {
    /// Create an offline node with no hardware
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            proxmox_node: None,
            vmid: None,
            accelerators: Vec::new(),
            capabilities: BTreeSet::new(),
            services: Vec::new(),
            cpu_cores: None,
            ram_gb: None,
            storage_tb: None,
            tailscale_ip: None,
            lan_ip: None,
            online: false,
            power_state: PowerState::Unknown,
            wol_mac: None,
        }
    }

    /// Mark online and powered on
    pub fn online(mut self) -> Self {
        self.online = true;
        self.power_state = PowerState::On;
        self
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerators.push(accelerator);
        self
    }

    pub fn with_service(mut self, service: ServiceEndpoint) -> Self {
        self.services.push(service);
        self
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Largest known per-device VRAM
    pub fn max_vram_gb(&self) -> Option<f64> {
        self.accelerators
            .iter()
            .filter_map(|a| a.vram_gb)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
    }

    /// At least one accelerator has known VRAM >= `min_gb`
    pub fn has_vram_at_least(&self, min_gb: f64) -> bool {
        self.accelerators.iter().any(|a| a.has_vram_at_least(min_gb))
    }

    /// Mean utilization over accelerators that reported one
    ///
    /// Returns the mean and how many accelerators contributed, or `None`
    /// when no accelerator has a reading.
    pub fn average_utilization(&self) -> Option<(f64, usize)> {
        let readings: Vec<f64> = self
            .accelerators
            .iter()
            .filter_map(|a| a.utilization_pct)
            .collect();
        if readings.is_empty() {
            return None;
        }
        let sum: f64 = readings.iter().sum();
        Some((sum / readings.len() as f64, readings.len()))
    }

    /// Any service (healthy or not) lists the model
    pub fn serves_model(&self, model: &str) -> bool {
        self.services.iter().any(|s| s.serves(model))
    }

    /// A healthy service has the model loaded
    pub fn has_warm_model(&self, model: &str) -> bool {
        self.services.iter().any(|s| s.healthy && s.serves(model))
    }

    /// Total number of non-CPU devices
    pub fn gpu_count(&self) -> u32 {
        self.accelerators
            .iter()
            .filter(|a| a.accelerator_type.is_accelerator())
            .map(|a| a.count)
            .sum()
    }
}

/// Full cluster topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,

    /// Proxmox API host, if the cluster is Proxmox managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxmox_host: Option<String>,

    #[serde(default = "default_proxmox_user")]
    pub proxmox_user: String,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

fn default_proxmox_user() -> String {
    "root@pam".to_string()
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proxmox_host: None,
            proxmox_user: default_proxmox_user(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Exact-name lookup
    pub fn get_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Lookup that reports a missing node as [`TopologyError::UnknownNode`]
    pub fn require_node(&self, name: &str) -> Result<&NodeSpec, TopologyError> {
        self.get_node(name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
    }

    /// Mutable lookup for collaborators assembling a new snapshot
    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeSpec> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    /// Online nodes advertising `cap`, in cluster order
    pub fn nodes_with_capability(&self, cap: Capability) -> Vec<&NodeSpec> {
        self.nodes
            .iter()
            .filter(|n| n.online && n.has_capability(cap))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.online).count()
    }

    /// Reject duplicate node names and out-of-range accelerator readings
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateNode(node.name.clone()));
            }
            for acc in &node.accelerators {
                acc.check().map_err(|reason| TopologyError::InvalidAccelerator {
                    node: node.name.clone(),
                    model: acc.model.clone(),
                    reason,
                })?;
            }
        }
        Ok(())
    }
}
