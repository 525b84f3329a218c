//! Proxmox VE node status records
//!
//! The HTTP client lives elsewhere; this module understands the JSON the
//! `/nodes` endpoint returns and folds it into a [`ClusterSpec`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TelemetryError;
use crate::hardware::{ClusterSpec, PowerState};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One entry of the Proxmox `/nodes` listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PveNodeStatus {
    pub node: String,

    /// "online", "offline" or "unknown"
    pub status: String,

    /// CPU load as a fraction (0.0 - 1.0)
    #[serde(default)]
    pub cpu: Option<f64>,

    #[serde(default)]
    pub maxcpu: Option<u32>,

    /// Memory used in bytes
    #[serde(default)]
    pub mem: Option<u64>,

    /// Memory total in bytes
    #[serde(default)]
    pub maxmem: Option<u64>,

    /// Uptime in seconds
    #[serde(default)]
    pub uptime: Option<u64>,
}

impl PveNodeStatus {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }

    pub fn power_state(&self) -> PowerState {
        match self.status.to_ascii_lowercase().as_str() {
            "online" => PowerState::On,
            "offline" => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodesResponse {
    Enveloped { data: Vec<PveNodeStatus> },
    Bare(Vec<PveNodeStatus>),
}

/// Parse a `/nodes` response, with or without the API's `data` envelope
pub fn parse_pve_nodes(json: &str) -> Result<Vec<PveNodeStatus>, TelemetryError> {
    let records = match serde_json::from_str::<NodesResponse>(json)? {
        NodesResponse::Enveloped { data } => data,
        NodesResponse::Bare(records) => records,
    };
    Ok(records)
}

/// Fold Proxmox node status into the topology; returns how many nodes matched
///
/// A cluster node matches a record by its `proxmox_node`, or by its own name
/// when that is unset. Guests (`vmid` set) only take the online/power state;
/// bare-metal nodes also pick up core count and RAM when not configured.
pub fn apply_pve_status(cluster: &mut ClusterSpec, records: &[PveNodeStatus]) -> usize {
    let mut matched = 0;

    for node in cluster.nodes.iter_mut() {
        let pve_name = node.proxmox_node.as_deref().unwrap_or(&node.name);
        let Some(record) = records.iter().find(|r| r.node == pve_name) else {
            continue;
        };

        node.online = record.is_online();
        node.power_state = record.power_state();

        if node.vmid.is_none() {
            if node.cpu_cores.is_none() {
                node.cpu_cores = record.maxcpu;
            }
            if node.ram_gb.is_none() {
                node.ram_gb = record.maxmem.map(|b| b as f64 / BYTES_PER_GB);
            }
        }

        debug!(node = %node.name, pve = %record.node, online = node.online, "applied proxmox status");
        matched += 1;
    }

    matched
}
