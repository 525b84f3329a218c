//! Hardware probe for the machine this process runs on
//!
//! Used by `pve-orch discover --local` to print a node entry that can be
//! pasted into the cluster config.

use std::collections::BTreeSet;

use sysinfo::{Disks, System};
use tracing::debug;

use crate::hardware::{Accelerator, AcceleratorType, Capability, NodeSpec};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_TB: f64 = BYTES_PER_GB * 1024.0;

/// Storage above which a node is advertised for `storage` work
const STORAGE_NODE_MIN_TB: f64 = 4.0;

/// Build a [`NodeSpec`] describing this machine
///
/// `name` defaults to the system hostname. The node is reported online with
/// capabilities inferred from its hardware.
pub fn probe_local_node(name: Option<&str>) -> NodeSpec {
    let host = local_hostname();
    let mut node = NodeSpec::new(name.unwrap_or(&host), host.clone()).online();

    let system = System::new_all();
    let cores = system.cpus().len() as u32;
    node.cpu_cores = (cores > 0).then_some(cores);
    let total_mem = system.total_memory();
    node.ram_gb = (total_mem > 0).then(|| round_1(total_mem as f64 / BYTES_PER_GB));

    let disks = Disks::new_with_refreshed_list();
    let total_disk: u64 = disks.iter().map(|d| d.total_space()).sum();
    node.storage_tb = (total_disk > 0).then(|| round_1(total_disk as f64 / BYTES_PER_TB));

    node.accelerators = probe_gpus();
    if node.accelerators.is_empty() {
        let cpu_model = system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "cpu".to_string());
        node.accelerators
            .push(Accelerator::new(AcceleratorType::Cpu, cpu_model).with_count(cores.max(1)));
    }

    node.capabilities = infer_capabilities(&node);
    debug!(
        node = %node.name,
        cores = ?node.cpu_cores,
        ram_gb = ?node.ram_gb,
        gpus = node.gpu_count(),
        "probed local node"
    );
    node
}

/// Default capability set for a node's hardware
///
/// Any accelerator enables inference work; GPUs with 16 GB or more also get
/// training and video generation. Every node can preprocess.
pub fn infer_capabilities(node: &NodeSpec) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::from([Capability::Preprocessing]);

    if node.accelerators.iter().any(|a| a.accelerator_type.is_accelerator()) {
        caps.extend([
            Capability::LlmInference,
            Capability::ImageGeneration,
            Capability::SpeechToText,
            Capability::Embeddings,
        ]);
    }
    if node.has_vram_at_least(16.0) {
        caps.extend([Capability::Training, Capability::VideoGeneration]);
    }
    if node.storage_tb.is_some_and(|tb| tb >= STORAGE_NODE_MIN_TB) {
        caps.insert(Capability::Storage);
    }

    caps
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn round_1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Readings for a single GPU before grouping
#[cfg_attr(not(feature = "gpu"), allow(dead_code))]
#[derive(Debug, Clone, PartialEq)]
struct DeviceReading {
    model: String,
    vram_gb: Option<f64>,
    used_gb: f64,
    utilization_pct: Option<f64>,
    temperature_c: Option<f64>,
}

#[cfg_attr(not(feature = "gpu"), allow(dead_code))]
#[derive(Default)]
struct GroupTotals {
    util_sum: f64,
    util_reported: u32,
    used_gb: f64,
    temperature_c: Option<f64>,
}

/// Fold per-device readings into one accelerator entry per model
///
/// Utilization is the mean over devices that reported it; a group where no
/// device reported stays `None`.
#[cfg_attr(not(feature = "gpu"), allow(dead_code))]
fn group_devices(devices: Vec<DeviceReading>) -> Vec<Accelerator> {
    let mut accelerators: Vec<Accelerator> = Vec::new();
    let mut totals: Vec<GroupTotals> = Vec::new();

    for device in devices {
        let i = match accelerators.iter().position(|a| a.model == device.model) {
            Some(i) => {
                accelerators[i].count += 1;
                i
            }
            None => {
                let mut acc = Accelerator::new(AcceleratorType::Nvidia, device.model);
                acc.vram_gb = device.vram_gb;
                accelerators.push(acc);
                totals.push(GroupTotals::default());
                accelerators.len() - 1
            }
        };

        let group = &mut totals[i];
        if let Some(util) = device.utilization_pct {
            group.util_sum += util;
            group.util_reported += 1;
        }
        group.used_gb += device.used_gb;
        group.temperature_c = match (group.temperature_c, device.temperature_c) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    for (acc, group) in accelerators.iter_mut().zip(totals) {
        acc.utilization_pct =
            (group.util_reported > 0).then(|| group.util_sum / f64::from(group.util_reported));
        acc.memory_used_gb = Some(group.used_gb);
        acc.temperature_c = group.temperature_c;
    }
    accelerators
}

/// Enumerate NVIDIA GPUs through NVML, grouped by model
#[cfg(feature = "gpu")]
fn probe_gpus() -> Vec<Accelerator> {
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
    use nvml_wrapper::Nvml;

    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => {
            debug!("NVML unavailable: {}", e);
            return Vec::new();
        }
    };
    let count = nvml.device_count().unwrap_or(0);

    let devices = (0..count)
        .filter_map(|index| nvml.device_by_index(index).ok())
        .map(|device| {
            let memory = device.memory_info().ok();
            DeviceReading {
                model: device.name().unwrap_or_else(|_| "NVIDIA GPU".to_string()),
                vram_gb: memory.as_ref().map(|m| round_1(m.total as f64 / BYTES_PER_GB)),
                used_gb: memory.as_ref().map(|m| m.used as f64 / BYTES_PER_GB).unwrap_or(0.0),
                utilization_pct: device.utilization_rates().ok().map(|u| f64::from(u.gpu)),
                temperature_c: device.temperature(TemperatureSensor::Gpu).ok().map(f64::from),
            }
        })
        .collect();

    group_devices(devices)
}

#[cfg(not(feature = "gpu"))]
fn probe_gpus() -> Vec<Accelerator> {
    Vec::new()
}
