//! NVIDIA GPU readings from `nvidia-smi`

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::TelemetryError;
use crate::hardware::{Accelerator, AcceleratorType, NodeSpec};

const NVIDIA_SMI: &str = "nvidia-smi";

/// Query flags; field order matches [`parse_nvidia_smi_csv`]
pub const NVIDIA_SMI_ARGS: [&str; 2] = [
    "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw",
    "--format=csv,noheader,nounits",
];

const QUERY_TIMEOUT_SECS: u64 = 10;

/// One GPU row as reported by `nvidia-smi`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: u32,
    pub name: String,
    pub utilization_pct: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
}

impl GpuStatus {
    pub fn memory_free_mb(&self) -> Option<f64> {
        Some(self.memory_total_mb? - self.memory_used_mb?)
    }

    pub fn memory_utilization_pct(&self) -> Option<f64> {
        let total = self.memory_total_mb.filter(|t| *t > 0.0)?;
        Some(self.memory_used_mb? / total * 100.0)
    }
}

/// Parse `--format=csv,noheader,nounits` output
///
/// Blank lines and rows with fewer than seven fields are skipped. Numeric
/// fields nvidia-smi cannot read (`[N/A]`, `[Not Supported]`) become `None`.
pub fn parse_nvidia_smi_csv(output: &str) -> Result<Vec<GpuStatus>, TelemetryError> {
    let mut gpus = Vec::new();

    for (i, line) in output.lines().enumerate() {
        let line_no = i + 1;
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 7 {
            if !line.trim().is_empty() {
                debug!("skipping short nvidia-smi row {}: {:?}", line_no, line);
            }
            continue;
        }

        let index = parts[0].parse::<u32>().map_err(|e| TelemetryError::Parse {
            line: line_no,
            message: format!("index '{}': {}", parts[0], e),
        })?;

        gpus.push(GpuStatus {
            index,
            name: parts[1].to_string(),
            utilization_pct: optional_number(parts[2], line_no)?,
            memory_used_mb: optional_number(parts[3], line_no)?,
            memory_total_mb: optional_number(parts[4], line_no)?,
            temperature_c: optional_number(parts[5], line_no)?,
            power_draw_w: optional_number(parts[6], line_no)?,
        });
    }

    Ok(gpus)
}

fn is_unavailable(field: &str) -> bool {
    field.is_empty() || field.starts_with('[') || field.eq_ignore_ascii_case("N/A")
}

fn optional_number(field: &str, line: usize) -> Result<Option<f64>, TelemetryError> {
    if is_unavailable(field) {
        return Ok(None);
    }
    field
        .parse::<f64>()
        .map(Some)
        .map_err(|e| TelemetryError::Parse {
            line,
            message: format!("'{}': {}", field, e),
        })
}

/// Merge GPU readings into the node's NVIDIA accelerator entry
///
/// Utilization is averaged over GPUs that reported one, memory use is
/// summed over GPUs that reported it, temperature is the hottest device and
/// `vram_gb` is the largest reported per-device total. An entry is added when
/// the node has none.
pub fn apply_gpu_status(node: &mut NodeSpec, gpus: &[GpuStatus]) {
    if gpus.is_empty() {
        return;
    }

    let idx = match node
        .accelerators
        .iter()
        .position(|a| a.accelerator_type == AcceleratorType::Nvidia)
    {
        Some(idx) => idx,
        None => {
            node.accelerators
                .push(Accelerator::new(AcceleratorType::Nvidia, gpus[0].name.clone()));
            node.accelerators.len() - 1
        }
    };
    let accelerator = &mut node.accelerators[idx];

    let utils: Vec<f64> = gpus.iter().filter_map(|g| g.utilization_pct).collect();
    accelerator.utilization_pct = if utils.is_empty() {
        None
    } else {
        Some(utils.iter().sum::<f64>() / utils.len() as f64)
    };

    let used: Vec<f64> = gpus.iter().filter_map(|g| g.memory_used_mb).collect();
    accelerator.memory_used_gb = (!used.is_empty()).then(|| used.iter().sum::<f64>() / 1024.0);
    accelerator.temperature_c = gpus
        .iter()
        .filter_map(|g| g.temperature_c)
        .fold(None, |max: Option<f64>, t| Some(max.map_or(t, |m| m.max(t))));
    if let Some(vram) = gpus
        .iter()
        .filter_map(|g| g.memory_total_mb)
        .map(|mb| mb / 1024.0)
        .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
    {
        accelerator.vram_gb = Some(vram);
    }
    accelerator.count = gpus.len() as u32;
}

/// Run `nvidia-smi` on this machine
///
/// A missing binary means no NVIDIA GPUs and yields an empty list.
pub async fn query_local_gpus() -> Result<Vec<GpuStatus>, TelemetryError> {
    let mut command = Command::new(NVIDIA_SMI);
    command
        .args(NVIDIA_SMI_ARGS)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let timeout = Duration::from_secs(QUERY_TIMEOUT_SECS);
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Err(_) => {
            return Err(TelemetryError::Timeout {
                command: NVIDIA_SMI.to_string(),
                secs: QUERY_TIMEOUT_SECS,
            })
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("nvidia-smi not found locally");
            return Ok(Vec::new());
        }
        Ok(result) => result?,
    };

    if !output.status.success() {
        return Err(TelemetryError::CommandFailed {
            command: NVIDIA_SMI.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_nvidia_smi_csv(&String::from_utf8_lossy(&output.stdout))
}
