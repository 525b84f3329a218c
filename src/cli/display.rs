//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{ClusterStatus, RouteReport};
use crate::hardware::NodeSpec;
use crate::task::Task;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No nodes found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let mut output = String::new();
    push_row(&mut output, headers.iter().map(|h| h.to_uppercase()), &widths);
    for row in rows {
        push_row(&mut output, row.into_iter(), &widths);
    }
    output
}

fn push_row(output: &mut String, cells: impl Iterator<Item = String>, widths: &[usize]) {
    let mut line = String::new();
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            line.push_str("   ");
        }
        match widths.get(i) {
            Some(width) => line.push_str(&format!("{:width$}", cell, width = width)),
            None => line.push_str(&cell),
        }
    }
    output.push_str(line.trim_end());
    output.push('\n');
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

// ============================================================================
// Cluster display
// ============================================================================

/// Format `pve-orch status`
pub fn format_cluster_status(status: &ClusterStatus) -> String {
    let mut output = String::new();
    output.push_str(&format!("Cluster:  {}\n", status.name));
    if let Some(host) = &status.proxmox_host {
        output.push_str(&format!("Proxmox:  {}\n", host));
    }
    output.push_str(&format!("Nodes:    {}/{} online\n", status.online, status.nodes));
    output.push_str(&format!("GPUs:     {} online\n", status.gpus));

    output.push_str("\nCapabilities:\n");
    for (cap, count) in &status.coverage {
        let marker = if *count == 0 { "  (none)" } else { "" };
        output.push_str(&format!("  {:<18} {}{}\n", cap.as_str(), count, marker));
    }
    output
}

/// Short accelerator summary, e.g. "3x RTX 3090, 1x Wormhole n150"
pub fn format_accelerators(node: &NodeSpec) -> String {
    let parts: Vec<String> = node
        .accelerators
        .iter()
        .filter(|a| a.accelerator_type.is_accelerator())
        .map(|a| format!("{}x {}", a.count, a.model))
        .collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

/// Format node list for display
pub fn format_node_list(nodes: &[&NodeSpec]) -> String {
    let headers = &["NODE", "STATUS", "ACCELERATORS", "UTIL", "CAPABILITIES"];
    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|node| {
            let status = if node.online {
                "online".to_string()
            } else {
                format!("offline ({})", node.power_state)
            };
            let caps: Vec<&str> = node.capabilities.iter().map(|c| c.as_str()).collect();

            vec![
                node.name.clone(),
                status,
                format_accelerators(node),
                or_dash(node.average_utilization().map(|(u, _)| format!("{:.0}%", u))),
                if caps.is_empty() { "-".to_string() } else { caps.join(", ") },
            ]
        })
        .collect();

    format_table(headers, rows)
}

// ============================================================================
// Routing display
// ============================================================================

/// Format `pve-orch route` output; `explain` adds the full ranking
pub fn format_route_report(report: &RouteReport, explain: bool) -> String {
    let mut output = String::new();
    match (&report.selected, &report.error) {
        (Some(node), _) => output.push_str(&format!("{} -> {}\n", report.task_type, node)),
        (None, Some(error)) => output.push_str(&format!("{}: {}\n", report.task_type, error)),
        (None, None) => output.push_str(&format!("{}: no route\n", report.task_type)),
    }

    if explain && !report.ranking.is_empty() {
        output.push('\n');
        let headers = &["RANK", "NODE", "SCORE", "UTIL", "READINGS", "WARM"];
        let rows: Vec<Vec<String>> = report
            .ranking
            .iter()
            .enumerate()
            .map(|(i, s)| {
                vec![
                    (i + 1).to_string(),
                    s.node.clone(),
                    format!("{:.1}", s.score),
                    format!("{:.1}", s.breakdown.utilization),
                    s.breakdown.known_accelerators.to_string(),
                    if s.breakdown.warm_bonus != 0.0 {
                        format!("{:.0}", s.breakdown.warm_bonus)
                    } else {
                        "-".to_string()
                    },
                ]
            })
            .collect();
        output.push_str(&format_table(headers, rows));
    }
    output
}

// ============================================================================
// Task display
// ============================================================================

/// Format a task's routing outcome
pub fn format_task(task: &Task) -> String {
    let mut output = String::new();
    output.push_str(&format!("Task:      {}\n", task.id()));
    output.push_str(&format!("Type:      {}\n", task.task_type()));
    if let Some(model) = task.model() {
        output.push_str(&format!("Model:     {}\n", model));
    }
    output.push_str(&format!("Priority:  {}\n", task.priority()));
    output.push_str(&format!("Status:    {}\n", task.status()));
    if let Some(node) = task.assigned_node() {
        output.push_str(&format!("Node:      {}\n", node));
    }
    if let Some(error) = task.error() {
        output.push_str(&format!("Error:     {}\n", error));
    }
    output
}
