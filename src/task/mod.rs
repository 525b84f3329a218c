//! Task model - what users submit to the orchestrator
//!
//! A [`Task`] is built once by the submitter. Its lifecycle fields (status,
//! assignment, timestamps, result) are readable by anyone but only written by
//! the dispatch queue or through [`Task::cancel`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::hardware::Capability;

/// Errors raised by task lifecycle operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task '{task_id}' cannot move from {from} to {to}")]
    InvalidStateTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Routing,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Pending, Routing) => true,
            (Routing, Queued) | (Routing, Failed) => true,
            // Queued -> Failed covers the max-latency timeout at the executor boundary
            (Queued, Running) | (Queued, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Routing => "routing",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority; higher values are routed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(TaskPriority::Low),
            "normal" | "5" => Ok(TaskPriority::Normal),
            "high" | "8" => Ok(TaskPriority::High),
            "critical" | "10" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Opaque task payload, tagged so the core never inspects its meaning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// Schema-free parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Constraints on where/how the task can run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskConstraints {
    /// Longest the task may sit in `queued` before the executor starts it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,

    /// Route here if eligible, regardless of score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_node: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded_nodes: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_vram_gb: Option<f64>,

    /// Narrow to nodes with the model already loaded, when any exist
    #[serde(default)]
    pub require_warm_model: bool,
}

impl TaskConstraints {
    pub fn prefer(mut self, node: impl Into<String>) -> Self {
        self.preferred_node = Some(node.into());
        self
    }

    pub fn exclude(mut self, node: impl Into<String>) -> Self {
        self.excluded_nodes.insert(node.into());
        self
    }

    pub fn min_vram(mut self, gb: f64) -> Self {
        self.min_vram_gb = Some(gb);
        self
    }

    pub fn max_latency(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    pub fn warm_only(mut self) -> Self {
        self.require_warm_model = true;
        self
    }

    pub fn is_excluded(&self, node: &str) -> bool {
        self.excluded_nodes.contains(node)
    }
}

/// A unit of work submitted to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: String,

    #[serde(rename = "type")]
    task_type: Capability,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,

    #[serde(default)]
    input: Payload,

    #[serde(default)]
    params: BTreeMap<String, ParamValue>,

    #[serde(default)]
    priority: TaskPriority,

    #[serde(default)]
    constraints: TaskConstraints,

    status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    assigned_node: Option<String>,

    created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    queued_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Short random id: first 12 hex chars of a v4 uuid
fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

impl Task {
    /// Create a pending task of the given type
    pub fn new(task_type: Capability) -> Self {
        Self {
            id: generate_id(),
            task_type,
            model: None,
            input: Payload::Empty,
            params: BTreeMap::new(),
            priority: TaskPriority::Normal,
            constraints: TaskConstraints::default(),
            status: TaskStatus::Pending,
            assigned_node: None,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_type(&self) -> Capability {
        self.task_type
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn input(&self) -> &Payload {
        &self.input
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn constraints(&self) -> &TaskConstraints {
        &self.constraints
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn assigned_node(&self) -> Option<&str> {
        self.assigned_node.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.queued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn result(&self) -> Option<&Payload> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Wall time between start and completion, once both are known
    pub fn duration_ms(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_microseconds()? as f64 / 1000.0),
            _ => None,
        }
    }

    /// Cancel from any non-terminal status
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    // =========================================================================
    // Queue-owned mutators
    // =========================================================================

    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidStateTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn mark_routing(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Routing)
    }

    pub(crate) fn mark_queued(&mut self, node: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Queued)?;
        self.assigned_node = Some(node.into());
        self.queued_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn mark_running(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn mark_completed(&mut self, result: Option<Payload>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result = result;
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_timestamps(
        &mut self,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) {
        self.created_at = created_at;
        self.started_at = started_at;
        self.completed_at = completed_at;
    }

    #[cfg(test)]
    pub(crate) fn set_queued_at(&mut self, queued_at: DateTime<Utc>) {
        self.queued_at = Some(queued_at);
    }
}
