//! Routing engine - picks exactly one node for a task
//!
//! Routing is a pure function of a [`Task`] and a [`ClusterSpec`] snapshot:
//! it never mutates either, never suspends and never panics on expected
//! conditions. The caller applies the decision.
//!
//! Pipeline:
//! 1. online nodes advertising the task's capability
//! 2. preferred node short-circuit (when it also passes the hard filters)
//! 3. exclusion filter
//! 4. VRAM filter
//! 5. fail if nothing is left
//! 6. warm-model narrowing (soft: falls back when no node is warm)
//! 7. score = mean utilization + warm bonus, lower wins
//! 8. stable sort, ties keep cluster order

use thiserror::Error;
use tracing::{debug, trace};

use super::scoring::{calculate_node_score, compare_node_scores, NodeScore, ScoringWeights};
use crate::hardware::{Capability, ClusterSpec, NodeSpec};
use crate::task::{Task, TaskConstraints};

/// No node is eligible for the task
#[derive(Error, Debug, Clone, PartialEq)]
#[error("no node satisfies capability/constraints for {task_type}: {detail}")]
pub struct RoutingFailure {
    pub task_type: Capability,
    pub constraints: TaskConstraints,
    pub detail: FailureDetail,
}

/// Which stage emptied the candidate set
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDetail {
    #[error("no online node advertises the capability")]
    NoCapableNode,

    #[error("every capable node is excluded")]
    AllExcluded,

    #[error("no remaining node has enough VRAM")]
    InsufficientVram,
}

/// Outcome of routing with the full ranking attached
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Selected node name
    pub node: String,

    /// True when the preferred node short-circuited scoring
    pub preferred: bool,

    /// Ranked candidates, best first (empty when `preferred` is set)
    pub ranking: Vec<NodeScore>,
}

/// Select the best node for `task`, or explain why none qualifies
pub fn select_node<'a>(task: &Task, cluster: &'a ClusterSpec) -> Result<&'a NodeSpec, RoutingFailure> {
    select_node_with(task, cluster, None)
}

/// [`select_node`] with custom scoring weights
pub fn select_node_with<'a>(
    task: &Task,
    cluster: &'a ClusterSpec,
    weights: Option<&ScoringWeights>,
) -> Result<&'a NodeSpec, RoutingFailure> {
    let decision = route(task, cluster, weights)?;
    // The decision always names a node taken from `cluster`.
    cluster
        .get_node(&decision.node)
        .ok_or_else(|| failure(task, FailureDetail::NoCapableNode))
}

/// Rank every eligible candidate, best first
///
/// When the preferred node short-circuits, the ranking holds only that node.
pub fn rank_candidates(
    task: &Task,
    cluster: &ClusterSpec,
    weights: Option<&ScoringWeights>,
) -> Result<Vec<NodeScore>, RoutingFailure> {
    let decision = route(task, cluster, weights)?;
    if decision.preferred {
        let node = cluster
            .get_node(&decision.node)
            .ok_or_else(|| failure(task, FailureDetail::NoCapableNode))?;
        return Ok(vec![calculate_node_score(node, task.model(), weights)]);
    }
    Ok(decision.ranking)
}

/// Run the full routing pipeline
pub fn route(
    task: &Task,
    cluster: &ClusterSpec,
    weights: Option<&ScoringWeights>,
) -> Result<RoutingDecision, RoutingFailure> {
    let task_type = task.task_type();
    let constraints = task.constraints();

    let capable = cluster.nodes_with_capability(task_type);

    if let Some(preferred) = preferred_node(task, cluster) {
        debug!(task = %task.id(), node = %preferred.name, "preferred node selected");
        return Ok(RoutingDecision {
            node: preferred.name.clone(),
            preferred: true,
            ranking: Vec::new(),
        });
    }

    if capable.is_empty() {
        return Err(failure(task, FailureDetail::NoCapableNode));
    }

    let candidates: Vec<&NodeSpec> = capable
        .into_iter()
        .filter(|n| !constraints.is_excluded(&n.name))
        .collect();
    if candidates.is_empty() {
        return Err(failure(task, FailureDetail::AllExcluded));
    }

    let candidates: Vec<&NodeSpec> = match constraints.min_vram_gb {
        Some(min) => candidates
            .into_iter()
            .filter(|n| n.has_vram_at_least(min))
            .collect(),
        None => candidates,
    };
    if candidates.is_empty() {
        return Err(failure(task, FailureDetail::InsufficientVram));
    }

    let candidates = narrow_to_warm(task, candidates);

    let mut ranking: Vec<NodeScore> = candidates
        .iter()
        .map(|n| calculate_node_score(n, task.model(), weights))
        .collect();
    // sort_by is stable: equal scores keep cluster order
    ranking.sort_by(compare_node_scores);

    trace!(task = %task.id(), ?ranking, "candidates ranked");

    let node = ranking
        .first()
        .map(|s| s.node.clone())
        .ok_or_else(|| failure(task, FailureDetail::NoCapableNode))?;

    Ok(RoutingDecision {
        node,
        preferred: false,
        ranking,
    })
}

/// The preferred node, if it exists, is online, has the capability and
/// passes the exclusion and VRAM filters
fn preferred_node<'a>(task: &Task, cluster: &'a ClusterSpec) -> Option<&'a NodeSpec> {
    let constraints = task.constraints();
    let name = constraints.preferred_node.as_deref()?;

    let node = match cluster.require_node(name) {
        Ok(node) => node,
        Err(e) => {
            debug!(task = %task.id(), "{}; ignoring preference", e);
            return None;
        }
    };

    let eligible = node.online
        && node.has_capability(task.task_type())
        && !constraints.is_excluded(&node.name)
        && constraints
            .min_vram_gb
            .map_or(true, |min| node.has_vram_at_least(min));

    if !eligible {
        debug!(task = %task.id(), node = %name, "preferred node not eligible, scoring instead");
        return None;
    }
    Some(node)
}

/// Restrict to nodes already serving the model when `require_warm_model` is
/// set and at least one such node exists
///
/// With no warm node the candidate set is returned unchanged.
// TODO: decide whether require_warm_model with no warm node should fail the task
fn narrow_to_warm<'a>(task: &Task, candidates: Vec<&'a NodeSpec>) -> Vec<&'a NodeSpec> {
    let Some(model) = task.model() else {
        return candidates;
    };
    if !task.constraints().require_warm_model {
        return candidates;
    }

    let warm: Vec<&NodeSpec> = candidates
        .iter()
        .copied()
        .filter(|n| n.serves_model(model))
        .collect();

    if warm.is_empty() {
        debug!(task = %task.id(), model, "no node has the model loaded, keeping all candidates");
        candidates
    } else {
        warm
    }
}

fn failure(task: &Task, detail: FailureDetail) -> RoutingFailure {
    RoutingFailure {
        task_type: task.task_type(),
        constraints: task.constraints().clone(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Accelerator, AcceleratorType, ServiceEndpoint};

    fn llm_node(name: &str, util: f64) -> NodeSpec {
        NodeSpec::new(name, format!("{}.lan", name))
            .online()
            .with_capability(Capability::LlmInference)
            .with_accelerator(
                Accelerator::new(AcceleratorType::Nvidia, "RTX 3090")
                    .with_vram_gb(24.0)
                    .with_utilization(util),
            )
    }

    fn two_node_cluster() -> ClusterSpec {
        ClusterSpec::new("lab")
            .with_node(llm_node("A", 80.0))
            .with_node(llm_node("B", 20.0))
    }

    fn llm_task() -> Task {
        Task::new(Capability::LlmInference)
    }

    #[test]
    fn test_lowest_utilization_wins() {
        let cluster = two_node_cluster();
        assert_eq!(select_node(&llm_task(), &cluster).unwrap().name, "B");
    }

    #[test]
    fn test_preferred_overrides_score() {
        let cluster = two_node_cluster();
        let task = llm_task().with_constraints(TaskConstraints::default().prefer("A"));
        assert_eq!(select_node(&task, &cluster).unwrap().name, "A");

        let decision = route(&task, &cluster, None).unwrap();
        assert!(decision.preferred);
    }

    #[test]
    fn test_missing_capability_fails() {
        let cluster = ClusterSpec::new("lab").with_node(llm_node("A", 0.0));
        let task = Task::new(Capability::Embeddings);
        let err = select_node(&task, &cluster).unwrap_err();
        assert_eq!(err.detail, FailureDetail::NoCapableNode);
        assert_eq!(err.task_type, Capability::Embeddings);
        assert!(err
            .to_string()
            .starts_with("no node satisfies capability/constraints"));
    }

    #[test]
    fn test_warm_model_bonus_wins_tie() {
        let cluster = ClusterSpec::new("lab")
            .with_node(llm_node("A", 50.0).with_service(
                ServiceEndpoint::new("vllm", 8000)
                    .with_model("llama-70b")
                    .healthy(true),
            ))
            .with_node(llm_node("B", 50.0));
        let task = llm_task().with_model("llama-70b");

        let ranking = rank_candidates(&task, &cluster, None).unwrap();
        assert_eq!(ranking[0].node, "A");
        assert_eq!(ranking[0].score, 0.0);
        assert_eq!(ranking[1].score, 50.0);
    }

    #[test]
    fn test_cold_node_wins_when_more_than_50_points_idler() {
        let cluster = ClusterSpec::new("lab")
            .with_node(llm_node("A", 90.0).with_service(
                ServiceEndpoint::new("vllm", 8000).with_model("m").healthy(true),
            ))
            .with_node(llm_node("B", 30.0));
        let task = llm_task().with_model("m");
        assert_eq!(select_node(&task, &cluster).unwrap().name, "B");
    }

    #[test]
    fn test_require_warm_soft_fallback() {
        let cluster = ClusterSpec::new("lab")
            .with_node(NodeSpec::new("C", "c").online().with_capability(Capability::LlmInference));
        let task = llm_task()
            .with_model("x")
            .with_constraints(TaskConstraints::default().warm_only());
        assert_eq!(select_node(&task, &cluster).unwrap().name, "C");
    }

    #[test]
    fn test_require_warm_narrows_even_when_unhealthy() {
        // A serves the model through an unhealthy service: it is "warm" for
        // narrowing but gets no score bonus, so the idler B would win
        // without narrowing.
        let cluster = ClusterSpec::new("lab")
            .with_node(llm_node("A", 70.0).with_service(ServiceEndpoint::new("vllm", 8000).with_model("m")))
            .with_node(llm_node("B", 10.0));
        let task = llm_task()
            .with_model("m")
            .with_constraints(TaskConstraints::default().warm_only());
        assert_eq!(select_node(&task, &cluster).unwrap().name, "A");

        let soft = llm_task().with_model("m");
        assert_eq!(select_node(&soft, &cluster).unwrap().name, "B");
    }

    #[test]
    fn test_exclusion() {
        let cluster = two_node_cluster();
        let task = llm_task().with_constraints(TaskConstraints::default().exclude("B"));
        assert_eq!(select_node(&task, &cluster).unwrap().name, "A");

        let all = llm_task().with_constraints(TaskConstraints::default().exclude("A").exclude("B"));
        assert_eq!(
            select_node(&all, &cluster).unwrap_err().detail,
            FailureDetail::AllExcluded
        );
    }

    #[test]
    fn test_excluded_preferred_node_is_ignored() {
        let cluster = two_node_cluster();
        let task = llm_task().with_constraints(TaskConstraints::default().prefer("A").exclude("A"));
        assert_eq!(select_node(&task, &cluster).unwrap().name, "B");
    }

    #[test]
    fn test_vram_filter() {
        let cluster = two_node_cluster().with_node(
            NodeSpec::new("big", "big")
                .online()
                .with_capability(Capability::LlmInference)
                .with_accelerator(
                    Accelerator::new(AcceleratorType::Nvidia, "A100")
                        .with_vram_gb(80.0)
                        .with_utilization(95.0),
                ),
        );
        let task = llm_task().with_constraints(TaskConstraints::default().min_vram(48.0));
        assert_eq!(select_node(&task, &cluster).unwrap().name, "big");

        let too_big = llm_task().with_constraints(TaskConstraints::default().min_vram(96.0));
        assert_eq!(
            select_node(&too_big, &cluster).unwrap_err().detail,
            FailureDetail::InsufficientVram
        );
    }

    #[test]
    fn test_preferred_without_vram_falls_through() {
        let cluster = two_node_cluster().with_node(
            NodeSpec::new("tt", "tt")
                .online()
                .with_capability(Capability::LlmInference)
                .with_accelerator(Accelerator::new(AcceleratorType::Tenstorrent, "Wormhole")),
        );
        let task = llm_task().with_constraints(TaskConstraints::default().prefer("tt").min_vram(16.0));
        assert_eq!(select_node(&task, &cluster).unwrap().name, "B");
    }

    #[test]
    fn test_unknown_or_offline_preferred_falls_through() {
        let cluster = two_node_cluster().with_node(
            NodeSpec::new("sleepy", "s").with_capability(Capability::LlmInference),
        );
        let unknown = llm_task().with_constraints(TaskConstraints::default().prefer("ghost"));
        assert_eq!(select_node(&unknown, &cluster).unwrap().name, "B");

        let offline = llm_task().with_constraints(TaskConstraints::default().prefer("sleepy"));
        assert_eq!(select_node(&offline, &cluster).unwrap().name, "B");
    }

    #[test]
    fn test_ties_keep_cluster_order() {
        let cluster = ClusterSpec::new("lab")
            .with_node(llm_node("first", 40.0))
            .with_node(llm_node("second", 40.0))
            .with_node(llm_node("third", 40.0));
        let ranking = rank_candidates(&llm_task(), &cluster, None).unwrap();
        let names: Vec<_> = ranking.iter().map(|s| s.node.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_deterministic() {
        let cluster = ClusterSpec::new("lab")
            .with_node(llm_node("a", 33.0))
            .with_node(llm_node("b", 12.5))
            .with_node(llm_node("c", 12.5));
        let task = llm_task();
        let first = select_node(&task, &cluster).unwrap().name.clone();
        for _ in 0..20 {
            assert_eq!(select_node(&task, &cluster).unwrap().name, first);
        }
        assert_eq!(first, "b");
    }

    #[test]
    fn test_does_not_mutate_inputs() {
        let cluster = two_node_cluster();
        let task = llm_task().with_model("m");
        let (cluster_before, task_before) = (cluster.clone(), task.clone());
        let _ = select_node(&task, &cluster);
        assert_eq!(cluster, cluster_before);
        assert_eq!(task, task_before);
    }

    #[test]
    fn test_offline_nodes_never_selected() {
        let mut cluster = two_node_cluster();
        cluster.node_mut("B").unwrap().online = false;
        assert_eq!(select_node(&llm_task(), &cluster).unwrap().name, "A");
    }
}
