//! Node scoring for task routing
//!
//! Each candidate gets a composite score from its accelerator utilization
//! and whether the requested model is already warm on it. Lower scores are
//! better: an idle node with the model loaded scores -50, a saturated cold
//! node scores 100.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::hardware::NodeSpec;

/// Score adjustment for a node whose healthy service already has the model
pub const WARM_MODEL_BONUS: f64 = -50.0;

/// Weight configuration for node scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Added to the score when the model is warm (default: -50.0)
    pub warm_model_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            warm_model_bonus: WARM_MODEL_BONUS,
        }
    }
}

/// Calculated score for one candidate (lower = more preferred)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    /// Name of the scored node
    pub node: String,

    /// Overall score
    pub score: f64,

    /// Individual components
    pub breakdown: ScoreBreakdown,
}

/// Breakdown of score components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    /// Mean utilization over accelerators with a reading (0 if none)
    pub utilization: f64,

    /// How many accelerators contributed to `utilization`
    pub known_accelerators: usize,

    /// Warm-model adjustment applied (0 or the configured bonus)
    pub warm_bonus: f64,
}

/// Calculate a node's score for a task requesting `model`
///
/// The warm bonus is only considered when a model is requested, and only
/// healthy services count.
pub fn calculate_node_score(
    node: &NodeSpec,
    model: Option<&str>,
    weights: Option<&ScoringWeights>,
) -> NodeScore {
    let default_weights = ScoringWeights::default();
    let weights = weights.unwrap_or(&default_weights);

    let (utilization, known_accelerators) = node.average_utilization().unwrap_or((0.0, 0));

    let warm_bonus = match model {
        Some(m) if node.has_warm_model(m) => weights.warm_model_bonus,
        _ => 0.0,
    };

    NodeScore {
        node: node.name.clone(),
        score: utilization + warm_bonus,
        breakdown: ScoreBreakdown {
            utilization,
            known_accelerators,
            warm_bonus,
        },
    }
}

/// Compare two scores; `Ordering::Less` means `a` is preferred
///
/// A NaN score (from a garbage telemetry reading) sorts after every real
/// score so the comparison stays a total order.
pub fn compare_node_scores(a: &NodeScore, b: &NodeScore) -> Ordering {
    match (a.score.is_nan(), b.score.is_nan()) {
        (false, false) => a.score.total_cmp(&b.score),
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
    }
}
