//! Research state machine.
//!
//! [`ResearchStateMachine::next_action`] is a total, pure function from a
//! [`GraphState`] snapshot to the next graph transformation. Rules are
//! checked in priority order and the first match wins.

pub mod confidence;

pub use confidence::{evidence_confidence, session_confidence, ConfidenceBreakdown};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::got::{AggregationStrategy, GenerationStrategy, PathStatus, ResearchPath};
use crate::storage::ResearchSession;

/// Score at or above which a path counts as high quality.
pub const HIGH_QUALITY_SCORE: f64 = 7.0;
/// Threshold reported by the score action.
pub const SCORE_THRESHOLD: f64 = 6.0;
/// Paths kept by the score action.
pub const KEEP_TOP_N: usize = 2;
/// Maximum length of the findings carried into a focused Generate.
const FINDINGS_LIMIT: usize = 600;

/// The next graph transformation to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    Generate {
        k: usize,
        strategy: GenerationStrategy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Execute {
        path_ids: Vec<String>,
    },
    /// Other workers are executing these paths.
    Wait {
        path_ids: Vec<String>,
    },
    Score {
        threshold: f64,
        keep_top_n: usize,
    },
    Aggregate {
        path_ids: Vec<String>,
        strategy: AggregationStrategy,
    },
    /// Terminal.
    Synthesize {},
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Generate { .. } => "generate",
            Action::Execute { .. } => "execute",
            Action::Wait { .. } => "wait",
            Action::Score { .. } => "score",
            Action::Aggregate { .. } => "aggregate",
            Action::Synthesize {} => "synthesize",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Synthesize {})
    }
}

/// A decided action with its audit reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    #[serde(flatten)]
    pub action: Action,
    pub reasoning: String,
}

/// What the state machine needs to know about one path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathView {
    pub id: String,
    pub status: PathStatus,
    /// Waiting for output and not held by a worker.
    pub pending: bool,
    /// Waiting for output from a worker whose lease has not expired.
    pub dispatched: bool,
    pub scored: bool,
    pub score: f64,
    pub aggregated: bool,
}

impl PathView {
    /// View of `path` at `now`; dispatches older than `lease` count as abandoned.
    pub fn at(path: &ResearchPath, now: DateTime<Utc>, lease: chrono::Duration) -> Self {
        let dispatched = path.is_dispatched(now, lease);
        Self {
            id: path.id.clone(),
            status: path.status,
            pending: path.is_pending() && !dispatched,
            dispatched,
            scored: path.is_scored(),
            score: path.score,
            aggregated: path.is_aggregated(),
        }
    }
}

/// Snapshot of a session's graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    pub paths: Vec<PathView>,
    pub iteration: u32,
    pub confidence: f64,
    pub is_aggregated: bool,
    pub budget_exhausted: bool,
    /// Summary of current findings, carried into further exploration.
    pub current_findings: Option<String>,
}

impl GraphState {
    /// Build a snapshot from a session row and its paths as of `now`.
    pub fn build(
        session: &ResearchSession,
        paths: &[ResearchPath],
        confidence: f64,
        now: DateTime<Utc>,
        dispatch_lease: chrono::Duration,
    ) -> Self {
        Self {
            paths: paths.iter().map(|p| PathView::at(p, now, dispatch_lease)).collect(),
            iteration: session.iteration,
            confidence,
            is_aggregated: session.is_aggregated || paths.iter().any(|p| p.is_aggregated()),
            budget_exhausted: session.budget_exhausted,
            current_findings: summarize_findings(paths),
        }
    }
}

/// Leading sentences of the best completed paths.
fn summarize_findings(paths: &[ResearchPath]) -> Option<String> {
    let mut completed: Vec<&ResearchPath> = paths
        .iter()
        .filter(|p| p.status == PathStatus::Completed && !p.is_aggregated())
        .collect();
    completed.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

    let mut findings = String::new();
    for path in completed {
        let Some(output) = path.latest_output() else {
            continue;
        };
        let lead = output.split(['.', '\n']).next().unwrap_or(output).trim();
        if lead.is_empty() {
            continue;
        }
        if findings.len() + lead.len() + 2 > FINDINGS_LIMIT {
            break;
        }
        if !findings.is_empty() {
            findings.push_str("; ");
        }
        findings.push_str(lead);
    }
    (!findings.is_empty()).then_some(findings)
}

/// Decides what happens next in a research session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResearchStateMachine {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
}

impl Default for ResearchStateMachine {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.9,
        }
    }
}

impl ResearchStateMachine {
    pub fn new(max_iterations: u32, confidence_threshold: f64) -> Self {
        Self {
            max_iterations,
            confidence_threshold,
        }
    }

    /// State machine configured from a session's limits.
    pub fn for_session(session: &ResearchSession) -> Self {
        Self::new(session.max_iterations, session.confidence_threshold)
    }

    /// Map the current state to the next action.
    pub fn next_action(&self, state: &GraphState) -> NextAction {
        // Rule 1: termination
        if let Some(reason) = self.termination_reason(state) {
            return NextAction {
                action: Action::Synthesize {},
                reasoning: reason,
            };
        }

        // Rule 2: nothing explored yet
        if state.paths.is_empty() {
            return NextAction {
                action: Action::Generate {
                    k: 3,
                    strategy: GenerationStrategy::Diverse,
                    context: None,
                },
                reasoning: "No paths exist, generating initial exploration paths".to_string(),
            };
        }

        // Rule 3: pending paths need executing
        let pending: Vec<String> = state
            .paths
            .iter()
            .filter(|p| p.pending)
            .map(|p| p.id.clone())
            .collect();
        if !pending.is_empty() {
            return NextAction {
                reasoning: format!("{} pending paths detected, dispatching execution", pending.len()),
                action: Action::Execute { path_ids: pending },
            };
        }

        // Rule 3b: other workers are still executing
        let dispatched: Vec<String> = state
            .paths
            .iter()
            .filter(|p| p.dispatched)
            .map(|p| p.id.clone())
            .collect();
        if !dispatched.is_empty() {
            return NextAction {
                reasoning: format!("{} paths still running, waiting for completion", dispatched.len()),
                action: Action::Wait { path_ids: dispatched },
            };
        }

        // Rule 4: completed but unscored
        let unscored = state
            .paths
            .iter()
            .filter(|p| p.status == PathStatus::Completed && !p.scored)
            .count();
        if unscored > 0 {
            return NextAction {
                action: Action::Score {
                    threshold: SCORE_THRESHOLD,
                    keep_top_n: KEEP_TOP_N,
                },
                reasoning: format!("{} completed paths need scoring and pruning", unscored),
            };
        }

        // Rule 5: enough high-quality paths to merge
        let high_quality: Vec<String> = state
            .paths
            .iter()
            .filter(|p| {
                p.status != PathStatus::Pruned
                    && p.scored
                    && !p.aggregated
                    && p.score >= HIGH_QUALITY_SCORE
            })
            .map(|p| p.id.clone())
            .collect();
        if high_quality.len() >= 2 && !state.is_aggregated {
            return NextAction {
                reasoning: format!("{} high-quality paths ready for aggregation", high_quality.len()),
                action: Action::Aggregate {
                    path_ids: high_quality,
                    strategy: AggregationStrategy::Synthesis,
                },
            };
        }

        // Rule 6: keep exploring
        if state.confidence < self.confidence_threshold {
            return NextAction {
                action: Action::Generate {
                    k: 2,
                    strategy: GenerationStrategy::Focused,
                    context: state.current_findings.clone(),
                },
                reasoning: format!(
                    "Confidence {:.2} below threshold {:.2}, continuing exploration",
                    state.confidence, self.confidence_threshold
                ),
            };
        }

        NextAction {
            action: Action::Synthesize {},
            reasoning: "All paths explored, ready to synthesize final report".to_string(),
        }
    }

    fn termination_reason(&self, state: &GraphState) -> Option<String> {
        if state.confidence >= self.confidence_threshold {
            return Some(format!(
                "Confidence threshold reached ({:.2} >= {:.2})",
                state.confidence, self.confidence_threshold
            ));
        }
        if state.iteration >= self.max_iterations {
            return Some(format!(
                "Max iterations reached ({}/{})",
                state.iteration, self.max_iterations
            ));
        }
        if state.budget_exhausted {
            return Some("Budget exhausted, terminating early".to_string());
        }
        None
    }
}
