//! Graph-of-Thoughts research graph.
//!
//! A session's research is a set of [`ResearchPath`]s transformed by five
//! operations:
//! - Generate: create k diverse paths from templates
//! - Refine: deepen a path with a new analysis step
//! - Score + Prune: rank paths and permanently prune the tail
//! - Aggregate: merge path outputs into a synthesized result
//! - Record output: attach externally produced findings to a path
//!
//! The [`GraphController`] owns the in-memory path set and persists every
//! mutation before applying it.

pub mod aggregation;
mod controller;
pub mod export;
pub mod similarity;
pub mod templates;

#[cfg(test)]
#[path = "controller_tests.rs"]
mod controller_tests;

pub use aggregation::AggregationStrategy;
pub use controller::{GenerateOptions, GraphController};
pub use export::{GraphEdge, GraphExport, GraphNode, GraphVisualization};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::logic::{Conflict, Fact};
use crate::storage::NodeRecord;

/// Status of a research path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    #[default]
    Active,
    Completed,
    /// Terminal. Pruned paths are never mutated again.
    Pruned,
}

impl std::fmt::Display for PathStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStatus::Active => write!(f, "active"),
            PathStatus::Completed => write!(f, "completed"),
            PathStatus::Pruned => write!(f, "pruned"),
        }
    }
}

/// Whether a path investigates the topic or merges other paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    #[default]
    Research,
    Aggregated,
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathKind::Research => write!(f, "research"),
            PathKind::Aggregated => write!(f, "aggregated"),
        }
    }
}

/// Kind of research step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Search,
    Analyze,
    Synthesize,
    Validate,
}

/// How Generate picks templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStrategy {
    /// Templates by descending weight.
    #[default]
    Diverse,
    /// Templates by descending weight, carrying forward context.
    Focused,
    /// Templates in a seeded shuffled order.
    Exploratory,
    /// Exactly one path per template.
    Orthogonal,
}

impl std::fmt::Display for GenerationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationStrategy::Diverse => write!(f, "diverse"),
            GenerationStrategy::Focused => write!(f, "focused"),
            GenerationStrategy::Exploratory => write!(f, "exploratory"),
            GenerationStrategy::Orthogonal => write!(f, "orthogonal"),
        }
    }
}

impl std::str::FromStr for GenerationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "diverse" => Ok(GenerationStrategy::Diverse),
            "focused" => Ok(GenerationStrategy::Focused),
            "exploratory" => Ok(GenerationStrategy::Exploratory),
            "orthogonal" => Ok(GenerationStrategy::Orthogonal),
            _ => Err(format!("Unknown generation strategy: {}", s)),
        }
    }
}

/// One append-only step of a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchStep {
    /// Sequence number, starting at 1.
    pub step_number: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Free-form action label (search, refine, aggregate).
    pub action: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<Fact>,
    pub timestamp: DateTime<Utc>,
}

impl ResearchStep {
    pub(crate) fn new(
        step_number: u32,
        step_type: StepType,
        action: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            step_number,
            step_type,
            action: action.into(),
            query: query.into(),
            output: None,
            facts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Whether the step carries non-empty output.
    pub fn has_output(&self) -> bool {
        self.output.as_deref().is_some_and(|o| !o.trim().is_empty())
    }
}

/// Path metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMetadata {
    /// Number of refinements applied.
    pub depth: u32,
    pub max_depth: u32,
    pub strategy: GenerationStrategy,
    /// 1 - mean Jaccard overlap with sibling paths of the same Generate call.
    pub diversity_score: f64,
    /// Query before any refinement.
    pub base_query: String,
    #[serde(default)]
    pub subtopic: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_hints: Vec<String>,
    #[serde(default)]
    pub template_weight: f64,
    /// Findings carried forward by a focused Generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub kind: PathKind,
    /// Source paths of an aggregated path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_ids: Vec<String>,
    /// Set by Score+Prune; cleared when new output is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_at: Option<DateTime<Utc>>,
    /// Set when a worker is handed the path for execution; cleared by new output or refinement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A candidate investigation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPath {
    pub id: String,
    pub query: String,
    pub focus: String,
    pub steps: Vec<ResearchStep>,
    /// Quality score, 0-10.
    pub score: f64,
    pub status: PathStatus,
    pub metadata: PathMetadata,
}

impl ResearchPath {
    /// Active and the latest step is still waiting for its output.
    pub fn is_pending(&self) -> bool {
        self.status == PathStatus::Active && self.steps.last().is_some_and(|s| !s.has_output())
    }

    pub fn is_pruned(&self) -> bool {
        self.status == PathStatus::Pruned
    }

    /// Pending and handed to a worker less than `lease` ago.
    pub fn is_dispatched(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.is_pending()
            && self
                .metadata
                .dispatched_at
                .is_some_and(|at| now.signed_duration_since(at) < lease)
    }

    pub fn is_scored(&self) -> bool {
        self.metadata.scored_at.is_some()
    }

    pub fn is_aggregated(&self) -> bool {
        self.metadata.kind == PathKind::Aggregated
    }

    /// Output of the most recent step that has one.
    pub fn latest_output(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.has_output())
            .and_then(|s| s.output.as_deref())
    }

    /// All outputs in step order.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(|s| s.has_output())
            .filter_map(|s| s.output.as_deref())
    }

    /// All structured facts in step order.
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.steps.iter().flat_map(|s| s.facts.iter())
    }

    /// Timestamp of the first step, falling back to creation time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.steps
            .first()
            .map(|s| s.timestamp)
            .unwrap_or(self.metadata.created_at)
    }

    /// Convert to the persisted node shape.
    pub fn to_record(&self, session_id: &str) -> Result<NodeRecord, StorageError> {
        let content = serde_json::to_string(self).map_err(|e| StorageError::Serialization {
            message: format!("path {}: {}", self.id, e),
        })?;
        Ok(NodeRecord {
            node_id: self.id.clone(),
            session_id: session_id.to_string(),
            parent_id: self.metadata.parent_ids.first().cloned(),
            node_type: self.metadata.kind.to_string(),
            content,
            summary: format!("{}: {}", self.focus, self.query),
            quality_score: self.score,
            status: self.status.to_string(),
            depth: i64::from(self.metadata.depth),
            created_at: self.metadata.created_at,
        })
    }
}

/// Weights for the path scoring components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringCriteria {
    #[serde(default = "default_completeness_weight")]
    pub completeness: f64,
    #[serde(default = "default_citation_weight")]
    pub citation_quality: f64,
    #[serde(default = "default_relevance_weight")]
    pub relevance: f64,
}

fn default_completeness_weight() -> f64 {
    0.4
}

fn default_citation_weight() -> f64 {
    0.3
}

fn default_relevance_weight() -> f64 {
    0.3
}

impl Default for ScoringCriteria {
    fn default() -> Self {
        Self {
            completeness: default_completeness_weight(),
            citation_quality: default_citation_weight(),
            relevance: default_relevance_weight(),
        }
    }
}

/// Per-path scoring components, each 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub completeness: f64,
    pub citation_quality: f64,
    pub relevance: f64,
}

/// One ranked entry of a Score+Prune result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPath {
    pub path_id: String,
    pub score: f64,
    pub kept: bool,
    pub breakdown: ScoreBreakdown,
}

/// Result of Score+Prune.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePruneResult {
    /// All scored paths, best first.
    pub ranked: Vec<ScoredPath>,
    pub kept_ids: Vec<String>,
    pub pruned_ids: Vec<String>,
    /// Reporting threshold. Pruning is by rank only.
    pub threshold: f64,
    /// Number of kept paths scoring at or above the threshold.
    pub meets_threshold: usize,
}

/// Result of Aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Id of the new aggregated path.
    pub path_id: String,
    pub strategy: AggregationStrategy,
    pub content: String,
    /// Confidence in the merged result, 0-1.
    pub confidence: f64,
    pub conflicts: Vec<Conflict>,
    pub source_ids: Vec<String>,
}

/// Snapshot counts over a path set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStatistics {
    pub total_paths: usize,
    pub active_paths: usize,
    pub pending_paths: usize,
    pub completed_paths: usize,
    pub pruned_paths: usize,
    pub aggregated_paths: usize,
    pub max_depth: u32,
    pub average_score: f64,
    pub operations: usize,
}

impl GraphStatistics {
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a ResearchPath>, operations: usize) -> Self {
        let mut stats = GraphStatistics {
            operations,
            ..Default::default()
        };
        let mut score_total = 0.0;
        for path in paths {
            stats.total_paths += 1;
            score_total += path.score;
            stats.max_depth = stats.max_depth.max(path.metadata.depth);
            if path.is_pending() {
                stats.pending_paths += 1;
            }
            if path.is_aggregated() {
                stats.aggregated_paths += 1;
            }
            match path.status {
                PathStatus::Active => stats.active_paths += 1,
                PathStatus::Completed => stats.completed_paths += 1,
                PathStatus::Pruned => stats.pruned_paths += 1,
            }
        }
        if stats.total_paths > 0 {
            stats.average_score = score_total / stats.total_paths as f64;
        }
        stats
    }
}
