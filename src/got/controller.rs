use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::aggregation::{self, AggregationStrategy};
use super::similarity::diversity;
use super::templates::{self, qualifier};
use super::{
    AggregationResult, GenerationStrategy, GraphStatistics, PathKind, PathMetadata, PathStatus,
    ResearchPath, ResearchStep, ScoreBreakdown, ScorePruneResult, ScoredPath, ScoringCriteria,
    StepType,
};
use crate::error::{ResearchError, ResearchResult, StorageError};
use crate::logic::{ConflictTolerance, Fact};
use crate::storage::{GraphOperation, OperationType, Storage};

/// Upper bound on paths created by one Generate call.
const MAX_GENERATE: usize = 20;

/// Options for [`GraphController::generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub k: usize,
    pub strategy: GenerationStrategy,
    pub max_depth: u32,
    /// Findings carried forward into the new paths.
    pub context: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            k: 3,
            strategy: GenerationStrategy::Diverse,
            max_depth: 5,
            context: None,
        }
    }
}

impl GenerateOptions {
    pub fn new(k: usize, strategy: GenerationStrategy) -> Self {
        Self {
            k,
            strategy,
            ..Default::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Owns a session's path set.
///
/// Every operation works on clones, commits node upserts and operation log
/// rows in one storage transaction, and only then applies the result in
/// memory. A failed commit leaves the controller unchanged.
pub struct GraphController {
    pub(super) storage: Arc<dyn Storage>,
    pub(super) session_id: String,
    pub(super) paths: Vec<ResearchPath>,
    pub(super) history: Vec<GraphOperation>,
    /// Ids of research paths ever created in this graph, including deleted ones.
    pub(super) research_ids: HashSet<String>,
    tolerance: ConflictTolerance,
}

impl GraphController {
    /// Empty controller for a session.
    pub fn new(storage: Arc<dyn Storage>, session_id: impl Into<String>) -> Self {
        Self {
            storage,
            session_id: session_id.into(),
            paths: Vec::new(),
            history: Vec::new(),
            research_ids: HashSet::new(),
            tolerance: ConflictTolerance::default(),
        }
    }

    /// Rebuild a controller by folding the session's operation log.
    pub async fn load(storage: Arc<dyn Storage>, session_id: impl Into<String>) -> ResearchResult<Self> {
        let mut controller = Self::new(storage, session_id);
        let operations = controller.storage.get_operations(&controller.session_id).await?;

        for op in &operations {
            match op.operation_type {
                OperationType::Delete => {
                    controller.paths.retain(|p| !op.input_nodes.contains(&p.id));
                }
                OperationType::Import => {
                    let imported = decode_payload(op)?;
                    controller.track_research_ids(&imported);
                    controller.paths = imported;
                }
                _ => {
                    let changed = decode_payload(op)?;
                    controller.track_research_ids(&changed);
                    for path in changed {
                        controller.upsert(path);
                    }
                }
            }
        }

        controller.history = operations;

        debug!(
            session_id = %controller.session_id,
            paths = controller.paths.len(),
            operations = controller.history.len(),
            "Graph state loaded"
        );
        Ok(controller)
    }

    /// Set the tolerance used for conflict detection during aggregation
    pub fn with_tolerance(mut self, tolerance: ConflictTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Paths in creation order.
    pub fn paths(&self) -> &[ResearchPath] {
        &self.paths
    }

    pub fn get_path(&self, path_id: &str) -> Option<&ResearchPath> {
        self.paths.iter().find(|p| p.id == path_id)
    }

    /// Operation log in commit order.
    pub fn history(&self) -> &[GraphOperation] {
        &self.history
    }

    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics::from_paths(&self.paths, self.history.len())
    }

    /// Confidence of the most recent aggregation, if any.
    pub fn latest_aggregation_confidence(&self) -> Option<f64> {
        self.paths
            .iter()
            .filter(|p| p.is_aggregated())
            .max_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at))
            .map(|p| (p.score / 10.0).clamp(0.0, 1.0))
    }

    // ========================================================================
    // Generate
    // ========================================================================

    /// Create new active paths for `query` from the domain templates.
    pub async fn generate(
        &mut self,
        query: &str,
        options: GenerateOptions,
    ) -> ResearchResult<Vec<ResearchPath>> {
        let start = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(ResearchError::validation("query", "must not be empty"));
        }
        if options.k == 0 || options.k > MAX_GENERATE {
            return Err(ResearchError::validation(
                "k",
                format!("must be between 1 and {}", MAX_GENERATE),
            ));
        }

        let mut counter = self.research_ids.len() as u64;
        let seed = templates::stable_seed(query, counter);
        let selected = templates::select(options.strategy, options.k, seed);
        let now = Utc::now();

        let mut created: Vec<ResearchPath> = Vec::with_capacity(selected.len());
        for template in selected {
            let subtopic = templates::subtopic(counter);
            counter += 1;

            let search_query = format!("{} {}", template.query(query), subtopic);
            let siblings: Vec<&str> = created.iter().map(|p| p.query.as_str()).collect();
            let diversity_score = diversity(&search_query, &siblings);

            created.push(ResearchPath {
                id: new_path_id(counter),
                query: search_query.clone(),
                focus: template.focus.to_string(),
                steps: vec![ResearchStep::new(1, StepType::Search, "search", search_query.clone())],
                score: template.initial_score(),
                status: PathStatus::Active,
                metadata: PathMetadata {
                    depth: 0,
                    max_depth: options.max_depth,
                    strategy: options.strategy,
                    diversity_score,
                    base_query: search_query,
                    subtopic: subtopic.to_string(),
                    source_hints: template.source_hints.iter().map(|h| h.to_string()).collect(),
                    template_weight: template.weight,
                    context: options.context.clone(),
                    kind: PathKind::Research,
                    parent_ids: Vec::new(),
                    scored_at: None,
                    dispatched_at: None,
                    created_at: now,
                },
            });
        }

        let op = GraphOperation::new(&self.session_id, OperationType::Generate)
            .with_outputs(ids(&created))
            .with_payload(snapshot(&created)?);
        self.commit(vec![op], created.clone(), Vec::new()).await?;

        info!(
            session_id = %self.session_id,
            strategy = %options.strategy,
            count = created.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Research paths generated"
        );
        Ok(created)
    }

    // ========================================================================
    // Refine
    // ========================================================================

    /// Deepen a path by `depth` levels with a new analysis step.
    pub async fn refine(
        &mut self,
        path_id: &str,
        feedback: Option<&str>,
        depth: u32,
    ) -> ResearchResult<ResearchPath> {
        if depth == 0 {
            return Err(ResearchError::validation("depth", "must be at least 1"));
        }
        let mut path = self.research_path(path_id)?;

        let current = path.metadata.depth;
        if current.saturating_add(depth) > path.metadata.max_depth {
            return Err(ResearchError::DepthExceeded {
                path_id: path_id.to_string(),
                depth: current,
                max_depth: path.metadata.max_depth,
            });
        }

        let refined_query = match feedback.map(str::trim).filter(|f| !f.is_empty()) {
            Some(feedback) => format!("{} focusing on {}", path.query, feedback),
            None => format!("{} {}", qualifier(current), path.metadata.base_query),
        };

        let step_number = path.steps.len() as u32 + 1;
        path.steps.push(ResearchStep::new(
            step_number,
            StepType::Analyze,
            "refine",
            refined_query.clone(),
        ));
        path.query = refined_query;
        path.metadata.depth = current + depth;
        path.metadata.scored_at = None;
        path.metadata.dispatched_at = None;
        path.status = PathStatus::Active;

        let op = GraphOperation::new(&self.session_id, OperationType::Refine)
            .with_inputs(vec![path.id.clone()])
            .with_outputs(vec![path.id.clone()])
            .with_payload(snapshot(std::slice::from_ref(&path))?);
        self.commit(vec![op], vec![path.clone()], Vec::new()).await?;

        info!(
            session_id = %self.session_id,
            path_id = %path.id,
            depth = path.metadata.depth,
            "Research path refined"
        );
        Ok(path)
    }

    // ========================================================================
    // Record output
    // ========================================================================

    /// Attach externally produced output (and facts) to a path.
    ///
    /// Fills the latest step if it is still waiting, otherwise appends an
    /// analysis step. The path becomes completed and unscored.
    pub async fn record_output(
        &mut self,
        path_id: &str,
        output: &str,
        facts: Vec<Fact>,
    ) -> ResearchResult<ResearchPath> {
        if output.trim().is_empty() {
            return Err(ResearchError::validation("output", "must not be empty"));
        }
        let mut path = self.research_path(path_id)?;

        let waiting = path.steps.last().is_some_and(|s| !s.has_output());
        if !waiting {
            let step_number = path.steps.len() as u32 + 1;
            let query = path.query.clone();
            path.steps
                .push(ResearchStep::new(step_number, StepType::Analyze, "record", query));
        }
        if let Some(step) = path.steps.last_mut() {
            step.output = Some(output.to_string());
            step.facts = facts;
            step.timestamp = Utc::now();
        }
        path.status = PathStatus::Completed;
        path.metadata.scored_at = None;
        path.metadata.dispatched_at = None;

        let op = GraphOperation::new(&self.session_id, OperationType::Complete)
            .with_inputs(vec![path.id.clone()])
            .with_outputs(vec![path.id.clone()])
            .with_payload(snapshot(std::slice::from_ref(&path))?);
        self.commit(vec![op], vec![path.clone()], Vec::new()).await?;

        debug!(session_id = %self.session_id, path_id = %path.id, "Path output recorded");
        Ok(path)
    }

    // ========================================================================
    // Score + Prune
    // ========================================================================

    /// Score paths, keep the best `keep_n` and prune the rest permanently.
    ///
    /// With no ids, every non-pruned research path is scored.
    pub async fn score_and_prune(
        &mut self,
        path_ids: &[String],
        keep_n: usize,
        criteria: Option<ScoringCriteria>,
        threshold: f64,
    ) -> ResearchResult<ScorePruneResult> {
        let start = Instant::now();
        if keep_n == 0 {
            return Err(ResearchError::validation("keep_top_n", "must be at least 1"));
        }
        let criteria = criteria.unwrap_or_default();
        let weight_total = criteria.completeness + criteria.citation_quality + criteria.relevance;
        if criteria.completeness < 0.0
            || criteria.citation_quality < 0.0
            || criteria.relevance < 0.0
            || weight_total <= 0.0
        {
            return Err(ResearchError::validation(
                "criteria",
                "weights must be non-negative with a positive sum",
            ));
        }

        let mut targets: Vec<ResearchPath> = if path_ids.is_empty() {
            self.paths
                .iter()
                .filter(|p| !p.is_pruned() && !p.is_aggregated())
                .cloned()
                .collect()
        } else {
            let unique: Vec<&String> = dedup(path_ids);
            unique
                .into_iter()
                .map(|id| self.mutable_path(id))
                .collect::<ResearchResult<_>>()?
        };
        if targets.is_empty() {
            return Err(ResearchError::validation("path_ids", "no paths to score"));
        }

        let mut ranked: Vec<ScoredPath> = targets
            .iter()
            .map(|p| {
                let breakdown = score_breakdown(p);
                ScoredPath {
                    path_id: p.id.clone(),
                    score: weighted_score(&breakdown, &criteria),
                    kept: false,
                    breakdown,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path_id.cmp(&b.path_id)));
        for (rank, entry) in ranked.iter_mut().enumerate() {
            entry.kept = rank < keep_n;
        }

        let now = Utc::now();
        for path in targets.iter_mut() {
            if let Some(entry) = ranked.iter().find(|e| e.path_id == path.id) {
                path.score = entry.score;
                path.metadata.scored_at = Some(now);
                if !entry.kept {
                    path.status = PathStatus::Pruned;
                }
            }
        }

        let kept_ids: Vec<String> = ranked.iter().filter(|e| e.kept).map(|e| e.path_id.clone()).collect();
        let pruned_ids: Vec<String> = ranked.iter().filter(|e| !e.kept).map(|e| e.path_id.clone()).collect();
        let kept: Vec<ResearchPath> = targets.iter().filter(|p| !p.is_pruned()).cloned().collect();
        let pruned: Vec<ResearchPath> = targets.iter().filter(|p| p.is_pruned()).cloned().collect();

        let mut operations = vec![GraphOperation::new(&self.session_id, OperationType::Score)
            .with_inputs(ids(&targets))
            .with_outputs(kept_ids.clone())
            .with_payload(snapshot(&kept)?)];
        if !pruned.is_empty() {
            operations.push(
                GraphOperation::new(&self.session_id, OperationType::Prune)
                    .with_inputs(pruned_ids.clone())
                    .with_outputs(pruned_ids.clone())
                    .with_payload(snapshot(&pruned)?),
            );
        }
        self.commit(operations, targets, Vec::new()).await?;

        let meets_threshold = ranked.iter().filter(|e| e.kept && e.score >= threshold).count();
        info!(
            session_id = %self.session_id,
            scored = ranked.len(),
            kept = kept_ids.len(),
            pruned = pruned_ids.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Paths scored and pruned"
        );

        Ok(ScorePruneResult {
            ranked,
            kept_ids,
            pruned_ids,
            threshold,
            meets_threshold,
        })
    }

    // ========================================================================
    // Aggregate
    // ========================================================================

    /// Merge two or more paths into a new aggregated path.
    pub async fn aggregate(
        &mut self,
        path_ids: &[String],
        strategy: AggregationStrategy,
    ) -> ResearchResult<AggregationResult> {
        let start = Instant::now();
        let unique = dedup(path_ids);
        if unique.len() < 2 {
            return Err(ResearchError::validation(
                "path_ids",
                "at least two distinct paths are required",
            ));
        }
        let sources: Vec<ResearchPath> = unique
            .into_iter()
            .map(|id| self.research_path(id))
            .collect::<ResearchResult<_>>()?;
        if let Some(empty) = sources.iter().find(|p| p.latest_output().is_none()) {
            return Err(ResearchError::validation(
                "path_ids",
                format!("path {} has no recorded output", empty.id),
            ));
        }
        let refs: Vec<&ResearchPath> = sources.iter().collect();

        let conflicts = aggregation::collect_conflicts(&refs, &self.tolerance);
        let merged = aggregation::merge(strategy, &refs, &conflicts);
        let source_ids = ids(&sources);

        let now = Utc::now();
        let mut step = ResearchStep::new(
            1,
            StepType::Synthesize,
            "aggregate",
            format!("{} aggregation of {} paths", strategy, sources.len()),
        );
        step.output = Some(merged.content.clone());

        let aggregated = ResearchPath {
            id: format!("aggregated_{}", short_uuid()),
            query: format!("Aggregated from {} paths", sources.len()),
            focus: "Aggregated Research".to_string(),
            steps: vec![step],
            score: merged.confidence * 10.0,
            status: PathStatus::Completed,
            metadata: PathMetadata {
                depth: 0,
                max_depth: 0,
                strategy: GenerationStrategy::Diverse,
                diversity_score: 0.0,
                base_query: format!("Aggregated from {} paths", sources.len()),
                subtopic: String::new(),
                source_hints: Vec::new(),
                template_weight: 0.0,
                context: None,
                kind: PathKind::Aggregated,
                parent_ids: source_ids.clone(),
                scored_at: Some(now),
                dispatched_at: None,
                created_at: now,
            },
        };

        let op = GraphOperation::new(&self.session_id, OperationType::Aggregate)
            .with_inputs(source_ids.clone())
            .with_outputs(vec![aggregated.id.clone()])
            .with_payload(snapshot(std::slice::from_ref(&aggregated))?);
        self.commit(vec![op], vec![aggregated.clone()], Vec::new()).await?;

        info!(
            session_id = %self.session_id,
            strategy = %strategy,
            sources = source_ids.len(),
            conflicts = conflicts.len(),
            confidence = merged.confidence,
            latency_ms = start.elapsed().as_millis() as u64,
            "Paths aggregated"
        );

        Ok(AggregationResult {
            path_id: aggregated.id,
            strategy,
            content: merged.content,
            confidence: merged.confidence,
            conflicts,
            source_ids,
        })
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Mark pending paths as handed to a worker at `at`.
    ///
    /// Paths that are no longer pending are skipped. Returns the marked paths.
    pub async fn dispatch(&mut self, path_ids: &[String], at: DateTime<Utc>) -> ResearchResult<Vec<ResearchPath>> {
        let mut marked: Vec<ResearchPath> = Vec::new();
        for id in dedup(path_ids) {
            let mut path = self.research_path(id)?;
            if !path.is_pending() {
                continue;
            }
            path.metadata.dispatched_at = Some(at);
            marked.push(path);
        }
        if marked.is_empty() {
            return Ok(marked);
        }
        self.commit_dispatch(&marked).await?;
        debug!(session_id = %self.session_id, paths = marked.len(), "Paths dispatched");
        Ok(marked)
    }

    /// Hand a dispatched path back so the next decision executes it again.
    ///
    /// Paths that were removed, pruned or completed meanwhile are left alone.
    pub async fn release_dispatch(&mut self, path_id: &str) -> ResearchResult<()> {
        let Some(path) = self.get_path(path_id) else {
            return Ok(());
        };
        if !path.is_pending() || path.metadata.dispatched_at.is_none() {
            return Ok(());
        }
        let mut path = path.clone();
        path.metadata.dispatched_at = None;
        self.commit_dispatch(std::slice::from_ref(&path)).await?;
        debug!(session_id = %self.session_id, path_id = %path_id, "Path dispatch released");
        Ok(())
    }

    async fn commit_dispatch(&mut self, paths: &[ResearchPath]) -> ResearchResult<()> {
        let op = GraphOperation::new(&self.session_id, OperationType::Dispatch)
            .with_inputs(ids(paths))
            .with_outputs(ids(paths))
            .with_payload(snapshot(paths)?);
        self.commit(vec![op], paths.to_vec(), Vec::new()).await
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Explicitly remove a path from the graph.
    pub async fn delete_path(&mut self, path_id: &str) -> ResearchResult<()> {
        if self.get_path(path_id).is_none() {
            return Err(ResearchError::path_not_found(path_id));
        }
        let op = GraphOperation::new(&self.session_id, OperationType::Delete)
            .with_inputs(vec![path_id.to_string()]);
        self.commit(vec![op], Vec::new(), vec![path_id.to_string()]).await?;

        info!(session_id = %self.session_id, path_id = %path_id, "Research path deleted");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Clone of a path that may still be mutated.
    fn mutable_path(&self, path_id: &str) -> ResearchResult<ResearchPath> {
        let path = self
            .get_path(path_id)
            .ok_or_else(|| ResearchError::path_not_found(path_id))?;
        if path.is_pruned() {
            return Err(ResearchError::validation(
                "path_id",
                format!("path {} is pruned", path_id),
            ));
        }
        Ok(path.clone())
    }

    /// [`Self::mutable_path`], restricted to research paths.
    fn research_path(&self, path_id: &str) -> ResearchResult<ResearchPath> {
        let path = self.mutable_path(path_id)?;
        if path.is_aggregated() {
            return Err(ResearchError::validation(
                "path_id",
                format!("path {} is an aggregation", path_id),
            ));
        }
        Ok(path)
    }

    /// Fail when the session is gone or closed.
    async fn ensure_open(&self) -> ResearchResult<()> {
        let session = self
            .storage
            .get_session(&self.session_id)
            .await?
            .ok_or_else(|| ResearchError::session_not_found(&self.session_id))?;
        if session.status.is_terminal() {
            return Err(ResearchError::SessionClosed {
                session_id: self.session_id.clone(),
                status: session.status.to_string(),
            });
        }
        Ok(())
    }

    /// Persist, then apply. Nothing changes in memory if persistence fails.
    pub(super) async fn commit(
        &mut self,
        operations: Vec<GraphOperation>,
        changed: Vec<ResearchPath>,
        deleted: Vec<String>,
    ) -> ResearchResult<()> {
        self.ensure_open().await?;
        let records = changed
            .iter()
            .map(|p| p.to_record(&self.session_id))
            .collect::<Result<Vec<_>, _>>()?;
        self.storage
            .commit_operations(&self.session_id, &operations, &records, &deleted)
            .await?;

        self.track_research_ids(&changed);
        for path in changed {
            self.upsert(path);
        }
        self.paths.retain(|p| !deleted.contains(&p.id));
        self.history.extend(operations);
        Ok(())
    }

    /// Remember research path ids; they drive subtopic rotation and id numbering.
    pub(super) fn track_research_ids(&mut self, paths: &[ResearchPath]) {
        self.research_ids.extend(
            paths
                .iter()
                .filter(|p| p.metadata.kind == PathKind::Research)
                .map(|p| p.id.clone()),
        );
    }

    fn upsert(&mut self, path: ResearchPath) {
        match self.paths.iter_mut().find(|p| p.id == path.id) {
            Some(existing) => *existing = path,
            None => self.paths.push(path),
        }
    }
}

/// Score components for a path, each in `[0, 1]`.
pub(super) fn score_breakdown(path: &ResearchPath) -> ScoreBreakdown {
    let with_output = path.steps.iter().filter(|s| s.has_output()).count();
    ScoreBreakdown {
        completeness: path.steps.len().min(5) as f64 / 5.0,
        citation_quality: with_output.min(3) as f64 / 3.0,
        relevance: path.metadata.diversity_score.clamp(0.0, 1.0),
    }
}

/// Weighted mean of the components, scaled to 0-10.
pub(super) fn weighted_score(breakdown: &ScoreBreakdown, criteria: &ScoringCriteria) -> f64 {
    let total = criteria.completeness + criteria.citation_quality + criteria.relevance;
    let raw = criteria.completeness * breakdown.completeness
        + criteria.citation_quality * breakdown.citation_quality
        + criteria.relevance * breakdown.relevance;
    (10.0 * raw / total).clamp(0.0, 10.0)
}

pub(super) fn snapshot(paths: &[ResearchPath]) -> ResearchResult<serde_json::Value> {
    serde_json::to_value(paths).map_err(|e| {
        ResearchError::Persistence(StorageError::Serialization {
            message: e.to_string(),
        })
    })
}

fn decode_payload(op: &GraphOperation) -> ResearchResult<Vec<ResearchPath>> {
    if op.payload.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(op.payload.clone()).map_err(|e| {
        ResearchError::Persistence(StorageError::Serialization {
            message: format!("operation {}: {}", op.operation_id, e),
        })
    })
}

pub(super) fn ids(paths: &[ResearchPath]) -> Vec<String> {
    paths.iter().map(|p| p.id.clone()).collect()
}

fn dedup(ids: &[String]) -> Vec<&String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).collect()
}

fn new_path_id(n: u64) -> String {
    format!("path_{}_{}", n, short_uuid())
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
