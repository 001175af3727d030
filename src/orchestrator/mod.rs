//! Research driver loop.
//!
//! The orchestrator asks the session layer for the next action, routes it to
//! the graph controller, and checkpoints after every step. Path execution is
//! delegated to a [`PathExecutor`] and runs outside the session lock; every
//! graph mutation runs inside it.


use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExecutorResult, ResearchError, ResearchResult};
use crate::got::aggregation::collect_conflicts;
use crate::got::{
    AggregationStrategy, GenerateOptions, GenerationStrategy, PathStatus, ResearchPath,
};
use crate::logic::{Conflict, Fact, FactExtractor, Source};
use crate::session::{Decision, SessionManager};
use crate::statemachine::Action;
use crate::storage::SessionStatus;

/// Findings produced by executing one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathOutcome {
    pub output: String,
    #[serde(default)]
    pub facts: Vec<Fact>,
}

impl PathOutcome {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            facts: Vec::new(),
        }
    }

    pub fn with_facts(mut self, facts: Vec<Fact>) -> Self {
        self.facts = facts;
        self
    }
}

/// Executes a research path outside the core (search, browse, summarize).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PathExecutor: Send + Sync {
    async fn execute(&self, session_id: &str, path: &ResearchPath) -> ExecutorResult<PathOutcome>;
}

/// Final result of a research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub session_id: String,
    pub content: String,
    pub confidence: f64,
    pub conflicts: Vec<Conflict>,
    pub iterations: u32,
}

/// What one driver step did.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub decision: Decision,
    /// Paths whose output was recorded in this step.
    pub executed: usize,
    /// Set once the session is synthesized.
    pub outcome: Option<ResearchOutcome>,
}

/// Drives a session from creation to a synthesized result.
pub struct Orchestrator {
    sessions: SessionManager,
    executor: Arc<dyn PathExecutor>,
    extractor: Option<Arc<dyn FactExtractor>>,
    worker_id: String,
}

impl Orchestrator {
    pub fn new(sessions: SessionManager, executor: Arc<dyn PathExecutor>) -> Self {
        Self {
            sessions,
            executor,
            extractor: None,
            worker_id: format!("orchestrator-{}", Uuid::new_v4()),
        }
    }

    /// Derive facts with `extractor` when the executor returns none.
    pub fn with_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Lock holder name used by this orchestrator.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run until the state machine says synthesize.
    pub async fn run(&self, session_id: &str) -> ResearchResult<ResearchOutcome> {
        let start = Instant::now();
        info!(session_id = %session_id, worker = %self.worker_id, "Research run started");
        loop {
            let report = self.step(session_id).await?;
            if let Some(outcome) = report.outcome {
                info!(
                    session_id = %session_id,
                    iterations = outcome.iterations,
                    confidence = outcome.confidence,
                    conflicts = outcome.conflicts.len(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Research run completed"
                );
                return Ok(outcome);
            }
        }
    }

    /// One decide, mutate, checkpoint cycle.
    ///
    /// Non-retryable failures close the session as failed before surfacing.
    pub async fn step(&self, session_id: &str) -> ResearchResult<StepReport> {
        match self.try_step(session_id).await {
            Ok(report) => Ok(report),
            Err(err) => {
                if !err.is_retryable() && !matches!(err, ResearchError::SessionClosed { .. }) {
                    error!(session_id = %session_id, error = %err, "Research step failed");
                    if let Err(mark_err) = self.sessions.mark_failed(session_id, &err.to_string()).await {
                        warn!(
                            session_id = %session_id,
                            error = %mark_err,
                            "Could not mark session failed"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn try_step(&self, session_id: &str) -> ResearchResult<StepReport> {
        let decision = self
            .sessions
            .next_action_with_retry(session_id, &self.worker_id)
            .await?;
        debug!(
            session_id = %session_id,
            iteration = decision.iteration,
            action = decision.next.action.name(),
            "Dispatching action"
        );

        let mut executed = 0;
        let mut outcome = None;
        match &decision.next.action {
            Action::Generate {
                k,
                strategy,
                context,
            } => {
                self.generate(session_id, *k, *strategy, context.clone())
                    .await?;
            }
            Action::Execute { path_ids } => {
                executed = self.execute(session_id, path_ids).await?;
            }
            Action::Wait { path_ids } => {
                debug!(
                    session_id = %session_id,
                    running = path_ids.len(),
                    "Waiting for other workers"
                );
                tokio::time::sleep(self.sessions.lock_config().retry_delay()).await;
            }
            Action::Score {
                threshold,
                keep_top_n,
            } => {
                self.score(session_id, *keep_top_n, *threshold).await?;
            }
            Action::Aggregate { path_ids, strategy } => {
                self.aggregate(session_id, path_ids, *strategy).await?;
            }
            Action::Synthesize {} => {
                outcome = Some(self.synthesize(session_id, decision.iteration).await?);
            }
        }

        Ok(StepReport {
            decision,
            executed,
            outcome,
        })
    }

    /// Move to `status` unless already there.
    async fn advance_status(&self, session_id: &str, status: SessionStatus) -> ResearchResult<()> {
        let session = self.sessions.ensure_open(session_id).await?;
        if session.status != status {
            self.sessions.update_status(session_id, status, None).await?;
        }
        Ok(())
    }

    async fn generate(
        &self,
        session_id: &str,
        k: usize,
        strategy: GenerationStrategy,
        context: Option<String>,
    ) -> ResearchResult<()> {
        let max_depth = self.sessions.research_config().default_max_depth;
        self.sessions
            .with_lock_retry(session_id, &self.worker_id, || async {
                self.advance_status(session_id, SessionStatus::Planning).await?;
                let session = self.sessions.get_session(session_id).await?;
                let mut graph = self.sessions.load_graph(session_id).await?;

                let mut options = GenerateOptions::new(k, strategy).with_max_depth(max_depth);
                if let Some(context) = context {
                    options = options.with_context(context);
                }
                graph.generate(&session.topic, options).await?;
                self.sessions.refresh_confidence(&graph).await?;
                Ok(())
            })
            .await
    }

    /// Execute paths outside the lock and record each result inside it.
    async fn execute(&self, session_id: &str, path_ids: &[String]) -> ResearchResult<usize> {
        self.sessions
            .with_lock_retry(session_id, &self.worker_id, || {
                self.advance_status(session_id, SessionStatus::Executing)
            })
            .await?;

        let snapshot = self.sessions.load_graph(session_id).await?;
        let mut recorded = 0;

        for path_id in path_ids {
            let Some(path) = snapshot.get_path(path_id).cloned() else {
                warn!(session_id = %session_id, path_id = %path_id, "Path vanished before execution");
                continue;
            };

            let start = Instant::now();
            let outcome = match self.executor.execute(session_id, &path).await {
                Ok(outcome) if !outcome.output.trim().is_empty() => outcome,
                Ok(_) => {
                    warn!(session_id = %session_id, path_id = %path_id, "Executor returned no output");
                    self.release_dispatch(session_id, path_id).await?;
                    continue;
                }
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        path_id = %path_id,
                        error = %err,
                        "Path execution failed, leaving path pending"
                    );
                    self.release_dispatch(session_id, path_id).await?;
                    continue;
                }
            };

            let facts = if outcome.facts.is_empty() {
                self.extract_facts(&path, &outcome.output)
            } else {
                outcome.facts
            };

            self.sessions
                .with_lock_retry(session_id, &self.worker_id, || async {
                    let mut graph = self.sessions.load_graph(session_id).await?;
                    graph.record_output(path_id, &outcome.output, facts).await?;
                    self.sessions.refresh_confidence(&graph).await?;
                    self.sessions.check_budget(&graph).await?;
                    Ok(())
                })
                .await?;

            recorded += 1;
            info!(
                session_id = %session_id,
                path_id = %path_id,
                latency_ms = start.elapsed().as_millis() as u64,
                "Path executed"
            );
        }

        Ok(recorded)
    }

    /// Make a failed path pending again for the next decision.
    async fn release_dispatch(&self, session_id: &str, path_id: &str) -> ResearchResult<()> {
        self.sessions
            .with_lock_retry(session_id, &self.worker_id, || async {
                let mut graph = self.sessions.load_graph(session_id).await?;
                graph.release_dispatch(path_id).await
            })
            .await
    }

    fn extract_facts(&self, path: &ResearchPath, output: &str) -> Vec<Fact> {
        let Some(extractor) = &self.extractor else {
            return Vec::new();
        };
        let source = path
            .metadata
            .source_hints
            .first()
            .map(|hint| Source::default().with_title(hint.clone()))
            .unwrap_or_default();
        extractor.extract(output, &source).facts
    }

    async fn score(&self, session_id: &str, keep_n: usize, threshold: f64) -> ResearchResult<()> {
        self.sessions
            .with_lock_retry(session_id, &self.worker_id, || async {
                self.advance_status(session_id, SessionStatus::Executing).await?;
                let mut graph = self.sessions.load_graph(session_id).await?;
                graph.score_and_prune(&[], keep_n, None, threshold).await?;
                self.sessions.refresh_confidence(&graph).await?;
                Ok(())
            })
            .await
    }

    async fn aggregate(
        &self,
        session_id: &str,
        path_ids: &[String],
        strategy: AggregationStrategy,
    ) -> ResearchResult<()> {
        self.sessions
            .with_lock_retry(session_id, &self.worker_id, || async {
                self.advance_status(session_id, SessionStatus::Synthesizing).await?;
                let mut graph = self.sessions.load_graph(session_id).await?;
                graph.aggregate(path_ids, strategy).await?;
                self.sessions.refresh_confidence(&graph).await?;
                Ok(())
            })
            .await
    }

    /// Produce the final result and complete the session.
    ///
    /// Uses the latest aggregation when there is one, otherwise merges the
    /// surviving research paths.
    async fn synthesize(&self, session_id: &str, iterations: u32) -> ResearchResult<ResearchOutcome> {
        self.sessions
            .with_lock_retry(session_id, &self.worker_id, || async {
                self.sessions.ensure_open(session_id).await?;
                let mut graph = self.sessions.load_graph(session_id).await?;

                let (content, conflicts) = match latest_aggregate(graph.paths()) {
                    Some(merged) => {
                        let sources: Vec<&ResearchPath> = merged
                            .metadata
                            .parent_ids
                            .iter()
                            .filter_map(|id| graph.get_path(id))
                            .collect();
                        let conflicts = collect_conflicts(&sources, self.sessions.tolerance());
                        (merged.latest_output().unwrap_or_default().to_string(), conflicts)
                    }
                    None => {
                        let live: Vec<String> = graph
                            .paths()
                            .iter()
                            .filter(|p| p.status == PathStatus::Completed && !p.is_aggregated())
                            .map(|p| p.id.clone())
                            .collect();
                        match live.as_slice() {
                            [] => (String::new(), Vec::new()),
                            [only] => {
                                let content = graph
                                    .get_path(only)
                                    .and_then(|p| p.latest_output())
                                    .unwrap_or_default()
                                    .to_string();
                                (content, Vec::new())
                            }
                            _ => {
                                let result = graph.aggregate(&live, AggregationStrategy::Synthesis).await?;
                                (result.content, result.conflicts)
                            }
                        }
                    }
                };

                let confidence = self.sessions.refresh_confidence(&graph).await?;
                self.sessions
                    .update_status(session_id, SessionStatus::Completed, None)
                    .await?;

                Ok(ResearchOutcome {
                    session_id: session_id.to_string(),
                    content,
                    confidence,
                    conflicts,
                    iterations,
                })
            })
            .await
    }
}

/// Most recently created aggregated path.
fn latest_aggregate(paths: &[ResearchPath]) -> Option<&ResearchPath> {
    paths
        .iter()
        .filter(|p| p.is_aggregated())
        .max_by_key(|p| p.metadata.created_at)
}
