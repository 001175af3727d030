//! Research session lifecycle and the per-session lock.
//!
//! [`SessionManager`] wraps the storage layer with the rules the research
//! core depends on: sessions are created with type-specific limits, closed
//! sessions refuse further work, and every decision or graph mutation runs
//! inside the session's lock.

mod agents;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, LockConfig, ResearchConfig};
use crate::error::{ResearchError, ResearchResult, StorageError};
use crate::got::GraphController;
use crate::logic::{ConflictTolerance, GradeRater, SourceRater};
use crate::statemachine::{
    session_confidence, Action, GraphState, NextAction, ResearchStateMachine,
};
use crate::storage::{
    DecisionRecord, LockAttempt, OperationType, ResearchSession, ResearchType, SessionStatus,
    Storage,
};

/// Per-session overrides of the research-type limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub max_iterations: Option<u32>,
    pub confidence_threshold: Option<f64>,
}

/// Result of a next-action decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub session_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Session confidence the decision was made with.
    pub confidence: f64,
    pub path_count: usize,
    #[serde(flatten)]
    pub next: NextAction,
}

/// Map a storage error to the research taxonomy.
pub(crate) fn storage_error(err: StorageError) -> ResearchError {
    match err {
        StorageError::SessionNotFound { session_id } => ResearchError::session_not_found(session_id),
        StorageError::AgentNotFound { agent_id } => ResearchError::NotFound {
            kind: "Agent",
            id: agent_id,
        },
        other => ResearchError::Persistence(other),
    }
}

/// Releases a session lock when a locked section is dropped before finishing.
///
/// Covers cancellation and panics; the normal exit path disarms the guard and
/// releases inline so release failures still reach the caller.
struct LockGuard {
    storage: Arc<dyn Storage>,
    session_id: String,
    caller: String,
    armed: bool,
}

impl LockGuard {
    fn new(storage: Arc<dyn Storage>, session_id: &str, caller: &str) -> Self {
        Self {
            storage,
            session_id: session_id.to_string(),
            caller: caller.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                session_id = %self.session_id,
                caller = %self.caller,
                "No runtime to release abandoned session lock; it will go stale"
            );
            return;
        };
        let storage = self.storage.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let caller = std::mem::take(&mut self.caller);
        handle.spawn(async move {
            match storage.release_lock(&session_id, &caller).await {
                Ok(()) => warn!(
                    session_id = %session_id,
                    caller = %caller,
                    "Released session lock of an abandoned critical section"
                ),
                Err(e) => warn!(
                    session_id = %session_id,
                    caller = %caller,
                    error = %e,
                    "Failed to release abandoned session lock"
                ),
            }
        });
    }
}

/// Session lifecycle, locking and next-action decisions.
#[derive(Clone)]
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    research: ResearchConfig,
    lock: LockConfig,
    rater: Arc<dyn SourceRater>,
    tolerance: ConflictTolerance,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, config: &Config) -> Self {
        Self {
            storage,
            research: config.research.clone(),
            lock: config.lock.clone(),
            rater: Arc::new(GradeRater),
            tolerance: ConflictTolerance::default(),
        }
    }

    /// Use a different source rater for confidence.
    pub fn with_rater(mut self, rater: Arc<dyn SourceRater>) -> Self {
        self.rater = rater;
        self
    }

    /// Use a different conflict tolerance for aggregation.
    pub fn with_tolerance(mut self, tolerance: ConflictTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn research_config(&self) -> &ResearchConfig {
        &self.research
    }

    pub fn lock_config(&self) -> &LockConfig {
        &self.lock
    }

    pub fn rater(&self) -> &dyn SourceRater {
        self.rater.as_ref()
    }

    pub fn tolerance(&self) -> &ConflictTolerance {
        &self.tolerance
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create a session with the limits of its research type.
    pub async fn create_session(
        &self,
        topic: &str,
        research_type: ResearchType,
    ) -> ResearchResult<ResearchSession> {
        self.create_session_with(topic, research_type, SessionOptions::default())
            .await
    }

    /// Create a session, overriding the research-type limits.
    pub async fn create_session_with(
        &self,
        topic: &str,
        research_type: ResearchType,
        options: SessionOptions,
    ) -> ResearchResult<ResearchSession> {
        if topic.trim().is_empty() {
            return Err(ResearchError::validation("topic", "Topic cannot be empty"));
        }
        if let Some(threshold) = options.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ResearchError::validation(
                    "confidence_threshold",
                    "Must be between 0 and 1",
                ));
            }
        }
        if options.max_iterations == Some(0) {
            return Err(ResearchError::validation("max_iterations", "Must be at least 1"));
        }

        let mut session = ResearchSession::new(topic.trim(), research_type);
        if research_type != ResearchType::Quick {
            session = session
                .with_max_iterations(self.research.max_iterations)
                .with_confidence_threshold(self.research.confidence_threshold);
        }
        if let Some(max_iterations) = options.max_iterations {
            session = session.with_max_iterations(max_iterations);
        }
        if let Some(threshold) = options.confidence_threshold {
            session = session.with_confidence_threshold(threshold);
        }

        self.storage.create_session(&session).await.map_err(storage_error)?;
        info!(
            session_id = %session.id,
            research_type = %session.research_type,
            max_iterations = session.max_iterations,
            confidence_threshold = session.confidence_threshold,
            "Research session created"
        );
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> ResearchResult<ResearchSession> {
        self.storage
            .get_session(session_id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ResearchError::session_not_found(session_id))
    }

    pub async fn list_sessions(&self) -> ResearchResult<Vec<ResearchSession>> {
        self.storage.list_sessions().await.map_err(storage_error)
    }

    /// Move a session to a new status. Closed sessions stay closed.
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> ResearchResult<ResearchSession> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() && session.status != status {
            return Err(ResearchError::SessionClosed {
                session_id: session_id.to_string(),
                status: session.status.to_string(),
            });
        }
        self.storage
            .update_session_status(session_id, status, reason.map(str::to_string))
            .await
            .map_err(storage_error)?;
        info!(
            session_id = %session_id,
            from = %session.status,
            to = %status,
            "Session status updated"
        );
        self.get_session(session_id).await
    }

    /// Close a session as failed, keeping the reason.
    pub async fn mark_failed(&self, session_id: &str, reason: &str) -> ResearchResult<()> {
        self.storage
            .update_session_status(session_id, SessionStatus::Failed, Some(reason.to_string()))
            .await
            .map_err(storage_error)?;
        warn!(session_id = %session_id, reason = %reason, "Session marked failed");
        Ok(())
    }

    pub async fn update_confidence(&self, session_id: &str, confidence: f64) -> ResearchResult<()> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ResearchError::validation(
                "confidence",
                "Must be between 0 and 1",
            ));
        }
        self.storage
            .update_confidence(session_id, confidence)
            .await
            .map_err(storage_error)
    }

    pub async fn set_aggregated(&self, session_id: &str, aggregated: bool) -> ResearchResult<()> {
        self.storage
            .set_aggregated(session_id, aggregated)
            .await
            .map_err(storage_error)
    }

    pub async fn set_budget_exhausted(&self, session_id: &str, exhausted: bool) -> ResearchResult<()> {
        self.storage
            .set_budget_exhausted(session_id, exhausted)
            .await
            .map_err(storage_error)
    }

    // ------------------------------------------------------------------------
    // Lock
    // ------------------------------------------------------------------------

    /// Take the session lock for `caller`.
    ///
    /// Free, stale and already-held-by-caller locks are taken with a single
    /// conditional update. Otherwise fails with `SessionLocked`.
    pub async fn acquire_lock(&self, session_id: &str, caller: &str) -> ResearchResult<()> {
        let now = Utc::now();
        let attempt = self
            .storage
            .try_acquire_lock(session_id, caller, now, now - self.lease())
            .await
            .map_err(storage_error)?;

        match attempt {
            LockAttempt::Acquired => {
                debug!(session_id = %session_id, caller = %caller, "Session lock acquired");
                Ok(())
            }
            LockAttempt::Held {
                locked_by,
                locked_at,
            } => Err(ResearchError::SessionLocked {
                session_id: session_id.to_string(),
                locked_by,
                locked_at,
            }),
        }
    }

    /// How long a lock or a path dispatch lasts before it counts as abandoned.
    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock.stale_after())
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    /// Release the lock if `caller` holds it.
    pub async fn release_lock(&self, session_id: &str, caller: &str) -> ResearchResult<()> {
        self.storage
            .release_lock(session_id, caller)
            .await
            .map_err(storage_error)?;
        debug!(session_id = %session_id, caller = %caller, "Session lock released");
        Ok(())
    }

    /// Holder of a live lock on the session. Stale locks count as free.
    pub async fn lock_holder(&self, session_id: &str) -> ResearchResult<Option<String>> {
        let session = self.get_session(session_id).await?;
        let now = Utc::now();
        Ok(match (session.locked_by, session.locked_at) {
            (Some(holder), Some(at)) if now.signed_duration_since(at) < self.lease() => Some(holder),
            _ => None,
        })
    }

    /// Acquire the lock, retrying contention with the configured backoff.
    pub async fn acquire_lock_with_retry(&self, session_id: &str, caller: &str) -> ResearchResult<()> {
        let mut attempt = 1;
        loop {
            match self.acquire_lock(session_id, caller).await {
                Err(err) if err.is_retryable() && attempt < self.lock.max_retries => {
                    warn!(
                        session_id = %session_id,
                        caller = %caller,
                        attempt,
                        max_retries = self.lock.max_retries,
                        error = %err,
                        "Session locked, backing off"
                    );
                    tokio::time::sleep(self.lock.retry_delay()).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run `f` inside the session lock. The lock is released on every exit.
    pub async fn with_lock<T, F, Fut>(&self, session_id: &str, caller: &str, f: F) -> ResearchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResearchResult<T>>,
    {
        self.acquire_lock(session_id, caller).await?;
        self.run_locked(session_id, caller, f).await
    }

    /// [`with_lock`](Self::with_lock), retrying lock contention first.
    pub async fn with_lock_retry<T, F, Fut>(
        &self,
        session_id: &str,
        caller: &str,
        f: F,
    ) -> ResearchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResearchResult<T>>,
    {
        self.acquire_lock_with_retry(session_id, caller).await?;
        self.run_locked(session_id, caller, f).await
    }

    async fn run_locked<T, F, Fut>(&self, session_id: &str, caller: &str, f: F) -> ResearchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResearchResult<T>>,
    {
        let guard = LockGuard::new(self.storage.clone(), session_id, caller);
        let result = f().await;
        guard.disarm();
        match self.release_lock(session_id, caller).await {
            Ok(()) => result,
            Err(release_err) => {
                warn!(
                    session_id = %session_id,
                    caller = %caller,
                    error = %release_err,
                    "Failed to release session lock"
                );
                match result {
                    Ok(_) => Err(release_err),
                    Err(err) => Err(err),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Graph access
    // ------------------------------------------------------------------------

    /// Load the session's graph from its operation log.
    pub async fn load_graph(&self, session_id: &str) -> ResearchResult<GraphController> {
        let controller = GraphController::load(self.storage.clone(), session_id).await?;
        Ok(controller.with_tolerance(self.tolerance))
    }

    /// Fail with `SessionClosed` if the session reached a terminal status.
    pub async fn ensure_open(&self, session_id: &str) -> ResearchResult<ResearchSession> {
        let session = self.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(ResearchError::SessionClosed {
                session_id: session_id.to_string(),
                status: session.status.to_string(),
            });
        }
        Ok(session)
    }

    /// Recompute and persist the session confidence from its graph.
    ///
    /// Also raises the aggregated flag once an aggregated path exists.
    pub async fn refresh_confidence(&self, controller: &GraphController) -> ResearchResult<f64> {
        let session_id = controller.session_id();
        let aggregation = controller.latest_aggregation_confidence();
        let confidence = session_confidence(controller.paths(), self.rater(), aggregation);

        self.storage
            .update_confidence(session_id, confidence)
            .await
            .map_err(storage_error)?;
        if aggregation.is_some() {
            self.storage
                .set_aggregated(session_id, true)
                .await
                .map_err(storage_error)?;
        }
        debug!(session_id = %session_id, confidence, "Session confidence refreshed");
        Ok(confidence)
    }

    /// Raise `budget_exhausted` once recorded executions reach the budget.
    ///
    /// Returns whether the budget is exhausted.
    pub async fn check_budget(&self, controller: &GraphController) -> ResearchResult<bool> {
        let Some(budget) = self.research.execution_budget else {
            return Ok(false);
        };
        let executions = controller
            .history()
            .iter()
            .filter(|op| op.operation_type == OperationType::Complete)
            .count();
        if executions < budget as usize {
            return Ok(false);
        }
        self.set_budget_exhausted(controller.session_id(), true).await?;
        info!(
            session_id = %controller.session_id(),
            executions,
            budget,
            "Execution budget exhausted"
        );
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Next action
    // ------------------------------------------------------------------------

    /// Decide the session's next action.
    ///
    /// Inside the session lock: refuse closed sessions, advance the iteration,
    /// rebuild the graph, recompute confidence, decide, and audit the decision.
    pub async fn next_action(&self, session_id: &str, caller: &str) -> ResearchResult<Decision> {
        self.with_lock(session_id, caller, || self.decide(session_id, caller))
            .await
    }

    /// [`next_action`](Self::next_action), retrying lock contention first.
    pub async fn next_action_with_retry(&self, session_id: &str, caller: &str) -> ResearchResult<Decision> {
        self.with_lock_retry(session_id, caller, || self.decide(session_id, caller))
            .await
    }

    async fn decide(&self, session_id: &str, caller: &str) -> ResearchResult<Decision> {
        let start = Instant::now();
        let mut session = self.ensure_open(session_id).await?;
        let current_iteration = session.iteration;
        session.iteration += 1;

        let mut controller = self.load_graph(session_id).await?;
        let confidence = self.refresh_confidence(&controller).await?;
        session.confidence = confidence;
        session.is_aggregated |= controller.latest_aggregation_confidence().is_some();

        let now = Utc::now();
        let state = GraphState::build(&session, controller.paths(), confidence, now, self.lease());
        let next = ResearchStateMachine::for_session(&session).next_action(&state);

        // Waiting does not use up an iteration
        match &next.action {
            Action::Wait { .. } => session.iteration = current_iteration,
            action => {
                session.iteration = self
                    .storage
                    .increment_iteration(session_id)
                    .await
                    .map_err(storage_error)?;
                if let Action::Execute { path_ids } = action {
                    controller.dispatch(path_ids, now).await?;
                }
            }
        }

        let params = serde_json::to_value(&next.action)
            .ok()
            .and_then(|v| v.get("params").cloned())
            .unwrap_or(serde_json::Value::Null);
        let record = DecisionRecord::new(session_id, session.iteration, next.action.name(), &next.reasoning)
            .with_params(params)
            .with_caller(caller);
        self.storage.log_decision(&record).await.map_err(storage_error)?;

        info!(
            session_id = %session_id,
            caller = %caller,
            iteration = session.iteration,
            max_iterations = session.max_iterations,
            confidence,
            action = next.action.name(),
            reasoning = %next.reasoning,
            latency_ms = start.elapsed().as_millis() as u64,
            "Next action decided"
        );

        Ok(Decision {
            session_id: session_id.to_string(),
            iteration: session.iteration,
            max_iterations: session.max_iterations,
            confidence,
            path_count: controller.paths().len(),
            next,
        })
    }
}
