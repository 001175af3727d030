//! Storage layer for research session persistence.
//!
//! This module provides SQLite-based storage for sessions, graph nodes, the
//! append-only graph operation log, the decision audit log, and the registry
//! of worker agents. Each session row also carries the lock columns used for
//! cross-worker mutual exclusion.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// Lifecycle status of a research session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Initializing,
    Planning,
    Executing,
    Synthesizing,
    Validating,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Terminal sessions accept no further mutations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Initializing => write!(f, "initializing"),
            SessionStatus::Planning => write!(f, "planning"),
            SessionStatus::Executing => write!(f, "executing"),
            SessionStatus::Synthesizing => write!(f, "synthesizing"),
            SessionStatus::Validating => write!(f, "validating"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initializing" => Ok(SessionStatus::Initializing),
            "planning" => Ok(SessionStatus::Planning),
            "executing" => Ok(SessionStatus::Executing),
            "synthesizing" => Ok(SessionStatus::Synthesizing),
            "validating" => Ok(SessionStatus::Validating),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Research depth preset chosen when a session is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchType {
    /// Up to 10 iterations, 0.9 confidence threshold.
    #[default]
    Deep,
    /// Up to 3 iterations, 0.7 confidence threshold.
    Quick,
    /// Uses the configured defaults.
    Custom,
}

impl std::fmt::Display for ResearchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchType::Deep => write!(f, "deep"),
            ResearchType::Quick => write!(f, "quick"),
            ResearchType::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for ResearchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deep" => Ok(ResearchType::Deep),
            "quick" => Ok(ResearchType::Quick),
            "custom" => Ok(ResearchType::Custom),
            _ => Err(format!("Unknown research type: {}", s)),
        }
    }
}

/// Durable container for one research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    /// Unique session identifier.
    pub id: String,
    /// Research topic or question.
    pub topic: String,
    /// Depth preset.
    pub research_type: ResearchType,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Number of next-action decisions taken so far. Monotone.
    pub iteration: u32,
    /// Current confidence estimate (0.0-1.0).
    pub confidence: f64,
    /// Whether an aggregation has been performed.
    pub is_aggregated: bool,
    /// Whether the execution budget ran out.
    pub budget_exhausted: bool,
    /// Iteration cap.
    pub max_iterations: u32,
    /// Confidence at which research terminates.
    pub confidence_threshold: f64,
    /// Why the session failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Current lock holder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// When the current lock was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchSession {
    /// Create a new session in `initializing` status.
    pub fn new(topic: impl Into<String>, research_type: ResearchType) -> Self {
        let now = Utc::now();
        let (max_iterations, confidence_threshold) = match research_type {
            ResearchType::Quick => (3, 0.7),
            ResearchType::Deep | ResearchType::Custom => (10, 0.9),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            research_type,
            status: SessionStatus::Initializing,
            iteration: 0,
            confidence: 0.0,
            is_aggregated: false,
            budget_exhausted: false,
            max_iterations,
            confidence_threshold,
            failure_reason: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Override the iteration cap
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Override the confidence threshold
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

/// Persisted form of a research path.
///
/// `content` holds the full serialized path; the other columns are
/// denormalized for querying and visualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub node_type: String,
    pub content: String,
    pub summary: String,
    pub quality_score: f64,
    pub status: String,
    pub depth: i64,
    pub created_at: DateTime<Utc>,
}

/// Kind of graph mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Generate,
    Refine,
    Score,
    Prune,
    Aggregate,
    /// Output recorded for a path.
    Complete,
    Delete,
    Import,
    /// Paths handed to (or taken back from) a worker.
    Dispatch,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::Generate => "Generate",
            OperationType::Refine => "Refine",
            OperationType::Score => "Score",
            OperationType::Prune => "Prune",
            OperationType::Aggregate => "Aggregate",
            OperationType::Complete => "Complete",
            OperationType::Delete => "Delete",
            OperationType::Import => "Import",
            OperationType::Dispatch => "Dispatch",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generate" => Ok(OperationType::Generate),
            "refine" => Ok(OperationType::Refine),
            "score" => Ok(OperationType::Score),
            "prune" => Ok(OperationType::Prune),
            "aggregate" => Ok(OperationType::Aggregate),
            "complete" => Ok(OperationType::Complete),
            "delete" => Ok(OperationType::Delete),
            "import" => Ok(OperationType::Import),
            "dispatch" => Ok(OperationType::Dispatch),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

/// Immutable audit entry for one graph mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphOperation {
    pub operation_id: String,
    pub session_id: String,
    pub operation_type: OperationType,
    pub input_nodes: Vec<String>,
    pub output_nodes: Vec<String>,
    /// Post-operation snapshots of the output paths, replayed on load.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl GraphOperation {
    /// Create a new operation log entry
    pub fn new(session_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            operation_type,
            input_nodes: Vec::new(),
            output_nodes: Vec::new(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Set input node ids
    pub fn with_inputs(mut self, ids: Vec<String>) -> Self {
        self.input_nodes = ids;
        self
    }

    /// Set output node ids
    pub fn with_outputs(mut self, ids: Vec<String>) -> Self {
        self.output_nodes = ids;
        self
    }

    /// Set the replay payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Audit record of one next-action decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub session_id: String,
    pub iteration: u32,
    pub action: String,
    pub params: serde_json::Value,
    pub reasoning: String,
    pub caller_id: String,
    pub created_at: DateTime<Utc>,
}

impl DecisionRecord {
    /// Create a new decision record
    pub fn new(
        session_id: impl Into<String>,
        iteration: u32,
        action: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            iteration,
            action: action.into(),
            params: serde_json::Value::Null,
            reasoning: reasoning.into(),
            caller_id: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the action parameters
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Set the deciding caller
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }
}

/// Lifecycle status of a worker agent registered on a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Deploying,
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    /// Finished agents accept no further status changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed)
    }

    /// Whether an agent in this status may move to `next`.
    ///
    /// Deploying agents may start running or finish directly; running agents
    /// may only finish. Repeating the current non-terminal status is allowed.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (AgentStatus::Running, AgentStatus::Deploying) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Deploying => write!(f, "deploying"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Completed => write!(f, "completed"),
            AgentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deploying" => Ok(AgentStatus::Deploying),
            "running" => Ok(AgentStatus::Running),
            "completed" => Ok(AgentStatus::Completed),
            "failed" => Ok(AgentStatus::Failed),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

/// A worker registered against a session, tracked from deployment to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchAgent {
    pub agent_id: String,
    pub session_id: String,
    /// Free-form worker kind, e.g. `web-researcher`.
    pub agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_description: Option<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    pub status: AgentStatus,
    /// Where the agent wrote its findings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    pub token_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the agent reaches a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchAgent {
    /// Create an agent in `deploying` status
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            agent_type: agent_type.into(),
            agent_role: None,
            focus_description: None,
            search_queries: Vec::new(),
            status: AgentStatus::Deploying,
            output_file: None,
            token_usage: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Set the agent role
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    /// Set the focus description
    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus_description = Some(focus.into());
        self
    }

    /// Set the search queries
    pub fn with_queries(mut self, queries: Vec<String>) -> Self {
        self.search_queries = queries;
        self
    }
}

/// Status change reported by an agent. Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub status: AgentStatus,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub token_usage: Option<u64>,
}

impl AgentUpdate {
    pub fn new(status: AgentStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_output_file(mut self, output_file: impl Into<String>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_token_usage(mut self, tokens: u64) -> Self {
        self.token_usage = Some(tokens);
        self
    }
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Held {
        locked_by: String,
        locked_at: String,
    },
}

/// Format a timestamp so that lexical order matches chronological order.
pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Storage trait for database operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Create a new session.
    async fn create_session(&self, session: &ResearchSession) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<ResearchSession>>;
    /// List all sessions, newest first.
    async fn list_sessions(&self) -> StorageResult<Vec<ResearchSession>>;
    /// Set the session status, stamping `completed_at` for terminal statuses.
    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        reason: Option<String>,
    ) -> StorageResult<()>;
    /// Atomically increment the iteration counter, returning the new value.
    async fn increment_iteration(&self, id: &str) -> StorageResult<u32>;
    /// Store a recomputed confidence value.
    async fn update_confidence(&self, id: &str, confidence: f64) -> StorageResult<()>;
    /// Set the aggregated flag.
    async fn set_aggregated(&self, id: &str, aggregated: bool) -> StorageResult<()>;
    /// Set the budget exhausted flag.
    async fn set_budget_exhausted(&self, id: &str, exhausted: bool) -> StorageResult<()>;
    /// Delete a session with its nodes, operations, decisions and agents.
    async fn delete_session(&self, id: &str) -> StorageResult<()>;

    // Lock operations

    /// Take the session lock unless someone else holds a lock newer than `stale_before`.
    async fn try_acquire_lock(
        &self,
        session_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StorageResult<LockAttempt>;
    /// Release the lock if `holder` owns it. No-op otherwise.
    async fn release_lock(&self, session_id: &str, holder: &str) -> StorageResult<()>;

    // Agent operations

    /// Insert an agent. Returns `false` when the agent id is already taken.
    async fn register_agent(&self, agent: &ResearchAgent) -> StorageResult<bool>;
    /// Get an agent by ID.
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<ResearchAgent>>;
    /// List the agents of a session in registration order.
    async fn list_agents(&self, session_id: &str) -> StorageResult<Vec<ResearchAgent>>;
    /// Apply a status update, stamping `completed_at` for terminal statuses.
    async fn update_agent_status(&self, agent_id: &str, update: &AgentUpdate) -> StorageResult<()>;

    // Graph operations

    /// Atomically upsert and delete nodes and append operation log rows.
    async fn commit_operations(
        &self,
        session_id: &str,
        operations: &[GraphOperation],
        upserts: &[NodeRecord],
        deletes: &[String],
    ) -> StorageResult<()>;
    /// Get all nodes of a session in creation order.
    async fn get_nodes(&self, session_id: &str) -> StorageResult<Vec<NodeRecord>>;
    /// Get the operation log of a session in commit order.
    async fn get_operations(&self, session_id: &str) -> StorageResult<Vec<GraphOperation>>;

    // Audit operations

    /// Append a decision to the activity log.
    async fn log_decision(&self, record: &DecisionRecord) -> StorageResult<()>;
    /// Get the decisions of a session in order.
    async fn get_decisions(&self, session_id: &str) -> StorageResult<Vec<DecisionRecord>>;
}
