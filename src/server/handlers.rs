use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::SharedState;
use crate::error::{McpError, McpResult, ResearchError, ResearchResult};
use crate::got::aggregation::collect_conflicts;
use crate::got::{
    AggregationStrategy, GenerateOptions, GenerationStrategy, GraphController, GraphExport,
    GraphStatistics, ResearchPath, ScoringCriteria,
};
use crate::logic::{detect_conflicts, Conflict, ConflictTolerance, Fact};
use crate::session::{storage_error, SessionOptions};
use crate::statemachine::{KEEP_TOP_N, SCORE_THRESHOLD};
use crate::storage::{
    AgentStatus, AgentUpdate, DecisionRecord, ResearchAgent, ResearchSession, ResearchType,
    SessionStatus,
};

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");
    let start = Instant::now();

    let result = match tool_name {
        // Session lifecycle
        "research_create_session" => handle_create_session(state, arguments).await,
        "research_get_session" => handle_get_session(state, arguments).await,
        "research_update_status" => handle_update_status(state, arguments).await,
        "research_next_action" => handle_next_action(state, arguments).await,
        // Graph operations
        "research_generate_paths" => handle_generate_paths(state, arguments).await,
        "research_refine_path" => handle_refine_path(state, arguments).await,
        "research_record_output" => handle_record_output(state, arguments).await,
        "research_score_prune" => handle_score_prune(state, arguments).await,
        "research_aggregate" => handle_aggregate(state, arguments).await,
        "research_detect_conflicts" => handle_detect_conflicts(state, arguments).await,
        // State transfer and inspection
        "research_export_state" => handle_export_state(state, arguments).await,
        "research_import_state" => handle_import_state(state, arguments).await,
        "research_visualize" => handle_visualize(state, arguments).await,
        // Worker agents
        "research_register_agent" => handle_register_agent(state, arguments).await,
        "research_get_agent" => handle_get_agent(state, arguments).await,
        "research_update_agent_status" => handle_update_agent_status(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    };

    debug!(
        tool = %tool_name,
        success = result.is_ok(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Tool call finished"
    );
    result
}

// ============================================================================
// Parameters and responses
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSessionParams {
    topic: String,
    #[serde(default)]
    research_type: ResearchType,
    max_iterations: Option<u32>,
    confidence_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct SessionView {
    #[serde(flatten)]
    session: ResearchSession,
    /// Whether a worker holds a live (not stale) lock.
    is_locked: bool,
    statistics: GraphStatistics,
    recent_decisions: Vec<DecisionRecord>,
    agents: Vec<ResearchAgent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateStatusParams {
    session_id: String,
    status: SessionStatus,
    reason: Option<String>,
    caller_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NextActionParams {
    session_id: String,
    caller_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratePathsParams {
    session_id: String,
    /// Defaults to the session topic.
    query: Option<String>,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default)]
    strategy: GenerationStrategy,
    max_depth: Option<u32>,
    context: Option<String>,
    caller_id: Option<String>,
}

fn default_k() -> usize {
    3
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RefinePathParams {
    session_id: String,
    path_id: String,
    feedback: Option<String>,
    #[serde(default = "default_depth")]
    depth: u32,
    caller_id: Option<String>,
}

fn default_depth() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordOutputParams {
    session_id: String,
    path_id: String,
    output: String,
    #[serde(default)]
    facts: Vec<Fact>,
    caller_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScorePruneParams {
    session_id: String,
    #[serde(default)]
    path_ids: Vec<String>,
    #[serde(default = "default_keep_top_n")]
    keep_top_n: usize,
    #[serde(default = "default_threshold")]
    threshold: f64,
    criteria: Option<ScoringCriteria>,
    caller_id: Option<String>,
}

fn default_keep_top_n() -> usize {
    KEEP_TOP_N
}

fn default_threshold() -> f64 {
    SCORE_THRESHOLD
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregateParams {
    session_id: String,
    path_ids: Vec<String>,
    #[serde(default)]
    strategy: AggregationStrategy,
    caller_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectConflictsParams {
    /// Compare these facts directly.
    #[serde(default)]
    facts: Vec<Fact>,
    /// Or compare the facts and claims of this session's live paths.
    session_id: Option<String>,
    #[serde(default)]
    tolerance: ConflictTolerance,
}

#[derive(Debug, Serialize)]
struct ConflictReport {
    conflicts: Vec<Conflict>,
    count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImportStateParams {
    session_id: String,
    export: GraphExport,
    caller_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VisualizeParams {
    session_id: String,
    #[serde(default)]
    format: VisualFormat,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum VisualFormat {
    #[default]
    Json,
    Dot,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterAgentParams {
    session_id: String,
    agent_id: String,
    agent_type: String,
    agent_role: Option<String>,
    focus_description: Option<String>,
    #[serde(default)]
    search_queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentParams {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateAgentStatusParams {
    agent_id: String,
    status: AgentStatus,
    output_file: Option<String>,
    error_message: Option<String>,
    token_usage: Option<u64>,
}

/// A graph mutation result together with the refreshed session confidence.
#[derive(Debug, Serialize)]
struct Mutation<T: Serialize> {
    #[serde(flatten)]
    result: T,
    session_confidence: f64,
    statistics: GraphStatistics,
}

#[derive(Debug, Serialize)]
struct PathsResult {
    paths: Vec<ResearchPath>,
}

#[derive(Debug, Serialize)]
struct PathResult {
    path: ResearchPath,
}

#[derive(Debug, Serialize)]
struct ImportResult {
    imported: usize,
}

// ============================================================================
// Session lifecycle
// ============================================================================

async fn handle_create_session(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_create_session",
        arguments,
        |params: CreateSessionParams| async move {
            let options = SessionOptions {
                max_iterations: params.max_iterations,
                confidence_threshold: params.confidence_threshold,
            };
            state
                .sessions
                .create_session_with(&params.topic, params.research_type, options)
                .await
        },
    )
    .await
}

async fn handle_get_session(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_get_session",
        arguments,
        |params: SessionParams| async move {
            let session = state.sessions.get_session(&params.session_id).await?;
            let graph = state.sessions.load_graph(&params.session_id).await?;
            let mut decisions = state
                .storage
                .get_decisions(&params.session_id)
                .await
                .map_err(storage_error)?;
            let keep_from = decisions.len().saturating_sub(5);
            let recent_decisions = decisions.split_off(keep_from);
            let is_locked = state.sessions.lock_holder(&params.session_id).await?.is_some();
            let agents = state.sessions.list_agents(&params.session_id).await?;
            Ok(SessionView {
                session,
                is_locked,
                statistics: graph.statistics(),
                recent_decisions,
                agents,
            })
        },
    )
    .await
}

async fn handle_update_status(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_update_status",
        arguments,
        |params: UpdateStatusParams| async move {
            let caller = caller_id(params.caller_id.as_deref());
            state
                .sessions
                .with_lock(&params.session_id, &caller, || {
                    state.sessions.update_status(
                        &params.session_id,
                        params.status,
                        params.reason.as_deref(),
                    )
                })
                .await
        },
    )
    .await
}

async fn handle_next_action(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_next_action",
        arguments,
        |params: NextActionParams| async move {
            let caller = caller_id(params.caller_id.as_deref());
            state.sessions.next_action(&params.session_id, &caller).await
        },
    )
    .await
}

// ============================================================================
// Graph operations
// ============================================================================

type GraphFuture<'g, T> = Pin<Box<dyn Future<Output = ResearchResult<T>> + 'g>>;

/// Run a graph mutation inside the session lock and refresh confidence.
async fn mutate_graph<T, F>(
    state: &SharedState,
    session_id: &str,
    caller_id_param: Option<&str>,
    operation: F,
) -> ResearchResult<Mutation<T>>
where
    T: Serialize,
    F: for<'g> FnOnce(&'g mut GraphController) -> GraphFuture<'g, T>,
{
    let caller = caller_id(caller_id_param);
    state
        .sessions
        .with_lock(session_id, &caller, move || async move {
            let mut graph = state.sessions.load_graph(session_id).await?;
            let result = operation(&mut graph).await?;
            let session_confidence = state.sessions.refresh_confidence(&graph).await?;
            state.sessions.check_budget(&graph).await?;
            Ok(Mutation {
                result,
                session_confidence,
                statistics: graph.statistics(),
            })
        })
        .await
}

async fn handle_generate_paths(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_generate_paths",
        arguments,
        |params: GeneratePathsParams| async move {
            let query = match params.query {
                Some(query) => query,
                None => state.sessions.get_session(&params.session_id).await?.topic,
            };
            let max_depth = params
                .max_depth
                .unwrap_or(state.config.research.default_max_depth);
            let mut options = GenerateOptions::new(params.k, params.strategy).with_max_depth(max_depth);
            if let Some(context) = params.context {
                options = options.with_context(context);
            }

            mutate_graph(state, &params.session_id, params.caller_id.as_deref(), |graph| {
                Box::pin(async move {
                    let paths = graph.generate(&query, options).await?;
                    Ok(PathsResult { paths })
                })
            })
            .await
        },
    )
    .await
}

async fn handle_refine_path(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_refine_path",
        arguments,
        |params: RefinePathParams| async move {
            let RefinePathParams {
                session_id,
                path_id,
                feedback,
                depth,
                caller_id,
            } = params;
            mutate_graph(state, &session_id, caller_id.as_deref(), |graph| {
                Box::pin(async move {
                    let path = graph.refine(&path_id, feedback.as_deref(), depth).await?;
                    Ok(PathResult { path })
                })
            })
            .await
        },
    )
    .await
}

async fn handle_record_output(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_record_output",
        arguments,
        |params: RecordOutputParams| async move {
            let RecordOutputParams {
                session_id,
                path_id,
                output,
                facts,
                caller_id,
            } = params;
            mutate_graph(state, &session_id, caller_id.as_deref(), |graph| {
                Box::pin(async move {
                    let path = graph.record_output(&path_id, &output, facts).await?;
                    Ok(PathResult { path })
                })
            })
            .await
        },
    )
    .await
}

async fn handle_score_prune(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_score_prune",
        arguments,
        |params: ScorePruneParams| async move {
            let ScorePruneParams {
                session_id,
                path_ids,
                keep_top_n,
                threshold,
                criteria,
                caller_id,
            } = params;
            mutate_graph(state, &session_id, caller_id.as_deref(), |graph| {
                Box::pin(async move {
                    graph
                        .score_and_prune(&path_ids, keep_top_n, criteria, threshold)
                        .await
                })
            })
            .await
        },
    )
    .await
}

async fn handle_aggregate(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_aggregate",
        arguments,
        |params: AggregateParams| async move {
            let AggregateParams {
                session_id,
                path_ids,
                strategy,
                caller_id,
            } = params;
            mutate_graph(state, &session_id, caller_id.as_deref(), |graph| {
                Box::pin(async move { graph.aggregate(&path_ids, strategy).await })
            })
            .await
        },
    )
    .await
}

async fn handle_detect_conflicts(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_detect_conflicts",
        arguments,
        |params: DetectConflictsParams| async move {
            let conflicts = match params.session_id {
                Some(session_id) if params.facts.is_empty() => {
                    let graph = state.sessions.load_graph(&session_id).await?;
                    let live: Vec<&ResearchPath> = graph
                        .paths()
                        .iter()
                        .filter(|p| !p.is_pruned() && !p.is_aggregated())
                        .collect();
                    collect_conflicts(&live, &params.tolerance)
                }
                _ if params.facts.is_empty() => {
                    return Err(ResearchError::validation(
                        "facts",
                        "Provide facts or a session_id",
                    ))
                }
                _ => detect_conflicts(&params.facts, &params.tolerance),
            };
            Ok(ConflictReport {
                count: conflicts.len(),
                conflicts,
            })
        },
    )
    .await
}

// ============================================================================
// State transfer and inspection
// ============================================================================

async fn handle_export_state(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_export_state",
        arguments,
        |params: SessionParams| async move {
            state.sessions.get_session(&params.session_id).await?;
            let graph = state.sessions.load_graph(&params.session_id).await?;
            Ok(graph.export_state())
        },
    )
    .await
}

async fn handle_import_state(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_import_state",
        arguments,
        |params: ImportStateParams| async move {
            let ImportStateParams {
                session_id,
                export,
                caller_id,
            } = params;
            mutate_graph(state, &session_id, caller_id.as_deref(), |graph| {
                Box::pin(async move {
                    let imported = graph.import_state(export).await?;
                    Ok(ImportResult { imported })
                })
            })
            .await
        },
    )
    .await
}

async fn handle_visualize(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: VisualizeParams = parse_arguments("research_visualize", arguments)?;
    let session = state
        .sessions
        .get_session(&params.session_id)
        .await
        .map_err(|e| research_error(state, e))?;
    let graph = state
        .sessions
        .load_graph(&params.session_id)
        .await
        .map_err(|e| research_error(state, e))?;

    match params.format {
        VisualFormat::Json => {
            serde_json::to_value(graph.visualize_json(&session.topic)).map_err(McpError::Json)
        }
        VisualFormat::Dot => Ok(serde_json::json!({
            "format": "dot",
            "graph": graph.visualize_dot(&session.topic),
        })),
    }
}

// ============================================================================
// Worker agents
// ============================================================================

async fn handle_register_agent(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_register_agent",
        arguments,
        |params: RegisterAgentParams| async move {
            let mut agent = ResearchAgent::new(params.session_id, params.agent_id, params.agent_type)
                .with_queries(params.search_queries);
            if let Some(role) = params.agent_role {
                agent = agent.with_role(role);
            }
            if let Some(focus) = params.focus_description {
                agent = agent.with_focus(focus);
            }
            state.sessions.register_agent(agent).await
        },
    )
    .await
}

async fn handle_get_agent(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        state,
        "research_get_agent",
        arguments,
        |params: AgentParams| async move { state.sessions.get_agent(&params.agent_id).await },
    )
    .await
}

async fn handle_update_agent_status(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    execute_handler(
        state,
        "research_update_agent_status",
        arguments,
        |params: UpdateAgentStatusParams| async move {
            let update = AgentUpdate {
                status: params.status,
                output_file: params.output_file,
                error_message: params.error_message,
                token_usage: params.token_usage,
            };
            state
                .sessions
                .update_agent_status(&params.agent_id, update)
                .await
        },
    )
    .await
}

// ============================================================================
// Helper functions
// ============================================================================

/// Lock holder name for a tool call.
fn caller_id(requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caller) => caller.to_string(),
        None => format!("mcp-{}", Uuid::new_v4()),
    }
}

/// Convert a research error, attaching the retry hint to lock contention.
pub(crate) fn research_error(state: &SharedState, err: ResearchError) -> McpError {
    match err {
        ResearchError::SessionLocked {
            session_id,
            locked_by,
            locked_at,
        } => McpError::SessionLocked {
            session_id,
            locked_by,
            locked_at,
            retry_after_seconds: state.retry_after_seconds(),
        },
        other => McpError::ExecutionFailed {
            message: other.to_string(),
        },
    }
}

/// Helper to parse arguments with consistent error handling
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Parse typed arguments, run a research operation and serialize its result.
async fn execute_handler<P, R, F, Fut>(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = ResearchResult<R>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params)
        .await
        .map_err(|e| research_error(state, e))?;

    serde_json::to_value(result).map_err(McpError::Json)
}
