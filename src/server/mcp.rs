//! MCP protocol implementation for JSON-RPC 2.0 communication.
//!
//! Line-delimited JSON-RPC over stdio, the research tool definitions and
//! the mapping of tool errors onto tool results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use super::{handle_tool_call, SharedState};
use crate::error::McpError;

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null when the request carried none).
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP server information returned during initialization.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// The server name identifier.
    pub name: String,
    /// The server version string.
    pub version: String,
}

/// MCP server capabilities advertised to clients.
#[derive(Debug, Serialize)]
pub struct Capabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change dynamically.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the MCP initialize handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    /// The MCP protocol version supported.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: Capabilities,
    /// Server identification information.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Unique tool name (used in tool calls).
    pub name: String,
    /// Human-readable description of the tool.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    /// The content type (e.g., "text").
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text content of the result.
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// The result content items.
    pub content: Vec<ToolResultContent>,
    /// Whether the result represents an error.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Server name reported during initialization.
pub const SERVER_NAME: &str = "research-graph";

/// MCP Server running over stdio.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the server using async stdio
    pub async fn run(&self) -> std::io::Result<()> {
        info!(server = SERVER_NAME, "MCP research server starting");

        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    Some(JsonRpcResponse::error(
                        None,
                        -32700,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            // Notifications get no response
            if let Some(response) = response {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                stdout.write_all(response_json.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        Ok(())
    }

    /// Handle a single JSON-RPC request.
    ///
    /// Returns `None` for notifications (requests without id).
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" | "notifications/initialized" => {
                debug!("Received initialized notification");
                None
            }
            "notifications/cancelled" => {
                debug!("Received cancelled notification");
                None
            }
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "tools/call" => Some(self.handle_tool_call(request.id, request.params).await),
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    Some(JsonRpcResponse::error(
                        request.id,
                        -32601,
                        format!("Method not found: {}", method),
                    ))
                }
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }

    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling tools/list request");
        JsonRpcResponse::success(id, serde_json::json!({ "tools": all_tools() }))
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(p) => p,
                Err(e) => {
                    return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e));
                }
            },
            None => {
                return JsonRpcResponse::error(id, -32602, "Missing params");
            }
        };

        info!(tool = %params.name, "Handling tool call");

        let tool_result = match handle_tool_call(&self.state, &params.name, params.arguments).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_else(|e| {
                    error!(error = %e, "Failed to serialize tool result");
                    format!("{{\"error\": \"Serialization failed: {}\"}}", e)
                });
                ToolCallResult::text(text, None)
            }
            Err(e) => error_result(&e),
        };

        match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize tool call result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }
}

impl ToolCallResult {
    fn text(text: String, is_error: Option<bool>) -> Self {
        Self {
            content: vec![ToolResultContent {
                content_type: "text".to_string(),
                text,
            }],
            is_error,
        }
    }
}

/// Tool error as a tool result.
///
/// Lock contention is reported as structured JSON so clients can back off.
fn error_result(err: &McpError) -> ToolCallResult {
    let text = match err {
        McpError::SessionLocked {
            session_id,
            locked_by,
            locked_at,
            retry_after_seconds,
        } => serde_json::json!({
            "error": "session_locked",
            "session_id": session_id,
            "locked_by": locked_by,
            "locked_at": locked_at,
            "retry_after_seconds": retry_after_seconds,
        })
        .to_string(),
        other => format!("Error: {}", other),
    };
    ToolCallResult::text(text, Some(true))
}

/// Every tool the server exposes, in listing order.
pub fn all_tools() -> Vec<Tool> {
    vec![
        get_create_session_tool(),
        get_get_session_tool(),
        get_update_status_tool(),
        get_next_action_tool(),
        get_generate_paths_tool(),
        get_refine_path_tool(),
        get_record_output_tool(),
        get_score_prune_tool(),
        get_aggregate_tool(),
        get_detect_conflicts_tool(),
        get_export_state_tool(),
        get_import_state_tool(),
        get_visualize_tool(),
        get_register_agent_tool(),
        get_get_agent_tool(),
        get_update_agent_status_tool(),
    ]
}

fn session_id_schema() -> Value {
    serde_json::json!({
        "type": "string",
        "description": "Research session ID"
    })
}

fn caller_id_schema() -> Value {
    serde_json::json!({
        "type": "string",
        "description": "Lock holder name (defaults to a generated id per call)"
    })
}

fn fact_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "entity": { "type": "string" },
            "attribute": { "type": "string" },
            "value": { "type": "string" },
            "value_type": {
                "type": "string",
                "enum": ["number", "date", "percentage", "currency", "text"]
            },
            "confidence": {
                "type": "string",
                "enum": ["High", "Medium", "Low"]
            },
            "source": {
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "title": { "type": "string" },
                    "author": { "type": "string" },
                    "date": { "type": "string" },
                    "quality": {
                        "type": "string",
                        "description": "Letter grade A (best) to E (worst)"
                    }
                }
            }
        },
        "required": ["entity", "attribute", "value"]
    })
}

fn agent_id_schema() -> Value {
    serde_json::json!({
        "type": "string",
        "description": "Worker agent ID"
    })
}

fn get_create_session_tool() -> Tool {
    Tool {
        name: "research_create_session".to_string(),
        description: "Start a research session on a topic. Quick sessions stop after 3 iterations or 0.7 confidence; deep and custom sessions use the configured limits.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "Research topic or question"
                },
                "research_type": {
                    "type": "string",
                    "enum": ["deep", "quick", "custom"],
                    "description": "Depth preset (default: deep)"
                },
                "max_iterations": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Override the iteration cap"
                },
                "confidence_threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1,
                    "description": "Override the confidence at which research terminates"
                }
            },
            "required": ["topic"],
            "additionalProperties": false
        }),
    }
}

fn get_get_session_tool() -> Tool {
    Tool {
        name: "research_get_session".to_string(),
        description: "Get a research session with its graph statistics and most recent decisions.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema()
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_update_status_tool() -> Tool {
    Tool {
        name: "research_update_status".to_string(),
        description: "Move a session to a new lifecycle status. Completed and failed sessions are closed.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "status": {
                    "type": "string",
                    "enum": ["initializing", "planning", "executing", "synthesizing", "validating", "completed", "failed"]
                },
                "reason": {
                    "type": "string",
                    "description": "Failure reason, kept with failed sessions"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id", "status"],
            "additionalProperties": false
        }),
    }
}

fn get_next_action_tool() -> Tool {
    Tool {
        name: "research_next_action".to_string(),
        description: "Advance the session by one iteration and decide the next research action from the current graph: generate, execute, wait (other workers hold the pending paths), score, aggregate or synthesize. Waiting does not use up an iteration.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "caller_id": caller_id_schema()
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_generate_paths_tool() -> Tool {
    Tool {
        name: "research_generate_paths".to_string(),
        description: "Generate k diverse research paths from the domain templates.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "query": {
                    "type": "string",
                    "description": "Query to investigate (defaults to the session topic)"
                },
                "k": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 20,
                    "description": "Number of paths to generate (default: 3)"
                },
                "strategy": {
                    "type": "string",
                    "enum": ["diverse", "focused", "exploratory", "orthogonal"],
                    "description": "Template selection strategy (default: diverse)"
                },
                "max_depth": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Refinement depth limit for the new paths"
                },
                "context": {
                    "type": "string",
                    "description": "Findings to carry into the new paths"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_refine_path_tool() -> Tool {
    Tool {
        name: "research_refine_path".to_string(),
        description: "Deepen a research path with a new analysis step, optionally steered by feedback.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "path_id": {
                    "type": "string",
                    "description": "Path to refine"
                },
                "feedback": {
                    "type": "string",
                    "description": "Aspect to focus the refinement on"
                },
                "depth": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Levels to deepen by (default: 1)"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id", "path_id"],
            "additionalProperties": false
        }),
    }
}

fn get_record_output_tool() -> Tool {
    Tool {
        name: "research_record_output".to_string(),
        description: "Attach the findings of an executed path. The path becomes completed and awaits scoring.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "path_id": {
                    "type": "string",
                    "description": "Executed path"
                },
                "output": {
                    "type": "string",
                    "description": "Findings text"
                },
                "facts": {
                    "type": "array",
                    "items": fact_schema(),
                    "description": "Structured facts extracted from the findings"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id", "path_id", "output"],
            "additionalProperties": false
        }),
    }
}

fn get_score_prune_tool() -> Tool {
    Tool {
        name: "research_score_prune".to_string(),
        description: "Score paths on completeness, citation quality and relevance, keep the best N and prune the rest permanently.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "path_ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Paths to score (default: all live research paths)"
                },
                "keep_top_n": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Number of paths to keep (default: 2)"
                },
                "threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 10,
                    "description": "Quality threshold reported for kept paths (default: 6.0)"
                },
                "criteria": {
                    "type": "object",
                    "properties": {
                        "completeness": { "type": "number", "minimum": 0 },
                        "citation_quality": { "type": "number", "minimum": 0 },
                        "relevance": { "type": "number", "minimum": 0 }
                    },
                    "description": "Scoring weights (default: 0.4/0.3/0.3)"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_aggregate_tool() -> Tool {
    Tool {
        name: "research_aggregate".to_string(),
        description: "Merge two or more paths into a new aggregated path, detecting conflicts between their facts.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "path_ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 2,
                    "description": "Paths to merge"
                },
                "strategy": {
                    "type": "string",
                    "enum": ["synthesis", "voting", "consensus", "thematic", "chronological"],
                    "description": "Merge strategy (default: synthesis)"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id", "path_ids"],
            "additionalProperties": false
        }),
    }
}

fn get_detect_conflicts_tool() -> Tool {
    Tool {
        name: "research_detect_conflicts".to_string(),
        description: "Find numerical, temporal, factual and contradictory conflicts between facts, either given directly or taken from a session's live paths.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "facts": {
                    "type": "array",
                    "items": fact_schema(),
                    "description": "Facts to compare"
                },
                "session_id": {
                    "type": "string",
                    "description": "Compare the facts of this session's live paths instead"
                },
                "tolerance": {
                    "type": "object",
                    "properties": {
                        "numeric_tolerance": { "type": "number", "minimum": 0 },
                        "date_tolerance_days": { "type": "integer", "minimum": 0 },
                        "ignore_low_confidence": { "type": "boolean" }
                    },
                    "description": "Comparison tolerances (default: 10%, 30 days, ignore low confidence)"
                }
            },
            "additionalProperties": false
        }),
    }
}

fn get_export_state_tool() -> Tool {
    Tool {
        name: "research_export_state".to_string(),
        description: "Export a session's full graph state and operation history.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema()
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_import_state_tool() -> Tool {
    Tool {
        name: "research_import_state".to_string(),
        description: "Replace a session's graph with an exported one.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "export": {
                    "type": "object",
                    "description": "Output of research_export_state"
                },
                "caller_id": caller_id_schema()
            },
            "required": ["session_id", "export"],
            "additionalProperties": false
        }),
    }
}

fn get_visualize_tool() -> Tool {
    Tool {
        name: "research_visualize".to_string(),
        description: "Render a session's graph as node/edge JSON or Graphviz DOT.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "format": {
                    "type": "string",
                    "enum": ["json", "dot"],
                    "description": "Output format (default: json)"
                }
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_register_agent_tool() -> Tool {
    Tool {
        name: "research_register_agent".to_string(),
        description: "Register a worker agent on an open session. The agent starts in deploying status.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "agent_id": agent_id_schema(),
                "agent_type": {
                    "type": "string",
                    "description": "Kind of worker, e.g. web-researcher"
                },
                "agent_role": { "type": "string" },
                "focus_description": {
                    "type": "string",
                    "description": "What the agent investigates"
                },
                "search_queries": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["session_id", "agent_id", "agent_type"],
            "additionalProperties": false
        }),
    }
}

fn get_get_agent_tool() -> Tool {
    Tool {
        name: "research_get_agent".to_string(),
        description: "Get a registered worker agent with its status, output file and token usage.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "agent_id": agent_id_schema()
            },
            "required": ["agent_id"],
            "additionalProperties": false
        }),
    }
}

fn get_update_agent_status_tool() -> Tool {
    Tool {
        name: "research_update_agent_status".to_string(),
        description: "Report a worker agent's progress: deploying, running, completed or failed. Completed and failed agents accept no further updates; failures need an error message.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "agent_id": agent_id_schema(),
                "status": {
                    "type": "string",
                    "enum": ["deploying", "running", "completed", "failed"]
                },
                "output_file": {
                    "type": "string",
                    "description": "Where the agent wrote its findings"
                },
                "error_message": { "type": "string" },
                "token_usage": {
                    "type": "integer",
                    "minimum": 0
                }
            },
            "required": ["agent_id", "status"],
            "additionalProperties": false
        }),
    }
}
