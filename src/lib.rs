//! # Research Graph
//!
//! A Model Context Protocol (MCP) server exposing a Graph-of-Thoughts research
//! core: diverse research paths are generated, refined, executed by an
//! external worker, scored, pruned and aggregated until the session is
//! confident enough to synthesize a report.
//!
//! ## Features
//!
//! - **Research graph**: Generate, Refine, Score + Prune and Aggregate over
//!   persisted research paths
//! - **State machine**: a pure next-action decision over a graph snapshot
//! - **Sessions**: durable sessions with a stale-aware cooperative lock
//! - **Conflict detection**: numerical, temporal, factual and contradictory
//!   disagreements between structured facts
//! - **Orchestrator**: a driver loop over a pluggable path executor
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → Session Manager → Graph Controller
//!                                        ↓                  ↓
//!                                  SQLite (sessions, lock, operation log)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use research_graph::{AppState, Config, McpServer};
//! use research_graph::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let state = Arc::new(AppState::new(config, storage));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

/// Configuration management for the server.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Graph-of-Thoughts research graph and its controller.
pub mod got;
/// Structured facts, collaborator seams and conflict detection.
pub mod logic;
/// Driver loop executing the state machine's decisions.
pub mod orchestrator;
/// MCP server implementation and request handling.
pub mod server;
/// Session lifecycle, locking and next-action decisions.
pub mod session;
/// Next-action decision logic and confidence scoring.
pub mod statemachine;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, ResearchError, ResearchResult};
pub use orchestrator::{Orchestrator, PathExecutor, PathOutcome};
pub use server::{AppState, McpServer, SharedState};
pub use session::SessionManager;
