//! MCP server exposing the research core over stdio.
//!
//! - JSON-RPC 2.0 framing and tool definitions in [`mcp`]
//! - Tool routing and handlers in [`handlers`]
//! - Shared state: configuration, storage and the session manager

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::config::Config;
use crate::session::SessionManager;
use crate::storage::Storage;

/// State shared by all tool handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        let sessions = SessionManager::new(storage.clone(), &config);
        tracing::info!(
            max_iterations = config.research.max_iterations,
            confidence_threshold = config.research.confidence_threshold,
            stale_after_secs = config.lock.stale_after_secs,
            "Research server state initialized"
        );
        Self {
            config,
            storage,
            sessions,
        }
    }

    /// Seconds a client should wait before retrying a locked session.
    pub fn retry_after_seconds(&self) -> u64 {
        self.config.lock.retry_delay().as_secs().max(1)
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
