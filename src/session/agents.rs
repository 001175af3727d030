//! Registry of the worker agents deployed against a session.

use tracing::{info, warn};

use super::{storage_error, SessionManager};
use crate::error::{ResearchError, ResearchResult};
use crate::storage::{AgentStatus, AgentUpdate, ResearchAgent};

impl SessionManager {
    /// Register a worker on an open session. The agent starts out `deploying`.
    pub async fn register_agent(&self, agent: ResearchAgent) -> ResearchResult<ResearchAgent> {
        if agent.agent_id.trim().is_empty() {
            return Err(ResearchError::validation("agent_id", "Agent id cannot be empty"));
        }
        if agent.agent_type.trim().is_empty() {
            return Err(ResearchError::validation("agent_type", "Agent type cannot be empty"));
        }
        self.ensure_open(&agent.session_id).await?;

        let agent = ResearchAgent {
            status: AgentStatus::Deploying,
            ..agent
        };
        let inserted = self
            .storage
            .register_agent(&agent)
            .await
            .map_err(storage_error)?;
        if !inserted {
            return Err(ResearchError::validation(
                "agent_id",
                format!("agent {} is already registered", agent.agent_id),
            ));
        }

        info!(
            session_id = %agent.session_id,
            agent_id = %agent.agent_id,
            agent_type = %agent.agent_type,
            "Agent registered"
        );
        self.get_agent(&agent.agent_id).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> ResearchResult<ResearchAgent> {
        self.storage
            .get_agent(agent_id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ResearchError::NotFound {
                kind: "Agent",
                id: agent_id.to_string(),
            })
    }

    pub async fn list_agents(&self, session_id: &str) -> ResearchResult<Vec<ResearchAgent>> {
        self.storage.list_agents(session_id).await.map_err(storage_error)
    }

    /// Move an agent along its lifecycle.
    ///
    /// Finished agents stay finished and running agents cannot go back to
    /// deploying. A failed update must carry an error message.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        update: AgentUpdate,
    ) -> ResearchResult<ResearchAgent> {
        let agent = self.get_agent(agent_id).await?;
        if !agent.status.can_transition_to(update.status) {
            return Err(ResearchError::validation(
                "status",
                format!(
                    "agent {} cannot move from {} to {}",
                    agent_id, agent.status, update.status
                ),
            ));
        }
        if update.status == AgentStatus::Failed
            && update.error_message.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(ResearchError::validation(
                "error_message",
                "A failed agent must report an error message",
            ));
        }

        self.storage
            .update_agent_status(agent_id, &update)
            .await
            .map_err(storage_error)?;

        match update.status {
            AgentStatus::Failed => warn!(
                session_id = %agent.session_id,
                agent_id = %agent_id,
                error = update.error_message.as_deref().unwrap_or_default(),
                "Agent failed"
            ),
            status => info!(
                session_id = %agent.session_id,
                agent_id = %agent_id,
                from = %agent.status,
                to = %status,
                "Agent status updated"
            ),
        }
        self.get_agent(agent_id).await
    }
}
