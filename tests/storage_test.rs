//! Integration tests for SQLite storage layer
//!
//! Tests database operations using in-memory and file-backed SQLite databases.

use chrono::{Duration, Utc};
use serde_json::json;

use research_graph::config::DatabaseConfig;
use research_graph::error::StorageError;
use research_graph::storage::{
    AgentStatus, AgentUpdate, DecisionRecord, GraphOperation, LockAttempt, NodeRecord,
    OperationType, ResearchAgent, ResearchSession, ResearchType, SessionStatus, SqliteStorage,
    Storage,
};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

async fn create_session(storage: &SqliteStorage) -> ResearchSession {
    let session = ResearchSession::new("Perovskite solar cells", ResearchType::Deep);
    storage.create_session(&session).await.unwrap();
    session
}

fn node(session_id: &str, node_id: &str) -> NodeRecord {
    NodeRecord {
        node_id: node_id.to_string(),
        session_id: session_id.to_string(),
        parent_id: None,
        node_type: "research".to_string(),
        content: json!({"id": node_id}).to_string(),
        summary: format!("summary of {}", node_id),
        quality_score: 5.0,
        status: "active".to_string(),
        depth: 0,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_session() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        let retrieved = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(retrieved.id, session.id);
        assert_eq!(retrieved.topic, "Perovskite solar cells");
        assert_eq!(retrieved.research_type, ResearchType::Deep);
        assert_eq!(retrieved.status, SessionStatus::Initializing);
        assert_eq!(retrieved.max_iterations, 10);
        assert!(retrieved.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_get_nonexistent_session() {
        let storage = create_test_storage().await;
        let result = storage.get_session("nonexistent-id").await.unwrap();
        assert!(result.is_none(), "Should return None for nonexistent session");
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let storage = create_test_storage().await;
        create_session(&storage).await;
        create_session(&storage).await;

        assert_eq!(storage.list_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_status_stamps_completion() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        storage
            .update_session_status(&session.id, SessionStatus::Executing, None)
            .await
            .unwrap();
        let executing = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(executing.status, SessionStatus::Executing);
        assert!(executing.completed_at.is_none());

        storage
            .update_session_status(&session.id, SessionStatus::Failed, Some("executor crashed".to_string()))
            .await
            .unwrap();
        let failed = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("executor crashed"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_session_fails() {
        let storage = create_test_storage().await;
        assert!(storage
            .update_session_status("missing", SessionStatus::Planning, None)
            .await
            .is_err());
        assert!(storage.increment_iteration("missing").await.is_err());
        assert!(storage.set_aggregated("missing", true).await.is_err());
    }

    #[tokio::test]
    async fn test_iteration_and_flags() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        assert_eq!(storage.increment_iteration(&session.id).await.unwrap(), 1);
        assert_eq!(storage.increment_iteration(&session.id).await.unwrap(), 2);

        storage.update_confidence(&session.id, 1.7).await.unwrap();
        storage.set_aggregated(&session.id, true).await.unwrap();
        storage.set_budget_exhausted(&session.id, true).await.unwrap();

        let updated = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(updated.iteration, 2);
        assert_eq!(updated.confidence, 1.0);
        assert!(updated.is_aggregated);
        assert!(updated.budget_exhausted);
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;
        let op = GraphOperation::new(&session.id, OperationType::Generate)
            .with_outputs(vec!["path_1".to_string()]);
        storage
            .commit_operations(&session.id, &[op], &[node(&session.id, "path_1")], &[])
            .await
            .unwrap();
        storage
            .log_decision(&DecisionRecord::new(&session.id, 1, "generate", "start"))
            .await
            .unwrap();

        storage.delete_session(&session.id).await.unwrap();

        assert!(storage.get_session(&session.id).await.unwrap().is_none());
        assert!(storage.get_nodes(&session.id).await.unwrap().is_empty());
        assert!(storage.get_operations(&session.id).await.unwrap().is_empty());
        assert!(storage.get_decisions(&session.id).await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod lock_tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_acquire_and_contention() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;
        let now = Utc::now();
        let stale_before = now - Duration::seconds(300);

        let first = storage
            .try_acquire_lock(&session.id, "worker-a", now, stale_before)
            .await
            .unwrap();
        assert_eq!(first, LockAttempt::Acquired);

        let second = storage
            .try_acquire_lock(&session.id, "worker-b", now, stale_before)
            .await
            .unwrap();
        match second {
            LockAttempt::Held { locked_by, locked_at } => {
                assert_eq!(locked_by, "worker-a");
                assert!(!locked_at.is_empty());
            }
            LockAttempt::Acquired => panic!("lock should be held by worker-a"),
        }

        // Re-entrant for the holder
        let again = storage
            .try_acquire_lock(&session.id, "worker-a", now, stale_before)
            .await
            .unwrap();
        assert_eq!(again, LockAttempt::Acquired);
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;
        let now = Utc::now();
        let stale_before = now - Duration::seconds(300);

        storage
            .try_acquire_lock(&session.id, "worker-a", now, stale_before)
            .await
            .unwrap();
        storage.release_lock(&session.id, "worker-b").await.unwrap();
        let locked = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(locked.locked_by.as_deref(), Some("worker-a"));

        storage.release_lock(&session.id, "worker-a").await.unwrap();
        let free = storage.get_session(&session.id).await.unwrap().unwrap();
        assert!(free.locked_by.is_none());
        assert!(free.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;
        let long_ago = Utc::now() - Duration::minutes(10);

        storage
            .try_acquire_lock(&session.id, "crashed-worker", long_ago, long_ago - Duration::seconds(300))
            .await
            .unwrap();

        let now = Utc::now();
        let attempt = storage
            .try_acquire_lock(&session.id, "worker-b", now, now - Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(attempt, LockAttempt::Acquired);

        let session = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.locked_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn test_lock_missing_session() {
        let storage = create_test_storage().await;
        let now = Utc::now();
        let result = storage
            .try_acquire_lock("missing", "worker-a", now, now - Duration::seconds(300))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_lock_shared_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("research.db"),
            max_connections: 4,
        };
        let first = SqliteStorage::new(&config).await.unwrap();
        let second = SqliteStorage::new(&config).await.unwrap();
        assert!(config.path.exists());

        let session = create_session(&first).await;
        let now = Utc::now();
        let stale_before = now - Duration::seconds(300);

        assert_eq!(
            first
                .try_acquire_lock(&session.id, "worker-a", now, stale_before)
                .await
                .unwrap(),
            LockAttempt::Acquired
        );
        assert!(matches!(
            second
                .try_acquire_lock(&session.id, "worker-b", now, stale_before)
                .await
                .unwrap(),
            LockAttempt::Held { .. }
        ));

        first.release_lock(&session.id, "worker-a").await.unwrap();
        assert_eq!(
            second
                .try_acquire_lock(&session.id, "worker-b", now, stale_before)
                .await
                .unwrap(),
            LockAttempt::Acquired
        );
    }
}

#[cfg(test)]
mod graph_tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_upserts_and_logs() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        let generate = GraphOperation::new(&session.id, OperationType::Generate)
            .with_outputs(vec!["path_1".to_string(), "path_2".to_string()])
            .with_payload(json!([{"id": "path_1"}, {"id": "path_2"}]));
        storage
            .commit_operations(
                &session.id,
                &[generate],
                &[node(&session.id, "path_1"), node(&session.id, "path_2")],
                &[],
            )
            .await
            .unwrap();

        let mut updated = node(&session.id, "path_1");
        updated.status = "completed".to_string();
        updated.quality_score = 7.5;
        let complete = GraphOperation::new(&session.id, OperationType::Complete)
            .with_inputs(vec!["path_1".to_string()])
            .with_outputs(vec!["path_1".to_string()]);
        storage
            .commit_operations(&session.id, &[complete], &[updated], &["path_2".to_string()])
            .await
            .unwrap();

        let nodes = storage.get_nodes(&session.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, "completed");
        assert_eq!(nodes[0].quality_score, 7.5);

        let ops = storage.get_operations(&session.id).await.unwrap();
        let types: Vec<OperationType> = ops.iter().map(|o| o.operation_type).collect();
        assert_eq!(types, vec![OperationType::Generate, OperationType::Complete]);
        assert_eq!(ops[0].payload[1]["id"], "path_2");
        assert_eq!(ops[1].input_nodes, vec!["path_1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        let op = GraphOperation::new(&session.id, OperationType::Generate);
        let duplicate = op.clone();
        let result = storage
            .commit_operations(&session.id, &[op, duplicate], &[node(&session.id, "path_1")], &[])
            .await;
        assert!(result.is_err());

        assert!(storage.get_nodes(&session.id).await.unwrap().is_empty());
        assert!(storage.get_operations(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_node_id_in_two_sessions() {
        let storage = create_test_storage().await;
        let a = create_session(&storage).await;
        let b = create_session(&storage).await;

        for session in [&a, &b] {
            storage
                .commit_operations(&session.id, &[], &[node(&session.id, "path_1")], &[])
                .await
                .unwrap();
        }

        assert_eq!(storage.get_nodes(&a.id).await.unwrap().len(), 1);
        assert_eq!(storage.get_nodes(&b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_log_order() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        for (i, action) in ["generate", "execute", "score"].iter().enumerate() {
            let record = DecisionRecord::new(&session.id, i as u32 + 1, *action, "reason")
                .with_params(json!({"step": i}))
                .with_caller("worker-a");
            storage.log_decision(&record).await.unwrap();
        }

        let decisions = storage.get_decisions(&session.id).await.unwrap();
        let actions: Vec<&str> = decisions.iter().map(|d| d.action.as_str()).collect();
        assert_eq!(actions, vec!["generate", "execute", "score"]);
        assert_eq!(decisions[2].iteration, 3);
        assert_eq!(decisions[1].params["step"], 1);
        assert_eq!(decisions[0].caller_id, "worker-a");
    }
}

#[cfg(test)]
mod agent_tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_get_agent() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;

        let agent = ResearchAgent::new(&session.id, "agent-1", "web-researcher")
            .with_focus("tandem cells")
            .with_queries(vec!["perovskite stability".to_string(), "tandem efficiency".to_string()]);
        assert!(storage.register_agent(&agent).await.unwrap());
        // Same id again is refused without touching the row
        assert!(!storage
            .register_agent(&ResearchAgent::new(&session.id, "agent-1", "other"))
            .await
            .unwrap());

        let stored = storage.get_agent("agent-1").await.unwrap().unwrap();
        assert_eq!(stored.agent_type, "web-researcher");
        assert_eq!(stored.focus_description.as_deref(), Some("tandem cells"));
        assert_eq!(stored.search_queries.len(), 2);
        assert_eq!(stored.status, AgentStatus::Deploying);
        assert!(storage.get_agent("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_agent_status_stamps_completion() {
        let storage = create_test_storage().await;
        let session = create_session(&storage).await;
        storage
            .register_agent(&ResearchAgent::new(&session.id, "agent-1", "web-researcher"))
            .await
            .unwrap();

        storage
            .update_agent_status("agent-1", &AgentUpdate::new(AgentStatus::Running).with_token_usage(300))
            .await
            .unwrap();
        let running = storage.get_agent("agent-1").await.unwrap().unwrap();
        assert_eq!(running.status, AgentStatus::Running);
        assert_eq!(running.token_usage, 300);
        assert!(running.completed_at.is_none());

        storage
            .update_agent_status("agent-1", &AgentUpdate::new(AgentStatus::Completed).with_output_file("out.md"))
            .await
            .unwrap();
        let done = storage.get_agent("agent-1").await.unwrap().unwrap();
        assert_eq!(done.status, AgentStatus::Completed);
        assert_eq!(done.output_file.as_deref(), Some("out.md"));
        // Unset fields keep their stored value
        assert_eq!(done.token_usage, 300);
        assert!(done.completed_at.is_some());

        let err = storage
            .update_agent_status("missing", &AgentUpdate::new(AgentStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_agents_listed_per_session_and_cascade() {
        let storage = create_test_storage().await;
        let a = create_session(&storage).await;
        let b = create_session(&storage).await;

        for id in ["agent-1", "agent-2"] {
            storage
                .register_agent(&ResearchAgent::new(&a.id, id, "web-researcher"))
                .await
                .unwrap();
        }
        storage
            .register_agent(&ResearchAgent::new(&b.id, "agent-3", "web-researcher"))
            .await
            .unwrap();

        let ids: Vec<String> = storage
            .list_agents(&a.id)
            .await
            .unwrap()
            .into_iter()
            .map(|agent| agent.agent_id)
            .collect();
        assert_eq!(ids, vec!["agent-1", "agent-2"]);

        storage.delete_session(&a.id).await.unwrap();
        assert!(storage.list_agents(&a.id).await.unwrap().is_empty());
        assert!(storage.get_agent("agent-1").await.unwrap().is_none());
        assert_eq!(storage.list_agents(&b.id).await.unwrap().len(), 1);
    }
}
