//! Integration tests for the full Session → Graph → Storage flow
//!
//! These tests run against file-backed SQLite databases so that restarts
//! and multiple workers sharing one database are exercised for real.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;

use research_graph::config::{
    Config, DatabaseConfig, LockConfig, LogFormat, LoggingConfig, ResearchConfig,
};
use research_graph::error::{ExecutorResult, ResearchError};
use research_graph::got::{GenerateOptions, GenerationStrategy, PathStatus, ResearchPath};
use research_graph::logic::{ConflictType, Fact, Source, ValueType};
use research_graph::orchestrator::{Orchestrator, PathExecutor, PathOutcome};
use research_graph::session::SessionManager;
use research_graph::storage::{OperationType, ResearchType, SessionStatus, SqliteStorage, Storage};

/// Create test configuration for a database file
fn create_test_config(db_path: &Path) -> Config {
    Config {
        database: DatabaseConfig {
            path: db_path.to_path_buf(),
            max_connections: 4,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
        },
        research: ResearchConfig::default(),
        lock: LockConfig {
            stale_after_secs: 300,
            retry_delay_ms: 5,
            max_retries: 50,
        },
    }
}

/// Open a session manager on the database, as a fresh process would.
async fn open_manager(config: &Config) -> SessionManager {
    let storage = SqliteStorage::new(&config.database)
        .await
        .expect("Failed to open database");
    SessionManager::new(Arc::new(storage), config)
}

#[tokio::test]
async fn test_graph_survives_restart() {
    let dir = tempdir().unwrap();
    let config = create_test_config(&dir.path().join("research.db"));

    let (session_id, kept, pruned) = {
        let sessions = open_manager(&config).await;
        let session = sessions
            .create_session("Grid-scale storage", ResearchType::Deep)
            .await
            .unwrap();
        let mut graph = sessions.load_graph(&session.id).await.unwrap();

        let paths = graph
            .generate("Grid-scale storage", GenerateOptions::new(3, GenerationStrategy::Diverse))
            .await
            .unwrap();
        for path in &paths {
            graph
                .record_output(&path.id, "Iron-air batteries reached pilot scale.", Vec::new())
                .await
                .unwrap();
        }
        let result = graph.score_and_prune(&[], 2, None, 6.0).await.unwrap();
        (session.id, result.kept_ids, result.pruned_ids)
    };

    let sessions = open_manager(&config).await;
    let graph = sessions.load_graph(&session_id).await.unwrap();

    assert_eq!(graph.paths().len(), 3);
    for id in &kept {
        let path = graph.get_path(id).unwrap();
        assert_eq!(path.status, PathStatus::Completed);
        assert!(path.is_scored());
    }
    assert_eq!(graph.get_path(&pruned[0]).unwrap().status, PathStatus::Pruned);

    let types: Vec<OperationType> = graph.history().iter().map(|op| op.operation_type).collect();
    assert_eq!(
        types,
        vec![
            OperationType::Generate,
            OperationType::Complete,
            OperationType::Complete,
            OperationType::Complete,
            OperationType::Score,
            OperationType::Prune,
        ]
    );

    // Pruned paths stay frozen after a restart too
    let mut graph = graph;
    let err = graph
        .record_output(&pruned[0], "late findings", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
}

#[tokio::test]
async fn test_workers_share_the_session_lock() {
    let dir = tempdir().unwrap();
    let config = create_test_config(&dir.path().join("research.db"));
    let worker_a = open_manager(&config).await;
    let worker_b = open_manager(&config).await;

    let session = worker_a
        .create_session("Grid-scale storage", ResearchType::Quick)
        .await
        .unwrap();

    worker_a.acquire_lock(&session.id, "worker-a").await.unwrap();
    let err = worker_b.next_action(&session.id, "worker-b").await.unwrap_err();
    match err {
        ResearchError::SessionLocked { locked_by, .. } => assert_eq!(locked_by, "worker-a"),
        other => panic!("expected SessionLocked, got {other:?}"),
    }
    worker_a.release_lock(&session.id, "worker-a").await.unwrap();

    // Concurrent decisions serialize on the lock and each advance the iteration
    let (a, b) = tokio::join!(
        worker_a.next_action_with_retry(&session.id, "worker-a"),
        worker_b.next_action_with_retry(&session.id, "worker-b"),
    );
    let mut iterations = vec![a.unwrap().iteration, b.unwrap().iteration];
    iterations.sort_unstable();
    assert_eq!(iterations, vec![1, 2]);

    let decisions = worker_a.storage().get_decisions(&session.id).await.unwrap();
    assert_eq!(decisions.len(), 2);
    let session = worker_b.get_session(&session.id).await.unwrap();
    assert!(session.locked_by.is_none());
}

/// Reports a different off-target rate for each research focus.
struct SurveyExecutor;

#[async_trait]
impl PathExecutor for SurveyExecutor {
    async fn execute(&self, _session_id: &str, path: &ResearchPath) -> ExecutorResult<PathOutcome> {
        let rate = if path.focus.starts_with("Industry") { "20%" } else { "5%" };
        let fact = Fact::new("CRISPR", "off_target_rate", rate)
            .with_type(ValueType::Percentage)
            .with_source(
                Source::from_url(format!("https://journals.example.org/{}", path.id))
                    .with_quality("A"),
            );
        Ok(PathOutcome::new(format!("{} reports an off-target rate of {}.", path.focus, rate))
            .with_facts(vec![fact]))
    }
}

#[tokio::test]
async fn test_orchestrated_run_reports_conflicts() {
    let dir = tempdir().unwrap();
    let config = create_test_config(&dir.path().join("research.db"));
    let sessions = open_manager(&config).await;
    let session = sessions
        .create_session("CRISPR off-target effects", ResearchType::Deep)
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(sessions.clone(), Arc::new(SurveyExecutor))
        .with_worker_id("integration-worker");
    let outcome = orchestrator.run(&session.id).await.unwrap();

    assert!(outcome.content.contains("off-target rate of 20%"));
    assert!(outcome.content.contains("off-target rate of 5%"));
    assert!(outcome
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::Numerical));

    // A restarted process sees the completed session and its audit trail
    let reopened = open_manager(&config).await;
    let stored = reopened.get_session(&session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(stored.is_aggregated);
    assert_eq!(stored.iteration, outcome.iterations);

    let decisions = reopened.storage().get_decisions(&session.id).await.unwrap();
    assert_eq!(decisions.len() as u32, outcome.iterations);
    assert!(decisions.iter().all(|d| d.caller_id == "integration-worker"));
    assert_eq!(decisions.last().unwrap().action, "synthesize");

    let err = orchestrator.step(&session.id).await.unwrap_err();
    assert!(matches!(err, ResearchError::SessionClosed { .. }));
}
