//! Unit tests for the graph controller.
//!
//! Most tests run against an in-memory SQLite database; the persistence
//! failure tests use the mocked storage seam.

use std::sync::Arc;

use super::*;
use crate::error::{ResearchError, StorageError};
use crate::logic::{Fact, FactConfidence, Source, ValueType};
use crate::storage::{
    MockStorage, OperationType, ResearchSession, ResearchType, SessionStatus, SqliteStorage, Storage,
};

async fn setup() -> (Arc<SqliteStorage>, GraphController) {
    let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
    let session = ResearchSession::new("CRISPR safety", ResearchType::Deep);
    storage.create_session(&session).await.unwrap();
    let controller = GraphController::new(storage.clone(), session.id.clone());
    (storage, controller)
}

fn ids_of(paths: &[ResearchPath]) -> Vec<String> {
    paths.iter().map(|p| p.id.clone()).collect()
}

// ============================================================================
// Generate
// ============================================================================

#[tokio::test]
async fn test_generate_diverse_scenario() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("CRISPR safety", GenerateOptions::default())
        .await
        .unwrap();

    assert_eq!(paths.len(), 3);
    let focuses: Vec<&str> = paths.iter().map(|p| p.focus.as_str()).collect();
    assert_eq!(
        focuses,
        vec!["Academic Research", "Industry Practices", "Policy & Governance"]
    );
    let subtopics: Vec<&str> = paths.iter().map(|p| p.metadata.subtopic.as_str()).collect();
    assert_eq!(subtopics, vec!["overview", "technical detail", "applications"]);

    for path in &paths {
        assert_eq!(path.status, PathStatus::Active);
        assert!(path.is_pending());
        assert!(!path.query.is_empty());
        assert!(path.query.starts_with("CRISPR safety"));
        assert_eq!(path.steps.len(), 1);
        assert_eq!(path.steps[0].step_number, 1);
        assert_eq!(path.steps[0].step_type, StepType::Search);
    }
    assert_eq!(paths[0].metadata.diversity_score, 1.0);
    assert!(paths[1].metadata.diversity_score < 1.0);
    assert!((paths[0].score - 3.0).abs() < 1e-9);
    assert_eq!(controller.history().len(), 1);
}

#[tokio::test]
async fn test_generate_returns_exactly_k() {
    let (_storage, mut controller) = setup().await;
    for k in 1..=8 {
        for strategy in [
            GenerationStrategy::Diverse,
            GenerationStrategy::Focused,
            GenerationStrategy::Exploratory,
        ] {
            let paths = controller
                .generate("quantum error correction", GenerateOptions::new(k, strategy))
                .await
                .unwrap();
            assert_eq!(paths.len(), k);
            assert!(paths.iter().all(|p| p.status == PathStatus::Active && !p.query.is_empty()));
        }
    }
}

#[tokio::test]
async fn test_generate_orthogonal_one_per_template() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("edge computing", GenerateOptions::new(2, GenerationStrategy::Orthogonal))
        .await
        .unwrap();
    assert_eq!(paths.len(), 5);
    let mut focuses: Vec<&str> = paths.iter().map(|p| p.focus.as_str()).collect();
    focuses.dedup();
    assert_eq!(focuses.len(), 5);
}

#[tokio::test]
async fn test_generate_diversity_is_deterministic() {
    let (_s1, mut a) = setup().await;
    let (_s2, mut b) = setup().await;
    let pa = a.generate("soil carbon", GenerateOptions::default()).await.unwrap();
    let pb = b.generate("soil carbon", GenerateOptions::default()).await.unwrap();
    let da: Vec<f64> = pa.iter().map(|p| p.metadata.diversity_score).collect();
    let db: Vec<f64> = pb.iter().map(|p| p.metadata.diversity_score).collect();
    assert_eq!(da, db);
}

#[tokio::test]
async fn test_generate_rejects_bad_input() {
    let (_storage, mut controller) = setup().await;
    let err = controller
        .generate("topic", GenerateOptions::new(0, GenerationStrategy::Diverse))
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));

    let err = controller.generate("   ", GenerateOptions::default()).await.unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
    assert!(controller.paths().is_empty());
}

#[tokio::test]
async fn test_generate_carries_context() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate(
            "battery recycling",
            GenerateOptions::new(2, GenerationStrategy::Focused).with_context("lithium recovery rates"),
        )
        .await
        .unwrap();
    assert!(paths
        .iter()
        .all(|p| p.metadata.context.as_deref() == Some("lithium recovery rates")));
}

// ============================================================================
// Refine
// ============================================================================

#[tokio::test]
async fn test_refine_succeeds_max_depth_times() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate(
            "CRISPR safety",
            GenerateOptions::new(1, GenerationStrategy::Diverse).with_max_depth(3),
        )
        .await
        .unwrap();
    let id = paths[0].id.clone();

    for expected in 1..=3 {
        let refined = controller.refine(&id, None, 1).await.unwrap();
        assert_eq!(refined.metadata.depth, expected);
        assert_eq!(refined.status, PathStatus::Active);
    }

    let err = controller.refine(&id, None, 1).await.unwrap_err();
    match err {
        ResearchError::DepthExceeded {
            path_id,
            depth,
            max_depth,
        } => {
            assert_eq!(path_id, id);
            assert_eq!(depth, 3);
            assert_eq!(max_depth, 3);
        }
        other => panic!("expected DepthExceeded, got {:?}", other),
    }
    assert_eq!(controller.get_path(&id).unwrap().steps.len(), 4);
}

#[tokio::test]
async fn test_refine_queries() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("CRISPR safety", GenerateOptions::new(1, GenerationStrategy::Diverse))
        .await
        .unwrap();
    let id = paths[0].id.clone();
    let base = paths[0].query.clone();

    let auto = controller.refine(&id, None, 1).await.unwrap();
    assert_eq!(auto.query, format!("detailed analysis of {}", base));
    let step = auto.steps.last().unwrap();
    assert_eq!(step.step_type, StepType::Analyze);
    assert_eq!(step.action, "refine");
    assert_eq!(step.step_number, 2);

    let auto = controller.refine(&id, None, 1).await.unwrap();
    assert_eq!(auto.query, format!("in-depth study on {}", base));

    let guided = controller.refine(&id, Some("germline edits"), 1).await.unwrap();
    assert_eq!(
        guided.query,
        format!("in-depth study on {} focusing on germline edits", base)
    );
}

#[tokio::test]
async fn test_refine_unknown_path() {
    let (_storage, mut controller) = setup().await;
    let err = controller.refine("path_404", None, 1).await.unwrap_err();
    assert!(matches!(err, ResearchError::NotFound { kind: "Path", .. }));
}

// ============================================================================
// Record output
// ============================================================================

#[tokio::test]
async fn test_record_output_completes_path() {
    let (_storage, mut controller) = setup().await;
    let paths = controller.generate("topic", GenerateOptions::default()).await.unwrap();
    let id = paths[0].id.clone();

    let fact = Fact::new("CRISPR", "off_target_rate", "5%").with_type(ValueType::Percentage);
    let updated = controller
        .record_output(&id, "Off-target rate is about 5%.", vec![fact.clone()])
        .await
        .unwrap();

    assert_eq!(updated.status, PathStatus::Completed);
    assert!(!updated.is_pending());
    assert!(!updated.is_scored());
    assert_eq!(updated.steps.len(), 1);
    assert_eq!(updated.latest_output(), Some("Off-target rate is about 5%."));
    assert_eq!(updated.facts().next(), Some(&fact));

    // A second recording appends rather than overwrites.
    let again = controller.record_output(&id, "Follow-up finding.", vec![]).await.unwrap();
    assert_eq!(again.steps.len(), 2);
    assert_eq!(again.outputs().count(), 2);
}

#[tokio::test]
async fn test_record_output_rejects_empty() {
    let (_storage, mut controller) = setup().await;
    let paths = controller.generate("topic", GenerateOptions::default()).await.unwrap();
    let err = controller.record_output(&paths[0].id, "  ", vec![]).await.unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
}

// ============================================================================
// Score + Prune
// ============================================================================

#[tokio::test]
async fn test_score_and_prune_properties() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("CRISPR safety", GenerateOptions::new(4, GenerationStrategy::Diverse))
        .await
        .unwrap();
    controller
        .record_output(&paths[1].id, "Industry finding.", vec![])
        .await
        .unwrap();
    controller
        .record_output(&paths[2].id, "Policy finding.", vec![])
        .await
        .unwrap();

    let result = controller
        .score_and_prune(&ids_of(&paths), 2, None, 6.0)
        .await
        .unwrap();

    assert_eq!(result.ranked.len(), 4);
    assert_eq!(result.kept_ids.len(), 2);
    assert_eq!(result.pruned_ids.len(), 2);
    let min_kept = result
        .ranked
        .iter()
        .filter(|e| e.kept)
        .map(|e| e.score)
        .fold(f64::INFINITY, f64::min);
    let max_pruned = result
        .ranked
        .iter()
        .filter(|e| !e.kept)
        .map(|e| e.score)
        .fold(f64::NEG_INFINITY, f64::max);
    assert!(min_kept >= max_pruned);
    assert!(result.ranked.windows(2).all(|w| w[0].score >= w[1].score));

    // Paths with output outrank paths without.
    assert!(result.kept_ids.contains(&paths[1].id));
    assert!(result.kept_ids.contains(&paths[2].id));

    for id in &result.pruned_ids {
        assert_eq!(controller.get_path(id).unwrap().status, PathStatus::Pruned);
    }
    for id in &result.kept_ids {
        assert!(controller.get_path(id).unwrap().is_scored());
    }

    let types: Vec<OperationType> = controller.history().iter().map(|o| o.operation_type).collect();
    assert_eq!(types.last(), Some(&OperationType::Prune));
}

#[tokio::test]
async fn test_score_keep_more_than_available() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("topic", GenerateOptions::new(2, GenerationStrategy::Diverse))
        .await
        .unwrap();
    let result = controller.score_and_prune(&ids_of(&paths), 5, None, 6.0).await.unwrap();
    assert_eq!(result.kept_ids.len(), 2);
    assert!(result.pruned_ids.is_empty());
    assert_eq!(
        controller.history().last().map(|o| o.operation_type),
        Some(OperationType::Score)
    );
}

#[tokio::test]
async fn test_score_breakdown_and_weights() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("topic", GenerateOptions::new(1, GenerationStrategy::Diverse))
        .await
        .unwrap();
    let criteria = ScoringCriteria {
        completeness: 1.0,
        citation_quality: 0.0,
        relevance: 0.0,
    };
    let result = controller
        .score_and_prune(&ids_of(&paths), 1, Some(criteria), 6.0)
        .await
        .unwrap();
    // one step out of five
    assert!((result.ranked[0].score - 2.0).abs() < 1e-9);
    assert!((result.ranked[0].breakdown.completeness - 0.2).abs() < 1e-9);
    assert_eq!(result.ranked[0].breakdown.citation_quality, 0.0);
    assert_eq!(result.meets_threshold, 0);
}

#[tokio::test]
async fn test_pruned_paths_are_immutable() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("topic", GenerateOptions::new(2, GenerationStrategy::Diverse))
        .await
        .unwrap();
    controller.record_output(&paths[0].id, "Finding.", vec![]).await.unwrap();
    let result = controller.score_and_prune(&ids_of(&paths), 1, None, 6.0).await.unwrap();
    let pruned_id = result.pruned_ids[0].clone();
    let before = controller.get_path(&pruned_id).unwrap().clone();

    assert!(controller.refine(&pruned_id, None, 1).await.is_err());
    assert!(controller.record_output(&pruned_id, "late", vec![]).await.is_err());
    assert!(controller
        .score_and_prune(&[pruned_id.clone()], 1, None, 6.0)
        .await
        .is_err());
    assert!(controller
        .aggregate(&[pruned_id.clone(), result.kept_ids[0].clone()], AggregationStrategy::Synthesis)
        .await
        .is_err());

    assert_eq!(controller.get_path(&pruned_id).unwrap(), &before);
}

// ============================================================================
// Aggregate
// ============================================================================

#[tokio::test]
async fn test_aggregate_synthesis_scenario() {
    let (_storage, mut controller) = setup().await;
    let paths = controller.generate("CRISPR safety", GenerateOptions::default()).await.unwrap();
    for (i, path) in paths.iter().enumerate() {
        controller
            .record_output(&path.id, &format!("Finding number {} about delivery vectors.", i), vec![])
            .await
            .unwrap();
    }
    let scored = controller.score_and_prune(&ids_of(&paths), 2, None, 6.0).await.unwrap();

    let result = controller
        .aggregate(&scored.kept_ids, AggregationStrategy::Synthesis)
        .await
        .unwrap();
    assert!((0.0..=1.0).contains(&result.confidence));
    for id in &scored.kept_ids {
        let latest = controller.get_path(id).unwrap().latest_output().unwrap().to_string();
        assert!(result.content.contains(&latest));
    }
    assert_eq!(result.source_ids, scored.kept_ids);

    let aggregated = controller.get_path(&result.path_id).unwrap();
    assert!(aggregated.is_aggregated());
    assert_eq!(aggregated.status, PathStatus::Completed);
    assert!(aggregated.is_scored());
    assert_eq!(aggregated.metadata.parent_ids, scored.kept_ids);
    let latest = controller.latest_aggregation_confidence().unwrap();
    assert!((latest - result.confidence).abs() < 1e-9);
}

#[tokio::test]
async fn test_aggregate_requires_two_paths() {
    let (_storage, mut controller) = setup().await;
    let paths = controller.generate("topic", GenerateOptions::default()).await.unwrap();
    let err = controller
        .aggregate(&[paths[0].id.clone(), paths[0].id.clone()], AggregationStrategy::Voting)
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
}

#[tokio::test]
async fn test_aggregate_requires_recorded_research_paths() {
    let (_storage, mut controller) = setup().await;
    let paths = controller.generate("topic", GenerateOptions::default()).await.unwrap();
    controller.record_output(&paths[0].id, "Finding A.", vec![]).await.unwrap();
    controller.record_output(&paths[1].id, "Finding B.", vec![]).await.unwrap();

    let err = controller
        .aggregate(&[paths[0].id.clone(), paths[2].id.clone()], AggregationStrategy::Synthesis)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no recorded output"));

    let merged = controller
        .aggregate(&ids_of(&paths[..2]), AggregationStrategy::Synthesis)
        .await
        .unwrap();
    let err = controller
        .aggregate(&[merged.path_id.clone(), paths[0].id.clone()], AggregationStrategy::Voting)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("aggregation"));

    let err = controller
        .record_output(&merged.path_id, "More.", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
    let err = controller.refine(&merged.path_id, None, 1).await.unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
    assert_eq!(controller.history().len(), 4);
}

#[tokio::test]
async fn test_aggregate_reports_fact_conflicts() {
    let (_storage, mut controller) = setup().await;
    let paths = controller
        .generate("gene therapy market", GenerateOptions::new(2, GenerationStrategy::Diverse))
        .await
        .unwrap();
    let high = Fact::new("Gene therapy market", "size_2030", "$184 billion")
        .with_type(ValueType::Currency)
        .with_confidence(FactConfidence::High)
        .with_source(Source::from_url("https://a.example").with_quality("A"));
    let low = Fact::new("gene therapy market", "size_2030", "$407 billion")
        .with_type(ValueType::Currency)
        .with_confidence(FactConfidence::High)
        .with_source(Source::from_url("https://b.example").with_quality("C"));
    controller.record_output(&paths[0].id, "Market estimate A.", vec![high]).await.unwrap();
    controller.record_output(&paths[1].id, "Market estimate B.", vec![low]).await.unwrap();

    let result = controller
        .aggregate(&ids_of(&paths), AggregationStrategy::Consensus)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert!(result.content.contains("## Conflicts"));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_load_replays_operation_log() {
    let (storage, mut controller) = setup().await;
    let paths = controller.generate("CRISPR safety", GenerateOptions::default()).await.unwrap();
    controller.refine(&paths[0].id, Some("off-target"), 1).await.unwrap();
    controller.record_output(&paths[0].id, "Finding A.", vec![]).await.unwrap();
    controller.record_output(&paths[1].id, "Finding B.", vec![]).await.unwrap();
    controller.score_and_prune(&ids_of(&paths), 2, None, 6.0).await.unwrap();
    let kept: Vec<String> = controller
        .paths()
        .iter()
        .filter(|p| !p.is_pruned())
        .map(|p| p.id.clone())
        .collect();
    controller.aggregate(&kept, AggregationStrategy::Voting).await.unwrap();
    controller.delete_path(&paths[2].id).await.unwrap();

    let reloaded = GraphController::load(storage.clone(), controller.session_id())
        .await
        .unwrap();
    assert_eq!(reloaded.paths(), controller.paths());
    assert_eq!(reloaded.history().len(), controller.history().len());
    assert_eq!(reloaded.statistics(), controller.statistics());

    let nodes = storage.get_nodes(controller.session_id()).await.unwrap();
    assert_eq!(nodes.len(), controller.paths().len());
    assert!(nodes.iter().all(|n| n.node_id != paths[2].id));
}

#[tokio::test]
async fn test_reloaded_controller_keeps_counting() {
    let (storage, mut controller) = setup().await;
    controller.generate("topic", GenerateOptions::default()).await.unwrap();
    let mut reloaded = GraphController::load(storage, controller.session_id()).await.unwrap();
    let more = reloaded
        .generate("topic", GenerateOptions::new(1, GenerationStrategy::Diverse))
        .await
        .unwrap();
    // fourth path in this graph
    assert_eq!(more[0].metadata.subtopic, "limitations");
    assert!(more[0].id.starts_with("path_4_"));
}

fn subtopics(paths: &[ResearchPath]) -> Vec<String> {
    paths.iter().map(|p| p.metadata.subtopic.clone()).collect()
}

#[tokio::test]
async fn test_aggregated_paths_do_not_advance_subtopics() {
    let (storage, mut controller) = setup().await;
    let paths = controller.generate("topic", GenerateOptions::default()).await.unwrap();
    controller.record_output(&paths[0].id, "Finding A.", vec![]).await.unwrap();
    controller.record_output(&paths[1].id, "Finding B.", vec![]).await.unwrap();
    controller
        .aggregate(&ids_of(&paths[..2]), AggregationStrategy::Synthesis)
        .await
        .unwrap();

    let mut reloaded = GraphController::load(storage, controller.session_id()).await.unwrap();
    let options = GenerateOptions::new(2, GenerationStrategy::Diverse);
    let live = controller.generate("topic", options.clone()).await.unwrap();
    let replayed = reloaded.generate("topic", options).await.unwrap();

    assert_eq!(subtopics(&live), subtopics(&replayed));
    assert_eq!(subtopics(&live), vec!["limitations", "future directions"]);
    assert!(live[0].id.starts_with("path_4_"));
    assert!(replayed[0].id.starts_with("path_4_"));
}

#[tokio::test]
async fn test_closed_session_refuses_mutations() {
    let (storage, mut controller) = setup().await;
    controller.generate("topic", GenerateOptions::default()).await.unwrap();
    storage
        .update_session_status(controller.session_id(), SessionStatus::Failed, Some("cancelled".into()))
        .await
        .unwrap();

    let err = controller.generate("topic", GenerateOptions::default()).await.unwrap_err();
    assert!(matches!(err, ResearchError::SessionClosed { .. }));
    assert_eq!(controller.paths().len(), 3);
}

#[tokio::test]
async fn test_failed_persistence_leaves_state_unchanged() {
    let session = ResearchSession::new("topic", ResearchType::Quick);
    let session_id = session.id.clone();

    let mut mock = MockStorage::new();
    mock.expect_get_session()
        .returning(move |_| Ok(Some(session.clone())));
    let mut calls = 0;
    mock.expect_commit_operations().returning(move |_, _, _, _| {
        calls += 1;
        if calls == 1 {
            Ok(())
        } else {
            Err(StorageError::Query {
                message: "disk I/O error".to_string(),
            })
        }
    });

    let mut controller = GraphController::new(Arc::new(mock), session_id);
    let paths = controller.generate("topic", GenerateOptions::default()).await.unwrap();
    let before = controller.paths().to_vec();
    let history_before = controller.history().len();

    let err = controller.refine(&paths[0].id, None, 1).await.unwrap_err();
    assert!(matches!(err, ResearchError::Persistence(_)));
    assert_eq!(controller.paths(), before.as_slice());
    assert_eq!(controller.history().len(), history_before);

    let err = controller.generate("topic", GenerateOptions::default()).await.unwrap_err();
    assert!(matches!(err, ResearchError::Persistence(_)));
    assert_eq!(controller.paths().len(), 3);
}

// ============================================================================
// Export / import / visualization
// ============================================================================

#[tokio::test]
async fn test_export_import_round_trip() {
    let (storage, mut controller) = setup().await;
    let paths = controller.generate("CRISPR safety", GenerateOptions::default()).await.unwrap();
    controller.record_output(&paths[0].id, "Finding.", vec![]).await.unwrap();
    controller.score_and_prune(&ids_of(&paths), 2, None, 6.0).await.unwrap();

    let export = controller.export_state();
    assert_eq!(export.version, "1.0");
    assert_eq!(export.statistics.total_paths, 3);
    let json = serde_json::to_value(&export).unwrap();
    assert!(json.get("sessionId").is_some());
    assert!(json.get("exportedAt").is_some());

    let target = ResearchSession::new("CRISPR safety", ResearchType::Deep);
    storage.create_session(&target).await.unwrap();
    let mut imported = GraphController::new(storage.clone(), target.id.clone());
    let count = imported.import_state(export).await.unwrap();
    assert_eq!(count, 3);

    for original in controller.paths() {
        let copy = imported.get_path(&original.id).unwrap();
        assert_eq!(copy.query, original.query);
        assert_eq!(copy.status, original.status);
        assert_eq!(copy.score, original.score);
    }

    let reloaded = GraphController::load(storage, target.id.clone()).await.unwrap();
    assert_eq!(reloaded.paths(), imported.paths());
}

#[tokio::test]
async fn test_import_rejects_out_of_range_paths() {
    let (_storage, mut controller) = setup().await;
    controller.generate("topic", GenerateOptions::default()).await.unwrap();

    let mut too_deep = controller.export_state();
    too_deep.paths[0].metadata.depth = too_deep.paths[0].metadata.max_depth + 1;
    let err = controller.import_state(too_deep).await.unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
    assert!(err.to_string().contains("depth"));

    let mut bad_score = controller.export_state();
    bad_score.paths[1].score = 11.5;
    let err = controller.import_state(bad_score).await.unwrap_err();
    assert!(err.to_string().contains("score"));

    let mut not_a_number = controller.export_state();
    not_a_number.paths[2].score = f64::NAN;
    assert!(controller.import_state(not_a_number).await.is_err());

    // Nothing was committed
    assert_eq!(controller.history().len(), 1);
    assert!(controller.paths().iter().all(|p| p.metadata.depth == 0));
}

#[tokio::test]
async fn test_reload_after_import_keeps_subtopics() {
    let (storage, mut controller) = setup().await;
    controller.generate("topic", GenerateOptions::default()).await.unwrap();
    let mut export = controller.export_state();
    export.paths.truncate(2);
    controller.import_state(export).await.unwrap();

    let mut reloaded = GraphController::load(storage, controller.session_id()).await.unwrap();
    let options = GenerateOptions::new(1, GenerationStrategy::Diverse);
    let live = controller.generate("topic", options.clone()).await.unwrap();
    let replayed = reloaded.generate("topic", options).await.unwrap();
    // the dropped third path still counts
    assert_eq!(subtopics(&live), vec!["limitations"]);
    assert_eq!(subtopics(&live), subtopics(&replayed));
}

#[tokio::test]
async fn test_import_rejects_unknown_version() {
    let (_storage, mut controller) = setup().await;
    let mut export = controller.export_state();
    export.version = "9.9".to_string();
    let err = controller.import_state(export).await.unwrap_err();
    assert!(matches!(err, ResearchError::Validation { .. }));
}

#[tokio::test]
async fn test_visualization() {
    let (_storage, mut controller) = setup().await;
    let paths = controller.generate("CRISPR safety", GenerateOptions::default()).await.unwrap();
    controller.record_output(&paths[0].id, "A.", vec![]).await.unwrap();
    controller.record_output(&paths[1].id, "B.", vec![]).await.unwrap();
    let agg = controller
        .aggregate(&[paths[0].id.clone(), paths[1].id.clone()], AggregationStrategy::Synthesis)
        .await
        .unwrap();

    let viz = controller.visualize_json("CRISPR safety");
    assert_eq!(viz.nodes.len(), 5);
    assert_eq!(viz.nodes[0].node_type, "topic");
    assert_eq!(viz.edges.iter().filter(|e| e.edge_type == "explores").count(), 3);
    assert_eq!(
        viz.edges
            .iter()
            .filter(|e| e.edge_type == "aggregates" && e.target == agg.path_id)
            .count(),
        2
    );

    let dot = controller.visualize_dot("CRISPR \"safety\"");
    assert!(dot.starts_with("digraph research {"));
    assert!(dot.contains("\\\"safety\\\""));
    assert!(dot.contains(&format!("\"root\" -> \"{}\"", paths[0].id)));
    assert!(dot.trim_end().ends_with('}'));
}
