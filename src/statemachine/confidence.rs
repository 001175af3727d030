//! Deterministic research confidence.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::got::{PathStatus, ResearchPath};
use crate::logic::SourceRater;

const CITATION_WEIGHT: f64 = 0.4;
const QUALITY_WEIGHT: f64 = 0.3;
const COVERAGE_WEIGHT: f64 = 0.3;

/// Terms of the evidence confidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConfidenceBreakdown {
    /// Fraction of facts with a citable source.
    pub citation_coverage: f64,
    /// Mean source rating, 0-10.
    pub avg_source_quality: f64,
    /// Fraction of explored subtopics with a completed path.
    pub topic_coverage: f64,
    pub confidence: f64,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Evidence confidence over the non-pruned paths.
pub fn evidence_confidence(paths: &[ResearchPath], rater: &dyn SourceRater) -> ConfidenceBreakdown {
    let live: Vec<&ResearchPath> = paths.iter().filter(|p| !p.is_pruned()).collect();

    let facts: Vec<_> = live.iter().flat_map(|p| p.facts()).collect();
    let cited = facts.iter().filter(|f| f.source.is_citable()).count();
    let citation_coverage = ratio(cited, facts.len());

    // Distinct sources, first occurrence wins.
    let mut sources = BTreeMap::new();
    for fact in &facts {
        if let Some(key) = fact.source.key() {
            sources.entry(key.to_string()).or_insert(&fact.source);
        }
    }
    let avg_source_quality = if sources.is_empty() {
        0.0
    } else {
        sources
            .values()
            .map(|s| rater.rate(s).clamp(0.0, 10.0))
            .sum::<f64>()
            / sources.len() as f64
    };

    let mut topics = BTreeSet::new();
    let mut covered = BTreeSet::new();
    for path in live.iter().filter(|p| !p.is_aggregated()) {
        let subtopic = path.metadata.subtopic.as_str();
        if subtopic.is_empty() {
            continue;
        }
        topics.insert(subtopic);
        if path.status == PathStatus::Completed {
            covered.insert(subtopic);
        }
    }
    let topic_coverage = ratio(covered.len(), topics.len());

    let confidence = (CITATION_WEIGHT * citation_coverage
        + QUALITY_WEIGHT * (avg_source_quality / 10.0)
        + COVERAGE_WEIGHT * topic_coverage)
        .clamp(0.0, 1.0);

    ConfidenceBreakdown {
        citation_coverage,
        avg_source_quality,
        topic_coverage,
        confidence,
    }
}

/// Session confidence, blending in the latest aggregation when there is one.
pub fn session_confidence(
    paths: &[ResearchPath],
    rater: &dyn SourceRater,
    aggregation: Option<f64>,
) -> f64 {
    let evidence = evidence_confidence(paths, rater).confidence;
    match aggregation {
        Some(merged) => ((evidence + merged.clamp(0.0, 1.0)) / 2.0).clamp(0.0, 1.0),
        None => evidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::got::{PathKind, PathMetadata, ResearchStep, StepType};
    use crate::logic::{Fact, GradeRater, Source};
    use chrono::Utc;

    fn path(id: &str, subtopic: &str, status: PathStatus, facts: Vec<Fact>) -> ResearchPath {
        let mut step = ResearchStep::new(1, StepType::Search, "search", "q");
        step.output = Some("output".to_string());
        step.facts = facts;
        ResearchPath {
            id: id.to_string(),
            query: "q".to_string(),
            focus: "Academic Research".to_string(),
            steps: vec![step],
            score: 3.0,
            status,
            metadata: PathMetadata {
                depth: 1,
                max_depth: 5,
                strategy: Default::default(),
                diversity_score: 1.0,
                base_query: "q".to_string(),
                subtopic: subtopic.to_string(),
                source_hints: Vec::new(),
                template_weight: 0.3,
                context: None,
                kind: PathKind::Research,
                parent_ids: Vec::new(),
                scored_at: None,
                dispatched_at: None,
                created_at: Utc::now(),
            },
        }
    }

    fn cited(url: &str, grade: &str) -> Fact {
        Fact::new("CRISPR", "off_target_rate", "5%")
            .with_source(Source::from_url(url).with_quality(grade))
    }

    #[test]
    fn test_empty_graph_is_zero() {
        let breakdown = evidence_confidence(&[], &GradeRater);
        assert_eq!(breakdown, ConfidenceBreakdown::default());
    }

    #[test]
    fn test_confidence_terms() {
        let paths = vec![
            path("p1", "safety", PathStatus::Completed, vec![cited("https://a.org", "A")]),
            path(
                "p2",
                "ethics",
                PathStatus::Active,
                vec![cited("https://b.org", "C"), Fact::new("CRISPR", "cost", "high")],
            ),
        ];
        let breakdown = evidence_confidence(&paths, &GradeRater);

        assert!((breakdown.citation_coverage - 2.0 / 3.0).abs() < 1e-9);
        assert!((breakdown.avg_source_quality - 8.0).abs() < 1e-9);
        assert!((breakdown.topic_coverage - 0.5).abs() < 1e-9);
        let expected = 0.4 * (2.0 / 3.0) + 0.3 * 0.8 + 0.3 * 0.5;
        assert!((breakdown.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_pruned_paths_ignored() {
        let paths = vec![
            path("p1", "safety", PathStatus::Completed, vec![cited("https://a.org", "A")]),
            path("p2", "ethics", PathStatus::Pruned, vec![Fact::new("x", "y", "z")]),
        ];
        let breakdown = evidence_confidence(&paths, &GradeRater);
        assert_eq!(breakdown.citation_coverage, 1.0);
        assert_eq!(breakdown.topic_coverage, 1.0);
        assert!((breakdown.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_sources_counted_once() {
        let paths = vec![
            path("p1", "safety", PathStatus::Completed, vec![cited("https://a.org", "A")]),
            path("p2", "safety", PathStatus::Completed, vec![cited("https://a.org", "E")]),
            path("p3", "ethics", PathStatus::Completed, vec![cited("https://b.org", "E")]),
        ];
        let breakdown = evidence_confidence(&paths, &GradeRater);
        assert!((breakdown.avg_source_quality - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregation_blends_and_is_pure() {
        let paths = vec![path("p1", "safety", PathStatus::Completed, vec![])];
        let evidence = session_confidence(&paths, &GradeRater, None);
        assert!((evidence - 0.3).abs() < 1e-9);

        let blended = session_confidence(&paths, &GradeRater, Some(0.9));
        assert!((blended - 0.6).abs() < 1e-9);
        assert_eq!(blended, session_confidence(&paths, &GradeRater, Some(0.9)));

        let capped = session_confidence(&paths, &GradeRater, Some(7.0));
        assert!(capped <= 1.0);
    }
}
