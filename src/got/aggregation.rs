//! Aggregation strategies.
//!
//! Each strategy is a pure function from source paths (and, for consensus,
//! the detected conflicts) to merged text plus a confidence in `[0, 1]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::similarity::{jaccard, tokens};
use super::ResearchPath;
use crate::logic::{contradicting_claims, detect_conflicts, Conflict, ConflictTolerance, Fact, Source};

/// Minimum pairwise word overlap for two sentences to back the same claim.
const VOTING_OVERLAP: f64 = 0.3;

/// Fixed theme keywords for thematic aggregation.
pub const THEMES: [&str; 8] = [
    "performance",
    "security",
    "scalability",
    "usability",
    "cost",
    "reliability",
    "maintainability",
    "efficiency",
];

/// How Aggregate merges path outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Executive summary, per-path findings and a conclusion.
    #[default]
    Synthesis,
    /// Majority-supported claims only.
    Voting,
    /// All outputs plus an explicit conflicts section.
    Consensus,
    /// Findings grouped by shared theme keywords.
    Thematic,
    /// Paths narrated in order of their first step.
    Chronological,
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationStrategy::Synthesis => write!(f, "synthesis"),
            AggregationStrategy::Voting => write!(f, "voting"),
            AggregationStrategy::Consensus => write!(f, "consensus"),
            AggregationStrategy::Thematic => write!(f, "thematic"),
            AggregationStrategy::Chronological => write!(f, "chronological"),
        }
    }
}

impl std::str::FromStr for AggregationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synthesis" => Ok(AggregationStrategy::Synthesis),
            "voting" => Ok(AggregationStrategy::Voting),
            "consensus" => Ok(AggregationStrategy::Consensus),
            "thematic" => Ok(AggregationStrategy::Thematic),
            "chronological" => Ok(AggregationStrategy::Chronological),
            _ => Err(format!("Unknown aggregation strategy: {}", s)),
        }
    }
}

/// Merged text and confidence produced by one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub content: String,
    pub confidence: f64,
}

/// Dispatch to the strategy's merge function.
pub fn merge(strategy: AggregationStrategy, paths: &[&ResearchPath], conflicts: &[Conflict]) -> Merged {
    match strategy {
        AggregationStrategy::Synthesis => synthesis(paths),
        AggregationStrategy::Voting => voting(paths),
        AggregationStrategy::Consensus => consensus(paths, conflicts),
        AggregationStrategy::Thematic => thematic(paths),
        AggregationStrategy::Chronological => chronological(paths),
    }
}

/// `min((avg_score / 10) * (1 + n * 0.1), 1)`.
pub fn synthesis_confidence(paths: &[&ResearchPath]) -> f64 {
    if paths.is_empty() {
        return 0.0;
    }
    let n = paths.len() as f64;
    let avg = paths.iter().map(|p| p.score).sum::<f64>() / n;
    ((avg / 10.0) * (1.0 + n * 0.1)).clamp(0.0, 1.0)
}

/// `ceil(n * 0.6) / n`.
pub fn voting_confidence(n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    ((n as f64 * 0.6).ceil() / n as f64).min(1.0)
}

/// Synthesis confidence minus 0.05 per conflict, never below 0.3.
pub fn consensus_confidence(paths: &[&ResearchPath], conflict_count: usize) -> f64 {
    (synthesis_confidence(paths) - 0.05 * conflict_count as f64).clamp(0.3, 1.0)
}

pub fn synthesis(paths: &[&ResearchPath]) -> Merged {
    let mut content = String::from("# Research Synthesis\n\n## Executive Summary\n\n");
    let focuses: Vec<&str> = paths.iter().map(|p| p.focus.as_str()).collect();
    content.push_str(&format!(
        "Synthesized {} research paths covering: {}.\n\n",
        paths.len(),
        focuses.join(", ")
    ));

    content.push_str("## Key Findings\n\n");
    for (i, path) in paths.iter().enumerate() {
        content.push_str(&format!("### {}. {}\n\n", i + 1, path.focus));
        write_outputs(&mut content, path);
    }

    let with_output = paths.iter().filter(|p| p.latest_output().is_some()).count();
    content.push_str("## Conclusion\n\n");
    content.push_str(&format!(
        "{} of {} paths contributed findings.\n",
        with_output,
        paths.len()
    ));

    Merged {
        content,
        confidence: synthesis_confidence(paths),
    }
}

pub fn voting(paths: &[&ResearchPath]) -> Merged {
    let n = paths.len();
    let required = (n + 1) / 2;

    // Greedy clustering against each cluster's first sentence.
    let mut clusters: Vec<Cluster> = Vec::new();
    for (idx, path) in paths.iter().enumerate() {
        for sentence in path.outputs().flat_map(sentences) {
            let words = tokens(&sentence);
            if words.is_empty() {
                continue;
            }
            match clusters
                .iter_mut()
                .find(|c| jaccard(&c.words, &words) > VOTING_OVERLAP)
            {
                Some(cluster) => {
                    cluster.supporters.insert(idx);
                }
                None => clusters.push(Cluster {
                    claim: sentence,
                    words,
                    supporters: BTreeSet::from([idx]),
                }),
            }
        }
    }

    let mut content = String::from("# Majority Findings\n\n");
    let mut accepted = 0;
    for cluster in clusters.iter().filter(|c| c.supporters.len() >= required) {
        accepted += 1;
        content.push_str(&format!(
            "- {} (supported by {}/{} paths)\n",
            cluster.claim,
            cluster.supporters.len(),
            n
        ));
    }
    if accepted == 0 {
        content.push_str(&format!("No claim was supported by at least {} of {} paths.\n", required, n));
    }

    Merged {
        content,
        confidence: voting_confidence(n),
    }
}

struct Cluster {
    claim: String,
    words: BTreeSet<String>,
    supporters: BTreeSet<usize>,
}

pub fn consensus(paths: &[&ResearchPath], conflicts: &[Conflict]) -> Merged {
    let mut content = String::from("# Consensus View\n\n");
    for path in paths {
        content.push_str(&format!("## {}\n\n", path.focus));
        write_outputs(&mut content, path);
    }

    content.push_str("## Conflicts\n\n");
    if conflicts.is_empty() {
        content.push_str("No conflicts detected.\n");
    }
    for conflict in conflicts {
        content.push_str(&format!(
            "- [{:?}/{:?}] {}: \"{}\" vs \"{}\"\n",
            conflict.conflict_type,
            conflict.severity,
            conflict.description,
            conflict.fact_a.value,
            conflict.fact_b.value
        ));
    }

    Merged {
        content,
        confidence: consensus_confidence(paths, conflicts.len()),
    }
}

pub fn thematic(paths: &[&ResearchPath]) -> Merged {
    let mut content = String::from("# Thematic Analysis\n\n");
    let mut surfaced = 0;

    for theme in THEMES {
        let matching: Vec<(&ResearchPath, Vec<String>)> = paths
            .iter()
            .filter_map(|p| {
                let hits: Vec<String> = p
                    .outputs()
                    .flat_map(sentences)
                    .filter(|s| s.to_lowercase().contains(theme))
                    .collect();
                (!hits.is_empty()).then_some((*p, hits))
            })
            .collect();

        if matching.len() < 2 {
            continue;
        }
        surfaced += 1;
        content.push_str(&format!("## {}\n\n", capitalize(theme)));
        for (path, hits) in matching {
            for hit in hits {
                content.push_str(&format!("- {} ({})\n", hit, path.focus));
            }
        }
        content.push('\n');
    }

    if surfaced == 0 {
        content.push_str("No theme was shared by two or more paths.\n");
    }

    Merged {
        content,
        confidence: synthesis_confidence(paths),
    }
}

pub fn chronological(paths: &[&ResearchPath]) -> Merged {
    let mut ordered: Vec<&ResearchPath> = paths.to_vec();
    ordered.sort_by(|a, b| a.started_at().cmp(&b.started_at()).then_with(|| a.id.cmp(&b.id)));

    let mut content = String::from("# Research Timeline\n\n");
    for (i, path) in ordered.iter().enumerate() {
        content.push_str(&format!(
            "## Phase {}: {} ({})\n\n",
            i + 1,
            path.focus,
            path.started_at().format("%Y-%m-%d %H:%M:%S")
        ));
        write_outputs(&mut content, path);
    }

    Merged {
        content,
        confidence: synthesis_confidence(paths),
    }
}

/// Conflicts among the source paths.
///
/// Structured facts go through the fact comparator. Paths without facts
/// contribute their output sentences as free-text claims, compared with the
/// antonym rule across paths.
pub fn collect_conflicts(paths: &[&ResearchPath], tolerance: &ConflictTolerance) -> Vec<Conflict> {
    let facts: Vec<Fact> = paths.iter().flat_map(|p| p.facts().cloned()).collect();
    let claims: Vec<Fact> = paths
        .iter()
        .filter(|p| p.facts().next().is_none())
        .flat_map(|p| {
            p.outputs()
                .flat_map(sentences)
                .map(|s| Fact::new(p.focus.clone(), "claim", s).with_source(Source::from_url(p.id.clone())))
                .collect::<Vec<_>>()
        })
        .collect();

    let mut conflicts = detect_conflicts(&facts, tolerance);
    conflicts.extend(contradicting_claims(&claims));
    for (i, conflict) in conflicts.iter_mut().enumerate() {
        conflict.id = format!("conflict-{}", i + 1);
    }
    conflicts
}

fn write_outputs(content: &mut String, path: &ResearchPath) {
    let mut any = false;
    for output in path.outputs() {
        any = true;
        content.push_str(&format!("{}\n\n", output.trim()));
    }
    if !any {
        content.push_str("_No findings recorded._\n\n");
    }
}

/// Split text into trimmed sentences.
pub(crate) fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
