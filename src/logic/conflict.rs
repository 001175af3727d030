//! Pairwise comparison of fact records for contradictions.
//!
//! Structured facts are compared per entity and attribute: numeric values by
//! relative difference, dates by day distance, and text values by a fixed
//! antonym list. Free-text claims without structure only go through the
//! antonym rule. The textual rule is intentionally shallow; it is word
//! matching, not entailment.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{grade_score, Fact, FactConfidence, ValueType};

/// Antonym pairs that mark two statements as contradictory.
pub const ANTONYM_PAIRS: [(&str, &str); 7] = [
    ("yes", "no"),
    ("true", "false"),
    ("effective", "ineffective"),
    ("increases", "decreases"),
    ("supports", "opposes"),
    ("beneficial", "harmful"),
    ("significant", "negligible"),
];

/// Tolerance settings for conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictTolerance {
    /// Relative difference allowed between numeric values (0.1 = 10%).
    #[serde(default = "default_numeric_tolerance")]
    pub numeric_tolerance: f64,
    /// Days allowed between date values.
    #[serde(default = "default_date_tolerance_days")]
    pub date_tolerance_days: i64,
    /// Skip pairs where both facts have low confidence.
    #[serde(default = "default_ignore_low_confidence")]
    pub ignore_low_confidence: bool,
}

fn default_numeric_tolerance() -> f64 {
    0.1
}

fn default_date_tolerance_days() -> i64 {
    30
}

fn default_ignore_low_confidence() -> bool {
    true
}

impl Default for ConflictTolerance {
    fn default() -> Self {
        Self {
            numeric_tolerance: default_numeric_tolerance(),
            date_tolerance_days: default_date_tolerance_days(),
            ignore_low_confidence: default_ignore_low_confidence(),
        }
    }
}

/// Kind of disagreement between two facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Numerical,
    Temporal,
    Factual,
    Contradictory,
}

/// How much a conflict should weigh on confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

/// Whether a conflict has been acted upon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    Unresolved,
    Resolved,
    Dismissed,
}

/// Which side of a conflict the suggestion prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredFact {
    A,
    B,
    Neither,
}

/// Suggested resolution for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: String,
    pub preferred: PreferredFact,
    pub reasoning: String,
}

/// A detected conflict between two facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub fact_a: Fact,
    pub fact_b: Fact,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    /// Confidence that this is a real conflict (0.0-1.0).
    pub confidence: f64,
    pub description: String,
    pub resolution: Resolution,
    #[serde(default)]
    pub status: ResolutionStatus,
}

/// Find conflicts between structured facts.
///
/// Facts are grouped by case-folded entity; within a group every pair that
/// shares an attribute but reports a different value is classified.
pub fn detect_conflicts(facts: &[Fact], tolerance: &ConflictTolerance) -> Vec<Conflict> {
    let mut by_entity: BTreeMap<String, Vec<&Fact>> = BTreeMap::new();
    for fact in facts {
        by_entity
            .entry(fact.entity.trim().to_lowercase())
            .or_default()
            .push(fact);
    }

    let mut conflicts = Vec::new();
    for group in by_entity.values() {
        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                if tolerance.ignore_low_confidence
                    && a.confidence == FactConfidence::Low
                    && b.confidence == FactConfidence::Low
                {
                    continue;
                }
                if let Some(mut conflict) = compare_pair(a, b, tolerance) {
                    conflict.id = format!("conflict-{}", conflicts.len() + 1);
                    conflicts.push(conflict);
                }
            }
        }
    }
    conflicts
}

/// Find contradictions between free-text claims from different sources.
pub fn contradicting_claims(claims: &[Fact]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for (i, a) in claims.iter().enumerate() {
        for b in &claims[i + 1..] {
            if a.source.key().is_some() && a.source.key() == b.source.key() {
                continue;
            }
            if contradicts(&a.value, &b.value) {
                conflicts.push(Conflict {
                    id: format!("conflict-{}", conflicts.len() + 1),
                    fact_a: a.clone(),
                    fact_b: b.clone(),
                    conflict_type: ConflictType::Contradictory,
                    severity: confidence_severity(a, b),
                    confidence: 0.6,
                    description: "Claims contain opposing terms".to_string(),
                    resolution: suggest_resolution(a, b),
                    status: ResolutionStatus::Unresolved,
                });
            }
        }
    }
    conflicts
}

/// Whether two statements contain a matched antonym pair.
pub fn contradicts(a: &str, b: &str) -> bool {
    let words_a = words(a);
    let words_b = words(b);
    ANTONYM_PAIRS.iter().any(|(x, y)| {
        (words_a.contains(*x) && words_b.contains(*y)) || (words_a.contains(*y) && words_b.contains(*x))
    })
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn compare_pair(a: &Fact, b: &Fact, tolerance: &ConflictTolerance) -> Option<Conflict> {
    if !a.attribute.trim().eq_ignore_ascii_case(b.attribute.trim()) {
        return None;
    }
    let value_a = a.value.trim();
    let value_b = b.value.trim();
    if value_a.eq_ignore_ascii_case(value_b) {
        return None;
    }

    if a.value_type.is_numeric() || b.value_type.is_numeric() {
        if let (Some(x), Some(y)) = (numeric_value(value_a), numeric_value(value_b)) {
            return numeric_conflict(a, b, x, y, tolerance);
        }
    }

    if a.value_type == ValueType::Date || b.value_type == ValueType::Date {
        if let Some(days) = day_distance(value_a, value_b) {
            if days <= tolerance.date_tolerance_days {
                return None;
            }
            let severity = if days > 365 {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Medium
            };
            return Some(build(
                a,
                b,
                ConflictType::Temporal,
                severity,
                0.7,
                format!("Dates differ by {} days", days),
            ));
        }
    }

    if contradicts(&a.statement(), &b.statement()) {
        return Some(build(
            a,
            b,
            ConflictType::Contradictory,
            confidence_severity(a, b),
            0.7,
            "Facts have contradictory values for the same attribute".to_string(),
        ));
    }

    Some(build(
        a,
        b,
        ConflictType::Factual,
        ConflictSeverity::Medium,
        0.5,
        "Facts report different values for the same entity and attribute".to_string(),
    ))
}

fn numeric_conflict(
    a: &Fact,
    b: &Fact,
    x: f64,
    y: f64,
    tolerance: &ConflictTolerance,
) -> Option<Conflict> {
    let scale = x.abs().max(y.abs());
    if scale == 0.0 {
        return None;
    }
    let diff = (x - y).abs() / scale;
    if diff <= tolerance.numeric_tolerance {
        return None;
    }
    let severity = if diff > 0.5 {
        ConflictSeverity::High
    } else if diff < 0.2 {
        ConflictSeverity::Low
    } else {
        ConflictSeverity::Medium
    };
    Some(build(
        a,
        b,
        ConflictType::Numerical,
        severity,
        0.8,
        format!("Numeric values differ by {:.0}%", diff * 100.0),
    ))
}

fn build(
    a: &Fact,
    b: &Fact,
    conflict_type: ConflictType,
    severity: ConflictSeverity,
    confidence: f64,
    description: String,
) -> Conflict {
    Conflict {
        id: String::new(),
        fact_a: a.clone(),
        fact_b: b.clone(),
        conflict_type,
        severity,
        confidence,
        description,
        resolution: suggest_resolution(a, b),
        status: ResolutionStatus::Unresolved,
    }
}

/// Parse the first number in a value, honouring magnitude suffixes.
pub(crate) fn numeric_value(value: &str) -> Option<f64> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| {
        Regex::new(r"(?i)(-?\d+(?:\.\d+)?)\s*(billion|bn|million|mn|thousand|[bmk])?\b")
            .expect("static regex is valid")
    });
    let cleaned = value.replace([',', '$', '%'], "");
    let caps = re.captures(&cleaned)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_lowercase()).as_deref() {
        Some("billion" | "bn" | "b") => 1e9,
        Some("million" | "mn" | "m") => 1e6,
        Some("thousand" | "k") => 1e3,
        _ => 1.0,
    };
    Some(number * multiplier)
}

fn day_distance(a: &str, b: &str) -> Option<i64> {
    if let (Some(x), Some(y)) = (parse_date(a), parse_date(b)) {
        return Some((x - y).num_days().abs());
    }
    let (x, y) = (extract_year(a)?, extract_year(b)?);
    Some((x - y).abs() * 365)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

fn extract_year(value: &str) -> Option<i64> {
    static YEAR: OnceLock<Regex> = OnceLock::new();
    let re = YEAR.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").expect("static regex is valid"));
    re.find(value)?.as_str().parse().ok()
}

fn confidence_severity(a: &Fact, b: &Fact) -> ConflictSeverity {
    let avg = (a.confidence.weight() + b.confidence.weight()) / 2.0;
    if avg > 0.7 {
        ConflictSeverity::High
    } else if avg > 0.4 {
        ConflictSeverity::Medium
    } else {
        ConflictSeverity::Low
    }
}

fn suggest_resolution(a: &Fact, b: &Fact) -> Resolution {
    let quality_a = grade_score(a.source.quality.as_deref());
    let quality_b = grade_score(b.source.quality.as_deref());
    if quality_a != quality_b {
        let preferred = if quality_a > quality_b {
            PreferredFact::A
        } else {
            PreferredFact::B
        };
        return Resolution {
            strategy: "prefer_higher_quality".to_string(),
            preferred,
            reasoning: "One fact comes from a higher quality source".to_string(),
        };
    }

    let conf_a = a.confidence.weight();
    let conf_b = b.confidence.weight();
    if conf_a != conf_b {
        let preferred = if conf_a > conf_b {
            PreferredFact::A
        } else {
            PreferredFact::B
        };
        return Resolution {
            strategy: "prefer_higher_confidence".to_string(),
            preferred,
            reasoning: "One fact was extracted with higher confidence".to_string(),
        };
    }

    Resolution {
        strategy: "manual_review".to_string(),
        preferred: PreferredFact::Neither,
        reasoning: "Both facts have similar credibility".to_string(),
    }
}
