//! Structured fact records and the collaborator seams the research core calls.
//!
//! Fact and entity extraction, and source rating, are performed by external
//! tools. The core only depends on well-typed [`Fact`] records, the
//! [`FactExtractor`] and [`SourceRater`] traits, and the conflict comparator
//! in [`conflict`].

pub mod conflict;

pub use conflict::{
    contradicting_claims, contradicts, detect_conflicts, Conflict, ConflictSeverity, ConflictTolerance,
    ConflictType, PreferredFact, Resolution, ResolutionStatus,
};

use serde::{Deserialize, Serialize};

/// Kind of value a fact carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    Date,
    Percentage,
    Currency,
    #[default]
    Text,
}

impl ValueType {
    /// Whether values of this type compare numerically.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueType::Number | ValueType::Percentage | ValueType::Currency
        )
    }
}

/// Extraction confidence attached to a fact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactConfidence {
    High,
    #[default]
    Medium,
    Low,
}

impl FactConfidence {
    /// Numeric weight used when ranking or comparing facts.
    pub fn weight(&self) -> f64 {
        match self {
            FactConfidence::High => 1.0,
            FactConfidence::Medium => 0.5,
            FactConfidence::Low => 0.2,
        }
    }
}

/// Where a fact came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Letter grade A (best) to E (worst) assigned by the source rater.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

impl Source {
    /// Source identified by URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Set the quality grade
    pub fn with_quality(mut self, grade: impl Into<String>) -> Self {
        self.quality = Some(grade.into());
        self
    }

    /// Set the title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Stable key used to tell sources apart (URL, then title).
    pub fn key(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or(self.title.as_deref())
            .filter(|k| !k.trim().is_empty())
    }

    /// Whether the source is concrete enough to count as a citation.
    pub fn is_citable(&self) -> bool {
        self.key().is_some()
    }
}

/// A structured claim: `entity.attribute = value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub entity: String,
    pub attribute: String,
    pub value: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub confidence: FactConfidence,
    #[serde(default)]
    pub source: Source,
}

impl Fact {
    /// Create a text fact with medium confidence and no source.
    pub fn new(
        entity: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            attribute: attribute.into(),
            value: value.into(),
            value_type: ValueType::Text,
            confidence: FactConfidence::Medium,
            source: Source::default(),
        }
    }

    /// Set the value type
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Set the confidence
    pub fn with_confidence(mut self, confidence: FactConfidence) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set the source
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Human-readable statement used by the textual contradiction rule.
    pub fn statement(&self) -> String {
        format!("{} {} {}", self.entity, self.attribute, self.value)
    }
}

/// A named entity reported by the extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub mention_count: u32,
}

/// Output of the extraction collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub facts: Vec<Fact>,
    pub entities: Vec<Entity>,
}

/// External fact/entity extraction tool.
pub trait FactExtractor: Send + Sync {
    /// Extract structured facts and entities from `text` attributed to `source`.
    fn extract(&self, text: &str, source: &Source) -> Extraction;
}

/// External source rating tool, returning a quality score in 0-10.
pub trait SourceRater: Send + Sync {
    fn rate(&self, source: &Source) -> f64;
}

/// Rates sources from the letter grade already attached to them.
///
/// A=10, B=8, C=6, D=4, E=2; ungraded sources score 5.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradeRater;

impl SourceRater for GradeRater {
    fn rate(&self, source: &Source) -> f64 {
        grade_score(source.quality.as_deref())
    }
}

/// Map a letter grade to a 0-10 score.
pub fn grade_score(grade: Option<&str>) -> f64 {
    match grade.map(|g| g.trim().to_ascii_uppercase()).as_deref() {
        Some("A") => 10.0,
        Some("B") => 8.0,
        Some("C") => 6.0,
        Some("D") => 4.0,
        Some("E") => 2.0,
        _ => 5.0,
    }
}
