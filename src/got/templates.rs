//! Domain templates, subtopics and refinement qualifiers used to seed paths.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::GenerationStrategy;

/// A weighted research angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainTemplate {
    pub focus: &'static str,
    pub weight: f64,
    pattern: &'static str,
    pub source_hints: &'static [&'static str],
}

impl DomainTemplate {
    /// Search query for `topic` from this template.
    pub fn query(&self, topic: &str) -> String {
        self.pattern.replace("{topic}", topic.trim())
    }

    /// Initial path score, `weight * 10`.
    pub fn initial_score(&self) -> f64 {
        self.weight * 10.0
    }
}

/// Templates in descending weight order.
pub const TEMPLATES: [DomainTemplate; 5] = [
    DomainTemplate {
        focus: "Academic Research",
        weight: 0.30,
        pattern: "{topic} academic papers peer-reviewed research",
        source_hints: &["scholar.google.com", "arxiv.org", "pubmed.ncbi.nlm.nih.gov"],
    },
    DomainTemplate {
        focus: "Industry Practices",
        weight: 0.25,
        pattern: "{topic} industry report case study",
        source_hints: &["gartner.com", "mckinsey.com", "forrester.com"],
    },
    DomainTemplate {
        focus: "Policy & Governance",
        weight: 0.20,
        pattern: "{topic} policy regulation governance",
        source_hints: &[".gov", "oecd.org", "europa.eu"],
    },
    DomainTemplate {
        focus: "Technical Implementation",
        weight: 0.15,
        pattern: "{topic} technical documentation specification",
        source_hints: &["github.com", "ieee.org", "acm.org"],
    },
    DomainTemplate {
        focus: "News & Current Events",
        weight: 0.10,
        pattern: "{topic} news analysis recent trends",
        source_hints: &["reuters.com", "bloomberg.com", "apnews.com"],
    },
];

/// Subtopics appended round-robin so sibling paths stay textually distinct.
pub const SUBTOPICS: [&str; 8] = [
    "overview",
    "technical detail",
    "applications",
    "limitations",
    "future directions",
    "case studies",
    "best practices",
    "comparative analysis",
];

/// Qualifiers prepended by feedback-free refinement, indexed by current depth.
pub const QUALIFIERS: [&str; 7] = [
    "detailed analysis of",
    "in-depth study on",
    "comprehensive review of",
    "critical evaluation of",
    "empirical evidence for",
    "expert perspectives on",
    "recent developments in",
];

/// Qualifier for a path currently at `depth`.
pub fn qualifier(depth: u32) -> &'static str {
    QUALIFIERS[depth as usize % QUALIFIERS.len()]
}

/// Subtopic for the `n`th path created in a graph.
pub fn subtopic(n: u64) -> &'static str {
    SUBTOPICS[(n % SUBTOPICS.len() as u64) as usize]
}

/// Pick the templates for `k` new paths.
///
/// Orthogonal ignores `k` and returns every template once. Exploratory
/// order depends only on `seed`.
pub fn select(strategy: GenerationStrategy, k: usize, seed: u64) -> Vec<&'static DomainTemplate> {
    match strategy {
        GenerationStrategy::Diverse | GenerationStrategy::Focused => {
            (0..k).map(|i| &TEMPLATES[i % TEMPLATES.len()]).collect()
        }
        GenerationStrategy::Exploratory => {
            let mut order: Vec<&DomainTemplate> = TEMPLATES.iter().collect();
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
            (0..k).map(|i| order[i % order.len()]).collect()
        }
        GenerationStrategy::Orthogonal => TEMPLATES.iter().collect(),
    }
}

/// FNV-1a hash, stable across runs and platforms.
pub fn stable_seed(text: &str, salt: u64) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET ^ salt;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
