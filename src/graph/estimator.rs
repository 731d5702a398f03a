//! Deterministic estimation heuristics
//!
//! When a task arrives without a PERT triple and auto-estimation is on, the
//! estimator derives one from the description: base hours scale with word
//! count, boosted by occurrences of complexity and technical keywords, and
//! clamped to a sane band. Required capabilities come from a fixed
//! keyword-to-capability table, defaulting to code generation.

use crate::models::{Capability, EstimateSource, TaskEstimate};

/// Terms that signal inherent problem complexity: +0.1 per occurrence.
static COMPLEXITY_KEYWORDS: &[&str] = &[
    "complex",
    "distributed",
    "concurrent",
    "scalable",
    "legacy",
    "migration",
    "refactor",
    "integration",
    "optimize",
    "realtime",
    "multi-tenant",
    "transactional",
];

/// Terms that signal technical surface area: +0.2 per occurrence.
static TECHNICAL_KEYWORDS: &[&str] = &[
    "database",
    "api",
    "authentication",
    "authorization",
    "kubernetes",
    "websocket",
    "cache",
    "queue",
    "encryption",
    "oauth",
    "grpc",
    "sharding",
    "replication",
    "index",
    "protocol",
];

/// Fixed keyword-to-capability mapping for deriving required capabilities.
static CAPABILITY_KEYWORDS: &[(&str, Capability)] = &[
    ("design", Capability::SystemDesign),
    ("architecture", Capability::SystemDesign),
    ("schema", Capability::DataModeling),
    ("model", Capability::DataModeling),
    ("api", Capability::ApiDesign),
    ("endpoint", Capability::ApiDesign),
    ("test", Capability::TestGeneration),
    ("coverage", Capability::TestGeneration),
    ("review", Capability::CodeReview),
    ("security", Capability::SecurityAudit),
    ("audit", Capability::SecurityAudit),
    ("debug", Capability::Debugging),
    ("fix", Capability::Debugging),
    ("refactor", Capability::Refactoring),
    ("performance", Capability::PerformanceTuning),
    ("optimize", Capability::PerformanceTuning),
    ("deploy", Capability::Deployment),
    ("monitor", Capability::Monitoring),
    ("document", Capability::Documentation),
    ("migrate", Capability::Migration),
    ("integrate", Capability::Integration),
    ("ui", Capability::UiImplementation),
    ("frontend", Capability::UiImplementation),
    ("research", Capability::Research),
    ("investigate", Capability::Research),
];

const MIN_HOURS: f64 = 1.0;
const MAX_HOURS: f64 = 24.0;

fn occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

/// Complexity multiplier: 1.0 plus keyword boosts.
fn complexity_score(text: &str) -> f64 {
    let mut score = 1.0;
    for keyword in COMPLEXITY_KEYWORDS {
        score += 0.1 * occurrences(text, keyword) as f64;
    }
    for keyword in TECHNICAL_KEYWORDS {
        score += 0.2 * occurrences(text, keyword) as f64;
    }
    score
}

/// Derive a PERT estimate from free text.
///
/// likely = clamp(word_count / 100 * complexity_score, 1, 24); the
/// optimistic and pessimistic bounds spread to half and double of it.
pub fn auto_estimate(title: &str, description: &str) -> TaskEstimate {
    let text = format!("{title} {description}").to_lowercase();
    let word_count = text.split_whitespace().count();
    let likely = ((word_count as f64 / 100.0) * complexity_score(&text)).clamp(MIN_HOURS, MAX_HOURS);

    let mut estimate = TaskEstimate::new(likely * 0.5, likely, likely * 2.0, EstimateSource::Default);
    estimate.confidence = 0.3;
    estimate.required_capabilities = infer_capabilities(&text);
    estimate
}

/// Match description tokens against the capability table; empty results
/// default to CODE_GENERATION.
pub fn infer_capabilities(text: &str) -> Vec<Capability> {
    let lowered = text.to_lowercase();
    let mut capabilities = Vec::new();
    for (keyword, capability) in CAPABILITY_KEYWORDS {
        if lowered.contains(keyword) && !capabilities.contains(capability) {
            capabilities.push(*capability);
        }
    }
    if capabilities.is_empty() {
        capabilities.push(Capability::CodeGeneration);
    }
    capabilities
}
