//! Deterministic, explainable alerting.
//!
//! Rules are pure functions evaluated after the model score is computed;
//! any of them can fire independently of the learned score, and several may
//! fire for the same reading. All hits are recorded — there is no
//! first-match suppression — but when only one slot can be surfaced
//! upstream, [`primary_hit`] picks the winner by severity, with the rule
//! family order breaking ties (hard physical violations outrank heuristics).

pub mod rules;

pub use rules::{evaluate_rules, RuleContext};

/// One triggered rule: what fired, how bad, and why — with the reason
/// built deterministically from the triggering condition.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    /// Stable rule identifier ("physical_bound", "sudden_delta", …).
    pub kind: &'static str,
    /// Normalized to [0, 1]; 1.0 is reserved for hard bound violations.
    pub severity: f64,
    pub reason: String,
    pub payload: serde_json::Value,
}

/// The hit to surface when only one can be shown. Highest severity wins;
/// on a tie the earlier hit wins, and `evaluate_rules` emits hits in fixed
/// family order (physical_bound, sudden_delta, tod_implausible,
/// model_outlier).
pub fn primary_hit(hits: &[RuleHit]) -> Option<&RuleHit> {
    hits.iter().reduce(|best, h| if h.severity > best.severity { h } else { best })
}
