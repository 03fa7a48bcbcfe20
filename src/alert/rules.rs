//! The rule families.
//!
//! Each rule sees the reading, its features, the neighbor signal, and the
//! model score, and decides on its own — a bound violation alerts even when
//! the model is cold and scoring near zero. Thresholds come from validated
//! `Settings`, never from constants buried here.

use serde_json::json;

use crate::alert::RuleHit;
use crate::config::Settings;
use crate::features::FeatureRecord;
use crate::model::{Metric, Reading};
use crate::neighbors::NeighborSignal;

/// Everything a rule may look at. Borrowed from the engine's tick state;
/// rules never touch the store or the clock.
pub struct RuleContext<'a> {
    pub reading: &'a Reading,
    pub features: &'a FeatureRecord,
    pub neighbor: Option<&'a NeighborSignal>,
    pub model_score: f64,
    pub method: &'a str,
    /// Local hour-of-day at the station network (0..=23), derived from the
    /// reading timestamp and the configured UTC offset.
    pub local_hour: u8,
}

/// Evaluate every rule family, in fixed order. All hits are returned; the
/// caller records each one.
pub fn evaluate_rules(ctx: &RuleContext<'_>, settings: &Settings) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    if let Some(hit) = physical_bound(ctx, settings) {
        hits.push(hit);
    }
    if let Some(hit) = sudden_delta(ctx, settings) {
        hits.push(hit);
    }
    if let Some(hit) = tod_implausible(ctx, settings) {
        hits.push(hit);
    }
    if let Some(hit) = model_outlier(ctx, settings) {
        hits.push(hit);
    }
    hits
}

// ---------------------------------------------------------------------------
// physical_bound
// ---------------------------------------------------------------------------

/// Hard physical limits. A sensor reporting −5 mm of rain or 150 % humidity
/// is broken no matter what any statistic says, so severity is pinned to
/// the maximum and nothing else is consulted.
fn physical_bound(ctx: &RuleContext<'_>, settings: &Settings) -> Option<RuleHit> {
    let t = settings.thresholds.for_metric(ctx.reading.metric);
    let value = ctx.reading.value;

    let violated_bound = match (t.physical_min, t.physical_max) {
        (Some(lo), _) if value < lo => Some(("minimum", lo)),
        (_, Some(hi)) if value > hi => Some(("maximum", hi)),
        _ => None,
    };
    let (side, bound) = violated_bound?;

    Some(RuleHit {
        kind: "physical_bound",
        severity: 1.0,
        reason: format!(
            "{} reading {:.2} violates physical {} {:.2}",
            ctx.reading.metric, value, side, bound
        ),
        payload: json!({ "value": value, "bound": bound, "side": side }),
    })
}

// ---------------------------------------------------------------------------
// sudden_delta
// ---------------------------------------------------------------------------

/// One-tick jump beyond the metric's threshold. The delta comes from the
/// feature extractor, so wind direction compares along the shortest arc.
/// Severity reaches 1.0 at twice the threshold.
fn sudden_delta(ctx: &RuleContext<'_>, settings: &Settings) -> Option<RuleHit> {
    let delta = ctx.features.delta?;
    let threshold = settings.thresholds.for_metric(ctx.reading.metric).sudden_delta;
    if delta.abs() < threshold {
        return None;
    }

    Some(RuleHit {
        kind: "sudden_delta",
        severity: (delta.abs() / (2.0 * threshold)).min(1.0),
        reason: format!(
            "{} jumped {:+.2} in one tick (threshold {:.2})",
            ctx.reading.metric, delta, threshold
        ),
        payload: json!({ "delta": delta, "threshold": threshold, "value": ctx.reading.value }),
    })
}

// ---------------------------------------------------------------------------
// tod_implausible
// ---------------------------------------------------------------------------

/// Temperature outside the expected envelope for the local hour — 34 °C at
/// 3 am is suspect even if the rolling statistics have drifted along with
/// the faulty sensor. Severity grows with the excess relative to the
/// bucket's width.
fn tod_implausible(ctx: &RuleContext<'_>, settings: &Settings) -> Option<RuleHit> {
    if ctx.reading.metric != Metric::Temperature {
        return None;
    }
    let (lo, hi) = settings.tod_range(ctx.local_hour)?;
    let value = ctx.reading.value;

    let (side, bound, excess) = if value > hi {
        ("above", hi, value - hi)
    } else if value < lo {
        ("below", lo, lo - value)
    } else {
        return None;
    };

    Some(RuleHit {
        kind: "tod_implausible",
        severity: (0.5 + excess / (hi - lo)).min(1.0),
        reason: format!(
            "temperature {:.1} is {} the expected bound {:.1} for local hour {:02}",
            value, side, bound, ctx.local_hour
        ),
        payload: json!({
            "value": value,
            "expected_min": lo,
            "expected_max": hi,
            "local_hour": ctx.local_hour,
        }),
    })
}

// ---------------------------------------------------------------------------
// model_outlier
// ---------------------------------------------------------------------------

/// The learned score crossed the metric's alert threshold. Severity is the
/// score itself, which both backends keep inside [0, 1].
fn model_outlier(ctx: &RuleContext<'_>, settings: &Settings) -> Option<RuleHit> {
    let threshold = settings.thresholds.for_metric(ctx.reading.metric).model_score;
    if ctx.model_score < threshold {
        return None;
    }

    Some(RuleHit {
        kind: "model_outlier",
        severity: ctx.model_score.clamp(0.0, 1.0),
        reason: format!(
            "outlier score {:.2} at or above threshold {:.2} (method {})",
            ctx.model_score, threshold, ctx.method
        ),
        payload: json!({
            "score": ctx.model_score,
            "threshold": threshold,
            "method": ctx.method,
            "neighbor_gap": ctx.neighbor.map(|n| n.gap),
            "neighbor_count": ctx.neighbor.map(|n| n.neighbor_count),
        }),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
