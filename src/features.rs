//! Feature extraction: one reading plus its history window in, one robust
//! feature record out.
//!
//! Everything here is a pure function of its arguments — no store access,
//! no clock — so the whole module is trivially testable and the engine can
//! hand it whatever window it likes. Statistics are robust by construction:
//! spreads are floored per metric so no divisor is ever zero, the central
//! estimate is the median (MAD-normalized), and wind direction goes through
//! circular statistics because 0° and 360° are the same heading.

use crate::model::{Metric, Reading};

// ---------------------------------------------------------------------------
// Feature record
// ---------------------------------------------------------------------------

/// Features for one (station, metric, timestamp), derived from the reading
/// value and its prior history window.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    /// Window mean; for wind direction the circular mean in [0, 360).
    pub mean: f64,
    /// Window population std; for wind direction the circular std (degrees).
    pub std: f64,
    /// Classical z-score against the (floored) window std.
    pub z: f64,
    /// Median/MAD z-score; equals `z` for circular metrics, where both are
    /// the normalized angular deviation from the circular mean.
    pub z_robust: f64,
    /// Change from the previous chronological reading (shortest signed arc
    /// for wind direction). `None` on the first-ever reading.
    pub delta: Option<f64>,
    /// Mean absolute step-to-step change over the window, a cheap
    /// volatility measure fed to the outlier model.
    pub rolling_vol: f64,
    /// How many history samples backed the statistics.
    pub window_len: usize,
}

impl FeatureRecord {
    /// Neutral features: what a cold-start or degenerate window produces.
    /// Zero z-scores mean "nothing unusual", which is the only honest
    /// statement when there is no history to compare against.
    fn neutral(mean: f64, std: f64, delta: Option<f64>, window_len: usize) -> FeatureRecord {
        FeatureRecord { mean, std, z: 0.0, z_robust: 0.0, delta, rolling_vol: 0.0, window_len }
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Compute features for `value` against its chronological history `window`
/// (readings strictly before the target, oldest first).
///
/// `sigma_floor` is the metric's configured spread floor; `min_window` is
/// the sample count below which statistics stay neutral rather than being
/// computed from noise.
pub fn extract(
    metric: Metric,
    value: f64,
    window: &[Reading],
    sigma_floor: f64,
    min_window: usize,
) -> FeatureRecord {
    let values: Vec<f64> = window.iter().map(|r| r.value).collect();
    if metric.is_circular() {
        extract_circular(value, &values, sigma_floor, min_window)
    } else {
        extract_linear(value, &values, sigma_floor, min_window)
    }
}

fn extract_linear(value: f64, window: &[f64], floor: f64, min_window: usize) -> FeatureRecord {
    let n = window.len();
    let delta = window.last().map(|&prev| value - prev);

    let mean = if n > 0 { window.iter().sum::<f64>() / n as f64 } else { value };
    let std = if n > 0 {
        (window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
    } else {
        0.0
    };

    if n < min_window {
        return FeatureRecord::neutral(mean, std, delta, n);
    }

    let med = median(window);
    let mad = median(&window.iter().map(|v| (v - med).abs()).collect::<Vec<_>>());

    let sigma = std.max(floor);
    // Degenerate window (MAD exactly zero): fall back to the classical
    // mean/std estimate, so a constant window yields exactly 0.
    let z_robust = if mad > 0.0 {
        (value - med) / (1.4826 * mad).max(floor)
    } else {
        (value - mean) / sigma
    };

    FeatureRecord {
        mean,
        std,
        z: (value - mean) / sigma,
        z_robust,
        delta,
        rolling_vol: rolling_vol_linear(window, value),
        window_len: n,
    }
}

fn extract_circular(value: f64, window: &[f64], floor: f64, min_window: usize) -> FeatureRecord {
    let n = window.len();
    let delta = window.last().map(|&prev| angular_difference_deg(value, prev));

    if n < min_window {
        let mean = if n > 0 { circular_mean_deg(window) } else { value.rem_euclid(360.0) };
        return FeatureRecord::neutral(mean, 0.0, delta, n);
    }

    let (mean_sin, mean_cos) = window
        .iter()
        .map(|v| v.to_radians())
        .fold((0.0, 0.0), |(s, c), rad| (s + rad.sin(), c + rad.cos()));
    let (mean_sin, mean_cos) = (mean_sin / n as f64, mean_cos / n as f64);

    let mu = mean_sin.atan2(mean_cos).to_degrees().rem_euclid(360.0);
    // Resultant length R: 1 = all angles agree, 0 = uniform scatter.
    let r = (mean_sin * mean_sin + mean_cos * mean_cos).sqrt().clamp(1e-9, 1.0);
    let circ_std = (-2.0 * r.ln()).sqrt().to_degrees();

    let deviation = angular_difference_deg(value, mu) / circ_std.max(floor);

    FeatureRecord {
        mean: mu,
        std: circ_std,
        z: deviation,
        z_robust: deviation,
        delta,
        rolling_vol: rolling_vol_circular(window, value),
        window_len: n,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Shortest signed angular difference a − b, in (−180, 180].
pub fn angular_difference_deg(a: f64, b: f64) -> f64 {
    (a - b + 180.0).rem_euclid(360.0) - 180.0
}

/// Circular mean of angles in degrees, result in [0, 360).
pub fn circular_mean_deg(values: &[f64]) -> f64 {
    let (s, c) = values
        .iter()
        .map(|v| v.to_radians())
        .fold((0.0, 0.0), |(s, c), rad| (s + rad.sin(), c + rad.cos()));
    s.atan2(c).to_degrees().rem_euclid(360.0)
}

/// Median of an unsorted slice. Empty slices return 0 — callers guard on
/// window length before relying on the value.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 { (sorted[mid - 1] + sorted[mid]) / 2.0 } else { sorted[mid] }
}

fn rolling_vol_linear(window: &[f64], value: f64) -> f64 {
    let mut deltas: Vec<f64> = window.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    if let Some(&last) = window.last() {
        deltas.push((value - last).abs());
    }
    if deltas.is_empty() { 0.0 } else { deltas.iter().sum::<f64>() / deltas.len() as f64 }
}

fn rolling_vol_circular(window: &[f64], value: f64) -> f64 {
    let mut deltas: Vec<f64> =
        window.windows(2).map(|w| angular_difference_deg(w[1], w[0]).abs()).collect();
    if let Some(&last) = window.last() {
        deltas.push(angular_difference_deg(value, last).abs());
    }
    if deltas.is_empty() { 0.0 } else { deltas.iter().sum::<f64>() / deltas.len() as f64 }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
