//! Unsupervised outlier scoring with a safe cold-start path.
//!
//! One model lifecycle per metric, all owned by [`ModelPool`]: feature
//! vectors observed during ticks accumulate in a bounded buffer, and once
//! enough samples exist the pool periodically trains a fresh snapshot and
//! swaps it in. Scoring always reads the last successfully trained
//! snapshot; until one exists it falls back to a squashed robust z-score.
//! Both paths consume the exact same feature vector — crossing the
//! training threshold changes the method, never the inputs — and the
//! method that actually produced a score is reported alongside it.
//!
//! Any scoring backend implementing [`ScoringModel`] plugs in without the
//! engine or rules changing; the shipped backends are the isolation-forest
//! ensemble in [`forest`] and the stateless robust-z fallback.

use std::collections::{HashMap, VecDeque};

use crate::config::{ModelBackend, Settings};
use crate::features::FeatureRecord;
use crate::model::Metric;

pub mod forest;

pub use forest::IsolationForest;

// ---------------------------------------------------------------------------
// Feature vectors
// ---------------------------------------------------------------------------

/// Model input dimension: [z, z_robust, delta, rolling_vol, neighbor_gap].
pub const FEATURE_DIM: usize = 5;

pub type FeatureVector = [f64; FEATURE_DIM];

/// Materialize the model input from the feature record and the optional
/// neighbor signal. Missing values (`delta` on a first reading,
/// `neighbor_gap` with too few neighbors) substitute a neutral 0.0, and
/// non-finite values are cleaned the same way; this substitution is the
/// single place it happens, so training and scoring can never disagree.
pub fn feature_vector(features: &FeatureRecord, neighbor_gap: Option<f64>) -> FeatureVector {
    let clean = |v: f64| if v.is_finite() { v } else { 0.0 };
    [
        clean(features.z),
        clean(features.z_robust),
        clean(features.delta.unwrap_or(0.0)),
        clean(features.rolling_vol),
        clean(neighbor_gap.unwrap_or(0.0)),
    ]
}

// ---------------------------------------------------------------------------
// Scoring backend contract
// ---------------------------------------------------------------------------

/// A swappable scoring backend. Higher score = more anomalous, on a scale
/// comparable across calls for the same metric (both shipped backends stay
/// inside [0, 1)).
pub trait ScoringModel: Send {
    fn fit(&mut self, rows: &[FeatureVector]);
    fn score(&self, row: &FeatureVector) -> f64;
    /// Stable method name recorded in Score rows and extras.
    fn method(&self) -> &'static str;
}

/// Stateless fallback: the robust z-score squashed into [0, 1).
///
/// `tanh(z_eff / 3)` maps z_eff = 3 to ~0.76 and saturates near 1 for
/// extreme readings, which keeps the scale roughly aligned with the
/// trained backend's output.
pub struct RobustZModel;

impl ScoringModel for RobustZModel {
    fn fit(&mut self, _rows: &[FeatureVector]) {}

    fn score(&self, row: &[f64; FEATURE_DIM]) -> f64 {
        let z_eff = row[0].abs().max(row[1].abs());
        (z_eff / 3.0).tanh()
    }

    fn method(&self) -> &'static str {
        "z_robust"
    }
}

// ---------------------------------------------------------------------------
// Per-metric lifecycle
// ---------------------------------------------------------------------------

struct MetricState {
    /// Bounded training buffer; oldest vectors evicted first.
    buffer: VecDeque<FeatureVector>,
    /// Last successfully trained snapshot. Scoring only ever reads this,
    /// so a retrain that has not finished cannot tear a read.
    snapshot: Option<Box<dyn ScoringModel>>,
}

impl MetricState {
    fn new() -> Self {
        MetricState { buffer: VecDeque::new(), snapshot: None }
    }
}

/// One scoring lifecycle per metric, so rainfall dynamics never
/// contaminate the temperature model.
pub struct ModelPool {
    backend: ModelBackend,
    min_train_samples: usize,
    retrain_every_ticks: u64,
    buffer_cap: usize,
    fallback: RobustZModel,
    states: HashMap<Metric, MetricState>,
}

impl ModelPool {
    pub fn from_settings(settings: &Settings) -> ModelPool {
        ModelPool {
            backend: settings.model_backend,
            min_train_samples: settings.min_train_samples,
            retrain_every_ticks: settings.retrain_every_ticks,
            buffer_cap: settings.train_buffer_cap,
            fallback: RobustZModel,
            states: HashMap::new(),
        }
    }

    /// Add an observed feature vector to the metric's training buffer.
    /// Called after scoring, so a reading never influences its own score.
    pub fn observe(&mut self, metric: Metric, row: FeatureVector) {
        let state = self.states.entry(metric).or_insert_with(MetricState::new);
        if state.buffer.len() == self.buffer_cap {
            state.buffer.pop_front();
        }
        state.buffer.push_back(row);
    }

    /// Score a feature vector, returning (score, method). Uses the trained
    /// snapshot when one exists, the robust-z fallback otherwise.
    pub fn score(&self, metric: Metric, row: &FeatureVector) -> (f64, &'static str) {
        match self.states.get(&metric).and_then(|s| s.snapshot.as_ref()) {
            Some(model) => (model.score(row), model.method()),
            None => (self.fallback.score(row), self.fallback.method()),
        }
    }

    pub fn is_trained(&self, metric: Metric) -> bool {
        self.states.get(&metric).is_some_and(|s| s.snapshot.is_some())
    }

    pub fn sample_count(&self, metric: Metric) -> usize {
        self.states.get(&metric).map_or(0, |s| s.buffer.len())
    }

    /// Train where due. An untrained metric trains as soon as its buffer
    /// reaches the minimum; a trained one refreshes on the tick cadence.
    /// The new snapshot replaces the old only after `fit` returns, so a
    /// tick never scores against a half-trained model. Returns the metrics
    /// retrained this call.
    pub fn maybe_retrain(&mut self, tick: u64) -> Vec<Metric> {
        if self.backend == ModelBackend::ZRobust {
            // Explicitly configured to never train: the fallback is the model.
            return Vec::new();
        }
        let mut retrained = Vec::new();
        for metric in Metric::ALL {
            let Some(state) = self.states.get_mut(&metric) else { continue };
            if state.buffer.len() < self.min_train_samples {
                continue;
            }
            let due = state.snapshot.is_none() || tick % self.retrain_every_ticks == 0;
            if !due {
                continue;
            }
            let rows: Vec<FeatureVector> = state.buffer.iter().copied().collect();
            let mut model = new_backend(self.backend, metric);
            model.fit(&rows);
            state.snapshot = Some(model);
            retrained.push(metric);
        }
        retrained
    }
}

/// Backend factory. Seeds are fixed per metric so replaying the same
/// readings trains bit-for-bit identical models.
fn new_backend(backend: ModelBackend, metric: Metric) -> Box<dyn ScoringModel> {
    match backend {
        ModelBackend::IsolationForest => {
            let seed = 0x5eed_0000 + metric as u64;
            Box::new(IsolationForest::new(100, 256, seed))
        }
        ModelBackend::ZRobust => Box::new(RobustZModel),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(min_train: usize, cadence: u64) -> ModelPool {
        let mut settings = Settings::default();
        settings.min_train_samples = min_train;
        settings.retrain_every_ticks = cadence;
        ModelPool::from_settings(&settings)
    }

    fn ordinary_row(i: usize) -> FeatureVector {
        let wiggle = (i % 7) as f64 * 0.1;
        [0.2 + wiggle, 0.1 + wiggle, 0.05, 0.3, 0.4]
    }

    #[test]
    fn test_missing_features_substitute_neutral_zero() {
        let features = FeatureRecord {
            mean: 29.0,
            std: 2.0,
            z: 1.0,
            z_robust: 1.2,
            delta: None,
            rolling_vol: 0.5,
            window_len: 10,
        };
        let row = feature_vector(&features, None);
        assert_eq!(row[2], 0.0, "missing delta becomes 0");
        assert_eq!(row[4], 0.0, "missing neighbor_gap becomes 0");
        assert_eq!(row[0], 1.0);
    }

    #[test]
    fn test_non_finite_features_are_cleaned() {
        let features = FeatureRecord {
            mean: 0.0,
            std: 0.0,
            z: f64::INFINITY,
            z_robust: f64::NAN,
            delta: Some(1.0),
            rolling_vol: 0.0,
            window_len: 10,
        };
        let row = feature_vector(&features, Some(2.0));
        assert_eq!(row[0], 0.0);
        assert_eq!(row[1], 0.0);
        assert_eq!(row[2], 1.0);
        assert_eq!(row[4], 2.0);
    }

    #[test]
    fn test_untrained_pool_scores_with_fallback_method() {
        let pool = pool_with(50, 60);
        let (score, method) = pool.score(Metric::Temperature, &[3.0, 3.0, 0.0, 0.0, 0.0]);
        assert_eq!(method, "z_robust");
        assert!((score - (1.0f64).tanh()).abs() < 1e-12, "tanh(3/3) expected, got {}", score);
    }

    #[test]
    fn test_fallback_is_monotone_in_robust_z() {
        let pool = pool_with(50, 60);
        let (low, _) = pool.score(Metric::Humidity, &[0.5, 0.5, 0.0, 0.0, 0.0]);
        let (high, _) = pool.score(Metric::Humidity, &[0.5, 8.0, 0.0, 0.0, 0.0]);
        assert!(high > low);
        assert!(high < 1.0, "fallback stays below 1");
    }

    #[test]
    fn test_training_flips_method_without_changing_inputs() {
        let mut pool = pool_with(10, 1);
        let probe: FeatureVector = [0.3, 0.2, 0.05, 0.3, 0.4];

        for i in 0..9 {
            pool.observe(Metric::Rainfall, ordinary_row(i));
        }
        let (_, method_before) = pool.score(Metric::Rainfall, &probe);
        assert_eq!(method_before, "z_robust");
        assert!(pool.maybe_retrain(1).is_empty(), "below threshold, no training yet");

        pool.observe(Metric::Rainfall, ordinary_row(9));
        let retrained = pool.maybe_retrain(2);
        assert_eq!(retrained, vec![Metric::Rainfall]);

        let (_, method_after) = pool.score(Metric::Rainfall, &probe);
        assert_eq!(
            method_after, "isolation_forest",
            "same probe vector, different method after the threshold"
        );
    }

    #[test]
    fn test_untrained_metric_trains_off_cadence_once_ready() {
        let mut pool = pool_with(5, 1000);
        for i in 0..5 {
            pool.observe(Metric::WindSpeed, ordinary_row(i));
        }
        // tick 3 is not on the cadence, but the metric has never trained
        let retrained = pool.maybe_retrain(3);
        assert_eq!(retrained, vec![Metric::WindSpeed]);
    }

    #[test]
    fn test_metrics_train_independently() {
        let mut pool = pool_with(5, 1);
        for i in 0..5 {
            pool.observe(Metric::Temperature, ordinary_row(i));
        }
        pool.observe(Metric::Rainfall, ordinary_row(0));
        pool.maybe_retrain(1);
        assert!(pool.is_trained(Metric::Temperature));
        assert!(!pool.is_trained(Metric::Rainfall), "rainfall has one sample, stays cold");
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut settings = Settings::default();
        settings.min_train_samples = 2;
        settings.train_buffer_cap = 16;
        let mut pool = ModelPool::from_settings(&settings);
        for i in 0..100 {
            pool.observe(Metric::Humidity, ordinary_row(i));
        }
        assert_eq!(pool.sample_count(Metric::Humidity), 16);
    }

    #[test]
    fn test_z_robust_backend_never_trains() {
        let mut settings = Settings::default();
        settings.model_backend = ModelBackend::ZRobust;
        settings.min_train_samples = 2;
        let mut pool = ModelPool::from_settings(&settings);
        for i in 0..10 {
            pool.observe(Metric::Temperature, ordinary_row(i));
        }
        assert!(pool.maybe_retrain(60).is_empty());
        let (_, method) = pool.score(Metric::Temperature, &ordinary_row(0));
        assert_eq!(method, "z_robust");
    }
}
