//! Runtime configuration for the monitoring service.
//!
//! Settings load from a TOML file (`wxmon.toml` by default) with built-in
//! defaults for every field, so a missing file is fine but a present-and-
//! invalid one is a startup failure. Validation is eager and total: the
//! engine never runs a tick with an undefined or nonsensical threshold.
//!
//! Thresholds are one explicit field per metric — no stringly-typed maps —
//! so a typo in the config file is a parse error, not a silently ignored key.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::model::{ConfigError, Metric};

/// Default config file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "wxmon.toml";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Daemon cadence between ticks, in seconds.
    pub poll_interval_seconds: u64,

    /// A reading counts as "new" for a tick if it arrived within this many
    /// minutes of the tick timestamp. Stations with nothing newer are
    /// skipped without error.
    pub tick_window_minutes: i64,

    /// Lookback window handed to the feature extractor, in minutes.
    pub rolling_window_minutes: i64,

    /// Below this many window samples, statistics default to neutral
    /// (zero z-scores) instead of being computed from noise.
    pub min_window_samples: usize,

    /// Nearest neighbors consulted per station.
    pub neighbor_k: usize,

    /// Minimum qualifying neighbors for a neighbor-gap signal; below this
    /// the signal is absent, never zero.
    pub neighbor_min_count: usize,

    /// Neighbor readings must fall within this many seconds of the target
    /// timestamp to qualify.
    pub neighbor_time_tolerance_seconds: i64,

    /// Inverse-distance weighting exponent: 1 or 2.
    pub neighbor_weight_exponent: u32,

    /// Scoring backend for trained models.
    pub model_backend: ModelBackend,

    /// Feature vectors observed before a metric's model is considered
    /// trainable; below this, scoring falls back to the robust z method.
    pub min_train_samples: usize,

    /// Retrain cadence, in ticks.
    pub retrain_every_ticks: u64,

    /// Bounded training buffer per metric; oldest vectors are evicted first.
    pub train_buffer_cap: usize,

    /// Daemon rebuilds the station index every N loops (stations appear
    /// over time as the collector discovers them).
    pub index_rebuild_every_ticks: u64,

    /// UTC offset of the station network's local time, in hours. Used only
    /// by the time-of-day temperature rule.
    pub tod_utc_offset_hours: i32,

    /// Optional log file; console logging is always on.
    pub log_file: Option<String>,

    pub thresholds: Thresholds,

    /// Expected temperature range per local hour-of-day bucket.
    pub temperature_tod: Vec<TodBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    IsolationForest,
    ZRobust,
}

/// Per-metric rule thresholds, one explicit block per metric.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub temperature: MetricThresholds,
    pub rainfall: MetricThresholds,
    pub humidity: MetricThresholds,
    pub wind_direction: MetricThresholds,
    pub wind_speed: MetricThresholds,
}

impl Thresholds {
    pub fn for_metric(&self, metric: Metric) -> &MetricThresholds {
        match metric {
            Metric::Temperature => &self.temperature,
            Metric::Rainfall => &self.rainfall,
            Metric::Humidity => &self.humidity,
            Metric::WindDirection => &self.wind_direction,
            Metric::WindSpeed => &self.wind_speed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricThresholds {
    /// |delta| at or above this fires the sudden_delta rule. Units are the
    /// metric's own (°C, mm per tick, %, knots, degrees).
    pub sudden_delta: f64,

    /// Model score at or above this fires the model_outlier rule.
    pub model_score: f64,

    /// Hard physical bounds; a reading outside always alerts.
    pub physical_min: Option<f64>,
    pub physical_max: Option<f64>,

    /// Floor for the robust spread estimate, keeping z-scores finite when
    /// the window variance collapses.
    pub sigma_floor: f64,
}

/// One bucket of the time-of-day temperature baseline: for every listed
/// local hour, readings are expected inside [min, max].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TodBucket {
    pub hours: Vec<u8>,
    pub min: f64,
    pub max: f64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Settings {
    fn default() -> Self {
        Settings {
            poll_interval_seconds: 60,
            tick_window_minutes: 10,
            rolling_window_minutes: 90,
            min_window_samples: 5,
            neighbor_k: 4,
            neighbor_min_count: 2,
            neighbor_time_tolerance_seconds: 300,
            neighbor_weight_exponent: 1,
            model_backend: ModelBackend::IsolationForest,
            min_train_samples: 50,
            retrain_every_ticks: 60,
            train_buffer_cap: 4096,
            index_rebuild_every_ticks: 10,
            tod_utc_offset_hours: 8,
            log_file: None,
            thresholds: Thresholds::default(),
            temperature_tod: default_temperature_tod(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            temperature: MetricThresholds {
                sudden_delta: 0.8, // °C per tick
                model_score: 0.7,
                physical_min: Some(-90.0),
                physical_max: Some(60.0),
                sigma_floor: 0.15,
            },
            rainfall: MetricThresholds {
                sudden_delta: 0.2, // mm in one tick interval
                model_score: 0.7,
                physical_min: Some(0.0),
                physical_max: None,
                sigma_floor: 0.01,
            },
            humidity: MetricThresholds {
                sudden_delta: 5.0, // % RH
                model_score: 0.7,
                physical_min: Some(0.0),
                physical_max: Some(100.0),
                sigma_floor: 0.5,
            },
            wind_direction: MetricThresholds {
                sudden_delta: 35.0, // degrees, shortest arc
                model_score: 0.7,
                physical_min: Some(0.0),
                physical_max: Some(360.0),
                sigma_floor: 5.0,
            },
            wind_speed: MetricThresholds {
                sudden_delta: 3.0, // knots
                model_score: 0.7,
                physical_min: Some(0.0),
                physical_max: None,
                sigma_floor: 0.3,
            },
        }
    }
}

/// Tropical-climate defaults for the hour-of-day temperature envelope.
fn default_temperature_tod() -> Vec<TodBucket> {
    vec![
        TodBucket { hours: vec![22, 23, 0, 1, 2, 3, 4, 5, 6], min: 21.0, max: 31.0 },
        TodBucket { hours: vec![7, 8, 9, 10, 11], min: 23.0, max: 34.0 },
        TodBucket { hours: vec![12, 13, 14, 15, 16, 17], min: 24.0, max: 36.0 },
        TodBucket { hours: vec![18, 19, 20, 21], min: 23.0, max: 33.0 },
    ]
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Load settings from `path`, falling back to built-in defaults when the
    /// file does not exist. A file that exists but cannot be read, parsed,
    /// or validated is a hard error.
    pub fn load(path: &str) -> Result<Settings, ConfigError> {
        if !Path::new(path).exists() {
            let settings = Settings::default();
            settings.validate()?;
            return Ok(settings);
        }
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let settings: Settings =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every field. Errors name the offending field so an operator can
    /// fix the config file without reading source code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, problem: &str) -> ConfigError {
            ConfigError::Invalid { field: field.to_string(), problem: problem.to_string() }
        }

        if self.poll_interval_seconds == 0 {
            return Err(invalid("poll_interval_seconds", "must be >= 1"));
        }
        if self.tick_window_minutes < 1 {
            return Err(invalid("tick_window_minutes", "must be >= 1"));
        }
        if self.rolling_window_minutes < 1 {
            return Err(invalid("rolling_window_minutes", "must be >= 1"));
        }
        if self.min_window_samples < 2 {
            return Err(invalid("min_window_samples", "must be >= 2"));
        }
        if self.neighbor_k == 0 {
            return Err(invalid("neighbor_k", "must be >= 1"));
        }
        if self.neighbor_min_count == 0 {
            return Err(invalid("neighbor_min_count", "must be >= 1"));
        }
        if self.neighbor_min_count > self.neighbor_k {
            return Err(invalid("neighbor_min_count", "cannot exceed neighbor_k"));
        }
        if self.neighbor_time_tolerance_seconds < 1 {
            return Err(invalid("neighbor_time_tolerance_seconds", "must be >= 1"));
        }
        if !matches!(self.neighbor_weight_exponent, 1 | 2) {
            return Err(invalid("neighbor_weight_exponent", "must be 1 or 2"));
        }
        if self.min_train_samples < 2 {
            return Err(invalid("min_train_samples", "must be >= 2"));
        }
        if self.retrain_every_ticks == 0 {
            return Err(invalid("retrain_every_ticks", "must be >= 1"));
        }
        if self.train_buffer_cap < self.min_train_samples {
            return Err(invalid("train_buffer_cap", "must be >= min_train_samples"));
        }
        if self.index_rebuild_every_ticks == 0 {
            return Err(invalid("index_rebuild_every_ticks", "must be >= 1"));
        }
        if self.tod_utc_offset_hours < -12 || self.tod_utc_offset_hours > 14 {
            return Err(invalid("tod_utc_offset_hours", "must be between -12 and +14"));
        }

        for metric in Metric::ALL {
            let t = self.thresholds.for_metric(metric);
            let prefix = format!("thresholds.{}", metric);
            if !t.sudden_delta.is_finite() || t.sudden_delta <= 0.0 {
                return Err(invalid(&format!("{}.sudden_delta", prefix), "must be finite and > 0"));
            }
            if !t.model_score.is_finite() || t.model_score <= 0.0 || t.model_score > 1.0 {
                return Err(invalid(&format!("{}.model_score", prefix), "must be in (0, 1]"));
            }
            if !t.sigma_floor.is_finite() || t.sigma_floor <= 0.0 {
                return Err(invalid(&format!("{}.sigma_floor", prefix), "must be finite and > 0"));
            }
            if let (Some(lo), Some(hi)) = (t.physical_min, t.physical_max) {
                if lo >= hi {
                    return Err(invalid(
                        &format!("{}.physical_min", prefix),
                        "physical_min must be below physical_max",
                    ));
                }
            }
            for bound in [t.physical_min, t.physical_max].into_iter().flatten() {
                if !bound.is_finite() {
                    return Err(invalid(&format!("{}.physical bounds", prefix), "must be finite"));
                }
            }
        }

        // Humidity is a percentage by definition; a wider bound is a typo.
        let h = &self.thresholds.humidity;
        if h.physical_min.is_none_or(|lo| lo < 0.0) || h.physical_max.is_none_or(|hi| hi > 100.0) {
            return Err(invalid("thresholds.humidity", "physical bounds must stay within [0, 100]"));
        }

        // Every local hour must belong to exactly one ToD bucket.
        let mut seen = [0u8; 24];
        for (i, bucket) in self.temperature_tod.iter().enumerate() {
            let field = format!("temperature_tod[{}]", i);
            if bucket.hours.is_empty() {
                return Err(invalid(&field, "bucket lists no hours"));
            }
            if !bucket.min.is_finite() || !bucket.max.is_finite() || bucket.min >= bucket.max {
                return Err(invalid(&field, "requires finite min < max"));
            }
            for &hour in &bucket.hours {
                if hour > 23 {
                    return Err(invalid(&field, "hours must be 0..=23"));
                }
                seen[hour as usize] += 1;
            }
        }
        for (hour, count) in seen.iter().enumerate() {
            match count {
                0 => {
                    return Err(invalid(
                        "temperature_tod",
                        &format!("hour {} is not covered by any bucket", hour),
                    ));
                }
                1 => {}
                _ => {
                    return Err(invalid(
                        "temperature_tod",
                        &format!("hour {} appears in more than one bucket", hour),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Expected temperature range for a local hour, from the validated
    /// buckets. `None` can only happen on an unvalidated Settings value.
    pub fn tod_range(&self, local_hour: u8) -> Option<(f64, f64)> {
        self.temperature_tod
            .iter()
            .find(|b| b.hours.contains(&local_hour))
            .map(|b| (b.min, b.max))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass_validation() {
        Settings::default()
            .validate()
            .expect("built-in defaults must always validate");
    }

    #[test]
    fn test_default_tod_buckets_cover_every_hour() {
        let s = Settings::default();
        for hour in 0..24u8 {
            assert!(
                s.tod_range(hour).is_some(),
                "hour {} must fall in some default ToD bucket",
                hour
            );
        }
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let s: Settings = toml::from_str(
            r#"
            neighbor_k = 6
            [thresholds.rainfall]
            sudden_delta = 0.5
            model_score = 0.8
            physical_min = 0.0
            sigma_floor = 0.01
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(s.neighbor_k, 6);
        assert_eq!(s.thresholds.rainfall.sudden_delta, 0.5);
        // untouched sections keep their defaults
        assert_eq!(s.thresholds.humidity.sudden_delta, 5.0);
        assert_eq!(s.poll_interval_seconds, 60);
        s.validate().expect("overlayed config should validate");
    }

    #[test]
    fn test_unknown_key_is_a_parse_error() {
        let result: Result<Settings, _> = toml::from_str("neighbour_k = 4");
        assert!(result.is_err(), "misspelled keys must not be silently ignored");
    }

    #[test]
    fn test_zero_sudden_delta_is_rejected() {
        let mut s = Settings::default();
        s.thresholds.wind_speed.sudden_delta = 0.0;
        let err = s.validate().expect_err("zero threshold must fail validation");
        assert!(err.to_string().contains("wind_speed"), "error should name the metric: {}", err);
    }

    #[test]
    fn test_humidity_bounds_must_stay_percentage() {
        let mut s = Settings::default();
        s.thresholds.humidity.physical_max = Some(150.0);
        assert!(s.validate().is_err());
        s.thresholds.humidity.physical_max = None;
        assert!(s.validate().is_err(), "open-ended humidity bound is also invalid");
    }

    #[test]
    fn test_tod_gap_and_overlap_are_rejected() {
        let mut s = Settings::default();
        s.temperature_tod = vec![TodBucket { hours: (0..23).collect(), min: 20.0, max: 35.0 }];
        let err = s.validate().expect_err("hour 23 uncovered");
        assert!(err.to_string().contains("23"));

        s.temperature_tod = vec![
            TodBucket { hours: (0..24).collect(), min: 20.0, max: 35.0 },
            TodBucket { hours: vec![12], min: 25.0, max: 36.0 },
        ];
        assert!(s.validate().is_err(), "hour 12 doubly covered");
    }

    #[test]
    fn test_neighbor_min_count_cannot_exceed_k() {
        let mut s = Settings::default();
        s.neighbor_min_count = 10;
        s.neighbor_k = 4;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let s = Settings::load("definitely-not-a-real-file.toml")
            .expect("missing config file should fall back to defaults");
        assert_eq!(s.neighbor_k, Settings::default().neighbor_k);
    }
}
