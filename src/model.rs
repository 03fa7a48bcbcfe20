//! Core data types for the weather anomaly monitoring service.
//!
//! This module defines the shared domain model imported by all other modules.
//! It contains no logic beyond small conversions, no I/O, and no clock access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// The fixed set of metrics reported by the station network.
///
/// `WindDirection` is circular: values are degrees and 0° ≡ 360°. Every
/// statistic computed over it must go through the circular helpers in
/// `features` rather than plain arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Rainfall,
    Humidity,
    WindDirection,
    WindSpeed,
}

impl Metric {
    /// All metrics, in the order the engine processes them on a tick.
    pub const ALL: [Metric; 5] = [
        Metric::Temperature,
        Metric::Rainfall,
        Metric::Humidity,
        Metric::WindDirection,
        Metric::WindSpeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Rainfall => "rainfall",
            Metric::Humidity => "humidity",
            Metric::WindDirection => "wind_direction",
            Metric::WindSpeed => "wind_speed",
        }
    }

    /// Parse the storage representation. Returns `None` for unknown names,
    /// which callers should treat as corrupt data rather than panic.
    pub fn parse(s: &str) -> Option<Metric> {
        match s {
            "temperature" => Some(Metric::Temperature),
            "rainfall" => Some(Metric::Rainfall),
            "humidity" => Some(Metric::Humidity),
            "wind_direction" => Some(Metric::WindDirection),
            "wind_speed" => Some(Metric::WindSpeed),
            _ => None,
        }
    }

    /// Whether this metric is an angle in degrees.
    pub fn is_circular(&self) -> bool {
        matches!(self, Metric::WindDirection)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Station and reading types
// ---------------------------------------------------------------------------

/// Metadata for a single fixed sensor station.
///
/// Stations are created by the collector and never mutated by the engine;
/// the engine only reads them to resolve names and spatial neighbors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub station_id: String,
    pub name: String,
    /// WGS84 latitude.
    pub latitude: f64,
    /// WGS84 longitude.
    pub longitude: f64,
}

/// A single time-stamped measurement, already normalized by the collector.
///
/// Primary key is (ts, station_id, metric); rows are append-only. Sampling
/// intervals are not guaranteed to be uniform — gaps are expected and every
/// consumer must tolerate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub ts: DateTime<Utc>,
    pub station_id: String,
    pub metric: Metric,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Derived rows: scores and alerts
// ---------------------------------------------------------------------------

/// One anomaly score for one (station, metric) at one tick.
///
/// `method` names the scoring method that actually produced the value
/// ("isolation_forest", "z_robust", …) and participates in the primary key,
/// so the same tick may carry one row per method. Rows are an immutable log:
/// written exactly once, never updated. `extras` holds diagnostic fields
/// (feature values, neighbor count) for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub ts: DateTime<Utc>,
    pub station_id: String,
    pub metric: Metric,
    pub method: String,
    pub score: f64,
    pub extras: serde_json::Value,
}

/// An alert raised by the rule engine.
///
/// The surrogate id is assigned by the store on insert and is therefore not
/// part of this struct; `Store::write_alert` returns it. `severity` is
/// normalized to [0, 1]. `reason` is a deterministic human-readable
/// explanation built from the triggering condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub ts: DateTime<Utc>,
    pub station_id: String,
    pub metric: Metric,
    pub kind: String,
    pub severity: f64,
    pub reason: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Configuration failures. Always fatal at startup: the engine refuses to
/// run a tick cycle with undefined or invalid thresholds.
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Io(String),
    /// The config file could not be parsed as TOML.
    Parse(String),
    /// A field failed validation (name, explanation).
    Invalid { field: String, problem: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid { field, problem } => {
                write!(f, "invalid config field '{}': {}", field, problem)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Store backend failures. Recoverable per station within a tick: the engine
/// logs and skips the station, and fails the tick only when every station
/// failed.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying backend error (connection, SQL, serialization).
    Backend(String),
    /// A row read back from the store did not fit the domain model.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "corrupt store row: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<postgres::Error> for StoreError {
    fn from(e: postgres::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Tick-level engine failures. Data gaps and untrained models are NOT errors
/// (they resolve to documented fallbacks); this enum only carries conditions
/// that abort the whole tick.
#[derive(Debug)]
pub enum EngineError {
    /// Every active station in the tick failed to persist. Individual
    /// failures are logged where they happen; this aggregates the count.
    AllStationsFailed { attempted: usize },
    /// A store error outside the per-station boundary (e.g. listing active
    /// stations), before any station was processed.
    Store(StoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AllStationsFailed { attempted } => {
                write!(f, "all {} stations failed to persist this tick", attempted)
            }
            EngineError::Store(e) => write!(f, "tick aborted by store error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
