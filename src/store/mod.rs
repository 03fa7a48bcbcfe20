//! Durable persistence boundary.
//!
//! The engine only ever talks to the [`Store`] trait: simple key-based
//! reads and appends, no business logic. Two backends ship with the
//! service — `memory` for tests and replay experiments, `postgres` for
//! production. Anything with transactions, indexes, or file formats lives
//! behind this boundary and is invisible to the scoring pipeline.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Alert, Metric, Reading, Score, Station, StoreError};

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Read/write access to stations, readings, scores, and alerts.
///
/// Methods take `&mut self` because the PostgreSQL client requires it;
/// the engine runs a tick sequentially on one thread so this costs nothing.
pub trait Store {
    /// Insert or replace station metadata. Returns rows written.
    fn upsert_stations(&mut self, stations: &[Station]) -> Result<usize, StoreError>;

    fn list_stations(&mut self) -> Result<Vec<Station>, StoreError>;

    /// Single-station lookup; `None` for unknown ids.
    fn get_station(&mut self, station_id: &str) -> Result<Option<Station>, StoreError>;

    /// Append readings; rows whose (ts, station_id, metric) key already
    /// exists are replaced (the collector may re-deliver a page).
    fn write_readings(&mut self, rows: &[Reading]) -> Result<usize, StoreError>;

    /// Chronological readings for one (station, metric) with
    /// `since <= ts < until` (half-open, so a target reading's own
    /// timestamp is naturally excluded from its history window).
    fn readings_window(
        &mut self,
        station_id: &str,
        metric: Metric,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// For neighbor lookups: at most one reading per station for `metric`,
    /// the one closest to `ts` within `tolerance` (ties prefer the later
    /// reading). Ordered by station_id for determinism.
    fn readings_at(
        &mut self,
        metric: Metric,
        ts: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Vec<Reading>, StoreError>;

    /// The newest reading per station for `metric` with `ts > since`.
    /// This defines which stations are "active" for a tick. Ordered by
    /// station_id.
    fn latest_readings_since(
        &mut self,
        metric: Metric,
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Append one score row. The primary key is (ts, station_id, metric,
    /// method); a duplicate key is silently ignored, which is what makes
    /// tick replay idempotent.
    fn write_score(&mut self, score: &Score) -> Result<(), StoreError>;

    /// Chronological score rows for one (station, metric), `since <= ts <
    /// until`.
    fn scores_window(
        &mut self,
        station_id: &str,
        metric: Metric,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Score>, StoreError>;

    /// Append one alert; the store assigns and returns the surrogate id.
    fn write_alert(&mut self, alert: &Alert) -> Result<i64, StoreError>;

    /// Newest alerts first, optionally filtered by metric and start time.
    fn recent_alerts(
        &mut self,
        metric: Option<Metric>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<(i64, Alert)>, StoreError>;

    /// Delete alerts with `since <= ts < until`. Used by replay before
    /// regenerating a range (alerts have surrogate ids, so rerunning
    /// without this would duplicate them).
    fn delete_alerts_between(
        &mut self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}
