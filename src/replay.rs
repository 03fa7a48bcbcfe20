//! Replay: regenerate derived rows from stored readings.
//!
//! Scores and alerts are derived data — readings plus stations are the only
//! source of truth — so any time range can be recomputed after a threshold
//! change or an engine outage. Replay steps a fresh engine through the
//! range at the configured tick cadence with an injected clock. Alerts in
//! the range are deleted first (they carry surrogate ids, so regenerating
//! without the delete would duplicate them); score writes land on their
//! natural primary keys, filling gaps and leaving existing rows untouched.

use chrono::{DateTime, Duration, Utc};

use crate::engine::Engine;
use crate::logging::{self, Subsystem};
use crate::model::EngineError;
use crate::stations::StationIndex;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub ticks: usize,
    /// (station, metric) pairs scored across the whole range.
    pub scored: usize,
    pub alerts: usize,
    /// Pre-existing alert rows removed from the range before regeneration.
    pub alerts_cleared: usize,
}

/// Recompute scores and alerts for readings with `since <= ts < until`.
///
/// `engine` should be freshly constructed: replay relies on the engine's
/// own once-per-reading gate, and an engine that already processed part of
/// the range live would silently skip it here.
pub fn replay<S: Store>(
    store: &mut S,
    engine: &mut Engine,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<ReplayOutcome, EngineError> {
    let mut index = StationIndex::new();
    index.rebuild(store.list_stations()?);
    if !index.ready() {
        logging::warn(
            Subsystem::Daemon,
            None,
            "replaying with fewer than two stations; neighbor signals will be absent",
        );
    }

    let alerts_cleared = store.delete_alerts_between(since, until)?;

    let step = Duration::seconds(engine.settings().poll_interval_seconds as i64);
    let mut outcome = ReplayOutcome { ticks: 0, scored: 0, alerts: 0, alerts_cleared };

    // Ticks land at since, since+step, … strictly before until, matching
    // the half-open alert range. The cadence must not exceed the data
    // cadence or readings between ticks would be superseded unseen; the
    // default poll interval is well inside any real sensor cadence.
    let mut now = since;
    while now < until {
        let summary = engine.process_tick(store, &index, now)?;
        outcome.ticks += 1;
        outcome.scored += summary.scored;
        outcome.alerts += summary.alerts;
        now += step;
    }

    logging::info(
        Subsystem::Daemon,
        None,
        &format!(
            "replay complete: {} ticks, {} pairs scored, {} alerts ({} cleared)",
            outcome.ticks, outcome.scored, outcome.alerts, outcome.alerts_cleared
        ),
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::model::{Alert, Metric, Reading, Station};
    use crate::store::{MemoryStore, Store};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .upsert_stations(&[
                Station { station_id: "S1".into(), name: "One".into(), latitude: 0.0, longitude: 0.0 },
                Station { station_id: "S2".into(), name: "Two".into(), latitude: 0.0, longitude: 0.01 },
            ])
            .unwrap();
        let mut rows = Vec::new();
        for step in 0..24i64 {
            for sid in ["S1", "S2"] {
                rows.push(Reading {
                    ts: t0() + Duration::minutes(5 * step),
                    station_id: sid.to_string(),
                    metric: Metric::Humidity,
                    value: 80.0 + (step % 4) as f64,
                });
            }
        }
        store.write_readings(&rows).unwrap();
        store
    }

    #[test]
    fn test_replay_scores_every_stored_reading_once() {
        let mut store = seeded_store();
        let mut settings = Settings::default();
        settings.poll_interval_seconds = 300; // one tick per 5-minute step
        let mut engine = Engine::new(settings);

        let outcome =
            replay(&mut store, &mut engine, t0(), t0() + Duration::hours(2)).unwrap();
        assert_eq!(outcome.scored, 48, "24 steps x 2 stations, each exactly once");
        assert_eq!(store.score_count(), 48);
    }

    #[test]
    fn test_replay_clears_stale_alerts_in_range() {
        let mut store = seeded_store();
        store
            .write_alert(&Alert {
                ts: t0() + Duration::minutes(30),
                station_id: "S1".into(),
                metric: Metric::Humidity,
                kind: "sudden_delta".into(),
                severity: 0.5,
                reason: "from an earlier run".into(),
                payload: serde_json::json!({}),
            })
            .unwrap();

        let mut settings = Settings::default();
        settings.poll_interval_seconds = 300;
        let mut engine = Engine::new(settings);
        let outcome =
            replay(&mut store, &mut engine, t0(), t0() + Duration::hours(2)).unwrap();
        assert_eq!(outcome.alerts_cleared, 1);
        assert_eq!(outcome.alerts, 0, "steady humidity regenerates no alerts");
        assert_eq!(store.alert_count(), 0);
    }

    #[test]
    fn test_replaying_twice_adds_no_score_rows() {
        let mut store = seeded_store();
        let until = t0() + Duration::hours(2);
        for _ in 0..2 {
            let mut settings = Settings::default();
            settings.poll_interval_seconds = 300;
            let mut engine = Engine::new(settings);
            replay(&mut store, &mut engine, t0(), until).unwrap();
        }
        assert_eq!(store.score_count(), 48, "second replay hits identical primary keys");
    }
}
