//! In-memory store backend.
//!
//! Backs unit and scenario tests, and `replay` runs that should not touch
//! the production database. Mirrors the PostgreSQL backend's key semantics
//! exactly: same primary keys, same insert-or-ignore behavior for scores,
//! same ordering guarantees.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::model::{Alert, Metric, Reading, Score, Station, StoreError};
use crate::store::Store;

#[derive(Default)]
pub struct MemoryStore {
    stations: BTreeMap<String, Station>,
    /// Keyed (station_id, metric, ts) so a window scan is a range query.
    readings: BTreeMap<(String, Metric, DateTime<Utc>), f64>,
    /// Keyed by the score primary key; first write wins.
    scores: BTreeMap<(DateTime<Utc>, String, Metric, String), Score>,
    alerts: Vec<(i64, Alert)>,
    next_alert_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { next_alert_id: 1, ..Default::default() }
    }

    /// Total score rows, handy for test assertions.
    pub fn score_count(&self) -> usize {
        self.scores.len()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }
}

impl Store for MemoryStore {
    fn upsert_stations(&mut self, stations: &[Station]) -> Result<usize, StoreError> {
        for s in stations {
            self.stations.insert(s.station_id.clone(), s.clone());
        }
        Ok(stations.len())
    }

    fn list_stations(&mut self) -> Result<Vec<Station>, StoreError> {
        Ok(self.stations.values().cloned().collect())
    }

    fn get_station(&mut self, station_id: &str) -> Result<Option<Station>, StoreError> {
        Ok(self.stations.get(station_id).cloned())
    }

    fn write_readings(&mut self, rows: &[Reading]) -> Result<usize, StoreError> {
        for r in rows {
            self.readings.insert((r.station_id.clone(), r.metric, r.ts), r.value);
        }
        Ok(rows.len())
    }

    fn readings_window(
        &mut self,
        station_id: &str,
        metric: Metric,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let lo = (station_id.to_string(), metric, since);
        let hi = (station_id.to_string(), metric, until);
        Ok(self
            .readings
            .range(lo..hi)
            .map(|((sid, m, ts), &value)| Reading {
                ts: *ts,
                station_id: sid.clone(),
                metric: *m,
                value,
            })
            .collect())
    }

    fn readings_at(
        &mut self,
        metric: Metric,
        ts: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut best: BTreeMap<&str, (&DateTime<Utc>, f64)> = BTreeMap::new();
        for ((sid, m, rts), &value) in &self.readings {
            if *m != metric {
                continue;
            }
            let dist = (*rts - ts).abs();
            if dist > tolerance {
                continue;
            }
            match best.get(sid.as_str()) {
                Some((prev_ts, _)) => {
                    let prev_dist = (**prev_ts - ts).abs();
                    // closest wins; on a distance tie, the later reading
                    if dist < prev_dist || (dist == prev_dist && rts > *prev_ts) {
                        best.insert(sid.as_str(), (rts, value));
                    }
                }
                None => {
                    best.insert(sid.as_str(), (rts, value));
                }
            }
        }
        Ok(best
            .into_iter()
            .map(|(sid, (rts, value))| Reading {
                ts: *rts,
                station_id: sid.to_string(),
                metric,
                value,
            })
            .collect())
    }

    fn latest_readings_since(
        &mut self,
        metric: Metric,
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut latest: BTreeMap<&str, (&DateTime<Utc>, f64)> = BTreeMap::new();
        for ((sid, m, rts), &value) in &self.readings {
            if *m != metric || *rts <= since {
                continue;
            }
            match latest.get(sid.as_str()) {
                Some((prev_ts, _)) if *prev_ts >= rts => {}
                _ => {
                    latest.insert(sid.as_str(), (rts, value));
                }
            }
        }
        Ok(latest
            .into_iter()
            .map(|(sid, (rts, value))| Reading {
                ts: *rts,
                station_id: sid.to_string(),
                metric,
                value,
            })
            .collect())
    }

    fn write_score(&mut self, score: &Score) -> Result<(), StoreError> {
        let key = (score.ts, score.station_id.clone(), score.metric, score.method.clone());
        self.scores.entry(key).or_insert_with(|| score.clone());
        Ok(())
    }

    fn scores_window(
        &mut self,
        station_id: &str,
        metric: Metric,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Score>, StoreError> {
        let mut out: Vec<Score> = self
            .scores
            .values()
            .filter(|s| {
                s.station_id == station_id && s.metric == metric && s.ts >= since && s.ts < until
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.method.cmp(&b.method)));
        Ok(out)
    }

    fn write_alert(&mut self, alert: &Alert) -> Result<i64, StoreError> {
        let id = self.next_alert_id;
        self.next_alert_id += 1;
        self.alerts.push((id, alert.clone()));
        Ok(id)
    }

    fn recent_alerts(
        &mut self,
        metric: Option<Metric>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<(i64, Alert)>, StoreError> {
        let mut out: Vec<(i64, Alert)> = self
            .alerts
            .iter()
            .filter(|(_, a)| metric.is_none_or(|m| a.metric == m))
            .filter(|(_, a)| since.is_none_or(|s| a.ts >= s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.1.ts.cmp(&a.1.ts).then_with(|| b.0.cmp(&a.0)));
        out.truncate(limit);
        Ok(out)
    }

    fn delete_alerts_between(
        &mut self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let before = self.alerts.len();
        self.alerts.retain(|(_, a)| a.ts < since || a.ts >= until);
        Ok(before - self.alerts.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn reading(sid: &str, metric: Metric, min: i64, value: f64) -> Reading {
        Reading { ts: ts(min), station_id: sid.to_string(), metric, value }
    }

    #[test]
    fn test_readings_window_is_half_open_and_chronological() {
        let mut store = MemoryStore::new();
        store
            .write_readings(&[
                reading("S1", Metric::Temperature, 0, 29.0),
                reading("S1", Metric::Temperature, 5, 29.5),
                reading("S1", Metric::Temperature, 10, 30.0),
                reading("S1", Metric::Rainfall, 5, 0.0), // other metric, excluded
                reading("S2", Metric::Temperature, 5, 28.0), // other station, excluded
            ])
            .unwrap();

        let window = store
            .readings_window("S1", Metric::Temperature, ts(0), ts(10))
            .unwrap();
        let values: Vec<f64> = window.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![29.0, 29.5], "until bound must be exclusive");
    }

    #[test]
    fn test_readings_at_picks_closest_per_station() {
        let mut store = MemoryStore::new();
        store
            .write_readings(&[
                reading("S1", Metric::Humidity, 0, 80.0),
                reading("S1", Metric::Humidity, 4, 81.0), // closest to t=5
                reading("S2", Metric::Humidity, 9, 75.0),
                reading("S3", Metric::Humidity, 20, 70.0), // outside tolerance
            ])
            .unwrap();

        let snap = store
            .readings_at(Metric::Humidity, ts(5), Duration::minutes(5))
            .unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].station_id, "S1");
        assert_eq!(snap[0].value, 81.0);
        assert_eq!(snap[1].station_id, "S2");
    }

    #[test]
    fn test_latest_readings_since_one_row_per_station() {
        let mut store = MemoryStore::new();
        store
            .write_readings(&[
                reading("S1", Metric::WindSpeed, 1, 5.0),
                reading("S1", Metric::WindSpeed, 8, 7.0),
                reading("S2", Metric::WindSpeed, 3, 4.0),
                reading("S3", Metric::WindSpeed, -5, 9.0), // before cutoff
            ])
            .unwrap();

        let latest = store.latest_readings_since(Metric::WindSpeed, ts(0)).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].station_id, "S1");
        assert_eq!(latest[0].value, 7.0, "newest reading wins");
        assert_eq!(latest[1].station_id, "S2");
    }

    #[test]
    fn test_write_score_first_write_wins() {
        let mut store = MemoryStore::new();
        let mut score = Score {
            ts: ts(0),
            station_id: "S1".to_string(),
            metric: Metric::Rainfall,
            method: "z_robust".to_string(),
            score: 0.4,
            extras: serde_json::json!({}),
        };
        store.write_score(&score).unwrap();
        score.score = 0.9;
        store.write_score(&score).unwrap();

        let rows = store
            .scores_window("S1", Metric::Rainfall, ts(-1), ts(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, 0.4, "duplicate primary key must be ignored, not overwrite");
    }

    #[test]
    fn test_alert_ids_are_monotonic() {
        let mut store = MemoryStore::new();
        let alert = Alert {
            ts: ts(0),
            station_id: "S1".to_string(),
            metric: Metric::Rainfall,
            kind: "physical_bound".to_string(),
            severity: 1.0,
            reason: "rainfall below 0".to_string(),
            payload: serde_json::json!({}),
        };
        let a = store.write_alert(&alert).unwrap();
        let b = store.write_alert(&alert).unwrap();
        assert!(b > a);
        assert_eq!(store.alert_count(), 2, "alerts are append-only, duplicates allowed");
    }

    #[test]
    fn test_delete_alerts_between_is_half_open() {
        let mut store = MemoryStore::new();
        for min in [0, 5, 10] {
            let alert = Alert {
                ts: ts(min),
                station_id: "S1".to_string(),
                metric: Metric::Temperature,
                kind: "sudden_delta".to_string(),
                severity: 0.5,
                reason: "test".to_string(),
                payload: serde_json::json!({}),
            };
            store.write_alert(&alert).unwrap();
        }
        let deleted = store.delete_alerts_between(ts(0), ts(10)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.alert_count(), 1, "alert at the until bound must survive");
    }
}
