//! Tick orchestration.
//!
//! One tick walks every (station, metric) pair with a new reading and runs
//! the fixed stage sequence: FeatureExtraction → NeighborLookup → Scoring →
//! RuleEvaluation → Persisted. Missing history, missing neighbors, or an
//! untrained model degrade the record (neutral features, absent signal,
//! fallback method) — they never fail the pair, let alone the tick. The
//! only per-pair failures are store errors, and those are caught at the
//! pair boundary, logged with context, and skipped; the tick as a whole
//! fails only when every pair failed.
//!
//! Model retraining happens after the scoring loop, so scoring inside a
//! tick always reads the snapshot trained on a previous tick's data.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;

use crate::alert::{evaluate_rules, primary_hit, RuleContext};
use crate::config::Settings;
use crate::features;
use crate::logging::{self, Subsystem};
use crate::model::{Alert, EngineError, Metric, Reading, Score, StoreError};
use crate::neighbors::{neighbor_signal, NeighborParams};
use crate::outlier::{feature_vector, ModelPool};
use crate::stations::StationIndex;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Stages and summaries
// ---------------------------------------------------------------------------

/// Where in the per-pair pipeline a failure happened. Carried in skip logs
/// so an operator can tell a window query failure from a score write
/// failure at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FeatureExtraction,
    NeighborLookup,
    Scoring,
    RuleEvaluation,
    Persisted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::FeatureExtraction => write!(f, "feature_extraction"),
            Stage::NeighborLookup => write!(f, "neighbor_lookup"),
            Stage::Scoring => write!(f, "scoring"),
            Stage::RuleEvaluation => write!(f, "rule_evaluation"),
            Stage::Persisted => write!(f, "persisted"),
        }
    }
}

/// What one tick accomplished.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub ts: DateTime<Utc>,
    /// (station, metric) pairs with a new reading this tick.
    pub processed: usize,
    /// Pairs that persisted a score row.
    pub scored: usize,
    /// Alert rows written.
    pub alerts: usize,
    /// Pairs skipped because of a store failure.
    pub skipped: usize,
    /// Metrics whose model retrained after the scoring loop.
    pub retrained: Vec<Metric>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    settings: Settings,
    pool: ModelPool,
    tick_no: u64,
    /// Newest reading timestamp already processed per (station, metric).
    /// A pair is triggered once per new reading: while a reading stays the
    /// latest across several ticks it is not rescored and cannot re-alert.
    last_processed: HashMap<(String, Metric), DateTime<Utc>>,
}

impl Engine {
    pub fn new(settings: Settings) -> Engine {
        let pool = ModelPool::from_settings(&settings);
        Engine { settings, pool, tick_no: 0, last_processed: HashMap::new() }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one tick at `now` (injected, so tests and replay control time).
    pub fn process_tick<S: Store>(
        &mut self,
        store: &mut S,
        index: &StationIndex,
        now: DateTime<Utc>,
    ) -> Result<TickSummary, EngineError> {
        self.tick_no += 1;
        let window_start = now - Duration::minutes(self.settings.tick_window_minutes);

        let mut summary = TickSummary {
            ts: now,
            processed: 0,
            scored: 0,
            alerts: 0,
            skipped: 0,
            retrained: Vec::new(),
        };

        for metric in Metric::ALL {
            // Failing to even list active stations aborts the tick; nothing
            // has been processed yet so there is nothing to salvage.
            let active = store.latest_readings_since(metric, window_start)?;

            for reading in active {
                let pair = (reading.station_id.clone(), metric);
                if self.last_processed.get(&pair).is_some_and(|&seen| reading.ts <= seen) {
                    continue; // already handled while it was the latest
                }
                summary.processed += 1;
                match self.process_reading(store, index, &reading) {
                    Ok(alerts_written) => {
                        summary.scored += 1;
                        summary.alerts += alerts_written;
                        self.last_processed.insert(pair, reading.ts);
                    }
                    Err((stage, cause)) => {
                        // leave last_processed untouched so the pair retries
                        // on the next tick
                        summary.skipped += 1;
                        logging::log_station_skip(
                            &reading.station_id,
                            metric.as_str(),
                            &stage.to_string(),
                            &cause,
                        );
                    }
                }
            }
        }

        if summary.processed > 0 && summary.skipped == summary.processed {
            return Err(EngineError::AllStationsFailed { attempted: summary.processed });
        }

        summary.retrained = self.pool.maybe_retrain(self.tick_no);
        for metric in &summary.retrained {
            logging::info(
                Subsystem::Model,
                None,
                &format!(
                    "retrained {} model on {} samples",
                    metric,
                    self.pool.sample_count(*metric)
                ),
            );
        }

        logging::info(
            Subsystem::Engine,
            None,
            &format!(
                "tick {}: scored {}/{} pairs, {} alerts, {} skipped",
                self.tick_no, summary.scored, summary.processed, summary.alerts, summary.skipped
            ),
        );
        Ok(summary)
    }

    /// One (station, metric) pair through all stages. Returns the number of
    /// alert rows written, or the stage and store error that stopped it.
    fn process_reading<S: Store>(
        &mut self,
        store: &mut S,
        index: &StationIndex,
        reading: &Reading,
    ) -> Result<usize, (Stage, StoreError)> {
        let metric = reading.metric;
        let sid = reading.station_id.as_str();
        let thresholds = self.settings.thresholds.for_metric(metric);

        // FeatureExtraction: history window strictly before the reading.
        let window_start = reading.ts - Duration::minutes(self.settings.rolling_window_minutes);
        let window = store
            .readings_window(sid, metric, window_start, reading.ts)
            .map_err(|e| (Stage::FeatureExtraction, e))?;
        let feats = features::extract(
            metric,
            reading.value,
            &window,
            thresholds.sigma_floor,
            self.settings.min_window_samples,
        );
        if feats.window_len < self.settings.min_window_samples {
            logging::debug(
                Subsystem::Features,
                Some(sid),
                &format!(
                    "{}: {} window samples, statistics neutral",
                    metric, feats.window_len
                ),
            );
        }

        // NeighborLookup: simultaneous readings from the rest of the network.
        let snapshot = store
            .readings_at(
                metric,
                reading.ts,
                Duration::seconds(self.settings.neighbor_time_tolerance_seconds),
            )
            .map_err(|e| (Stage::NeighborLookup, e))?;
        let params = NeighborParams {
            k: self.settings.neighbor_k,
            min_count: self.settings.neighbor_min_count,
            weight_exponent: self.settings.neighbor_weight_exponent,
        };
        let signal = neighbor_signal(sid, metric, reading.value, index, &snapshot, &params);
        if signal.is_none() {
            logging::debug(
                Subsystem::Neighbors,
                Some(sid),
                &format!("{}: no neighbor signal (below minimum panel)", metric),
            );
        }

        // Scoring: last trained snapshot, or the robust-z fallback.
        let vector = feature_vector(&feats, signal.as_ref().map(|s| s.gap));
        let (score, method) = self.pool.score(metric, &vector);

        // RuleEvaluation.
        let local_hour = local_hour(reading.ts, self.settings.tod_utc_offset_hours);
        let ctx = RuleContext {
            reading,
            features: &feats,
            neighbor: signal.as_ref(),
            model_score: score,
            method,
            local_hour,
        };
        let hits = evaluate_rules(&ctx, &self.settings);

        // Persisted: exactly one score row for the method that ran, then
        // every triggered alert.
        let extras = json!({
            "method": method,
            "z": feats.z,
            "z_robust": feats.z_robust,
            "delta": feats.delta,
            "rolling_vol": feats.rolling_vol,
            "window_len": feats.window_len,
            "neighbor_gap": signal.as_ref().map(|s| s.gap),
            "neighbor_count": signal.as_ref().map_or(0, |s| s.neighbor_count),
        });
        store
            .write_score(&Score {
                ts: reading.ts,
                station_id: reading.station_id.clone(),
                metric,
                method: method.to_string(),
                score,
                extras,
            })
            .map_err(|e| (Stage::Persisted, e))?;

        for hit in &hits {
            store
                .write_alert(&Alert {
                    ts: reading.ts,
                    station_id: reading.station_id.clone(),
                    metric,
                    kind: hit.kind.to_string(),
                    severity: hit.severity,
                    reason: hit.reason.clone(),
                    payload: hit.payload.clone(),
                })
                .map_err(|e| (Stage::Persisted, e))?;
        }
        if let Some(primary) = primary_hit(&hits) {
            logging::warn(
                Subsystem::Rules,
                Some(sid),
                &format!(
                    "{}: {} alert(s), primary {} severity {:.2}: {}",
                    metric,
                    hits.len(),
                    primary.kind,
                    primary.severity,
                    primary.reason
                ),
            );
        }

        // The reading joins the training buffer only after it persisted,
        // and never influences its own score.
        self.pool.observe(metric, vector);

        Ok(hits.len())
    }
}

/// Hour-of-day at the station network for a UTC timestamp.
fn local_hour(ts: DateTime<Utc>, utc_offset_hours: i32) -> u8 {
    (ts + Duration::hours(utc_offset_hours as i64)).hour() as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
