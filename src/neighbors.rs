//! Neighbor consistency: how far does a reading sit from what nearby
//! stations report at the same moment?
//!
//! The expectation is an inverse-distance-weighted mean over the K nearest
//! stations that actually have a reading for the metric near the target
//! timestamp (K nearest *with data*, so a dead station never shrinks the
//! panel). Distances are clamped to a minimum before weighting so two
//! co-located stations cannot blow the weight up to infinity.
//!
//! "Too few neighbors" is a real state, distinct from "neighbors agree":
//! below the configured minimum the signal is `None` and stays absent all
//! the way downstream — the model substitutes a neutral value at its own
//! boundary and the rules skip neighbor-based reasoning entirely.

use std::collections::HashMap;

use crate::features::angular_difference_deg;
use crate::model::{Metric, Reading};
use crate::stations::StationIndex;

/// Distance clamp for weighting, in kilometers.
const MIN_DISTANCE_KM: f64 = 0.1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Deviation of a reading from its neighborhood's expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborSignal {
    /// Distance-weighted mean of neighbor values (circular mean for wind
    /// direction).
    pub expected: f64,
    /// |value − expected|; shortest angular distance for wind direction.
    pub gap: f64,
    /// Neighbors that contributed.
    pub neighbor_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct NeighborParams {
    /// Panel size: nearest K stations with data.
    pub k: usize,
    /// Minimum panel size below which no signal is produced.
    pub min_count: usize,
    /// Inverse-distance weighting exponent (1 or 2, validated in config).
    pub weight_exponent: u32,
}

// ---------------------------------------------------------------------------
// Signal computation
// ---------------------------------------------------------------------------

/// Compute the neighbor signal for one reading.
///
/// `snapshot` is the store's per-station nearest reading for `metric`
/// around the target timestamp (`Store::readings_at`); the target station's
/// own entry, if present, is ignored.
pub fn neighbor_signal(
    station_id: &str,
    metric: Metric,
    value: f64,
    index: &StationIndex,
    snapshot: &[Reading],
    params: &NeighborParams,
) -> Option<NeighborSignal> {
    if !index.ready() {
        return None;
    }

    let values_by_station: HashMap<&str, f64> =
        snapshot.iter().map(|r| (r.station_id.as_str(), r.value)).collect();

    // K nearest stations *that have data*: walk the full distance-ordered
    // list and keep the first k hits.
    let mut panel: Vec<(f64, f64)> = Vec::with_capacity(params.k); // (value, distance_km)
    for (station, distance_km) in index.neighbors(station_id, index.len()) {
        if station.station_id == station_id {
            continue;
        }
        if let Some(&v) = values_by_station.get(station.station_id.as_str()) {
            panel.push((v, distance_km));
            if panel.len() == params.k {
                break;
            }
        }
    }

    if panel.len() < params.min_count {
        return None;
    }

    let weights: Vec<f64> = panel
        .iter()
        .map(|&(_, d)| 1.0 / d.max(MIN_DISTANCE_KM).powi(params.weight_exponent as i32))
        .collect();

    let expected = if metric.is_circular() {
        weighted_circular_mean(&panel, &weights)
    } else {
        let total: f64 = weights.iter().sum();
        panel.iter().zip(&weights).map(|(&(v, _), w)| v * w).sum::<f64>() / total
    };

    let gap = if metric.is_circular() {
        angular_difference_deg(value, expected).abs()
    } else {
        (value - expected).abs()
    };

    Some(NeighborSignal { expected, gap, neighbor_count: panel.len() })
}

fn weighted_circular_mean(panel: &[(f64, f64)], weights: &[f64]) -> f64 {
    let (s, c) = panel
        .iter()
        .zip(weights)
        .map(|(&(v, _), &w)| (v.to_radians(), w))
        .fold((0.0, 0.0), |(s, c), (rad, w)| (s + w * rad.sin(), c + w * rad.cos()));
    s.atan2(c).to_degrees().rem_euclid(360.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Station;
    use chrono::{TimeZone, Utc};

    fn params() -> NeighborParams {
        NeighborParams { k: 4, min_count: 2, weight_exponent: 1 }
    }

    fn station(id: &str, lat: f64, lon: f64) -> Station {
        Station { station_id: id.to_string(), name: id.to_string(), latitude: lat, longitude: lon }
    }

    /// S0 at origin; S1 ~1.1 km east, S2 ~2.2 km east, S3 ~4.5 km east.
    fn index() -> StationIndex {
        let mut index = StationIndex::new();
        index.rebuild(vec![
            station("S0", 0.0, 0.00),
            station("S1", 0.0, 0.01),
            station("S2", 0.0, 0.02),
            station("S3", 0.0, 0.04),
        ]);
        index
    }

    fn snapshot(entries: &[(&str, f64)], metric: Metric) -> Vec<Reading> {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        entries
            .iter()
            .map(|&(sid, value)| Reading { ts, station_id: sid.to_string(), metric, value })
            .collect()
    }

    #[test]
    fn test_below_min_count_yields_none_not_zero() {
        let index = index();
        let snap = snapshot(&[("S1", 29.0)], Metric::Temperature);
        let signal =
            neighbor_signal("S0", Metric::Temperature, 29.0, &index, &snap, &params());
        assert!(signal.is_none(), "one neighbor is below the minimum of two");
    }

    #[test]
    fn test_target_station_reading_is_not_its_own_neighbor() {
        let index = index();
        let snap = snapshot(&[("S0", 99.0), ("S1", 29.0)], Metric::Temperature);
        let signal =
            neighbor_signal("S0", Metric::Temperature, 99.0, &index, &snap, &params());
        assert!(signal.is_none(), "self must not count toward the panel");
    }

    #[test]
    fn test_agreeing_neighbors_give_small_gap() {
        let index = index();
        let snap = snapshot(&[("S1", 29.0), ("S2", 29.5), ("S3", 28.5)], Metric::Temperature);
        let signal = neighbor_signal("S0", Metric::Temperature, 29.2, &index, &snap, &params())
            .expect("three neighbors available");
        assert_eq!(signal.neighbor_count, 3);
        assert!(signal.gap < 0.5, "gap {} should be small", signal.gap);
    }

    #[test]
    fn test_runaway_reading_gives_large_gap() {
        let index = index();
        let snap = snapshot(&[("S1", 28.0), ("S2", 31.0), ("S3", 29.0)], Metric::Temperature);
        let signal = neighbor_signal("S0", Metric::Temperature, 95.0, &index, &snap, &params())
            .expect("three neighbors available");
        assert!(signal.gap > 60.0, "95 °C against ~29 °C neighbors, gap was {}", signal.gap);
    }

    #[test]
    fn test_closer_neighbors_weigh_more() {
        let index = index();
        // Near neighbor says 10, far neighbor says 30: expectation must sit
        // closer to 10 than the unweighted mean of 20.
        let snap = snapshot(&[("S1", 10.0), ("S3", 30.0)], Metric::Temperature);
        let signal = neighbor_signal("S0", Metric::Temperature, 10.0, &index, &snap, &params())
            .expect("two neighbors available");
        assert!(
            signal.expected < 20.0,
            "inverse-distance weighting should favor S1, expected={}",
            signal.expected
        );
    }

    #[test]
    fn test_squared_exponent_weighs_distance_harder() {
        let index = index();
        let snap = snapshot(&[("S1", 10.0), ("S3", 30.0)], Metric::Temperature);
        let linear = neighbor_signal("S0", Metric::Temperature, 10.0, &index, &snap, &params())
            .unwrap()
            .expected;
        let squared = neighbor_signal(
            "S0",
            Metric::Temperature,
            10.0,
            &index,
            &snap,
            &NeighborParams { weight_exponent: 2, ..params() },
        )
        .unwrap()
        .expected;
        assert!(
            squared < linear,
            "exponent 2 should pull expectation further toward the near neighbor \
             ({} vs {})",
            squared,
            linear
        );
    }

    #[test]
    fn test_panel_takes_nearest_k_with_data() {
        let index = index();
        // k=1: only the nearest station with data participates. S1 has no
        // data, so S2 (next nearest) is the panel.
        let snap = snapshot(&[("S2", 20.0), ("S3", 40.0)], Metric::Temperature);
        let p = NeighborParams { k: 1, min_count: 1, weight_exponent: 1 };
        let signal = neighbor_signal("S0", Metric::Temperature, 20.0, &index, &snap, &p)
            .expect("S2 qualifies");
        assert_eq!(signal.neighbor_count, 1);
        assert_eq!(signal.expected, 20.0, "panel should be exactly S2");
    }

    #[test]
    fn test_wind_direction_gap_wraps_north() {
        let index = index();
        let snap = snapshot(&[("S1", 355.0), ("S2", 5.0)], Metric::WindDirection);
        let signal = neighbor_signal("S0", Metric::WindDirection, 10.0, &index, &snap, &params())
            .expect("two neighbors");
        // expectation sits near north; 10° is ~10° away, not ~350°
        assert!(signal.gap < 30.0, "circular gap must wrap, got {}", signal.gap);
    }

    #[test]
    fn test_unready_index_yields_none() {
        let index = StationIndex::new();
        let snap = snapshot(&[("S1", 29.0), ("S2", 29.0)], Metric::Temperature);
        assert!(
            neighbor_signal("S0", Metric::Temperature, 29.0, &index, &snap, &params()).is_none()
        );
    }
}
