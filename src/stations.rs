//! Spatial index over the station network.
//!
//! The neighbor-consistency signal needs "which stations sit near this one"
//! on every tick. Station sets are small (tens to low hundreds) and change
//! rarely, so the index precomputes, per station, the full list of other
//! stations sorted by distance at rebuild time; a neighbor query is then a
//! prefix of that list. Rebuild is an explicit call made between ticks —
//! never during one — and the index reports `ready() == false` until the
//! first successful rebuild rather than hydrating itself on first use.
//!
//! Distance metric: equirectangular planar approximation in kilometers
//! (111.32 km per degree of latitude, longitude scaled by the cosine of the
//! network's mean latitude). Error is negligible at metro scale (< 100 km
//! across), which is the deployment target; great-circle distance would be
//! overkill here.

use std::collections::HashMap;

use crate::model::Station;

/// Kilometers per degree of latitude (WGS84 mean).
const KM_PER_DEG_LAT: f64 = 111.32;

// ---------------------------------------------------------------------------
// StationIndex
// ---------------------------------------------------------------------------

pub struct StationIndex {
    stations: Vec<Station>,
    id_to_idx: HashMap<String, usize>,
    /// For each station, every other station as (index, distance_km),
    /// ascending by distance. Ties break by station_id order for
    /// deterministic neighbor sets.
    neighbor_lists: Vec<Vec<(usize, f64)>>,
}

impl StationIndex {
    /// An empty, not-yet-ready index.
    pub fn new() -> Self {
        StationIndex {
            stations: Vec::new(),
            id_to_idx: HashMap::new(),
            neighbor_lists: Vec::new(),
        }
    }

    /// Rebuild the index from the current station set. Stations with
    /// non-finite coordinates are dropped (the collector occasionally
    /// discovers stations before their metadata is complete).
    pub fn rebuild(&mut self, stations: Vec<Station>) {
        let mut kept: Vec<Station> = stations
            .into_iter()
            .filter(|s| s.latitude.is_finite() && s.longitude.is_finite())
            .collect();
        kept.sort_by(|a, b| a.station_id.cmp(&b.station_id));
        kept.dedup_by(|a, b| a.station_id == b.station_id);

        let coords = to_xy_km(&kept);

        let mut lists = Vec::with_capacity(kept.len());
        for i in 0..kept.len() {
            let mut others: Vec<(usize, f64)> = (0..kept.len())
                .filter(|&j| j != i)
                .map(|j| {
                    let dx = coords[i].0 - coords[j].0;
                    let dy = coords[i].1 - coords[j].1;
                    (j, (dx * dx + dy * dy).sqrt())
                })
                .collect();
            others.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| kept[a.0].station_id.cmp(&kept[b.0].station_id))
            });
            lists.push(others);
        }

        self.id_to_idx = kept
            .iter()
            .enumerate()
            .map(|(i, s)| (s.station_id.clone(), i))
            .collect();
        self.stations = kept;
        self.neighbor_lists = lists;
    }

    /// True once the index holds enough stations for neighbor queries.
    pub fn ready(&self) -> bool {
        self.stations.len() >= 2
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, station_id: &str) -> Option<&Station> {
        self.id_to_idx.get(station_id).map(|&i| &self.stations[i])
    }

    /// Human-readable name, or the id itself for unknown stations.
    pub fn name<'a>(&'a self, station_id: &'a str) -> &'a str {
        match self.get(station_id) {
            Some(s) if !s.name.is_empty() => &s.name,
            _ => station_id,
        }
    }

    /// Up to `k` nearest other stations as (station, distance_km), nearest
    /// first. Empty when the index is not ready or the station is unknown.
    pub fn neighbors(&self, station_id: &str, k: usize) -> Vec<(&Station, f64)> {
        if !self.ready() {
            return Vec::new();
        }
        let Some(&idx) = self.id_to_idx.get(station_id) else {
            return Vec::new();
        };
        self.neighbor_lists[idx]
            .iter()
            .take(k)
            .map(|&(j, d)| (&self.stations[j], d))
            .collect()
    }
}

impl Default for StationIndex {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Project lat/lon to local planar (x, y) in kilometers around the network
/// centroid.
fn to_xy_km(stations: &[Station]) -> Vec<(f64, f64)> {
    if stations.is_empty() {
        return Vec::new();
    }
    let n = stations.len() as f64;
    let lat0 = stations.iter().map(|s| s.latitude).sum::<f64>() / n;
    let lon0 = stations.iter().map(|s| s.longitude).sum::<f64>() / n;
    let lat_scale = lat0.to_radians().cos();
    stations
        .iter()
        .map(|s| {
            (
                (s.longitude - lon0) * lat_scale * KM_PER_DEG_LAT,
                (s.latitude - lat0) * KM_PER_DEG_LAT,
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str, lat: f64, lon: f64) -> Station {
        Station {
            station_id: id.to_string(),
            name: format!("Station {}", id),
            latitude: lat,
            longitude: lon,
        }
    }

    /// A small line of stations along the equator, 0.01° (~1.1 km) apart.
    fn line_index() -> StationIndex {
        let mut index = StationIndex::new();
        index.rebuild(vec![
            station("S1", 0.0, 0.00),
            station("S2", 0.0, 0.01),
            station("S3", 0.0, 0.02),
            station("S4", 0.0, 0.04),
        ]);
        index
    }

    #[test]
    fn test_empty_index_is_not_ready() {
        let index = StationIndex::new();
        assert!(!index.ready());
        assert!(index.neighbors("S1", 3).is_empty());
    }

    #[test]
    fn test_single_station_is_not_ready() {
        let mut index = StationIndex::new();
        index.rebuild(vec![station("S1", 1.0, 103.0)]);
        assert!(!index.ready(), "one station has no possible neighbors");
    }

    #[test]
    fn test_neighbors_sorted_nearest_first_excluding_self() {
        let index = line_index();
        let nbrs = index.neighbors("S1", 3);
        let ids: Vec<&str> = nbrs.iter().map(|(s, _)| s.station_id.as_str()).collect();
        assert_eq!(ids, vec!["S2", "S3", "S4"]);
        assert!(
            nbrs.windows(2).all(|w| w[0].1 <= w[1].1),
            "distances must be ascending: {:?}",
            nbrs.iter().map(|(_, d)| d).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_k_larger_than_network_is_safe() {
        let index = line_index();
        assert_eq!(index.neighbors("S2", 50).len(), 3);
    }

    #[test]
    fn test_unknown_station_has_no_neighbors() {
        let index = line_index();
        assert!(index.neighbors("nope", 3).is_empty());
    }

    #[test]
    fn test_distance_approximates_degree_of_latitude() {
        let mut index = StationIndex::new();
        index.rebuild(vec![station("A", 0.0, 0.0), station("B", 1.0, 0.0)]);
        let nbrs = index.neighbors("A", 1);
        let d = nbrs[0].1;
        assert!(
            (d - 111.32).abs() < 0.5,
            "1° of latitude should be ~111.32 km, got {}",
            d
        );
    }

    #[test]
    fn test_rebuild_drops_non_finite_coordinates() {
        let mut index = StationIndex::new();
        index.rebuild(vec![
            station("A", 0.0, 0.0),
            station("B", f64::NAN, 0.01),
            station("C", 0.0, 0.02),
        ]);
        assert_eq!(index.len(), 2);
        assert!(index.get("B").is_none());
    }

    #[test]
    fn test_rebuild_replaces_previous_contents() {
        let mut index = line_index();
        index.rebuild(vec![station("X", 0.0, 0.0), station("Y", 0.0, 0.01)]);
        assert_eq!(index.len(), 2);
        assert!(index.get("S1").is_none(), "old stations must be gone after rebuild");
    }

    #[test]
    fn test_name_falls_back_to_id_for_unknown() {
        let index = line_index();
        assert_eq!(index.name("S1"), "Station S1");
        assert_eq!(index.name("ghost"), "ghost");
    }
}
