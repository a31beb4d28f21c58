//! Drone specs and waypoint intake
//!
//! A [`DroneSpec`] is kept per broadcast id for the life of the process
//! (and across restarts via the snapshot). The [`DroneTable`] owns them and
//! applies the movement filter to incoming waypoints.

use chrono::Local;
use rid_relay_shared::{geo, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Radio transport a waypoint arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Bt4,
    Bt5,
    Wifi,
    Wnan,
    /// Forwarded by a peer
    R2c,
    Unknown,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Bt4,
        TransportKind::Bt5,
        TransportKind::Wifi,
        TransportKind::Wnan,
        TransportKind::R2c,
        TransportKind::Unknown,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Bt4 => "BT4",
            TransportKind::Bt5 => "BT5",
            TransportKind::Wifi => "WIFI",
            TransportKind::Wnan => "WNAN",
            TransportKind::R2c => "R2C",
            TransportKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "BT4" => TransportKind::Bt4,
            "BT5" => TransportKind::Bt5,
            "WIFI" => TransportKind::Wifi,
            "WNAN" => TransportKind::Wnan,
            "R2C" => TransportKind::R2c,
            _ => TransportKind::Unknown,
        })
    }
}

/// One decoded broadcast from the scanning layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub rid: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub alt: i64,
    /// Drone timestamp, epoch milliseconds
    pub ts: i64,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
}

fn default_transport() -> TransportKind {
    TransportKind::Unknown
}

/// Altitude the scanners report when the drone sent none
pub const INVALID_ALTITUDE: i64 = -1000;

/// Why a waypoint was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidPosition,
    StaleTimestamp,
    TooClose,
}

/// Keep only alphanumerics
pub fn sanitize_label(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Stopwatch for a flight segment
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlightTimer {
    start_ms: u64,
}

impl FlightTimer {
    pub fn restart(&mut self) {
        self.start_ms = now_ms();
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    /// Elapsed time as `HH:MM:SS.mmm`, empty if never started
    pub fn duration_string(&self) -> String {
        if self.start_ms == 0 {
            return String::new();
        }
        format_duration(now_ms().saturating_sub(self.start_ms))
    }
}

pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        ms % 1000
    )
}

/// Everything known about one drone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneSpec {
    remote_id: String,
    mapped_id: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub owner: String,
    #[serde(skip)]
    counts: [u64; 6],
    /// Wall-clock seconds of the last accepted waypoint
    #[serde(skip)]
    pub last_seen_secs: u64,
    #[serde(skip)]
    last_point: Option<(f64, f64, i64)>,
    #[serde(skip)]
    track_label: Option<String>,
    #[serde(skip)]
    flight: FlightTimer,
}

impl DroneSpec {
    /// New spec; None for an empty remote id
    pub fn new(remote_id: &str) -> Option<Self> {
        if remote_id.is_empty() {
            return None;
        }
        Some(Self {
            remote_id: remote_id.to_string(),
            mapped_id: remote_id.to_string(),
            org: String::new(),
            model: String::new(),
            owner: String::new(),
            counts: [0; 6],
            last_seen_secs: 0,
            last_point: None,
            track_label: None,
            flight: FlightTimer::default(),
        })
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn mapped_id(&self) -> &str {
        &self.mapped_id
    }

    /// Rename the display label; returns the old label if it changed
    pub fn set_mapped_id(&mut self, raw: &str) -> Option<String> {
        let clean = sanitize_label(raw);
        if clean.is_empty() || clean == self.mapped_id {
            return None;
        }
        debug!(rid = %self.remote_id, "Label '{}' -> '{}'", self.mapped_id, clean);
        Some(std::mem::replace(&mut self.mapped_id, clean))
    }

    pub fn has_default_label(&self) -> bool {
        self.mapped_id == self.remote_id
    }

    /// Fold a freshly loaded spec into this one
    ///
    /// Metadata only fills gaps; the label is taken only while ours is
    /// still the default.
    pub fn merge_with(&mut self, other: &DroneSpec) {
        if self.has_default_label() && !other.has_default_label() {
            self.mapped_id = other.mapped_id.clone();
        }
        if self.model.is_empty() {
            self.model = other.model.clone();
        }
        if self.org.is_empty() {
            self.org = other.org.clone();
        }
        if self.owner.is_empty() {
            self.owner = other.owner.clone();
        }
    }

    pub fn is_different_from(&self, other: &DroneSpec) -> bool {
        self.remote_id != other.remote_id
            || self.mapped_id != other.mapped_id
            || self.org != other.org
            || self.owner != other.owner
            || self.model != other.model
    }

    pub fn bump(&mut self, kind: TransportKind) {
        self.counts[kind.index()] += 1;
    }

    pub fn count(&self, kind: TransportKind) -> u64 {
        self.counts[kind.index()]
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn last_point(&self) -> Option<(f64, f64, i64)> {
        self.last_point
    }

    /// Current segment label, if a segment is running
    pub fn track_label(&self) -> Option<&str> {
        self.track_label.as_deref()
    }

    /// Start a new segment unless one is running; returns the label
    pub fn ensure_segment(&mut self) -> String {
        if let Some(label) = &self.track_label {
            return label.clone();
        }
        let label = self.new_track_label();
        info!(rid = %self.remote_id, "New track segment {}", label);
        self.flight.restart();
        self.track_label = Some(label.clone());
        label
    }

    /// Re-derive the running segment's label after a rename
    pub fn relabel_segment(&mut self) -> Option<String> {
        if self.track_label.is_some() {
            let label = self.new_track_label();
            self.track_label = Some(label.clone());
            Some(label)
        } else {
            None
        }
    }

    pub fn end_segment(&mut self) {
        self.track_label = None;
    }

    fn new_track_label(&self) -> String {
        format!("{}_{}", self.mapped_id, Local::now().format("%H%M%S%b%d"))
    }

    pub fn flight_duration(&self) -> String {
        self.flight.duration_string()
    }

    /// Apply the sanity and movement filters, recording the point if it passes
    pub fn accept(&mut self, wp: &Waypoint, min_distance_feet: f64) -> Result<(), Rejection> {
        if wp.alt == INVALID_ALTITUDE || (wp.lat == 0.0 && wp.lng == 0.0) {
            return Err(Rejection::InvalidPosition);
        }
        if let Some((lat, lng, ts)) = self.last_point {
            if wp.ts <= ts {
                return Err(Rejection::StaleTimestamp);
            }
            if geo::rough_delta_feet(lat, lng, wp.lat, wp.lng) < min_distance_feet {
                return Err(Rejection::TooClose);
            }
        }
        self.last_point = Some((wp.lat, wp.lng, wp.ts));
        self.last_seen_secs = now_ms() / 1000;
        Ok(())
    }
}

impl PartialEq for DroneSpec {
    fn eq(&self, other: &Self) -> bool {
        self.remote_id == other.remote_id
    }
}

impl Eq for DroneSpec {}

impl PartialOrd for DroneSpec {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DroneSpec {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.remote_id.cmp(&other.remote_id)
    }
}

/// All known drone specs, keyed by remote id
#[derive(Debug, Default)]
pub struct DroneTable {
    specs: HashMap<String, DroneSpec>,
}

impl DroneTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: Vec<DroneSpec>) -> Self {
        let mut table = Self::new();
        for spec in specs {
            table.specs.insert(spec.remote_id.clone(), spec);
        }
        table
    }

    pub fn get(&self, rid: &str) -> Option<&DroneSpec> {
        self.specs.get(rid)
    }

    pub fn get_mut(&mut self, rid: &str) -> Option<&mut DroneSpec> {
        self.specs.get_mut(rid)
    }

    /// Spec for `rid`, created on first sight
    pub fn entry(&mut self, rid: &str) -> Option<&mut DroneSpec> {
        if !self.specs.contains_key(rid) {
            let spec = DroneSpec::new(rid)?;
            self.specs.insert(rid.to_string(), spec);
        }
        self.specs.get_mut(rid)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Specs seen within `max_age_secs`, sorted; all of them when the age is zero
    pub fn sorted_current(&self, max_age_secs: u64) -> Vec<DroneSpec> {
        let now_secs = now_ms() / 1000;
        let mut specs: Vec<DroneSpec> = self
            .specs
            .values()
            .filter(|s| max_age_secs == 0 || now_secs.saturating_sub(s.last_seen_secs) <= max_age_secs)
            .cloned()
            .collect();
        specs.sort();
        specs
    }

    /// Every spec, sorted, for persistence
    pub fn all_sorted(&self) -> Vec<DroneSpec> {
        let mut specs: Vec<DroneSpec> = self.specs.values().cloned().collect();
        specs.sort();
        specs
    }

    /// Apply a label file; returns remote ids whose label changed
    pub fn apply_labels(&mut self, incoming: Vec<DroneSpec>, replace: bool) -> Vec<String> {
        let mut relabelled = Vec::new();
        for spec in incoming {
            let rid = spec.remote_id.clone();
            match self.specs.get_mut(&rid) {
                Some(existing) => {
                    let before = existing.mapped_id.clone();
                    if replace {
                        existing.set_mapped_id(&spec.mapped_id);
                        existing.org = spec.org.clone();
                        existing.model = spec.model.clone();
                        existing.owner = spec.owner.clone();
                    } else {
                        existing.merge_with(&spec);
                    }
                    if existing.mapped_id != before {
                        relabelled.push(rid);
                    }
                }
                None => {
                    self.specs.insert(rid, spec);
                }
            }
        }
        relabelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(lat: f64, lng: f64, ts: i64) -> Waypoint {
        Waypoint {
            rid: "D1".into(),
            lat,
            lng,
            alt: 120,
            ts,
            transport: TransportKind::Bt5,
        }
    }

    #[test]
    fn test_empty_remote_id_rejected() {
        assert!(DroneSpec::new("").is_none());
        let spec = DroneSpec::new("1581F5").unwrap();
        assert_eq!(spec.mapped_id(), "1581F5");
        assert!(spec.has_default_label());
    }

    #[test]
    fn test_mapped_id_sanitized() {
        let mut spec = DroneSpec::new("1581F5").unwrap();
        assert_eq!(spec.set_mapped_id("Red Mavic #2"), Some("1581F5".to_string()));
        assert_eq!(spec.mapped_id(), "RedMavic2");
        assert_eq!(spec.set_mapped_id("!!"), None);
        assert_eq!(spec.set_mapped_id("RedMavic2"), None);
        assert_eq!(spec.remote_id(), "1581F5");
    }

    #[test]
    fn test_merge_keeps_custom_label() {
        let mut ours = DroneSpec::new("D1").unwrap();
        let mut theirs = DroneSpec::new("D1").unwrap();
        theirs.set_mapped_id("Alpha");
        theirs.org = "SAR".into();

        ours.merge_with(&theirs);
        assert_eq!(ours.mapped_id(), "Alpha");
        assert_eq!(ours.org, "SAR");

        let mut other = DroneSpec::new("D1").unwrap();
        other.set_mapped_id("Bravo");
        other.org = "Fire".into();
        ours.merge_with(&other);
        assert_eq!(ours.mapped_id(), "Alpha");
        assert_eq!(ours.org, "SAR");
    }

    #[test]
    fn test_waypoint_filters() {
        let mut spec = DroneSpec::new("D1").unwrap();
        let mut bad = wp(45.0, -122.0, 1_000);
        bad.alt = INVALID_ALTITUDE;
        assert_eq!(spec.accept(&bad, 2.0), Err(Rejection::InvalidPosition));
        assert_eq!(spec.accept(&wp(0.0, 0.0, 1_000), 2.0), Err(Rejection::InvalidPosition));

        assert_eq!(spec.accept(&wp(45.0, -122.0, 1_000), 2.0), Ok(()));
        assert_eq!(spec.accept(&wp(45.001, -122.0, 1_000), 2.0), Err(Rejection::StaleTimestamp));
        // About 0.36 ft of movement
        assert_eq!(spec.accept(&wp(45.000001, -122.0, 2_000), 2.0), Err(Rejection::TooClose));
        assert_eq!(spec.accept(&wp(45.0001, -122.0, 3_000), 2.0), Ok(()));
        assert_eq!(spec.last_point(), Some((45.0001, -122.0, 3_000)));
        assert!(spec.last_seen_secs > 0);
    }

    #[test]
    fn test_segment_label() {
        let mut spec = DroneSpec::new("D1").unwrap();
        assert!(spec.track_label().is_none());
        let label = spec.ensure_segment();
        assert!(label.starts_with("D1_"));
        assert_eq!(spec.ensure_segment(), label);

        spec.set_mapped_id("Alpha");
        assert!(spec.relabel_segment().unwrap().starts_with("Alpha_"));
        spec.end_segment();
        assert!(spec.relabel_segment().is_none());
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(format_duration(3_723_045), "01:02:03.045");
        assert_eq!(FlightTimer::default().duration_string(), "");
    }

    #[test]
    fn test_transport_counts() {
        let mut spec = DroneSpec::new("D1").unwrap();
        spec.bump(TransportKind::Wifi);
        spec.bump(TransportKind::Wifi);
        spec.bump(TransportKind::R2c);
        assert_eq!(spec.count(TransportKind::Wifi), 2);
        assert_eq!(spec.total_count(), 3);
        assert_eq!("wnan".parse::<TransportKind>().unwrap(), TransportKind::Wnan);
        assert_eq!(TransportKind::R2c.to_string(), "R2C");
    }

    #[test]
    fn test_sorted_current_ages_out() {
        let mut table = DroneTable::new();
        table.entry("B").unwrap().last_seen_secs = now_ms() / 1000;
        table.entry("A").unwrap().last_seen_secs = now_ms() / 1000 - 5;
        table.entry("C").unwrap().last_seen_secs = now_ms() / 1000 - 500;

        let ids: Vec<String> = table.sorted_current(60).iter().map(|s| s.remote_id().to_string()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(table.sorted_current(0).len(), 3);
    }

    #[test]
    fn test_apply_labels_replace_and_merge() {
        let mut table = DroneTable::new();
        table.entry("D1").unwrap().set_mapped_id("Alpha");

        let mut incoming = DroneSpec::new("D1").unwrap();
        incoming.set_mapped_id("Bravo");
        let fresh = DroneSpec::new("D2").unwrap();

        assert!(table.apply_labels(vec![incoming.clone(), fresh], false).is_empty());
        assert_eq!(table.get("D1").unwrap().mapped_id(), "Alpha");
        assert!(table.get("D2").is_some());

        assert_eq!(table.apply_labels(vec![incoming], true), vec!["D1".to_string()]);
        assert_eq!(table.get("D1").unwrap().mapped_id(), "Bravo");
    }
}
