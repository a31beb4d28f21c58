//! rid-relay Shared Protocol Types
//!
//! This crate provides the wire types, codec and ownership arbitration
//! rules shared by every scanner node taking part in drone-track
//! publication.

pub mod codec;
pub mod state_machine;
pub mod wire;

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use wire::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing and sizing parameters for the relay
pub mod timing {
    /// Requests allowed in flight on one pipe before sends are refused
    pub const PIPE_MAX_OUTSTANDING: usize = 3;

    /// Samples in the per-pipe round-trip average
    pub const PIPE_RTT_WINDOW: usize = 20;

    /// Samples in the per-peer round-trip averages
    pub const PEER_RTT_WINDOW: usize = 10;

    /// Samples in the backend round-trip average
    pub const BACKEND_RTT_WINDOW: usize = 10;

    /// Lifetime of a request signature
    pub const SIGNATURE_TTL_MS: u64 = 120_000;

    /// Lower bound of the retry delay while the backend is unreachable
    pub const RETRY_MIN_DELAY_MS: u64 = 3_000;

    /// Upper bound of the retry delay while the backend is unreachable
    pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

    /// Own-marker heartbeat and incremental map sync interval
    pub const MAP_UPDATE_INTERVAL_MS: u64 = 45_000;

    /// Delay before the first own-marker refresh after the map comes up
    pub const MARKER_FIRST_REFRESH_MS: u64 = 10_000;

    /// Longest synchronous wait on a backend operation
    pub const MAX_OP_DURATION_MS: u64 = 20_000;

    /// Overlap subtracted from the last sync time on incremental fetches
    pub const SYNC_OVERLAP_MS: u64 = 500;

    /// Idle time before a track segment is finished and ownership released
    pub const DEFAULT_NEW_TRACK_DELAY_SECS: u64 = 20;

    /// Floor for the configurable new-track delay
    pub const MIN_NEW_TRACK_DELAY_SECS: u64 = 15;

    /// Drones not seen for this long drop out of the display list
    pub const DEFAULT_MAX_DISPLAY_AGE_SECS: u64 = 60;

    /// Floor and default for the minimum waypoint movement
    pub const MIN_DISTANCE_FEET: u64 = 2;

    /// Position accuracy required before the own marker is placed
    pub const GPS_ACCURACY_LIMIT_M: f64 = 30.0;

    /// A fix older than this is replaced by any newer one
    pub const FIX_MAX_AGE_MS: u64 = 120_000;

    /// Peer-resolution retries before the map is brought up regardless
    pub const MAX_MAP_STARTUP_RETRIES: u32 = 45;

    /// Interval between peer-resolution retries
    pub const PEER_RESOLVE_RETRY_MS: u64 = 1_000;

    /// TCP port peers listen on
    pub const PEER_PORT: u16 = 8443;

    /// WebSocket path peers listen on
    pub const PEER_PATH: &str = "/R2CRestV1";
}

/// Simple moving average over the last `window` samples
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<u64>,
    sum: u64,
}

impl MovingAverage {
    /// Create an average over at most `window` samples
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            sum: 0,
        }
    }

    /// Add a sample and return the updated average
    pub fn next(&mut self, sample: u64) -> f64 {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
        self.get()
    }

    /// Current average, zero before the first sample
    pub fn get(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Geodesic helpers
pub mod geo {
    /// Mean earth radius in metres
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    /// Earth radius in feet used for short-hop movement checks
    const EARTH_RADIUS_FT: f64 = 2.093e7;

    /// Great-circle distance between two points in metres (haversine)
    pub fn distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
        let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
        let dphi = (lat2 - lat1).to_radians();
        let dlambda = (lng2 - lng1).to_radians();

        let a = (dphi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }

    /// Equirectangular approximation of a short hop, in feet
    pub fn rough_delta_feet(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
        let x = (lng2 - lng1).to_radians() * ((lat1 + lat2) / 2.0).to_radians().cos();
        let y = (lat2 - lat1).to_radians();
        (x * x + y * y).sqrt() * EARTH_RADIUS_FT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.get(), 0.0);
        avg.next(10);
        avg.next(20);
        assert_eq!(avg.next(30), 20.0);
        // Oldest sample falls out
        assert_eq!(avg.next(60), 110.0 / 3.0);
        assert_eq!(avg.len(), 3);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let d = geo::distance_m(45.0, -122.0, 46.0, -122.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {}", d);
    }

    #[test]
    fn test_rough_delta_feet_small_hop() {
        // ~0.00001 degrees of latitude is a little over 3.6 feet
        let d = geo::rough_delta_feet(45.0, -122.0, 45.00001, -122.0);
        assert!(d > 3.0 && d < 4.0, "got {}", d);
        assert_eq!(geo::rough_delta_feet(45.0, -122.0, 45.0, -122.0), 0.0);
    }
}
