//! Live track lifecycle
//!
//! This module handles:
//! - Buffering waypoints while ownership is being decided
//! - Creating the backend live track and feeding it one point at a time
//! - Forwarding sightings when a peer owns the drone
//! - Archiving the track when it goes idle, the map changes or on shutdown

mod live_track;

pub use live_track::{ArchiveJob, LiveTrack, TrackAction, TrackError, TrackPoint, TrackState};
