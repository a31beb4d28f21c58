//! Per-drone live track state machine

use rid_relay_shared::state_machine::{OwnershipEvent, OwnershipMachine, OwnershipStatus, TransitionResult};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::peer::Resolution;
use crate::remote::api::{lng_lat, touch};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackError {
    #[error("{rid}: backend track could not be created: {reason}")]
    StartFailed { rid: String, reason: String },

    #[error("{rid}: point write failed: {reason}")]
    WriteFailed { rid: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Inactive,
    PendingOwnership,
    PublishingLocally,
    Forwarding,
    Reevaluating,
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackState::Inactive => write!(f, "inactive"),
            TrackState::PendingOwnership => write!(f, "pending-ownership"),
            TrackState::PublishingLocally => write!(f, "publishing-locally"),
            TrackState::Forwarding => write!(f, "forwarding"),
            TrackState::Reevaluating => write!(f, "reevaluating"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub lat: f64,
    pub lng: f64,
    /// Drone timestamp, epoch milliseconds
    pub ts: i64,
}

/// Everything needed to turn a track into an archived line
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveJob {
    pub rid: String,
    pub title: String,
    /// Backend live track to convert; None means the points were never
    /// published and a fresh line is drawn
    pub live_id: Option<String>,
    pub feature: Option<Value>,
    /// `[lng, lat]` pairs
    pub coordinates: Vec<Value>,
}

/// Effects requested by a track
#[derive(Debug, Clone, PartialEq)]
pub enum TrackAction {
    ResolveOwnership { first_ts: i64, lat: f64, lng: f64 },
    StartBackendTrack { title: String, device_id: String },
    PublishPoint { device_id: String, lat: f64, lng: f64 },
    ForwardSeen { lat: f64, lng: f64, ts: i64 },
    Archive(ArchiveJob),
    ReleaseOwnership,
    RenameBackend { live_id: String, feature: Value },
}

/// One drone's track segment as this node sees it
///
/// Every backend result is tagged with the [`epoch`](LiveTrack::epoch) it
/// was issued under; the epoch moves on each reset so late results for an
/// archived segment can be recognised and dropped.
#[derive(Debug)]
pub struct LiveTrack {
    rid: String,
    device_id: String,
    title: String,
    window_ms: i64,
    points: Vec<TrackPoint>,
    /// Next point to publish
    sent: usize,
    ownership: OwnershipMachine,
    backend_id: Option<String>,
    backend_feature: Option<Value>,
    starting: bool,
    writing: bool,
    map_up: bool,
    failed: bool,
    epoch: u64,
}

impl LiveTrack {
    pub fn new(rid: &str, device_id: &str, title: &str, window_ms: i64) -> Self {
        Self {
            rid: rid.to_string(),
            device_id: device_id.to_string(),
            title: title.to_string(),
            window_ms,
            points: Vec::new(),
            sent: 0,
            ownership: OwnershipMachine::new(),
            backend_id: None,
            backend_feature: None,
            starting: false,
            writing: false,
            map_up: false,
            failed: false,
            epoch: 0,
        }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    pub fn status(&self) -> OwnershipStatus {
        self.ownership.status()
    }

    pub fn state(&self) -> TrackState {
        if self.failed {
            return TrackState::Inactive;
        }
        match self.ownership.status() {
            OwnershipStatus::Unknown => TrackState::Inactive,
            OwnershipStatus::Pending => TrackState::PendingOwnership,
            OwnershipStatus::PublishLocally => TrackState::PublishingLocally,
            OwnershipStatus::ForwardToPeer => TrackState::Forwarding,
            OwnershipStatus::Reevaluate => TrackState::Reevaluating,
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.state() == TrackState::PublishingLocally
    }

    /// Oldest buffered waypoint
    pub fn first_timestamp(&self) -> Option<i64> {
        self.points.first().map(|p| p.ts)
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn published_count(&self) -> usize {
        self.sent
    }

    pub fn set_window_ms(&mut self, window_ms: i64) {
        self.window_ms = window_ms;
    }

    /// A new accepted waypoint
    pub fn add_point(&mut self, lat: f64, lng: f64, ts: i64) -> Vec<TrackAction> {
        if self.failed {
            return Vec::new();
        }
        self.points.push(TrackPoint { lat, lng, ts });

        match self.ownership.status() {
            OwnershipStatus::Unknown | OwnershipStatus::Reevaluate => self.start_resolution(),
            OwnershipStatus::Pending => Vec::new(),
            OwnershipStatus::PublishLocally => self.flush(),
            OwnershipStatus::ForwardToPeer => {
                // Only points inside the handover window matter for a later reevaluate
                let cutoff = ts - self.window_ms;
                self.points.retain(|p| p.ts >= cutoff);
                vec![TrackAction::ForwardSeen { lat, lng, ts }]
            }
        }
    }

    fn start_resolution(&mut self) -> Vec<TrackAction> {
        let Some(first) = self.points.first().copied() else {
            return Vec::new();
        };
        self.ownership.process_event(OwnershipEvent::ClaimBroadcast);
        vec![TrackAction::ResolveOwnership {
            first_ts: first.ts,
            lat: first.lat,
            lng: first.lng,
        }]
    }

    /// Outcome of an arbitration round
    pub fn on_resolution(&mut self, resolution: &Resolution) -> Vec<TrackAction> {
        match resolution {
            Resolution::Pending => Vec::new(),
            Resolution::PublishLocally => match self.ownership.process_event(OwnershipEvent::ClaimWon) {
                TransitionResult::Invalid { from, .. } => {
                    warn!(rid = %self.rid, "Ignoring ownership win while {}", from);
                    Vec::new()
                }
                _ => {
                    info!(rid = %self.rid, "Publishing locally");
                    self.flush()
                }
            },
            Resolution::Forward { owner } => match self.ownership.process_event(OwnershipEvent::PeerOwns) {
                TransitionResult::Demoted => {
                    warn!(rid = %self.rid, owner = %owner, "Lost drone after publishing started");
                    let actions = self.archive_job().map(TrackAction::Archive).into_iter().collect();
                    self.backend_id = None;
                    self.backend_feature = None;
                    self.starting = false;
                    self.writing = false;
                    self.points = self.points.split_off(self.sent);
                    self.sent = 0;
                    self.epoch += 1;
                    actions
                }
                TransitionResult::Success(_) => {
                    info!(rid = %self.rid, owner = %owner, "Forwarding to peer");
                    self.points
                        .iter()
                        .map(|p| TrackAction::ForwardSeen {
                            lat: p.lat,
                            lng: p.lng,
                            ts: p.ts,
                        })
                        .collect()
                }
                TransitionResult::Invalid { from, .. } => {
                    warn!(rid = %self.rid, "Ignoring forward while {}", from);
                    Vec::new()
                }
            },
        }
    }

    pub fn set_map_up(&mut self, up: bool) -> Vec<TrackAction> {
        self.map_up = up;
        if up {
            self.flush()
        } else {
            Vec::new()
        }
    }

    /// Issue the next backend write if none is in flight
    pub fn flush(&mut self) -> Vec<TrackAction> {
        if !self.is_publishing() || !self.map_up {
            return Vec::new();
        }
        if self.backend_id.is_none() {
            if self.starting {
                return Vec::new();
            }
            self.starting = true;
            return vec![TrackAction::StartBackendTrack {
                title: self.title.clone(),
                device_id: self.device_id.clone(),
            }];
        }
        if self.writing {
            return Vec::new();
        }
        let Some(point) = self.points.get(self.sent) else {
            return Vec::new();
        };
        self.writing = true;
        vec![TrackAction::PublishPoint {
            device_id: self.device_id.clone(),
            lat: point.lat,
            lng: point.lng,
        }]
    }

    /// No start request went out; the next flush tries again
    pub fn start_skipped(&mut self) {
        self.starting = false;
    }

    /// Backend live track creation finished
    pub fn on_started(&mut self, result: Result<(String, Value), String>) -> Result<Vec<TrackAction>, TrackError> {
        self.starting = false;
        match result {
            Ok((id, feature)) => {
                info!(rid = %self.rid, "Live track {} created as '{}'", id, self.title);
                self.backend_id = Some(id);
                self.backend_feature = Some(feature);
                Ok(self.flush())
            }
            Err(reason) => {
                self.failed = true;
                Err(TrackError::StartFailed {
                    rid: self.rid.clone(),
                    reason,
                })
            }
        }
    }

    /// The in-flight point write finished
    pub fn on_point_written(&mut self, result: Result<(), String>) -> Result<Vec<TrackAction>, TrackError> {
        self.writing = false;
        match result {
            Ok(()) => {
                self.sent += 1;
                debug!(rid = %self.rid, "Point {}/{} written", self.sent, self.points.len());
                Ok(self.flush())
            }
            Err(reason) => {
                self.failed = true;
                Err(TrackError::WriteFailed {
                    rid: self.rid.clone(),
                    reason,
                })
            }
        }
    }

    /// The owner went away: drop stale points and arbitrate again
    pub fn reevaluate(&mut self, now_ms: i64) -> Vec<TrackAction> {
        if self.failed || self.ownership.status() == OwnershipStatus::PublishLocally {
            return Vec::new();
        }
        if let TransitionResult::Invalid { from, .. } = self.ownership.process_event(OwnershipEvent::OwnerReleased) {
            debug!(rid = %self.rid, "Nothing to reevaluate while {}", from);
            return Vec::new();
        }

        let cutoff = now_ms - self.window_ms;
        self.points.retain(|p| p.ts >= cutoff);
        self.sent = 0;
        if self.points.is_empty() {
            info!(rid = %self.rid, "Owner gone and no recent points");
            self.ownership.process_event(OwnershipEvent::Reset);
            return Vec::new();
        }
        info!(rid = %self.rid, "Owner gone, re-arbitrating with {} points", self.points.len());
        self.start_resolution()
    }

    /// End the segment: release, archive and clear
    pub fn finish(&mut self) -> Vec<TrackAction> {
        let mut actions = Vec::new();
        if self.ownership.status() == OwnershipStatus::PublishLocally {
            actions.push(TrackAction::ReleaseOwnership);
            if let Some(job) = self.archive_job() {
                actions.push(TrackAction::Archive(job));
            }
        }
        self.reset();
        actions
    }

    fn archive_job(&self) -> Option<ArchiveJob> {
        let written = match &self.backend_id {
            Some(_) => &self.points[..self.sent],
            None => &self.points[..],
        };
        if written.is_empty() && self.backend_id.is_none() {
            return None;
        }
        Some(ArchiveJob {
            rid: self.rid.clone(),
            title: self.title.clone(),
            live_id: self.backend_id.clone(),
            feature: self.backend_feature.clone(),
            coordinates: written.iter().map(|p| lng_lat(p.lat, p.lng)).collect(),
        })
    }

    fn reset(&mut self) {
        self.ownership.process_event(OwnershipEvent::Reset);
        self.points.clear();
        self.sent = 0;
        self.backend_id = None;
        self.backend_feature = None;
        self.starting = false;
        self.writing = false;
        self.failed = false;
        self.epoch += 1;
    }

    /// New display title; point writes keep using the original device id
    pub fn rename(&mut self, title: &str) -> Vec<TrackAction> {
        if title == self.title {
            return Vec::new();
        }
        self.title = title.to_string();
        let (Some(live_id), Some(feature)) = (&self.backend_id, &mut self.backend_feature) else {
            return Vec::new();
        };
        if !feature["properties"].is_object() {
            feature["properties"] = json!({});
        }
        if let Some(props) = feature["properties"].as_object_mut() {
            props.insert("title".into(), json!(title));
            touch(props);
        }
        vec![TrackAction::RenameBackend {
            live_id: live_id.clone(),
            feature: feature.clone(),
        }]
    }
}
