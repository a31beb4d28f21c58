//! Everything that can arrive on the coordinator's event channel

use std::path::PathBuf;
use tokio::sync::oneshot;

use crate::config::{BackendConfig, ConfigFile};
use crate::drone::{DroneSpec, Waypoint};
use crate::identity::Fix;
use crate::map::{MapCall, MapState};
use crate::peer::PeerSummary;
use crate::remote::Op;

#[derive(Debug)]
pub enum CoordinatorEvent {
    /// Decoded broadcast from the scanning layer
    Waypoint {
        wp: Waypoint,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// A backend call finished
    OpDone { purpose: Purpose, op: Op },
    Timer(TimerEvent),
    Configure(ConfigChange),
    Query(Query),
    Shutdown { done: oneshot::Sender<()> },
}

/// Why a backend call was issued
#[derive(Debug, Clone, PartialEq)]
pub enum Purpose {
    Map { call: MapCall, generation: u64 },
    TrackStart { rid: String, epoch: u64 },
    TrackPoint { rid: String, epoch: u64 },
    TrackRename { rid: String },
    /// Live track converted to a shape; delete the live object next
    ArchiveEdit { live_id: String },
    /// Points drawn as a fresh archived line
    ArchiveLine { rid: String },
    DeleteLive { live_id: String },
    Legacy { rid: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    Idle { rid: String },
    MapResolve { generation: u64 },
    MapReopen { generation: u64 },
    Heartbeat { generation: u64 },
    StatusLog,
}

/// Runtime configuration updates from the UI or an imported file
#[derive(Debug, Clone)]
pub enum ConfigChange {
    MapId(String),
    GroupId(String),
    TrackFolder(String),
    MinDistanceFeet(u64),
    NewTrackDelaySecs(u64),
    MaxDisplayAgeSecs(u64),
    Credentials(BackendConfig),
    UseDirect(bool),
    NodeName(String),
    ArchiveDir(Option<PathBuf>),
    Position(Fix),
    Label { rid: String, mapped_id: String },
    Import(ConfigFile),
}

#[derive(Debug)]
pub enum Query {
    /// Specs seen within the display age, sorted by remote id
    Drones(oneshot::Sender<Vec<DroneSpec>>),
    MapState(oneshot::Sender<MapState>),
    Peers(oneshot::Sender<Vec<PeerSummary>>),
}
