//! Shared-map session and peer rendezvous
//!
//! This module handles:
//! - Opening a map and classifying its features
//! - Finding or creating the track and archive folders
//! - Discovering peers from their rendezvous markers
//! - Archiving live tracks orphaned by a previous run
//! - Heartbeat refresh of this node's own marker

mod features;
mod session;

pub use features::{
    archive_folder_name, label_from_title, parse_sync, FeatureClass, MapError, MapFeature,
    PeerMarker, SyncResult,
};
pub use session::{FolderRole, MapAction, MapCall, MapSession, MapState, SessionContext};
