//! Connection to one shared map
//!
//! The session never performs IO itself. Every input returns the
//! [`MapAction`]s the coordinator must carry out; backend completions and
//! timer ticks come back in tagged with the generation they were issued
//! under, so results from a previous map are dropped.

use chrono::NaiveDate;
use rid_relay_shared::timing;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::features::{archive_folder_name, parse_sync, FeatureClass, MapFeature, PeerMarker};
use crate::identity::NodeIdentity;
use crate::remote::api::{archived_shape, touch};
use crate::remote::{MapApi, Op, OpRequest};

/// Retries before peer resolution gives up waiting for a local address
const MAX_ADDR_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapState {
    #[default]
    Idle,
    Opening,
    CreatingFolders,
    PeersResolving,
    Up,
    Down,
}

impl fmt::Display for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MapState::Idle => "idle",
            MapState::Opening => "opening",
            MapState::CreatingFolders => "creating-folders",
            MapState::PeersResolving => "peers-resolving",
            MapState::Up => "up",
            MapState::Down => "down",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderRole {
    Tracks,
    Archive,
}

/// What a backend call was for
#[derive(Debug, Clone, PartialEq)]
pub enum MapCall {
    Open,
    Sync,
    CreateFolder(FolderRole),
    OwnMarker,
    DeleteMarker,
    DeleteUntitled,
    ArchiveOrphan { id: String },
    DeleteOrphan,
}

/// Effects requested by the session
#[derive(Debug)]
pub enum MapAction {
    Call { call: MapCall, request: OpRequest },
    /// A rendezvous marker for another node
    Peer(PeerMarker),
    /// Current title of a live track this node publishes
    TitleObserved { feature_id: String, title: String },
    StateChanged(MapState),
    ScheduleResolveRetry(Duration),
    ScheduleReopen(Duration),
    StartHeartbeat { first: Duration, every: Duration },
}

/// Node state the session reads while processing an input
pub struct SessionContext<'a> {
    pub identity: &'a NodeIdentity,
    /// Backend ids of live tracks this node is publishing
    pub active_tracks: &'a HashSet<String>,
    pub now_ms: u64,
    pub new_track_delay_ms: u64,
    pub today: NaiveDate,
}

#[derive(Debug, Default)]
pub struct MapSession {
    api: Option<MapApi>,
    state: MapState,
    generation: u64,
    track_folder: String,
    archive_title: String,
    folder_id: Option<String>,
    archive_folder_id: Option<String>,
    last_sync_ms: u64,
    orphans: Vec<MapFeature>,
    resolve_attempts: u32,
    marker_placed: bool,
}

impl MapSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == MapState::Up
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn api(&self) -> Option<&MapApi> {
        self.api.as_ref()
    }

    pub fn map_id(&self) -> &str {
        self.api.as_ref().map(MapApi::map_id).unwrap_or_default()
    }

    pub fn folder_id(&self) -> Option<&str> {
        self.folder_id.as_deref()
    }

    pub fn archive_folder_id(&self) -> Option<&str> {
        self.archive_folder_id.as_deref()
    }

    fn set_state(&mut self, state: MapState, actions: &mut Vec<MapAction>) {
        if self.state != state {
            info!(map = %self.map_id(), "Map session {} -> {}", self.state, state);
            self.state = state;
            actions.push(MapAction::StateChanged(state));
        }
    }

    /// Start a fresh open/discovery cycle; an empty map id tears down
    pub fn open(&mut self, map_id: &str, track_folder: &str, ctx: &SessionContext) -> Vec<MapAction> {
        let mut actions = Vec::new();
        self.generation += 1;
        self.folder_id = None;
        self.archive_folder_id = None;
        self.last_sync_ms = 0;
        self.orphans.clear();
        self.resolve_attempts = 0;
        self.marker_placed = false;

        if map_id.is_empty() {
            self.api = None;
            self.set_state(MapState::Idle, &mut actions);
            return actions;
        }

        let api = MapApi::new(map_id);
        self.track_folder = track_folder.to_string();
        self.archive_title = archive_folder_name(track_folder, ctx.today);
        actions.push(MapAction::Call {
            call: MapCall::Open,
            request: api.since(0),
        });
        self.api = Some(api);
        self.set_state(MapState::Opening, &mut actions);
        actions
    }

    /// Switch maps, removing our marker from the old one first
    pub fn change_map(&mut self, map_id: &str, track_folder: &str, ctx: &SessionContext) -> Vec<MapAction> {
        let mut actions = Vec::new();
        if let Some(request) = self.marker_removal(ctx) {
            actions.push(MapAction::Call {
                call: MapCall::DeleteMarker,
                request,
            });
        }
        actions.extend(self.open(map_id, track_folder, ctx));
        actions
    }

    /// Retry after an open failure
    pub fn reopen(&mut self, generation: u64, ctx: &SessionContext) -> Vec<MapAction> {
        if generation != self.generation || self.state != MapState::Down {
            return Vec::new();
        }
        let map_id = self.map_id().to_string();
        let folder = self.track_folder.clone();
        self.open(&map_id, &folder, ctx)
    }

    /// Tear down, returning the request that removes our marker
    pub fn shutdown(&mut self, ctx: &SessionContext) -> Option<OpRequest> {
        let request = self.marker_removal(ctx);
        self.generation += 1;
        self.marker_placed = false;
        let mut ignored = Vec::new();
        self.set_state(MapState::Idle, &mut ignored);
        request
    }

    fn marker_removal(&self, ctx: &SessionContext) -> Option<OpRequest> {
        match (&self.api, self.marker_placed) {
            (Some(api), true) => Some(api.delete("Marker", ctx.identity.uuid())),
            _ => None,
        }
    }

    /// Feed back a finished backend call
    pub fn on_result(&mut self, call: MapCall, generation: u64, op: &Op, ctx: &SessionContext) -> Vec<MapAction> {
        let mut actions = Vec::new();
        if generation != self.generation {
            debug!("Dropping {:?} result from map generation {}", call, generation);
            return actions;
        }

        match call {
            MapCall::Open => match op.result().map(|r| parse_sync(&r)) {
                Some(Ok(sync)) => {
                    self.last_sync_ms = sync.timestamp;
                    self.classify(sync.features, true, ctx, &mut actions);
                    if self.folder_id.is_none() || self.archive_folder_id.is_none() {
                        self.create_folders(&mut actions);
                    } else {
                        self.begin_resolving(ctx, &mut actions);
                    }
                }
                Some(Err(e)) => self.open_failed(&e.to_string(), &mut actions),
                None => {
                    let reason = op.failure().unwrap_or_else(|| "empty response".into());
                    self.open_failed(&reason, &mut actions);
                }
            },

            MapCall::Sync => match op.result().map(|r| parse_sync(&r)) {
                Some(Ok(sync)) => {
                    self.last_sync_ms = sync.timestamp.max(self.last_sync_ms);
                    self.classify(sync.features, false, ctx, &mut actions);
                }
                Some(Err(e)) => warn!(map = %self.map_id(), "Unreadable map update: {}", e),
                None => warn!(map = %self.map_id(), "Map update failed: {}", op.failure().unwrap_or_default()),
            },

            MapCall::CreateFolder(role) => match op.object_id() {
                Ok(id) => {
                    info!(map = %self.map_id(), "Created {:?} folder {}", role, id);
                    match role {
                        FolderRole::Tracks => self.folder_id = Some(id),
                        FolderRole::Archive => self.archive_folder_id = Some(id),
                    }
                    if self.state == MapState::CreatingFolders
                        && self.folder_id.is_some()
                        && self.archive_folder_id.is_some()
                    {
                        self.archive_orphans(ctx, &mut actions);
                        self.begin_resolving(ctx, &mut actions);
                    }
                }
                Err(e) => self.open_failed(&format!("creating {:?} folder: {}", role, e), &mut actions),
            },

            MapCall::OwnMarker => match op.failure() {
                None => {
                    self.marker_placed = true;
                    debug!(map = %self.map_id(), "Rendezvous marker updated");
                }
                Some(reason) => error!(map = %self.map_id(), "Not able to place marker: {}", reason),
            },

            MapCall::ArchiveOrphan { id } => match op.failure() {
                None => {
                    if let Some(api) = &self.api {
                        actions.push(MapAction::Call {
                            call: MapCall::DeleteOrphan,
                            request: api.delete("LiveTrack", &id),
                        });
                    }
                }
                Some(reason) => warn!(map = %self.map_id(), "Archiving orphan {} failed: {}", id, reason),
            },

            MapCall::DeleteMarker | MapCall::DeleteUntitled | MapCall::DeleteOrphan => {
                if let Some(reason) = op.failure() {
                    warn!(map = %self.map_id(), "{:?} failed: {}", call, reason);
                }
            }
        }
        actions
    }

    fn open_failed(&mut self, reason: &str, actions: &mut Vec<MapAction>) {
        error!(map = %self.map_id(), "Not able to open map: {}", reason);
        self.set_state(MapState::Down, actions);
        actions.push(MapAction::ScheduleReopen(Duration::from_millis(
            timing::MAP_UPDATE_INTERVAL_MS,
        )));
    }

    fn classify(&mut self, features: Vec<MapFeature>, opening: bool, ctx: &SessionContext, actions: &mut Vec<MapAction>) {
        let Some(api) = self.api.clone() else {
            return;
        };

        // Folders first so the other features can be placed
        for feature in features.iter().filter(|f| f.class == FeatureClass::Folder) {
            if self.folder_id.is_none() && feature.title == self.track_folder {
                debug!("Found track folder {}", feature.id);
                self.folder_id = Some(feature.id.clone());
            } else if self.archive_folder_id.is_none() && feature.title == self.archive_title {
                debug!("Found archive folder {}", feature.id);
                self.archive_folder_id = Some(feature.id.clone());
            }
        }

        for feature in features {
            if feature.title.is_empty() {
                if !feature.id.is_empty() {
                    warn!("Deleting untitled {} {}", feature.class.as_str(), feature.id);
                    let class = match feature.class.as_str() {
                        "" => "Shape",
                        class => class,
                    };
                    actions.push(MapAction::Call {
                        call: MapCall::DeleteUntitled,
                        request: api.delete(class, &feature.id),
                    });
                }
                continue;
            }

            match feature.class {
                FeatureClass::Marker if feature.in_folder(self.folder_id.as_deref()) => {
                    match PeerMarker::from_feature(&feature) {
                        Ok(Some(marker)) if marker.uuid != ctx.identity.uuid() => {
                            actions.push(MapAction::Peer(marker));
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Ignoring marker {}: {}", feature.id, e),
                    }
                }
                FeatureClass::LiveTrack => {
                    if ctx.active_tracks.contains(&feature.id) {
                        actions.push(MapAction::TitleObserved {
                            feature_id: feature.id.clone(),
                            title: feature.title.clone(),
                        });
                    } else if opening {
                        self.orphans.push(feature);
                    }
                }
                _ => {}
            }
        }

        if self.folder_id.is_some() && self.archive_folder_id.is_some() {
            self.archive_orphans(ctx, actions);
        }
    }

    fn create_folders(&mut self, actions: &mut Vec<MapAction>) {
        let Some(api) = &self.api else {
            return;
        };
        if self.folder_id.is_none() {
            info!("Folder '{}' not found - creating", self.track_folder);
            actions.push(MapAction::Call {
                call: MapCall::CreateFolder(FolderRole::Tracks),
                request: api.add_folder(&self.track_folder, true, true),
            });
        }
        if self.archive_folder_id.is_none() {
            info!("Folder '{}' not found - creating", self.archive_title);
            actions.push(MapAction::Call {
                call: MapCall::CreateFolder(FolderRole::Archive),
                request: api.add_folder(&self.archive_title, false, false),
            });
        }
        self.set_state(MapState::CreatingFolders, actions);
    }

    /// Archive live tracks left in our folder by a previous run
    fn archive_orphans(&mut self, ctx: &SessionContext, actions: &mut Vec<MapAction>) {
        let Some(api) = &self.api else {
            return;
        };
        for feature in self.orphans.drain(..) {
            if !feature.in_folder(self.folder_id.as_deref()) || ctx.active_tracks.contains(&feature.id) {
                continue;
            }
            let age = feature.age_ms(ctx.now_ms);
            if age < ctx.new_track_delay_ms {
                debug!("{} updated {}ms ago - leaving it", feature.title, age);
                continue;
            }
            info!("Archiving orphaned track '{}' ({}s idle)", feature.title, age / 1000);
            let shape = archived_shape(feature.raw, self.archive_folder_id.as_deref(), None);
            actions.push(MapAction::Call {
                call: MapCall::ArchiveOrphan { id: feature.id.clone() },
                request: api.edit("Shape", &feature.id, shape),
            });
        }
    }

    fn begin_resolving(&mut self, ctx: &SessionContext, actions: &mut Vec<MapAction>) {
        self.resolve_attempts = 0;
        self.set_state(MapState::PeersResolving, actions);
        let generation = self.generation;
        actions.extend(self.resolve_step(generation, ctx));
    }

    /// One pass of waiting for an address and a usable fix
    pub fn resolve_step(&mut self, generation: u64, ctx: &SessionContext) -> Vec<MapAction> {
        let mut actions = Vec::new();
        if generation != self.generation || self.state != MapState::PeersResolving {
            return actions;
        }

        self.resolve_attempts += 1;
        let have_addr = !ctx.identity.addrs().is_empty() || self.resolve_attempts > MAX_ADDR_RETRIES;
        let ready = (have_addr && ctx.identity.fix_is_usable())
            || self.resolve_attempts >= timing::MAX_MAP_STARTUP_RETRIES;
        if !ready {
            actions.push(MapAction::ScheduleResolveRetry(Duration::from_millis(
                timing::PEER_RESOLVE_RETRY_MS,
            )));
            return actions;
        }

        if !ctx.identity.fix_is_usable() {
            warn!("Map up without a usable position fix");
        }
        self.set_state(MapState::Up, &mut actions);
        let description = if ctx.identity.has_tunnel_addr() {
            None
        } else {
            Some(ctx.identity.addrs_text())
        };
        if let Some(request) = self.marker_request(ctx, description) {
            actions.push(MapAction::Call {
                call: MapCall::OwnMarker,
                request,
            });
        }
        actions.push(MapAction::StartHeartbeat {
            first: Duration::from_millis(timing::MARKER_FIRST_REFRESH_MS),
            every: Duration::from_millis(timing::MAP_UPDATE_INTERVAL_MS),
        });
        actions
    }

    /// Rendezvous marker at our fix, None without one
    fn marker_request(&self, ctx: &SessionContext, description: Option<String>) -> Option<OpRequest> {
        let api = self.api.as_ref()?;
        let fix = ctx.identity.fix()?;

        let mut extra = Map::new();
        extra.insert("r2c-ipaddrs".into(), json!(ctx.identity.addrs_json()));
        extra.insert("r2c-name".into(), json!(ctx.identity.name()));
        extra.insert("marker-color".into(), json!("#0000FF"));
        if let Some(description) = description {
            extra.insert("description".into(), Value::String(description));
        }
        touch(&mut extra);

        Some(api.add_marker(
            Some(ctx.identity.uuid()),
            fix.lat,
            fix.lng,
            &format!("R2C: {}", ctx.identity.name()),
            Some("radiotower"),
            self.folder_id.as_deref(),
            extra,
        ))
    }

    /// Periodic marker refresh followed by an incremental sync
    pub fn heartbeat(&mut self, generation: u64, ctx: &SessionContext, peer_stats: &str) -> Vec<MapAction> {
        let mut actions = Vec::new();
        if generation != self.generation || !self.is_up() {
            return actions;
        }
        let Some(api) = self.api.clone() else {
            return actions;
        };

        let description = if peer_stats.is_empty() {
            ctx.identity.addrs_text()
        } else {
            peer_stats.to_string()
        };
        if let Some(request) = self.marker_request(ctx, Some(description)) {
            actions.push(MapAction::Call {
                call: MapCall::OwnMarker,
                request,
            });
        }
        actions.push(MapAction::Call {
            call: MapCall::Sync,
            request: api.since(self.last_sync_ms),
        });
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Fix;
    use crate::remote::{Method, OpOutcome};
    use rid_relay_shared::PeerAddress;

    struct Harness {
        identity: NodeIdentity,
        active: HashSet<String>,
    }

    impl Harness {
        fn new(with_fix: bool) -> Self {
            let mut identity = NodeIdentity::new("uuid-a", "alpha");
            identity.set_addrs(vec![PeerAddress::new("10.0.0.5", "wlan0")]);
            if with_fix {
                identity.update_fix(Fix { lat: 35.0, lng: -80.0, accuracy_m: 5.0 });
            }
            Self {
                identity,
                active: HashSet::new(),
            }
        }

        fn ctx(&self) -> SessionContext<'_> {
            SessionContext {
                identity: &self.identity,
                active_tracks: &self.active,
                now_ms: 2_000_000,
                new_track_delay_ms: 20_000,
                today: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            }
        }
    }

    fn done(result: Value) -> Op {
        let op = Op::new(OpRequest::signed(Method::Get, "/x", None));
        op.complete(OpOutcome::Success { raw: String::new(), result: Some(result) });
        op
    }

    fn failed(reason: &str) -> Op {
        let op = Op::new(OpRequest::signed(Method::Get, "/x", None));
        op.complete(OpOutcome::Failed { raw: String::new(), reason: reason.into() });
        op
    }

    fn calls(actions: &[MapAction]) -> Vec<MapCall> {
        actions
            .iter()
            .filter_map(|a| match a {
                MapAction::Call { call, .. } => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    fn full_map() -> Value {
        json!({
            "timestamp": 1_000_000u64,
            "state": {"features": [
                {"id": "F1", "properties": {"class": "Folder", "title": "Drone Tracks"}},
                {"id": "F2", "properties": {"class": "Folder", "title": "Drone Tracks19Oct"}},
                {"id": "uuid-b", "properties": {
                    "class": "Marker", "title": "R2C: bravo", "folderId": "F1",
                    "r2c-ipaddrs": r#"[{"ipaddr":"10.0.0.9","intf":"wlan0"}]"#}},
                {"id": "uuid-a", "properties": {
                    "class": "Marker", "title": "R2C: alpha", "folderId": "F1",
                    "r2c-ipaddrs": "[]"}},
                {"id": "LT-old", "properties": {
                    "class": "LiveTrack", "title": "D1_old", "folderId": "F1", "updated": "1000"}},
                {"id": "LT-fresh", "properties": {
                    "class": "LiveTrack", "title": "D2_new", "folderId": "F1", "updated": 1_995_000u64}},
                {"id": "runt", "properties": {"class": "Shape", "title": ""}},
            ]}
        })
    }

    #[test]
    fn test_open_with_existing_folders() {
        let h = Harness::new(true);
        let mut session = MapSession::new();
        let actions = session.open("MAP1", "Drone Tracks", &h.ctx());
        assert_eq!(calls(&actions), vec![MapCall::Open]);
        assert_eq!(session.state(), MapState::Opening);

        let generation = session.generation();
        let actions = session.on_result(MapCall::Open, generation, &done(full_map()), &h.ctx());

        assert_eq!(session.folder_id(), Some("F1"));
        assert_eq!(session.archive_folder_id(), Some("F2"));
        let peers: Vec<&PeerMarker> = actions
            .iter()
            .filter_map(|a| match a {
                MapAction::Peer(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].uuid, "uuid-b");

        let calls = calls(&actions);
        assert!(calls.contains(&MapCall::DeleteUntitled));
        assert!(calls.contains(&MapCall::ArchiveOrphan { id: "LT-old".into() }));
        assert!(!calls.contains(&MapCall::ArchiveOrphan { id: "LT-fresh".into() }));
        assert!(calls.contains(&MapCall::OwnMarker));
        assert_eq!(session.state(), MapState::Up);
        assert!(actions.iter().any(|a| matches!(a, MapAction::StartHeartbeat { .. })));
    }

    #[test]
    fn test_archived_orphan_is_then_deleted() {
        let h = Harness::new(true);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        session.on_result(MapCall::Open, generation, &done(full_map()), &h.ctx());

        let actions = session.on_result(
            MapCall::ArchiveOrphan { id: "LT-old".into() },
            generation,
            &done(json!({})),
            &h.ctx(),
        );
        match &actions[..] {
            [MapAction::Call { call: MapCall::DeleteOrphan, request }] => {
                assert_eq!(request.method, Method::Delete);
                assert_eq!(request.path, "/api/v1/map/MAP1/LiveTrack/LT-old");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_folders_are_created() {
        let h = Harness::new(true);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        let empty = json!({"timestamp": 5u64, "state": {"features": []}});
        let actions = session.on_result(MapCall::Open, generation, &done(empty), &h.ctx());

        assert_eq!(
            calls(&actions),
            vec![
                MapCall::CreateFolder(FolderRole::Tracks),
                MapCall::CreateFolder(FolderRole::Archive)
            ]
        );
        assert_eq!(session.state(), MapState::CreatingFolders);

        session.on_result(MapCall::CreateFolder(FolderRole::Tracks), generation, &done(json!({"id": "T"})), &h.ctx());
        assert_eq!(session.state(), MapState::CreatingFolders);
        session.on_result(MapCall::CreateFolder(FolderRole::Archive), generation, &done(json!({"id": "A"})), &h.ctx());
        assert_eq!(session.state(), MapState::Up);
        assert_eq!(session.archive_folder_id(), Some("A"));
    }

    #[test]
    fn test_resolving_waits_for_fix() {
        let mut h = Harness::new(false);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        let actions = session.on_result(MapCall::Open, generation, &done(full_map()), &h.ctx());
        assert_eq!(session.state(), MapState::PeersResolving);
        assert!(actions.iter().any(|a| matches!(a, MapAction::ScheduleResolveRetry(_))));

        h.identity.update_fix(Fix { lat: 35.0, lng: -80.0, accuracy_m: 3.0 });
        let actions = session.resolve_step(generation, &h.ctx());
        assert_eq!(session.state(), MapState::Up);
        assert!(calls(&actions).contains(&MapCall::OwnMarker));
    }

    #[test]
    fn test_resolving_gives_up_waiting() {
        let h = Harness::new(false);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        session.on_result(MapCall::Open, generation, &done(full_map()), &h.ctx());
        for _ in 1..timing::MAX_MAP_STARTUP_RETRIES - 1 {
            session.resolve_step(generation, &h.ctx());
        }
        assert_eq!(session.state(), MapState::PeersResolving);
        let actions = session.resolve_step(generation, &h.ctx());
        assert_eq!(session.state(), MapState::Up);
        // No fix, so no marker
        assert!(!calls(&actions).contains(&MapCall::OwnMarker));
    }

    #[test]
    fn test_open_failure_schedules_reopen() {
        let h = Harness::new(true);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        let actions = session.on_result(MapCall::Open, generation, &failed("HTTP 404"), &h.ctx());
        assert_eq!(session.state(), MapState::Down);
        assert!(actions.iter().any(|a| matches!(a, MapAction::ScheduleReopen(_))));

        let actions = session.reopen(generation, &h.ctx());
        assert_eq!(calls(&actions), vec![MapCall::Open]);
        assert_ne!(session.generation(), generation);
    }

    #[test]
    fn test_stale_results_dropped() {
        let h = Harness::new(true);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let old = session.generation();
        session.open("MAP2", "Drone Tracks", &h.ctx());
        assert!(session.on_result(MapCall::Open, old, &done(full_map()), &h.ctx()).is_empty());
        assert_eq!(session.state(), MapState::Opening);
    }

    #[test]
    fn test_change_map_deletes_marker() {
        let h = Harness::new(true);
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        session.on_result(MapCall::Open, generation, &done(full_map()), &h.ctx());
        session.on_result(MapCall::OwnMarker, generation, &done(json!({"id": "uuid-a"})), &h.ctx());

        let actions = session.change_map("MAP2", "Drone Tracks", &h.ctx());
        assert_eq!(calls(&actions), vec![MapCall::DeleteMarker, MapCall::Open]);
        assert_eq!(session.map_id(), "MAP2");

        let actions = session.change_map("", "Drone Tracks", &h.ctx());
        assert!(calls(&actions).is_empty());
        assert_eq!(session.state(), MapState::Idle);
    }

    #[test]
    fn test_heartbeat_reports_stats_and_syncs() {
        let mut h = Harness::new(true);
        h.active.insert("LT-fresh".into());
        let mut session = MapSession::new();
        session.open("MAP1", "Drone Tracks", &h.ctx());
        let generation = session.generation();
        session.on_result(MapCall::Open, generation, &done(full_map()), &h.ctx());

        let actions = session.heartbeat(generation, &h.ctx(), "bravo:tx:1 rx:1");
        let marker = actions.iter().find_map(|a| match a {
            MapAction::Call { call: MapCall::OwnMarker, request } => Some(request),
            _ => None,
        });
        let body = marker.and_then(|r| r.payload.clone()).unwrap();
        assert_eq!(body["properties"]["description"], "bravo:tx:1 rx:1");
        assert_eq!(body["properties"]["title"], "R2C: alpha");
        assert_eq!(body["id"], "uuid-a");

        let sync = actions.iter().find_map(|a| match a {
            MapAction::Call { call: MapCall::Sync, request } => Some(request),
            _ => None,
        });
        assert_eq!(sync.unwrap().path, "/api/v1/map/MAP1/since/999500");

        let update = json!({"timestamp": 1_100_000u64, "state": {"features": [
            {"id": "LT-fresh", "properties": {"class": "LiveTrack", "title": "Renamed_1", "folderId": "F1"}}
        ]}});
        let actions = session.on_result(MapCall::Sync, generation, &done(update), &h.ctx());
        assert!(matches!(
            &actions[..],
            [MapAction::TitleObserved { feature_id, title }] if feature_id == "LT-fresh" && title == "Renamed_1"
        ));
    }
}
