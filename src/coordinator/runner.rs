//! The coordinator task

use anyhow::Result;
use chrono::Local;
use rid_relay_shared::{codec, now_ms, timing};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::events::{ConfigChange, CoordinatorEvent, Purpose, Query, TimerEvent};
use super::handle::CoordinatorHandle;
use crate::config::{ConfigFile, RelayConfig, Snapshot, SnapshotStore};
use crate::drone::{DroneTable, TransportKind, Waypoint};
use crate::identity::NodeIdentity;
use crate::map::{label_from_title, MapAction, MapSession, MapState, SessionContext};
use crate::peer::{Arbiter, Directive, LinkId, LocalView};
use crate::pipe::{Pipe, PipeError, PipeEvent, PipeId, ResponseRoute};
use crate::remote::api::{archived_shape, fleet_device_id, legacy_position_report, position_report};
use crate::remote::{HttpExecutor, LineStyle, Op, OpRequest, RemoteClient};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::track::{ArchiveJob, LiveTrack, TrackAction};
use rid_relay_shared::state_machine::OwnershipStatus;

/// WebSocket close code for a normal close
const CLOSE_NORMAL: u16 = 1000;

/// What the arbiter sees of this node
struct NodeView<'a> {
    tracks: &'a HashMap<String, LiveTrack>,
    identity: &'a NodeIdentity,
    backend_rtt_ms: f64,
}

impl<'a> NodeView<'a> {
    fn new(tracks: &'a HashMap<String, LiveTrack>, identity: &'a NodeIdentity, client: &RemoteClient) -> Self {
        Self {
            tracks,
            identity,
            backend_rtt_ms: client.rtt_secs() * 1000.0,
        }
    }
}

impl LocalView for NodeView<'_> {
    fn first_timestamp(&self, rid: &str) -> Option<i64> {
        self.tracks.get(rid).and_then(LiveTrack::first_timestamp)
    }

    fn distance_to(&self, lat: f64, lng: f64) -> Option<f64> {
        self.identity.distance_to(lat, lng)
    }

    fn status(&self, rid: &str) -> Option<OwnershipStatus> {
        self.tracks.get(rid).map(LiveTrack::status)
    }

    fn backend_rtt_ms(&self) -> f64 {
        self.backend_rtt_ms
    }
}

fn session_ctx<'a>(
    identity: &'a NodeIdentity,
    active_tracks: &'a HashSet<String>,
    config: &RelayConfig,
) -> SessionContext<'a> {
    SessionContext {
        identity,
        active_tracks,
        now_ms: now_ms(),
        new_track_delay_ms: config.new_track_delay_secs * 1000,
        today: Local::now().date_naive(),
    }
}

/// Owns all node state; everything runs on its single task
pub struct Coordinator {
    config: RelayConfig,
    identity: NodeIdentity,
    drones: DroneTable,
    tracks: HashMap<String, LiveTrack>,
    idle_timers: HashMap<String, TimerHandle>,
    session: MapSession,
    arbiter: Arbiter,
    link_pipes: HashMap<LinkId, Pipe>,
    pipe_links: HashMap<PipeId, LinkId>,
    executor: Arc<dyn HttpExecutor>,
    client: RemoteClient,
    scheduler: Scheduler,
    heartbeat: Option<TimerHandle>,
    store: Arc<dyn SnapshotStore>,
    saves: mpsc::UnboundedSender<Snapshot>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    pipe_tx: mpsc::UnboundedSender<PipeEvent>,
    pipe_rx: mpsc::UnboundedReceiver<PipeEvent>,
}

impl Coordinator {
    pub fn new(
        config: RelayConfig,
        identity: NodeIdentity,
        drones: DroneTable,
        executor: Arc<dyn HttpExecutor>,
        store: Arc<dyn SnapshotStore>,
    ) -> (Self, CoordinatorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
        let (saves, saves_rx) = mpsc::unbounded_channel();
        tokio::spawn(save_loop(store.clone(), saves_rx));

        let mut arbiter = Arbiter::new(identity.uuid());
        arbiter.set_addrs(identity.addrs().to_vec());
        let client = RemoteClient::new(config.backend.client_config(), executor.clone());

        let coordinator = Self {
            config,
            identity,
            drones,
            tracks: HashMap::new(),
            idle_timers: HashMap::new(),
            session: MapSession::new(),
            arbiter,
            link_pipes: HashMap::new(),
            pipe_links: HashMap::new(),
            executor,
            client,
            scheduler: Scheduler::new(),
            heartbeat: None,
            store,
            saves,
            events_tx: events_tx.clone(),
            events_rx,
            pipe_tx,
            pipe_rx,
        };
        (coordinator, CoordinatorHandle::new(events_tx))
    }

    /// Channel the peer listener delivers accepted pipes on
    pub fn pipe_events(&self) -> mpsc::UnboundedSender<PipeEvent> {
        self.pipe_tx.clone()
    }

    /// Run until shutdown
    pub async fn run(mut self) -> Result<()> {
        info!(node = %self.identity.uuid(), "Coordinator starting as '{}'", self.identity.name());
        self.open_map();

        let tx = self.events_tx.clone();
        let status_every = Duration::from_millis(timing::MAP_UPDATE_INTERVAL_MS);
        self.scheduler.schedule(
            move || {
                let _ = tx.send(CoordinatorEvent::Timer(TimerEvent::StatusLog));
            },
            status_every,
            status_every,
        );

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if let CoordinatorEvent::Shutdown { done } = event {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    self.handle_event(event);
                }
                Some(event) = self.pipe_rx.recv() => {
                    self.handle_pipe_event(event);
                }
                else => break,
            }
        }
        info!("Coordinator stopped");
        Ok(())
    }

    fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Waypoint { wp, reply } => {
                let accepted = self.new_waypoint(wp);
                if let Some(reply) = reply {
                    let _ = reply.send(accepted);
                }
            }
            CoordinatorEvent::OpDone { purpose, op } => self.op_done(purpose, op),
            CoordinatorEvent::Timer(timer) => self.timer(timer),
            CoordinatorEvent::Configure(change) => self.configure(change),
            CoordinatorEvent::Query(query) => self.query(query),
            CoordinatorEvent::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    // --- waypoints ---

    /// Filter a waypoint and feed it to the drone's live track
    fn new_waypoint(&mut self, wp: Waypoint) -> bool {
        let min_feet = self.config.min_distance_feet as f64;
        let Some(spec) = self.drones.entry(&wp.rid) else {
            debug!("Dropping waypoint without a remote id");
            return false;
        };
        spec.bump(wp.transport);
        if let Err(rejection) = spec.accept(&wp, min_feet) {
            debug!(rid = %wp.rid, "Waypoint rejected: {:?}", rejection);
            return false;
        }

        if !self.config.use_direct {
            if self.config.group_id.is_empty() {
                debug!(rid = %wp.rid, "No group id, not reporting");
            } else {
                let request = legacy_position_report(&self.config.group_id, &wp.rid, wp.lat, wp.lng);
                self.call(request, Purpose::Legacy { rid: wp.rid.clone() });
            }
            return true;
        }

        let title = spec.ensure_segment();
        let window_ms = (self.config.new_track_delay_secs * 1000) as i64;
        let map_up = self.session.is_up();
        let device_id = fleet_device_id(&self.config.group_id, &wp.rid);
        let track = self.tracks.entry(wp.rid.clone()).or_insert_with(|| {
            let mut track = LiveTrack::new(&wp.rid, &device_id, &title, window_ms);
            track.set_map_up(map_up);
            track
        });

        // A new segment reuses the track under its new title
        let mut actions = track.rename(&title);
        actions.extend(track.add_point(wp.lat, wp.lng, wp.ts));
        self.apply_track(&wp.rid, actions);
        self.arm_idle(&wp.rid, self.config.new_track_delay());
        true
    }

    fn arm_idle(&mut self, rid: &str, delay: Duration) {
        if self.idle_timers.get(rid).is_some_and(TimerHandle::is_running) {
            return;
        }
        let tx = self.events_tx.clone();
        let timer_rid = rid.to_string();
        let handle = self.scheduler.once(
            move || {
                let _ = tx.send(CoordinatorEvent::Timer(TimerEvent::Idle { rid: timer_rid }));
            },
            delay,
        );
        self.idle_timers.insert(rid.to_string(), handle);
    }

    fn on_idle(&mut self, rid: &str) {
        self.idle_timers.remove(rid);
        let Some(spec) = self.drones.get(rid) else {
            return;
        };
        let idle_secs = (now_ms() / 1000).saturating_sub(spec.last_seen_secs);
        let delay_secs = self.config.new_track_delay_secs;
        if idle_secs >= delay_secs {
            info!(rid = %rid, "Idle for {}s, ending track", idle_secs);
            self.finish_track(rid);
        } else {
            self.arm_idle(rid, Duration::from_secs(delay_secs - idle_secs));
        }
    }

    /// End the drone's segment: release, archive and clear
    fn finish_track(&mut self, rid: &str) {
        if let Some(timer) = self.idle_timers.remove(rid) {
            timer.cancel();
        }
        if let Some(spec) = self.drones.get_mut(rid) {
            spec.end_segment();
        }
        let actions = self
            .tracks
            .get_mut(rid)
            .map(LiveTrack::finish)
            .unwrap_or_default();
        self.apply_track(rid, actions);
    }

    fn finish_all_tracks(&mut self) {
        let mut rids: Vec<String> = self.tracks.keys().cloned().collect();
        rids.sort();
        for rid in rids {
            self.finish_track(&rid);
        }
    }

    /// Apply a new display label, renaming the running backend track
    fn rename_drone(&mut self, rid: &str, raw: &str, broadcast: bool) {
        let Some(spec) = self.drones.entry(rid) else {
            return;
        };
        if spec.set_mapped_id(raw).is_none() {
            return;
        }
        let mapped_id = spec.mapped_id().to_string();
        info!(rid = %rid, "Drone relabelled '{}'", mapped_id);
        self.relabel_track(rid);
        if broadcast {
            let directives = self.arbiter.broadcast_name_change(rid, &mapped_id);
            self.apply_directives(directives);
        }
        self.save();
    }

    fn relabel_track(&mut self, rid: &str) {
        let Some(title) = self.drones.get_mut(rid).and_then(|spec| spec.relabel_segment()) else {
            return;
        };
        let actions = self
            .tracks
            .get_mut(rid)
            .map(|track| track.rename(&title))
            .unwrap_or_default();
        self.apply_track(rid, actions);
    }

    // --- effects ---

    /// Queue a backend call whose completion comes back as an event
    fn call(&self, request: OpRequest, purpose: Purpose) -> Op {
        let tx = self.events_tx.clone();
        self.client.send_with(
            request,
            Box::new(move |op| {
                let _ = tx.send(CoordinatorEvent::OpDone { purpose, op });
            }),
        )
    }

    fn apply_track(&mut self, rid: &str, actions: Vec<TrackAction>) {
        for action in actions {
            match action {
                TrackAction::ResolveOwnership { first_ts, lat, lng } => {
                    let view = NodeView::new(&self.tracks, &self.identity, &self.client);
                    let (resolution, directives) = self.arbiter.resolve(rid, first_ts, lat, lng, &view);
                    debug!(rid = %rid, "Resolution: {:?}", resolution);
                    self.apply_directives(directives);
                    let more = self
                        .tracks
                        .get_mut(rid)
                        .map(|track| track.on_resolution(&resolution))
                        .unwrap_or_default();
                    self.apply_track(rid, more);
                }
                TrackAction::StartBackendTrack { title, device_id } => {
                    let Some(api) = self.session.api() else {
                        debug!(rid = %rid, "No map open, live track start deferred");
                        if let Some(track) = self.tracks.get_mut(rid) {
                            track.start_skipped();
                        }
                        continue;
                    };
                    let request = api.start_live_track(&title, self.session.folder_id(), &device_id);
                    let epoch = self.track_epoch(rid);
                    self.call(request, Purpose::TrackStart { rid: rid.to_string(), epoch });
                }
                TrackAction::PublishPoint { device_id, lat, lng } => {
                    let request = position_report(&self.config.group_id, &device_id, lat, lng);
                    let epoch = self.track_epoch(rid);
                    self.call(request, Purpose::TrackPoint { rid: rid.to_string(), epoch });
                }
                TrackAction::ForwardSeen { lat, lng, ts } => {
                    let view = NodeView::new(&self.tracks, &self.identity, &self.client);
                    let directives = self.arbiter.forward_seen(rid, lat, lng, ts, &view);
                    self.apply_directives(directives);
                }
                TrackAction::Archive(job) => self.archive(job),
                TrackAction::ReleaseOwnership => {
                    let view = NodeView::new(&self.tracks, &self.identity, &self.client);
                    let directives = self.arbiter.release(rid, &view);
                    self.apply_directives(directives);
                }
                TrackAction::RenameBackend { live_id, feature } => {
                    let Some(api) = self.session.api() else {
                        continue;
                    };
                    let request = api.edit("LiveTrack", &live_id, feature);
                    self.call(request, Purpose::TrackRename { rid: rid.to_string() });
                }
            }
        }
    }

    fn track_epoch(&self, rid: &str) -> u64 {
        self.tracks.get(rid).map(LiveTrack::epoch).unwrap_or_default()
    }

    /// Turn a finished track into an archived line
    fn archive(&mut self, job: ArchiveJob) {
        let Some(api) = self.session.api().cloned() else {
            warn!(rid = %job.rid, "No map open, '{}' not archived on the backend", job.title);
            return;
        };
        let folder = self.session.archive_folder_id().map(str::to_string);
        info!(rid = %job.rid, "Archiving '{}' ({} points)", job.title, job.coordinates.len());

        match job.live_id {
            Some(live_id) => {
                let feature = job
                    .feature
                    .unwrap_or_else(|| json!({ "properties": { "title": job.title } }));
                let coordinates = (!job.coordinates.is_empty()).then_some(job.coordinates);
                let shape = archived_shape(feature, folder.as_deref(), coordinates);
                self.call(api.edit("Shape", &live_id, shape), Purpose::ArchiveEdit { live_id });
            }
            None => {
                let request = api.add_line(
                    None,
                    job.coordinates,
                    &job.title,
                    "",
                    folder.as_deref(),
                    LineStyle::ARCHIVE,
                );
                self.call(request, Purpose::ArchiveLine { rid: job.rid });
            }
        }
    }

    fn apply_directives(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Connect { link, url } => {
                    info!(link, "Connecting to {}", url);
                    let pipe = Pipe::connect(url, self.identity.name(), self.pipe_tx.clone());
                    self.pipe_links.insert(pipe.id(), link);
                    self.link_pipes.insert(link, pipe);
                }
                Directive::Send {
                    link,
                    message,
                    background,
                } => {
                    let sent = match (self.link_pipes.get(&link), codec::encode_message(&message)) {
                        (Some(pipe), Ok(payload)) if background => pipe.send_background(payload).map(|rx| {
                            let kind = message.kind();
                            tokio::spawn(async move {
                                if let Ok(response) = rx.await {
                                    debug!(link, "{} answered: {}", kind, response);
                                }
                            });
                        }),
                        (Some(pipe), Ok(payload)) => pipe.send(payload, ResponseRoute::Dispatch).map(|_| ()),
                        (None, _) => {
                            debug!(link, "No pipe for {}", message.kind());
                            Err(PipeError::Closed)
                        }
                        (_, Err(e)) => {
                            error!(link, "Unable to encode {}: {}", message.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = sent {
                        debug!(link, "{} not sent: {}", message.kind(), e);
                        let backpressure = matches!(e, PipeError::Backpressure(_));
                        let more = self.arbiter.send_refused(link, &message, backpressure);
                        self.apply_directives(more);
                    }
                }
                Directive::Reply { link, seq, message } => {
                    let Some(pipe) = self.link_pipes.get(&link) else {
                        continue;
                    };
                    let result = codec::encode_message(&message)
                        .map_err(PipeError::from)
                        .and_then(|payload| pipe.send_response(seq, payload));
                    if let Err(e) = result {
                        debug!(link, "Reply {} dropped: {}", message.kind(), e);
                    }
                }
                Directive::Close { link, reason } => {
                    if let Some(pipe) = self.link_pipes.remove(&link) {
                        self.pipe_links.remove(&pipe.id());
                        pipe.close(CLOSE_NORMAL, &reason);
                    }
                }
                Directive::Resolved { rid, resolution } => {
                    let actions = self
                        .tracks
                        .get_mut(&rid)
                        .map(|track| track.on_resolution(&resolution))
                        .unwrap_or_default();
                    self.apply_track(&rid, actions);
                }
                Directive::Reevaluate { rid } => {
                    let now = now_ms() as i64;
                    let actions = self
                        .tracks
                        .get_mut(&rid)
                        .map(|track| track.reevaluate(now))
                        .unwrap_or_default();
                    self.apply_track(&rid, actions);
                }
                Directive::Sighting {
                    link,
                    seq,
                    rid,
                    lat,
                    lng,
                    ts,
                } => {
                    let wp = Waypoint {
                        rid: rid.clone(),
                        lat,
                        lng,
                        alt: 0,
                        ts,
                        transport: TransportKind::R2c,
                    };
                    self.new_waypoint(wp);
                    let archived = !self.tracks.get(&rid).is_some_and(LiveTrack::is_publishing);
                    let view = NodeView::new(&self.tracks, &self.identity, &self.client);
                    let directives = self.arbiter.seen_reply(link, seq, &rid, archived, &view);
                    self.apply_directives(directives);
                }
                Directive::Rename { rid, mapped_id } => self.rename_drone(&rid, &mapped_id, false),
                Directive::PeerRemoved { link } => {
                    if let Some(pipe) = self.link_pipes.remove(&link) {
                        self.pipe_links.remove(&pipe.id());
                        pipe.close(CLOSE_NORMAL, "peer removed");
                    }
                }
            }
        }
    }

    fn apply_map(&mut self, actions: Vec<MapAction>) {
        let generation = self.session.generation();
        for action in actions {
            match action {
                MapAction::Call { call, request } => {
                    self.call(request, Purpose::Map { call, generation });
                }
                MapAction::Peer(marker) => {
                    let directives = self.arbiter.discover(&marker);
                    self.apply_directives(directives);
                }
                MapAction::TitleObserved { feature_id, title } => self.title_observed(&feature_id, &title),
                MapAction::StateChanged(state) => {
                    let up = state == MapState::Up;
                    if !up {
                        if let Some(heartbeat) = self.heartbeat.take() {
                            heartbeat.cancel();
                        }
                    }
                    let mut rids: Vec<String> = self.tracks.keys().cloned().collect();
                    rids.sort();
                    for rid in rids {
                        let actions = self
                            .tracks
                            .get_mut(&rid)
                            .map(|track| track.set_map_up(up))
                            .unwrap_or_default();
                        self.apply_track(&rid, actions);
                    }
                }
                MapAction::ScheduleResolveRetry(delay) => {
                    self.timer_once(TimerEvent::MapResolve { generation }, delay);
                }
                MapAction::ScheduleReopen(delay) => {
                    self.timer_once(TimerEvent::MapReopen { generation }, delay);
                }
                MapAction::StartHeartbeat { first, every } => {
                    if let Some(old) = self.heartbeat.take() {
                        old.cancel();
                    }
                    let tx = self.events_tx.clone();
                    self.heartbeat = Some(self.scheduler.schedule(
                        move || {
                            let _ = tx.send(CoordinatorEvent::Timer(TimerEvent::Heartbeat { generation }));
                        },
                        first,
                        every,
                    ));
                }
            }
        }
    }

    fn timer_once(&self, event: TimerEvent, delay: Duration) {
        let tx = self.events_tx.clone();
        self.scheduler.once(
            move || {
                let _ = tx.send(CoordinatorEvent::Timer(event));
            },
            delay,
        );
    }

    /// Adopt a label someone set on the backend track
    fn title_observed(&mut self, feature_id: &str, title: &str) {
        let Some(rid) = self
            .tracks
            .values()
            .find(|track| track.backend_id() == Some(feature_id))
            .map(|track| track.rid().to_string())
        else {
            return;
        };
        let label = label_from_title(title);
        let current = self.drones.get(&rid).map(|spec| spec.mapped_id().to_string());
        if !label.is_empty() && current.as_deref() != Some(label) {
            info!(rid = %rid, "Backend title '{}' adopted as label", title);
            self.rename_drone(&rid, label, true);
        }
    }

    // --- map session ---

    fn active_backend_ids(&self) -> HashSet<String> {
        self.tracks
            .values()
            .filter_map(|track| track.backend_id().map(str::to_string))
            .collect()
    }

    fn open_map(&mut self) {
        if !self.config.backend.is_complete() && !self.config.map_id.is_empty() {
            warn!("Backend credentials incomplete, map calls will be rejected");
        }
        let active = self.active_backend_ids();
        let ctx = session_ctx(&self.identity, &active, &self.config);
        let actions = self.session.open(&self.config.map_id, &self.config.track_folder, &ctx);
        self.apply_map(actions);
    }

    /// Archive everything and start over against the configured map
    fn change_map(&mut self) {
        info!(map = %self.config.map_id, "Map configuration changed");
        self.finish_all_tracks();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        let active = self.active_backend_ids();
        let ctx = session_ctx(&self.identity, &active, &self.config);
        let actions = self
            .session
            .change_map(&self.config.map_id, &self.config.track_folder, &ctx);
        self.apply_map(actions);
    }

    fn refresh_addrs(&mut self) {
        if self.config.addrs.is_empty() {
            self.identity.refresh_addrs();
            self.arbiter.set_addrs(self.identity.addrs().to_vec());
        }
    }

    fn timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Idle { rid } => self.on_idle(&rid),
            TimerEvent::MapResolve { generation } => {
                if self.identity.addrs().is_empty() {
                    self.refresh_addrs();
                }
                let active = self.active_backend_ids();
                let ctx = session_ctx(&self.identity, &active, &self.config);
                let actions = self.session.resolve_step(generation, &ctx);
                self.apply_map(actions);
            }
            TimerEvent::MapReopen { generation } => {
                let active = self.active_backend_ids();
                let ctx = session_ctx(&self.identity, &active, &self.config);
                let actions = self.session.reopen(generation, &ctx);
                self.apply_map(actions);
            }
            TimerEvent::Heartbeat { generation } => {
                self.refresh_addrs();
                let stats = self.arbiter.peer_stats();
                let active = self.active_backend_ids();
                let ctx = session_ctx(&self.identity, &active, &self.config);
                let actions = self.session.heartbeat(generation, &ctx, &stats);
                self.apply_map(actions);
            }
            TimerEvent::StatusLog => self.log_status(),
        }
    }

    fn log_status(&self) {
        let drones = self.drones.sorted_current(self.config.max_display_age_secs);
        let publishing = self.tracks.values().filter(|t| t.is_publishing()).count();
        info!(
            map = %self.session.map_id(),
            "Status: map {}, {} current drones, {} tracks published here, {} peers",
            self.session.state(),
            drones.len(),
            publishing,
            self.arbiter.registry().len()
        );
        for peer in self.arbiter.peers() {
            info!(peer = %peer.uuid, "  {} [{}]", peer, peer.status);
        }
    }

    // --- backend completions ---

    fn op_done(&mut self, purpose: Purpose, op: Op) {
        match purpose {
            Purpose::Map { call, generation } => {
                let active = self.active_backend_ids();
                let ctx = session_ctx(&self.identity, &active, &self.config);
                let actions = self.session.on_result(call, generation, &op, &ctx);
                self.apply_map(actions);
            }
            Purpose::TrackStart { rid, epoch } => {
                let Some(track) = self.tracks.get_mut(&rid).filter(|t| t.epoch() == epoch) else {
                    debug!(rid = %rid, "Stale live track creation ignored");
                    return;
                };
                let result = op
                    .object_id()
                    .map(|id| (id, op.result().unwrap_or(Value::Null)))
                    .map_err(|e| e.to_string());
                match track.on_started(result) {
                    Ok(actions) => self.apply_track(&rid, actions),
                    Err(e) => {
                        error!(rid = %rid, "{}", e);
                        self.finish_track(&rid);
                    }
                }
            }
            Purpose::TrackPoint { rid, epoch } => {
                let Some(track) = self.tracks.get_mut(&rid).filter(|t| t.epoch() == epoch) else {
                    debug!(rid = %rid, "Stale point write ignored");
                    return;
                };
                let result = match op.failure() {
                    Some(reason) => Err(reason),
                    None => Ok(()),
                };
                match track.on_point_written(result) {
                    Ok(actions) => self.apply_track(&rid, actions),
                    Err(e) => {
                        error!(rid = %rid, "{}", e);
                        self.finish_track(&rid);
                    }
                }
            }
            Purpose::ArchiveEdit { live_id } => match op.failure() {
                None => {
                    if let Some(api) = self.session.api() {
                        let request = api.delete("LiveTrack", &live_id);
                        self.call(request, Purpose::DeleteLive { live_id });
                    }
                }
                Some(reason) => warn!("Archiving live track {} failed: {}", live_id, reason),
            },
            Purpose::TrackRename { rid } | Purpose::ArchiveLine { rid } => {
                if let Some(reason) = op.failure() {
                    warn!(rid = %rid, "{} {} failed: {}", op.request().method.as_str(), op.request().path, reason);
                }
            }
            Purpose::DeleteLive { live_id } => {
                if let Some(reason) = op.failure() {
                    warn!("Deleting live track {} failed: {}", live_id, reason);
                }
            }
            Purpose::Legacy { rid } => {
                if let Some(reason) = op.failure() {
                    debug!(rid = %rid, "Position report failed: {}", reason);
                }
            }
        }
    }

    // --- pipes ---

    fn handle_pipe_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Connected { pipe } => {
                let Some(&link) = self.pipe_links.get(&pipe.id()) else {
                    pipe.close(CLOSE_NORMAL, "unknown pipe");
                    return;
                };
                let directives = self.arbiter.link_opened(link);
                self.apply_directives(directives);
            }
            PipeEvent::ConnectFailed { pipe_id, reason } => {
                let Some(link) = self.pipe_links.remove(&pipe_id) else {
                    return;
                };
                debug!(link, "Connect failed: {}", reason);
                self.link_pipes.remove(&link);
                let directives = self.arbiter.connect_failed(link);
                self.apply_directives(directives);
            }
            PipeEvent::Accepted { pipe } => {
                let link = self.arbiter.accepted();
                debug!(link, pipe = pipe.id(), "Accepted pipe from {}", pipe.remote());
                self.pipe_links.insert(pipe.id(), link);
                self.link_pipes.insert(link, pipe);
            }
            PipeEvent::Inbound { pipe_id, seq, payload } => {
                let Some(&link) = self.pipe_links.get(&pipe_id) else {
                    return;
                };
                if let Some(name) = self.link_pipes.get(&link).and_then(Pipe::peer_name) {
                    self.arbiter.note_peer_name(link, &name);
                }
                let view = NodeView::new(&self.tracks, &self.identity, &self.client);
                let directives = self.arbiter.handle_inbound(link, seq, &payload, &view);
                self.apply_directives(directives);
            }
            PipeEvent::Response {
                pipe_id,
                seq,
                payload,
                rtt_ms,
            } => {
                let Some(&link) = self.pipe_links.get(&pipe_id) else {
                    return;
                };
                debug!(link, seq, "Response in {}ms", rtt_ms);
                let directives = self.arbiter.handle_response(link, &payload, rtt_ms);
                self.apply_directives(directives);
            }
            PipeEvent::Drained { pipe_id } => {
                let Some(&link) = self.pipe_links.get(&pipe_id) else {
                    return;
                };
                let directives = self.arbiter.link_drained(link);
                self.apply_directives(directives);
            }
            PipeEvent::Closing { pipe_id, reason } => {
                let Some(link) = self.pipe_links.remove(&pipe_id) else {
                    return;
                };
                info!(link, "Pipe closed: {}", reason);
                self.link_pipes.remove(&link);
                let directives = self.arbiter.link_closed(link);
                self.apply_directives(directives);
            }
        }
    }

    // --- configuration ---

    fn configure(&mut self, change: ConfigChange) {
        debug!("Configuration change: {:?}", change);
        let changed = match change {
            ConfigChange::MapId(raw) => {
                let changed = self.config.set_map_id(&raw);
                if changed {
                    self.change_map();
                }
                changed
            }
            ConfigChange::GroupId(raw) => self.config.set_group_id(&raw),
            ConfigChange::TrackFolder(raw) => {
                let changed = self.config.set_track_folder(&raw);
                if changed {
                    self.change_map();
                }
                changed
            }
            ConfigChange::MinDistanceFeet(feet) => self.config.set_min_distance_feet(feet),
            ConfigChange::NewTrackDelaySecs(secs) => {
                let changed = self.config.set_new_track_delay_secs(secs);
                let window_ms = (self.config.new_track_delay_secs * 1000) as i64;
                for track in self.tracks.values_mut() {
                    track.set_window_ms(window_ms);
                }
                changed
            }
            ConfigChange::MaxDisplayAgeSecs(secs) => {
                let changed = self.config.max_display_age_secs != secs;
                self.config.max_display_age_secs = secs;
                changed
            }
            ConfigChange::Credentials(backend) => {
                let changed = self.config.backend != backend;
                if changed {
                    self.config.backend = backend;
                    self.restart_backend();
                }
                changed
            }
            ConfigChange::UseDirect(use_direct) => {
                let changed = self.config.use_direct != use_direct;
                self.config.use_direct = use_direct;
                if changed && !use_direct {
                    self.finish_all_tracks();
                }
                changed
            }
            ConfigChange::NodeName(name) => {
                let changed = self.config.node_name != name;
                self.identity.set_name(name.clone());
                self.config.node_name = name;
                changed
            }
            ConfigChange::ArchiveDir(dir) => {
                let changed = self.config.archive_dir != dir;
                self.config.archive_dir = dir;
                changed
            }
            ConfigChange::Position(fix) => {
                if self.identity.update_fix(fix) {
                    debug!("Position {:.6},{:.6} ±{}m", fix.lat, fix.lng, fix.accuracy_m);
                }
                false
            }
            ConfigChange::Label { rid, mapped_id } => {
                // Saved by the rename itself
                self.rename_drone(&rid, &mapped_id, true);
                false
            }
            ConfigChange::Import(file) => self.import(file),
        };
        if changed {
            self.save();
        }
    }

    fn import(&mut self, file: ConfigFile) -> bool {
        match file {
            ConfigFile::Credentials(credentials) => {
                let before = self.config.clone();
                if !self.config.apply_credentials(&credentials) {
                    return false;
                }
                info!("Credentials file applied");
                if self.config.backend != before.backend {
                    self.restart_backend();
                } else if self.config.map_id != before.map_id || self.config.track_folder != before.track_folder {
                    self.change_map();
                }
                if before.use_direct && !self.config.use_direct {
                    self.finish_all_tracks();
                }
                true
            }
            ConfigFile::Labels(labels) => {
                info!("Applying {} drone labels", labels.specs.len());
                let relabelled = self.drones.apply_labels(labels.specs, labels.replace);
                for rid in relabelled {
                    self.relabel_track(&rid);
                    let mapped_id = self
                        .drones
                        .get(&rid)
                        .map(|spec| spec.mapped_id().to_string())
                        .unwrap_or_default();
                    let directives = self.arbiter.broadcast_name_change(&rid, &mapped_id);
                    self.apply_directives(directives);
                }
                true
            }
        }
    }

    /// New credentials: fresh client, then reconnect the map
    fn restart_backend(&mut self) {
        info!(domain = %self.config.backend.domain, "Backend credentials changed");
        self.finish_all_tracks();
        self.client = RemoteClient::new(self.config.backend.client_config(), self.executor.clone());
        self.change_map();
    }

    fn query(&self, query: Query) {
        match query {
            Query::Drones(reply) => {
                let _ = reply.send(self.drones.sorted_current(self.config.max_display_age_secs));
            }
            Query::MapState(reply) => {
                let _ = reply.send(self.session.state());
            }
            Query::Peers(reply) => {
                let _ = reply.send(self.arbiter.peers());
            }
        }
    }

    // --- persistence and shutdown ---

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.identity.uuid(), self.config.clone(), self.drones.all_sorted())
    }

    fn save(&self) {
        if self.saves.send(self.snapshot()).is_err() {
            warn!("Snapshot writer stopped, change not saved");
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down");
        self.finish_all_tracks();

        let directives = self.arbiter.leave_all();
        self.apply_directives(directives);
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }

        let active = self.active_backend_ids();
        let ctx = session_ctx(&self.identity, &active, &self.config);
        if let Some(request) = self.session.shutdown(&ctx) {
            // Queued behind the archive calls, so this also waits for them
            let op = self.client.send(request);
            match op.wait(Duration::from_millis(timing::MAX_OP_DURATION_MS)).await {
                Ok(outcome) => debug!("Marker removal finished: {:?}", outcome),
                Err(e) => warn!("Marker removal did not finish: {}", e),
            }
        }

        let directives = self.arbiter.close_all();
        self.apply_directives(directives);
        self.scheduler.cancel_all();

        if let Err(e) = self.store.save(&self.snapshot()).await {
            error!("Failed to save snapshot: {:#}", e);
        }
    }
}

/// Write snapshots one at a time, skipping ahead to the newest
async fn save_loop(store: Arc<dyn SnapshotStore>, mut saves: mpsc::UnboundedReceiver<Snapshot>) {
    while let Some(mut snapshot) = saves.recv().await {
        while let Ok(newer) = saves.try_recv() {
            snapshot = newer;
        }
        if let Err(e) = store.save(&snapshot).await {
            error!("Failed to save snapshot: {:#}", e);
        }
    }
}
