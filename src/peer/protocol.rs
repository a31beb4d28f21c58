//! Ownership arbitration between peers
//!
//! The [`Arbiter`] is a pure state machine. Pipe events and local decisions
//! go in; [`Directive`]s come out for the coordinator to execute. It never
//! touches sockets or live tracks directly.

use rid_relay_shared::codec;
use rid_relay_shared::state_machine::{decide_claim, ClaimDecision, ClaimInputs, OwnershipStatus};
use rid_relay_shared::{PeerAddress, PeerMessage};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::link::{LinkId, LinkStatus, PeerSummary};
use super::registry::PeerRegistry;
use crate::map::PeerMarker;
use crate::pipe::peer_url;

/// What the arbiter needs to know about this node's own tracks
pub trait LocalView {
    /// Timestamp of the oldest buffered waypoint of a local live track
    fn first_timestamp(&self, rid: &str) -> Option<i64>;

    /// Metres from this node to a point, None without a fix
    fn distance_to(&self, lat: f64, lng: f64) -> Option<f64>;

    fn status(&self, rid: &str) -> Option<OwnershipStatus>;

    /// Average backend round trip in milliseconds
    fn backend_rtt_ms(&self) -> f64;
}

/// Outcome of asking who publishes a drone
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    PublishLocally,
    Forward { owner: String },
    /// Claim broadcast, answers outstanding
    Pending,
}

/// Effects the coordinator carries out for the arbiter
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Connect {
        link: LinkId,
        url: String,
    },
    /// Request to a peer; `background` responses are not fed back
    Send {
        link: LinkId,
        message: PeerMessage,
        background: bool,
    },
    Reply {
        link: LinkId,
        seq: u64,
        message: PeerMessage,
    },
    Close {
        link: LinkId,
        reason: String,
    },
    Resolved {
        rid: String,
        resolution: Resolution,
    },
    Reevaluate {
        rid: String,
    },
    /// A peer forwarded a sighting of a drone we publish; answer with
    /// [`Arbiter::seen_reply`]
    Sighting {
        link: LinkId,
        seq: u64,
        rid: String,
        lat: f64,
        lng: f64,
        ts: i64,
    },
    Rename {
        rid: String,
        mapped_id: String,
    },
    PeerRemoved {
        link: LinkId,
    },
}

#[derive(Debug)]
pub struct Arbiter {
    me: String,
    my_addrs: Vec<PeerAddress>,
    registry: PeerRegistry,
}

impl Arbiter {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            my_addrs: Vec::new(),
            registry: PeerRegistry::new(),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn set_addrs(&mut self, addrs: Vec<PeerAddress>) {
        self.my_addrs = addrs;
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn is_owned(&self, rid: &str) -> bool {
        self.registry.is_owned(rid)
    }

    pub fn owner_of(&self, rid: &str) -> Option<&str> {
        self.registry.owner(rid)
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.registry.links().map(|l| l.summary()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// One `name:stats` line per established peer
    pub fn peer_stats(&self) -> String {
        self.peers()
            .iter()
            .filter(|p| p.status == LinkStatus::Established)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn reply(&mut self, link: LinkId, seq: u64, message: PeerMessage) -> Directive {
        if let Some(peer) = self.registry.get_mut(link) {
            peer.count_tx();
        }
        Directive::Reply { link, seq, message }
    }

    fn send(&mut self, link: LinkId, message: PeerMessage, background: bool) -> Directive {
        if let Some(peer) = self.registry.get_mut(link) {
            peer.count_tx();
        }
        Directive::Send {
            link,
            message,
            background,
        }
    }

    // --- links ---

    /// Start connecting to a peer announced by its marker
    pub fn discover(&mut self, marker: &PeerMarker) -> Vec<Directive> {
        if marker.uuid == self.me || self.registry.link_for_uuid(&marker.uuid, None).is_some() {
            return Vec::new();
        }
        let candidates: Vec<String> = marker.addrs.iter().map(|a| peer_url(&a.ipaddr)).collect();
        let link = self.registry.add_outbound(&marker.uuid, &marker.name, candidates);
        info!(peer = %marker.uuid, "Discovered peer '{}' with {} addresses", marker.name, marker.addrs.len());
        self.try_next_candidate(link)
    }

    fn try_next_candidate(&mut self, link: LinkId) -> Vec<Directive> {
        match self.registry.get_mut(link).and_then(|l| l.next_candidate()) {
            Some(url) => vec![Directive::Connect { link, url }],
            None => {
                warn!(link, "No reachable address for peer");
                self.drop_link(link, None)
            }
        }
    }

    /// Outbound pipe failed before opening; try the next address
    pub fn connect_failed(&mut self, link: LinkId) -> Vec<Directive> {
        self.try_next_candidate(link)
    }

    /// Outbound pipe is open; introduce ourselves
    pub fn link_opened(&mut self, link: LinkId) -> Vec<Directive> {
        if self.registry.get(link).is_none() {
            return Vec::new();
        }
        let hello = PeerMessage::Hello {
            my_id: self.me.clone(),
            my_addrs: self.my_addrs.clone(),
        };
        vec![self.send(link, hello, false)]
    }

    /// Register a pipe the listener accepted
    pub fn accepted(&mut self) -> LinkId {
        self.registry.add_inbound()
    }

    pub fn note_peer_name(&mut self, link: LinkId, name: &str) {
        if let Some(peer) = self.registry.get_mut(link) {
            peer.set_name(name);
        }
    }

    /// Established pipe went away
    pub fn link_closed(&mut self, link: LinkId) -> Vec<Directive> {
        self.drop_link(link, None)
    }

    /// Remove a link; outstanding claims on it count as acks
    fn drop_link(&mut self, link: LinkId, close_reason: Option<&str>) -> Vec<Directive> {
        let Some(removed) = self.registry.remove(link) else {
            return Vec::new();
        };
        info!(link, peer = %removed.name(), "Removing peer link");

        let mut directives = Vec::new();
        if let Some(reason) = close_reason {
            directives.push(Directive::Close {
                link,
                reason: reason.to_string(),
            });
        }
        for rid in self.registry.claims_waiting_on(link) {
            directives.extend(self.count_answer(&rid, link));
        }
        if let Some(uuid) = removed.uuid() {
            if self.registry.link_for_uuid(uuid, None).is_none() {
                for rid in self.registry.forget_owner(uuid) {
                    directives.push(Directive::Reevaluate { rid });
                }
            }
        }
        directives.push(Directive::PeerRemoved { link });
        directives
    }

    /// A send was refused by the pipe
    ///
    /// A claim refused for backpressure waits on the link until it drains;
    /// one refused because the pipe is gone counts as an ack.
    pub fn send_refused(&mut self, link: LinkId, message: &PeerMessage, backpressure: bool) -> Vec<Directive> {
        let PeerMessage::AddDrone { rid, .. } = message else {
            return Vec::new();
        };
        if !backpressure {
            debug!(link, rid = %rid, "Claim not delivered, counting as ack");
            return self.count_answer(rid, link);
        }
        let Some(peer) = self.registry.get_mut(link) else {
            return self.count_answer(rid, link);
        };
        if !peer.queued_claims().any(|queued| queued == rid) {
            debug!(link, rid = %rid, "Peer busy, holding claim");
            peer.queue(message.clone());
        }
        Vec::new()
    }

    /// The link's pipe has room again; send what was held back
    pub fn link_drained(&mut self, link: LinkId) -> Vec<Directive> {
        if !self.registry.get(link).is_some_and(|l| l.is_established()) {
            return Vec::new();
        }
        self.flush_queued(link)
    }

    // --- arbitration ---

    /// Decide who publishes `rid`, broadcasting a claim when undecided
    pub fn resolve(
        &mut self,
        rid: &str,
        first_timestamp_ms: i64,
        lat: f64,
        lng: f64,
        view: &dyn LocalView,
    ) -> (Resolution, Vec<Directive>) {
        if self.registry.is_empty() || self.registry.is_owned(rid) {
            self.registry.claim(rid);
            return (Resolution::PublishLocally, Vec::new());
        }

        if let Some(owner) = self.registry.owner(rid).map(str::to_string) {
            if self.registry.link_for_uuid(&owner, None).is_some() {
                return (Resolution::Forward { owner }, Vec::new());
            }
            self.registry.forget_owner_if(rid, &owner);
        }

        if self.registry.is_pending(rid) {
            return (Resolution::Pending, Vec::new());
        }

        let claim = PeerMessage::AddDrone {
            rid: rid.to_string(),
            drone_timestamp_ms: first_timestamp_ms,
            lat,
            lng,
            distance_from_me: view.distance_to(lat, lng),
            ct_rtt: view.backend_rtt_ms(),
        };

        let mut directives = Vec::new();
        let mut waiting = HashSet::new();
        for link in self.registry.ids() {
            let established = self.registry.get(link).is_some_and(|l| l.is_established());
            if established {
                directives.push(self.send(link, claim.clone(), false));
            } else if let Some(peer) = self.registry.get_mut(link) {
                peer.queue(claim.clone());
            }
            waiting.insert(link);
        }
        info!(rid = %rid, "Claiming drone from {} peers", waiting.len());
        self.registry.start_claim(rid, waiting);
        (Resolution::Pending, directives)
    }

    fn count_answer(&mut self, rid: &str, link: LinkId) -> Vec<Directive> {
        match self.registry.answer(rid, link) {
            Some(true) => vec![self.settle(rid)],
            _ => Vec::new(),
        }
    }

    /// Every peer has answered a claim
    fn settle(&mut self, rid: &str) -> Directive {
        let resolution = match self.registry.owner(rid) {
            Some(owner) => Resolution::Forward {
                owner: owner.to_string(),
            },
            None => {
                self.registry.claim(rid);
                Resolution::PublishLocally
            }
        };
        info!(rid = %rid, "Arbitration settled: {:?}", resolution);
        Directive::Resolved {
            rid: rid.to_string(),
            resolution,
        }
    }

    /// Stop publishing `rid` and tell every peer
    pub fn release(&mut self, rid: &str, view: &dyn LocalView) -> Vec<Directive> {
        if !self.registry.release(rid) {
            return Vec::new();
        }
        let drop = PeerMessage::DropDrone {
            rid: rid.to_string(),
            ct_rtt: view.backend_rtt_ms(),
        };
        info!(rid = %rid, "Releasing drone");
        self.registry
            .established_ids()
            .into_iter()
            .map(|link| self.send(link, drop.clone(), true))
            .collect()
    }

    /// Forward a local sighting to the owner
    pub fn forward_seen(&mut self, rid: &str, lat: f64, lng: f64, ts: i64, view: &dyn LocalView) -> Vec<Directive> {
        let Some(owner) = self.registry.owner(rid).map(str::to_string) else {
            return vec![Directive::Reevaluate { rid: rid.to_string() }];
        };
        let Some(link) = self.registry.link_for_uuid(&owner, None) else {
            self.registry.forget_owner_if(rid, &owner);
            return vec![Directive::Reevaluate { rid: rid.to_string() }];
        };
        let Some(peer) = self.registry.get(link).filter(|l| l.is_established()) else {
            debug!(rid = %rid, "Owner link not up, sighting dropped");
            return Vec::new();
        };

        let seen = PeerMessage::Seen {
            rid: rid.to_string(),
            lat,
            lng,
            ts,
            ct_rtt: view.backend_rtt_ms(),
            r2c_rtt: peer.rtt_ms(),
        };
        vec![self.send(link, seen, false)]
    }

    /// Answer a forwarded sighting once it has been ingested
    pub fn seen_reply(&mut self, link: LinkId, seq: u64, rid: &str, archived: bool, view: &dyn LocalView) -> Vec<Directive> {
        let r2c_rtt = self.registry.get(link).map(|l| l.rtt_ms()).unwrap_or_default();
        let ack = PeerMessage::SeenAck {
            rid: rid.to_string(),
            ct_rtt: view.backend_rtt_ms(),
            r2c_rtt,
            archived,
        };
        vec![self.reply(link, seq, ack)]
    }

    pub fn broadcast_name_change(&mut self, rid: &str, mapped_id: &str) -> Vec<Directive> {
        let rename = PeerMessage::NameChange {
            rid: rid.to_string(),
            mapped_id: mapped_id.to_string(),
        };
        self.registry
            .established_ids()
            .into_iter()
            .map(|link| self.send(link, rename.clone(), true))
            .collect()
    }

    /// Tell every peer we are going away
    pub fn leave_all(&mut self) -> Vec<Directive> {
        self.registry
            .established_ids()
            .into_iter()
            .map(|link| self.send(link, PeerMessage::Leaving {}, true))
            .collect()
    }

    /// Close and forget every link
    pub fn close_all(&mut self) -> Vec<Directive> {
        let mut directives = Vec::new();
        for link in self.registry.ids() {
            self.registry.remove(link);
            directives.push(Directive::Close {
                link,
                reason: "shutting down".into(),
            });
            directives.push(Directive::PeerRemoved { link });
        }
        directives
    }

    // --- inbound ---

    /// A request arrived from a peer
    pub fn handle_inbound(&mut self, link: LinkId, seq: u64, payload: &Value, view: &dyn LocalView) -> Vec<Directive> {
        let Some(peer) = self.registry.get_mut(link) else {
            return Vec::new();
        };
        peer.count_rx();

        let message = match codec::decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(link, "Malformed request: {}", e);
                let error = PeerMessage::error(format!("malformed request: {}", e));
                return vec![self.reply(link, seq, error)];
            }
        };
        if message.rid() == Some("") {
            let error = PeerMessage::error(format!("{}: missing required 'rid'", message.kind()));
            return vec![self.reply(link, seq, error)];
        }

        match message {
            PeerMessage::Hello { my_id, .. } => self.on_hello(link, seq, &my_id, view),
            PeerMessage::AddDrone {
                rid,
                drone_timestamp_ms,
                lat,
                lng,
                distance_from_me,
                ct_rtt,
            } => {
                let theirs = ClaimIn {
                    ts: drone_timestamp_ms,
                    lat,
                    lng,
                    distance: distance_from_me,
                    ct_rtt,
                };
                self.on_claim(link, seq, &rid, theirs, view)
            }
            PeerMessage::DropDrone { rid, ct_rtt } => {
                let mut directives = Vec::new();
                if let Some(peer) = self.registry.get_mut(link) {
                    peer.record_remote_rtts(ct_rtt, 0.0);
                    let uuid = peer.uuid().map(str::to_string);
                    if let Some(uuid) = uuid {
                        if self.registry.forget_owner_if(&rid, &uuid) {
                            info!(rid = %rid, peer = %uuid, "Owner dropped drone");
                            directives.push(Directive::Reevaluate { rid: rid.clone() });
                        }
                    }
                }
                directives.push(self.reply(link, seq, PeerMessage::DropDroneAck { rid }));
                directives
            }
            PeerMessage::Seen {
                rid,
                lat,
                lng,
                ts,
                ct_rtt,
                r2c_rtt,
            } => {
                if let Some(peer) = self.registry.get_mut(link) {
                    peer.record_remote_rtts(ct_rtt, r2c_rtt);
                }
                if !self.registry.is_owned(&rid) {
                    let nack = PeerMessage::SeenNack {
                        rid,
                        diag: "not my drone".into(),
                    };
                    return vec![self.reply(link, seq, nack)];
                }
                vec![Directive::Sighting {
                    link,
                    seq,
                    rid,
                    lat,
                    lng,
                    ts,
                }]
            }
            PeerMessage::NameChange { rid, mapped_id } => {
                let ack = self.reply(link, seq, PeerMessage::NameChangeAck { rid: rid.clone() });
                vec![Directive::Rename { rid, mapped_id }, ack]
            }
            PeerMessage::DroneStatus { rid } => {
                let (status, owner) = if self.registry.is_owned(&rid) {
                    (OwnershipStatus::PublishLocally, Some(self.me.clone()))
                } else if let Some(owner) = self.registry.owner(&rid) {
                    (OwnershipStatus::ForwardToPeer, Some(owner.to_string()))
                } else {
                    (view.status(&rid).unwrap_or_default(), None)
                };
                let ack = PeerMessage::DroneStatusAck {
                    rid,
                    status: status.to_string(),
                    owner,
                };
                vec![self.reply(link, seq, ack)]
            }
            PeerMessage::Leaving {} => self.on_leaving(link),
            other => {
                let error = PeerMessage::error(format!("unexpected request '{}'", other.kind()));
                vec![self.reply(link, seq, error)]
            }
        }
    }

    fn on_hello(&mut self, link: LinkId, seq: u64, their_id: &str, view: &dyn LocalView) -> Vec<Directive> {
        if their_id.is_empty() {
            let error = PeerMessage::error("hello: missing required 'my-id'");
            return vec![self.reply(link, seq, error)];
        }
        if their_id == self.me {
            let error = PeerMessage::error("hello: that is my own id");
            let mut directives = vec![self.reply(link, seq, error)];
            directives.extend(self.drop_link(link, Some("connected to self")));
            return directives;
        }

        let mut directives = Vec::new();
        if let Some(existing) = self.registry.link_for_uuid(their_id, Some(link)) {
            // Keep the link opened by the node with the lower UUID
            let initiator = |by_me: bool| if by_me { self.me.as_str() } else { their_id };
            let this_initiator = initiator(self.registry.get(link).is_some_and(|l| l.initiated_by_me()));
            let existing_initiator = initiator(self.registry.get(existing).is_some_and(|l| l.initiated_by_me()));

            if this_initiator < existing_initiator {
                info!(peer = %their_id, "Duplicate link, replacing link {}", existing);
                if let Some(peer) = self.registry.get_mut(link) {
                    peer.set_uuid(their_id);
                }
                directives.extend(self.drop_link(existing, Some("duplicate link")));
            } else {
                info!(peer = %their_id, "Duplicate link, keeping link {}", existing);
                directives.push(self.reply(link, seq, PeerMessage::error("already connected")));
                directives.extend(self.drop_link(link, Some("duplicate link")));
                return directives;
            }
        }

        let Some(peer) = self.registry.get_mut(link) else {
            return directives;
        };
        peer.set_uuid(their_id);
        peer.establish();
        info!(link, peer = %their_id, "Peer '{}' said hello", peer.name());

        let ack = PeerMessage::HelloAck {
            my_id: self.me.clone(),
            my_active_dronelist: self.registry.owned(),
            ct_rtt: view.backend_rtt_ms(),
        };
        directives.push(self.reply(link, seq, ack));
        directives.extend(self.flush_queued(link));
        directives
    }

    fn flush_queued(&mut self, link: LinkId) -> Vec<Directive> {
        let queued = self
            .registry
            .get_mut(link)
            .map(|l| l.take_queued())
            .unwrap_or_default();
        queued
            .into_iter()
            .map(|message| self.send(link, message, false))
            .collect()
    }

    fn on_claim(&mut self, link: LinkId, seq: u64, rid: &str, theirs: ClaimIn, view: &dyn LocalView) -> Vec<Directive> {
        let Some(their_id) = self.registry.get_mut(link).and_then(|peer| {
            peer.record_remote_rtts(theirs.ct_rtt, 0.0);
            peer.uuid().map(str::to_string)
        }) else {
            let error = PeerMessage::error("add-drone before hello");
            return vec![self.reply(link, seq, error)];
        };

        let rid_owned = rid.to_string();
        if self.registry.is_owned(rid) {
            let nack = PeerMessage::AddDroneNack {
                rid: rid_owned,
                note: "already publishing it".into(),
            };
            return vec![self.reply(link, seq, nack)];
        }

        let Some(first_timestamp_ms) = view.first_timestamp(rid) else {
            self.registry.set_owner(rid, &their_id);
            let ack = PeerMessage::AddDroneAck {
                rid: rid_owned,
                note: "all yours".into(),
            };
            return vec![self.reply(link, seq, ack)];
        };

        let mine = ClaimInputs {
            first_timestamp_ms,
            distance_m: view.distance_to(theirs.lat, theirs.lng),
            node_id: self.me.clone(),
        };
        let other = ClaimInputs {
            first_timestamp_ms: theirs.ts,
            distance_m: theirs.distance,
            node_id: their_id.clone(),
        };
        let decision = decide_claim(&mine, &other);
        debug!(rid = %rid, peer = %their_id, "Contested claim: {:?}", decision);

        let (resolution, reply) = match decision {
            ClaimDecision::LocalWins { note } => {
                self.registry.claim(rid);
                let nack = PeerMessage::AddDroneNack {
                    rid: rid_owned.clone(),
                    note: note.into(),
                };
                (Resolution::PublishLocally, nack)
            }
            ClaimDecision::RemoteWins { note } => {
                self.registry.set_owner(rid, &their_id);
                let ack = PeerMessage::AddDroneAck {
                    rid: rid_owned.clone(),
                    note: note.into(),
                };
                (Resolution::Forward { owner: their_id }, ack)
            }
        };
        vec![
            Directive::Resolved {
                rid: rid_owned,
                resolution,
            },
            self.reply(link, seq, reply),
        ]
    }

    fn on_leaving(&mut self, link: LinkId) -> Vec<Directive> {
        let mut directives = Vec::new();
        let uuid = self.registry.get(link).and_then(|l| l.uuid()).map(str::to_string);
        if let Some(uuid) = uuid {
            info!(peer = %uuid, "Peer is leaving");
            for rid in self.registry.forget_owner(&uuid) {
                directives.push(Directive::Reevaluate { rid });
            }
        }
        directives.extend(self.drop_link(link, Some("peer leaving")));
        directives
    }

    // --- responses ---

    /// A response to one of our requests arrived
    pub fn handle_response(&mut self, link: LinkId, payload: &Value, rtt_ms: u64) -> Vec<Directive> {
        let Some(peer) = self.registry.get_mut(link) else {
            return Vec::new();
        };
        peer.count_rx();
        peer.record_rtt(rtt_ms);

        let message = match codec::decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(link, "Malformed response: {}", e);
                return Vec::new();
            }
        };

        match message {
            PeerMessage::HelloAck {
                my_id,
                my_active_dronelist,
                ct_rtt,
            } => self.on_hello_ack(link, &my_id, my_active_dronelist, ct_rtt),
            PeerMessage::AddDroneAck { rid, note } => {
                debug!(rid = %rid, link, "Claim acked: {}", note);
                self.count_answer(&rid, link)
            }
            PeerMessage::AddDroneNack { rid, note } => {
                let Some(uuid) = self.registry.get(link).and_then(|l| l.uuid()).map(str::to_string) else {
                    return Vec::new();
                };
                info!(rid = %rid, peer = %uuid, "Claim nacked: {}", note);
                self.registry.release(&rid);
                self.registry.set_owner_if_absent(&rid, &uuid);
                match self.registry.answer(&rid, link) {
                    Some(true) => vec![self.settle(&rid)],
                    Some(false) => Vec::new(),
                    // Late nack: a peer took over a drone we had settled
                    None => vec![Directive::Resolved {
                        resolution: Resolution::Forward {
                            owner: self.registry.owner(&rid).unwrap_or(&uuid).to_string(),
                        },
                        rid,
                    }],
                }
            }
            PeerMessage::SeenAck { ct_rtt, r2c_rtt, .. } => {
                if let Some(peer) = self.registry.get_mut(link) {
                    peer.record_remote_rtts(ct_rtt, r2c_rtt);
                }
                Vec::new()
            }
            PeerMessage::SeenNack { rid, diag } => {
                warn!(rid = %rid, link, "Sighting refused: {}", diag);
                if let Some(uuid) = self.registry.get(link).and_then(|l| l.uuid()).map(str::to_string) {
                    self.registry.forget_owner_if(&rid, &uuid);
                }
                vec![Directive::Reevaluate { rid }]
            }
            PeerMessage::Error { diag } => {
                warn!(link, "Peer reported error: {}", diag);
                Vec::new()
            }
            other => {
                debug!(link, "{} received", other.kind());
                Vec::new()
            }
        }
    }

    fn on_hello_ack(&mut self, link: LinkId, their_id: &str, owned: Vec<String>, ct_rtt: f64) -> Vec<Directive> {
        if their_id.is_empty() {
            warn!(link, "hello-ack without 'my-id'");
            return Vec::new();
        }
        let Some(peer) = self.registry.get_mut(link) else {
            return Vec::new();
        };
        if peer.uuid().is_some_and(|expected| expected != their_id) {
            warn!(link, "hello-ack from {} but expected {:?}", their_id, peer.uuid());
        }
        peer.set_uuid(their_id);
        peer.establish();
        peer.record_remote_rtts(ct_rtt, 0.0);
        info!(link, peer = %their_id, "Connected to '{}' at {}", peer.name(), peer.current_url().unwrap_or("?"));

        for rid in owned {
            if !self.registry.is_owned(&rid) {
                debug!(rid = %rid, peer = %their_id, "Peer already publishes drone");
                self.registry.set_owner(&rid, their_id);
            }
        }
        self.flush_queued(link)
    }
}

/// Claim fields received from a peer
struct ClaimIn {
    ts: i64,
    lat: f64,
    lng: f64,
    distance: Option<f64>,
    ct_rtt: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    struct FakeView {
        first_ts: HashMap<String, i64>,
        distance: Option<f64>,
    }

    impl LocalView for FakeView {
        fn first_timestamp(&self, rid: &str) -> Option<i64> {
            self.first_ts.get(rid).copied()
        }

        fn distance_to(&self, _lat: f64, _lng: f64) -> Option<f64> {
            self.distance
        }

        fn status(&self, rid: &str) -> Option<OwnershipStatus> {
            self.first_ts.get(rid).map(|_| OwnershipStatus::Pending)
        }

        fn backend_rtt_ms(&self) -> f64 {
            120.0
        }
    }

    struct Node {
        arbiter: Arbiter,
        view: FakeView,
        link: LinkId,
        resolved: Vec<(String, Resolution)>,
        reevaluated: Vec<String>,
        sightings: Vec<String>,
        closed: Vec<LinkId>,
    }

    impl Node {
        fn new(uuid: &str, distance: f64) -> Self {
            let mut arbiter = Arbiter::new(uuid);
            arbiter.set_addrs(vec![PeerAddress::new("10.0.0.1", "wlan0")]);
            Self {
                arbiter,
                view: FakeView {
                    first_ts: HashMap::new(),
                    distance: Some(distance),
                },
                link: 0,
                resolved: Vec::new(),
                reevaluated: Vec::new(),
                sightings: Vec::new(),
                closed: Vec::new(),
            }
        }

        fn sees(&mut self, rid: &str, first_ts: i64) {
            self.view.first_ts.insert(rid.to_string(), first_ts);
        }

        fn resolve(&mut self, rid: &str) -> (Resolution, Vec<Directive>) {
            let ts = self.view.first_ts.get(rid).copied().unwrap_or(100);
            self.arbiter.resolve(rid, ts, 35.0, -80.0, &self.view)
        }
    }

    /// Deliver directives between two nodes until nothing is left in flight
    fn pump(a: &mut Node, b: &mut Node, from_a: Vec<Directive>, from_b: Vec<Directive>) {
        let mut queue: VecDeque<(bool, Directive)> = VecDeque::new();
        queue.extend(from_a.into_iter().map(|d| (true, d)));
        queue.extend(from_b.into_iter().map(|d| (false, d)));
        let mut seq = 0;

        while let Some((is_a, directive)) = queue.pop_front() {
            let (src, dst) = if is_a { (&mut *a, &mut *b) } else { (&mut *b, &mut *a) };
            let produced = match directive {
                Directive::Send { message, .. } => {
                    seq += 1;
                    let payload = codec::encode_message(&message).unwrap();
                    let out = dst.arbiter.handle_inbound(dst.link, seq, &payload, &dst.view);
                    out.into_iter().map(|d| (!is_a, d)).collect::<Vec<_>>()
                }
                Directive::Reply { message, .. } => {
                    let payload = codec::encode_message(&message).unwrap();
                    let out = dst.arbiter.handle_response(dst.link, &payload, 10);
                    out.into_iter().map(|d| (!is_a, d)).collect()
                }
                Directive::Resolved { rid, resolution } => {
                    src.resolved.push((rid, resolution));
                    Vec::new()
                }
                Directive::Reevaluate { rid } => {
                    src.reevaluated.push(rid);
                    Vec::new()
                }
                Directive::Sighting { link, seq, rid, .. } => {
                    src.sightings.push(rid.clone());
                    let out = src.arbiter.seen_reply(link, seq, &rid, false, &src.view);
                    out.into_iter().map(|d| (is_a, d)).collect()
                }
                Directive::Close { link, .. } => {
                    src.closed.push(link);
                    Vec::new()
                }
                _ => Vec::new(),
            };
            queue.extend(produced);
        }
    }

    fn marker_for(node: &Node, name: &str) -> PeerMarker {
        PeerMarker {
            uuid: node.arbiter.me().to_string(),
            name: name.to_string(),
            addrs: vec![PeerAddress::new("10.0.0.9", "wlan0")],
        }
    }

    /// `a` discovers `b` and completes the hello exchange
    fn connect(a: &mut Node, b: &mut Node) {
        let directives = a.arbiter.discover(&marker_for(b, "bravo"));
        let Some(Directive::Connect { link, url }) = directives.first() else {
            panic!("expected connect, got {:?}", directives);
        };
        assert_eq!(url, "ws://10.0.0.9:8443/R2CRestV1");
        a.link = *link;
        b.link = b.arbiter.accepted();
        let hello = a.arbiter.link_opened(a.link);
        pump(a, b, hello, Vec::new());
    }

    fn last_resolution(node: &Node, rid: &str) -> Option<Resolution> {
        node.resolved.iter().rev().find(|(r, _)| r == rid).map(|(_, res)| res.clone())
    }

    #[test]
    fn test_no_peers_claims_immediately() {
        let mut a = Node::new("uuid-a", 10.0);
        let (resolution, directives) = a.resolve("D1");
        assert_eq!(resolution, Resolution::PublishLocally);
        assert!(directives.is_empty());
        assert!(a.arbiter.is_owned("D1"));
    }

    #[test]
    fn test_hello_exchange_establishes_both_sides() {
        let mut a = Node::new("uuid-a", 10.0);
        let mut b = Node::new("uuid-b", 10.0);
        b.arbiter.resolve("D9", 1, 0.0, 0.0, &b.view);
        connect(&mut a, &mut b);

        assert!(a.arbiter.registry().get(a.link).unwrap().is_established());
        assert!(b.arbiter.registry().get(b.link).unwrap().is_established());
        assert_eq!(b.arbiter.registry().get(b.link).unwrap().uuid(), Some("uuid-a"));
        // b already published D9, so a learns it from hello-ack
        assert_eq!(a.arbiter.owner_of("D9"), Some("uuid-b"));
    }

    #[test]
    fn test_closer_node_wins_tie_on_timestamp() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);
        b.sees("D1", 100);

        let (resolution, claim) = a.resolve("D1");
        assert_eq!(resolution, Resolution::Pending);
        assert_eq!(claim.len(), 1);
        pump(&mut a, &mut b, claim, Vec::new());

        assert_eq!(last_resolution(&b, "D1"), Some(Resolution::PublishLocally));
        assert_eq!(
            last_resolution(&a, "D1"),
            Some(Resolution::Forward { owner: "uuid-b".into() })
        );
        assert!(b.arbiter.is_owned("D1"));
        assert!(!a.arbiter.is_owned("D1"));

        // a forwards later sightings to b
        let seen = a.arbiter.forward_seen("D1", 35.0, -80.0, 200, &a.view);
        pump(&mut a, &mut b, seen, Vec::new());
        assert_eq!(b.sightings, vec!["D1".to_string()]);
    }

    #[test]
    fn test_simultaneous_claims_pick_one_owner() {
        let mut a = Node::new("uuid-a", 40.0);
        let mut b = Node::new("uuid-b", 40.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);
        b.sees("D1", 200);

        let (_, from_a) = a.resolve("D1");
        let (_, from_b) = b.resolve("D1");
        pump(&mut a, &mut b, from_a, from_b);

        assert!(a.arbiter.is_owned("D1"));
        assert!(!b.arbiter.is_owned("D1"));
        assert_eq!(last_resolution(&a, "D1"), Some(Resolution::PublishLocally));
        assert_eq!(
            last_resolution(&b, "D1"),
            Some(Resolution::Forward { owner: "uuid-a".into() })
        );
    }

    #[test]
    fn test_drop_hands_drone_back() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);
        b.sees("D1", 100);
        let (_, claim) = a.resolve("D1");
        pump(&mut a, &mut b, claim, Vec::new());

        // b goes idle, archives and releases
        b.view.first_ts.remove("D1");
        let drop = b.arbiter.release("D1", &b.view);
        assert_eq!(drop.len(), 1);
        assert!(matches!(&drop[0], Directive::Send { background: true, message: PeerMessage::DropDrone { .. }, .. }));
        pump(&mut a, &mut b, Vec::new(), drop);
        assert_eq!(a.reevaluated, vec!["D1".to_string()]);
        assert_eq!(a.arbiter.owner_of("D1"), None);

        // a re-runs arbitration and b, with no track, acks it
        let (resolution, claim) = a.resolve("D1");
        assert_eq!(resolution, Resolution::Pending);
        pump(&mut a, &mut b, claim, Vec::new());
        assert_eq!(last_resolution(&a, "D1"), Some(Resolution::PublishLocally));
        assert!(a.arbiter.is_owned("D1"));
        assert_eq!(b.arbiter.owner_of("D1"), Some("uuid-a"));
    }

    #[test]
    fn test_claims_queue_until_hello_ack() {
        let mut a = Node::new("uuid-a", 10.0);
        let mut b = Node::new("uuid-b", 10.0);
        let directives = a.arbiter.discover(&marker_for(&b, "bravo"));
        let Some(Directive::Connect { link, .. }) = directives.first() else {
            panic!("expected connect");
        };
        a.link = *link;
        b.link = b.arbiter.accepted();

        a.sees("D1", 100);
        let (resolution, sent) = a.resolve("D1");
        assert_eq!(resolution, Resolution::Pending);
        assert!(sent.is_empty());

        let hello = a.arbiter.link_opened(a.link);
        pump(&mut a, &mut b, hello, Vec::new());
        // b had never seen D1 and acked the flushed claim
        assert_eq!(last_resolution(&a, "D1"), Some(Resolution::PublishLocally));
        assert_eq!(b.arbiter.owner_of("D1"), Some("uuid-a"));
    }

    #[test]
    fn test_lost_link_counts_as_ack() {
        let mut a = Node::new("uuid-a", 10.0);
        let mut b = Node::new("uuid-b", 10.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);
        let (_, claim) = a.resolve("D1");
        assert_eq!(claim.len(), 1);

        let directives = a.arbiter.link_closed(a.link);
        assert!(directives.contains(&Directive::Resolved {
            rid: "D1".into(),
            resolution: Resolution::PublishLocally
        }));
        assert!(directives.contains(&Directive::PeerRemoved { link: a.link }));
        assert!(a.arbiter.registry().is_empty());
    }

    #[test]
    fn test_unreachable_peer_removed_after_last_candidate() {
        let mut a = Node::new("uuid-a", 10.0);
        let b = Node::new("uuid-b", 10.0);
        let directives = a.arbiter.discover(&marker_for(&b, "bravo"));
        let Some(Directive::Connect { link, .. }) = directives.first() else {
            panic!("expected connect");
        };
        let directives = a.arbiter.connect_failed(*link);
        assert_eq!(directives, vec![Directive::PeerRemoved { link: *link }]);
        // Rediscovery is possible once the link is gone
        assert_eq!(a.arbiter.discover(&marker_for(&b, "bravo")).len(), 1);
    }

    #[test]
    fn test_malformed_requests_get_error_reply() {
        let mut a = Node::new("uuid-a", 10.0);
        let link = a.arbiter.accepted();

        let directives = a.arbiter.handle_inbound(link, 7, &serde_json::json!({"type": "add-drone"}), &a.view);
        assert!(matches!(
            &directives[..],
            [Directive::Reply { seq: 7, message: PeerMessage::Error { .. }, .. }]
        ));

        let directives = a.arbiter.handle_inbound(link, 8, &serde_json::json!({"type": "bogus"}), &a.view);
        assert!(matches!(&directives[..], [Directive::Reply { message: PeerMessage::Error { .. }, .. }]));

        let directives = a.arbiter.handle_inbound(link, 9, &serde_json::json!({"type": "hello", "my-id": ""}), &a.view);
        assert!(matches!(&directives[..], [Directive::Reply { message: PeerMessage::Error { .. }, .. }]));
    }

    #[test]
    fn test_duplicate_link_keeps_lower_uuid_initiator() {
        let mut a = Node::new("uuid-a", 10.0);
        let b = Node::new("uuid-b", 10.0);
        // a dials b ...
        let directives = a.arbiter.discover(&marker_for(&b, "bravo"));
        let Some(Directive::Connect { link: outbound, .. }) = directives.first() else {
            panic!("expected connect");
        };
        // ... while b dials a
        let inbound = a.arbiter.accepted();
        let hello = serde_json::json!({"type": "hello", "my-id": "uuid-b", "my-addrs": []});
        let directives = a.arbiter.handle_inbound(inbound, 1, &hello, &a.view);

        assert!(matches!(&directives[0], Directive::Reply { message: PeerMessage::Error { .. }, .. }));
        assert!(directives.contains(&Directive::Close { link: inbound, reason: "duplicate link".into() }));
        assert!(a.arbiter.registry().get(*outbound).is_some());
        assert!(a.arbiter.registry().get(inbound).is_none());
    }

    #[test]
    fn test_leaving_peer_triggers_reevaluate() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);
        b.sees("D1", 100);
        let (_, claim) = a.resolve("D1");
        pump(&mut a, &mut b, claim, Vec::new());

        let leaving = b.arbiter.leave_all();
        assert_eq!(leaving.len(), 1);
        pump(&mut a, &mut b, Vec::new(), leaving);
        assert_eq!(a.reevaluated, vec!["D1".to_string()]);
        assert!(a.arbiter.registry().is_empty());
    }

    #[test]
    fn test_seen_for_unowned_drone_is_nacked() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        // a believes b owns D2, b does not
        a.arbiter.registry.set_owner("D2", "uuid-b");
        let seen = a.arbiter.forward_seen("D2", 1.0, 2.0, 3, &a.view);
        pump(&mut a, &mut b, seen, Vec::new());
        assert!(b.sightings.is_empty());
        assert_eq!(a.reevaluated, vec!["D2".to_string()]);
        assert_eq!(a.arbiter.owner_of("D2"), None);
    }

    #[test]
    fn test_drone_status_and_name_change() {
        let mut a = Node::new("uuid-a", 10.0);
        let mut b = Node::new("uuid-b", 10.0);
        connect(&mut a, &mut b);
        a.arbiter.registry.claim("D1");

        let request = codec::encode_message(&PeerMessage::DroneStatus { rid: "D1".into() }).unwrap();
        let directives = a.arbiter.handle_inbound(a.link, 3, &request, &a.view);
        let reply = directives.iter().find_map(|d| match d {
            Directive::Reply { message: PeerMessage::DroneStatusAck { status, owner, .. }, .. } => {
                Some((status.clone(), owner.clone()))
            }
            _ => None,
        });
        assert_eq!(reply, Some(("ok-publish-locally".to_string(), Some("uuid-a".to_string()))));

        let rename = b.arbiter.broadcast_name_change("D1", "Red1");
        let mut renamed = Vec::new();
        for directive in rename {
            if let Directive::Send { message, .. } = directive {
                let payload = codec::encode_message(&message).unwrap();
                renamed.extend(a.arbiter.handle_inbound(a.link, 4, &payload, &a.view));
            }
        }
        assert!(renamed.contains(&Directive::Rename { rid: "D1".into(), mapped_id: "Red1".into() }));
    }

    #[test]
    fn test_busy_peer_holds_claim_until_drained() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);
        b.sees("D1", 100);

        let (resolution, claim) = a.resolve("D1");
        assert_eq!(resolution, Resolution::Pending);
        let Some(Directive::Send { message, .. }) = claim.first() else {
            panic!("expected claim, got {:?}", claim);
        };

        // Pipe full: the claim is held, nothing is settled
        assert!(a.arbiter.send_refused(a.link, message, true).is_empty());
        assert!(a.arbiter.send_refused(a.link, message, true).is_empty());
        assert!(!a.arbiter.is_owned("D1"));
        assert!(a.resolved.is_empty());

        let resent = a.arbiter.link_drained(a.link);
        assert_eq!(resent.len(), 1);
        assert!(a.arbiter.link_drained(a.link).is_empty());
        pump(&mut a, &mut b, resent, Vec::new());

        assert!(b.arbiter.is_owned("D1"));
        assert!(!a.arbiter.is_owned("D1"));
        assert_eq!(
            last_resolution(&a, "D1"),
            Some(Resolution::Forward { owner: "uuid-b".into() })
        );
    }

    #[test]
    fn test_held_claim_counts_as_ack_when_link_dies() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);

        let (_, claim) = a.resolve("D1");
        let Some(Directive::Send { message, .. }) = claim.first() else {
            panic!("expected claim, got {:?}", claim);
        };
        a.arbiter.send_refused(a.link, message, true);

        let directives = a.arbiter.link_closed(a.link);
        assert!(directives.contains(&Directive::Resolved {
            rid: "D1".into(),
            resolution: Resolution::PublishLocally,
        }));
        assert!(a.arbiter.is_owned("D1"));
    }

    #[test]
    fn test_claim_to_closed_pipe_counts_as_ack() {
        let mut a = Node::new("uuid-a", 50.0);
        let mut b = Node::new("uuid-b", 30.0);
        connect(&mut a, &mut b);
        a.sees("D1", 100);

        let (_, claim) = a.resolve("D1");
        let Some(Directive::Send { message, .. }) = claim.first() else {
            panic!("expected claim, got {:?}", claim);
        };
        let directives = a.arbiter.send_refused(a.link, message, false);
        assert_eq!(
            directives,
            vec![Directive::Resolved {
                rid: "D1".into(),
                resolution: Resolution::PublishLocally,
            }]
        );
    }
}
