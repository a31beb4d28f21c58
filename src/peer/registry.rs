//! Explicit tables for links and drone ownership

use std::collections::{BTreeSet, HashMap, HashSet};

use super::link::{LinkId, PeerLink};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    next_id: LinkId,
    links: HashMap<LinkId, PeerLink>,
    /// Drone -> UUID of the peer publishing it
    rid_owner: HashMap<String, String>,
    /// Drone -> links whose answer to our claim is outstanding
    outstanding: HashMap<String, HashSet<LinkId>>,
    /// Drones this node publishes
    owned: BTreeSet<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> LinkId {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_outbound(&mut self, uuid: &str, name: &str, candidates: Vec<String>) -> LinkId {
        let id = self.allocate();
        self.links.insert(id, PeerLink::outbound(id, uuid, name, candidates));
        id
    }

    pub fn add_inbound(&mut self) -> LinkId {
        let id = self.allocate();
        self.links.insert(id, PeerLink::inbound(id));
        id
    }

    pub fn get(&self, id: LinkId) -> Option<&PeerLink> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut PeerLink> {
        self.links.get_mut(&id)
    }

    pub fn remove(&mut self, id: LinkId) -> Option<PeerLink> {
        self.links.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> = self.links.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn established_ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.is_established())
            .map(PeerLink::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Some link to `uuid` other than `except`, preferring an established one
    pub fn link_for_uuid(&self, uuid: &str, except: Option<LinkId>) -> Option<LinkId> {
        let mut found: Vec<&PeerLink> = self
            .links
            .values()
            .filter(|l| l.uuid() == Some(uuid) && Some(l.id()) != except)
            .collect();
        found.sort_by_key(|l| (!l.is_established(), l.id()));
        found.first().map(|l| l.id())
    }

    pub fn set_owner(&mut self, rid: &str, uuid: &str) {
        self.rid_owner.insert(rid.to_string(), uuid.to_string());
    }

    /// Record `uuid` as owner unless another owner is already known
    pub fn set_owner_if_absent(&mut self, rid: &str, uuid: &str) {
        self.rid_owner
            .entry(rid.to_string())
            .or_insert_with(|| uuid.to_string());
    }

    pub fn owner(&self, rid: &str) -> Option<&str> {
        self.rid_owner.get(rid).map(String::as_str)
    }

    /// Forget the owner of `rid` if it is `uuid`
    pub fn forget_owner_if(&mut self, rid: &str, uuid: &str) -> bool {
        if self.owner(rid) == Some(uuid) {
            self.rid_owner.remove(rid);
            true
        } else {
            false
        }
    }

    /// Forget every drone owned by `uuid`, returning them
    pub fn forget_owner(&mut self, uuid: &str) -> Vec<String> {
        let mut rids: Vec<String> = self
            .rid_owner
            .iter()
            .filter(|(_, owner)| owner.as_str() == uuid)
            .map(|(rid, _)| rid.clone())
            .collect();
        rids.sort();
        for rid in &rids {
            self.rid_owner.remove(rid);
        }
        rids
    }

    pub fn claim(&mut self, rid: &str) {
        self.owned.insert(rid.to_string());
        self.rid_owner.remove(rid);
    }

    pub fn release(&mut self, rid: &str) -> bool {
        self.owned.remove(rid)
    }

    pub fn is_owned(&self, rid: &str) -> bool {
        self.owned.contains(rid)
    }

    pub fn owned(&self) -> Vec<String> {
        self.owned.iter().cloned().collect()
    }

    /// Start waiting on `links` for answers to a claim on `rid`
    pub fn start_claim(&mut self, rid: &str, links: HashSet<LinkId>) {
        self.outstanding.insert(rid.to_string(), links);
    }

    pub fn is_pending(&self, rid: &str) -> bool {
        self.outstanding.contains_key(rid)
    }

    /// Count down one answer; Some(true) when it was the last one
    pub fn answer(&mut self, rid: &str, link: LinkId) -> Option<bool> {
        let waiting = self.outstanding.get_mut(rid)?;
        if !waiting.remove(&link) {
            return None;
        }
        if waiting.is_empty() {
            self.outstanding.remove(rid);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Claims `link` still owes an answer to
    pub fn claims_waiting_on(&self, link: LinkId) -> Vec<String> {
        let mut rids: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, links)| links.contains(&link))
            .map(|(rid, _)| rid.clone())
            .collect();
        rids.sort();
        rids
    }
}
