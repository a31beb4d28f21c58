//! One remote node as seen by this node

use rid_relay_shared::{timing, MovingAverage, PeerMessage};
use std::collections::VecDeque;
use std::fmt;

/// Registry-unique link identifier
pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Pipe not open yet, or open without a completed hello
    Connecting,
    /// Hello exchanged, claims may be sent
    Established,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::Established => write!(f, "established"),
        }
    }
}

#[derive(Debug)]
pub struct PeerLink {
    id: LinkId,
    uuid: Option<String>,
    name: String,
    candidates: VecDeque<String>,
    current_url: Option<String>,
    status: LinkStatus,
    initiated_by_me: bool,
    rtt: MovingAverage,
    remote_ct_rtt: MovingAverage,
    remote_r2c_rtt: MovingAverage,
    tx: u64,
    rx: u64,
    queued: Vec<PeerMessage>,
}

impl PeerLink {
    /// Outbound link that will try `candidates` in order
    pub fn outbound(id: LinkId, uuid: &str, name: &str, candidates: Vec<String>) -> Self {
        let mut link = Self::blank(id, true);
        link.uuid = Some(uuid.to_string());
        link.name = name.to_string();
        link.candidates = candidates.into();
        link
    }

    /// Link for a pipe the listener accepted; identity arrives with hello
    pub fn inbound(id: LinkId) -> Self {
        Self::blank(id, false)
    }

    fn blank(id: LinkId, initiated_by_me: bool) -> Self {
        Self {
            id,
            uuid: None,
            name: String::new(),
            candidates: VecDeque::new(),
            current_url: None,
            status: LinkStatus::Connecting,
            initiated_by_me,
            rtt: MovingAverage::new(timing::PEER_RTT_WINDOW),
            remote_ct_rtt: MovingAverage::new(timing::PEER_RTT_WINDOW),
            remote_r2c_rtt: MovingAverage::new(timing::PEER_RTT_WINDOW),
            tx: 0,
            rx: 0,
            queued: Vec::new(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn set_uuid(&mut self, uuid: &str) {
        self.uuid = Some(uuid.to_string());
    }

    /// Display name, falling back to the UUID
    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            self.uuid.as_deref().unwrap_or("?")
        } else {
            &self.name
        }
    }

    pub fn set_name(&mut self, name: &str) {
        if !name.is_empty() {
            self.name = name.to_string();
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_established(&self) -> bool {
        self.status == LinkStatus::Established
    }

    pub fn establish(&mut self) {
        self.status = LinkStatus::Established;
    }

    pub fn initiated_by_me(&self) -> bool {
        self.initiated_by_me
    }

    /// Take the next address to try
    pub fn next_candidate(&mut self) -> Option<String> {
        self.current_url = self.candidates.pop_front();
        self.current_url.clone()
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }

    pub fn count_tx(&mut self) {
        self.tx += 1;
    }

    pub fn count_rx(&mut self) {
        self.rx += 1;
    }

    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.rtt.next(rtt_ms);
    }

    /// Round-trip figures the peer reports; zero means unknown
    pub fn record_remote_rtts(&mut self, ct_rtt_ms: f64, r2c_rtt_ms: f64) {
        if ct_rtt_ms > 0.0 {
            self.remote_ct_rtt.next(ct_rtt_ms as u64);
        }
        if r2c_rtt_ms > 0.0 {
            self.remote_r2c_rtt.next(r2c_rtt_ms as u64);
        }
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt.get()
    }

    /// Hold a message until the link is established
    pub fn queue(&mut self, message: PeerMessage) {
        self.queued.push(message);
    }

    pub fn take_queued(&mut self) -> Vec<PeerMessage> {
        std::mem::take(&mut self.queued)
    }

    /// Claims waiting for this link to come up or drain
    pub fn queued_claims(&self) -> impl Iterator<Item = &str> {
        self.queued.iter().filter_map(|m| match m {
            PeerMessage::AddDrone { rid, .. } => Some(rid.as_str()),
            _ => None,
        })
    }

    /// `tx:N rx:N rtt:S.SSSs crtt:S.SSSs`
    pub fn stats(&self) -> String {
        format!(
            "tx:{} rx:{} rtt:{:.3}s crtt:{:.3}s",
            self.tx,
            self.rx,
            self.rtt.get() / 1000.0,
            self.remote_ct_rtt.get() / 1000.0
        )
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            uuid: self.uuid.clone().unwrap_or_default(),
            name: self.name().to_string(),
            status: self.status,
            stats: self.stats(),
        }
    }
}

/// Snapshot of a link for status queries
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub uuid: String,
    pub name: String,
    pub status: LinkStatus,
    pub stats: String,
}

impl fmt::Display for PeerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.stats)
    }
}
