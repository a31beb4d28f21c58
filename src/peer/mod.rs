//! Peer registry and ownership arbitration
//!
//! This module handles:
//! - Peer links discovered from markers or accepted from the listener
//! - The hello handshake and duplicate-link resolution
//! - Broadcast claims with ack/nack counting
//! - Handover when an owner drops a drone, leaves or disappears
//! - Sightings forwarded to the owning peer

mod link;
mod protocol;
mod registry;

pub use link::{LinkId, LinkStatus, PeerLink, PeerSummary};
pub use protocol::{Arbiter, Directive, LocalView, Resolution};
pub use registry::PeerRegistry;
