//! Peer transport pipes
//!
//! This module handles:
//! - Persistent WebSocket channels between two nodes
//! - Request/response correlation by sequence number
//! - Outstanding-request backpressure and round-trip averaging
//! - Accepting inbound pipes from peers

mod channel;
mod listener;

pub use channel::{Pipe, PipeError, PipeEvent, PipeId, ResponseRoute};
pub use listener::{peer_url, PipeListener};
