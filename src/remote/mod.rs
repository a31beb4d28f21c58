//! Remote operations against the mapping backend
//!
//! This module handles:
//! - HMAC request signing
//! - A single serialized worker with retry while the backend is unreachable
//! - Op handles with timestamps, classification and timed waits
//! - Map-object request builders

pub mod api;
mod client;
mod op;
pub mod signing;

pub use api::{LineStyle, MapApi};
pub use client::{
    build_request, classify, ClientConfig, Completion, ExecError, HttpExecutor, HttpReply,
    HttpRequest, RemoteClient, ReqwestExecutor,
};
pub use op::{Op, OpError, OpOutcome, OpRequest};
pub use signing::Method;

#[cfg(test)]
pub(crate) use client::tests::{ok as reply_ok, test_config, ScriptedExecutor};
