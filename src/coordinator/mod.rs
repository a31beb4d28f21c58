//! Top-level coordinator
//!
//! This module handles:
//! - Owning every registry (drones, live tracks, peers, map session)
//! - Marshalling pipe events, backend completions and timer ticks onto one task
//! - Carrying out the effects the state machines request
//! - Configuration changes, status queries and orderly shutdown

mod events;
mod handle;
mod runner;

pub use events::{ConfigChange, CoordinatorEvent, Purpose, Query, TimerEvent};
pub use handle::CoordinatorHandle;
pub use runner::Coordinator;
