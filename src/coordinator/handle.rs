//! Cloneable front door to a running coordinator

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use super::events::{ConfigChange, CoordinatorEvent, Query};
use crate::drone::{DroneSpec, Waypoint};
use crate::map::MapState;
use crate::peer::PeerSummary;

#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub(super) fn new(events: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { events }
    }

    fn post(&self, event: CoordinatorEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!("Coordinator stopped"))
    }

    /// Offer a waypoint; true if it passed the filters
    pub async fn new_waypoint(&self, wp: Waypoint) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.post(CoordinatorEvent::Waypoint { wp, reply: Some(reply) }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Offer a waypoint without waiting for the verdict
    pub fn submit_waypoint(&self, wp: Waypoint) -> Result<()> {
        self.post(CoordinatorEvent::Waypoint { wp, reply: None })
    }

    pub fn configure(&self, change: ConfigChange) -> Result<()> {
        self.post(CoordinatorEvent::Configure(change))
    }

    pub async fn drones(&self) -> Result<Vec<DroneSpec>> {
        let (tx, rx) = oneshot::channel();
        self.post(CoordinatorEvent::Query(Query::Drones(tx)))?;
        rx.await.map_err(|_| anyhow!("Coordinator stopped"))
    }

    pub async fn map_state(&self) -> Result<MapState> {
        let (tx, rx) = oneshot::channel();
        self.post(CoordinatorEvent::Query(Query::MapState(tx)))?;
        rx.await.map_err(|_| anyhow!("Coordinator stopped"))
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>> {
        let (tx, rx) = oneshot::channel();
        self.post(CoordinatorEvent::Query(Query::Peers(tx)))?;
        rx.await.map_err(|_| anyhow!("Coordinator stopped"))
    }

    /// Archive everything, say goodbye to peers and wait until done
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.post(CoordinatorEvent::Shutdown { done })?;
        rx.await.map_err(|_| anyhow!("Coordinator stopped before finishing shutdown"))
    }
}
