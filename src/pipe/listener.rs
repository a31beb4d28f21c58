//! Accepts pipes opened by peers

use anyhow::{Context, Result};
use rid_relay_shared::timing;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{Pipe, PipeEvent};

/// WebSocket URL a peer listening on `ipaddr` is reached at
pub fn peer_url(ipaddr: &str) -> String {
    if ipaddr.contains(':') {
        format!("ws://[{}]:{}{}", ipaddr, timing::PEER_PORT, timing::PEER_PATH)
    } else {
        format!("ws://{}:{}{}", ipaddr, timing::PEER_PORT, timing::PEER_PATH)
    }
}

/// Background accept loop handing each new pipe to the coordinator
pub struct PipeListener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl PipeListener {
    /// Bind `addr` and start accepting
    pub async fn bind(
        addr: &str,
        local_name: String,
        events: mpsc::UnboundedSender<PipeEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind peer listener on {}", addr))?;
        let local_addr = listener.local_addr().context("Listener has no local address")?;
        info!("Peer listener on {}", local_addr);

        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };

                let events = events.clone();
                let local_name = local_name.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            let pipe = Pipe::from_stream(ws, remote.to_string(), local_name, events.clone());
                            debug!(pipe = pipe.id(), %remote, "Accepted peer pipe");
                            let _ = events.send(PipeEvent::Accepted { pipe });
                        }
                        Err(e) => debug!(%remote, "WebSocket handshake failed: {}", e),
                    }
                });
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new pipes; existing pipes are unaffected
    pub fn stop(&self) {
        self.handle.abort();
    }
}
