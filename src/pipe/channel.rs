//! Correlated duplex channel over a WebSocket
//!
//! A [`Pipe`] is a cheap handle; all socket IO runs on one spawned task per
//! pipe. The pending-correlation table sits behind a single mutex because
//! sends come from the coordinator while responses arrive on the IO task.

use futures::{SinkExt, StreamExt};
use rid_relay_shared::{
    codec::{self, CodecError},
    now_ms, timing, Envelope, MovingAverage,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Process-unique pipe identifier
pub type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(0);

/// Errors returned when sending on a pipe
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Backpressure: {0} requests outstanding")]
    Backpressure(usize),

    #[error("Pipe closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Lifecycle and message events delivered to the pipe's owner
#[derive(Debug)]
pub enum PipeEvent {
    /// Outbound connect finished its handshake
    Connected { pipe: Pipe },
    /// Outbound connect failed before the pipe was ever usable
    ConnectFailed { pipe_id: PipeId, reason: String },
    /// Listener accepted a pipe from a peer
    Accepted { pipe: Pipe },
    /// Request from the peer; answer with [`Pipe::send_response`]
    Inbound {
        pipe_id: PipeId,
        seq: u64,
        payload: Value,
    },
    /// Response to a request sent with [`ResponseRoute::Dispatch`]
    Response {
        pipe_id: PipeId,
        seq: u64,
        payload: Value,
        rtt_ms: u64,
    },
    /// Established pipe went away; reported exactly once
    Closing { pipe_id: PipeId, reason: String },
    /// A response freed a slot after a send was refused for backpressure
    Drained { pipe_id: PipeId },
}

/// Where a response to an outbound request is delivered
#[derive(Debug)]
pub enum ResponseRoute {
    /// Posted to the owner's event channel as [`PipeEvent::Response`]
    Dispatch,
    /// Handed straight to the waiting sender, bypassing the owner
    Background(oneshot::Sender<Value>),
}

#[derive(Debug)]
struct PendingRequest {
    sent_at_ms: u64,
    route: ResponseRoute,
}

#[derive(Debug)]
struct PipeState {
    next_seq: u64,
    name_sent: bool,
    pending: HashMap<u64, PendingRequest>,
    rtt: MovingAverage,
    peer_name: Option<String>,
    /// A send was refused since the last response
    refused: bool,
}

enum Outgoing {
    Frame(String),
    Close { code: u16, reason: String },
}

struct PipeShared {
    id: PipeId,
    remote: String,
    local_name: String,
    state: Mutex<PipeState>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedSender<PipeEvent>,
    established: AtomicBool,
    finished: AtomicBool,
}

/// Handle to one peer channel
#[derive(Clone)]
pub struct Pipe {
    shared: Arc<PipeShared>,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.shared.id)
            .field("remote", &self.shared.remote)
            .finish()
    }
}

impl Pipe {
    fn new(
        remote: String,
        local_name: String,
        events: mpsc::UnboundedSender<PipeEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = PipeShared {
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::SeqCst) + 1,
            remote,
            local_name,
            state: Mutex::new(PipeState {
                next_seq: 1,
                name_sent: false,
                pending: HashMap::new(),
                rtt: MovingAverage::new(timing::PIPE_RTT_WINDOW),
                peer_name: None,
                refused: false,
            }),
            outbound,
            events,
            established: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            outbound_rx,
        )
    }

    /// Start connecting to `url`; the outcome arrives as an event
    ///
    /// Requests sent before the handshake completes are queued and count
    /// against the outstanding limit.
    pub fn connect(
        url: impl Into<String>,
        local_name: impl Into<String>,
        events: mpsc::UnboundedSender<PipeEvent>,
    ) -> Pipe {
        let url = url.into();
        let (pipe, outbound_rx) = Pipe::new(url.clone(), local_name.into(), events);
        let connecting = pipe.clone();

        tokio::spawn(async move {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    if connecting.shared.finished.load(Ordering::SeqCst) {
                        return;
                    }
                    connecting.shared.established.store(true, Ordering::SeqCst);
                    info!(pipe = connecting.id(), remote = %url, "Pipe connected");
                    let _ = connecting.shared.events.send(PipeEvent::Connected {
                        pipe: connecting.clone(),
                    });
                    run_io(connecting.shared.clone(), ws, outbound_rx).await;
                }
                Err(e) => {
                    connecting.shared.fail(format!("connect to {} failed: {}", url, e));
                }
            }
        });

        pipe
    }

    /// Wrap an already-handshaken WebSocket (listener side and tests)
    pub fn from_stream<S>(
        ws: WebSocketStream<S>,
        remote: impl Into<String>,
        local_name: impl Into<String>,
        events: mpsc::UnboundedSender<PipeEvent>,
    ) -> Pipe
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (pipe, outbound_rx) = Pipe::new(remote.into(), local_name.into(), events);
        pipe.shared.established.store(true, Ordering::SeqCst);
        tokio::spawn(run_io(pipe.shared.clone(), ws, outbound_rx));
        pipe
    }

    pub fn id(&self) -> PipeId {
        self.shared.id
    }

    /// Address or URL of the other end
    pub fn remote(&self) -> &str {
        &self.shared.remote
    }

    /// Display name the peer announced in its first envelope
    pub fn peer_name(&self) -> Option<String> {
        self.shared.lock().peer_name.clone()
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Average round-trip time of answered requests
    pub fn rtt_ms(&self) -> f64 {
        self.shared.lock().rtt.get()
    }

    pub fn is_established(&self) -> bool {
        self.shared.established.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Send a request, returning its sequence number
    ///
    /// Refused with [`PipeError::Backpressure`] while
    /// `PIPE_MAX_OUTSTANDING` requests are unanswered; a refused send leaves
    /// the pending table untouched.
    pub fn send(&self, payload: Value, route: ResponseRoute) -> Result<u64, PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }

        let mut state = self.shared.lock();
        if state.pending.len() >= timing::PIPE_MAX_OUTSTANDING {
            state.refused = true;
            return Err(PipeError::Backpressure(state.pending.len()));
        }

        let seq = state.next_seq;
        let mut envelope = Envelope::request(seq, payload);
        if !state.name_sent {
            envelope.my_name = Some(self.shared.local_name.clone());
        }
        let frame = codec::encode(&envelope)?;
        self.shared
            .outbound
            .send(Outgoing::Frame(frame))
            .map_err(|_| PipeError::Closed)?;

        state.next_seq += 1;
        state.name_sent = true;
        state.pending.insert(
            seq,
            PendingRequest {
                sent_at_ms: now_ms(),
                route,
            },
        );
        Ok(seq)
    }

    /// Send a request whose response bypasses the owner's event loop
    pub fn send_background(&self, payload: Value) -> Result<oneshot::Receiver<Value>, PipeError> {
        let (tx, rx) = oneshot::channel();
        self.send(payload, ResponseRoute::Background(tx))?;
        Ok(rx)
    }

    /// Answer an inbound request
    pub fn send_response(&self, seq: u64, payload: Value) -> Result<(), PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }

        let mut state = self.shared.lock();
        let mut envelope = Envelope::response(seq, payload);
        if !state.name_sent {
            envelope.my_name = Some(self.shared.local_name.clone());
        }
        let frame = codec::encode(&envelope)?;
        self.shared
            .outbound
            .send(Outgoing::Frame(frame))
            .map_err(|_| PipeError::Closed)?;
        state.name_sent = true;
        Ok(())
    }

    /// Close the pipe; repeated calls are no-ops
    pub fn close(&self, code: u16, reason: &str) {
        if self.shared.fail(format!("closed locally: {}", reason)) {
            let _ = self.shared.outbound.send(Outgoing::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

impl PipeShared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Invalidate the pipe and emit the terminal event; true only the first time
    fn fail(&self, reason: String) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Background waiters see their sender dropped
        self.lock().pending.clear();

        let event = if self.established.load(Ordering::SeqCst) {
            info!(pipe = self.id, remote = %self.remote, "Pipe closing: {}", reason);
            PipeEvent::Closing {
                pipe_id: self.id,
                reason,
            }
        } else {
            debug!(pipe = self.id, remote = %self.remote, "Pipe failed before connecting: {}", reason);
            PipeEvent::ConnectFailed {
                pipe_id: self.id,
                reason,
            }
        };
        let _ = self.events.send(event);
        true
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match codec::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(pipe = self.id, "Dropping undecodable frame: {}", e);
                return;
            }
        };

        if let Some(name) = envelope.my_name {
            self.lock().peer_name = Some(name);
        }

        if !envelope.response {
            let _ = self.events.send(PipeEvent::Inbound {
                pipe_id: self.id,
                seq: envelope.seq,
                payload: envelope.payload,
            });
            return;
        }

        let (request, rtt_ms, drained) = {
            let mut state = self.lock();
            let Some(request) = state.pending.remove(&envelope.seq) else {
                debug!(pipe = self.id, seq = envelope.seq, "Response with no pending request");
                return;
            };
            let rtt_ms = now_ms().saturating_sub(request.sent_at_ms);
            state.rtt.next(rtt_ms);
            (request, rtt_ms, std::mem::take(&mut state.refused))
        };

        match request.route {
            ResponseRoute::Dispatch => {
                let _ = self.events.send(PipeEvent::Response {
                    pipe_id: self.id,
                    seq: envelope.seq,
                    payload: envelope.payload,
                    rtt_ms,
                });
            }
            ResponseRoute::Background(tx) => {
                let _ = tx.send(envelope.payload);
            }
        }
        if drained {
            let _ = self.events.send(PipeEvent::Drained { pipe_id: self.id });
        }
    }
}

/// Socket loop for one pipe
async fn run_io<S>(
    shared: Arc<PipeShared>,
    ws: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        shared.fail(format!("write error: {}", e));
                        break;
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => {
                    shared.fail("closed by peer".to_string());
                    break;
                }
                Some(Ok(_)) => {} // Binary, Ping/Pong handled by tungstenite
                Some(Err(e)) => {
                    shared.fail(format!("read error: {}", e));
                    break;
                }
            },
        }
    }
}
