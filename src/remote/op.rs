//! Handle for a single backend call

use rid_relay_shared::now_ms;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use super::signing::Method;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(0);

/// What to send
#[derive(Debug, Clone, PartialEq)]
pub struct OpRequest {
    pub method: Method,
    /// Path on the configured backend host, or an absolute URL
    pub path: String,
    pub payload: Option<Value>,
    pub signed: bool,
}

impl OpRequest {
    pub fn signed(method: Method, path: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            payload,
            signed: true,
        }
    }

    pub fn unsigned(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            payload: None,
            signed: false,
        }
    }
}

/// Final classification of a call
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Success { raw: String, result: Option<Value> },
    Failed { raw: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request failed: {0}")]
    Failed(String),

    #[error("Response has no object id")]
    MissingId,

    #[error("Op dropped before completion")]
    Dropped,
}

#[derive(Debug, Default)]
struct OpTimes {
    sent_at_ms: u64,
    received_at_ms: u64,
    attempts: u32,
}

struct OpInner {
    id: u64,
    request: OpRequest,
    queued_at_ms: u64,
    times: Mutex<OpTimes>,
    outcome: watch::Sender<Option<OpOutcome>>,
}

/// Shared, cloneable handle to an in-flight or finished call
#[derive(Clone)]
pub struct Op {
    inner: Arc<OpInner>,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.inner.id)
            .field("method", &self.inner.request.method)
            .field("path", &self.inner.request.path)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Op {
    pub fn new(request: OpRequest) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(OpInner {
                id: NEXT_OP_ID.fetch_add(1, Ordering::SeqCst) + 1,
                request,
                queued_at_ms: now_ms(),
                times: Mutex::new(OpTimes::default()),
                outcome,
            }),
        }
    }

    fn times(&self) -> MutexGuard<'_, OpTimes> {
        match self.inner.times.lock() {
            Ok(times) => times,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn request(&self) -> &OpRequest {
        &self.inner.request
    }

    pub fn queued_at_ms(&self) -> u64 {
        self.inner.queued_at_ms
    }

    pub fn sent_at_ms(&self) -> u64 {
        self.times().sent_at_ms
    }

    pub fn received_at_ms(&self) -> u64 {
        self.times().received_at_ms
    }

    /// Times the request went out, including retries while unreachable
    pub fn attempts(&self) -> u32 {
        self.times().attempts
    }

    /// Time from the last send to the reply, zero until done
    pub fn round_trip_ms(&self) -> u64 {
        let times = self.times();
        times.received_at_ms.saturating_sub(times.sent_at_ms)
    }

    pub(crate) fn mark_sent(&self) {
        let mut times = self.times();
        times.sent_at_ms = now_ms();
        times.attempts += 1;
    }

    pub(crate) fn complete(&self, outcome: OpOutcome) {
        self.times().received_at_ms = now_ms();
        self.inner.outcome.send_replace(Some(outcome));
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    pub fn succeeded(&self) -> bool {
        matches!(*self.inner.outcome.borrow(), Some(OpOutcome::Success { .. }))
    }

    pub fn failed(&self) -> bool {
        matches!(*self.inner.outcome.borrow(), Some(OpOutcome::Failed { .. }))
    }

    pub fn outcome(&self) -> Option<OpOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Parsed `result` of a successful call
    pub fn result(&self) -> Option<Value> {
        match &*self.inner.outcome.borrow() {
            Some(OpOutcome::Success { result, .. }) => result.clone(),
            _ => None,
        }
    }

    /// Raw response text, empty until done
    pub fn raw(&self) -> String {
        match &*self.inner.outcome.borrow() {
            Some(OpOutcome::Success { raw, .. }) | Some(OpOutcome::Failed { raw, .. }) => raw.clone(),
            None => String::new(),
        }
    }

    /// Failure reason, if the call failed
    pub fn failure(&self) -> Option<String> {
        match &*self.inner.outcome.borrow() {
            Some(OpOutcome::Failed { reason, .. }) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Backend-assigned object id from the parsed result
    pub fn object_id(&self) -> Result<String, OpError> {
        if let Some(reason) = self.failure() {
            return Err(OpError::Failed(reason));
        }
        self.result()
            .as_ref()
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(OpError::MissingId)
    }

    /// Wait for completion, at most `limit`
    pub async fn wait(&self, limit: Duration) -> Result<OpOutcome, OpError> {
        let mut rx = self.inner.outcome.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await;
        match waited {
            Err(_) => Err(OpError::Timeout(limit)),
            Ok(Err(_)) => Err(OpError::Dropped),
            Ok(Ok(outcome)) => outcome.clone().ok_or(OpError::Dropped),
        }
    }
}
