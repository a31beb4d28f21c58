//! Signed, retrying client for the mapping backend
//!
//! Every call goes through one worker task, so this node never has more
//! than one request outstanding against the backend.

use async_trait::async_trait;
use rand::Rng;
use rid_relay_shared::{now_ms, timing, MovingAverage};
use serde_json::Value;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::op::{Op, OpOutcome, OpRequest};
use super::signing::{self, Method};

/// Fully built HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub user_agent: String,
}

/// Status and body of an HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Errors from executing a request
#[derive(Error, Debug)]
pub enum ExecError {
    /// No route or name resolution; worth retrying later
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Performs HTTP requests for the client worker
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpReply, ExecError>;
}

/// [`HttpExecutor`] backed by reqwest
pub struct ReqwestExecutor {
    http: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpReply, ExecError> {
        let builder = match request.method {
            Method::Get => self.http.get(&request.url),
            Method::Post => self.http.post(&request.url),
            Method::Delete => self.http.delete(&request.url),
        };
        let mut builder = builder.header(reqwest::header::USER_AGENT, &request.user_agent);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_connect() && is_offline(&e) {
                ExecError::Unreachable(e.to_string())
            } else {
                ExecError::Transport(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

/// Whether a connect failure means this node has no network path yet
///
/// Name resolution failures and unreachable networks qualify. A refused or
/// reset connection reached a live host and does not.
fn is_offline(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(io.kind(), ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable) {
                return true;
            }
        }
        let text = e.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = e.source();
    }
    false
}

/// Backend credentials and retry bounds
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub domain: String,
    pub credential_id: String,
    pub credential_secret: String,
    pub user_agent: String,
    pub retry_min: Duration,
    pub retry_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            domain: "caltopo.com".into(),
            credential_id: String::new(),
            credential_secret: String::new(),
            user_agent: format!("rid-relay/{}", env!("CARGO_PKG_VERSION")),
            retry_min: Duration::from_millis(timing::RETRY_MIN_DELAY_MS),
            retry_max: Duration::from_millis(timing::RETRY_MAX_DELAY_MS),
        }
    }
}

/// Called on the worker once an op has finished
pub type Completion = Box<dyn FnOnce(Op) + Send>;

struct Job {
    op: Op,
    completion: Option<Completion>,
}

/// Handle to the single backend worker
#[derive(Clone)]
pub struct RemoteClient {
    jobs: mpsc::UnboundedSender<Job>,
    rtt: Arc<Mutex<MovingAverage>>,
}

impl RemoteClient {
    /// Spawn the worker
    pub fn new(config: ClientConfig, executor: Arc<dyn HttpExecutor>) -> Self {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let rtt = Arc::new(Mutex::new(MovingAverage::new(timing::BACKEND_RTT_WINDOW)));
        info!(domain = %config.domain, "Backend client started");
        tokio::spawn(worker_loop(config, executor, jobs_rx, rtt.clone()));
        Self { jobs, rtt }
    }

    /// Queue a request
    pub fn send(&self, request: OpRequest) -> Op {
        self.submit(request, None)
    }

    /// Queue a request and run `completion` when it finishes
    pub fn send_with(&self, request: OpRequest, completion: Completion) -> Op {
        self.submit(request, Some(completion))
    }

    fn submit(&self, request: OpRequest, completion: Option<Completion>) -> Op {
        let op = Op::new(request);
        let job = Job {
            op: op.clone(),
            completion,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            job.op.complete(OpOutcome::Failed {
                raw: String::new(),
                reason: "backend worker stopped".into(),
            });
            if let Some(completion) = job.completion {
                completion(job.op);
            }
        }
        op
    }

    /// Average backend round trip in seconds
    pub fn rtt_secs(&self) -> f64 {
        self.rtt.lock().map(|avg| avg.get() / 1000.0).unwrap_or(0.0)
    }
}

async fn worker_loop(
    config: ClientConfig,
    executor: Arc<dyn HttpExecutor>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    rtt: Arc<Mutex<MovingAverage>>,
) {
    while let Some(job) = jobs.recv().await {
        let outcome = run_op(&config, executor.as_ref(), &job.op).await;
        if let OpOutcome::Failed { reason, .. } = &outcome {
            warn!(
                op = job.op.id(),
                "{} {} failed: {}",
                job.op.request().method,
                job.op.request().path,
                reason
            );
        }
        job.op.complete(outcome);
        if job.op.succeeded() {
            if let Ok(mut avg) = rtt.lock() {
                avg.next(job.op.round_trip_ms());
            }
        }
        if let Some(completion) = job.completion {
            completion(job.op);
        }
    }
    debug!("Backend worker stopped");
}

/// Execute one op, retrying for as long as the backend is unreachable
async fn run_op(config: &ClientConfig, executor: &dyn HttpExecutor, op: &Op) -> OpOutcome {
    let request = op.request();
    loop {
        // Re-sign each attempt so retries never go out with a stale expiry
        let http = match build_request(config, request, now_ms()) {
            Ok(http) => http,
            Err(reason) => {
                return OpOutcome::Failed {
                    raw: String::new(),
                    reason,
                }
            }
        };

        op.mark_sent();
        match executor.execute(&http).await {
            Ok(reply) => return classify(reply, request.signed),
            Err(ExecError::Unreachable(e)) => {
                let delay = retry_delay(config);
                info!(op = op.id(), "Backend unreachable ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(ExecError::Transport(e)) => {
                return OpOutcome::Failed {
                    raw: String::new(),
                    reason: format!("Exception raised during request: {}", e),
                }
            }
        }
    }
}

fn retry_delay(config: &ClientConfig) -> Duration {
    let min = config.retry_min.as_millis() as u64;
    let max = (config.retry_max.as_millis() as u64).max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

/// Turn an op into an HTTP request, signing it when required
pub fn build_request(
    config: &ClientConfig,
    request: &OpRequest,
    now: u64,
) -> Result<HttpRequest, String> {
    let url = if request.path.starts_with("http://") || request.path.starts_with("https://") {
        request.path.clone()
    } else {
        format!("https://{}{}", config.domain, request.path)
    };
    let mut http = HttpRequest {
        method: request.method,
        url,
        query: Vec::new(),
        form: Vec::new(),
        user_agent: config.user_agent.clone(),
    };
    if !request.signed {
        return Ok(http);
    }

    let payload = match &request.payload {
        Some(value) => serde_json::to_string(value).map_err(|e| e.to_string())?,
        None => String::new(),
    };
    let expires = now + timing::SIGNATURE_TTL_MS;
    let signature = signing::sign(
        &config.credential_secret,
        request.method,
        &request.path,
        expires,
        &payload,
    )
    .map_err(|e| e.to_string())?;

    let params = vec![
        ("id".to_string(), config.credential_id.clone()),
        ("expires".to_string(), expires.to_string()),
        ("signature".to_string(), signature),
    ];
    if request.method == Method::Post && request.payload.is_some() {
        http.form = params;
        http.form.push(("json".to_string(), payload));
    } else {
        http.query = params;
    }
    Ok(http)
}

/// Map an HTTP reply onto an op outcome
pub fn classify(reply: HttpReply, signed: bool) -> OpOutcome {
    if !(200..300).contains(&reply.status) {
        return OpOutcome::Failed {
            reason: format!("HTTP {}", reply.status),
            raw: reply.body,
        };
    }
    if reply.body.trim().is_empty() {
        return OpOutcome::Success {
            raw: reply.body,
            result: None,
        };
    }

    match serde_json::from_str::<Value>(&reply.body) {
        Ok(mut parsed) if signed => match parsed.get_mut("result").map(Value::take) {
            Some(result) => OpOutcome::Success {
                raw: reply.body,
                result: Some(result),
            },
            None => OpOutcome::Failed {
                raw: reply.body,
                reason: "response has no result".into(),
            },
        },
        Ok(parsed) => OpOutcome::Success {
            raw: reply.body,
            result: Some(parsed),
        },
        Err(e) if signed => OpOutcome::Failed {
            raw: reply.body,
            reason: format!("malformed response: {}", e),
        },
        Err(_) => OpOutcome::Success {
            raw: reply.body,
            result: None,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;

    /// Replays scripted results and records every request it sees
    #[derive(Default)]
    pub(crate) struct ScriptedExecutor {
        pub script: AsyncMutex<VecDeque<Result<HttpReply, ExecError>>>,
        pub seen: AsyncMutex<Vec<HttpRequest>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn with(script: Vec<Result<HttpReply, ExecError>>) -> Arc<Self> {
            Arc::new(Self {
                script: AsyncMutex::new(script.into()),
                seen: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpExecutor for ScriptedExecutor {
        async fn execute(&self, request: &HttpRequest) -> Result<HttpReply, ExecError> {
            self.seen.lock().await.push(request.clone());
            self.script.lock().await.pop_front().unwrap_or(Ok(HttpReply {
                status: 200,
                body: r#"{"status":"ok","result":{}}"#.into(),
            }))
        }
    }

    pub(crate) fn ok(body: &str) -> Result<HttpReply, ExecError> {
        Ok(HttpReply {
            status: 200,
            body: body.into(),
        })
    }

    pub(crate) fn test_config() -> ClientConfig {
        ClientConfig {
            credential_id: "CRED1".into(),
            credential_secret: "c2VjcmV0LWtleS1mb3ItdGVzdHM=".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_signed_post_uses_form_body() {
        let request = OpRequest::signed(Method::Post, "/api/v1/map/M/Folder", Some(json!({"a": 1})));
        let http = build_request(&test_config(), &request, 1_000).unwrap();

        assert_eq!(http.url, "https://caltopo.com/api/v1/map/M/Folder");
        assert!(http.query.is_empty());
        let keys: Vec<&str> = http.form.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["id", "expires", "signature", "json"]);
        assert_eq!(http.form[1].1, "121000");
        assert_eq!(http.form[3].1, r#"{"a":1}"#);
    }

    #[test]
    fn test_signed_get_uses_query() {
        let request = OpRequest::signed(Method::Get, "/api/v1/map/M/since/0", None);
        let http = build_request(&test_config(), &request, 0).unwrap();
        assert!(http.form.is_empty());
        assert_eq!(http.query.len(), 3);
        assert_eq!(http.query[0], ("id".to_string(), "CRED1".to_string()));
    }

    #[test]
    fn test_unsigned_absolute_url() {
        let request = OpRequest::unsigned(Method::Get, "https://caltopo.com/api/v1/position/report/G?id=x");
        let http = build_request(&test_config(), &request, 0).unwrap();
        assert_eq!(http.url, "https://caltopo.com/api/v1/position/report/G?id=x");
        assert!(http.query.is_empty() && http.form.is_empty());
    }

    #[test]
    fn test_missing_secret_fails_signing() {
        let request = OpRequest::signed(Method::Get, "/x", None);
        assert!(build_request(&ClientConfig::default(), &request, 0).is_err());
    }

    #[test]
    fn test_classify_replies() {
        let reply = |status, body: &str| HttpReply { status, body: body.into() };

        assert!(matches!(
            classify(reply(200, r#"{"result":{"id":"x"}}"#), true),
            OpOutcome::Success { result: Some(_), .. }
        ));
        assert!(matches!(classify(reply(200, ""), true), OpOutcome::Success { result: None, .. }));
        assert!(matches!(classify(reply(200, "<html>"), true), OpOutcome::Failed { .. }));
        assert!(matches!(classify(reply(200, r#"{"status":"ok"}"#), true), OpOutcome::Failed { .. }));
        assert!(matches!(classify(reply(200, "OK"), false), OpOutcome::Success { result: None, .. }));
        match classify(reply(403, "denied"), true) {
            OpOutcome::Failed { raw, reason } => {
                assert_eq!(raw, "denied");
                assert_eq!(reason, "HTTP 403");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_retries_same_request() {
        tokio::time::pause();
        let executor = ScriptedExecutor::with(vec![
            Err(ExecError::Unreachable("dns".into())),
            Err(ExecError::Unreachable("dns".into())),
            ok(r#"{"result":{"id":"abc"}}"#),
        ]);
        let client = RemoteClient::new(test_config(), executor.clone());

        let op = client.send(OpRequest::signed(Method::Post, "/api/v1/map/M/Marker", Some(json!({}))));
        op.wait(Duration::from_secs(600)).await.unwrap();

        assert_eq!(op.object_id().unwrap(), "abc");
        assert_eq!(op.attempts(), 3);
        let seen = executor.seen.lock().await;
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| r.url == seen[0].url));
    }

    #[derive(Debug, Error)]
    #[error("error trying to connect")]
    struct ConnectError(#[source] std::io::Error);

    #[test]
    fn test_only_missing_network_counts_as_offline() {
        let io = |kind, text: &str| std::io::Error::new(kind, text.to_string());

        assert!(is_offline(&io(ErrorKind::HostUnreachable, "no route to host")));
        assert!(is_offline(&ConnectError(io(ErrorKind::NetworkUnreachable, "network is unreachable"))));
        assert!(is_offline(&ConnectError(io(
            ErrorKind::Other,
            "dns error: failed to lookup address information"
        ))));
        assert!(!is_offline(&ConnectError(io(ErrorKind::ConnectionRefused, "connection refused"))));
        assert!(!is_offline(&io(ErrorKind::ConnectionReset, "reset by peer")));
    }

    #[tokio::test]
    async fn test_transport_error_fails_op() {
        let executor = ScriptedExecutor::with(vec![Err(ExecError::Transport("reset".into()))]);
        let client = RemoteClient::new(test_config(), executor);

        let op = client.send(OpRequest::signed(Method::Delete, "/api/v1/map/M/Shape/1", None));
        op.wait(Duration::from_secs(5)).await.unwrap();
        assert!(op.failed());
        assert!(op.failure().unwrap().starts_with("Exception raised during request"));
    }

    #[tokio::test]
    async fn test_completions_run_in_submission_order() {
        let executor = ScriptedExecutor::with(vec![]);
        let client = RemoteClient::new(test_config(), executor);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            let tx = tx.clone();
            client.send_with(
                OpRequest::signed(Method::Get, format!("/p/{}", i), None),
                Box::new(move |op: Op| {
                    let _ = tx.send((i, op.succeeded()));
                }),
            );
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await, Some((i, true)));
        }
    }
}
