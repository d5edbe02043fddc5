//! Fake Lambda Runtime API server
//!
//! Mirrors the Runtime API contract closely enough for end-to-end runtime
//! tests: `next` blocks until an invocation is queued, posts are checked
//! against the invocation currently handed out, and every call is logged.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use faas_runtime_core::context::headers as runtime_headers;
use faas_runtime_core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::DEFAULT_TIMEOUT_MS;

/// An invocation waiting to be handed out by `next`
#[derive(Debug, Clone)]
pub struct QueuedInvocation {
    pub request_id: String,
    pub payload: Bytes,
    /// Absolute deadline; computed at delivery from `timeout_ms` when unset
    pub deadline_ms: Option<i64>,
    pub timeout_ms: i64,
    pub function_arn: String,
    pub trace_id: Option<String>,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
    /// Headers left out of the `next` response
    pub omitted_headers: HashSet<&'static str>,
}

impl QueuedInvocation {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        Self {
            trace_id: Some(format!(
                "Root=1-{:08x}-{};Sampled=0",
                chrono::Utc::now().timestamp(),
                &request_id.replace('-', "")[..24]
            )),
            request_id,
            payload: payload.into(),
            deadline_ms: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            function_arn: "arn:aws:lambda:us-east-1:000000000000:function:test-function"
                .to_string(),
            client_context: None,
            cognito_identity: None,
            omitted_headers: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_deadline_ms(mut self, deadline_ms: i64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        self
    }

    #[must_use]
    pub fn with_client_context(mut self, client_context: impl Into<String>) -> Self {
        self.client_context = Some(client_context.into());
        self
    }

    #[must_use]
    pub fn with_cognito_identity(mut self, cognito_identity: impl Into<String>) -> Self {
        self.cognito_identity = Some(cognito_identity.into());
        self
    }

    #[must_use]
    pub fn without_header(mut self, name: &'static str) -> Self {
        self.omitted_headers.insert(name);
        self
    }

    fn response_headers(&self) -> HeaderMap {
        let deadline_ms = self
            .deadline_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() + self.timeout_ms);

        let mut pairs = vec![
            (runtime_headers::REQUEST_ID, self.request_id.clone()),
            (runtime_headers::DEADLINE_MS, deadline_ms.to_string()),
            (runtime_headers::INVOKED_FUNCTION_ARN, self.function_arn.clone()),
        ];
        if let Some(trace_id) = &self.trace_id {
            pairs.push((runtime_headers::TRACE_ID, trace_id.clone()));
        }
        if let Some(client_context) = &self.client_context {
            pairs.push((runtime_headers::CLIENT_CONTEXT, client_context.clone()));
        }
        if let Some(cognito_identity) = &self.cognito_identity {
            pairs.push((runtime_headers::COGNITO_IDENTITY, cognito_identity.clone()));
        }

        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            if self.omitted_headers.contains(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                map.insert(name, value);
            }
        }
        map
    }
}

/// A call the runtime made against the fake API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Next,
    Response {
        request_id: String,
        body: Bytes,
    },
    Error {
        request_id: String,
        error_type: Option<String>,
        body: Bytes,
    },
    InitError {
        error_type: Option<String>,
        body: Bytes,
    },
}

impl ApiCall {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Response { request_id, .. } | Self::Error { request_id, .. } => Some(request_id),
            Self::Next | Self::InitError { .. } => None,
        }
    }

    pub fn is_next(&self) -> bool {
        matches!(self, Self::Next)
    }

    /// Decoded error body for error and init-error posts
    pub fn error_body(&self) -> Option<ErrorResponse> {
        match self {
            Self::Error { body, .. } | Self::InitError { body, .. } => serde_json::from_slice(body).ok(),
            Self::Next | Self::Response { .. } => None,
        }
    }
}

struct FakeState {
    invocation_rx: RwLock<mpsc::UnboundedReceiver<QueuedInvocation>>,
    current: Mutex<Option<String>>,
    calls: Mutex<Vec<ApiCall>>,
    forced_status: Mutex<Option<StatusCode>>,
    post_delay: Mutex<Option<Duration>>,
}

impl FakeState {
    fn record(&self, call: ApiCall) {
        self.calls.lock().push(call);
    }

    fn forced(&self) -> Option<StatusCode> {
        *self.forced_status.lock()
    }

    /// Stall a post before answering it, if a delay is set
    async fn hold_post(&self) {
        let delay = *self.post_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Accept a post for `request_id` only if it is the invocation in flight
    fn settle(&self, request_id: &str) -> StatusCode {
        let mut current = self.current.lock();
        match current.take() {
            Some(expected) if expected == request_id => StatusCode::ACCEPTED,
            Some(expected) => {
                error!(expected = %expected, received = %request_id, "Request ID mismatch");
                *current = Some(expected);
                StatusCode::BAD_REQUEST
            }
            None => {
                error!(request_id = %request_id, "No active invocation");
                StatusCode::BAD_REQUEST
            }
        }
    }
}

/// A running fake Runtime API
pub struct FakeRuntimeApi {
    addr: SocketAddr,
    state: Arc<FakeState>,
    invocation_tx: Mutex<Option<mpsc::UnboundedSender<QueuedInvocation>>>,
    server: JoinHandle<()>,
}

impl FakeRuntimeApi {
    /// Start the fake API on a random local port
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (invocation_tx, invocation_rx) = mpsc::unbounded_channel();
        let state = Arc::new(FakeState {
            invocation_rx: RwLock::new(invocation_rx),
            current: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            forced_status: Mutex::new(None),
            post_delay: Mutex::new(None),
        });

        let app = router(state.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Fake runtime API stopped");
            }
        });

        debug!(addr = %addr, "Fake runtime API listening");
        Ok(Self {
            addr,
            state,
            invocation_tx: Mutex::new(Some(invocation_tx)),
            server,
        })
    }

    /// `host:port`, as it would appear in `AWS_LAMBDA_RUNTIME_API`
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queue an invocation and return its request ID
    pub fn enqueue(&self, invocation: QueuedInvocation) -> String {
        let request_id = invocation.request_id.clone();
        if let Some(tx) = self.invocation_tx.lock().as_ref() {
            let _ = tx.send(invocation);
        }
        request_id
    }

    /// Make `next` fail with 500 once the queue drains
    pub fn close(&self) {
        self.invocation_tx.lock().take();
    }

    /// Answer every post with `status` instead of the normal checks
    pub fn reject_posts_with(&self, status: u16) {
        *self.state.forced_status.lock() = StatusCode::from_u16(status).ok();
    }

    /// Wait `delay` before answering each post
    pub fn delay_posts(&self, delay: Duration) {
        *self.state.post_delay.lock() = Some(delay);
    }

    /// All calls made so far, in arrival order
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.calls.lock().clone()
    }

    /// Wait until at least `count` calls satisfy `predicate`
    pub async fn wait_for<F>(&self, count: usize, timeout: Duration, predicate: F) -> Vec<ApiCall>
    where
        F: Fn(&ApiCall) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let calls = self.calls();
            if calls.iter().filter(|c| predicate(c)).count() >= count
                || tokio::time::Instant::now() >= deadline
            {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FakeRuntimeApi {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn router(state: Arc<FakeState>) -> Router {
    Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(get_next_invocation))
        .route(
            "/2018-06-01/runtime/invocation/:request_id/response",
            post(post_invocation_response),
        )
        .route(
            "/2018-06-01/runtime/invocation/:request_id/error",
            post(post_invocation_error),
        )
        .route("/2018-06-01/runtime/init/error", post(post_init_error))
        .with_state(state)
}

fn error_type_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(runtime_headers::FUNCTION_ERROR_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// GET /runtime/invocation/next
///
/// Blocks until an invocation is available, then returns it.
async fn get_next_invocation(State(state): State<Arc<FakeState>>) -> Response {
    state.record(ApiCall::Next);

    let invocation = {
        let mut rx = state.invocation_rx.write().await;
        rx.recv().await
    };

    let Some(invocation) = invocation else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Invocation channel closed").into_response();
    };

    *state.current.lock() = Some(invocation.request_id.clone());
    debug!(request_id = %invocation.request_id, "Delivering invocation to runtime");

    (
        StatusCode::OK,
        invocation.response_headers(),
        Body::from(invocation.payload),
    )
        .into_response()
}

/// POST /runtime/invocation/{requestId}/response
async fn post_invocation_response(
    State(state): State<Arc<FakeState>>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    state.hold_post().await;
    state.record(ApiCall::Response {
        request_id: request_id.clone(),
        body,
    });

    state.forced().unwrap_or_else(|| state.settle(&request_id))
}

/// POST /runtime/invocation/{requestId}/error
async fn post_invocation_error(
    State(state): State<Arc<FakeState>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.hold_post().await;
    state.record(ApiCall::Error {
        request_id: request_id.clone(),
        error_type: error_type_header(&headers),
        body,
    });

    state.forced().unwrap_or_else(|| state.settle(&request_id))
}

/// POST /runtime/init/error
async fn post_init_error(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.hold_post().await;
    state.record(ApiCall::InitError {
        error_type: error_type_header(&headers),
        body,
    });

    state.forced().unwrap_or(StatusCode::ACCEPTED)
}
