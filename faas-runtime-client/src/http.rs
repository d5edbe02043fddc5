//! HTTP implementation of the Runtime API client

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use faas_runtime_core::context::{headers, HEADER_FIELDS};
use faas_runtime_core::{
    ErrorReporter, ErrorResponse, FunctionMetadata, InvocationContext, InvocationOutcome,
    RawFailure, RuntimeEndpoint, RuntimeFault,
};

use crate::RuntimeApiClient;

/// Characters escaped when a request ID is placed in a URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Client tuning
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on every post call
    pub post_timeout: Duration,
    /// Immediate retries of `next` after a failed connection attempt
    pub next_retry_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            post_timeout: Duration::from_secs(2),
            next_retry_attempts: 3,
        }
    }
}

/// Runtime API client over `reqwest`
pub struct HttpRuntimeApiClient {
    base_url: String,
    client: Client,
    config: ClientConfig,
    function: Arc<FunctionMetadata>,
    reporter: ErrorReporter,
}

impl HttpRuntimeApiClient {
    /// Create a client bound to `endpoint`
    pub fn new(endpoint: &RuntimeEndpoint, config: ClientConfig) -> Result<Self, RuntimeFault> {
        // No client-wide timeout: `next` is a long poll. Posts set their own.
        let client = Client::builder()
            .user_agent(concat!("faas-runtime/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| RuntimeFault::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: endpoint.base_url(),
            client,
            config,
            function: Arc::default(),
            reporter: ErrorReporter::default(),
        })
    }

    /// Attach function metadata to every context this client returns
    #[must_use]
    pub fn with_function(mut self, function: Arc<FunctionMetadata>) -> Self {
        self.function = function;
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn invocation_url(&self, request_id: &str, action: &str) -> String {
        format!(
            "{}/runtime/invocation/{}/{}",
            self.base_url,
            utf8_percent_encode(request_id, PATH_SEGMENT),
            action
        )
    }

    fn fault(&self, failure: RawFailure) -> RuntimeFault {
        match self.reporter.classify(failure) {
            InvocationOutcome::RuntimeFault(fault) => fault,
            other => RuntimeFault::internal(format!(
                "API failure classified as {}",
                other.label()
            )),
        }
    }

    async fn send_post(
        &self,
        operation: &str,
        url: String,
        body: Vec<u8>,
        content_type: &'static str,
        error_type: Option<&str>,
    ) -> Result<(), RuntimeFault> {
        let mut request = self
            .client
            .post(&url)
            .timeout(self.config.post_timeout)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if let Some(error_type) = error_type {
            request = request.header(headers::FUNCTION_ERROR_TYPE, error_type);
        }

        let response = request.send().await.map_err(|e| {
            self.fault(RawFailure::ApiConnectionLost {
                detail: format!("{operation} failed: {e}"),
            })
        })?;

        check_status(operation, &response).map_err(|f| self.fault(f))?;
        debug!(operation = %operation, status = %response.status(), "Runtime API accepted post");
        Ok(())
    }
}

fn check_status(operation: &str, response: &Response) -> Result<(), RawFailure> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(RawFailure::ApiUnexpectedStatus {
            operation: operation.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Call `send` until it succeeds or fails for a reason other than connecting
///
/// On failure the error comes back with the number of attempts made.
async fn retry_connect<F, Fut>(retries: u32, mut send: F) -> Result<Response, (reqwest::Error, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = reqwest::Result<Response>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match send().await {
            Ok(response) => return Ok(response),
            // Connect errors only: the request never reached the API
            Err(e) if e.is_connect() && attempts <= retries => {
                warn!(attempt = attempts, error = %e, "Runtime API connection failed, retrying");
            }
            Err(e) => return Err((e, attempts)),
        }
    }
}

fn header_lookup(headers: &HeaderMap) -> impl Fn(&str) -> Option<String> + '_ {
    move |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    }
}

#[async_trait]
impl RuntimeApiClient for HttpRuntimeApiClient {
    async fn next_invocation(&self) -> Result<InvocationContext, RuntimeFault> {
        let url = format!("{}/runtime/invocation/next", self.base_url);
        let response = retry_connect(self.config.next_retry_attempts, || self.client.get(&url).send())
            .await
            .map_err(|(e, attempts)| {
                self.fault(RawFailure::ApiConnectionLost {
                    detail: format!("GET /runtime/invocation/next failed after {attempts} attempt(s): {e}"),
                })
            })?;

        check_status("GET /runtime/invocation/next", &response).map_err(|f| self.fault(f))?;

        let response_headers = response.headers().clone();
        let payload = response.bytes().await.map_err(|e| {
            self.fault(RawFailure::ApiConnectionLost {
                detail: format!("reading invocation payload failed: {e}"),
            })
        })?;

        let context =
            InvocationContext::from_lookup(&HEADER_FIELDS, header_lookup(&response_headers), payload)?
                .with_function(self.function.clone());

        debug!(request_id = %context.request_id, deadline_ms = context.deadline_ms, "Received invocation");
        Ok(context)
    }

    async fn post_response(&self, request_id: &str, response: Bytes) -> Result<(), RuntimeFault> {
        self.send_post(
            "POST /runtime/invocation/{id}/response",
            self.invocation_url(request_id, "response"),
            response.to_vec(),
            "application/json",
            None,
        )
        .await
    }

    async fn post_error(&self, request_id: &str, error: &ErrorResponse) -> Result<(), RuntimeFault> {
        self.send_post(
            "POST /runtime/invocation/{id}/error",
            self.invocation_url(request_id, "error"),
            error.to_json_bytes(),
            "application/json",
            Some(&error.error_type),
        )
        .await
    }

    async fn post_init_error(&self, error: &ErrorResponse) -> Result<(), RuntimeFault> {
        self.send_post(
            "POST /runtime/init/error",
            format!("{}/runtime/init/error", self.base_url),
            error.to_json_bytes(),
            "application/json",
            Some(&error.error_type),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpRuntimeApiClient {
        let endpoint = RuntimeEndpoint::parse("127.0.0.1:9001").unwrap();
        HttpRuntimeApiClient::new(&endpoint, ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_invocation_url() {
        let client = client();
        assert_eq!(
            client.invocation_url("8476a536-e9f4-11e8-9739-2dfe598c3fcd", "response"),
            "http://127.0.0.1:9001/2018-06-01/runtime/invocation/8476a536-e9f4-11e8-9739-2dfe598c3fcd/response"
        );
    }

    #[test]
    fn test_invocation_url_escapes_path_characters() {
        let client = client();
        assert_eq!(
            client.invocation_url("a/b c", "error"),
            "http://127.0.0.1:9001/2018-06-01/runtime/invocation/a%2Fb%20c/error"
        );
    }

    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/")
    }

    #[tokio::test]
    async fn test_connect_errors_are_retried_up_to_the_limit() {
        let url = closed_port_url().await;
        let http = Client::new();
        let mut sent = 0;

        let err = retry_connect(2, || {
            sent += 1;
            http.get(&url).send()
        })
        .await
        .unwrap_err();

        assert!(err.0.is_connect());
        assert_eq!(err.1, 3);
        assert_eq!(sent, 3);
    }

    #[tokio::test]
    async fn test_no_retries_when_disabled() {
        let url = closed_port_url().await;
        let http = Client::new();
        let mut sent = 0;

        let err = retry_connect(0, || {
            sent += 1;
            http.get(&url).send()
        })
        .await
        .unwrap_err();

        assert_eq!(err.1, 1);
        assert_eq!(sent, 1);
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.post_timeout, Duration::from_secs(2));
        assert_eq!(config.next_retry_attempts, 3);
    }
}
