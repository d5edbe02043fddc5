//! Lambda Runtime API client
//!
//! The [`RuntimeApiClient`] trait is the seam the runtime loop talks through;
//! [`HttpRuntimeApiClient`] is the production implementation over `reqwest`.

pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use faas_runtime_core::{ErrorResponse, InvocationContext, RuntimeFault};

pub use http::{ClientConfig, HttpRuntimeApiClient};

/// The four Runtime API calls a runtime makes
///
/// Every failure is a [`RuntimeFault`]: the API guarantees delivery, so the
/// runtime never retries application-level rejections.
#[async_trait]
pub trait RuntimeApiClient: Send + Sync {
    /// Long-poll for the next invocation
    ///
    /// Suspends the caller until work arrives; never times out on its own.
    async fn next_invocation(&self) -> Result<InvocationContext, RuntimeFault>;

    /// Submit a successful response for `request_id`
    async fn post_response(&self, request_id: &str, response: Bytes) -> Result<(), RuntimeFault>;

    /// Submit a structured invocation error for `request_id`
    async fn post_error(&self, request_id: &str, error: &ErrorResponse) -> Result<(), RuntimeFault>;

    /// Report an initialization failure; only valid before the first poll
    async fn post_init_error(&self, error: &ErrorResponse) -> Result<(), RuntimeFault>;
}
