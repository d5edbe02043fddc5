//! Test utilities for the FaaS runtime
//!
//! Provides an in-process fake of the Lambda Runtime API:
//! - Serve the four runtime routes on a random local port
//! - Queue invocations with arbitrary headers and deadlines
//! - Force post rejections to exercise fault paths
//! - Inspect every call the runtime made, in order
//!
//! ## Usage
//!
//! ```rust,no_run
//! use faas_runtime_test::{FakeRuntimeApi, QueuedInvocation};
//!
//! #[tokio::test]
//! async fn test_runtime() {
//!     let api = FakeRuntimeApi::start().await.unwrap();
//!     api.enqueue(QueuedInvocation::new(r#"{"name":"world"}"#));
//!
//!     // Point the runtime at `api.endpoint()` ...
//!
//!     let calls = api.calls();
//! }
//! ```

pub mod server;

pub use server::{ApiCall, FakeRuntimeApi, QueuedInvocation};

/// Default invocation budget for queued invocations
pub const DEFAULT_TIMEOUT_MS: i64 = 3_000;
