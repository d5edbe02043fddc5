//! Handler execution for the FaaS runtime
//!
//! A [`HandlerInvoker`] runs function code for one invocation and always
//! comes back by the invocation deadline. Two isolation strategies exist:
//!
//! - [`SubprocessInvoker`] runs the function binary as a child process per
//!   invocation. A crash kills only the child and is reported as
//!   `HandlerError(Crash)`; the runtime keeps serving.
//! - [`InProcessInvoker`] runs a [`Handler`] inside the runtime process. Startup is
//!   cheaper, but a panic cannot be contained and ends the process with
//!   `RuntimeFault(HandlerPanicked)`.

pub mod in_process;
pub mod response;
pub mod subprocess;

use async_trait::async_trait;
use bytes::Bytes;
use faas_runtime_core::{ErrorReporter, InitializationResult, InvocationContext, InvocationOutcome};

pub use in_process::{handler_fn, FnHandler, Handler, InProcessInvoker};
pub use subprocess::SubprocessInvoker;

/// Largest response the Runtime API accepts for synchronous invocations
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 6 * 1024 * 1024;

/// Runs function code for the runtime loop
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    /// One-time initialization hook, run before the first poll
    async fn init(&self) -> InitializationResult {
        InitializationResult::Ready
    }

    /// Run the handler with `input`, returning no later than the context deadline
    async fn invoke(&self, input: Bytes, context: &InvocationContext) -> InvocationOutcome;
}

/// Settings shared by the invoker strategies
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub max_response_bytes: usize,
    pub reporter: ErrorReporter,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            reporter: ErrorReporter::default(),
        }
    }
}
