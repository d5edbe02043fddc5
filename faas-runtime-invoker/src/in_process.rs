//! In-process handler execution
//!
//! Each invocation is driven on a blocking-pool thread through the runtime
//! handle, so a handler that blocks its thread cannot stall the deadline
//! timer, whatever the runtime flavor. At the deadline the handler is told
//! to stop and is dropped at its next await; code that never yields keeps
//! its thread until it returns, and its result is discarded.
//!
//! A result that arrives at or after the deadline is a timeout.
//!
//! A panic unwinds through shared process state, so it is treated as fatal
//! rather than as an isolated crash.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, warn};

use faas_runtime_core::{
    HandlerFailure, InitError, InitializationResult, InvocationContext, InvocationOutcome,
    RawFailure,
};

use crate::response::{timeout_outcome, validate_response};
use crate::{HandlerInvoker, InvokerConfig};

/// Function code running inside the runtime process
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called once before the first invocation
    async fn init(&self) -> Result<(), InitError> {
        Ok(())
    }

    /// Handle one invocation, returning the raw response body
    async fn call(&self, payload: Bytes, context: InvocationContext) -> Result<Bytes, HandlerFailure>;
}

/// Runs a [`Handler`] on a blocking-pool thread per invocation
pub struct InProcessInvoker<H> {
    handler: Arc<H>,
    config: InvokerConfig,
}

impl<H: Handler> InProcessInvoker<H> {
    pub fn new(handler: H, config: InvokerConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
        }
    }
}

#[async_trait]
impl<H: Handler> HandlerInvoker for InProcessInvoker<H> {
    async fn init(&self) -> InitializationResult {
        self.handler.init().await.into()
    }

    async fn invoke(&self, input: Bytes, context: &InvocationContext) -> InvocationOutcome {
        let budget = context.remaining_time();
        if budget.is_zero() {
            warn!(request_id = %context.request_id, "Invocation arrived past its deadline");
            return timeout_outcome(context, budget, &self.config);
        }

        let handler = self.handler.clone();
        let task_context = context.clone();
        let runtime = Handle::current();
        let (cancel, cancelled) = oneshot::channel::<()>();
        let mut task = tokio::task::spawn_blocking(move || {
            runtime.block_on(async move {
                tokio::select! {
                    result = handler.call(input, task_context) => Some(result),
                    _ = cancelled => None,
                }
            })
        });

        let joined = tokio::time::timeout(budget, &mut task).await;
        drop(cancel);

        match joined {
            Err(_) => {
                warn!(request_id = %context.request_id, ?budget, "Handler timed out, cancelled");
                timeout_outcome(context, budget, &self.config)
            }
            Ok(Ok(Some(_))) if context.is_expired() => {
                warn!(request_id = %context.request_id, ?budget, "Handler finished after its deadline");
                timeout_outcome(context, budget, &self.config)
            }
            Ok(Ok(Some(Ok(output)))) => validate_response(output, &self.config),
            Ok(Ok(Some(Err(failure)))) => self.config.reporter.classify(failure.into_raw()),
            Ok(Ok(None)) => timeout_outcome(context, budget, &self.config),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let detail = panic_message(join_err.into_panic());
                error!(request_id = %context.request_id, panic = %detail, "Handler panicked");
                self.config.reporter.classify(RawFailure::HandlerPanicked { detail })
            }
            Ok(Err(join_err)) => self.config.reporter.classify(RawFailure::RuntimeInternal {
                detail: format!("handler task did not complete: {join_err}"),
            }),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Adapter from a JSON closure to [`Handler`], see [`handler_fn`]
pub struct FnHandler<F, Fut, R> {
    f: F,
    _marker: PhantomData<fn() -> (Fut, R)>,
}

/// Wrap an async closure taking and returning JSON
///
/// A blank payload is passed as `null`. A payload that is not JSON is an
/// application error of type `InvalidPayload`; a result that fails to
/// serialize is an invalid response.
pub fn handler_fn<F, Fut, R>(f: F) -> FnHandler<F, Fut, R>
where
    F: Fn(serde_json::Value, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerFailure>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, R> Handler for FnHandler<F, Fut, R>
where
    F: Fn(serde_json::Value, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerFailure>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, payload: Bytes, context: InvocationContext) -> Result<Bytes, HandlerFailure> {
        let event = if payload.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&payload).map_err(|e| {
                HandlerFailure::new(format!("payload is not valid JSON: {e}"))
                    .with_error_type("InvalidPayload")
            })?
        };

        let result = (self.f)(event, context).await?;
        serde_json::to_vec(&result)
            .map(Bytes::from)
            .map_err(|e| HandlerFailure::invalid_response(format!("response could not be serialized: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_runtime_core::{FaultKind, HandlerErrorKind};
    use std::collections::HashMap;
    use std::time::Duration;

    fn context_with_budget(budget: Duration) -> InvocationContext {
        let deadline = faas_runtime_core::context::now_millis()
            + i64::try_from(budget.as_millis()).unwrap();
        let fields: HashMap<&str, String> = [
            ("id", "req-1".to_string()),
            ("deadline", deadline.to_string()),
            ("arn", "arn:aws:lambda:us-east-1:000000000000:function:f".to_string()),
        ]
        .into_iter()
        .collect();

        let names = faas_runtime_core::context::FieldNames {
            request_id: "id",
            deadline_ms: "deadline",
            invoked_function_arn: "arn",
            trace_id: "trace",
            client_context: "client",
            cognito_identity: "cognito",
        };
        InvocationContext::from_lookup(&names, |n| fields.get(n).cloned(), Bytes::new()).unwrap()
    }

    fn greeter() -> InProcessInvoker<impl Handler> {
        InProcessInvoker::new(
            handler_fn(|event: serde_json::Value, _ctx| async move {
                match event.get("name").and_then(|n| n.as_str()) {
                    Some(name) => Ok(serde_json::json!({ "message": format!("Hello, {name}!") })),
                    None => Err(HandlerFailure::new("Missing 'name' field in payload")),
                }
            }),
            InvokerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_success() {
        let invoker = greeter();
        let ctx = context_with_budget(Duration::from_secs(5));

        let outcome = invoker.invoke(Bytes::from_static(br#"{"name":"Ada"}"#), &ctx).await;
        assert_eq!(
            outcome,
            InvocationOutcome::Success(Bytes::from_static(br#"{"message":"Hello, Ada!"}"#))
        );
    }

    #[tokio::test]
    async fn test_application_error() {
        let invoker = greeter();
        let ctx = context_with_budget(Duration::from_secs(5));

        let outcome = invoker.invoke(Bytes::from_static(b"{}"), &ctx).await;
        let InvocationOutcome::HandlerError(err) = outcome else {
            panic!("expected handler error, got {outcome:?}");
        };
        assert_eq!(err.kind, HandlerErrorKind::ApplicationError);
        assert_eq!(err.error_type, "ApplicationError");
        assert_eq!(err.error_message, "Missing 'name' field in payload");
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let invoker = greeter();
        let ctx = context_with_budget(Duration::from_secs(5));

        let outcome = invoker.invoke(Bytes::from_static(b"not json"), &ctx).await;
        let InvocationOutcome::HandlerError(err) = outcome else {
            panic!("expected handler error, got {outcome:?}");
        };
        assert_eq!(err.error_type, "InvalidPayload");
    }

    #[tokio::test]
    async fn test_timeout_returns_at_deadline() {
        let invoker = InProcessInvoker::new(
            handler_fn(|_event, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, HandlerFailure>(serde_json::json!({"late": true}))
            }),
            InvokerConfig::default(),
        );
        let ctx = context_with_budget(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = invoker.invoke(Bytes::from_static(b"{}"), &ctx).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let InvocationOutcome::HandlerError(err) = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(err.kind, HandlerErrorKind::Timeout);
        assert_eq!(err.error_type, "Timeout");
    }

    #[tokio::test]
    async fn test_blocking_handler_times_out_on_current_thread_runtime() {
        let invoker = InProcessInvoker::new(
            handler_fn(|_event, _ctx| async move {
                std::thread::sleep(Duration::from_millis(1500));
                Ok::<_, HandlerFailure>(serde_json::json!({"late": true}))
            }),
            InvokerConfig::default(),
        );
        let ctx = context_with_budget(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = invoker.invoke(Bytes::from_static(b"{}"), &ctx).await;
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

        let InvocationOutcome::HandlerError(err) = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(err.kind, HandlerErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_handler() {
        let invoker = greeter();
        let ctx = context_with_budget(Duration::ZERO);

        let outcome = invoker.invoke(Bytes::from_static(br#"{"name":"Ada"}"#), &ctx).await;
        assert!(matches!(
            outcome,
            InvocationOutcome::HandlerError(ref err) if err.kind == HandlerErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn test_panic_is_fatal() {
        let invoker = InProcessInvoker::new(
            handler_fn(|_event, _ctx| async move {
                if true {
                    panic!("index out of bounds");
                }
                Ok::<_, HandlerFailure>(serde_json::Value::Null)
            }),
            InvokerConfig::default(),
        );
        let ctx = context_with_budget(Duration::from_secs(5));

        let outcome = invoker.invoke(Bytes::from_static(b"{}"), &ctx).await;
        let InvocationOutcome::RuntimeFault(fault) = outcome else {
            panic!("expected fault, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::HandlerPanicked);
        assert!(fault.reason.contains("index out of bounds"));
    }

    struct FailingInit;

    #[async_trait]
    impl Handler for FailingInit {
        async fn init(&self) -> Result<(), InitError> {
            Err(InitError::new("Runtime.InitError", "missing config"))
        }

        async fn call(&self, _payload: Bytes, _context: InvocationContext) -> Result<Bytes, HandlerFailure> {
            Ok(Bytes::from_static(b"null"))
        }
    }

    #[tokio::test]
    async fn test_init_hook_failure() {
        let invoker = InProcessInvoker::new(FailingInit, InvokerConfig::default());
        assert_eq!(
            invoker.init().await,
            InitializationResult::InitError(InitError::new("Runtime.InitError", "missing config"))
        );
    }
}
