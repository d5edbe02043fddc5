//! SDK for function binaries run by the subprocess invoker
//!
//! The runtime starts the function binary once per invocation, with the
//! payload on stdin and the invocation context in the environment. [`run`]
//! reads both, calls the handler and answers the way the invoker expects:
//!
//! - success: the JSON result on stdout, exit 0
//! - handler error: `{"errorMessage", "errorType", "stackTrace"}` as the last
//!   line on stderr, exit 1
//!
//! ```rust,no_run
//! use faas_runtime_core::{HandlerFailure, InvocationContext};
//! use serde_json::{json, Value};
//!
//! async fn echo(event: Value, _ctx: InvocationContext) -> Result<Value, HandlerFailure> {
//!     Ok(json!({ "echo": event }))
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     faas_runtime_handler::run(echo).await
//! }
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};

use faas_runtime_core::context::ENV_FIELDS;
use faas_runtime_core::{FunctionMetadata, HandlerFailure, InvocationContext};

/// Handler returned a value
pub const EXIT_SUCCESS: u8 = 0;
/// Handler returned an error, written to stderr as error JSON
pub const EXIT_HANDLER_ERROR: u8 = 1;
/// The process was not started with an invocation context
pub const EXIT_NO_CONTEXT: u8 = 2;

/// Serve one invocation from stdin and the environment
///
/// Installs a stderr log subscriber so `tracing` output from the handler is
/// picked up by the runtime.
pub async fn run<F, Fut, R>(f: F) -> ExitCode
where
    F: FnOnce(serde_json::Value, InvocationContext) -> Fut,
    Fut: Future<Output = Result<R, HandlerFailure>>,
    R: Serialize,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .without_time()
        .try_init();

    let mut payload = Vec::new();
    if let Err(e) = io::stdin().read_to_end(&mut payload) {
        let _ = writeln!(io::stderr(), "failed to read payload from stdin: {e}");
        return ExitCode::from(EXIT_NO_CONTEXT);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = handle_once(
        Bytes::from(payload),
        |name| std::env::var(name).ok(),
        f,
        &mut stdout,
        &mut stderr,
    )
    .await;

    let written = io::stdout()
        .write_all(&stdout)
        .and_then(|()| io::stdout().flush())
        .and_then(|()| io::stderr().write_all(&stderr));
    match written {
        Ok(()) => ExitCode::from(code),
        Err(_) => ExitCode::from(EXIT_HANDLER_ERROR),
    }
}

/// Handle one invocation and return the process exit code
///
/// `lookup` stands in for the environment. The result is written to
/// `stdout`, an error JSON line to `stderr`.
pub async fn handle_once<L, F, Fut, R, O, E>(
    payload: Bytes,
    lookup: L,
    f: F,
    stdout: &mut O,
    stderr: &mut E,
) -> u8
where
    L: Fn(&str) -> Option<String>,
    F: FnOnce(serde_json::Value, InvocationContext) -> Fut,
    Fut: Future<Output = Result<R, HandlerFailure>>,
    R: Serialize,
    O: Write,
    E: Write,
{
    let context = match InvocationContext::from_lookup(&ENV_FIELDS, &lookup, payload) {
        Ok(context) => context.with_function(Arc::new(FunctionMetadata::from_lookup(&lookup))),
        Err(fault) => {
            let _ = writeln!(stderr, "not started by the runtime: {}", fault.reason);
            return EXIT_NO_CONTEXT;
        }
    };
    debug!(request_id = %context.request_id, "Handling invocation");

    let event = if context.payload.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&context.payload) {
            Ok(event) => event,
            Err(e) => {
                let failure = HandlerFailure::new(format!("payload is not valid JSON: {e}"))
                    .with_error_type("InvalidPayload");
                return write_failure(&failure, stderr);
            }
        }
    };

    match f(event, context).await {
        Ok(result) => match serde_json::to_writer(&mut *stdout, &result) {
            Ok(()) => {
                let _ = writeln!(stdout);
                EXIT_SUCCESS
            }
            Err(e) => {
                let failure = HandlerFailure::invalid_response(format!("response could not be serialized: {e}"));
                write_failure(&failure, stderr)
            }
        },
        Err(failure) => {
            warn!(error = %failure, "Handler returned an error");
            write_failure(&failure, stderr)
        }
    }
}

fn write_failure<E: Write>(failure: &HandlerFailure, stderr: &mut E) -> u8 {
    let mut line = failure.to_error_response().to_json_bytes();
    line.push(b'\n');
    let _ = stderr.write_all(&line);
    EXIT_HANDLER_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_runtime_core::context::env;
    use faas_runtime_core::ErrorResponse;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    fn environment() -> HashMap<&'static str, String> {
        [
            (env::REQUEST_ID, "req-1".to_string()),
            (env::DEADLINE_MS, "1900000000000".to_string()),
            (
                env::INVOKED_FUNCTION_ARN,
                "arn:aws:lambda:us-east-1:000000000000:function:greeter".to_string(),
            ),
            (env::TRACE_ID, "Root=1-abc".to_string()),
            (env::FUNCTION_NAME, "greeter".to_string()),
        ]
        .into_iter()
        .collect()
    }

    async fn handle<F, Fut>(payload: &'static str, vars: HashMap<&'static str, String>, f: F) -> (u8, String, String)
    where
        F: FnOnce(Value, InvocationContext) -> Fut,
        Fut: Future<Output = Result<Value, HandlerFailure>>,
    {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = handle_once(
            Bytes::from_static(payload.as_bytes()),
            |name| vars.get(name).cloned(),
            f,
            &mut stdout,
            &mut stderr,
        )
        .await;
        (
            code,
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_success_goes_to_stdout() {
        let (code, stdout, stderr) = handle(r#"{"name":"Ada"}"#, environment(), |event, ctx| async move {
            Ok::<_, HandlerFailure>(json!({
                "message": format!("Hello, {}!", event["name"].as_str().unwrap_or("?")),
                "requestId": ctx.request_id,
                "function": ctx.function.function_name,
            }))
        })
        .await;

        assert_eq!(code, EXIT_SUCCESS);
        assert!(stderr.is_empty());
        let body: Value = serde_json::from_str(&stdout).unwrap();
        assert_eq!(
            body,
            json!({"message": "Hello, Ada!", "requestId": "req-1", "function": "greeter"})
        );
    }

    #[tokio::test]
    async fn test_error_goes_to_stderr_as_json() {
        let (code, stdout, stderr) = handle("{}", environment(), |_event, _ctx| async move {
            Err::<Value, _>(HandlerFailure::new("Missing 'name' field in payload"))
        })
        .await;

        assert_eq!(code, EXIT_HANDLER_ERROR);
        assert!(stdout.is_empty());
        let body: ErrorResponse = serde_json::from_str(stderr.trim_end()).unwrap();
        assert_eq!(body.error_type, "ApplicationError");
        assert_eq!(body.error_message, "Missing 'name' field in payload");
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let (code, _, stderr) = handle("{not json", environment(), |_event, _ctx| async move {
            Ok::<_, HandlerFailure>(Value::Null)
        })
        .await;

        assert_eq!(code, EXIT_HANDLER_ERROR);
        let body: ErrorResponse = serde_json::from_str(stderr.trim_end()).unwrap();
        assert_eq!(body.error_type, "InvalidPayload");
    }

    #[tokio::test]
    async fn test_blank_payload_is_null() {
        let (code, stdout, _) = handle("", environment(), |event, _ctx| async move {
            Ok::<_, HandlerFailure>(json!({ "wasNull": event.is_null() }))
        })
        .await;

        assert_eq!(code, EXIT_SUCCESS);
        assert_eq!(stdout.trim_end(), r#"{"wasNull":true}"#);
    }

    #[tokio::test]
    async fn test_missing_context() {
        let mut vars = environment();
        vars.remove(env::DEADLINE_MS);
        let (code, stdout, stderr) = handle("{}", vars, |_event, _ctx| async move { Ok::<_, HandlerFailure>(Value::Null) }).await;

        assert_eq!(code, EXIT_NO_CONTEXT);
        assert!(stdout.is_empty());
        assert!(stderr.starts_with("not started by the runtime"));
    }
}
