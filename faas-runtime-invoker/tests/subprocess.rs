//! Integration tests for the subprocess invoker
//!
//! Each test runs a small shell script as the function binary.

#![cfg(unix)]

use bytes::Bytes;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use faas_runtime_core::context::{now_millis, HEADER_FIELDS};
use faas_runtime_core::context::headers;
use faas_runtime_core::{HandlerErrorKind, InitializationResult, InvocationContext, InvocationOutcome};
use faas_runtime_invoker::{HandlerInvoker, InvokerConfig, SubprocessInvoker};

const SCRIPTS: &[(&str, &str)] = &[
    ("ok", "cat > /dev/null\necho '{\"ok\":true}'\n"),
    ("echo", "cat\n"),
    (
        "context",
        "cat > /dev/null\nprintf '{\"id\":\"%s\",\"trace\":\"%s\",\"cwd\":\"%s\"}' \"$LAMBDA_RUNTIME_AWS_REQUEST_ID\" \"$_X_AMZN_TRACE_ID\" \"$(pwd)\"\n",
    ),
    (
        "app_error",
        "cat > /dev/null\necho 'validating input' >&2\necho '{\"errorMessage\":\"bad input\",\"errorType\":\"ValidationError\",\"stackTrace\":[\"at validate\"]}' >&2\nexit 1\n",
    ),
    ("exit_code", "echo 'thread main panicked' >&2\nexit 101\n"),
    ("killed", "kill -9 $$\n"),
    ("slow", "sleep 30\necho '{}'\n"),
    ("not_json", "echo 'hello there'\n"),
    ("silent", "cat > /dev/null\n"),
    (
        "sdk_invalid_response",
        "cat > /dev/null\necho '{\"errorMessage\":\"response could not be serialized\",\"errorType\":\"InvalidResponse\"}' >&2\nexit 1\n",
    ),
    ("leaves_child", "cat > /dev/null\nsleep 5 &\necho '{\"ok\":true}'\nexit 0\n"),
    ("floods_stdout", "exec yes '\"xxxxxxxxxxxxxxxx\"'\n"),
    ("floods_stderr", "cat > /dev/null\nhead -c 4000000 /dev/zero | tr '\\0' 'e' >&2\necho '{}'\n"),
];

/// Write every script once, before any test spawns a process
fn task_root() -> &'static Path {
    static ROOT: OnceLock<tempfile::TempDir> = OnceLock::new();
    ROOT.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in SCRIPTS {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(dir.path().join("not_executable"), "#!/bin/sh\n").unwrap();
        dir
    })
    .path()
}

fn invoker(handler: &str) -> SubprocessInvoker {
    SubprocessInvoker::new(task_root(), Some(handler.to_string()), InvokerConfig::default())
}

fn context(request_id: &str, budget: Duration) -> InvocationContext {
    let deadline = now_millis() + i64::try_from(budget.as_millis()).unwrap();
    let map: HashMap<&str, String> = [
        (headers::REQUEST_ID, request_id.to_string()),
        (headers::DEADLINE_MS, deadline.to_string()),
        (headers::INVOKED_FUNCTION_ARN, "arn:aws:lambda:us-east-1:000000000000:function:f".to_string()),
        (headers::TRACE_ID, "Root=1-5759e988-bd862e3fe1be46a994272793".to_string()),
    ]
    .into_iter()
    .collect();

    InvocationContext::from_lookup(&HEADER_FIELDS, |n| map.get(n).cloned(), Bytes::new()).unwrap()
}

fn handler_error(outcome: InvocationOutcome) -> faas_runtime_core::HandlerError {
    match outcome {
        InvocationOutcome::HandlerError(err) => err,
        other => panic!("expected handler error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_success_returns_stdout() {
    let outcome = invoker("ok")
        .invoke(Bytes::from_static(b"{}"), &context("req-ok", Duration::from_secs(10)))
        .await;
    assert_eq!(outcome, InvocationOutcome::Success(Bytes::from_static(b"{\"ok\":true}\n")));
}

#[tokio::test]
async fn test_payload_goes_to_stdin() {
    let payload = Bytes::from_static(br#"{"name":"world"}"#);
    let outcome = invoker("echo")
        .invoke(payload.clone(), &context("req-echo", Duration::from_secs(10)))
        .await;
    assert_eq!(outcome, InvocationOutcome::Success(payload));
}

#[tokio::test]
async fn test_context_goes_to_environment() {
    let outcome = invoker("context")
        .invoke(Bytes::from_static(b"{}"), &context("req-ctx", Duration::from_secs(10)))
        .await;
    let InvocationOutcome::Success(body) = outcome else {
        panic!("expected success, got {outcome:?}");
    };

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["id"], "req-ctx");
    assert_eq!(json["trace"], "Root=1-5759e988-bd862e3fe1be46a994272793");
    let cwd = PathBuf::from(json["cwd"].as_str().unwrap());
    assert_eq!(cwd.canonicalize().unwrap(), task_root().canonicalize().unwrap());
}

#[tokio::test]
async fn test_structured_error_is_application_error() {
    let err = handler_error(
        invoker("app_error")
            .invoke(Bytes::from_static(b"{}"), &context("req-err", Duration::from_secs(10)))
            .await,
    );
    assert_eq!(err.kind, HandlerErrorKind::ApplicationError);
    assert_eq!(err.error_type, "ValidationError");
    assert_eq!(err.error_message, "bad input");
    assert_eq!(err.stack_trace, Some(vec!["at validate".to_string()]));
}

#[tokio::test]
async fn test_bare_exit_code_is_crash() {
    let err = handler_error(
        invoker("exit_code")
            .invoke(Bytes::new(), &context("req-exit", Duration::from_secs(10)))
            .await,
    );
    assert_eq!(err.kind, HandlerErrorKind::Crash);
    assert_eq!(err.error_type, "Crash");
    assert_eq!(
        err.error_message,
        "handler exited with status 101: thread main panicked"
    );
}

#[tokio::test]
async fn test_signal_is_crash() {
    let err = handler_error(
        invoker("killed")
            .invoke(Bytes::new(), &context("req-kill", Duration::from_secs(10)))
            .await,
    );
    assert_eq!(err.kind, HandlerErrorKind::Crash);
    assert_eq!(err.error_message, "handler terminated by signal 9");
}

#[tokio::test]
async fn test_deadline_kills_slow_handler() {
    let started = Instant::now();
    let err = handler_error(
        invoker("slow")
            .invoke(Bytes::new(), &context("req-slow", Duration::from_millis(300)))
            .await,
    );

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.kind, HandlerErrorKind::Timeout);
    assert!(err.error_message.starts_with("req-slow Task timed out after"));
}

#[tokio::test]
async fn test_non_json_output_is_invalid_response() {
    let err = handler_error(
        invoker("not_json")
            .invoke(Bytes::new(), &context("req-bad", Duration::from_secs(10)))
            .await,
    );
    assert_eq!(err.kind, HandlerErrorKind::InvalidResponse);
}

#[tokio::test]
async fn test_silent_handler_returns_null() {
    let outcome = invoker("silent")
        .invoke(Bytes::from_static(b"{}"), &context("req-null", Duration::from_secs(10)))
        .await;
    assert_eq!(outcome, InvocationOutcome::Success(Bytes::from_static(b"null")));
}

#[tokio::test]
async fn test_repeated_runs_classify_the_same() {
    let first = handler_error(
        invoker("exit_code")
            .invoke(Bytes::new(), &context("req-same", Duration::from_secs(10)))
            .await,
    );
    let second = handler_error(
        invoker("exit_code")
            .invoke(Bytes::new(), &context("req-same", Duration::from_secs(10)))
            .await,
    );
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_init_checks_handler() {
    assert_eq!(invoker("ok").init().await, InitializationResult::Ready);

    let InitializationResult::InitError(err) = invoker("missing").init().await else {
        panic!("expected init error");
    };
    assert_eq!(err.error_type, "Runtime.HandlerNotFound");

    let InitializationResult::InitError(err) = invoker("not_executable").init().await else {
        panic!("expected init error");
    };
    assert!(err.error_message.contains("not an executable file"));
}

#[tokio::test]
async fn test_reported_invalid_response_keeps_its_kind() {
    let err = handler_error(
        invoker("sdk_invalid_response")
            .invoke(Bytes::from_static(b"{}"), &context("req-sdk", Duration::from_secs(10)))
            .await,
    );
    assert_eq!(err.kind, HandlerErrorKind::InvalidResponse);
    assert_eq!(err.error_type, "InvalidResponse");
    assert_eq!(err.error_message, "response could not be serialized");
}

#[tokio::test]
async fn test_background_child_does_not_delay_completion() {
    let started = Instant::now();
    let outcome = invoker("leaves_child")
        .invoke(Bytes::from_static(b"{}"), &context("req-bg", Duration::from_secs(3)))
        .await;

    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(outcome, InvocationOutcome::Success(Bytes::from_static(b"{\"ok\":true}\n")));
}

#[tokio::test]
async fn test_runaway_stdout_is_cut_off_at_the_limit() {
    let config = InvokerConfig {
        max_response_bytes: 64 * 1024,
        ..InvokerConfig::default()
    };
    let invoker = SubprocessInvoker::new(task_root(), Some("floods_stdout".to_string()), config);

    let started = Instant::now();
    let err = handler_error(
        invoker
            .invoke(Bytes::new(), &context("req-flood", Duration::from_secs(10)))
            .await,
    );

    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert_eq!(err.kind, HandlerErrorKind::InvalidResponse);
    assert!(err.error_message.contains("65536 bytes"), "{}", err.error_message);
}

#[tokio::test]
async fn test_huge_stderr_line_does_not_break_response() {
    let outcome = invoker("floods_stderr")
        .invoke(Bytes::from_static(b"{}"), &context("req-noisy", Duration::from_secs(10)))
        .await;
    assert_eq!(outcome, InvocationOutcome::Success(Bytes::from_static(b"{}\n")));
}
