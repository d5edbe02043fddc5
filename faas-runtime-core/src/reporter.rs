//! Error classification and the Runtime API error schema
//!
//! Every failure the runtime observes passes through [`ErrorReporter::classify`],
//! which sorts it into the three-way outcome taxonomy:
//!
//! | Raw condition                          | Outcome                      |
//! |----------------------------------------|------------------------------|
//! | handler returned an error              | `HandlerError(ApplicationError)` |
//! | handler exceeded its deadline          | `HandlerError(Timeout)`      |
//! | isolated handler crashed               | `HandlerError(Crash)`        |
//! | handler output not a valid response    | `HandlerError(InvalidResponse)` |
//! | Runtime API connection lost            | `RuntimeFault(ApiUnreachable)` |
//! | Runtime API answered a post with non-2xx | `RuntimeFault(ApiRejectedResponse)` |
//! | in-process handler panicked            | `RuntimeFault(HandlerPanicked)` |
//! | fault inside the runtime itself        | `RuntimeFault(Internal)`     |
//!
//! The reporter also owns payload hygiene: Lambda surfaces `errorType`,
//! `errorMessage` and `stackTrace` verbatim, so they are forced to valid,
//! printable, bounded text before they are serialized.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::fault::{FaultKind, RuntimeFault};
use crate::outcome::{HandlerError, HandlerErrorKind, InitError, InvocationOutcome};

/// Default cap on reported message length, in characters
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4096;

/// Maximum number of stack trace lines kept in a report
const MAX_STACK_LINES: usize = 64;

/// Error body accepted by `/invocation/{id}/error` and `/init/error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_message: String,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
}

impl ErrorResponse {
    /// Serialize to the JSON body sent to the Runtime API
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"errorMessage":"error report could not be serialized","errorType":"Runtime.InternalError"}"#
                .to_vec()
        })
    }
}

/// A failure as observed, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// The handler itself reported an error
    HandlerReturned {
        error_type: Option<String>,
        message: String,
        stack_trace: Option<Vec<String>>,
    },
    /// The handler was still running at the deadline
    DeadlineExceeded { request_id: String, budget: Duration },
    /// The isolated handler process died or could not be started
    HandlerCrashed { detail: String },
    /// The handler finished but its output cannot be sent as a response
    MalformedResponse { detail: String },
    /// An in-process handler panicked
    HandlerPanicked { detail: String },
    /// Connection to the Runtime API failed
    ApiConnectionLost { detail: String },
    /// The Runtime API answered with an unexpected status
    ApiUnexpectedStatus { operation: String, status: u16 },
    /// The Runtime API response broke the protocol
    ApiProtocolViolation { detail: String },
    /// Anything else that went wrong inside the runtime
    RuntimeInternal { detail: String },
}

/// Maps raw failures to outcomes and outcomes to API error bodies
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    max_message_chars: usize,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_CHARS)
    }
}

impl ErrorReporter {
    pub fn new(max_message_chars: usize) -> Self {
        Self {
            max_message_chars: max_message_chars.max(16),
        }
    }

    /// Classify a raw failure into the outcome taxonomy
    pub fn classify(&self, failure: RawFailure) -> InvocationOutcome {
        match failure {
            RawFailure::HandlerReturned {
                error_type,
                message,
                stack_trace,
            } => {
                let kind = HandlerErrorKind::ApplicationError;
                let mut err = HandlerError::new(kind, self.sanitize_message(&message))
                    .with_error_type(sanitize_error_type(error_type.as_deref(), kind.as_str()));
                if let Some(lines) = stack_trace {
                    err = err.with_stack_trace(self.sanitize_stack(&lines));
                }
                err.into()
            }
            RawFailure::DeadlineExceeded { request_id, budget } => HandlerError::new(
                HandlerErrorKind::Timeout,
                self.sanitize_message(&format!(
                    "{request_id} Task timed out after {:.2} seconds",
                    budget.as_secs_f64()
                )),
            )
            .into(),
            RawFailure::HandlerCrashed { detail } => {
                HandlerError::new(HandlerErrorKind::Crash, self.sanitize_message(&detail)).into()
            }
            RawFailure::MalformedResponse { detail } => {
                HandlerError::new(HandlerErrorKind::InvalidResponse, self.sanitize_message(&detail))
                    .into()
            }
            RawFailure::HandlerPanicked { detail } => {
                RuntimeFault::new(FaultKind::HandlerPanicked, self.sanitize_message(&detail)).into()
            }
            RawFailure::ApiConnectionLost { detail } => {
                RuntimeFault::api_unreachable(self.sanitize_message(&detail)).into()
            }
            RawFailure::ApiUnexpectedStatus { operation, status } => {
                RuntimeFault::api_rejected(format!("{operation} returned HTTP {status}")).into()
            }
            RawFailure::ApiProtocolViolation { detail } => {
                RuntimeFault::protocol_violation(self.sanitize_message(&detail)).into()
            }
            RawFailure::RuntimeInternal { detail } => {
                RuntimeFault::internal(self.sanitize_message(&detail)).into()
            }
        }
    }

    /// Body for `postError`
    pub fn error_response(&self, err: &HandlerError) -> ErrorResponse {
        ErrorResponse {
            error_message: self.sanitize_message(&err.error_message),
            error_type: sanitize_error_type(Some(&err.error_type), err.kind.as_str()),
            stack_trace: err.stack_trace.as_deref().map(|lines| self.sanitize_stack(lines)),
        }
    }

    /// Body for a best-effort report of a fatal fault
    pub fn fault_response(&self, fault: &RuntimeFault) -> ErrorResponse {
        ErrorResponse {
            error_message: self.sanitize_message(&fault.reason),
            error_type: fault.kind.error_type().to_string(),
            stack_trace: None,
        }
    }

    /// Body for `postInitError`
    pub fn init_error_response(&self, err: &InitError) -> ErrorResponse {
        ErrorResponse {
            error_message: self.sanitize_message(&err.error_message),
            error_type: sanitize_error_type(Some(&err.error_type), "Runtime.InitError"),
            stack_trace: None,
        }
    }

    /// Make a message printable and bounded
    pub fn sanitize_message(&self, message: &str) -> String {
        sanitize_text(message, self.max_message_chars)
    }

    /// Lossily decode bytes that may not be UTF-8, then sanitize
    pub fn sanitize_bytes(&self, raw: &[u8]) -> String {
        self.sanitize_message(&String::from_utf8_lossy(raw))
    }

    fn sanitize_stack(&self, lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .take(MAX_STACK_LINES)
            .map(|line| sanitize_text(line, self.max_message_chars))
            .collect()
    }
}

fn sanitize_text(text: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_chars));
    for (count, c) in text.chars().enumerate() {
        if count == max_chars {
            out.push('…');
            break;
        }
        if c == '\t' || !c.is_control() {
            out.push(c);
        } else {
            out.push(' ');
        }
    }
    out
}

/// Restrict an error type to `[A-Za-z0-9._-]`, falling back when empty
fn sanitize_error_type(error_type: Option<&str>, fallback: &str) -> String {
    let cleaned: String = error_type
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(128)
        .collect();

    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}
