//! Errors raised by function code

use thiserror::Error;

use crate::outcome::HandlerErrorKind;
use crate::reporter::{ErrorResponse, RawFailure};

/// An error returned by a handler
///
/// Handlers return this to report an application-level failure. The
/// runtime reports it through `postError` and keeps serving.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerFailure {
    pub error_type: Option<String>,
    pub message: String,
    pub stack_trace: Option<Vec<String>>,
    invalid_response: bool,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_type: None,
            message: message.into(),
            stack_trace: None,
            invalid_response: false,
        }
    }

    /// The handler produced output that cannot be sent as a response
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            invalid_response: true,
            ..Self::new(message)
        }
    }

    /// Wrap any error, using its type name as the error type
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let type_name = std::any::type_name::<E>();
        let short = type_name
            .split('<')
            .next()
            .and_then(|path| path.rsplit("::").next())
            .unwrap_or(type_name);

        let mut stack = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        let failure = Self::new(err.to_string()).with_error_type(short);
        if stack.is_empty() {
            failure
        } else {
            failure.with_stack_trace(stack)
        }
    }

    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }

    pub fn is_invalid_response(&self) -> bool {
        self.invalid_response
    }

    /// Hand the failure to the error reporter
    pub fn into_raw(self) -> RawFailure {
        if self.invalid_response {
            RawFailure::MalformedResponse {
                detail: self.message,
            }
        } else {
            RawFailure::HandlerReturned {
                error_type: self.error_type,
                message: self.message,
                stack_trace: self.stack_trace,
            }
        }
    }

    /// Wire form written by subprocess handlers
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error_message: self.message.clone(),
            error_type: self.error_type.clone().unwrap_or_else(|| {
                let kind = if self.invalid_response {
                    HandlerErrorKind::InvalidResponse
                } else {
                    HandlerErrorKind::ApplicationError
                };
                kind.as_str().to_string()
            }),
            stack_trace: self.stack_trace.clone(),
        }
    }
}

impl From<String> for HandlerFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A handler that reports `InvalidResponse` itself is classified as one
impl From<ErrorResponse> for HandlerFailure {
    fn from(response: ErrorResponse) -> Self {
        let invalid_response = response.error_type == HandlerErrorKind::InvalidResponse.as_str();
        Self {
            error_type: Some(response.error_type),
            message: response.error_message,
            stack_trace: response.stack_trace,
            invalid_response,
        }
    }
}
