//! Invocation and initialization outcomes

use bytes::Bytes;
use std::fmt;

use crate::fault::RuntimeFault;

/// Invocation-scoped handler failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerErrorKind {
    ApplicationError,
    Timeout,
    Crash,
    InvalidResponse,
}

impl HandlerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationError => "ApplicationError",
            Self::Timeout => "Timeout",
            Self::Crash => "Crash",
            Self::InvalidResponse => "InvalidResponse",
        }
    }
}

impl fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler failure, reported through `postError`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    /// Reported `errorType`; defaults to the kind name
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<Vec<String>>,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, error_message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: kind.as_str().to_string(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success(Bytes),
    HandlerError(HandlerError),
    RuntimeFault(RuntimeFault),
}

impl InvocationOutcome {
    /// Whether the loop may continue after reporting this outcome
    pub fn permits_continue(&self) -> bool {
        !matches!(self, Self::RuntimeFault(_))
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "Success",
            Self::HandlerError(err) => err.kind.as_str(),
            Self::RuntimeFault(fault) => fault.kind.as_str(),
        }
    }
}

impl From<HandlerError> for InvocationOutcome {
    fn from(err: HandlerError) -> Self {
        Self::HandlerError(err)
    }
}

impl From<RuntimeFault> for InvocationOutcome {
    fn from(fault: RuntimeFault) -> Self {
        Self::RuntimeFault(fault)
    }
}

/// Initialization failure, reported once through `postInitError`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitError {
    pub error_type: String,
    pub error_message: String,
}

impl InitError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

/// Result of the one-time initialization phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializationResult {
    Ready,
    InitError(InitError),
}

impl InitializationResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl From<Result<(), InitError>> for InitializationResult {
    fn from(result: Result<(), InitError>) -> Self {
        match result {
            Ok(()) => Self::Ready,
            Err(err) => Self::InitError(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_defaults_type_to_kind() {
        let err = HandlerError::new(HandlerErrorKind::Timeout, "took too long");
        assert_eq!(err.error_type, "Timeout");

        let err = HandlerError::new(HandlerErrorKind::ApplicationError, "bad input")
            .with_error_type("ValidationError");
        assert_eq!(err.kind, HandlerErrorKind::ApplicationError);
        assert_eq!(err.error_type, "ValidationError");
    }

    #[test]
    fn test_only_faults_stop_the_loop() {
        assert!(InvocationOutcome::Success(Bytes::new()).permits_continue());
        assert!(InvocationOutcome::from(HandlerError::new(HandlerErrorKind::Crash, "boom"))
            .permits_continue());
        assert!(!InvocationOutcome::from(RuntimeFault::internal("x")).permits_continue());
    }

    #[test]
    fn test_init_result_from_result() {
        assert!(InitializationResult::from(Ok(())).is_ready());
        let result = InitializationResult::from(Err(InitError::new("Runtime.Init", "missing config")));
        assert_eq!(
            result,
            InitializationResult::InitError(InitError::new("Runtime.Init", "missing config"))
        );
    }
}
