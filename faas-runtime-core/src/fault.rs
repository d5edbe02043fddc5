//! Process-fatal runtime faults

use std::fmt;
use thiserror::Error;

/// Kinds of fault the loop cannot recover from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Connection-level failure talking to the Runtime API
    ApiUnreachable,
    /// The Runtime API answered a post with a non-2xx status
    ApiRejectedResponse,
    /// The Runtime API broke its contract (missing headers, bad values)
    ProtocolViolation,
    /// An in-process handler panicked; runtime state is no longer trusted
    HandlerPanicked,
    /// Uncaught fault inside the runtime itself
    Internal,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiUnreachable => "ApiUnreachable",
            Self::ApiRejectedResponse => "ApiRejectedResponse",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::HandlerPanicked => "HandlerPanicked",
            Self::Internal => "Internal",
        }
    }

    /// Error type used when a fault is still reported to the API
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ApiUnreachable => "Runtime.ApiUnreachable",
            Self::ApiRejectedResponse => "Runtime.ApiRejectedResponse",
            Self::ProtocolViolation => "Runtime.ProtocolViolation",
            Self::HandlerPanicked => "Runtime.HandlerPanicked",
            Self::Internal => "Runtime.InternalError",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault that forces the process to exit
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {reason}")]
pub struct RuntimeFault {
    pub kind: FaultKind,
    pub reason: String,
}

impl RuntimeFault {
    pub fn new(kind: FaultKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn api_unreachable(reason: impl Into<String>) -> Self {
        Self::new(FaultKind::ApiUnreachable, reason)
    }

    pub fn api_rejected(reason: impl Into<String>) -> Self {
        Self::new(FaultKind::ApiRejectedResponse, reason)
    }

    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::new(FaultKind::ProtocolViolation, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, reason)
    }

    /// Whether a best-effort error report to the API is still worth trying
    ///
    /// Only faults that leave the API connection intact qualify.
    pub fn is_reportable(&self) -> bool {
        matches!(self.kind, FaultKind::HandlerPanicked | FaultKind::Internal)
    }
}
