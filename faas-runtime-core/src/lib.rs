//! Core types for the FaaS runtime
//!
//! This crate holds the data model shared by the Runtime API client, the
//! handler invokers and the runtime loop: the per-invocation context, the
//! three-way invocation outcome, and the error reporter that maps raw
//! failures onto the Runtime API's error schema.

pub mod context;
pub mod failure;
pub mod fault;
pub mod outcome;
pub mod reporter;

pub use context::{FunctionMetadata, InvocationContext, RuntimeEndpoint};
pub use failure::HandlerFailure;
pub use fault::{FaultKind, RuntimeFault};
pub use outcome::{HandlerError, HandlerErrorKind, InitError, InitializationResult, InvocationOutcome};
pub use reporter::{ErrorReporter, ErrorResponse, RawFailure};

/// Runtime API version prefix shared by every route
pub const API_VERSION: &str = "2018-06-01";
