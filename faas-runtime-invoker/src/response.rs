//! Response validation and deadline outcomes shared by the invokers

use bytes::Bytes;
use faas_runtime_core::{InvocationContext, InvocationOutcome, RawFailure};
use serde::de::IgnoredAny;
use std::time::Duration;

use crate::InvokerConfig;

/// Check handler output before it is posted as a response
///
/// Output must be JSON and within the size limit. Blank output stands for
/// a handler that returned nothing and is sent as `null`.
pub fn validate_response(output: Bytes, config: &InvokerConfig) -> InvocationOutcome {
    if output.len() > config.max_response_bytes {
        return config.reporter.classify(RawFailure::MalformedResponse {
            detail: format!(
                "response is {} bytes, limit is {} bytes",
                output.len(),
                config.max_response_bytes
            ),
        });
    }

    if output.iter().all(u8::is_ascii_whitespace) {
        return InvocationOutcome::Success(Bytes::from_static(b"null"));
    }

    match serde_json::from_slice::<IgnoredAny>(&output) {
        Ok(_) => InvocationOutcome::Success(output),
        Err(e) => config.reporter.classify(RawFailure::MalformedResponse {
            detail: format!("response is not valid JSON: {e}"),
        }),
    }
}

/// Outcome for a handler still running at the deadline
pub fn timeout_outcome(context: &InvocationContext, budget: Duration, config: &InvokerConfig) -> InvocationOutcome {
    config.reporter.classify(RawFailure::DeadlineExceeded {
        request_id: context.request_id.clone(),
        budget,
    })
}
