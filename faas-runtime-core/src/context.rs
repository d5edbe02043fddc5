//! Per-invocation context
//!
//! An [`InvocationContext`] is built fresh from every `next` response and is
//! owned by a single iteration of the runtime loop. The same fields travel to
//! subprocess handlers through environment variables, so parsing is written
//! once against a lookup function and two name tables.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::fault::RuntimeFault;
use crate::API_VERSION;

/// Runtime API response headers
pub mod headers {
    pub const REQUEST_ID: &str = "Lambda-Runtime-Aws-Request-Id";
    pub const DEADLINE_MS: &str = "Lambda-Runtime-Deadline-Ms";
    pub const INVOKED_FUNCTION_ARN: &str = "Lambda-Runtime-Invoked-Function-Arn";
    pub const TRACE_ID: &str = "Lambda-Runtime-Trace-Id";
    pub const CLIENT_CONTEXT: &str = "Lambda-Runtime-Client-Context";
    pub const COGNITO_IDENTITY: &str = "Lambda-Runtime-Cognito-Identity";
    pub const FUNCTION_ERROR_TYPE: &str = "Lambda-Runtime-Function-Error-Type";
}

/// Environment variables handed to subprocess handlers
pub mod env {
    pub const REQUEST_ID: &str = "LAMBDA_RUNTIME_AWS_REQUEST_ID";
    pub const DEADLINE_MS: &str = "LAMBDA_RUNTIME_DEADLINE_MS";
    pub const INVOKED_FUNCTION_ARN: &str = "LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN";
    pub const TRACE_ID: &str = "_X_AMZN_TRACE_ID";
    pub const CLIENT_CONTEXT: &str = "LAMBDA_RUNTIME_CLIENT_CONTEXT";
    pub const COGNITO_IDENTITY: &str = "LAMBDA_RUNTIME_COGNITO_IDENTITY";

    pub const FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
    pub const FUNCTION_VERSION: &str = "AWS_LAMBDA_FUNCTION_VERSION";
    pub const FUNCTION_MEMORY_SIZE: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
    pub const LOG_GROUP_NAME: &str = "AWS_LAMBDA_LOG_GROUP_NAME";
    pub const LOG_STREAM_NAME: &str = "AWS_LAMBDA_LOG_STREAM_NAME";
}

/// Names under which the context fields can be looked up
#[derive(Debug, Clone, Copy)]
pub struct FieldNames {
    pub request_id: &'static str,
    pub deadline_ms: &'static str,
    pub invoked_function_arn: &'static str,
    pub trace_id: &'static str,
    pub client_context: &'static str,
    pub cognito_identity: &'static str,
}

/// Field names as Runtime API headers
pub const HEADER_FIELDS: FieldNames = FieldNames {
    request_id: headers::REQUEST_ID,
    deadline_ms: headers::DEADLINE_MS,
    invoked_function_arn: headers::INVOKED_FUNCTION_ARN,
    trace_id: headers::TRACE_ID,
    client_context: headers::CLIENT_CONTEXT,
    cognito_identity: headers::COGNITO_IDENTITY,
};

/// Field names as subprocess environment variables
pub const ENV_FIELDS: FieldNames = FieldNames {
    request_id: env::REQUEST_ID,
    deadline_ms: env::DEADLINE_MS,
    invoked_function_arn: env::INVOKED_FUNCTION_ARN,
    trace_id: env::TRACE_ID,
    client_context: env::CLIENT_CONTEXT,
    cognito_identity: env::COGNITO_IDENTITY,
};

/// Runtime API endpoint (`host:port`), fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEndpoint(String);

impl RuntimeEndpoint {
    /// Validate a `host:port` string
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("runtime API endpoint is empty".to_string());
        }
        if value.contains("://") || value.contains('/') {
            return Err(format!("runtime API endpoint must be host:port, got '{value}'"));
        }

        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("runtime API endpoint '{value}' has no port"))?;
        if host.is_empty() {
            return Err(format!("runtime API endpoint '{value}' has no host"));
        }
        port.parse::<u16>()
            .map_err(|_| format!("runtime API endpoint '{value}' has an invalid port"))?;

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base URL for versioned Runtime API routes
    pub fn base_url(&self) -> String {
        format!("http://{}/{}", self.0, API_VERSION)
    }
}

impl fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide function metadata taken from the Lambda environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub function_name: String,
    pub function_version: String,
    pub memory_size_mb: u32,
    pub log_group_name: String,
    pub log_stream_name: String,
}

impl FunctionMetadata {
    /// Read metadata through a lookup function (usually `std::env::var`)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            function_name: lookup(env::FUNCTION_NAME).unwrap_or_default(),
            function_version: lookup(env::FUNCTION_VERSION)
                .unwrap_or_else(|| "$LATEST".to_string()),
            memory_size_mb: lookup(env::FUNCTION_MEMORY_SIZE)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(128),
            log_group_name: lookup(env::LOG_GROUP_NAME).unwrap_or_default(),
            log_stream_name: lookup(env::LOG_STREAM_NAME).unwrap_or_default(),
        }
    }
}

/// Immutable data for one invocation
#[derive(Clone)]
pub struct InvocationContext {
    pub request_id: String,
    /// Absolute time the function must finish by, in epoch milliseconds
    pub deadline_ms: i64,
    pub invoked_function_arn: String,
    /// Forwarded as-is, never parsed
    pub trace_id: String,
    /// Raw JSON, forwarded as-is
    pub client_context: Option<String>,
    /// Raw JSON, forwarded as-is
    pub cognito_identity: Option<String>,
    pub payload: Bytes,
    pub function: Arc<FunctionMetadata>,
}

impl InvocationContext {
    /// Build a context from named fields
    ///
    /// Request ID, deadline and function ARN are required; a missing or
    /// unparseable value is a protocol violation. The trace ID is forwarded
    /// when present and left empty otherwise.
    pub fn from_lookup<F>(names: &FieldNames, lookup: F, payload: Bytes) -> Result<Self, RuntimeFault>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String, RuntimeFault> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RuntimeFault::protocol_violation(format!("missing {name}")))
        };

        let request_id = required(names.request_id)?;
        let deadline_raw = required(names.deadline_ms)?;
        let deadline_ms = deadline_raw.parse::<i64>().map_err(|_| {
            RuntimeFault::protocol_violation(format!(
                "{} is not an integer: '{deadline_raw}'",
                names.deadline_ms
            ))
        })?;
        let invoked_function_arn = required(names.invoked_function_arn)?;

        let optional = |name: &str| lookup(name).filter(|v| !v.is_empty());

        Ok(Self {
            request_id,
            deadline_ms,
            invoked_function_arn,
            trace_id: optional(names.trace_id).unwrap_or_default(),
            client_context: optional(names.client_context),
            cognito_identity: optional(names.cognito_identity),
            payload,
            function: Arc::default(),
        })
    }

    /// Attach process-wide function metadata
    #[must_use]
    pub fn with_function(mut self, function: Arc<FunctionMetadata>) -> Self {
        self.function = function;
        self
    }

    /// Fields to export to a subprocess, keyed by environment variable name
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_FIELDS.request_id, self.request_id.clone()),
            (ENV_FIELDS.deadline_ms, self.deadline_ms.to_string()),
            (ENV_FIELDS.invoked_function_arn, self.invoked_function_arn.clone()),
            (ENV_FIELDS.trace_id, self.trace_id.clone()),
        ];
        if let Some(client_context) = &self.client_context {
            vars.push((ENV_FIELDS.client_context, client_context.clone()));
        }
        if let Some(cognito_identity) = &self.cognito_identity {
            vars.push((ENV_FIELDS.cognito_identity, cognito_identity.clone()));
        }
        vars
    }

    /// Time left until the deadline, measured against `now_ms`
    pub fn remaining_time_at(&self, now_ms: i64) -> Duration {
        let remaining = self.deadline_ms.saturating_sub(now_ms).max(0);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }

    /// Time left until the deadline
    pub fn remaining_time(&self) -> Duration {
        self.remaining_time_at(now_millis())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_time().is_zero()
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("request_id", &self.request_id)
            .field("deadline_ms", &self.deadline_ms)
            .field("invoked_function_arn", &self.invoked_function_arn)
            .field("trace_id", &self.trace_id)
            .field("client_context", &self.client_context.is_some())
            .field("cognito_identity", &self.cognito_identity.is_some())
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
