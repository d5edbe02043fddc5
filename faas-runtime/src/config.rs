//! Runtime configuration
//!
//! Two layers, both read once at startup:
//!
//! - the Lambda environment contract (`AWS_LAMBDA_RUNTIME_API`,
//!   `LAMBDA_TASK_ROOT`, `_HANDLER`), parsed by clap into [`Args`]
//! - runtime tuning from an optional `faas-runtime.toml` and `FAAS_RUNTIME_*`
//!   environment variables, loaded into [`RuntimeSettings`]
//!
//! The result is frozen into a [`RuntimeConfig`] and handed to the loop.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use faas_runtime_client::ClientConfig;
use faas_runtime_core::reporter::DEFAULT_MAX_MESSAGE_CHARS;
use faas_runtime_core::{ErrorReporter, FunctionMetadata, InitError, RuntimeEndpoint};
use faas_runtime_invoker::{InvokerConfig, DEFAULT_MAX_RESPONSE_BYTES};

/// Tuning file looked up in the working directory when `--config` is not given
const DEFAULT_FILE: &str = "faas-runtime";

/// Prefix of tuning environment variables
const ENV_PREFIX: &str = "FAAS_RUNTIME";

#[derive(Parser, Debug, Clone)]
#[command(name = "faas-runtime")]
#[command(version, about = "Custom runtime for the Lambda Runtime API", long_about = None)]
pub struct Args {
    /// Runtime API endpoint (host:port)
    #[arg(long, env = "AWS_LAMBDA_RUNTIME_API", value_parser = RuntimeEndpoint::parse)]
    pub runtime_api: RuntimeEndpoint,

    /// Directory holding the function code
    #[arg(long, default_value = "/var/task", env = "LAMBDA_TASK_ROOT")]
    pub task_root: PathBuf,

    /// Handler executable, relative to the task root unless absolute
    #[arg(long, env = "_HANDLER")]
    pub handler: Option<String>,

    /// Tuning file (TOML)
    #[arg(long, env = "FAAS_RUNTIME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FAAS_RUNTIME_LOG_LEVEL")]
    pub log_level: String,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load runtime settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    /// Init error reported to the Runtime API
    pub fn to_init_error(&self) -> InitError {
        InitError::new("Runtime.InvalidConfig", self.to_string())
    }
}

/// Runtime tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_post_timeout_ms")]
    pub post_timeout_ms: u64,

    #[serde(default = "default_next_retry_attempts")]
    pub next_retry_attempts: u32,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    #[serde(default = "default_max_error_message_chars")]
    pub max_error_message_chars: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            post_timeout_ms: default_post_timeout_ms(),
            next_retry_attempts: default_next_retry_attempts(),
            max_response_bytes: default_max_response_bytes(),
            max_error_message_chars: default_max_error_message_chars(),
        }
    }
}

fn default_post_timeout_ms() -> u64 {
    2_000
}

fn default_next_retry_attempts() -> u32 {
    3
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn default_max_error_message_chars() -> usize {
    DEFAULT_MAX_MESSAGE_CHARS
}

impl RuntimeSettings {
    /// Load tuning from `file` (or `faas-runtime.toml` if present) and the process environment
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(file, None)
    }

    /// Same as [`load`](Self::load), reading variables from `env` instead of the process
    pub fn load_from(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_FILE).required(false),
        };

        let settings: Self = config::Config::builder()
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.post_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "post_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "max_response_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_error_message_chars == 0 {
            return Err(ConfigError::Invalid {
                key: "max_error_message_chars",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            post_timeout: Duration::from_millis(self.post_timeout_ms),
            next_retry_attempts: self.next_retry_attempts,
        }
    }

    pub fn reporter(&self) -> ErrorReporter {
        ErrorReporter::new(self.max_error_message_chars)
    }

    pub fn invoker_config(&self) -> InvokerConfig {
        InvokerConfig {
            max_response_bytes: self.max_response_bytes,
            reporter: self.reporter(),
        }
    }
}

/// Immutable process-wide configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub endpoint: RuntimeEndpoint,
    pub task_root: PathBuf,
    pub handler: Option<String>,
    pub function: Arc<FunctionMetadata>,
    pub settings: RuntimeSettings,
}

impl RuntimeConfig {
    pub fn new(args: &Args, function: FunctionMetadata, settings: RuntimeSettings) -> Self {
        Self {
            endpoint: args.runtime_api.clone(),
            task_root: args.task_root.clone(),
            handler: args.handler.clone(),
            function: Arc::new(function),
            settings,
        }
    }
}
