//! FaaS runtime for the Lambda Runtime API
//!
//! Wires the Runtime API client, a handler invoker and the invocation loop
//! together. The `faas-runtime` binary runs the function as a subprocess per
//! invocation; function binaries that embed the runtime use
//! [`run_with_handler`] to run a [`Handler`] in process instead.

pub mod config;
pub mod exit;
pub mod runtime_loop;

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faas_runtime_client::HttpRuntimeApiClient;
use faas_runtime_core::{
    FunctionMetadata, InitError, InitializationResult, InvocationContext, InvocationOutcome,
    RuntimeFault,
};
use faas_runtime_invoker::{Handler, HandlerInvoker, InProcessInvoker, SubprocessInvoker};

pub use crate::config::{Args, ConfigError, RuntimeConfig, RuntimeSettings};
pub use crate::runtime_loop::{LoopState, RuntimeLoop, Termination};

/// Install the stderr log subscriber
///
/// `RUST_LOG` wins over `log_level` when set. Handler output forwarded by the
/// subprocess invoker is logged under the `handler` target.
pub fn init_tracing(log_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("faas_runtime={log_level},handler=info").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Resolves on the first SIGTERM or SIGINT
///
/// The listeners are registered when this is called, so a signal that
/// arrives before the future is first polled is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!(signal = "SIGTERM", "Shutdown signal received"),
            _ = interrupt.recv() => tracing::info!(signal = "SIGINT", "Shutdown signal received"),
        }
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Run the function named by `_HANDLER` as a subprocess per invocation
pub async fn run_subprocess<S>(args: &Args, shutdown: S) -> Termination
where
    S: Future<Output = ()>,
{
    launch(
        args,
        |config| {
            SubprocessInvoker::new(
                config.task_root.clone(),
                config.handler.clone(),
                config.settings.invoker_config(),
            )
        },
        shutdown,
    )
    .await
}

/// Termination for a runtime whose signal handlers could not be installed
pub fn signal_setup_failed(e: &std::io::Error) -> Termination {
    error!(error = %e, "Failed to install signal handlers");
    Termination::Fault(RuntimeFault::internal(format!(
        "failed to install signal handlers: {e}"
    )))
}

/// Run `handler` in this process until shutdown or a fatal condition
///
/// Reads the same command line and environment as the `faas-runtime`
/// binary and returns its exit code.
pub async fn run_with_handler<H: Handler>(handler: H) -> ExitCode {
    let args = <Args as clap::Parser>::parse();
    init_tracing(&args.log_level);

    let shutdown = match shutdown_signal() {
        Ok(shutdown) => shutdown,
        Err(e) => return signal_setup_failed(&e).exit_code(),
    };

    launch(
        &args,
        |config| InProcessInvoker::new(handler, config.settings.invoker_config()),
        shutdown,
    )
    .await
    .exit_code()
}

async fn launch<I, B, S>(args: &Args, build: B, shutdown: S) -> Termination
where
    I: HandlerInvoker,
    B: FnOnce(&RuntimeConfig) -> I,
    S: Future<Output = ()>,
{
    let function = FunctionMetadata::from_lookup(|name| std::env::var(name).ok());
    let settings = RuntimeSettings::load(args.config.as_deref());

    // Tuning errors are reported through the API, so the client is built first
    let client_config = settings
        .as_ref()
        .map(RuntimeSettings::client_config)
        .unwrap_or_default();
    let client = match HttpRuntimeApiClient::new(&args.runtime_api, client_config) {
        Ok(client) => client,
        Err(fault) => {
            error!(fault = %fault, "Failed to create Runtime API client");
            return Termination::Fault(fault);
        }
    };

    match settings {
        Ok(settings) => {
            let config = RuntimeConfig::new(args, function, settings);
            let client = client.with_function(config.function.clone());
            let invoker = build(&config);
            RuntimeLoop::new(client, invoker, config.settings.reporter())
                .run(shutdown)
                .await
        }
        Err(err) => {
            let client = client.with_function(Arc::new(function));
            let reporter = RuntimeSettings::default().reporter();
            RuntimeLoop::new(client, InvalidConfig(err.to_init_error()), reporter)
                .run(shutdown)
                .await
        }
    }
}

/// Invoker that fails initialization with a configuration error
struct InvalidConfig(InitError);

#[async_trait]
impl HandlerInvoker for InvalidConfig {
    async fn init(&self) -> InitializationResult {
        InitializationResult::InitError(self.0.clone())
    }

    async fn invoke(&self, _input: Bytes, _context: &InvocationContext) -> InvocationOutcome {
        RuntimeFault::internal("runtime is not configured").into()
    }
}
