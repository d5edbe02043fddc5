//! faas-runtime - custom runtime for the Lambda Runtime API
//!
//! Polls the Runtime API named by `AWS_LAMBDA_RUNTIME_API` and runs the
//! executable named by `_HANDLER` once per invocation. Exit codes are listed
//! in [`faas_runtime::exit`].

use clap::Parser;
use std::process::ExitCode;
use tracing::info;

use faas_runtime::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    faas_runtime::init_tracing(&args.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %args.runtime_api,
        task_root = %args.task_root.display(),
        "Starting faas-runtime"
    );

    let termination = match faas_runtime::shutdown_signal() {
        Ok(shutdown) => faas_runtime::run_subprocess(&args, shutdown).await,
        Err(e) => faas_runtime::signal_setup_failed(&e),
    };

    info!(code = termination.code(), "Runtime stopped");
    termination.exit_code()
}
