//! The invocation loop
//!
//! ```text
//! Initializing -> Ready -> Polling -> Invoking -> Reporting -> Polling ...
//!       |                     |                      |
//!       +---------------------+----------------------+--> Terminating
//! ```
//!
//! Invocations are processed one at a time: `next` is not called again until
//! the report for the previous invocation has returned. Polling is the only
//! state that may wait indefinitely, and the only one where a shutdown
//! request is observed.

use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use faas_runtime_client::RuntimeApiClient;
use faas_runtime_core::{
    ErrorReporter, InitError, InitializationResult, InvocationContext, InvocationOutcome,
    RuntimeFault,
};
use faas_runtime_invoker::HandlerInvoker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Ready,
    Polling,
    Invoking,
    Reporting,
    Terminating,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Polling => "Polling",
            Self::Invoking => "Invoking",
            Self::Reporting => "Reporting",
            Self::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Shutdown was requested while polling
    Shutdown,
    /// Initialization failed and was reported through `postInitError`
    InitFailed(InitError),
    /// A fatal fault ended the loop
    Fault(RuntimeFault),
}

/// Drives invocations from a [`RuntimeApiClient`] through a [`HandlerInvoker`]
pub struct RuntimeLoop<C, I> {
    client: C,
    invoker: I,
    reporter: ErrorReporter,
    state: LoopState,
    completed: u64,
}

impl<C, I> RuntimeLoop<C, I>
where
    C: RuntimeApiClient,
    I: HandlerInvoker,
{
    pub fn new(client: C, invoker: I, reporter: ErrorReporter) -> Self {
        Self {
            client,
            invoker,
            reporter,
            state: LoopState::Initializing,
            completed: 0,
        }
    }

    /// Run until `shutdown` resolves at a poll or a fatal condition occurs
    pub async fn run<S>(mut self, shutdown: S) -> Termination
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if let Err(termination) = self.initialize().await {
            return termination;
        }

        loop {
            self.enter(LoopState::Polling);
            let next = tokio::select! {
                biased;
                () = &mut shutdown => None,
                next = self.client.next_invocation() => Some(next),
            };

            let context = match next {
                None => {
                    info!(invocations = self.completed, "Shutdown requested, stopping");
                    self.enter(LoopState::Terminating);
                    return Termination::Shutdown;
                }
                Some(Err(fault)) => return self.terminate(fault),
                Some(Ok(context)) => context,
            };

            if let Err(fault) = self.process(&context).await {
                return self.terminate(fault);
            }
            self.completed += 1;
        }
    }

    async fn initialize(&mut self) -> Result<(), Termination> {
        self.enter(LoopState::Initializing);

        match self.invoker.init().await {
            InitializationResult::Ready => {
                self.enter(LoopState::Ready);
                info!("Runtime initialized");
                Ok(())
            }
            InitializationResult::InitError(err) => {
                error!(
                    error_type = %err.error_type,
                    error = %err.error_message,
                    "Initialization failed"
                );
                let body = self.reporter.init_error_response(&err);
                let reported = self.client.post_init_error(&body).await;
                self.enter(LoopState::Terminating);

                Err(match reported {
                    Ok(()) => Termination::InitFailed(err),
                    Err(fault) => {
                        error!(fault = %fault, "Failed to report initialization error");
                        Termination::Fault(fault)
                    }
                })
            }
        }
    }

    async fn process(&mut self, context: &InvocationContext) -> Result<(), RuntimeFault> {
        let request_id = context.request_id.as_str();
        self.enter(LoopState::Invoking);
        debug!(
            request_id = %request_id,
            payload_bytes = context.payload.len(),
            remaining_ms = context.remaining_time().as_millis(),
            "Invocation received"
        );

        let started = Instant::now();
        let outcome = self.invoker.invoke(context.payload.clone(), context).await;
        let duration_ms = started.elapsed().as_millis();

        self.enter(LoopState::Reporting);
        match outcome {
            InvocationOutcome::Success(body) => {
                self.client.post_response(request_id, body).await?;
                info!(request_id = %request_id, duration_ms, "Invocation succeeded");
            }
            InvocationOutcome::HandlerError(err) => {
                warn!(
                    request_id = %request_id,
                    kind = %err.kind,
                    error_type = %err.error_type,
                    duration_ms,
                    "Invocation failed"
                );
                let body = self.reporter.error_response(&err);
                self.client.post_error(request_id, &body).await?;
            }
            InvocationOutcome::RuntimeFault(fault) => {
                if fault.is_reportable() {
                    let body = self.reporter.fault_response(&fault);
                    if let Err(report_err) = self.client.post_error(request_id, &body).await {
                        warn!(request_id = %request_id, error = %report_err, "Could not report fault");
                    }
                }
                return Err(fault);
            }
        }
        Ok(())
    }

    fn terminate(&mut self, fault: RuntimeFault) -> Termination {
        error!(
            kind = %fault.kind,
            reason = %fault.reason,
            invocations = self.completed,
            "Runtime fault, stopping"
        );
        self.enter(LoopState::Terminating);
        Termination::Fault(fault)
    }

    fn enter(&mut self, state: LoopState) {
        debug!(from = %self.state, to = %state, "Loop state");
        self.state = state;
    }
}
