//! Process exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0    | graceful shutdown on SIGTERM / SIGINT |
//! | 2    | invalid command line or environment (reported by clap) |
//! | 10   | initialization failed and was reported |
//! | 20   | Runtime API unreachable |
//! | 21   | Runtime API rejected a post |
//! | 22   | Runtime API protocol violation |
//! | 23   | in-process handler panicked |
//! | 24   | internal runtime fault |
//!
//! The hosting platform uses these to decide whether the environment is
//! recoverable, so they never change meaning.

use std::process::ExitCode;

use faas_runtime_core::FaultKind;

use crate::runtime_loop::Termination;

pub const GRACEFUL: u8 = 0;
pub const INIT_FAILED: u8 = 10;
pub const API_UNREACHABLE: u8 = 20;
pub const API_REJECTED: u8 = 21;
pub const PROTOCOL_VIOLATION: u8 = 22;
pub const HANDLER_PANICKED: u8 = 23;
pub const INTERNAL: u8 = 24;

pub fn fault_code(kind: FaultKind) -> u8 {
    match kind {
        FaultKind::ApiUnreachable => API_UNREACHABLE,
        FaultKind::ApiRejectedResponse => API_REJECTED,
        FaultKind::ProtocolViolation => PROTOCOL_VIOLATION,
        FaultKind::HandlerPanicked => HANDLER_PANICKED,
        FaultKind::Internal => INTERNAL,
    }
}

impl Termination {
    pub fn code(&self) -> u8 {
        match self {
            Self::Shutdown => GRACEFUL,
            Self::InitFailed(_) => INIT_FAILED,
            Self::Fault(fault) => fault_code(fault.kind),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}
