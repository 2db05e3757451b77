//! P2P signaling simulator
//!
//! This crate provides a command-line driver for:
//! - The app side (interactive menu or automated flow)
//! - The device side (interactive console)
//! - A scripted end-to-end demo of both sides
//!
//! Both sides share one in-process broker. The session service is either
//! in-process too or a real HTTP deployment.

pub mod cli;
pub mod config;
pub mod console;
pub mod output;
pub mod runtime;

mod proptests;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

use p2ps_core::{ApiError, EndpointError};

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 3: Timeout - the peer did not answer in time
/// - 4: Connection failed - transport, service, or session did not connect
/// - 5: Invalid input - bad arguments or configuration
/// - 8: Precondition failed - operation not valid in the session's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Operation timed out (exit code 3)
    Timeout = 3,
    /// Connection failed (exit code 4)
    ConnectionFailed = 4,
    /// Invalid input provided (exit code 5)
    InvalidInput = 5,
    /// Precondition failed (exit code 8)
    PreconditionFailed = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::PreconditionFailed => "PRECONDITION_FAILED",
        }
    }

    /// Map an endpoint failure to the exit code scripts see.
    pub fn from_error(err: &EndpointError) -> Self {
        match err {
            EndpointError::Timeout(_) => ExitCode::Timeout,
            EndpointError::Precondition(_) => ExitCode::PreconditionFailed,
            EndpointError::Transport(_) | EndpointError::NotConnected(_) => ExitCode::ConnectionFailed,
            EndpointError::Api(ApiError::Http(_) | ApiError::Status { .. }) => ExitCode::ConnectionFailed,
            EndpointError::Topic(_) => ExitCode::InvalidInput,
            _ => ExitCode::GeneralError,
        }
    }
}
