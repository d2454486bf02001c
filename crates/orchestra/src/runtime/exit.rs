//! Exit information of processes and steps

use std::fmt;
use std::process::ExitStatus;

/// Exit code reported for a group of processes where at least one failed
pub const AGGREGATE_FAILURE_CODE: i32 = 255;

/// Outcome of a process or step.
///
/// A stop requested through the orchestrator is never reported as a failure:
/// [`ExitInfo::has_error`] is `false` whenever `stopped` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code (`-1` when the process was terminated by a signal)
    pub code: i32,
    /// Underlying error, if the process did not exit cleanly
    pub error: Option<ExitError>,
    /// Manually stopped by the user
    pub stopped: bool,
}

impl ExitInfo {
    /// Exit information of a process stopped on request
    pub fn stopped() -> Self {
        Self {
            stopped: true,
            ..Default::default()
        }
    }

    /// Check if the exit code or the underlying error report a failure
    pub fn has_error(&self) -> bool {
        if self.stopped {
            return false;
        }

        self.error.is_some() || self.code != 0
    }

    /// Combine the exit code and the underlying error into a single error value
    pub fn wrap_error(&self) -> Option<ExitFailure> {
        if !self.has_error() {
            return None;
        }

        Some(ExitFailure {
            code: self.code,
            error: self.error.clone(),
        })
    }
}

/// Reason a process did not exit cleanly
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExitError {
    #[error("exit status {0}")]
    Code(i32),

    #[error("terminated by signal {0}")]
    Signal(i32),

    #[error("failed to wait for process: {0}")]
    Wait(String),

    #[error("at least one process failed: [{}]", join(.0))]
    ProcessesFailed(Vec<ExitError>),
}

impl ExitError {
    /// Classify a non-successful exit status
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;

            if let Some(signal) = status.signal() {
                return ExitError::Signal(signal);
            }
        }

        ExitError::Code(status.code().unwrap_or(-1))
    }
}

fn join(errors: &[ExitError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Exit code and error of a failed exit, wrapped as a single error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitFailure {
    pub code: i32,
    pub error: Option<ExitError>,
}

impl fmt::Display for ExitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "exit code: {}, error: {}", self.code, error),
            None => write!(f, "exit code: {}", self.code),
        }
    }
}

impl std::error::Error for ExitFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
