//! Awaitable, cancellable units of work and their process adapters
//!
//! A [`Step`] is what a service hands back from its prepare or start phase.
//! The adapters here wrap [`Process`](crate::runtime::Process) handles:
//!
//! | Adapter          | Processes | Failure policy                            |
//! |------------------|-----------|-------------------------------------------|
//! | [`ProcessStep`]  | 1         | forwards the process exit                 |
//! | [`SerialStep`]   | N, ordered| stops at the first failing process        |
//! | [`ParallelStep`] | N, concurrent | waits for all, aggregates failures    |
//! | [`NoopStep`]     | 0         | never fails                               |

pub mod noop;
pub mod parallel;
pub mod process;
pub mod serial;

pub use noop::NoopStep;
pub use parallel::ParallelStep;
pub use process::ProcessStep;
pub use serial::SerialStep;

use crate::runtime::{Completion, ExitFailure, ExitInfo, ProcessError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Result of a step: its exit information, or why it could not run or stop
pub type StepResult = Result<ExitInfo, StepError>;

/// Callback invoked once when a step concludes
pub type StepCallback = Arc<dyn Fn(&StepResult) + Send + Sync>;

/// A unit of asynchronous work that can be awaited or cancelled
#[async_trait]
pub trait Step: Send + Sync {
    /// Wait for the step to end and return its exit information
    async fn wait(&self) -> StepResult;

    /// Abort the step and wait until the underlying work has stopped.
    ///
    /// `force` terminates immediately instead of requesting a graceful shutdown.
    async fn abort(&self, force: bool) -> StepResult;
}

/// Errors reported by steps
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("Failed to start process: {0}")]
    Start(Arc<ProcessError>),

    #[error("Failed to start {} process(es): {}", .0.len(), join(.0))]
    StartMany(Vec<Arc<ProcessError>>),

    #[error("Failed to stop process: {0}")]
    Stop(Arc<ProcessError>),

    #[error("Stopped process reported an error: {0}")]
    Exit(ExitFailure),

    #[error("Step driver ended without a result")]
    Interrupted,
}

impl From<ProcessError> for StepError {
    fn from(error: ProcessError) -> Self {
        StepError::Start(Arc::new(error))
    }
}

fn join(errors: &[Arc<ProcessError>]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result slot shared between a step handle and its driver task
pub(crate) struct Outcome {
    result: Completion<StepResult>,
    on_end: Option<StepCallback>,
}

impl Outcome {
    pub(crate) fn new(on_end: Option<StepCallback>) -> Arc<Self> {
        Arc::new(Self {
            result: Completion::new(),
            on_end,
        })
    }

    /// Publish the step result, invoking the end callback first
    pub(crate) fn finish(&self, result: StepResult) {
        if self.result.is_complete() {
            return;
        }
        if let Some(on_end) = &self.on_end {
            on_end(&result);
        }
        self.result.complete(result);
    }

    pub(crate) async fn wait(&self) -> StepResult {
        self.result.wait().await
    }
}

/// Run a step driver on the runtime and publish whatever it resolves to.
///
/// A panicking driver still releases waiters, with [`StepError::Interrupted`].
pub(crate) fn spawn_driver<F>(outcome: Arc<Outcome>, driver: F)
where
    F: Future<Output = StepResult> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match tokio::spawn(driver).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Step driver failed: {}", e);
                Err(StepError::Interrupted)
            }
        };
        outcome.finish(result);
    });
}

/// Report an abort as failed when a stopped process still carries an error
pub(crate) fn check_stopped(info: &ExitInfo) -> Result<(), StepError> {
    match info.wrap_error() {
        Some(failure) => Err(StepError::Exit(failure)),
        None => Ok(()),
    }
}
