//! Single-process step

use super::{spawn_driver, Outcome, Step, StepCallback, StepError, StepResult};
use crate::runtime::Process;
use async_trait::async_trait;
use std::sync::Arc;

/// Wraps one process in the [`Step`] interface
pub struct ProcessStep {
    process: Process,
    outcome: Arc<Outcome>,
}

impl ProcessStep {
    /// Wrap a process, starting it if it is not running yet.
    ///
    /// A start failure is reported by [`Step::wait`] and passed to `on_end`.
    pub fn new(process: Process, on_end: Option<StepCallback>) -> Self {
        let outcome = Outcome::new(on_end);
        let started = process.start();

        let driven = process.clone();
        spawn_driver(Arc::clone(&outcome), async move {
            started?;
            Ok::<_, StepError>(driven.wait().await)
        });

        Self { process, outcome }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }
}

#[async_trait]
impl Step for ProcessStep {
    async fn wait(&self) -> StepResult {
        self.outcome.wait().await
    }

    async fn abort(&self, force: bool) -> StepResult {
        let info = self
            .process
            .stop(force)
            .await
            .map_err(|e| StepError::Stop(Arc::new(e)))?;

        // The end callback has run once the driver published its result
        let _ = self.outcome.wait().await;
        Ok(info)
    }
}
