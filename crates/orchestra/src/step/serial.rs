//! Ordered multi-process step

use super::{check_stopped, spawn_driver, Outcome, Step, StepCallback, StepError, StepResult};
use crate::runtime::{ExitInfo, Process};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Runs processes one after another, in declaration order.
///
/// The sequence stops at the first process that exits with an error, at the
/// first process that fails to start, or once the step is aborted. A start
/// failure is reported as the step error; the exit information of the
/// processes that ran before it stays available through [`SerialStep::processes`].
pub struct SerialStep {
    processes: Vec<Process>,
    /// Held while checking the flag and starting the next process
    aborted: Arc<Mutex<bool>>,
    outcome: Arc<Outcome>,
}

impl SerialStep {
    pub fn new(processes: Vec<Process>, on_end: Option<StepCallback>) -> Self {
        let outcome = Outcome::new(on_end);
        let aborted = Arc::new(Mutex::new(false));

        let sequence = processes.clone();
        let abort_flag = Arc::clone(&aborted);
        spawn_driver(Arc::clone(&outcome), async move {
            let mut last = ExitInfo::default();

            for process in &sequence {
                {
                    let aborted = abort_flag.lock().await;
                    if *aborted {
                        log::debug!("[{}] Sequence aborted before start", process.name());
                        last.stopped = true;
                        break;
                    }
                    if let Err(e) = process.start() {
                        log::debug!(
                            "[{}] Sequence ended by start failure after exit code {}",
                            process.name(),
                            last.code
                        );
                        return Err(e.into());
                    }
                }

                last = process.wait().await;
                if last.has_error() {
                    log::debug!("[{}] Sequence stopped at failing process", process.name());
                    break;
                }
            }

            Ok::<_, StepError>(last)
        });

        Self {
            processes,
            aborted,
            outcome,
        }
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }
}

#[async_trait]
impl Step for SerialStep {
    async fn wait(&self) -> StepResult {
        self.outcome.wait().await
    }

    async fn abort(&self, force: bool) -> StepResult {
        // No process can be started once the flag is set
        *self.aborted.lock().await = true;

        for process in self.processes.iter().filter(|p| p.started()) {
            let info = process
                .stop(force)
                .await
                .map_err(|e| StepError::Stop(Arc::new(e)))?;
            check_stopped(&info)?;
        }

        self.outcome.wait().await
    }
}
