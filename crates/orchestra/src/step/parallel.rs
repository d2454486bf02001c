//! Concurrent multi-process step

use super::{spawn_driver, Outcome, Step, StepCallback, StepError, StepResult};
use crate::runtime::{ExitError, ExitInfo, Process, AGGREGATE_FAILURE_CODE};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs processes concurrently and ends when all of them have ended.
///
/// Every process not yet running is launched when the step is created;
/// processes the caller already launched are accepted as they are. A failing
/// process never stops the others.
pub struct ParallelStep {
    processes: Vec<Process>,
    outcome: Arc<Outcome>,
}

impl ParallelStep {
    pub fn new(processes: Vec<Process>, on_end: Option<StepCallback>) -> Self {
        let outcome = Outcome::new(on_end);

        let mut launched = Vec::with_capacity(processes.len());
        let mut start_errors = Vec::new();
        for process in &processes {
            match process.start() {
                Ok(()) => launched.push(process.clone()),
                Err(e) => start_errors.push(Arc::new(e)),
            }
        }

        spawn_driver(Arc::clone(&outcome), async move {
            let mut info = ExitInfo::default();
            let mut failures = Vec::new();

            for process in &launched {
                let exit = process.wait().await;
                info.stopped |= exit.stopped;
                if exit.has_error() {
                    failures.push(exit.error.unwrap_or(ExitError::Code(exit.code)));
                }
            }

            if !failures.is_empty() {
                info.code = AGGREGATE_FAILURE_CODE;
                info.error = Some(ExitError::ProcessesFailed(failures));
            }

            match start_errors.len() {
                0 => Ok(info),
                1 => Err(StepError::Start(start_errors.remove(0))),
                _ => Err(StepError::StartMany(start_errors)),
            }
        });

        Self { processes, outcome }
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }
}

#[async_trait]
impl Step for ParallelStep {
    async fn wait(&self) -> StepResult {
        self.outcome.wait().await
    }

    async fn abort(&self, force: bool) -> StepResult {
        // Signal everything first, then wait, so graceful shutdowns overlap
        let mut first_error = None;
        for process in &self.processes {
            if let Err(e) = process.kill(force).await {
                log::warn!("[{}] Failed to stop process: {}", process.name(), e);
                first_error.get_or_insert(StepError::Stop(Arc::new(e)));
            }
        }

        let result = self.outcome.wait().await;
        match first_error {
            Some(error) => Err(error),
            None => result,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runtime::ProcessConfig;
    use std::time::{Duration, Instant};

    fn shell(name: &str, command: &str) -> Process {
        Process::new(ProcessConfig::shell(name, command))
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_others() {
        let failing = Process::spawn(ProcessConfig::shell("a", "exit 2")).unwrap();
        let slow = Process::spawn(ProcessConfig::shell("b", "sleep 0.3")).unwrap();
        let step = ParallelStep::new(vec![failing, slow.clone()], None);

        let info = step.wait().await.unwrap();
        assert!(info.has_error());
        assert_eq!(info.code, AGGREGATE_FAILURE_CODE);
        assert!(matches!(info.error, Some(ExitError::ProcessesFailed(ref f)) if f.len() == 1));

        let slow_exit = slow.exit_info().unwrap();
        assert!(!slow_exit.has_error());
    }

    #[tokio::test]
    async fn test_runs_concurrently() {
        let begin = Instant::now();
        let step = ParallelStep::new(
            vec![shell("a", "sleep 0.5"), shell("b", "sleep 0.5"), shell("c", "sleep 0.5")],
            None,
        );
        let info = step.wait().await.unwrap();
        assert!(!info.has_error());
        assert!(begin.elapsed() < Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_start_errors_accumulate() {
        let ok = shell("ok", "true");
        let step = ParallelStep::new(
            vec![
                Process::new(ProcessConfig::new("m1", "/nonexistent/one")),
                ok.clone(),
                Process::new(ProcessConfig::new("m2", "/nonexistent/two")),
            ],
            None,
        );

        assert!(matches!(step.wait().await, Err(StepError::StartMany(ref e)) if e.len() == 2));
        assert!(ok.exited());
    }

    #[tokio::test]
    async fn test_abort_stops_all() {
        let step = ParallelStep::new(vec![shell("a", "sleep 30"), shell("b", "sleep 30")], None);
        let info = step.abort(false).await.unwrap();
        assert!(info.stopped);
        assert!(!info.has_error());
        assert!(step.processes().iter().all(|p| p.stopped() && p.exited()));
    }
}
