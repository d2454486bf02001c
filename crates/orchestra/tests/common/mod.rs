//! Test helpers for orchestration tests

#![allow(dead_code)]

use async_trait::async_trait;
use orchestra::runtime::Completion;
use orchestra::service::BoxError;
use orchestra::step::StepCallback;
use orchestra::{
    Callbacks, EnhancedService, ExitError, ExitInfo, Manager, Service, Status, Step, StepResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Step finished by the test (or by its own timer)
pub struct FakeStep {
    result: Completion<StepResult>,
    on_exit: StepCallback,
    /// Exit reported when the step is aborted
    on_abort: ExitInfo,
}

impl FakeStep {
    fn new(on_exit: StepCallback, on_abort: ExitInfo) -> Arc<Self> {
        Arc::new(Self {
            result: Completion::new(),
            on_exit,
            on_abort,
        })
    }

    pub fn finish(&self, result: StepResult) {
        if !self.result.is_complete() {
            (self.on_exit)(&result);
            self.result.complete(result);
        }
    }
}

struct SharedStep(Arc<FakeStep>);

#[async_trait]
impl Step for SharedStep {
    async fn wait(&self) -> StepResult {
        self.0.result.wait().await
    }

    async fn abort(&self, _force: bool) -> StepResult {
        self.0.finish(Ok(self.0.on_abort.clone()));
        self.0.result.wait().await
    }
}

/// What the main step of a [`FakeService`] does
#[derive(Clone)]
pub enum Main {
    /// Runs until stopped
    Hold,
    /// Exits by itself with the given code
    ExitAfter(Duration, i32),
    /// Runs until stopped, then reports a failed exit
    FailOnStop(i32),
}

/// In-memory service recording what it was asked to do
pub struct FakeService {
    name: String,
    prepare_delay: Duration,
    fail_prepare: bool,
    main: Main,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl FakeService {
    pub fn new(name: &str, prepare_delay: Duration, main: Main) -> Self {
        Self {
            name: name.to_string(),
            prepare_delay,
            fail_prepare: false,
            main,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn with_events(mut self, events: Arc<Mutex<Vec<String>>>) -> Self {
        self.events = events;
        self
    }

    fn record(&self, event: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, event));
    }
}

impl Service for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError> {
        if self.fail_prepare {
            return Err(format!("cannot prepare {}", self.name).into());
        }
        self.record("prepare");

        let step = FakeStep::new(on_exit, ExitInfo::stopped());
        let timer = Arc::clone(&step);
        let delay = self.prepare_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timer.finish(Ok(ExitInfo::default()));
        });
        Ok(Some(Box::new(SharedStep(step))))
    }

    fn start(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError> {
        self.record("start");

        let step = match self.main.clone() {
            Main::Hold => FakeStep::new(on_exit, ExitInfo::stopped()),
            Main::FailOnStop(code) => FakeStep::new(on_exit, failed(code)),
            Main::ExitAfter(delay, code) => {
                let step = FakeStep::new(on_exit, ExitInfo::stopped());
                let timer = Arc::clone(&step);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let info = if code == 0 { ExitInfo::default() } else { failed(code) };
                    timer.finish(Ok(info));
                });
                step
            }
        };
        Ok(Some(Box::new(SharedStep(step))))
    }
}

/// Exit information of a process that failed with `code`
pub fn failed(code: i32) -> ExitInfo {
    ExitInfo {
        code,
        error: Some(ExitError::Code(code)),
        stopped: false,
    }
}

/// Callbacks appending every status change as `name:Status` to `log`
pub fn status_log(log: &Arc<Mutex<Vec<String>>>) -> Callbacks {
    let log = Arc::clone(log);
    Callbacks::default().with_status_changed(move |svc: &EnhancedService| {
        log.lock()
            .unwrap()
            .push(format!("{}:{}", svc.name(), svc.status()));
    })
}

/// Position of `entry` in `log`
pub fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("'{}' not found in {:?}", entry, log))
}

/// Statuses of the managed services, in insertion order
pub fn statuses(manager: &Manager) -> Vec<Status> {
    manager.services().iter().map(|s| s.status()).collect()
}
