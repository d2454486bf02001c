//! Service wrapper tracking lifecycle status

use super::status::{Operation, Phase, Status};
use super::{BoxError, Service};
use crate::runtime::{lock, ExitFailure, ExitInfo};
use crate::step::{NoopStep, Step, StepCallback, StepError, StepResult};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Called after every status change
pub type StatusCallback = Arc<dyn Fn(&EnhancedService) + Send + Sync>;

/// Called when a prepare or main step of the service concludes
pub type StepExitCallback = Arc<dyn Fn(&EnhancedService, &StepResult) + Send + Sync>;

/// Optional observers of an [`EnhancedService`]
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_status_changed: Option<StatusCallback>,
    pub on_step_exit: Option<StepExitCallback>,
}

impl Callbacks {
    pub fn with_status_changed(
        mut self,
        callback: impl Fn(&EnhancedService) + Send + Sync + 'static,
    ) -> Self {
        self.on_status_changed = Some(Arc::new(callback));
        self
    }

    pub fn with_step_exit(
        mut self,
        callback: impl Fn(&EnhancedService, &StepResult) + Send + Sync + 'static,
    ) -> Self {
        self.on_step_exit = Some(Arc::new(callback));
        self
    }
}

/// Stage of [`EnhancedService::restart`] that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStage {
    Reset,
    Prepare,
    Start,
}

impl fmt::Display for RestartStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestartStage::Reset => "reset",
            RestartStage::Prepare => "prepare",
            RestartStage::Start => "start",
        };
        f.write_str(name)
    }
}

/// Errors reported by service operations, always carrying the service name
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service '{service}' cannot {operation} while {status}: invalid status")]
    InvalidStatus {
        service: String,
        operation: Operation,
        status: Status,
    },

    #[error("Service '{service}' failed to create its {phase} step: {source}")]
    Service {
        service: String,
        phase: Phase,
        source: BoxError,
    },

    #[error("Failed to {operation} service '{service}': {source}")]
    Step {
        service: String,
        operation: Operation,
        source: StepError,
    },

    #[error("Service '{service}' returned an error on {operation}: {failure}")]
    Exit {
        service: String,
        operation: Operation,
        #[source]
        failure: ExitFailure,
    },

    #[error("Failed to restart service '{service}' at {stage}: {source}")]
    Restart {
        service: String,
        stage: RestartStage,
        /// Exit information of the prepare step, when it already ran
        prepared: Option<ExitInfo>,
        source: Box<ServiceError>,
    },
}

impl ServiceError {
    /// Check if the operation was refused because of the service status
    pub fn is_invalid_status(&self) -> bool {
        matches!(self, ServiceError::InvalidStatus { .. })
    }

    pub fn service(&self) -> &str {
        match self {
            ServiceError::InvalidStatus { service, .. }
            | ServiceError::Service { service, .. }
            | ServiceError::Step { service, .. }
            | ServiceError::Exit { service, .. }
            | ServiceError::Restart { service, .. } => service,
        }
    }
}

struct CurrentStep {
    phase: Phase,
    step: Arc<dyn Step>,
}

#[derive(Default)]
struct State {
    status: Status,
    current: Option<CurrentStep>,
    /// Bumped whenever a new step is created or the service is reset;
    /// step callbacks of an older generation are ignored
    generation: u64,
}

impl State {
    fn phase(&self) -> Option<Phase> {
        self.current.as_ref().map(|current| current.phase)
    }

    fn step(&self) -> Arc<dyn Step> {
        match &self.current {
            Some(current) => Arc::clone(&current.step),
            None => Arc::new(NoopStep),
        }
    }
}

struct Inner {
    service: Arc<dyn Service>,
    state: Mutex<State>,
    callbacks: Callbacks,
}

/// A [`Service`] augmented with a guarded status machine.
///
/// Operations are expected to be driven by one caller at a time. The handle is
/// cheap to clone; clones share the same status.
#[derive(Clone)]
pub struct EnhancedService {
    inner: Arc<Inner>,
}

impl EnhancedService {
    pub fn new(service: Arc<dyn Service>, callbacks: Callbacks) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                state: Mutex::new(State::default()),
                callbacks,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.service.name()
    }

    /// The wrapped service
    pub fn service(&self) -> &Arc<dyn Service> {
        &self.inner.service
    }

    pub fn status(&self) -> Status {
        lock(&self.inner.state).status
    }

    /// Check if both handles refer to the same service
    pub fn ptr_eq(&self, other: &EnhancedService) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create the prepare step. Only valid from `None`.
    pub fn start_prepare(&self) -> Result<(), ServiceError> {
        let generation = self.begin_step(Operation::StartPrepare, Status::Preparing)?;
        let created = self
            .inner
            .service
            .prepare(self.step_callback(Phase::Prepare, generation));
        self.install(Phase::Prepare, generation, created)
    }

    /// Wait for the prepare step and return its exit information
    pub async fn wait_prepare(&self) -> Result<ExitInfo, ServiceError> {
        let step = self.guarded_step(Operation::WaitPrepare)?;
        let result = step.wait().await;
        self.check(Operation::WaitPrepare, result)
    }

    pub async fn prepare(&self) -> Result<ExitInfo, ServiceError> {
        self.start_prepare()?;
        self.wait_prepare().await
    }

    /// Abort the prepare step. Returns `None` when the service is idle.
    pub async fn abort_prepare(&self, force: bool) -> Result<Option<ExitInfo>, ServiceError> {
        self.abort_current(Operation::AbortPrepare, Phase::Prepare, force)
            .await
    }

    /// Create the main step. Only valid from `Ready`.
    pub fn start(&self) -> Result<(), ServiceError> {
        let generation = self.begin_step(Operation::Start, Status::Running)?;
        let created = self
            .inner
            .service
            .start(self.step_callback(Phase::Main, generation));
        self.install(Phase::Main, generation, created)
    }

    /// Wait for the main step and return its exit information
    pub async fn wait(&self) -> Result<ExitInfo, ServiceError> {
        let step = self.guarded_step(Operation::Wait)?;
        let result = step.wait().await;
        self.check(Operation::Wait, result)
    }

    pub async fn run(&self) -> Result<ExitInfo, ServiceError> {
        self.start()?;
        self.wait().await
    }

    /// Stop the main step. Returns `None` when the service is idle.
    pub async fn stop(&self, force: bool) -> Result<Option<ExitInfo>, ServiceError> {
        self.abort_current(Operation::Stop, Phase::Main, force).await
    }

    /// Abort the prepare step or stop the main step, whichever is active
    pub async fn abort_prepare_or_stop(
        &self,
        force: bool,
    ) -> Result<Option<ExitInfo>, ServiceError> {
        match self.status() {
            status if status.is_doing_nothing() => Ok(None),
            Status::Preparing | Status::AbortingPrepare => self.abort_prepare(force).await,
            Status::Running | Status::Stopping => self.stop(force).await,
            status => Err(self.invalid(Operation::AbortPrepareOrStop, status)),
        }
    }

    /// Bring the service back to `None`, aborting whatever is active
    pub async fn reset(&self, force: bool) -> Result<Option<ExitInfo>, ServiceError> {
        let info = match self.status() {
            Status::None => return Ok(None),
            // Nothing is running after an error
            Status::Error => None,
            _ => self.abort_prepare_or_stop(force).await?,
        };

        self.update(|state| {
            state.status = Status::None;
            state.current = None;
            state.generation += 1;
        });
        Ok(info)
    }

    /// Reset, prepare and start again. Returns the prepare exit information.
    pub async fn restart(&self, force: bool) -> Result<ExitInfo, ServiceError> {
        if let Err(e) = self.reset(force).await {
            return Err(self.restart_error(RestartStage::Reset, None, e));
        }

        let prepared = match self.prepare().await {
            Ok(info) => info,
            Err(e) => return Err(self.restart_error(RestartStage::Prepare, None, e)),
        };

        match self.start() {
            Ok(()) => Ok(prepared),
            Err(e) => Err(self.restart_error(RestartStage::Start, Some(prepared), e)),
        }
    }

    /// Move to `next` if `operation` is permitted, starting a new generation
    fn begin_step(&self, operation: Operation, next: Status) -> Result<u64, ServiceError> {
        self.update(|state| {
            if !state.status.permits(operation, state.phase()) {
                return Err(self.invalid(operation, state.status));
            }
            state.status = next;
            state.current = None;
            state.generation += 1;
            Ok(state.generation)
        })
    }

    /// Store the step returned by the service, or record its failure
    fn install(
        &self,
        phase: Phase,
        generation: u64,
        created: Result<Option<Box<dyn Step>>, BoxError>,
    ) -> Result<(), ServiceError> {
        match created {
            Ok(step) => {
                let step: Arc<dyn Step> = match step {
                    Some(step) => Arc::from(step),
                    None => Arc::new(NoopStep),
                };
                self.update(|state| {
                    if state.generation == generation {
                        state.current = Some(CurrentStep { phase, step });
                    }
                });
                Ok(())
            }
            Err(source) => {
                log::error!("[{}] Failed to create {} step: {}", self.name(), phase, source);
                self.update(|state| {
                    if state.generation == generation {
                        state.status = Status::Error;
                        state.current = None;
                    }
                });
                Err(ServiceError::Service {
                    service: self.name().to_string(),
                    phase,
                    source,
                })
            }
        }
    }

    fn guarded_step(&self, operation: Operation) -> Result<Arc<dyn Step>, ServiceError> {
        let state = lock(&self.inner.state);
        if !state.status.permits(operation, state.phase()) {
            return Err(self.invalid(operation, state.status));
        }
        Ok(state.step())
    }

    async fn abort_current(
        &self,
        operation: Operation,
        phase: Phase,
        force: bool,
    ) -> Result<Option<ExitInfo>, ServiceError> {
        let aborting = match phase {
            Phase::Prepare => Status::AbortingPrepare,
            Phase::Main => Status::Stopping,
        };

        let begun = self.update(|state| {
            if state.status.is_doing_nothing() {
                return Ok(None);
            }
            if !state.status.permits(operation, state.phase()) {
                return Err(self.invalid(operation, state.status));
            }
            state.status = aborting;
            Ok(Some((state.step(), state.generation)))
        })?;
        let Some((step, generation)) = begun else {
            return Ok(None);
        };

        log::debug!("[{}] {} (force: {})", self.name(), operation, force);
        let result = step.abort(force).await;

        match &result {
            // Settle in case the step callback did not do it already
            Ok(_) => self.update(|state| {
                if state.generation == generation && state.status == aborting {
                    state.status = settle(phase, state.status, &result);
                }
            }),
            // Left in the aborting status so the caller can escalate
            Err(e) => log::warn!("[{}] Failed to {}: {}", self.name(), operation, e),
        }

        self.check(operation, result).map(Some)
    }

    fn step_callback(&self, phase: Phase, generation: u64) -> StepCallback {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |result: &StepResult| {
            if let Some(inner) = inner.upgrade() {
                EnhancedService { inner }.on_step_end(phase, generation, result);
            }
        })
    }

    fn on_step_end(&self, phase: Phase, generation: u64, result: &StepResult) {
        let current = self.update(|state| {
            if state.generation != generation {
                return false;
            }
            let active = match phase {
                Phase::Prepare => {
                    matches!(state.status, Status::Preparing | Status::AbortingPrepare)
                }
                Phase::Main => matches!(state.status, Status::Running | Status::Stopping),
            };
            if active {
                state.status = settle(phase, state.status, result);
            }
            true
        });

        if !current {
            log::debug!("[{}] Ignoring exit of a previous {} step", self.name(), phase);
            return;
        }

        match result {
            Ok(info) if info.has_error() => {
                log::warn!("[{}] {} step exited with code {}", self.name(), phase, info.code)
            }
            Ok(info) => log::debug!("[{}] {} step exited with code {}", self.name(), phase, info.code),
            Err(e) => log::warn!("[{}] {} step failed: {}", self.name(), phase, e),
        }

        if let Some(on_step_exit) = &self.inner.callbacks.on_step_exit {
            on_step_exit(self, result);
        }
    }

    /// Apply `change` under the state lock and notify observers outside of it
    fn update<R>(&self, change: impl FnOnce(&mut State) -> R) -> R {
        let (result, before, after) = {
            let mut state = lock(&self.inner.state);
            let before = state.status;
            let result = change(&mut state);
            (result, before, state.status)
        };

        if before != after {
            log::debug!("[{}] Status {} -> {}", self.name(), before, after);
            if let Some(on_status_changed) = &self.inner.callbacks.on_status_changed {
                on_status_changed(self);
            }
        }
        result
    }

    fn check(&self, operation: Operation, result: StepResult) -> Result<ExitInfo, ServiceError> {
        let info = result.map_err(|source| ServiceError::Step {
            service: self.name().to_string(),
            operation,
            source,
        })?;

        match info.wrap_error() {
            Some(failure) => Err(ServiceError::Exit {
                service: self.name().to_string(),
                operation,
                failure,
            }),
            None => Ok(info),
        }
    }

    fn invalid(&self, operation: Operation, status: Status) -> ServiceError {
        ServiceError::InvalidStatus {
            service: self.name().to_string(),
            operation,
            status,
        }
    }

    fn restart_error(
        &self,
        stage: RestartStage,
        prepared: Option<ExitInfo>,
        source: ServiceError,
    ) -> ServiceError {
        ServiceError::Restart {
            service: self.name().to_string(),
            stage,
            prepared,
            source: Box::new(source),
        }
    }
}

impl fmt::Debug for EnhancedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnhancedService")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Status a step of `phase` leads to once it concludes with `result`
fn settle(phase: Phase, status: Status, result: &StepResult) -> Status {
    let info = match result {
        Ok(info) if !info.has_error() => info,
        _ => return Status::Error,
    };

    let stopped = info.stopped || matches!(status, Status::AbortingPrepare | Status::Stopping);
    match (phase, stopped) {
        (Phase::Prepare, false) => Status::Ready,
        (Phase::Prepare, true) => Status::PrepareAborted,
        (Phase::Main, false) => Status::Ended,
        (Phase::Main, true) => Status::Stopped,
    }
}
