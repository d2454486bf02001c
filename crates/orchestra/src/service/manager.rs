//! Named collection of services driven together

use super::enhanced::{Callbacks, EnhancedService, ServiceError};
use super::Service;
use crate::runtime::{lock, AggregateError, ExitInfo, Waiter};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

/// Called once per service when a fan-out operation is done with it
pub type ServiceCallback =
    Arc<dyn Fn(&EnhancedService, Option<&ExitInfo>, Option<&ServiceError>) + Send + Sync>;

/// Called as soon as any service of a fan-out operation fails
pub type ErrorObserver = Arc<dyn Fn(&Manager, &ServiceError) + Send + Sync>;

/// Joined operation of a [`Manager`] that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Prepare,
    WaitPrepare,
    Start,
    Wait,
    Stop,
    Reset,
    Run,
}

impl fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerPhase::Prepare => "prepare",
            ManagerPhase::WaitPrepare => "wait for prepare of",
            ManagerPhase::Start => "start",
            ManagerPhase::Wait => "wait for",
            ManagerPhase::Stop => "stop",
            ManagerPhase::Reset => "reset",
            ManagerPhase::Run => "run",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Manager '{manager}' failed to {phase} services: {source}")]
    Phase {
        manager: String,
        phase: ManagerPhase,
        source: AggregateError<ServiceError>,
    },

    #[error("Manager '{manager}' stopped running services in order: {source}")]
    Serial {
        manager: String,
        source: ServiceError,
    },

    #[error("Manager '{manager}' failed to remove service: {source}")]
    Remove {
        manager: String,
        source: ServiceError,
    },
}

impl ManagerError {
    /// Every service error behind this failure
    pub fn service_errors(&self) -> Vec<&ServiceError> {
        match self {
            ManagerError::Phase { source, .. } => source.errors().iter().collect(),
            ManagerError::Serial { source, .. } | ManagerError::Remove { source, .. } => {
                vec![source]
            }
        }
    }
}

struct Inner {
    name: String,
    services: Mutex<Vec<EnhancedService>>,
    on_error: RwLock<Option<ErrorObserver>>,
    /// Set by `shutdown`; held for reading while a prepare or main step begins
    shutting_down: RwLock<bool>,
}

/// Runs lifecycle operations over a set of services concurrently.
///
/// Operations returning a [`Waiter`] have already been spawned; await
/// [`Waiter::wait`] to join them, or drop it to let them run unobserved.
/// Services are processed in no particular order except where an operation
/// documents a barrier.
///
/// After [`Manager::shutdown`] no prepare or main step is begun anymore;
/// operations skip the services they would have started.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                services: Mutex::new(Vec::new()),
                on_error: RwLock::new(None),
                shutting_down: RwLock::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Install the observer notified of every per-service failure
    pub fn set_error_observer(
        &self,
        observer: impl Fn(&Manager, &ServiceError) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .on_error
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Wrap a service and add it to the managed set
    pub fn add_service(&self, service: Arc<dyn Service>, callbacks: Callbacks) -> EnhancedService {
        let enhanced = EnhancedService::new(service, callbacks);
        lock(&self.inner.services).push(enhanced.clone());
        log::debug!("[{}] Added service '{}'", self.name(), enhanced.name());
        enhanced
    }

    pub fn add_services(
        &self,
        services: impl IntoIterator<Item = Arc<dyn Service>>,
        callbacks: Callbacks,
    ) -> Vec<EnhancedService> {
        services
            .into_iter()
            .map(|service| self.add_service(service, callbacks.clone()))
            .collect()
    }

    /// Abort or stop a service, then remove it from the managed set
    pub async fn remove_service(
        &self,
        service: &EnhancedService,
        force: bool,
        on_removed: Option<ServiceCallback>,
    ) -> Result<(), ManagerError> {
        let result = ignore_invalid_status(service.abort_prepare_or_stop(force).await);
        let result = notify(&on_removed, service, result);
        if let Err(source) = result {
            self.report(&source);
            return Err(ManagerError::Remove {
                manager: self.name().to_string(),
                source,
            });
        }

        lock(&self.inner.services).retain(|managed| !managed.ptr_eq(service));
        log::debug!("[{}] Removed service '{}'", self.name(), service.name());
        Ok(())
    }

    /// Remove services one at a time, stopping at the first failure
    pub async fn remove_services(
        &self,
        services: &[EnhancedService],
        force: bool,
        on_removed: Option<ServiceCallback>,
    ) -> Result<(), ManagerError> {
        for service in services {
            self.remove_service(service, force, on_removed.clone())
                .await?;
        }
        Ok(())
    }

    /// Snapshot of the managed services, in insertion order
    pub fn services(&self) -> Vec<EnhancedService> {
        lock(&self.inner.services).clone()
    }

    pub fn service(&self, name: &str) -> Option<EnhancedService> {
        lock(&self.inner.services)
            .iter()
            .find(|service| service.name() == name)
            .cloned()
    }

    pub fn start_prepare(&self, on_service: Option<ServiceCallback>) -> Waiter<ServiceError> {
        self.for_each_service(move |manager, service| {
            let on_service = on_service.clone();
            async move {
                let result = manager
                    .begin(&service, EnhancedService::start_prepare)
                    .map(|_| None);
                notify(&on_service, &service, result)
            }
        })
    }

    pub async fn wait_prepare(&self, on_service: Option<ServiceCallback>) -> Result<(), ManagerError> {
        let waiter = self.for_each_service(move |_, service| {
            let on_service = on_service.clone();
            async move {
                let result = service.wait_prepare().await.map(Some);
                notify(&on_service, &service, result)
            }
        });
        self.join(ManagerPhase::WaitPrepare, waiter).await
    }

    /// Prepare every service concurrently
    pub fn prepare(&self, on_service: Option<ServiceCallback>) -> Waiter<ServiceError> {
        self.for_each_service(move |manager, service| {
            let on_service = on_service.clone();
            async move {
                let result = manager.prepare_service(&service).await;
                notify(&on_service, &service, result)
            }
        })
    }

    pub fn abort_prepare(
        &self,
        force: bool,
        on_service: Option<ServiceCallback>,
    ) -> Waiter<ServiceError> {
        self.for_each_service(move |_, service| {
            let on_service = on_service.clone();
            async move {
                let result = service.abort_prepare(force).await;
                notify(&on_service, &service, result)
            }
        })
    }

    /// Start every service and wait for each of them to end
    pub fn start(&self, on_service: Option<ServiceCallback>) -> Waiter<ServiceError> {
        self.for_each_service(move |manager, service| {
            let on_service = on_service.clone();
            async move {
                let result = manager.run_service(&service).await;
                notify(&on_service, &service, result)
            }
        })
    }

    pub async fn wait(&self, on_service: Option<ServiceCallback>) -> Result<(), ManagerError> {
        let waiter = self.for_each_service(move |_, service| {
            let on_service = on_service.clone();
            async move {
                let result = service.wait().await.map(Some);
                notify(&on_service, &service, result)
            }
        });
        self.join(ManagerPhase::Wait, waiter).await
    }

    /// Prepare all services, then start all of them once every one is ready
    pub async fn run(&self, on_service: Option<ServiceCallback>) -> Result<(), ManagerError> {
        self.join(ManagerPhase::Prepare, self.prepare(None)).await?;
        self.join(ManagerPhase::Start, self.start(on_service)).await
    }

    /// Prepare and start each service independently of the others
    pub fn run_each(&self, on_service: Option<ServiceCallback>) -> Waiter<ServiceError> {
        self.for_each_service(move |manager, service| {
            let on_service = on_service.clone();
            async move {
                let result = match manager.prepare_service(&service).await {
                    Ok(Some(_)) => manager.run_service(&service).await,
                    skipped => skipped,
                };
                notify(&on_service, &service, result)
            }
        })
    }

    /// Prepare all services, then run them one after another in insertion
    /// order. The first failing service ends the sequence.
    pub async fn run_serial(
        &self,
        on_prepared: Option<ServiceCallback>,
        on_ended: Option<ServiceCallback>,
    ) -> Result<(), ManagerError> {
        self.join(ManagerPhase::Prepare, self.prepare(on_prepared))
            .await?;

        for service in self.services() {
            if self.is_shutting_down() {
                log::info!("[{}] Shutting down, not running remaining services", self.name());
                break;
            }

            let result = self.run_service(&service).await;
            if let Err(source) = notify(&on_ended, &service, result) {
                self.report(&source);
                return Err(ManagerError::Serial {
                    manager: self.name().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Stop every running service. Services that are not running are skipped.
    pub fn stop(&self, force: bool, on_service: Option<ServiceCallback>) -> Waiter<ServiceError> {
        self.for_each_service(move |_, service| {
            let on_service = on_service.clone();
            async move {
                let result = ignore_invalid_status(service.stop(force).await);
                notify(&on_service, &service, result)
            }
        })
    }

    pub fn abort_prepare_or_stop(
        &self,
        force: bool,
        on_service: Option<ServiceCallback>,
    ) -> Waiter<ServiceError> {
        self.for_each_service(move |_, service| {
            let on_service = on_service.clone();
            async move {
                let result = ignore_invalid_status(service.abort_prepare_or_stop(force).await);
                notify(&on_service, &service, result)
            }
        })
    }

    pub fn reset(&self, force: bool, on_service: Option<ServiceCallback>) -> Waiter<ServiceError> {
        self.for_each_service(move |_, service| {
            let on_service = on_service.clone();
            async move {
                let result = ignore_invalid_status(service.reset(force).await);
                notify(&on_service, &service, result)
            }
        })
    }

    /// Reset, prepare and start all services, with a barrier between phases
    pub async fn restart(
        &self,
        force: bool,
        on_service: Option<ServiceCallback>,
    ) -> Result<(), ManagerError> {
        self.join(ManagerPhase::Reset, self.reset(force, on_service.clone()))
            .await?;
        self.join(ManagerPhase::Prepare, self.prepare(on_service.clone()))
            .await?;
        self.join(ManagerPhase::Start, self.start(on_service)).await
    }

    /// Restart each service independently of the others
    pub fn restart_each(
        &self,
        force: bool,
        on_service: Option<ServiceCallback>,
    ) -> Waiter<ServiceError> {
        self.for_each_service(move |manager, service| {
            let on_service = on_service.clone();
            async move {
                // Checked once: a restart already past this point runs to the end
                if manager.is_shutting_down() {
                    return notify(&on_service, &service, Ok(None));
                }
                let result = service.restart(force).await.map(Some);
                notify(&on_service, &service, result)
            }
        })
    }

    /// Stop every service and wait for all of them
    pub async fn close(
        &self,
        force: bool,
        on_service: Option<ServiceCallback>,
    ) -> Result<(), ManagerError> {
        self.join(ManagerPhase::Stop, self.stop(force, on_service))
            .await
    }

    /// Stop starting services, then abort or stop every active one.
    ///
    /// Operations already running skip the services they have not begun yet,
    /// and [`Manager::run_serial`] ends after the current service. Status
    /// callbacks must not call this method.
    pub fn shutdown(&self, force: bool) -> Waiter<ServiceError> {
        *self
            .inner
            .shutting_down
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        log::info!("[{}] Shutting down (force: {})", self.name(), force);

        self.abort_prepare_or_stop(force, None)
    }

    /// Check if [`Manager::shutdown`] has been requested
    pub fn is_shutting_down(&self) -> bool {
        *self
            .inner
            .shutting_down
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Begin a step of `service` unless the manager is shutting down.
    ///
    /// Returns `false` when the service was skipped. The gate is held while
    /// the step begins, so a concurrent shutdown sweep observes its status.
    fn begin(
        &self,
        service: &EnhancedService,
        begin: impl FnOnce(&EnhancedService) -> Result<(), ServiceError>,
    ) -> Result<bool, ServiceError> {
        let shutting_down = self
            .inner
            .shutting_down
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *shutting_down {
            log::debug!("[{}] Shutting down, skipping '{}'", self.name(), service.name());
            return Ok(false);
        }
        begin(service)?;
        Ok(true)
    }

    /// Prepare one service. `None` when it was skipped.
    async fn prepare_service(
        &self,
        service: &EnhancedService,
    ) -> Result<Option<ExitInfo>, ServiceError> {
        if !self.begin(service, EnhancedService::start_prepare)? {
            return Ok(None);
        }
        service.wait_prepare().await.map(Some)
    }

    /// Start one service and wait for it. `None` when it was skipped.
    async fn run_service(
        &self,
        service: &EnhancedService,
    ) -> Result<Option<ExitInfo>, ServiceError> {
        if !self.begin(service, EnhancedService::start)? {
            return Ok(None);
        }
        service.wait().await.map(Some)
    }

    /// Spawn `action` once per managed service
    fn for_each_service<F, Fut>(&self, action: F) -> Waiter<ServiceError>
    where
        F: Fn(Manager, EnhancedService) -> Fut,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let mut waiter = Waiter::new();

        for service in self.services() {
            let manager = self.clone();
            let task = action(self.clone(), service);
            waiter.spawn(async move {
                let result = task.await;
                if let Err(e) = &result {
                    manager.report(e);
                }
                result
            });
        }

        waiter
    }

    async fn join(
        &self,
        phase: ManagerPhase,
        waiter: Waiter<ServiceError>,
    ) -> Result<(), ManagerError> {
        waiter.wait().await.map_err(|source| ManagerError::Phase {
            manager: self.name().to_string(),
            phase,
            source,
        })
    }

    fn report(&self, error: &ServiceError) {
        log::warn!("[{}] {}", self.name(), error);

        let observer = self
            .inner
            .on_error
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(self, error);
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("name", &self.name())
            .field("services", &self.services())
            .finish()
    }
}

/// Services that are idle or failed are expected members of a sweep
fn ignore_invalid_status(
    result: Result<Option<ExitInfo>, ServiceError>,
) -> Result<Option<ExitInfo>, ServiceError> {
    match result {
        Err(e) if e.is_invalid_status() => {
            log::debug!("Skipping service: {}", e);
            Ok(None)
        }
        result => result,
    }
}

fn notify(
    callback: &Option<ServiceCallback>,
    service: &EnhancedService,
    result: Result<Option<ExitInfo>, ServiceError>,
) -> Result<(), ServiceError> {
    if let Some(callback) = callback {
        match &result {
            Ok(info) => callback(service, info.as_ref(), None),
            Err(e) => callback(service, None, Some(e)),
        }
    }
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{BoxError, Status};
    use crate::step::{NoopStep, Step, StepCallback};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Service with nothing to prepare and nothing to run
    struct Idle(&'static str);

    impl Service for Idle {
        fn name(&self) -> &str {
            self.0
        }

        fn prepare(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError> {
            on_exit(&Ok(ExitInfo::default()));
            Ok(Some(Box::new(NoopStep)))
        }

        fn start(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError> {
            on_exit(&Ok(ExitInfo::default()));
            Ok(Some(Box::new(NoopStep)))
        }
    }

    fn manager_with(names: &[&'static str]) -> Manager {
        let manager = Manager::new("test");
        manager.add_services(
            names.iter().map(|name| Arc::new(Idle(name)) as Arc<dyn Service>),
            Callbacks::default(),
        );
        manager
    }

    #[tokio::test]
    async fn test_run_visits_every_service() {
        let manager = manager_with(&["a", "b", "c"]);
        let visited = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&visited);
        let on_service: ServiceCallback = Arc::new(
            move |_: &EnhancedService, info: Option<&ExitInfo>, err: Option<&ServiceError>| {
                assert!(info.is_some());
                assert!(err.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        manager.run(Some(on_service)).await.unwrap();
        assert_eq!(visited.load(Ordering::SeqCst), 3);
        assert!(manager.services().iter().all(|s| s.status() == Status::Ended));
    }

    #[tokio::test]
    async fn test_sweeps_skip_idle_services() {
        let manager = manager_with(&["a", "b"]);
        manager.stop(false, None).wait().await.unwrap();
        manager.abort_prepare_or_stop(true, None).wait().await.unwrap();
        manager.reset(false, None).wait().await.unwrap();
        manager.close(false, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_start_is_reported() {
        let manager = manager_with(&["a", "b"]);
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        manager.set_error_observer(move |_, err| {
            assert!(err.is_invalid_status());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = manager.start(None).wait().await.unwrap_err();
        assert_eq!(err.len(), 2);
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_and_remove() {
        let manager = manager_with(&["a", "b"]);
        let b = manager.service("b").unwrap();
        assert!(manager.service("missing").is_none());

        manager.prepare(None).wait().await.unwrap();
        manager.remove_service(&b, false, None).await.unwrap();

        let names: Vec<String> = manager.services().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["a"]);
    }

    #[tokio::test]
    async fn test_shutdown_skips_new_steps() {
        let manager = manager_with(&["a", "b"]);
        manager.shutdown(false).wait().await.unwrap();
        assert!(manager.is_shutting_down());

        manager.run(None).await.unwrap();
        manager.run_serial(None, None).await.unwrap();
        manager.restart_each(false, None).wait().await.unwrap();
        assert!(manager.services().iter().all(|s| s.status() == Status::None));
    }

    #[tokio::test]
    async fn test_restart_ends_running() {
        let manager = manager_with(&["a"]);
        manager.run(None).await.unwrap();
        manager.restart(false, None).await.unwrap();
        assert_eq!(manager.services()[0].status(), Status::Ended);
    }
}
