//! Services, their status machine and the multi-service manager

pub mod enhanced;
pub mod manager;
pub mod shell;
pub mod status;

pub use enhanced::{
    Callbacks, EnhancedService, RestartStage, ServiceError, StatusCallback, StepExitCallback,
};
pub use manager::{ErrorObserver, Manager, ManagerError, ManagerPhase, ServiceCallback};
pub use shell::{CommandSpec, ShellService, ShellServiceError};
pub use status::{Operation, Phase, Status};

use crate::step::{Step, StepCallback};

/// Boxed error returned by service implementations
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A two-phase lifecycle implementation (prepare, then start).
///
/// `prepare` and `start` must return quickly: any long-running work belongs
/// in the returned [`Step`]. The step reports its end through `on_exit`.
/// Returning `Ok(None)` means there is nothing to wait on; the
/// implementation is then responsible for invoking `on_exit` itself.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Create the step that prepares the service to run
    fn prepare(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError>;

    /// Create the step that runs the service
    fn start(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError>;
}
