//! Orchestra
//!
//! Lifecycle orchestration for services made of external processes.
//!
//! # Overview
//!
//! Every service has two phases: it is *prepared* (builds, pulls, migrations)
//! and then *started* (the long-running command). The crate provides:
//! - [`Process`]: one OS process with captured exit status and graceful or
//!   forced termination
//! - [`Step`]: an awaitable, abortable unit of work, with adapters running
//!   one process, several in order, or several at once
//! - [`EnhancedService`]: a [`Service`] wrapped in a guarded status machine
//! - [`Manager`]: concurrent fan-out of lifecycle operations over many
//!   services, joining their failures into one [`AggregateError`]
//!
//! # Example Orchestra File
//!
//! ```yaml
//! version: "1.0"
//!
//! env:
//!   RUST_LOG: info
//!
//! services:
//!   db:
//!     prepare: "docker pull postgres:16"
//!     start: ["docker", "run", "--rm", "postgres:16"]
//!
//!   api:
//!     prepare: "cargo build --release"
//!     start:
//!       - shell: "./target/release/api"
//!       - argv: ["./target/release/worker"]
//!     parallel: true
//! ```

pub mod cli;
pub mod config;
pub mod palette;
pub mod runtime;
pub mod service;
pub mod step;

pub use cli::{CliError, OrchestraArgs, RunMode};
pub use config::{OrchestraFile, OrchestraFileError};
pub use palette::ColorCycle;
pub use runtime::{
    AggregateError, ExitError, ExitFailure, ExitInfo, Process, ProcessConfig, ProcessError, Waiter,
};
pub use service::{
    Callbacks, CommandSpec, EnhancedService, Manager, ManagerError, ManagerPhase, Operation,
    Phase, Service, ServiceCallback, ServiceError, ShellService, Status,
};
pub use step::{NoopStep, ParallelStep, ProcessStep, SerialStep, Step, StepError, StepResult};
