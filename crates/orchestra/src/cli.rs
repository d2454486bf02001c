//! Command-line interface for orchestra

use crate::config::OrchestraFileError;
use crate::service::{Manager, ManagerError, ManagerPhase};
use argh::FromArgs;
use std::fmt;
use tokio::sync::watch;

/// Prepare and run the services of an orchestra file
#[derive(FromArgs, Debug)]
pub struct OrchestraArgs {
    /// path to the orchestra file (default: orchestra.yaml)
    #[argh(positional, default = "String::from(\"orchestra.yaml\")")]
    pub file: String,

    /// how services are run: run, run-each, run-serial or prepare (default: run)
    #[argh(option, short = 'm', default = "RunMode::Run", from_str_fn(parse_mode))]
    pub mode: RunMode,

    /// validate the orchestra file and exit
    #[argh(switch)]
    pub validate: bool,

    /// do not color service labels
    #[argh(switch)]
    pub no_color: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Order in which services are prepared and started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Prepare all services, then start all of them
    Run,
    /// Prepare and start each service on its own
    RunEach,
    /// Prepare all services, then run them one at a time
    RunSerial,
    /// Only prepare the services
    Prepare,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Run => "run",
            RunMode::RunEach => "run-each",
            RunMode::RunSerial => "run-serial",
            RunMode::Prepare => "prepare",
        };
        f.write_str(name)
    }
}

/// Parse the run mode name
fn parse_mode(s: &str) -> Result<RunMode, String> {
    match s.trim().to_lowercase().as_str() {
        "run" => Ok(RunMode::Run),
        "run-each" | "each" => Ok(RunMode::RunEach),
        "run-serial" | "serial" => Ok(RunMode::RunSerial),
        "prepare" => Ok(RunMode::Prepare),
        _ => Err(format!(
            "Invalid mode '{}'. Expected run, run-each, run-serial or prepare",
            s
        )),
    }
}

impl OrchestraArgs {
    /// Log filter for env_logger, falling back to `info`
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

/// Errors that end the orchestra binary
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] OrchestraFileError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Failed to set Ctrl+C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Interrupted")]
    Interrupted,
}

/// Run `mode` over the services of `manager` until it ends or is interrupted.
///
/// `interrupts` counts Ctrl+C presses. The first one shuts the manager down
/// gracefully, so no further service is started; later ones force the
/// shutdown. Returns [`CliError::Interrupted`] once the orchestration has
/// wound down after an interrupt.
pub async fn orchestrate(
    manager: &Manager,
    mode: RunMode,
    mut interrupts: watch::Receiver<u32>,
) -> Result<(), CliError> {
    let work = drive(manager, mode);
    tokio::pin!(work);
    let mut interrupted = false;

    loop {
        tokio::select! {
            result = &mut work => {
                if interrupted {
                    if let Err(e) = result {
                        log::debug!("Ended after interrupt: {}", e);
                    }
                    return Err(CliError::Interrupted);
                }
                return result.map_err(Into::into);
            }
            Ok(()) = interrupts.changed() => {
                let force = *interrupts.borrow_and_update() > 1;
                interrupted = true;
                log::info!("Received Ctrl+C, stopping services (force: {})...", force);

                let sweep = manager.shutdown(force);
                tokio::spawn(async move {
                    if let Err(e) = sweep.wait().await {
                        log::warn!("Failed to stop services: {}", e);
                    }
                });
            }
        }
    }
}

async fn drive(manager: &Manager, mode: RunMode) -> Result<(), ManagerError> {
    let joined = |phase: ManagerPhase| {
        let name = manager.name().to_string();
        move |source| ManagerError::Phase {
            manager: name,
            phase,
            source,
        }
    };

    match mode {
        RunMode::Run => manager.run(None).await,
        RunMode::RunSerial => manager.run_serial(None, None).await,
        RunMode::RunEach => manager
            .run_each(None)
            .wait()
            .await
            .map_err(joined(ManagerPhase::Run)),
        RunMode::Prepare => manager
            .prepare(None)
            .wait()
            .await
            .map_err(joined(ManagerPhase::Prepare)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("run"), Ok(RunMode::Run));
        assert_eq!(parse_mode("Run-Each"), Ok(RunMode::RunEach));
        assert_eq!(parse_mode("serial"), Ok(RunMode::RunSerial));
        assert_eq!(parse_mode("prepare"), Ok(RunMode::Prepare));
    }

    #[test]
    fn test_parse_mode_invalid() {
        let result = parse_mode("sideways");
        assert!(result.unwrap_err().contains("sideways"));
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in [RunMode::Run, RunMode::RunEach, RunMode::RunSerial, RunMode::Prepare] {
            assert_eq!(parse_mode(&mode.to_string()), Ok(mode));
        }
    }

    #[test]
    fn test_args_defaults() {
        let args = OrchestraArgs::from_args(&["orchestra"], &[]).unwrap();
        assert_eq!(args.file, "orchestra.yaml");
        assert_eq!(args.mode, RunMode::Run);
        assert!(!args.validate);
        assert_eq!(args.log_filter(), "info");
    }

    #[test]
    fn test_args_parse() {
        let args = OrchestraArgs::from_args(
            &["orchestra"],
            &["stack.yaml", "--mode", "run-serial", "-l", "DEBUG", "--no-color"],
        )
        .unwrap();
        assert_eq!(args.file, "stack.yaml");
        assert_eq!(args.mode, RunMode::RunSerial);
        assert!(args.no_color);
        assert_eq!(args.log_filter(), "debug");
    }

    #[cfg(unix)]
    mod interrupt {
        use super::*;
        use crate::service::{Callbacks, CommandSpec, EnhancedService, ShellService, Status};
        use std::sync::Arc;
        use std::time::Duration;

        fn add(manager: &Manager, service: ShellService) -> EnhancedService {
            manager.add_service(Arc::new(service), Callbacks::default())
        }

        async fn wait_for(service: &EnhancedService, status: Status) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while service.status() != status {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("'{}' never reached {}", service.name(), status));
        }

        fn spawn_orchestrate(
            manager: &Manager,
            mode: RunMode,
        ) -> (
            watch::Sender<u32>,
            tokio::task::JoinHandle<Result<(), CliError>>,
        ) {
            let (tx, rx) = watch::channel(0u32);
            let manager = manager.clone();
            let work = tokio::spawn(async move { orchestrate(&manager, mode, rx).await });
            (tx, work)
        }

        #[tokio::test]
        async fn test_interrupt_ends_run_serial() {
            let manager = Manager::new("serial");
            let first = add(
                &manager,
                ShellService::new("first").with_main(CommandSpec::shell("sleep 30")),
            );
            let second = add(
                &manager,
                ShellService::new("second").with_main(CommandSpec::shell("sleep 30")),
            );

            let (interrupts, work) = spawn_orchestrate(&manager, RunMode::RunSerial);
            wait_for(&first, Status::Running).await;
            interrupts.send_modify(|count| *count += 1);

            let result = tokio::time::timeout(Duration::from_secs(5), work)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(CliError::Interrupted)));
            assert_eq!(first.status(), Status::Stopped);
            assert_eq!(second.status(), Status::Ready);
        }

        #[tokio::test]
        async fn test_interrupt_during_prepare_starts_nothing() {
            let manager = Manager::new("run");
            let slow = add(
                &manager,
                ShellService::new("slow")
                    .with_prepare(CommandSpec::shell("sleep 30"))
                    .with_main(CommandSpec::shell("sleep 30")),
            );
            let ready = add(
                &manager,
                ShellService::new("ready").with_main(CommandSpec::shell("sleep 30")),
            );

            let (interrupts, work) = spawn_orchestrate(&manager, RunMode::Run);
            wait_for(&slow, Status::Preparing).await;
            wait_for(&ready, Status::Ready).await;
            interrupts.send_modify(|count| *count += 1);

            let result = tokio::time::timeout(Duration::from_secs(5), work)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(CliError::Interrupted)));
            assert_eq!(slow.status(), Status::PrepareAborted);
            assert_eq!(ready.status(), Status::Ready);
        }
    }
}
