//! Generic service running system commands

use super::status::Phase;
use super::{BoxError, Service};
use crate::runtime::{ExitInfo, Process, ProcessConfig};
use crate::step::{ParallelStep, ProcessStep, SerialStep, Step, StepCallback};
use std::collections::HashMap;
use std::path::PathBuf;

/// One command of a service phase
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    /// Executable and its arguments
    pub command: Vec<String>,
    /// Run the joined command line through the platform shell
    pub shell: bool,
}

impl CommandSpec {
    /// Command line run through the shell
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self {
            command: vec![command_line.into()],
            shell: true,
        }
    }

    /// Executable with arguments, run directly
    pub fn argv<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            shell: false,
        }
    }

    fn process_config(&self, name: String) -> Result<ProcessConfig, ShellServiceError> {
        let (executable, args) = self
            .command
            .split_first()
            .ok_or_else(|| ShellServiceError::EmptyCommand(name.clone()))?;

        let config = if self.shell {
            ProcessConfig::shell(name, self.command.join(" "))
        } else {
            ProcessConfig::new(name, executable.clone()).with_args(args.iter().cloned())
        };
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShellServiceError {
    #[error("Process '{0}' has an empty command")]
    EmptyCommand(String),
}

/// Service whose phases are system commands.
///
/// A phase without commands has nothing to do and ends immediately. Several
/// prepare commands run one after another; several main commands run one
/// after another, or all at once when the service is parallel.
#[derive(Debug, Clone, Default)]
pub struct ShellService {
    name: String,
    prepare: Vec<CommandSpec>,
    main: Vec<CommandSpec>,
    parallel: bool,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    label: Option<String>,
}

impl ShellService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a prepare command
    pub fn with_prepare(mut self, command: CommandSpec) -> Self {
        self.prepare.push(command);
        self
    }

    /// Append a main command
    pub fn with_main(mut self, command: CommandSpec) -> Self {
        self.main.push(command);
        self
    }

    /// Run the main commands concurrently
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Prefix of forwarded output lines, e.g. a colored name
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn prepare_commands(&self) -> &[CommandSpec] {
        &self.prepare
    }

    pub fn main_commands(&self) -> &[CommandSpec] {
        &self.main
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn processes(
        &self,
        phase: Phase,
        commands: &[CommandSpec],
    ) -> Result<Vec<Process>, ShellServiceError> {
        commands
            .iter()
            .enumerate()
            .map(|(index, command)| -> Result<Process, ShellServiceError> {
                let name = match (phase, commands.len()) {
                    (Phase::Main, 1) => self.name.clone(),
                    (_, 1) => format!("{}:{}", self.name, phase),
                    _ => format!("{}:{}#{}", self.name, phase, index + 1),
                };

                let mut config = command
                    .process_config(name)?
                    .with_env(self.env.clone());
                if let Some(dir) = &self.working_dir {
                    config = config.with_working_dir(dir.clone());
                }
                if let Some(label) = &self.label {
                    config = config.with_label(label.clone());
                }
                Ok(Process::new(config))
            })
            .collect()
    }

    fn step(
        &self,
        phase: Phase,
        commands: &[CommandSpec],
        parallel: bool,
        on_exit: StepCallback,
    ) -> Result<Option<Box<dyn Step>>, BoxError> {
        let mut processes = self.processes(phase, commands)?;

        let step: Box<dyn Step> = match processes.len() {
            0 => {
                on_exit(&Ok(ExitInfo::default()));
                return Ok(None);
            }
            1 => {
                let process = processes.remove(0);
                // Spawn failures of a single command are reported right away
                process.start()?;
                log::info!("[{}] Running: {}", self.name, process.config().command_line());
                Box::new(ProcessStep::new(process, Some(on_exit)))
            }
            _ if parallel => Box::new(ParallelStep::new(processes, Some(on_exit))),
            _ => Box::new(SerialStep::new(processes, Some(on_exit))),
        };
        Ok(Some(step))
    }
}

impl Service for ShellService {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError> {
        self.step(Phase::Prepare, &self.prepare, false, on_exit)
    }

    fn start(&self, on_exit: StepCallback) -> Result<Option<Box<dyn Step>>, BoxError> {
        self.step(Phase::Main, &self.main, self.parallel, on_exit)
    }
}
