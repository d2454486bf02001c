//! Orchestra file YAML schema definitions

use crate::palette::ColorCycle;
use crate::service::{CommandSpec, ShellService};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root orchestra file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestraFile {
    /// Orchestra file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Environment variables (applied to all services)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Service definitions (ordered map for deterministic run order)
    pub services: IndexMap<String, ServiceConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Commands run before the service can start
    #[serde(default)]
    pub prepare: Option<Commands>,

    /// Commands of the service itself
    #[serde(default)]
    pub start: Option<Commands>,

    /// Run several start commands at once instead of one after another
    #[serde(default)]
    pub parallel: bool,

    /// Environment variables specific to this service
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the service commands
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Commands of a phase: a shell line, an argv list, or a list of entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Commands {
    Shell(String),
    Argv(Vec<String>),
    Many(Vec<CommandEntry>),
}

/// One entry of a command list; exactly one field must be set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEntry {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub argv: Option<Vec<String>>,
}

impl Commands {
    /// Convert to command specs. Entries must have been validated.
    pub fn to_specs(&self) -> Vec<CommandSpec> {
        match self {
            Commands::Shell(line) => vec![CommandSpec::shell(line.clone())],
            Commands::Argv(argv) => vec![CommandSpec::argv(argv.clone())],
            Commands::Many(entries) => entries
                .iter()
                .filter_map(|entry| match (&entry.shell, &entry.argv) {
                    (Some(line), None) => Some(CommandSpec::shell(line.clone())),
                    (None, Some(argv)) => Some(CommandSpec::argv(argv.clone())),
                    _ => None,
                })
                .collect(),
        }
    }

    fn validate(&self, service: &str, phase: &str) -> Result<(), OrchestraFileError> {
        let invalid = |reason: &str| {
            Err(OrchestraFileError::Validation(format!(
                "Service '{}': {} {}",
                service, phase, reason
            )))
        };

        match self {
            Commands::Shell(line) if line.trim().is_empty() => invalid("command is empty"),
            Commands::Argv(argv) if argv.is_empty() => invalid("command is empty"),
            Commands::Many(entries) if entries.is_empty() => invalid("command list is empty"),
            Commands::Many(entries) => {
                for entry in entries {
                    match (&entry.shell, &entry.argv) {
                        (Some(line), None) if !line.trim().is_empty() => {}
                        (None, Some(argv)) if !argv.is_empty() => {}
                        (Some(_), Some(_)) => {
                            return invalid("entry cannot specify both 'shell' and 'argv'")
                        }
                        (None, None) => return invalid("entry must specify 'shell' or 'argv'"),
                        _ => return invalid("command is empty"),
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl OrchestraFile {
    /// Load orchestra file from a YAML file
    pub fn from_file(path: &str) -> Result<Self, OrchestraFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| OrchestraFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse orchestra file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, OrchestraFileError> {
        let file: OrchestraFile = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// Validate the orchestra file configuration
    pub fn validate(&self) -> Result<(), OrchestraFileError> {
        if self.services.is_empty() {
            return Err(OrchestraFileError::Validation(
                "At least one service must be defined".to_string(),
            ));
        }

        for (name, service) in &self.services {
            if name.trim().is_empty() {
                return Err(OrchestraFileError::Validation(
                    "Service names cannot be empty".to_string(),
                ));
            }
            if let Some(prepare) = &service.prepare {
                prepare.validate(name, "prepare")?;
            }
            if let Some(start) = &service.start {
                start.validate(name, "start")?;
            }
        }

        Ok(())
    }

    /// Build one shell service per definition, in file order.
    ///
    /// Each service gets the next color of `colors` as its output label.
    pub fn shell_services(&self, colors: Option<&ColorCycle>) -> Vec<ShellService> {
        self.services
            .iter()
            .map(|(name, config)| {
                let mut env = self.env.clone();
                env.extend(config.env.clone());

                let mut service = ShellService::new(name.clone())
                    .with_parallel(config.parallel)
                    .with_env(env);

                for command in config.prepare.iter().flat_map(Commands::to_specs) {
                    service = service.with_prepare(command);
                }
                for command in config.start.iter().flat_map(Commands::to_specs) {
                    service = service.with_main(command);
                }
                if let Some(dir) = &config.working_dir {
                    service = service.with_working_dir(dir);
                }
                if let Some(colors) = colors {
                    service = service.with_label(colors.paint(name));
                }
                service
            })
            .collect()
    }
}

/// Errors that can occur when loading an orchestra file
#[derive(Debug, thiserror::Error)]
pub enum OrchestraFileError {
    #[error("Failed to read orchestra file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse orchestra file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_command_forms() {
        let yaml = r#"
version: "1.0"
env:
  LEVEL: info
services:
  db:
    start: "postgres -D data"
  api:
    prepare: ["cargo", "build"]
    start:
      - shell: "./api --port 8080"
      - argv: ["./worker", "--queue", "jobs"]
    parallel: true
    env:
      PORT: "8080"
    working_dir: services/api
"#;
        let file = OrchestraFile::from_yaml(yaml).unwrap();
        let names: Vec<&String> = file.services.keys().collect();
        assert_eq!(names, ["db", "api"]);

        let api = &file.services["api"];
        assert!(api.parallel);
        assert!(matches!(api.prepare, Some(Commands::Argv(ref argv)) if argv.len() == 2));

        let start = api.start.as_ref().unwrap().to_specs();
        assert_eq!(start[0], CommandSpec::shell("./api --port 8080"));
        assert_eq!(start[1], CommandSpec::argv(["./worker", "--queue", "jobs"]));
    }

    #[test]
    fn test_shell_services_merge_env() {
        let yaml = r#"
env:
  LEVEL: info
  PORT: "1"
services:
  api:
    prepare: "make"
    start: "./api"
    env:
      PORT: "8080"
  idle: {}
"#;
        let file = OrchestraFile::from_yaml(yaml).unwrap();
        let services = file.shell_services(None);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].prepare_commands(), [CommandSpec::shell("make")]);
        assert_eq!(services[0].main_commands(), [CommandSpec::shell("./api")]);
        assert!(services[1].prepare_commands().is_empty());
        assert!(services[1].main_commands().is_empty());
    }

    #[test]
    fn test_validation_empty_command() {
        let yaml = r#"
services:
  bad:
    start: "  "
"#;
        let err = OrchestraFile::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, OrchestraFileError::Validation(ref msg) if msg.contains("bad")));
    }

    #[test]
    fn test_validation_ambiguous_entry() {
        let yaml = r#"
services:
  bad:
    start:
      - shell: "a"
        argv: ["b"]
"#;
        assert!(matches!(
            OrchestraFile::from_yaml(yaml),
            Err(OrchestraFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_no_services() {
        assert!(OrchestraFile::from_yaml("services: {}").is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            OrchestraFile::from_yaml("services: [1, 2"),
            Err(OrchestraFileError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "services:\n  one:\n    start: \"true\"").unwrap();

        let loaded = OrchestraFile::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.version, "1.0");
        assert!(loaded.services.contains_key("one"));

        let missing = OrchestraFile::from_file("/nonexistent/orchestra.yaml");
        assert!(matches!(missing, Err(OrchestraFileError::Io { .. })));
    }
}
