use anyhow::{Context, Result};
use responder_common::{duration_serde, ActionDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod validation;

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionManagerConfig {
    /// Ceiling on running + reserved command actions.
    #[serde(default = "default_max_running_command_actions")]
    pub max_running_command_actions: usize,

    #[serde(default)]
    pub resident_host: ResidentHostConfig,

    /// Where resident pipe pairs are created. Defaults to the OS temp dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_directory: Option<PathBuf>,

    /// PATH for every spawned action process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_override: Option<String>,

    /// LD_LIBRARY_PATH for every spawned action process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld_library_path_override: Option<String>,

    /// Passed to the session collaborator; zero means no expiry.
    #[serde(default, with = "duration_serde")]
    pub session_timeout: Duration,

    #[serde(default = "default_reap_interval", with = "duration_serde")]
    pub reap_interval: Duration,

    /// Static action definitions, served by the daemon's query layer.
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

/// How the counterpart process of resident actions is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidentHostConfig {
    #[serde(default = "default_resident_host_path")]
    pub executable_path: String,

    /// Placed between the executable and `--pipe <path>`.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ResidentHostConfig {
    fn default() -> Self {
        Self {
            executable_path: default_resident_host_path(),
            args: Vec::new(),
        }
    }
}

impl Default for ActionManagerConfig {
    fn default() -> Self {
        Self {
            max_running_command_actions: default_max_running_command_actions(),
            resident_host: ResidentHostConfig::default(),
            pipe_directory: None,
            path_override: None,
            ld_library_path_override: None,
            session_timeout: Duration::ZERO,
            reap_interval: default_reap_interval(),
            actions: Vec::new(),
        }
    }
}

impl ActionManagerConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: ActionManagerConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    pub fn pipe_directory(&self) -> PathBuf {
        self.pipe_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn default_max_running_command_actions() -> usize {
    10
}

fn default_resident_host_path() -> String {
    "responder-resident-host".to_string()
}

fn default_reap_interval() -> Duration {
    responder_supervisor::DEFAULT_REAP_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use responder_common::{ActionId, ActionKind, UserId};

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ActionManagerConfig::load_from_string("{}").unwrap();
        assert_eq!(config.max_running_command_actions, 10);
        assert_eq!(config.resident_host.executable_path, "responder-resident-host");
        assert_eq!(config.reap_interval, Duration::from_millis(10));
        assert_eq!(config.session_timeout, Duration::ZERO);
        assert_eq!(config.pipe_directory(), std::env::temp_dir());
        assert!(config.actions.is_empty());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
max_running_command_actions: 2
resident_host:
  executable_path: /usr/libexec/responder-resident-host
  args: ["--debug"]
pipe_directory: /run/responder
path_override: /usr/bin:/bin
ld_library_path_override: /opt/lib
session_timeout: 5m
reap_interval: 50ms
actions:
  - id: 1
    kind: command
    command: "/usr/local/bin/notify --loud"
    timeout: 30s
    owner: 1000
    condition:
      enabled: 1
      server_id: 3
  - id: 2
    kind: incident-sender
    command: "7:urgent"
    owner: 0
"#;
        let config = ActionManagerConfig::load_from_string(yaml).unwrap();
        assert_eq!(config.max_running_command_actions, 2);
        assert_eq!(config.resident_host.args, vec!["--debug".to_string()]);
        assert_eq!(config.pipe_directory(), PathBuf::from("/run/responder"));
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.reap_interval, Duration::from_millis(50));
        assert_eq!(config.actions.len(), 2);
        assert_eq!(config.actions[0].id, ActionId(1));
        assert_eq!(config.actions[0].timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.actions[1].kind, ActionKind::IncidentSender);
        assert_eq!(config.actions[1].owner, UserId::SYSTEM);
        assert_eq!(config.actions[1].timeout(), None);
    }

    #[test]
    fn test_bad_yaml_is_reported() {
        let err = ActionManagerConfig::load_from_string("max_running_command_actions: [").unwrap_err();
        assert!(err.to_string().contains("Failed to parse YAML configuration"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = ActionManagerConfig::load_from_file("/nonexistent/responder.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
