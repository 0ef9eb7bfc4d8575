// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Configuration module for the agent

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_REPOSITORY: &str = "hexput/hexput-runtime";
const DEFAULT_SERVICE_NAME: &str = "hexput-runtime";

fn default_repository() -> String {
    DEFAULT_REPOSITORY.to_owned()
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_owned()
}

fn default_display_name() -> String {
    "Hexput Runtime".to_owned()
}

fn default_description() -> String {
    "Hexput AST runtime WebSocket server".to_owned()
}

fn default_install_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\Hexput\hexput-runtime.exe")
    } else {
        PathBuf::from("/usr/local/bin/hexput-runtime")
    }
}

fn default_marker_path() -> PathBuf {
    agent_data_dir().join("version")
}

fn default_lock_path() -> PathBuf {
    agent_data_dir().join("agent.lock")
}

fn default_5() -> u64 {
    5
}

fn default_3() -> u32 {
    3
}

fn default_60() -> u64 {
    60
}

fn default_500() -> u64 {
    500
}

fn default_10() -> u32 {
    10
}

fn default_start_timeout() -> u64 {
    10
}

fn default_max_artifact_bytes() -> u64 {
    256 * 1024 * 1024
}

/// Directory holding agent-owned state, deliberately outside the install dir.
pub fn agent_data_dir() -> PathBuf {
    if cfg!(windows) {
        let program_data =
            std::env::var_os("ProgramData").unwrap_or_else(|| r"C:\ProgramData".into());
        PathBuf::from(program_data).join("hexput-agent")
    } else {
        PathBuf::from("/var/lib/hexput-agent")
    }
}

/// Default location of the JSON config file.
pub fn default_config_path() -> PathBuf {
    if cfg!(windows) {
        agent_data_dir().join("config.json")
    } else {
        PathBuf::from("/etc/hexput-agent/config.json")
    }
}

/// Architecture tag release assets are matched against, e.g. `linux-x86_64`.
pub fn host_arch_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Release repository as `owner/name`
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Custom API base URL for testing (overrides default GitHub API)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// GitHub token, falls back to `GITHUB_TOKEN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    /// Overrides the host architecture tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch_tag: Option<String>,

    /// Where the service binary lives
    #[serde(default = "default_install_path")]
    pub install_path: PathBuf,

    /// Where downloads are staged; defaults to the install directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,

    /// Last successfully installed version
    #[serde(default = "default_marker_path")]
    pub marker_path: PathBuf,

    /// Held for the duration of a run
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_display_name")]
    pub display_name: String,

    #[serde(default = "default_description")]
    pub description: String,

    /// Arguments passed to the service binary
    #[serde(default)]
    pub service_args: Vec<String>,

    /// Supervisor restart backoff (seconds)
    #[serde(default = "default_5")]
    pub restart_delay_secs: u64,

    /// Restart attempts for the fallback scheduled task
    #[serde(default = "default_3")]
    pub task_restart_count: u32,

    /// Interval between fallback task restarts (seconds)
    #[serde(default = "default_60")]
    pub task_restart_interval_secs: u64,

    #[serde(default = "default_500")]
    pub stop_poll_interval_ms: u64,

    #[serde(default = "default_10")]
    pub stop_poll_attempts: u32,

    /// How long a native Windows service gets to report RUNNING
    #[serde(default = "default_start_timeout")]
    pub service_start_timeout_secs: u64,

    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Treat a release without a version tag as fatal
    #[serde(default)]
    pub require_remote_version: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            api_base_url: None,
            github_token: None,
            arch_tag: None,
            install_path: default_install_path(),
            scratch_dir: None,
            marker_path: default_marker_path(),
            lock_path: default_lock_path(),
            service_name: default_service_name(),
            display_name: default_display_name(),
            description: default_description(),
            service_args: Vec::new(),
            restart_delay_secs: 5,
            task_restart_count: 3,
            task_restart_interval_secs: 60,
            stop_poll_interval_ms: 500,
            stop_poll_attempts: 10,
            service_start_timeout_secs: 10,
            max_artifact_bytes: default_max_artifact_bytes(),
            require_remote_version: false,
        }
    }
}

impl AgentConfig {
    pub fn arch_tag(&self) -> String {
        self.arch_tag.clone().unwrap_or_else(host_arch_tag)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| {
            self.install_path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }

    pub fn validate(&self) -> Result<()> {
        let mut parts = self.repository.split('/');
        let valid_repo = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !valid_repo {
            return Err(AgentError::Config(format!(
                "repository must be 'owner/name', got '{}'",
                self.repository
            )));
        }
        if !self.install_path.is_absolute() {
            return Err(AgentError::Config(format!(
                "install_path must be absolute: {}",
                self.install_path.display()
            )));
        }
        if self.install_path.file_name().is_none() {
            return Err(AgentError::Config("install_path has no file name".to_owned()));
        }
        if self.service_name.trim().is_empty() {
            return Err(AgentError::Config("service_name is empty".to_owned()));
        }
        if self.stop_poll_attempts == 0 {
            return Err(AgentError::Config(
                "stop_poll_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            AgentError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?
    } else {
        tracing::info!(path = %path.display(), "No config file, using defaults");
        AgentConfig::default()
    };

    if config.github_token.is_none() {
        config.github_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.repository, "hexput/hexput-runtime");
        assert_eq!(config.service_name, "hexput-runtime");
        assert_eq!(config.restart_delay_secs, 5);
        assert_eq!(config.stop_poll_interval_ms, 500);
        assert_eq!(config.stop_poll_attempts, 10);
        assert_eq!(config.service_start_timeout_secs, 10);
        assert!(!config.require_remote_version);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_marker_lives_outside_install_dir() {
        let config = AgentConfig::default();
        let install_dir = config.install_path.parent().unwrap();
        assert!(!config.marker_path.starts_with(install_dir));
    }

    #[test]
    fn test_scratch_dir_defaults_to_install_parent() {
        let config = AgentConfig {
            install_path: PathBuf::from("/opt/hexput/bin/hexput-runtime"),
            ..Default::default()
        };
        assert_eq!(config.scratch_dir(), PathBuf::from("/opt/hexput/bin"));
    }

    #[test]
    fn test_arch_tag_override() {
        let config = AgentConfig {
            arch_tag: Some("linux-armv7".to_owned()),
            ..Default::default()
        };
        assert_eq!(config.arch_tag(), "linux-armv7");
        assert_eq!(AgentConfig::default().arch_tag(), host_arch_tag());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            r#"{"repository": "acme/runtime", "service_args": ["--port", "9001"]}"#,
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.repository, "acme/runtime");
        assert_eq!(config.service_args, vec!["--port", "9001"]);
        assert_eq!(config.task_restart_count, 3);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.repository, DEFAULT_REPOSITORY);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "{not json").unwrap();
        assert!(matches!(
            load_config(temp_file.path()),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_repository() {
        for repo in ["", "justname", "a/b/c", "/name", "owner/"] {
            let config = AgentConfig {
                repository: repo.to_owned(),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted {repo:?}");
        }
    }

    #[test]
    fn test_validate_rejects_relative_install_path() {
        let config = AgentConfig {
            install_path: PathBuf::from("bin/hexput-runtime"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }
}
