// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! systemd unit-file backend
//!
//! Every failure surfaces as `ServiceRegistration`, which the run treats as
//! non-fatal once the binary itself was swapped correctly.

use super::{ReconcileOutcome, ServiceBackend, ServiceDescriptor, ServiceRegistrationState};
use crate::command::{CommandRunner, describe_output};
use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};

const SYSTEMCTL: &str = "systemctl";
const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

#[derive(Debug)]
pub struct SystemdBackend<R> {
    runner: R,
    unit_dir: PathBuf,
}

impl<R: CommandRunner> SystemdBackend<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
        }
    }

    #[must_use]
    pub fn with_unit_dir(mut self, unit_dir: impl Into<PathBuf>) -> Self {
        self.unit_dir = unit_dir.into();
        self
    }

    pub fn unit_path(&self, service: &ServiceDescriptor) -> PathBuf {
        self.unit_dir.join(unit_name(service))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<std::process::Output> {
        self.runner
            .run(SYSTEMCTL, args)
            .await
            .map_err(|e| AgentError::ServiceRegistration(e.to_string()))
    }

    async fn systemctl_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.systemctl(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::ServiceRegistration(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                describe_output(&output)
            )))
        }
    }

    fn write_unit(&self, service: &ServiceDescriptor) -> Result<()> {
        let path = self.unit_path(service);
        write_atomic(&path, &render_unit(service)).map_err(|e| {
            AgentError::ServiceRegistration(format!("writing {}: {e}", path.display()))
        })?;
        tracing::debug!(unit = %path.display(), "Unit file written");
        Ok(())
    }
}

impl<R: CommandRunner> ServiceBackend for SystemdBackend<R> {
    async fn observe(&self, service: &ServiceDescriptor) -> Result<ServiceRegistrationState> {
        let unit = unit_name(service);
        let output = self
            .systemctl(&["show", &unit, "--property=LoadState,ActiveState"])
            .await?;
        if !output.status.success() {
            return Err(AgentError::ServiceRegistration(format!(
                "systemctl show {unit} failed: {}",
                describe_output(&output)
            )));
        }
        Ok(parse_show(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn stop(&self, service: &ServiceDescriptor) -> Result<()> {
        self.systemctl_ok(&["stop", &unit_name(service)]).await
    }

    async fn reconcile(&self, service: &ServiceDescriptor) -> Result<ReconcileOutcome> {
        let unit = unit_name(service);
        // Observed before the unit is rewritten, which would make it "loaded".
        let state = self.observe(service).await?;
        tracing::info!(%unit, ?state, "Reconciling systemd unit");

        self.write_unit(service)?;
        self.systemctl_ok(&["daemon-reload"]).await?;
        self.systemctl_ok(&["enable", &unit]).await?;

        match state {
            ServiceRegistrationState::Absent | ServiceRegistrationState::InstalledStopped => {
                self.systemctl_ok(&["start", &unit]).await?;
            }
            ServiceRegistrationState::InstalledRunning => {
                self.systemctl_ok(&["restart", &unit]).await?;
            }
        }

        let output = self.systemctl(&["is-active", &unit]).await?;
        let active = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if matches!(active.as_str(), "active" | "activating" | "reloading") {
            tracing::info!(%unit, "Service is running");
            Ok(ReconcileOutcome::Running)
        } else {
            Err(AgentError::ServiceRegistration(format!(
                "{unit} is {active} after start"
            )))
        }
    }
}

fn unit_name(service: &ServiceDescriptor) -> String {
    format!("{}.service", service.name)
}

fn parse_show(output: &str) -> ServiceRegistrationState {
    let mut load_state = "";
    let mut active_state = "";
    for line in output.lines() {
        if let Some(v) = line.strip_prefix("LoadState=") {
            load_state = v.trim();
        } else if let Some(v) = line.strip_prefix("ActiveState=") {
            active_state = v.trim();
        }
    }

    if load_state.is_empty() || load_state == "not-found" {
        ServiceRegistrationState::Absent
    } else if matches!(active_state, "active" | "activating" | "reloading") {
        ServiceRegistrationState::InstalledRunning
    } else {
        ServiceRegistrationState::InstalledStopped
    }
}

/// Quote a word for an `ExecStart=` line.
fn exec_word(word: &str) -> String {
    let escaped = word.replace('%', "%%");
    if !escaped.is_empty()
        && !escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'))
    {
        return escaped;
    }
    let mut quoted = String::with_capacity(escaped.len() + 2);
    quoted.push('"');
    for c in escaped.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

pub fn render_unit(service: &ServiceDescriptor) -> String {
    let mut exec = exec_word(&service.executable_path.to_string_lossy());
    for arg in &service.args {
        exec.push(' ');
        exec.push_str(&exec_word(arg));
    }

    format!(
        "[Unit]
Description={description}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={exec}
Restart=always
RestartSec={restart_secs}

[Install]
WantedBy=multi-user.target
",
        description = service.description,
        restart_secs = service.restart_policy.delay.as_secs(),
    )
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("service.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}
