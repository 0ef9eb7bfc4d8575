// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Service reconciliation: one contract, a backend per host supervisor

pub mod systemd;
pub mod task_xml;
pub mod windows;

use crate::command::CommandRunner;
use crate::config::AgentConfig;
use crate::error::Result;
use std::path::PathBuf;
use std::time::Duration;

pub use systemd::SystemdBackend;
pub use windows::{RegistrationEvent, RegistrationPhase, WindowsBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Backoff before the supervisor restarts a crashed service
    pub delay: Duration,
    /// Restart attempts for the scheduled-task fallback
    pub max_restarts: u32,
    pub restart_interval: Duration,
}

/// Logical identity of the registered service, re-derived every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    pub restart_policy: RestartPolicy,
    /// How long a freshly started service gets to report running
    pub start_timeout: Duration,
}

impl ServiceDescriptor {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            name: config.service_name.clone(),
            display_name: config.display_name.clone(),
            description: config.description.clone(),
            executable_path: config.install_path.clone(),
            args: config.service_args.clone(),
            restart_policy: RestartPolicy {
                delay: Duration::from_secs(config.restart_delay_secs),
                max_restarts: config.task_restart_count,
                restart_interval: Duration::from_secs(config.task_restart_interval_secs),
            },
            start_timeout: Duration::from_secs(config.service_start_timeout_secs),
        }
    }
}

/// Registration state as observed from the host supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRegistrationState {
    Absent,
    InstalledStopped,
    InstalledRunning,
}

/// Terminal state of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Unit-file supervisor reports the service active
    Running,
    RunningAsService,
    RunningAsScheduledTask,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::RunningAsService => "running as service",
            Self::RunningAsScheduledTask => "running as scheduled task",
        };
        f.write_str(s)
    }
}

/// Brings the host's registration of one service into the running state.
#[expect(async_fn_in_trait)]
pub trait ServiceBackend {
    async fn observe(&self, service: &ServiceDescriptor) -> Result<ServiceRegistrationState>;

    /// Ask the supervisor to stop the service.
    async fn stop(&self, service: &ServiceDescriptor) -> Result<()>;

    /// Install, enable and (re)start the service.
    async fn reconcile(&self, service: &ServiceDescriptor) -> Result<ReconcileOutcome>;
}

/// The backend matching the host this agent was built for.
#[derive(Debug)]
pub enum HostBackend<R> {
    Systemd(SystemdBackend<R>),
    Windows(WindowsBackend<R>),
}

impl<R: CommandRunner> HostBackend<R> {
    pub fn for_host(runner: R) -> Self {
        if cfg!(windows) {
            Self::Windows(WindowsBackend::new(runner))
        } else {
            Self::Systemd(SystemdBackend::new(runner))
        }
    }
}

impl<R: CommandRunner> ServiceBackend for HostBackend<R> {
    async fn observe(&self, service: &ServiceDescriptor) -> Result<ServiceRegistrationState> {
        match self {
            Self::Systemd(b) => b.observe(service).await,
            Self::Windows(b) => b.observe(service).await,
        }
    }

    async fn stop(&self, service: &ServiceDescriptor) -> Result<()> {
        match self {
            Self::Systemd(b) => b.stop(service).await,
            Self::Windows(b) => b.stop(service).await,
        }
    }

    async fn reconcile(&self, service: &ServiceDescriptor) -> Result<ReconcileOutcome> {
        match self {
            Self::Systemd(b) => b.reconcile(service).await,
            Self::Windows(b) => b.reconcile(service).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_config() {
        let config = AgentConfig {
            service_name: "rt".to_owned(),
            service_args: vec!["--port".to_owned(), "9001".to_owned()],
            restart_delay_secs: 7,
            task_restart_count: 4,
            task_restart_interval_secs: 120,
            service_start_timeout_secs: 15,
            ..Default::default()
        };
        let service = ServiceDescriptor::from_config(&config);

        assert_eq!(service.name, "rt");
        assert_eq!(service.executable_path, config.install_path);
        assert_eq!(service.args, vec!["--port", "9001"]);
        assert_eq!(service.restart_policy.delay, Duration::from_secs(7));
        assert_eq!(service.restart_policy.max_restarts, 4);
        assert_eq!(service.restart_policy.restart_interval, Duration::from_secs(120));
        assert_eq!(service.start_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_host_backend_matches_platform() {
        let backend = HostBackend::for_host(crate::command::TokioCommandRunner::default());
        if cfg!(windows) {
            assert!(matches!(backend, HostBackend::Windows(_)));
        } else {
            assert!(matches!(backend, HostBackend::Systemd(_)));
        }
    }
}
