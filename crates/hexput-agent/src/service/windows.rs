// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Windows Service Control Manager backend with a scheduled-task fallback
//!
//! The installed binary may not speak the service control protocol. The native
//! registration is tried first; when the service never reports RUNNING it is
//! torn down and a boot-time scheduled task launches the binary instead.

use super::{ReconcileOutcome, ServiceBackend, ServiceDescriptor, ServiceRegistrationState, task_xml};
use crate::command::{CommandRunner, describe_output};
use crate::error::{AgentError, Result};
use std::io::Write;
use std::process::Output;
use std::time::Duration;
use tokio::time::Instant;

const SC: &str = "sc.exe";
const SCHTASKS: &str = "schtasks.exe";

const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// SCM failure counter reset period (seconds)
const FAILURE_RESET_SECS: u64 = 86_400;

/// Progress of one Windows registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase {
    NativeAttempted,
    NativeConfirmed,
    FallbackAttempted,
    FallbackConfirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// The native service reported RUNNING within the window
    NativeRunning,
    /// Creating or starting the native service failed or timed out
    NativeFailed,
    /// The fallback task was registered and started
    FallbackRunning,
    FallbackFailed,
}

impl RegistrationPhase {
    pub fn next(self, event: RegistrationEvent) -> Self {
        use RegistrationEvent as E;
        match (self, event) {
            (Self::NativeAttempted, E::NativeRunning) => Self::NativeConfirmed,
            (Self::NativeAttempted, E::NativeFailed) => Self::FallbackAttempted,
            (Self::FallbackAttempted, E::FallbackRunning) => Self::FallbackConfirmed,
            (Self::FallbackAttempted, E::FallbackFailed) => Self::Failed,
            (phase, _) if phase.is_terminal() => phase,
            // out-of-order event
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::NativeConfirmed | Self::FallbackConfirmed | Self::Failed
        )
    }

    /// The successful outcome this phase stands for, if any.
    pub fn outcome(self) -> Option<ReconcileOutcome> {
        match self {
            Self::NativeConfirmed => Some(ReconcileOutcome::RunningAsService),
            Self::FallbackConfirmed => Some(ReconcileOutcome::RunningAsScheduledTask),
            Self::NativeAttempted | Self::FallbackAttempted | Self::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScState {
    Missing,
    Stopped,
    Running,
    /// START_PENDING, STOP_PENDING and friends
    Pending,
}

fn parse_sc_state(stdout: &str) -> ScState {
    let Some(state) = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("STATE"))
    else {
        return ScState::Pending;
    };
    if state.contains("RUNNING") {
        ScState::Running
    } else if state.contains("STOPPED") {
        ScState::Stopped
    } else {
        ScState::Pending
    }
}

/// sc.exe reports Win32 errors both as its exit code and as `FAILED <code>` on stdout.
fn sc_failed_with(output: &Output, code: i32) -> bool {
    output.status.code() == Some(code)
        || String::from_utf8_lossy(&output.stdout).contains(&format!("FAILED {code}"))
}

/// `"<exe>" args`, the form `sc create binPath=` expects.
fn bin_path(service: &ServiceDescriptor) -> String {
    let exe = format!("\"{}\"", service.executable_path.display());
    if service.args.is_empty() {
        exe
    } else {
        format!("{exe} {}", task_xml::command_line(&service.args))
    }
}

#[derive(Debug)]
pub struct WindowsBackend<R> {
    runner: R,
    poll_interval: Duration,
}

impl<R: CommandRunner> WindowsBackend<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            poll_interval: POLL_INTERVAL,
        }
    }

    async fn sc(&self, args: &[&str]) -> Result<Output> {
        self.runner.run(SC, args).await
    }

    async fn query(&self, name: &str) -> Result<ScState> {
        let output = self.sc(&["query", name]).await?;
        if sc_failed_with(&output, ERROR_SERVICE_DOES_NOT_EXIST) {
            return Ok(ScState::Missing);
        }
        if !output.status.success() {
            return Err(AgentError::Command(format!(
                "sc query {name} failed: {}",
                describe_output(&output)
            )));
        }
        Ok(parse_sc_state(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Poll `sc query` until `done` holds or `deadline` passes.
    async fn wait_for(&self, name: &str, deadline: Instant, done: fn(ScState) -> bool) -> bool {
        loop {
            match self.query(name).await {
                Ok(state) if done(state) => return true,
                Ok(state) => tracing::debug!(service = name, ?state, "Waiting for service"),
                Err(e) => tracing::debug!(service = name, "Service query failed: {e}"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// `Some(running)` when a scheduled task with this name exists.
    async fn task_status(&self, name: &str) -> Option<bool> {
        let output = self
            .runner
            .run(SCHTASKS, &["/Query", "/TN", name, "/FO", "LIST"])
            .await
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).contains("Running"))
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        let output = self.sc(&["stop", name]).await?;
        if output.status.success() || sc_failed_with(&output, ERROR_SERVICE_NOT_ACTIVE) {
            Ok(())
        } else {
            Err(AgentError::Command(format!(
                "sc stop {name} failed: {}",
                describe_output(&output)
            )))
        }
    }

    /// Stop and delete any service registered under this name.
    async fn remove_service(&self, service: &ServiceDescriptor) -> Result<()> {
        let name = service.name.as_str();
        match self.query(name).await? {
            ScState::Missing => return Ok(()),
            ScState::Stopped => {}
            ScState::Running | ScState::Pending => {
                self.stop_service(name).await?;
                if !self
                    .wait_for(name, Instant::now() + service.start_timeout, |s| {
                        matches!(s, ScState::Stopped | ScState::Missing)
                    })
                    .await
                {
                    tracing::warn!(service = name, "Service did not stop before deletion");
                }
            }
        }

        let output = self.sc(&["delete", name]).await?;
        if output.status.success() || sc_failed_with(&output, ERROR_SERVICE_DOES_NOT_EXIST) {
            tracing::info!(service = name, "Removed existing service registration");
            Ok(())
        } else {
            Err(AgentError::Command(format!(
                "sc delete {name} failed: {}",
                describe_output(&output)
            )))
        }
    }

    async fn remove_fallback_task(&self, name: &str) {
        if self.task_status(name).await.is_none() {
            return;
        }
        match self.runner.run(SCHTASKS, &["/End", "/TN", name]).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                task = name,
                "Failed to end fallback task: {}",
                describe_output(&output)
            ),
            Err(e) => tracing::warn!(task = name, "Failed to end fallback task: {e}"),
        }
        match self.runner.run(SCHTASKS, &["/Delete", "/TN", name, "/F"]).await {
            Ok(output) if output.status.success() => {
                tracing::info!(task = name, "Removed previous fallback task");
            }
            Ok(output) => tracing::warn!(
                task = name,
                "Failed to delete fallback task: {}",
                describe_output(&output)
            ),
            Err(e) => tracing::warn!(task = name, "Failed to delete fallback task: {e}"),
        }
    }

    async fn try_native(&self, service: &ServiceDescriptor) -> Result<()> {
        let name = service.name.as_str();
        let native = |detail: String| AgentError::NativeServiceStart(format!("{name}: {detail}"));

        let bin = bin_path(service);
        let output = self
            .sc(&[
                "create",
                name,
                "binPath=",
                &bin,
                "start=",
                "auto",
                "DisplayName=",
                &service.display_name,
            ])
            .await
            .map_err(|e| native(e.to_string()))?;
        if !output.status.success() {
            return Err(native(format!("sc create failed: {}", describe_output(&output))));
        }
        tracing::info!(service = name, bin_path = %bin, "Service registered");

        if let Err(e) = self.sc(&["description", name, &service.description]).await {
            tracing::warn!(service = name, "Failed to set description: {e}");
        }
        let delay_ms = service.restart_policy.delay.as_millis().to_string();
        let actions = format!("restart/{delay_ms}/restart/{delay_ms}/restart/{delay_ms}");
        let reset = FAILURE_RESET_SECS.to_string();
        if let Err(e) = self
            .sc(&["failure", name, "reset=", &reset, "actions=", &actions])
            .await
        {
            tracing::warn!(service = name, "Failed to set recovery actions: {e}");
        }

        // start and confirmation share one window
        let deadline = Instant::now() + service.start_timeout;
        let output = self
            .runner
            .run_with_timeout(SC, &["start", name], service.start_timeout)
            .await
            .map_err(|e| native(e.to_string()))?;
        if !output.status.success() && !sc_failed_with(&output, ERROR_SERVICE_ALREADY_RUNNING) {
            return Err(native(format!("sc start failed: {}", describe_output(&output))));
        }

        if self
            .wait_for(name, deadline, |s| s == ScState::Running)
            .await
        {
            Ok(())
        } else {
            Err(native(format!(
                "not RUNNING within {}s",
                service.start_timeout.as_secs()
            )))
        }
    }

    async fn try_fallback(&self, service: &ServiceDescriptor) -> Result<()> {
        let name = service.name.as_str();
        let fallback = |detail: String| AgentError::FallbackRegistration(format!("{name}: {detail}"));

        let mut definition = tempfile::Builder::new()
            .prefix("hexput-task-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| fallback(e.to_string()))?;
        definition
            .write_all(&task_xml::encode_utf16le(&task_xml::render(service)))
            .and_then(|()| definition.flush())
            .map_err(|e| fallback(e.to_string()))?;
        let xml_path = definition.path().to_string_lossy().into_owned();

        let output = self
            .runner
            .run(SCHTASKS, &["/Create", "/TN", name, "/XML", &xml_path, "/F"])
            .await
            .map_err(|e| fallback(e.to_string()))?;
        if !output.status.success() {
            return Err(fallback(format!(
                "schtasks /Create failed: {}",
                describe_output(&output)
            )));
        }

        let output = self
            .runner
            .run(SCHTASKS, &["/Run", "/TN", name])
            .await
            .map_err(|e| fallback(e.to_string()))?;
        if !output.status.success() {
            return Err(fallback(format!(
                "schtasks /Run failed: {}",
                describe_output(&output)
            )));
        }

        tracing::info!(task = name, "Fallback scheduled task registered and started");
        Ok(())
    }
}

impl<R: CommandRunner> ServiceBackend for WindowsBackend<R> {
    async fn observe(&self, service: &ServiceDescriptor) -> Result<ServiceRegistrationState> {
        let service_state = self.query(&service.name).await?;
        if matches!(service_state, ScState::Running | ScState::Pending) {
            return Ok(ServiceRegistrationState::InstalledRunning);
        }
        Ok(match (service_state, self.task_status(&service.name).await) {
            (_, Some(true)) => ServiceRegistrationState::InstalledRunning,
            (ScState::Missing, None) => ServiceRegistrationState::Absent,
            _ => ServiceRegistrationState::InstalledStopped,
        })
    }

    async fn stop(&self, service: &ServiceDescriptor) -> Result<()> {
        let name = service.name.as_str();
        if matches!(self.query(name).await?, ScState::Running | ScState::Pending) {
            self.stop_service(name).await?;
        }
        if self.task_status(name).await == Some(true) {
            let output = self.runner.run(SCHTASKS, &["/End", "/TN", name]).await?;
            if !output.status.success() {
                return Err(AgentError::Command(format!(
                    "schtasks /End failed: {}",
                    describe_output(&output)
                )));
            }
        }
        Ok(())
    }

    async fn reconcile(&self, service: &ServiceDescriptor) -> Result<ReconcileOutcome> {
        let name = service.name.as_str();
        tracing::info!(service = name, "Reconciling Windows service registration");

        self.remove_fallback_task(name).await;
        if let Err(e) = self.remove_service(service).await {
            tracing::warn!(service = name, "Could not remove existing registration: {e}");
        }

        let mut phase = RegistrationPhase::NativeAttempted;
        let mut failure = None;
        loop {
            tracing::debug!(service = name, ?phase, "Registration phase");
            phase = match phase {
                RegistrationPhase::NativeAttempted => match self.try_native(service).await {
                    Ok(()) => phase.next(RegistrationEvent::NativeRunning),
                    Err(e) => {
                        tracing::warn!("{e}; falling back to a scheduled task");
                        if let Err(e) = self.remove_service(service).await {
                            tracing::warn!(service = name, "Failed to tear down service: {e}");
                        }
                        phase.next(RegistrationEvent::NativeFailed)
                    }
                },
                RegistrationPhase::FallbackAttempted => match self.try_fallback(service).await {
                    Ok(()) => phase.next(RegistrationEvent::FallbackRunning),
                    Err(e) => {
                        failure = Some(e);
                        phase.next(RegistrationEvent::FallbackFailed)
                    }
                },
                RegistrationPhase::NativeConfirmed
                | RegistrationPhase::FallbackConfirmed
                | RegistrationPhase::Failed => break,
            };
        }

        match phase.outcome() {
            Some(outcome) => {
                tracing::info!(service = name, %outcome, "Registration complete");
                Ok(outcome)
            }
            None => Err(failure.unwrap_or_else(|| {
                AgentError::FallbackRegistration(format!("{name}: registration failed"))
            })),
        }
    }
}
