// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Process terminator: stop the service and any stray instance of the binary
//!
//! Escalation is supervisor stop, then a graceful signal, then a forceful kill
//! once the poll window is exhausted. Every failure here is advisory.

use crate::error::{AgentError, Result};
use crate::service::{ServiceBackend, ServiceDescriptor, ServiceRegistrationState};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};

/// View of the host process table.
pub trait ProcessTable {
    /// PIDs of processes running `target`, never including the agent itself.
    fn find(&self, target: &Path) -> Vec<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit.
    fn terminate(&self, pid: u32) -> Result<()>;

    fn kill(&self, pid: u32) -> Result<()>;
}

/// Whether a process with this executable and command line is an instance of `target`.
pub fn matches_binary<S: AsRef<OsStr>>(cmd: &[S], exe: Option<&Path>, target: &Path) -> bool {
    if let Some(exe) = exe {
        if exe == target {
            return true;
        }
        // Linux reports a replaced executable as "<path> (deleted)"
        let deleted = format!("{} (deleted)", target.display());
        if exe.as_os_str() == OsStr::new(&deleted) {
            return true;
        }
    }

    let Some(argv0) = cmd.first().map(|a| Path::new(a.as_ref())) else {
        return false;
    };
    if argv0 == target {
        return true;
    }
    // Launched by bare name through PATH
    argv0.components().count() == 1 && argv0.file_name() == target.file_name()
}

/// `ProcessTable` backed by `sysinfo`, with signals sent through `nix` on Unix.
#[derive(Debug, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }

    fn snapshot(pid: Option<u32>) -> System {
        let mut system = System::new();
        match pid {
            Some(pid) => {
                system.refresh_process(Pid::from_u32(pid));
            }
            None => system.refresh_processes(),
        }
        system
    }
}

impl ProcessTable for SystemProcessTable {
    fn find(&self, target: &Path) -> Vec<u32> {
        let own = std::process::id();
        let system = Self::snapshot(None);
        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own
                    && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                    && matches_binary(process.cmd(), process.exe(), target)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn is_alive(&self, pid: u32) -> bool {
        Self::snapshot(Some(pid))
            .process(Pid::from_u32(pid))
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    // No graceful signal on Windows; terminate outright.
    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> Result<()> {
        self.kill(pid)
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    fn kill(&self, pid: u32) -> Result<()> {
        let system = Self::snapshot(Some(pid));
        match system.process(Pid::from_u32(pid)) {
            Some(process) if process.kill() => Ok(()),
            Some(_) => Err(AgentError::Command(format!("failed to kill PID {pid}"))),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid)
        .map_err(|_| AgentError::Command(format!("PID {pid} out of range")))?;
    match nix::sys::signal::kill(NixPid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AgentError::Command(format!("{signal} to PID {pid} failed: {e}"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// The supervisor was asked to stop a running service
    pub supervisor_stopped: bool,
    /// Processes that exited after the graceful signal
    pub terminated: Vec<u32>,
    /// Processes that had to be killed
    pub killed: Vec<u32>,
}

#[derive(Debug)]
pub struct ProcessTerminator<T> {
    table: T,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl<T: ProcessTable> ProcessTerminator<T> {
    pub fn new(table: T, poll_interval: Duration, poll_attempts: u32) -> Self {
        Self {
            table,
            poll_interval,
            poll_attempts,
        }
    }

    /// Make sure nothing is running `target` anymore. Never fails.
    pub async fn stop_all(
        &self,
        backend: &impl ServiceBackend,
        service: &ServiceDescriptor,
        target: &Path,
    ) -> TerminationReport {
        let mut report = TerminationReport::default();

        match backend.observe(service).await {
            Ok(ServiceRegistrationState::InstalledRunning) => {
                tracing::info!(service = %service.name, "Stopping service through supervisor");
                match backend.stop(service).await {
                    Ok(()) => report.supervisor_stopped = true,
                    Err(e) => tracing::warn!(service = %service.name, "Supervisor stop failed: {e}"),
                }
            }
            Ok(state) => tracing::debug!(service = %service.name, ?state, "Service not running"),
            Err(e) => tracing::warn!(service = %service.name, "Could not query service: {e}"),
        }

        let found = self.table.find(target);
        if found.is_empty() {
            tracing::debug!(target = %target.display(), "No stray processes");
            return report;
        }

        for &pid in &found {
            tracing::info!(pid, "Sending graceful termination");
            if let Err(e) = self.table.terminate(pid) {
                tracing::warn!(pid, "Graceful termination failed: {e}");
            }
        }

        let mut alive = found.clone();
        for _ in 0..self.poll_attempts {
            alive.retain(|&pid| self.table.is_alive(pid));
            if alive.is_empty() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        alive.retain(|&pid| self.table.is_alive(pid));

        for &pid in &alive {
            tracing::warn!(pid, "Process did not exit in time, killing");
            if let Err(e) = self.table.kill(pid) {
                tracing::warn!(pid, "Kill failed: {e}");
            }
        }

        report.terminated = found.into_iter().filter(|pid| !alive.contains(pid)).collect();
        report.killed = alive;
        report
    }
}
