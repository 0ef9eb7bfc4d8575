// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! One agent run: resolve, gate, terminate, install, reconcile

use crate::command::CommandRunner;
use crate::config::AgentConfig;
use crate::downloader::Downloader;
use crate::error::{AgentError, Result};
use crate::gate::{self, GateDecision};
use crate::installer::{ArtifactInstaller, InstallReport};
use crate::lock::RunLock;
use crate::process::{ProcessTable, ProcessTerminator, TerminationReport};
use crate::release_checker::{ReleaseDescriptor, ReleaseResolver};
use crate::service::{ReconcileOutcome, ServiceBackend, ServiceDescriptor};
use crate::state::VersionMarker;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Reinstall even when the versions match
    pub force: bool,
    /// Resolve and decide only
    pub check_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub release: ReleaseDescriptor,
    pub local_version: Option<String>,
    pub decision: GateDecision,
    pub termination: Option<TerminationReport>,
    pub installed: Option<InstallReport>,
    /// `None` in check mode or when registration failed non-fatally
    pub service: Option<ReconcileOutcome>,
}

#[derive(Debug)]
pub struct Agent<B, T, R> {
    config: AgentConfig,
    resolver: ReleaseResolver,
    installer: ArtifactInstaller,
    terminator: ProcessTerminator<T>,
    backend: B,
    runner: R,
}

impl<B, T, R> Agent<B, T, R>
where
    B: ServiceBackend,
    T: ProcessTable,
    R: CommandRunner,
{
    pub fn new(
        config: AgentConfig,
        client: reqwest::Client,
        backend: B,
        table: T,
        runner: R,
    ) -> Self {
        let resolver = ReleaseResolver::new(client.clone(), &config);
        let downloader = Downloader::new(
            client,
            config.github_token.clone(),
            config.max_artifact_bytes,
        );
        let installer = ArtifactInstaller::new(
            config.install_path.clone(),
            config.scratch_dir(),
            VersionMarker::new(config.marker_path.clone()),
            downloader,
        );
        let terminator = ProcessTerminator::new(
            table,
            Duration::from_millis(config.stop_poll_interval_ms),
            config.stop_poll_attempts,
        );

        Self {
            config,
            resolver,
            installer,
            terminator,
            backend,
            runner,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        let _lock = if options.check_only {
            None
        } else {
            Some(RunLock::acquire(&self.config.lock_path)?)
        };

        let release = self.resolver.resolve().await?;
        match release.version {
            Some(ref version) => tracing::info!(
                %version,
                asset = %release.asset_name,
                "Resolved latest release"
            ),
            None if self.config.require_remote_version => return Err(AgentError::MissingVersion),
            None => tracing::warn!(
                asset = %release.asset_name,
                "Release has no version tag, version tracking is degraded"
            ),
        }

        let local_version = self.installer.installed_version()?;
        let decision = gate::decide(
            release.version.as_deref(),
            local_version.as_deref(),
            options.force,
        );
        tracing::info!(local = ?local_version, ?decision, "Update gate");

        let mut report = RunReport {
            release,
            local_version,
            decision,
            termination: None,
            installed: None,
            service: None,
        };
        if options.check_only {
            return Ok(report);
        }

        let service = ServiceDescriptor::from_config(&self.config);

        if decision.proceeds() {
            let had_binary = self.installer.install_path().exists();
            report.termination = Some(
                self.terminator
                    .stop_all(&self.backend, &service, self.installer.install_path())
                    .await,
            );

            match self.installer.install(&report.release).await {
                Ok(installed) => {
                    self.installer.probe_version(&self.runner).await;
                    report.installed = Some(installed);
                }
                Err(e) => {
                    tracing::error!("Install failed: {e}");
                    if had_binary {
                        self.recover(&service).await;
                    }
                    return Err(e);
                }
            }
        } else {
            tracing::info!("Already up to date, skipping download");
        }

        match self.backend.reconcile(&service).await {
            Ok(outcome) => {
                tracing::info!(service = %service.name, %outcome, "Service reconciled");
                report.service = Some(outcome);
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!(service = %service.name, "Service registration failed: {e}");
            }
            Err(e) => return Err(e),
        }

        Ok(report)
    }

    /// Bring the previous binary back up after a failed install.
    async fn recover(&self, service: &ServiceDescriptor) {
        match self.backend.reconcile(service).await {
            Ok(outcome) => tracing::info!(%outcome, "Previous binary restarted"),
            Err(e) => tracing::warn!("Recovery reconcile failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::fake::FakeRunner;
    use crate::gate::ProceedReason;
    use crate::installer::expected_magic;
    use crate::service::ServiceRegistrationState;
    use crate::service::fake::FakeBackend;
    use mockito::{Mock, Server, ServerGuard};
    use serde_json::json;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    const TAG: &str = "linux-x86_64";

    struct NoProcesses;

    impl ProcessTable for NoProcesses {
        fn find(&self, _target: &Path) -> Vec<u32> {
            Vec::new()
        }
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
        fn terminate(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
        fn kill(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }

    fn config(server: &ServerGuard, dir: &TempDir) -> AgentConfig {
        AgentConfig {
            api_base_url: Some(server.url()),
            arch_tag: Some(TAG.to_owned()),
            install_path: dir.path().join("bin").join("hexput-runtime"),
            marker_path: dir.path().join("state").join("version"),
            lock_path: dir.path().join("state").join("agent.lock"),
            ..Default::default()
        }
    }

    fn binary() -> Vec<u8> {
        let mut bytes = expected_magic()[0].to_vec();
        bytes.extend_from_slice(b"runtime");
        bytes
    }

    async fn release_mock(server: &mut ServerGuard, tag: Option<&str>) -> Mock {
        let body = json!({
            "tag_name": tag,
            "assets": [{
                "name": format!("hexput-runtime-{TAG}"),
                "browser_download_url": format!("{}/dl/rt", server.url())
            }]
        });
        server
            .mock("GET", "/repos/hexput/hexput-runtime/releases/latest")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await
    }

    async fn asset_mock(server: &mut ServerGuard, body: &[u8], hits: usize) -> Mock {
        server
            .mock("GET", "/dl/rt")
            .with_status(200)
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    fn agent<'a>(
        config: AgentConfig,
        backend: FakeBackend,
        runner: &'a FakeRunner,
    ) -> Agent<FakeBackend, NoProcesses, &'a FakeRunner> {
        Agent::new(config, reqwest::Client::new(), backend, NoProcesses, runner)
    }

    #[tokio::test]
    async fn test_check_mode_changes_nothing() {
        let mut server = Server::new_async().await;
        let _release = release_mock(&mut server, Some("v2.3.1")).await;
        let asset = asset_mock(&mut server, &binary(), 0).await;
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let agent = agent(
            config(&server, &dir),
            FakeBackend::new(ServiceRegistrationState::Absent),
            &runner,
        );

        let report = agent
            .run(RunOptions {
                check_only: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.decision, GateDecision::Proceed(ProceedReason::NotInstalled));
        assert_eq!(agent.backend().reconcile_calls(), 0);
        assert!(!dir.path().join("bin").exists());
        asset.assert_async().await;
    }

    #[tokio::test]
    async fn test_registration_failure_is_not_fatal() {
        let mut server = Server::new_async().await;
        let _release = release_mock(&mut server, Some("v2.3.1")).await;
        let _asset = asset_mock(&mut server, &binary(), 1).await;
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let agent = agent(
            config(&server, &dir),
            FakeBackend::new(ServiceRegistrationState::Absent).failing_reconcile(),
            &runner,
        );

        let report = agent.run(RunOptions::default()).await.unwrap();

        assert_eq!(report.service, None);
        assert_eq!(
            report.installed.map(|i| i.version),
            Some(Some("v2.3.1".to_owned()))
        );
        assert!(runner.called(&format!(
            "{} --version",
            dir.path().join("bin").join("hexput-runtime").display()
        )));
    }

    #[tokio::test]
    async fn test_missing_version_strict_mode_is_fatal() {
        let mut server = Server::new_async().await;
        let _release = release_mock(&mut server, None).await;
        let asset = asset_mock(&mut server, &binary(), 0).await;
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let config = AgentConfig {
            require_remote_version: true,
            ..config(&server, &dir)
        };
        let agent = agent(config, FakeBackend::new(ServiceRegistrationState::Absent), &runner);

        let result = agent.run(RunOptions::default()).await;

        assert!(matches!(result, Err(AgentError::MissingVersion)));
        asset.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_version_permissive_installs_and_clears_marker() {
        let mut server = Server::new_async().await;
        let _release = release_mock(&mut server, None).await;
        let asset = asset_mock(&mut server, &binary(), 1).await;
        let dir = tempdir().unwrap();
        let config = config(&server, &dir);
        VersionMarker::new(config.marker_path.clone()).write("v1.0.0").unwrap();
        let runner = FakeRunner::new();
        let agent = agent(config.clone(), FakeBackend::new(ServiceRegistrationState::Absent), &runner);

        let report = agent.run(RunOptions::default()).await.unwrap();

        assert_eq!(
            report.decision,
            GateDecision::Proceed(ProceedReason::RemoteVersionUnknown)
        );
        assert_eq!(VersionMarker::new(config.marker_path).read().unwrap(), None);
        asset.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_install_restarts_previous_binary() {
        let mut server = Server::new_async().await;
        let _release = release_mock(&mut server, Some("v2.0.0")).await;
        let _asset = asset_mock(&mut server, b"<html>not a binary</html>", 1).await;
        let dir = tempdir().unwrap();
        let config = config(&server, &dir);
        std::fs::create_dir_all(config.install_path.parent().unwrap()).unwrap();
        std::fs::write(&config.install_path, binary()).unwrap();
        let runner = FakeRunner::new();
        let agent = agent(
            config.clone(),
            FakeBackend::new(ServiceRegistrationState::InstalledRunning),
            &runner,
        );

        let result = agent.run(RunOptions::default()).await;

        assert!(matches!(result, Err(AgentError::ArtifactValidation(_))));
        assert_eq!(agent.backend().stop_calls(), 1);
        assert_eq!(agent.backend().reconcile_calls(), 1);
        assert_eq!(agent.backend().state(), ServiceRegistrationState::InstalledRunning);
        assert_eq!(std::fs::read(&config.install_path).unwrap(), binary());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let mut server = Server::new_async().await;
        let release = server
            .mock("GET", "/repos/hexput/hexput-runtime/releases/latest")
            .expect(0)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let config = config(&server, &dir);
        let _held = RunLock::acquire(&config.lock_path).unwrap();
        let runner = FakeRunner::new();
        let agent = agent(config, FakeBackend::new(ServiceRegistrationState::Absent), &runner);

        let result = agent.run(RunOptions::default()).await;

        assert!(matches!(result, Err(AgentError::Lock(_))));
        release.assert_async().await;
    }
}
