// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Artifact installer: validate, atomically swap into place, then record the version
//!
//! The install path only ever changes through a single rename of a fully
//! written and validated file, and the version marker is written only after
//! that rename succeeded.

use crate::command::CommandRunner;
use crate::downloader::{Downloader, StagedArtifact};
use crate::error::{AgentError, Result};
use crate::release_checker::ReleaseDescriptor;
use crate::state::VersionMarker;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Leading bytes a native executable for this platform starts with.
pub fn expected_magic() -> &'static [&'static [u8]] {
    if cfg!(windows) {
        &[b"MZ"]
    } else if cfg!(target_os = "macos") {
        &[
            &[0xfe, 0xed, 0xfa, 0xce],
            &[0xfe, 0xed, 0xfa, 0xcf],
            &[0xce, 0xfa, 0xed, 0xfe],
            &[0xcf, 0xfa, 0xed, 0xfe],
            &[0xca, 0xfe, 0xba, 0xbe],
        ]
    } else {
        &[b"\x7fELF"]
    }
}

/// Reject empty files and files without one of the `magics` signatures.
pub fn validate_executable(path: &Path, magics: &[&[u8]]) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(AgentError::ArtifactValidation("artifact is empty".to_owned()));
    }

    let mut header = [0u8; 4];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    let header = header.get(..read).unwrap_or_default();

    if magics.iter().any(|magic| header.starts_with(magic)) {
        Ok(())
    } else {
        Err(AgentError::ArtifactValidation(format!(
            "unexpected executable signature {header:02x?}"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub version: Option<String>,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug)]
pub struct ArtifactInstaller {
    install_path: PathBuf,
    scratch_dir: PathBuf,
    marker: VersionMarker,
    downloader: Downloader,
}

impl ArtifactInstaller {
    pub fn new(
        install_path: PathBuf,
        scratch_dir: PathBuf,
        marker: VersionMarker,
        downloader: Downloader,
    ) -> Self {
        Self {
            install_path,
            scratch_dir,
            marker,
            downloader,
        }
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    /// Version recorded by the last successful install.
    pub fn installed_version(&self) -> Result<Option<String>> {
        self.marker.read()
    }

    pub async fn install(&self, release: &ReleaseDescriptor) -> Result<InstallReport> {
        let staged = self.downloader.download(release, &self.scratch_dir).await?;
        self.install_staged(staged, release.version.as_deref())
    }

    /// Validate and swap an already downloaded artifact into place.
    pub fn install_staged(
        &self,
        staged: StagedArtifact,
        version: Option<&str>,
    ) -> Result<InstallReport> {
        validate_executable(staged.path(), expected_magic())?;

        let previous = std::fs::metadata(&self.install_path).ok();
        make_executable(staged.path())?;

        let StagedArtifact { file, size, sha256 } = staged;
        self.swap_into_place(file)?;
        tracing::info!(path = %self.install_path.display(), bytes = size, "Binary replaced");

        if let Err(e) = restore_metadata(&self.install_path, previous.as_ref()) {
            tracing::warn!("Failed to reapply ownership on {}: {e}", self.install_path.display());
        }

        match version {
            Some(v) => self.marker.write(v)?,
            None => {
                tracing::warn!("Installed an unversioned release, clearing version marker");
                self.marker.clear()?;
            }
        }

        Ok(InstallReport {
            version: version.map(str::to_owned),
            bytes: size,
            sha256,
        })
    }

    /// Run `<binary> --version` and log what it reports. Advisory only.
    pub async fn probe_version(&self, runner: &impl CommandRunner) -> Option<String> {
        let program = self.install_path.to_string_lossy();
        match runner
            .run_with_timeout(&program, &["--version"], VERSION_PROBE_TIMEOUT)
            .await
        {
            Ok(output) if output.status.success() => {
                let reported = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                tracing::info!(%reported, "Installed binary version");
                Some(reported)
            }
            Ok(output) => {
                tracing::warn!(
                    status = %output.status,
                    "Installed binary rejected --version"
                );
                None
            }
            Err(e) => {
                tracing::warn!("Could not query installed binary version: {e}");
                None
            }
        }
    }

    fn swap_into_place(&self, scratch: NamedTempFile) -> Result<()> {
        let install_dir = self
            .install_path
            .parent()
            .ok_or_else(|| AgentError::Install("install path has no parent".to_owned()))?;
        std::fs::create_dir_all(install_dir)?;

        // A rename is only atomic within one filesystem, so stage a sibling copy
        // when the scratch file lives elsewhere.
        let staged = if scratch.path().parent() == Some(install_dir) {
            scratch
        } else {
            let sibling = tempfile::Builder::new()
                .prefix(".hexput-install-")
                .suffix(".tmp")
                .tempfile_in(install_dir)?;
            std::fs::copy(scratch.path(), sibling.path())?;
            make_executable(sibling.path())?;
            sibling
        };

        staged.persist(&self.install_path).map_err(|e| {
            AgentError::Install(format!(
                "rename onto {} failed: {}",
                self.install_path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Carry the previous binary's owner and mode over to the new one.
#[cfg(unix)]
fn restore_metadata(path: &Path, previous: Option<&std::fs::Metadata>) -> Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    let Some(previous) = previous else {
        return Ok(());
    };

    let current = std::fs::metadata(path)?;
    if current.uid() != previous.uid() || current.gid() != previous.gid() {
        std::os::unix::fs::chown(path, Some(previous.uid()), Some(previous.gid()))?;
    }
    let mode = (previous.mode() & 0o7777) | 0o111;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_metadata(_path: &Path, _previous: Option<&std::fs::Metadata>) -> Result<()> {
    Ok(())
}
