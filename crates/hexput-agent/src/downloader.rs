// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Artifact download into a scratch file, with streaming SHA256

use crate::error::{AgentError, Result};
use crate::release_checker::{ChecksumSource, ReleaseDescriptor, USER_AGENT};
use futures_util::StreamExt;
use reqwest::header::USER_AGENT as USER_AGENT_HEADER;
use sha2::{Digest, Sha256};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

/// A fully downloaded artifact that has not been validated yet.
///
/// The scratch file is removed when this is dropped without being installed.
#[derive(Debug)]
pub struct StagedArtifact {
    pub file: NamedTempFile,
    pub size: u64,
    pub sha256: String,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    token: Option<String>,
    max_bytes: u64,
}

impl Downloader {
    pub fn new(client: reqwest::Client, token: Option<String>, max_bytes: u64) -> Self {
        Self {
            client,
            token,
            max_bytes,
        }
    }

    /// Download the release asset into a uniquely named file under `scratch_dir`.
    pub async fn download(
        &self,
        release: &ReleaseDescriptor,
        scratch_dir: &Path,
    ) -> Result<StagedArtifact> {
        tokio::fs::create_dir_all(scratch_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(".hexput-download-")
            .suffix(".tmp")
            .tempfile_in(scratch_dir)?;

        tracing::info!(
            url = %release.asset_url,
            scratch = %scratch.path().display(),
            "Downloading release asset"
        );

        let response = self.get(&release.asset_url).await?;
        if let Some(len) = response.content_length()
            && len > self.max_bytes
        {
            return Err(AgentError::Download(format!(
                "asset is {len} bytes, limit is {}",
                self.max_bytes
            )));
        }

        let mut file = tokio::fs::File::from_std(scratch.as_file().try_clone()?);
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AgentError::Download(format!("Failed to read body: {e}")))?;
            size = size.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
            if size > self.max_bytes {
                return Err(AgentError::Download(format!(
                    "asset exceeds {} bytes",
                    self.max_bytes
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        if size == 0 {
            return Err(AgentError::Download("downloaded artifact is empty".to_owned()));
        }

        let sha256 = format!("{:x}", hasher.finalize());
        if let Some(ref source) = release.checksum {
            let expected = self.expected_checksum(source, &release.asset_name).await?;
            if expected != sha256 {
                return Err(AgentError::ChecksumMismatch {
                    expected,
                    actual: sha256,
                });
            }
            tracing::debug!(%sha256, "Checksum verified");
        }

        tracing::info!(bytes = size, "Download complete");
        Ok(StagedArtifact {
            file: scratch,
            size,
            sha256,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url).header(USER_AGENT_HEADER, USER_AGENT);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Download(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentError::Download(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn expected_checksum(&self, source: &ChecksumSource, asset_name: &str) -> Result<String> {
        let (url, manifest) = match source {
            ChecksumSource::Sidecar(url) => (url, false),
            ChecksumSource::Manifest(url) => (url, true),
        };
        let content = self
            .get(url)
            .await?
            .text()
            .await
            .map_err(|e| AgentError::Download(format!("Failed to read checksum: {e}")))?;

        if manifest {
            parse_sha256sums(&content, asset_name)
        } else {
            content
                .split_whitespace()
                .next()
                .map(str::to_lowercase)
                .ok_or_else(|| AgentError::Download("empty checksum file".to_owned()))
        }
    }
}

fn parse_sha256sums(content: &str, asset_name: &str) -> Result<String> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(hash), Some(name)) = (parts.next(), parts.next())
            && name.trim_start_matches('*') == asset_name
        {
            return Ok(hash.to_lowercase());
        }
    }

    Err(AgentError::Download(format!(
        "SHA256SUMS does not contain entry for {asset_name}"
    )))
}
