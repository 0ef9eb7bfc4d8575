// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Release index lookup: latest tag plus the asset for this host's architecture

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use reqwest::header::{ACCEPT, USER_AGENT as USER_AGENT_HEADER};
use serde::{Deserialize, Serialize};

pub const USER_AGENT: &str = concat!("hexput-agent/", env!("CARGO_PKG_VERSION"));
const DEFAULT_API_BASE: &str = "https://api.github.com";
const CHECKSUMS_ASSET: &str = "SHA256SUMS";

/// What the agent should install this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    /// Release tag as published, `None` when the index omitted it
    pub version: Option<String>,
    pub asset_name: String,
    pub asset_url: String,
    pub checksum: Option<ChecksumSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumSource {
    /// `<asset>.sha256`, first token is the digest
    Sidecar(String),
    /// `SHA256SUMS`, one `<digest>  <name>` line per asset
    Manifest(String),
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubRelease {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Shared HTTP client; every request identifies the agent.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| AgentError::ReleaseLookup(format!("Failed to build HTTP client: {e}")))
}

#[derive(Debug)]
pub struct ReleaseResolver {
    client: reqwest::Client,
    base_url: String,
    repository: String,
    token: Option<String>,
    arch_tag: String,
}

impl ReleaseResolver {
    pub fn new(client: reqwest::Client, config: &AgentConfig) -> Self {
        Self {
            client,
            base_url: config
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_owned()),
            repository: config.repository.clone(),
            token: config.github_token.clone(),
            arch_tag: config.arch_tag(),
        }
    }

    pub fn arch_tag(&self) -> &str {
        &self.arch_tag
    }

    /// Query the newest release once and pick the asset for `arch_tag`.
    pub async fn resolve(&self) -> Result<ReleaseDescriptor> {
        let url = format!(
            "{}/repos/{}/releases/latest",
            self.base_url.trim_end_matches('/'),
            self.repository
        );
        tracing::debug!(%url, "Querying release index");

        let mut request = self
            .client
            .get(&url)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::ReleaseLookup(format!("Request failed: {e}")))?;

        if let Some(remaining) = response.headers().get("x-ratelimit-remaining")
            && let Ok(remaining_str) = remaining.to_str()
            && let Ok(remaining_int) = remaining_str.parse::<u32>()
            && remaining_int < 10
        {
            tracing::warn!("GitHub rate limit low: {remaining_int} remaining");
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_owned());
            return Err(AgentError::ReleaseLookup(format!(
                "release index returned {status}: {body}"
            )));
        }

        let release: GithubRelease = response
            .json()
            .await
            .map_err(|e| AgentError::ReleaseLookup(format!("Failed to parse response: {e}")))?;

        select_asset(release, &self.arch_tag)
    }
}

fn is_checksum_asset(name: &str) -> bool {
    name == CHECKSUMS_ASSET
        || name.ends_with(".sha256")
        || name.ends_with(".sig")
        || name.ends_with(".asc")
}

fn select_asset(release: GithubRelease, arch_tag: &str) -> Result<ReleaseDescriptor> {
    let version = release
        .tag_name
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());

    let Some(binary) = release.assets.iter().find(|a| {
        !is_checksum_asset(&a.name)
            && (a.name.contains(arch_tag) || a.browser_download_url.contains(arch_tag))
    }) else {
        return Err(AgentError::NoMatchingAsset {
            tag: arch_tag.to_owned(),
            available: release.assets.iter().map(|a| a.name.clone()).collect(),
        });
    };

    let sidecar = format!("{}.sha256", binary.name);
    let checksum = release
        .assets
        .iter()
        .find(|a| a.name == sidecar)
        .map(|a| ChecksumSource::Sidecar(a.browser_download_url.clone()))
        .or_else(|| {
            release
                .assets
                .iter()
                .find(|a| a.name == CHECKSUMS_ASSET)
                .map(|a| ChecksumSource::Manifest(a.browser_download_url.clone()))
        });

    Ok(ReleaseDescriptor {
        version,
        asset_name: binary.name.clone(),
        asset_url: binary.browser_download_url.clone(),
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Server, ServerGuard};
    use serde_json::json;

    const TAG: &str = "linux-x86_64";

    fn asset(server: &ServerGuard, name: &str) -> GithubAsset {
        GithubAsset {
            name: name.to_owned(),
            browser_download_url: format!("{}/download/{name}", server.url()),
        }
    }

    fn resolver(server: &ServerGuard) -> ReleaseResolver {
        let config = AgentConfig {
            api_base_url: Some(server.url()),
            arch_tag: Some(TAG.to_owned()),
            ..Default::default()
        };
        ReleaseResolver::new(http_client().unwrap(), &config)
    }

    #[tokio::test]
    async fn test_resolve_latest_release() {
        let mut server = Server::new_async().await;
        let release = GithubRelease {
            tag_name: Some("v2.3.1".to_owned()),
            assets: vec![
                asset(&server, "hexput-runtime-windows-x86_64.exe"),
                asset(&server, "hexput-runtime-linux-x86_64.sha256"),
                asset(&server, "hexput-runtime-linux-x86_64"),
            ],
        };

        let mock = server
            .mock("GET", "/repos/hexput/hexput-runtime/releases/latest")
            .match_header("user-agent", USER_AGENT)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&release).unwrap())
            .create_async()
            .await;

        let descriptor = resolver(&server).resolve().await.unwrap();
        assert_eq!(descriptor.version.as_deref(), Some("v2.3.1"));
        assert_eq!(descriptor.asset_name, "hexput-runtime-linux-x86_64");
        assert_eq!(
            descriptor.checksum,
            Some(ChecksumSource::Sidecar(format!(
                "{}/download/hexput-runtime-linux-x86_64.sha256",
                server.url()
            )))
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_no_matching_asset_lists_names() {
        let mut server = Server::new_async().await;
        let release = GithubRelease {
            tag_name: Some("v2.3.1".to_owned()),
            assets: vec![
                asset(&server, "hexput-runtime-windows-x86_64.exe"),
                asset(&server, "hexput-runtime-macos-aarch64"),
            ],
        };

        let mock = server
            .mock("GET", "/repos/hexput/hexput-runtime/releases/latest")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&release).unwrap())
            .create_async()
            .await;

        match resolver(&server).resolve().await {
            Err(AgentError::NoMatchingAsset { tag, available }) => {
                assert_eq!(tag, TAG);
                assert_eq!(
                    available,
                    vec![
                        "hexput-runtime-windows-x86_64.exe",
                        "hexput-runtime-macos-aarch64"
                    ]
                );
            }
            other => panic!("expected NoMatchingAsset, got {other:?}"),
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_server_error_is_lookup_error() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("GET", "/repos/hexput/hexput-runtime/releases/latest")
            .with_status(403)
            .with_header("x-ratelimit-remaining", "0")
            .with_body(json!({"message": "API rate limit exceeded"}).to_string())
            .create_async()
            .await;

        let result = resolver(&server).resolve().await;
        assert!(matches!(result, Err(AgentError::ReleaseLookup(_))));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_unreachable_is_lookup_error() {
        let config = AgentConfig {
            api_base_url: Some("http://127.0.0.1:1".to_owned()),
            ..Default::default()
        };
        let result = ReleaseResolver::new(http_client().unwrap(), &config)
            .resolve()
            .await;
        assert!(matches!(result, Err(AgentError::ReleaseLookup(_))));
    }

    #[tokio::test]
    async fn test_resolve_sends_token_and_user_agent_with_plain_client() {
        let mut server = Server::new_async().await;
        let body = json!({
            "tag_name": "v1.0.0",
            "assets": [{"name": "rt-linux-x86_64", "browser_download_url": "https://x/rt-linux-x86_64"}]
        });

        let mock = server
            .mock("GET", "/repos/hexput/hexput-runtime/releases/latest")
            .match_header("authorization", "Bearer test-token")
            .match_header("user-agent", USER_AGENT)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let config = AgentConfig {
            api_base_url: Some(server.url()),
            github_token: Some("test-token".to_owned()),
            arch_tag: Some(TAG.to_owned()),
            ..Default::default()
        };
        let descriptor = ReleaseResolver::new(reqwest::Client::new(), &config)
            .resolve()
            .await
            .unwrap();
        assert_eq!(descriptor.asset_url, "https://x/rt-linux-x86_64");
        assert!(descriptor.checksum.is_none());

        mock.assert_async().await;
    }

    #[test]
    fn test_missing_tag_yields_no_version() {
        let release: GithubRelease = serde_json::from_value(json!({
            "tag_name": "  ",
            "assets": [{"name": "rt-linux-x86_64", "browser_download_url": "u"}]
        }))
        .unwrap();
        let descriptor = select_asset(release, TAG).unwrap();
        assert!(descriptor.version.is_none());
    }

    #[test]
    fn test_match_on_url_when_name_lacks_tag() {
        let release: GithubRelease = serde_json::from_value(json!({
            "tag_name": "v1.0.0",
            "assets": [{"name": "runtime", "browser_download_url": "https://x/linux-x86_64/runtime"}]
        }))
        .unwrap();
        let descriptor = select_asset(release, TAG).unwrap();
        assert_eq!(descriptor.asset_name, "runtime");
    }

    #[test]
    fn test_checksum_manifest_used_without_sidecar() {
        let release: GithubRelease = serde_json::from_value(json!({
            "tag_name": "v1.0.0",
            "assets": [
                {"name": "SHA256SUMS", "browser_download_url": "https://x/SHA256SUMS"},
                {"name": "rt-linux-x86_64", "browser_download_url": "https://x/rt"}
            ]
        }))
        .unwrap();
        let descriptor = select_asset(release, TAG).unwrap();
        assert_eq!(descriptor.asset_name, "rt-linux-x86_64");
        assert_eq!(
            descriptor.checksum,
            Some(ChecksumSource::Manifest("https://x/SHA256SUMS".to_owned()))
        );
    }
}
