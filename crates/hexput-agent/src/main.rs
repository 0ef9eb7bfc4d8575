// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! hexput-agent - entry point
//!
//! Meant to be triggered periodically (timer, cron, scheduled task). Each
//! invocation is one complete run; a fatal step exits non-zero.

use anyhow::Context;
use clap::Parser;
use hexput_agent::command::TokioCommandRunner;
use hexput_agent::config::{default_config_path, load_config};
use hexput_agent::process::SystemProcessTable;
use hexput_agent::release_checker::http_client;
use hexput_agent::service::HostBackend;
use hexput_agent::{Agent, GateDecision, RunOptions};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hexput-agent", version, about = "Install, update and supervise hexput-runtime")]
struct Cli {
    /// Reinstall even if the installed version matches the latest release
    #[arg(long)]
    force: bool,

    /// Resolve the latest release and report what would happen, without changing anything
    #[arg(long)]
    check: bool,

    /// Path to the JSON config file
    #[arg(long, env = "HEXPUT_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "hexput_agent=debug"
    } else {
        "hexput_agent=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hexput-agent");

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        repository = %config.repository,
        install_path = %config.install_path.display(),
        arch = %config.arch_tag(),
        "Loaded config"
    );

    let runner = TokioCommandRunner::default();
    let agent = Agent::new(
        config,
        http_client()?,
        HostBackend::for_host(runner.clone()),
        SystemProcessTable::new(),
        runner,
    );

    let options = RunOptions {
        force: cli.force,
        check_only: cli.check,
    };
    let report = match agent.run(options).await {
        Ok(report) => report,
        Err(e) => {
            error!("Run failed: {e}");
            return Err(e.into());
        }
    };

    if cli.check {
        let latest = report.release.version.as_deref().unwrap_or("<untagged>");
        let installed = report.local_version.as_deref().unwrap_or("<none>");
        let action = match report.decision {
            GateDecision::Skip => "up to date".to_owned(),
            GateDecision::Proceed(reason) => format!("would install ({reason:?})"),
        };
        println!("latest: {latest} ({})", report.release.asset_name);
        println!("installed: {installed}");
        println!("action: {action}");
        return Ok(());
    }

    match (&report.installed, report.service) {
        (Some(installed), service) => info!(
            version = ?installed.version,
            sha256 = %installed.sha256,
            service = ?service,
            "Run complete, binary updated"
        ),
        (None, service) => info!(service = ?service, "Run complete, binary unchanged"),
    }
    Ok(())
}
