// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! hexput-agent - installs, updates and supervises the hexput-runtime binary
//!
//! A run resolves the latest release, decides whether it needs installing,
//! swaps the binary in atomically and makes sure the host supervisor keeps
//! it running.

pub mod agent;
pub mod command;
pub mod config;
pub mod downloader;
pub mod error;
pub mod gate;
pub mod installer;
pub mod lock;
pub mod process;
pub mod release_checker;
pub mod service;
pub mod state;
pub mod version;

pub use agent::{Agent, RunOptions, RunReport};
pub use config::{AgentConfig, load_config};
pub use error::{AgentError, Result};
pub use gate::{GateDecision, ProceedReason};
pub use version::{parse_version, version_from_tag};
