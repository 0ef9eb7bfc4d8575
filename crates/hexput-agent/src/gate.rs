// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Update gate: decides whether a resolved release needs to be installed

use crate::version;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Installed version already matches the release
    Skip,
    Proceed(ProceedReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProceedReason {
    /// Equal versions, but `--force` was given
    Forced,
    /// Remote and local versions differ
    VersionChanged,
    /// Nothing has been installed by this agent yet
    NotInstalled,
    /// The release index did not report a version; tracking is degraded
    RemoteVersionUnknown,
}

impl GateDecision {
    pub fn proceeds(self) -> bool {
        matches!(self, Self::Proceed(_))
    }
}

/// Pure decision table over the remote tag, the local marker and `force`.
pub fn decide(remote: Option<&str>, local: Option<&str>, force: bool) -> GateDecision {
    let Some(remote) = remote else {
        return GateDecision::Proceed(ProceedReason::RemoteVersionUnknown);
    };
    let Some(local) = local else {
        return GateDecision::Proceed(ProceedReason::NotInstalled);
    };

    if !version::same_version(remote, local) {
        if version::compare(local, remote) == Some(Ordering::Less) {
            tracing::warn!(local, remote, "Release is older than the installed version");
        }
        return GateDecision::Proceed(ProceedReason::VersionChanged);
    }

    if force {
        GateDecision::Proceed(ProceedReason::Forced)
    } else {
        GateDecision::Skip
    }
}
