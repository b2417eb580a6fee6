// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Distribution error taxonomy.
//!
//! Per-node errors are recovered locally by the retry loop and surfaced only
//! inside the node's final [`DistributionResult`]; the aggregate variants
//! ([`DistributionError::ConnectivityFailed`],
//! [`DistributionError::QuorumNotMet`]) are the only ones that abort a
//! caller's deployment flow.

use camino::Utf8PathBuf;

use crate::channel::ChannelError;
use crate::distributor::DistributionResult;

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("cannot read archive {path}")]
    ArchiveUnreadable {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to transfer archive to {node}")]
    TransferFailed {
        node: String,
        #[source]
        source: ChannelError,
    },

    #[error(
        "failed to import image on {node}{}",
        .hint.map(|h| format!(": {}", h.guidance())).unwrap_or_default()
    )]
    ImportFailed {
        node: String,
        /// Heuristic classification of the remote command output, when one
        /// of the known failure modes matched.
        hint: Option<RemoteFailureClass>,
        #[source]
        source: ChannelError,
    },

    #[error("image {image} not registered on {node}")]
    VerificationFailed {
        node: String,
        image: String,
        #[source]
        source: Option<ChannelError>,
    },

    #[error("distribution task for {node} did not complete: {message}")]
    TaskFailed { node: String, message: String },

    #[error(
        "ssh connectivity failed:\n  {}\n\nTo fix:\n  \
         1. Install the deploy key on the worker: ssh-copy-id <user>@<worker-ip>\n  \
         2. Or specify a different key with --ssh-key",
        .failures.join("\n  ")
    )]
    ConnectivityFailed {
        /// One rendered `name (addr): cause` entry per unreachable node.
        failures: Vec<String>,
    },

    #[error("only {succeeded}/{total} workers received image (minimum: {required})")]
    QuorumNotMet {
        succeeded: usize,
        total: usize,
        required: usize,
        /// The full per-node outcome set, one entry per worker in node-list
        /// order, so callers can report the shortfall without re-running.
        results: Vec<DistributionResult>,
    },
}

/// Known remote failure modes, recognized by substring in command output.
///
/// The remote runtime gives us no structured exit codes over the shell
/// channel, so classification is a heuristic layer on top of
/// [`ChannelError::RemoteCommandFailed`]. It is confined to this type so it
/// can be replaced without touching callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteFailureClass {
    DiskFull,
    PermissionDenied,
    RuntimeUnavailable,
}

impl RemoteFailureClass {
    pub fn classify(output: &str) -> Option<Self> {
        let output = output.to_lowercase();
        if output.contains("no space left") {
            Some(Self::DiskFull)
        } else if output.contains("permission denied") {
            Some(Self::PermissionDenied)
        } else if output.contains("connection refused") {
            Some(Self::RuntimeUnavailable)
        } else {
            None
        }
    }

    /// Actionable text for operators.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::DiskFull => "disk full on worker",
            Self::PermissionDenied => "sudo access required for the ctr command",
            Self::RuntimeUnavailable => "containerd is not running on the worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_remote_failures() {
        assert_eq!(
            RemoteFailureClass::classify(
                "ctr: write /var/lib: No space left on device"
            ),
            Some(RemoteFailureClass::DiskFull)
        );
        assert_eq!(
            RemoteFailureClass::classify("sudo: Permission denied"),
            Some(RemoteFailureClass::PermissionDenied)
        );
        assert_eq!(
            RemoteFailureClass::classify(
                "ctr: failed to dial: connection refused"
            ),
            Some(RemoteFailureClass::RuntimeUnavailable)
        );
        assert_eq!(RemoteFailureClass::classify("something else"), None);
    }

    #[test]
    fn quorum_message_names_the_shortfall() {
        let err = DistributionError::QuorumNotMet {
            succeeded: 3,
            total: 5,
            required: 5,
            results: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "only 3/5 workers received image (minimum: 5)"
        );
    }

    #[test]
    fn import_failure_includes_guidance_when_classified() {
        let err = DistributionError::ImportFailed {
            node: "node-a".to_string(),
            hint: Some(RemoteFailureClass::DiskFull),
            source: ChannelError::RemoteCommandFailed {
                command: "sudo ctr images import".to_string(),
                status: 1,
                output: "no space left on device".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "failed to import image on node-a: disk full on worker"
        );
    }
}
