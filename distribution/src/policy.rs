// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Policy and connection parameters for a distribution session.
//!
//! Both structs are plain in-memory data supplied by the caller; there is no
//! configuration file behind them.

use std::time::Duration;

use camino::Utf8PathBuf;

pub const DEFAULT_PARALLELISM: usize = 3;
pub const DEFAULT_RETRY_COUNT: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_REMOTE_TEMP_DIR: &str = "/tmp";

pub const DEFAULT_SSH_USER: &str = "ubuntu";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable distribution policy for one session.
#[derive(Clone, Debug)]
pub struct DistributorPolicy {
    /// Maximum number of node pipelines in flight at once.
    pub parallelism: usize,
    /// Total attempts per node (the first attempt counts).
    pub retry_count: usize,
    /// Fixed delay between attempts on the same node.
    pub retry_delay: Duration,
    /// Minimum number of nodes that must succeed for the run to pass.
    /// Zero means every node is required.
    pub min_workers: usize,
    /// Leave the transferred archive on the workers instead of deleting it
    /// after a successful import.
    pub keep_artifacts: bool,
    /// Operator-supplied worker addresses. When non-empty, cluster discovery
    /// is skipped entirely.
    pub explicit_nodes: Vec<String>,
    /// Directory on each worker that receives the archive.
    pub remote_temp_dir: Utf8PathBuf,
}

impl Default for DistributorPolicy {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            min_workers: 0,
            keep_artifacts: false,
            explicit_nodes: Vec::new(),
            remote_temp_dir: Utf8PathBuf::from(DEFAULT_REMOTE_TEMP_DIR),
        }
    }
}

impl DistributorPolicy {
    /// The success quorum for a run against `total` nodes.
    pub fn effective_min_workers(&self, total: usize) -> usize {
        if self.min_workers == 0 {
            total
        } else {
            self.min_workers
        }
    }
}

/// SSH connection parameters shared by every remote operation.
#[derive(Clone, Debug)]
pub struct SshConfig {
    pub user: String,
    /// Private key used for public-key authentication.
    pub key_path: Utf8PathBuf,
    pub port: u16,
    /// Bounds both the dial and each remote command.
    pub timeout: Duration,
}

impl SshConfig {
    pub fn new(user: impl Into<String>, key_path: Utf8PathBuf) -> Self {
        Self {
            user: user.into(),
            key_path,
            port: DEFAULT_SSH_PORT,
            timeout: DEFAULT_SSH_TIMEOUT,
        }
    }
}
