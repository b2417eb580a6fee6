// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet distribution orchestration.
//!
//! The distributor owns policy (parallelism, retries, success quorum) and
//! drives the per-node transfer + import + verify + cleanup pipeline across
//! the node set. Each node runs on its own task; a semaphore sized to the
//! policy's parallelism bounds how many pipelines are in flight. Retries for
//! a node are strictly sequential with a fixed delay, and a node's recorded
//! outcome reflects only its last attempt.
//!
//! Results come back in node-list order regardless of completion order, one
//! entry per node, no omissions. The run as a whole fails only when fewer
//! than the effective minimum of workers succeeded; a run that meets the
//! quorum with some failures succeeds loudly, naming the failed nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use slog::{debug, info, warn, Logger};
use tokio::sync::Semaphore;

use crate::channel::{ChannelError, RemoteChannel};
use crate::errors::{DistributionError, RemoteFailureClass};
use crate::node::WorkerNode;
use crate::policy::DistributorPolicy;

/// Namespace the cluster runtime reads images from.
pub const CONTAINERD_NAMESPACE: &str = "k8s.io";

/// Outcome of one (worker, component) pair. Immutable once created.
#[derive(Debug)]
pub struct DistributionResult {
    pub node: String,
    pub addr: String,
    pub component: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<DistributionError>,
}

pub struct Distributor<C> {
    log: Logger,
    channel: Arc<C>,
    policy: DistributorPolicy,
}

impl<C> Clone for Distributor<C> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            channel: Arc::clone(&self.channel),
            policy: self.policy.clone(),
        }
    }
}

impl<C: RemoteChannel + 'static> Distributor<C> {
    pub fn new(log: &Logger, channel: C, policy: DistributorPolicy) -> Self {
        Self { log: log.clone(), channel: Arc::new(channel), policy }
    }

    pub fn policy(&self) -> &DistributorPolicy {
        &self.policy
    }

    /// Test connectivity to every node with a trivial remote command,
    /// recording reachability on each node.
    ///
    /// Runs sequentially: this phase is the sole writer of the nodes'
    /// reachability state and finishes before any concurrent distribution
    /// starts. Returns an error enumerating every unreachable node; callers
    /// should abort the run on it rather than distribute to a degraded set.
    pub async fn test_connectivity(
        &self,
        nodes: &mut [WorkerNode],
    ) -> Result<(), DistributionError> {
        debug!(self.log, "testing ssh connectivity to {} workers", nodes.len());
        let mut failures = Vec::new();
        for node in nodes.iter_mut() {
            match self.channel.exec(node, "hostname").await {
                Ok(_) => {
                    node.reachable = true;
                    node.last_error = None;
                    debug!(
                        self.log,
                        "{} ({}) reachable", node.name, node.addr
                    );
                }
                Err(err) => {
                    node.reachable = false;
                    failures.push(format!(
                        "{} ({}): {}",
                        node.name, node.addr, err
                    ));
                    node.last_error = Some(err.to_string());
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DistributionError::ConnectivityFailed { failures })
        }
    }

    /// Run the single-node pipeline once: transfer the archive, import it
    /// under the image's base name, verify the image is listed, then delete
    /// the remote archive unless the policy keeps artifacts.
    pub async fn distribute_to_node(
        &self,
        node: &WorkerNode,
        archive_path: &Utf8Path,
        component: &str,
        image_name: &str,
    ) -> DistributionResult {
        let start = Instant::now();
        let outcome =
            self.run_pipeline(node, archive_path, image_name).await;
        let duration = start.elapsed();
        match outcome {
            Ok(()) => {
                info!(
                    self.log,
                    "[{}] completed in {:?}", node.name, duration
                );
                DistributionResult {
                    node: node.name.clone(),
                    addr: node.addr.clone(),
                    component: component.to_owned(),
                    success: true,
                    duration,
                    error: None,
                }
            }
            Err(error) => DistributionResult {
                node: node.name.clone(),
                addr: node.addr.clone(),
                component: component.to_owned(),
                success: false,
                duration,
                error: Some(error),
            },
        }
    }

    async fn run_pipeline(
        &self,
        node: &WorkerNode,
        archive_path: &Utf8Path,
        image_name: &str,
    ) -> Result<(), DistributionError> {
        let metadata =
            tokio::fs::metadata(archive_path).await.map_err(|source| {
                DistributionError::ArchiveUnreadable {
                    path: archive_path.to_owned(),
                    source,
                }
            })?;
        let archive_size = metadata.len();
        let file_name = archive_path.file_name().ok_or_else(|| {
            DistributionError::ArchiveUnreadable {
                path: archive_path.to_owned(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "archive path has no file name",
                ),
            }
        })?;
        let remote_path =
            format!("{}/{}", self.policy.remote_temp_dir, file_name);

        info!(
            self.log,
            "[{}] copying archive ({:.1} MiB)",
            node.name,
            archive_size as f64 / 1024.0 / 1024.0
        );
        self.channel
            .transfer_file(node, archive_path, &remote_path)
            .await
            .map_err(|source| DistributionError::TransferFailed {
                node: node.name.clone(),
                source,
            })?;

        info!(self.log, "[{}] importing into containerd", node.name);
        self.import_archive(node, &remote_path, image_name).await?;

        info!(self.log, "[{}] verifying import", node.name);
        self.verify_import_on_node(node, image_name).await?;

        if !self.policy.keep_artifacts {
            debug!(self.log, "[{}] removing remote archive", node.name);
            // A leftover archive costs disk space, not correctness.
            if let Err(err) =
                self.channel.exec(node, &format!("rm -f {}", remote_path)).await
            {
                warn!(
                    self.log,
                    "[{}] failed to remove {}: {}",
                    node.name,
                    remote_path,
                    err
                );
            }
        }
        Ok(())
    }

    /// Import the transferred archive into the cluster runtime namespace,
    /// overriding the base name so the image registers under the exact
    /// reference the deployment manifests expect.
    async fn import_archive(
        &self,
        node: &WorkerNode,
        remote_path: &str,
        image_name: &str,
    ) -> Result<(), DistributionError> {
        let command = format!(
            "sudo ctr -n {} images import --base-name {} {}",
            CONTAINERD_NAMESPACE,
            image_base_name(image_name),
            remote_path,
        );
        match self.channel.exec(node, &command).await {
            Ok(_) => Ok(()),
            Err(source) => {
                let hint = match &source {
                    ChannelError::RemoteCommandFailed { output, .. } => {
                        RemoteFailureClass::classify(output)
                    }
                    _ => None,
                };
                Err(DistributionError::ImportFailed {
                    node: node.name.clone(),
                    hint,
                    source,
                })
            }
        }
    }

    /// Assert the image reference appears in the node's image listing. Used
    /// inside the pipeline and as a post-hoc fleet-wide audit.
    pub async fn verify_import_on_node(
        &self,
        node: &WorkerNode,
        image_name: &str,
    ) -> Result<(), DistributionError> {
        let command =
            format!("sudo ctr -n {} images list", CONTAINERD_NAMESPACE);
        let output = self.channel.exec(node, &command).await.map_err(
            |source| DistributionError::VerificationFailed {
                node: node.name.clone(),
                image: image_name.to_owned(),
                source: Some(source),
            },
        )?;
        if output.contains(image_name) {
            Ok(())
        } else {
            Err(DistributionError::VerificationFailed {
                node: node.name.clone(),
                image: image_name.to_owned(),
                source: None,
            })
        }
    }

    /// Distribute one archive to every node, with bounded parallelism and
    /// per-node retries.
    ///
    /// Returns the per-node results in node-list order when the success
    /// quorum is met. When it is not, the aggregate
    /// [`DistributionError::QuorumNotMet`] carries the same result set.
    pub async fn distribute_to_all_nodes(
        &self,
        nodes: &[WorkerNode],
        archive_path: &Utf8Path,
        component: &str,
        image_name: &str,
    ) -> Result<Vec<DistributionResult>, DistributionError> {
        let total = nodes.len();
        info!(
            self.log,
            "distributing {} to {} workers (parallelism: {})",
            component,
            total,
            self.policy.parallelism
        );

        let permits =
            Arc::new(Semaphore::new(self.policy.parallelism.max(1)));
        let mut handles = Vec::with_capacity(total);
        for node in nodes {
            let distributor = self.clone();
            let permits = Arc::clone(&permits);
            let node = node.clone();
            let archive_path = archive_path.to_owned();
            let component = component.to_owned();
            let image_name = image_name.to_owned();
            handles.push(tokio::spawn(async move {
                // The semaphore lives for the whole fan-out and is never
                // closed; if that invariant ever breaks, record the node as
                // failed instead of panicking inside the task.
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return DistributionResult {
                            node: node.name.clone(),
                            addr: node.addr.clone(),
                            component,
                            success: false,
                            duration: Duration::ZERO,
                            error: Some(DistributionError::TaskFailed {
                                node: node.name,
                                message: "distribution slot unavailable"
                                    .to_string(),
                            }),
                        };
                    }
                };
                distributor
                    .distribute_with_retries(
                        &node,
                        &archive_path,
                        &component,
                        &image_name,
                    )
                    .await
            }));
        }

        // Join in node-list order; each task owns exactly one result slot.
        let mut results = Vec::with_capacity(total);
        for (node, handle) in nodes.iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => results.push(DistributionResult {
                    node: node.name.clone(),
                    addr: node.addr.clone(),
                    component: component.to_owned(),
                    success: false,
                    duration: Duration::ZERO,
                    error: Some(DistributionError::TaskFailed {
                        node: node.name.clone(),
                        message: err.to_string(),
                    }),
                }),
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let required = self.policy.effective_min_workers(total);
        if succeeded < required {
            return Err(DistributionError::QuorumNotMet {
                succeeded,
                total,
                required,
                results,
            });
        }
        if succeeded < total {
            warn!(
                self.log,
                "image distributed to {}/{} workers (some failures)",
                succeeded,
                total
            );
            for result in results.iter().filter(|r| !r.success) {
                if let Some(error) = &result.error {
                    warn!(
                        self.log,
                        "[{}] ({}) {}", result.node, result.addr, error
                    );
                }
            }
        } else {
            info!(
                self.log,
                "image distributed to all {} workers", succeeded
            );
        }
        Ok(results)
    }

    async fn distribute_with_retries(
        &self,
        node: &WorkerNode,
        archive_path: &Utf8Path,
        component: &str,
        image_name: &str,
    ) -> DistributionResult {
        let attempts = self.policy.retry_count.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .distribute_to_node(node, archive_path, component, image_name)
                .await;
            if result.success || attempt >= attempts {
                if !result.success {
                    if let Some(error) = &result.error {
                        warn!(
                            self.log,
                            "[{}] failed after {} attempts: {}",
                            node.name,
                            attempts,
                            error
                        );
                    }
                }
                return result;
            }
            attempt += 1;
            info!(self.log, "[{}] retry {}/{}", node.name, attempt, attempts);
            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }
}

/// Everything before the final path segment of an image reference, asserted
/// at import time so the runtime stores the image under the reference the
/// manifests use. A bare reference with no registry prefix is returned
/// unchanged.
fn image_base_name(image_name: &str) -> &str {
    match image_name.rsplit_once('/') {
        Some((base, _)) => base,
        None => image_name,
    }
}
