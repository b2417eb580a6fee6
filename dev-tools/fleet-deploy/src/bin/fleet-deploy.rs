// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Push a locally-exported container image archive to every worker node of a
//! cluster over SSH and import it into each node's container runtime.
//!
//! This is the deployment driver around the `fleet-distribution` library:
//! resolve the worker set, prove connectivity, distribute the archive, then
//! audit that the image is registered fleet-wide.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fleet_distribution::{
    policy, resolve_nodes, Distributor, DistributorPolicy, KubectlNodeLister,
    SshChannel, SshConfig,
};
use slog::{info, warn, Drain, Logger};
use slog_term::{FullFormat, TermDecorator};

#[derive(Debug, Parser)]
#[clap(
    name = "fleet-deploy",
    about = "Distribute a container image archive to cluster workers over SSH"
)]
struct Args {
    /// Path to the exported image archive
    #[clap(long)]
    archive: Utf8PathBuf,

    /// Component name, used for reporting
    #[clap(long)]
    component: String,

    /// Image reference the archive must be registered under
    /// (e.g. registry.example.io/project/backend:latest)
    #[clap(long)]
    image: String,

    /// Comma-separated worker addresses; overrides cluster discovery
    #[clap(long, value_delimiter = ',')]
    workers: Vec<String>,

    /// Path to the kubeconfig used for worker discovery
    #[clap(long)]
    kubeconfig: Option<Utf8PathBuf>,

    #[clap(long, default_value = policy::DEFAULT_SSH_USER)]
    ssh_user: String,

    #[clap(long, default_value = "~/.ssh/id_rsa")]
    ssh_key: Utf8PathBuf,

    #[clap(long, default_value_t = policy::DEFAULT_SSH_PORT)]
    ssh_port: u16,

    /// SSH dial and command timeout, in seconds
    #[clap(long, default_value_t = 30)]
    ssh_timeout: u64,

    /// Directory on each worker that receives the archive
    #[clap(long, default_value = policy::DEFAULT_REMOTE_TEMP_DIR)]
    worker_temp_dir: Utf8PathBuf,

    /// Maximum concurrent transfers
    #[clap(long, default_value_t = policy::DEFAULT_PARALLELISM)]
    parallel_workers: usize,

    /// Attempts per worker before recording it as failed
    #[clap(long, default_value_t = policy::DEFAULT_RETRY_COUNT)]
    retry_count: usize,

    /// Minimum workers that must succeed; 0 requires all of them
    #[clap(long, default_value_t = 0)]
    min_workers: usize,

    /// Leave transferred archives on the workers for debugging
    #[clap(long)]
    skip_worker_cleanup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = Logger::root(drain, slog::o!());

    let key_path = expand_home(&args.ssh_key)
        .context("failed to expand ssh key path")?;
    let ssh_config = SshConfig {
        user: args.ssh_user,
        key_path,
        port: args.ssh_port,
        timeout: Duration::from_secs(args.ssh_timeout),
    };
    let distribution_policy = DistributorPolicy {
        parallelism: args.parallel_workers,
        retry_count: args.retry_count,
        min_workers: args.min_workers,
        keep_artifacts: args.skip_worker_cleanup,
        explicit_nodes: args.workers,
        remote_temp_dir: args.worker_temp_dir,
        ..Default::default()
    };

    let lister = KubectlNodeLister::new(&logger, args.kubeconfig);
    let mut workers =
        resolve_nodes(&logger, &distribution_policy, &lister)
            .await
            .context("failed to resolve worker nodes")?;
    info!(logger, "found {} worker nodes", workers.len());
    for worker in &workers {
        info!(logger, "  - {} ({})", worker.name, worker.addr);
    }

    let channel = SshChannel::new(&logger, ssh_config);
    let distributor =
        Distributor::new(&logger, channel, distribution_policy);

    info!(logger, "testing ssh connectivity to all workers");
    distributor
        .test_connectivity(&mut workers)
        .await
        .context("ssh connectivity test failed")?;
    info!(logger, "all workers reachable");

    let results = distributor
        .distribute_to_all_nodes(
            &workers,
            &args.archive,
            &args.component,
            &args.image,
        )
        .await
        .with_context(|| {
            format!("failed to distribute {}", args.component)
        })?;
    let succeeded = results.iter().filter(|r| r.success).count();
    info!(
        logger,
        "distributed {} to {}/{} workers",
        args.component,
        succeeded,
        workers.len()
    );

    info!(logger, "verifying image on all workers");
    let mut verified = 0;
    for worker in &workers {
        match distributor.verify_import_on_node(worker, &args.image).await {
            Ok(()) => {
                verified += 1;
                info!(logger, "  {} has {}", worker.name, args.image);
            }
            Err(err) => {
                warn!(logger, "  verification failed on {}: {}", worker.name, err);
            }
        }
    }
    let required =
        distributor.policy().effective_min_workers(workers.len());
    ensure!(
        verified >= required,
        "image verified on only {}/{} workers (minimum: {})",
        verified,
        workers.len(),
        required
    );
    Ok(())
}

/// Expand a leading `~` against `$HOME`, as the shell would have.
fn expand_home(path: &Utf8Path) -> Result<Utf8PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("$HOME is not set")?;
            Ok(Utf8PathBuf::from(home).join(rest))
        }
        Err(_) => Ok(path.to_owned()),
    }
}
