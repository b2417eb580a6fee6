// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet image distribution for clusters without a shared registry.
//!
//! This crate takes a locally-exported container image archive and lands it,
//! verified and registered, in the local container runtime of every worker
//! node of a cluster, using only remote-shell access. There is no registry to
//! push to and no shared filesystem; the archive is streamed to each node
//! over SSH, imported into containerd under the exact reference the
//! deployment manifests expect, and independently verified.
//!
//! The pieces, leaf-first:
//!
//! - [`channel`]: opens an authenticated SSH connection to one node and
//!   either runs a command (with a hard timeout) or streams a local file to a
//!   remote path.
//! - [`node`]: produces the list of target [`WorkerNode`]s, either from an
//!   operator-supplied address list or by querying the cluster control API
//!   and filtering out control-plane nodes.
//! - [`distributor`]: drives the per-node transfer + import + verify +
//!   cleanup pipeline concurrently across the node set, bounded by
//!   [`DistributorPolicy::parallelism`], and decides whether the run
//!   succeeded based on [`DistributorPolicy::min_workers`].
//!
//! Distribution is at-least-once with a verified outcome per node: a node
//! either ends up fully imported-and-verified or is recorded as failed with
//! the innermost cause.

pub mod channel;
pub mod distributor;
pub mod errors;
pub mod node;
pub mod policy;

pub use channel::{ChannelError, RemoteChannel, SshChannel};
pub use distributor::{DistributionResult, Distributor, CONTAINERD_NAMESPACE};
pub use errors::{DistributionError, RemoteFailureClass};
pub use node::{
    resolve_nodes, ClusterNode, KubectlNodeLister, NodeAddress, NodeLister,
    RegistryError, WorkerNode,
};
pub use policy::{DistributorPolicy, SshConfig};
