// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker node registry.
//!
//! Resolves the list of distribution targets, either from an explicit
//! operator-supplied address list or by querying the cluster control API and
//! filtering out control-plane nodes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::Deserialize;
use slog::{debug, Logger};

use crate::policy::DistributorPolicy;

/// One distribution target.
///
/// The reachability fields are written only by connectivity testing, which
/// runs to completion before any concurrent distribution begins.
#[derive(Clone, Debug)]
pub struct WorkerNode {
    pub name: String,
    pub addr: String,
    pub reachable: bool,
    /// Rendered cause of the last connectivity failure, if any.
    pub last_error: Option<String>,
}

impl WorkerNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            reachable: false,
            last_error: None,
        }
    }
}

/// A node as reported by the cluster control API.
#[derive(Clone, Debug)]
pub struct ClusterNode {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub addresses: Vec<NodeAddress>,
}

#[derive(Clone, Debug)]
pub struct NodeAddress {
    /// Address type as reported by the API ("InternalIP", "Hostname", ...).
    pub kind: String,
    pub address: String,
}

impl ClusterNode {
    /// Control-plane nodes carry a role label such as
    /// `node-role.kubernetes.io/control-plane` or `.../master`.
    pub fn is_control_plane(&self) -> bool {
        self.labels
            .keys()
            .any(|key| key.contains("control-plane") || key.contains("master"))
    }

    pub fn internal_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|addr| addr.kind == "InternalIP")
            .map(|addr| addr.address.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no worker nodes found in cluster")]
    NoWorkersFound,

    #[error("failed to run kubectl")]
    ControlApiExec {
        #[source]
        source: std::io::Error,
    },

    #[error("cluster control API query failed ({status}): {stderr}")]
    ControlApiFailed { status: std::process::ExitStatus, stderr: String },

    #[error("failed to parse node list from the control API")]
    ControlApiParse {
        #[source]
        source: serde_json::Error,
    },
}

/// Narrow capability needed from the cluster control API: list the nodes.
#[async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, RegistryError>;
}

/// `NodeLister` backed by `kubectl get nodes -o json`.
pub struct KubectlNodeLister {
    log: Logger,
    kubeconfig: Option<Utf8PathBuf>,
}

impl KubectlNodeLister {
    pub fn new(log: &Logger, kubeconfig: Option<Utf8PathBuf>) -> Self {
        Self { log: log.clone(), kubeconfig }
    }
}

#[async_trait]
impl NodeLister for KubectlNodeLister {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, RegistryError> {
        let mut command = tokio::process::Command::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        command.args(["get", "nodes", "-o", "json"]);
        command.kill_on_drop(true);

        debug!(self.log, "querying cluster control API for nodes");
        let output = command
            .output()
            .await
            .map_err(|source| RegistryError::ControlApiExec { source })?;
        if !output.status.success() {
            return Err(RegistryError::ControlApiFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        parse_node_list(&output.stdout)
    }
}

/// Parse the `kubectl get nodes -o json` document into [`ClusterNode`]s.
fn parse_node_list(bytes: &[u8]) -> Result<Vec<ClusterNode>, RegistryError> {
    #[derive(Deserialize)]
    struct NodeList {
        items: Vec<Node>,
    }
    #[derive(Deserialize)]
    struct Node {
        metadata: Metadata,
        status: Status,
    }
    #[derive(Deserialize)]
    struct Metadata {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    }
    #[derive(Deserialize)]
    struct Status {
        #[serde(default)]
        addresses: Vec<Address>,
    }
    #[derive(Deserialize)]
    struct Address {
        #[serde(rename = "type")]
        kind: String,
        address: String,
    }

    let list: NodeList = serde_json::from_slice(bytes)
        .map_err(|source| RegistryError::ControlApiParse { source })?;
    Ok(list
        .items
        .into_iter()
        .map(|node| ClusterNode {
            name: node.metadata.name,
            labels: node.metadata.labels,
            addresses: node
                .status
                .addresses
                .into_iter()
                .map(|addr| NodeAddress {
                    kind: addr.kind,
                    address: addr.address,
                })
                .collect(),
        })
        .collect())
}

/// Resolve the distribution targets for `policy`.
///
/// An explicit node list in the policy wins and skips the control API
/// entirely; those nodes are named `worker-1..n` in list order. Discovered
/// nodes keep their control API names, drop control-plane nodes, and use the
/// internal address. Nodes without an internal address are skipped.
pub async fn resolve_nodes(
    log: &Logger,
    policy: &DistributorPolicy,
    lister: &dyn NodeLister,
) -> Result<Vec<WorkerNode>, RegistryError> {
    if !policy.explicit_nodes.is_empty() {
        debug!(log, "using explicit worker list: {:?}", policy.explicit_nodes);
        return Ok(policy
            .explicit_nodes
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                WorkerNode::new(format!("worker-{}", i + 1), addr.clone())
            })
            .collect());
    }

    debug!(log, "discovering workers from the cluster control API");
    let nodes = lister.list_nodes().await?;
    let mut workers = Vec::new();
    for node in nodes {
        if node.is_control_plane() {
            debug!(log, "skipping control-plane node: {}", node.name);
            continue;
        }
        let Some(addr) = node.internal_address() else {
            debug!(log, "node {} has no internal address; skipping", node.name);
            continue;
        };
        debug!(log, "found worker node {} at {}", node.name, addr);
        workers.push(WorkerNode::new(node.name.clone(), addr));
    }
    if workers.is_empty() {
        return Err(RegistryError::NoWorkersFound);
    }
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    // Trimmed-down capture of a real `kubectl get nodes -o json` response:
    // one control-plane node, two workers, one node with no InternalIP.
    const NODES_JSON: &str = r#"{
        "apiVersion": "v1",
        "items": [
            {
                "metadata": {
                    "name": "cp-0",
                    "labels": {
                        "node-role.kubernetes.io/control-plane": "true",
                        "kubernetes.io/hostname": "cp-0"
                    }
                },
                "status": {
                    "addresses": [
                        {"type": "InternalIP", "address": "10.0.0.10"},
                        {"type": "Hostname", "address": "cp-0"}
                    ]
                }
            },
            {
                "metadata": {
                    "name": "node-a",
                    "labels": {"kubernetes.io/hostname": "node-a"}
                },
                "status": {
                    "addresses": [
                        {"type": "Hostname", "address": "node-a"},
                        {"type": "InternalIP", "address": "10.0.0.11"}
                    ]
                }
            },
            {
                "metadata": {
                    "name": "node-b",
                    "labels": {"kubernetes.io/hostname": "node-b"}
                },
                "status": {
                    "addresses": [
                        {"type": "InternalIP", "address": "10.0.0.12"}
                    ]
                }
            },
            {
                "metadata": {
                    "name": "node-c",
                    "labels": {}
                },
                "status": {
                    "addresses": [
                        {"type": "Hostname", "address": "node-c"}
                    ]
                }
            }
        ],
        "kind": "List"
    }"#;

    struct StaticLister(Vec<ClusterNode>);

    #[async_trait]
    impl NodeLister for StaticLister {
        async fn list_nodes(&self) -> Result<Vec<ClusterNode>, RegistryError> {
            Ok(self.0.clone())
        }
    }

    struct FailingLister;

    #[async_trait]
    impl NodeLister for FailingLister {
        async fn list_nodes(&self) -> Result<Vec<ClusterNode>, RegistryError> {
            panic!("explicit node lists must not query the control API");
        }
    }

    #[tokio::test]
    async fn discovery_filters_control_plane_and_missing_addresses() {
        let nodes = parse_node_list(NODES_JSON.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 4);

        let workers = resolve_nodes(
            &test_logger(),
            &DistributorPolicy::default(),
            &StaticLister(nodes),
        )
        .await
        .unwrap();

        let summary: Vec<_> = workers
            .iter()
            .map(|w| (w.name.as_str(), w.addr.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![("node-a", "10.0.0.11"), ("node-b", "10.0.0.12")]
        );
        assert!(workers.iter().all(|w| !w.reachable));
    }

    #[tokio::test]
    async fn explicit_list_skips_discovery_and_names_deterministically() {
        let policy = DistributorPolicy {
            explicit_nodes: vec!["10.1.0.5".to_string(), "10.1.0.6".to_string()],
            ..Default::default()
        };
        let workers =
            resolve_nodes(&test_logger(), &policy, &FailingLister)
                .await
                .unwrap();
        assert_eq!(workers[0].name, "worker-1");
        assert_eq!(workers[0].addr, "10.1.0.5");
        assert_eq!(workers[1].name, "worker-2");
        assert_eq!(workers[1].addr, "10.1.0.6");
    }

    #[tokio::test]
    async fn all_control_plane_is_no_workers_found() {
        let nodes = vec![ClusterNode {
            name: "cp-0".to_string(),
            labels: [(
                "node-role.kubernetes.io/master".to_string(),
                "true".to_string(),
            )]
            .into_iter()
            .collect(),
            addresses: vec![NodeAddress {
                kind: "InternalIP".to_string(),
                address: "10.0.0.10".to_string(),
            }],
        }];
        let err = resolve_nodes(
            &test_logger(),
            &DistributorPolicy::default(),
            &StaticLister(nodes),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RegistryError::NoWorkersFound));
    }

    #[test]
    fn malformed_control_api_output_is_a_parse_error() {
        let err = parse_node_list(b"not json").unwrap_err();
        assert!(matches!(err, RegistryError::ControlApiParse { .. }));
    }
}
