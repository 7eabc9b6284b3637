/// Server reconciliation for control planes and workers
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tracing::info;

use crate::config::Config;
use crate::crd::BootstrapState;
use crate::errors::ProvisionError;
use crate::hcloud::models::Server;
use crate::infra::{
    CreateServerRequest, InfrastructureManager, LabelSelector, NetworkAttachment,
};
use crate::netplan::NetworkPlan;
use crate::observe::Observer;

use super::{get_or_create, owner_labels, role_selector, roles, LABEL_NODE_ROLE, LABEL_POOL};

/// Default bound on parallel worker-server creation.
pub const WORKER_CREATE_CONCURRENCY: usize = 4;

/// Everything a node creation needs besides the server itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfraRefs {
    pub network_id: u64,
    pub firewall_id: u64,
    pub placement_group_id: Option<u64>,
    pub ssh_key_id: u64,
}

/// One concrete server to converge on.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub role: &'static str,
    pub pool: String,
    pub server_type: String,
    pub private_ip: String,
    pub user_data: String,
}

/// Labels for a node server: the ownership set plus scheduling metadata.
pub fn node_labels(cluster_name: &str, role: &str, pool: &str) -> HashMap<String, String> {
    let mut labels = owner_labels(cluster_name, role);
    labels.insert(LABEL_NODE_ROLE.to_string(), role.to_string());
    labels.insert(LABEL_POOL.to_string(), pool.to_string());
    labels
}

pub struct ServerReconciler {
    infra: Arc<dyn InfrastructureManager>,
}

impl ServerReconciler {
    pub fn new(infra: Arc<dyn InfrastructureManager>) -> Self {
        Self { infra }
    }

    /// This cluster's control-plane servers, lexicographic by name.
    pub async fn list_control_planes(&self, cluster_name: &str) -> Result<Vec<Server>> {
        self.list_role(cluster_name, roles::CONTROL_PLANE).await
    }

    /// This cluster's worker servers, lexicographic by name.
    pub async fn list_workers(&self, cluster_name: &str) -> Result<Vec<Server>> {
        self.list_role(cluster_name, roles::WORKER).await
    }

    async fn list_role(&self, cluster_name: &str, role: &str) -> Result<Vec<Server>> {
        let mut servers = self
            .infra
            .list_servers(&role_selector(cluster_name, role))
            .await?;
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    /// Idempotently converge one node server.
    pub async fn ensure_node(
        &self,
        config: &Config,
        node: &NodeSpec,
        refs: InfraRefs,
        snapshot_id: u64,
        observer: &Arc<dyn Observer>,
    ) -> Result<Server> {
        let request = CreateServerRequest {
            name: node.name.clone(),
            server_type: node.server_type.clone(),
            location: config.location.clone(),
            image: snapshot_id.to_string(),
            ssh_key_ids: vec![refs.ssh_key_id],
            user_data: Some(node.user_data.clone()),
            network: Some(NetworkAttachment {
                network_id: refs.network_id,
                private_ip: node.private_ip.clone(),
            }),
            firewall_ids: vec![refs.firewall_id],
            placement_group_id: refs.placement_group_id,
            labels: node_labels(&config.cluster_name, node.role, &node.pool),
        };

        get_or_create(
            "server",
            &node.name,
            &config.cluster_name,
            observer,
            || self.infra.get_server_by_name(&node.name),
            || async {
                info!(
                    "creating {} server {} (type {}, private IP {})",
                    node.role, node.name, node.server_type, node.private_ip
                );
                self.infra
                    .create_server(request)
                    .await
                    .with_context(|| format!("failed to create server {}", node.name))
            },
            |server: &Server| &server.labels,
        )
        .await
    }

    /// Create many nodes with bounded parallelism. Results come back in the
    /// order of `specs`; ordering inside the bound is irrelevant.
    pub async fn ensure_nodes_parallel(
        &self,
        config: &Config,
        specs: Vec<NodeSpec>,
        refs: InfraRefs,
        snapshot_id: u64,
        concurrency: usize,
        observer: &Arc<dyn Observer>,
    ) -> Result<Vec<Server>> {
        let results: Vec<Result<Server>> = stream::iter(specs.into_iter().map(|spec| {
            let observer = observer.clone();
            async move {
                self.ensure_node(config, &spec, refs, snapshot_id, &observer)
                    .await
            }
        }))
        .buffered(concurrency)
        .collect()
        .await;

        results.into_iter().collect()
    }

    /// Retro-attach the CLI-created bootstrap node to the network.
    ///
    /// The bootstrap node's private address is pinned, so before attaching we
    /// look at who currently holds it; a different server on that address is
    /// surfaced as a conflict rather than double-assigned.
    pub async fn attach_bootstrap_node(
        &self,
        config: &Config,
        plan: &NetworkPlan,
        network_id: u64,
        bootstrap: &BootstrapState,
    ) -> Result<Option<Server>> {
        let Some(node_id) = bootstrap.bootstrap_node_id else {
            return Ok(None);
        };

        let server = self
            .infra
            .get_server(node_id)
            .await
            .context("failed to fetch bootstrap node")?;

        if server.private_ip_on(network_id).is_some() {
            return Ok(Some(server));
        }

        let pinned_ip = plan.bootstrap_ip.to_string();
        let attachments = self.infra.list_network_attachments(network_id).await?;
        if let Some(holder) = attachments.iter().find(|a| a.ip == pinned_ip) {
            if holder.server_id != node_id {
                return Err(ProvisionError::OwnershipConflict {
                    kind: "network-attachment",
                    name: format!("{} ({})", pinned_ip, holder.server_name),
                    cluster: config.cluster_name.clone(),
                }
                .into());
            }
            return Ok(Some(server));
        }

        info!(
            "attaching bootstrap node {} to network at {}",
            server.name, pinned_ip
        );
        self.infra
            .attach_server_to_network(node_id, network_id, &pinned_ip)
            .await
            .context("failed to attach bootstrap node to network")?;

        Ok(Some(self.infra.get_server(node_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::infra::FakeInfrastructure;
    use crate::naming;
    use crate::observe::{Observer, RecordingObserver};

    async fn infra_refs(fake: &Arc<FakeInfrastructure>) -> InfraRefs {
        let network = fake
            .create_network(crate::infra::CreateNetworkRequest {
                name: "test-network".to_string(),
                ip_range: "10.0.0.0/16".to_string(),
                subnets: Vec::new(),
                labels: owner_labels("test", roles::NETWORK),
            })
            .await
            .unwrap();
        let firewall = fake
            .create_firewall(crate::infra::CreateFirewallRequest {
                name: "test-firewall".to_string(),
                rules: Vec::new(),
                labels: owner_labels("test", roles::FIREWALL),
            })
            .await
            .unwrap();
        let key = fake
            .create_ssh_key("test-k8zner", "ssh-ed25519 AAAA", owner_labels("test", roles::SSH_KEY))
            .await
            .unwrap();
        InfraRefs {
            network_id: network.id,
            firewall_id: firewall.id,
            placement_group_id: None,
            ssh_key_id: key.id,
        }
    }

    fn node(ordinal: u32) -> NodeSpec {
        NodeSpec {
            name: naming::control_plane_server("test", ordinal),
            role: roles::CONTROL_PLANE,
            pool: "cp".to_string(),
            server_type: "cx23".to_string(),
            private_ip: format!("10.0.0.{}", ordinal + 1),
            user_data: "#machine-config".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_node_is_idempotent() {
        let fake = Arc::new(FakeInfrastructure::new());
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let reconciler = ServerReconciler::new(fake.clone());
        let config = test_config("test");
        let refs = infra_refs(&fake).await;

        let first = reconciler
            .ensure_node(&config, &node(1), refs, 99, &observer)
            .await
            .unwrap();
        let second = reconciler
            .ensure_node(&config, &node(1), refs, 99, &observer)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(fake.server_count(), 1);
        assert_eq!(second.labels.get("node-role").unwrap(), "control-plane");
        assert_eq!(second.labels.get("pool").unwrap(), "cp");
    }

    #[tokio::test]
    async fn test_listing_is_label_scoped_and_sorted() {
        let fake = Arc::new(FakeInfrastructure::new());
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let reconciler = ServerReconciler::new(fake.clone());
        let config = test_config("test");
        let refs = infra_refs(&fake).await;

        for ordinal in [2, 1, 3] {
            reconciler
                .ensure_node(&config, &node(ordinal), refs, 99, &observer)
                .await
                .unwrap();
        }
        fake.seed_server("other-cp-01", "192.0.2.9", node_labels("other", roles::CONTROL_PLANE, "cp"));

        let listed = reconciler.list_control_planes("test").await.unwrap();
        let names: Vec<&str> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["test-cp-01", "test-cp-02", "test-cp-03"]);
    }

    #[tokio::test]
    async fn test_parallel_worker_creation() {
        let fake = Arc::new(FakeInfrastructure::new());
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let reconciler = ServerReconciler::new(fake.clone());
        let config = test_config("test");
        let refs = infra_refs(&fake).await;

        let specs: Vec<NodeSpec> = (1..=6)
            .map(|i| NodeSpec {
                name: naming::worker_server("test", "worker", i),
                role: roles::WORKER,
                pool: "worker".to_string(),
                server_type: "cx23".to_string(),
                private_ip: format!("10.0.0.{}", 129 + i),
                user_data: "#machine-config".to_string(),
            })
            .collect();

        let servers = reconciler
            .ensure_nodes_parallel(&config, specs, refs, 99, WORKER_CREATE_CONCURRENCY, &observer)
            .await
            .unwrap();
        assert_eq!(servers.len(), 6);
        assert_eq!(fake.server_count(), 6);
    }

    #[tokio::test]
    async fn test_bootstrap_retro_attachment() {
        let fake = Arc::new(FakeInfrastructure::new());
        let reconciler = ServerReconciler::new(fake.clone());
        let config = test_config("test");
        let plan = NetworkPlan::new(&config.network_cidr).unwrap();
        let refs = infra_refs(&fake).await;

        let node_id = fake.seed_server(
            "test-cp-01",
            "5.5.5.5",
            node_labels("test", roles::CONTROL_PLANE, "cp"),
        );
        let bootstrap = BootstrapState {
            completed: true,
            bootstrap_node: Some("cp-01".to_string()),
            bootstrap_node_id: Some(node_id),
            public_ip: Some("5.5.5.5".to_string()),
            completed_at: None,
        };

        let attached = reconciler
            .attach_bootstrap_node(&config, &plan, refs.network_id, &bootstrap)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            attached.private_ip_on(refs.network_id).unwrap(),
            "10.0.0.2"
        );

        // Second pass observes the attachment and does nothing.
        let again = reconciler
            .attach_bootstrap_node(&config, &plan, refs.network_id, &bootstrap)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, attached.id);
    }

    #[tokio::test]
    async fn test_bootstrap_attachment_conflict_on_taken_ip() {
        let fake = Arc::new(FakeInfrastructure::new());
        let reconciler = ServerReconciler::new(fake.clone());
        let config = test_config("test");
        let plan = NetworkPlan::new(&config.network_cidr).unwrap();
        let refs = infra_refs(&fake).await;

        let squatter = fake.seed_server(
            "squatter",
            "192.0.2.50",
            node_labels("test", roles::WORKER, "worker"),
        );
        fake.attach_server_to_network(squatter, refs.network_id, "10.0.0.2")
            .await
            .unwrap();

        let node_id = fake.seed_server(
            "test-cp-01",
            "5.5.5.5",
            node_labels("test", roles::CONTROL_PLANE, "cp"),
        );
        let bootstrap = BootstrapState {
            completed: true,
            bootstrap_node_id: Some(node_id),
            ..BootstrapState::default()
        };

        let err = reconciler
            .attach_bootstrap_node(&config, &plan, refs.network_id, &bootstrap)
            .await
            .unwrap_err();
        assert_eq!(crate::errors::reason_for(&err), "OwnershipConflict");
    }
}
