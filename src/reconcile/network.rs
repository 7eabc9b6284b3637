/// Private network reconciliation
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{network_zone, Config};
use crate::hcloud::models::Network;
use crate::infra::{CreateNetworkRequest, InfrastructureManager, SubnetSpec};
use crate::naming;
use crate::netplan::NetworkPlan;
use crate::observe::Observer;

use super::{get_or_create, owner_labels, roles};

/// Ensures the cluster network with its role subnets exists and is ours.
pub struct NetworkReconciler {
    infra: Arc<dyn InfrastructureManager>,
}

impl NetworkReconciler {
    pub fn new(infra: Arc<dyn InfrastructureManager>) -> Self {
        Self { infra }
    }

    pub async fn ensure(
        &self,
        config: &Config,
        plan: &NetworkPlan,
        observer: &Arc<dyn Observer>,
    ) -> Result<Network> {
        let name = naming::network(&config.cluster_name);
        let zone = network_zone(&config.location);

        let request = CreateNetworkRequest {
            name: name.clone(),
            ip_range: plan.root.to_string(),
            subnets: vec![
                SubnetSpec {
                    ip_range: plan.control_plane.to_string(),
                    network_zone: zone.to_string(),
                },
                SubnetSpec {
                    ip_range: plan.worker.to_string(),
                    network_zone: zone.to_string(),
                },
                SubnetSpec {
                    ip_range: plan.ingress.to_string(),
                    network_zone: zone.to_string(),
                },
            ],
            labels: owner_labels(&config.cluster_name, roles::NETWORK),
        };

        let network = get_or_create(
            "network",
            &name,
            &config.cluster_name,
            observer,
            || self.infra.get_network_by_name(&name),
            || async {
                info!("creating private network {} ({})", name, plan.root);
                self.infra
                    .create_network(request)
                    .await
                    .context("failed to create network")
            },
            |network: &Network| &network.labels,
        )
        .await?;

        Ok(network)
    }
}
