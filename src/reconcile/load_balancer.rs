/// Kubernetes API load balancer reconciliation
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::hcloud::api_error;
use crate::hcloud::models::{LoadBalancer, LoadBalancerService};
use crate::infra::{CreateLoadBalancerRequest, InfrastructureManager};
use crate::naming;
use crate::observe::Observer;

use super::{get_or_create, owner_labels, roles};

pub const KUBE_API_PORT: u16 = 6443;
const LB_TYPE: &str = "lb11";

/// Ensures the control-plane endpoint load balancer.
pub struct LoadBalancerReconciler {
    infra: Arc<dyn InfrastructureManager>,
}

impl LoadBalancerReconciler {
    pub fn new(infra: Arc<dyn InfrastructureManager>) -> Self {
        Self { infra }
    }

    pub async fn ensure(
        &self,
        config: &Config,
        network_id: u64,
        observer: &Arc<dyn Observer>,
    ) -> Result<LoadBalancer> {
        let name = naming::kube_api_load_balancer(&config.cluster_name);

        let request = CreateLoadBalancerRequest {
            name: name.clone(),
            lb_type: LB_TYPE.to_string(),
            location: config.location.clone(),
            network_id: Some(network_id),
            services: vec![LoadBalancerService {
                protocol: "tcp".to_string(),
                listen_port: KUBE_API_PORT,
                destination_port: KUBE_API_PORT,
            }],
            labels: owner_labels(&config.cluster_name, roles::LOAD_BALANCER),
        };

        get_or_create(
            "load-balancer",
            &name,
            &config.cluster_name,
            observer,
            || self.infra.get_load_balancer_by_name(&name),
            || async {
                info!("creating load balancer {}", name);
                self.infra
                    .create_load_balancer(request)
                    .await
                    .context("failed to create load balancer")
            },
            |lb: &LoadBalancer| &lb.labels,
        )
        .await
    }

    /// Add a control-plane server as a target; already-present targets no-op.
    pub async fn ensure_target(&self, lb: &LoadBalancer, server_id: u64) -> Result<()> {
        if lb.has_target(server_id) {
            return Ok(());
        }
        match self.infra.add_load_balancer_target(lb.id, server_id).await {
            Ok(()) => Ok(()),
            // A concurrent reconcile added the same target first.
            Err(err) if api_error(&err).is_some_and(|e| e.is_conflict()) => Ok(()),
            Err(err) => Err(err).context("failed to add load balancer target"),
        }
    }
}
