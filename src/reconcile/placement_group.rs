/// Placement group reconciliation
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::hcloud::models::PlacementGroup;
use crate::infra::{CreatePlacementGroupRequest, InfrastructureManager};
use crate::naming;
use crate::observe::Observer;

use super::{get_or_create, owner_labels, roles};

/// Ensures the spread placement group for control-plane servers, so etcd
/// members land on distinct hypervisors.
pub struct PlacementGroupReconciler {
    infra: Arc<dyn InfrastructureManager>,
}

impl PlacementGroupReconciler {
    pub fn new(infra: Arc<dyn InfrastructureManager>) -> Self {
        Self { infra }
    }

    pub async fn ensure(
        &self,
        config: &Config,
        observer: &Arc<dyn Observer>,
    ) -> Result<PlacementGroup> {
        let name = naming::placement_group(&config.cluster_name, roles::CONTROL_PLANE);

        let request = CreatePlacementGroupRequest {
            name: name.clone(),
            group_type: "spread".to_string(),
            labels: owner_labels(&config.cluster_name, roles::PLACEMENT_GROUP),
        };

        get_or_create(
            "placement-group",
            &name,
            &config.cluster_name,
            observer,
            || self.infra.get_placement_group_by_name(&name),
            || async {
                info!("creating placement group {}", name);
                self.infra
                    .create_placement_group(request)
                    .await
                    .context("failed to create placement group")
            },
            |pg: &PlacementGroup| &pg.labels,
        )
        .await
    }
}
