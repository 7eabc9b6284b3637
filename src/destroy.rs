/// Cluster teardown
///
/// Deletes everything this cluster owns, in reverse dependency order, and
/// nothing it does not: every deletion is label-scoped, and a same-named
/// foreign resource is left standing with a warning.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::ProvisionError;
use crate::hcloud::api_error;
use crate::infra::InfrastructureManager;
use crate::naming;
use crate::observe::{Event, Observer};
use crate::reconcile::{owner_selector, roles, verify_ownership};

const FIREWALL_DETACH_ATTEMPTS: u32 = 12;
const FIREWALL_DETACH_DELAY: Duration = Duration::from_secs(5);

pub struct Destroyer {
    infra: Arc<dyn InfrastructureManager>,
}

impl Destroyer {
    pub fn new(infra: Arc<dyn InfrastructureManager>) -> Self {
        Self { infra }
    }

    /// Remove all owned resources. Idempotent: missing resources are
    /// skipped, so a half-destroyed cluster converges on a later attempt.
    pub async fn destroy(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        info!("destroying cluster {}", cluster_name);

        self.delete_servers(cluster_name, cancel).await?;
        self.delete_load_balancer(cluster_name).await?;
        self.delete_placement_group(cluster_name).await?;
        self.delete_firewall(cluster_name, cancel).await?;
        self.delete_ssh_keys(cluster_name).await?;
        self.delete_snapshots(cluster_name).await?;
        self.delete_network(cluster_name).await?;

        observer.event(Event::info(format!("cluster {} destroyed", cluster_name)));
        Ok(())
    }

    async fn delete_servers(&self, cluster_name: &str, cancel: &CancellationToken) -> Result<()> {
        let servers = self
            .infra
            .list_servers(&owner_selector(cluster_name))
            .await?;
        if servers.is_empty() {
            info!("no servers to delete for {}", cluster_name);
            return Ok(());
        }

        for server in servers {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled.into());
            }
            info!("deleting server {} (ID {})", server.name, server.id);
            if let Err(e) = self.infra.delete_server(server.id).await {
                warn!("failed to delete server {}: {:#}", server.name, e);
            }
        }
        Ok(())
    }

    async fn delete_load_balancer(&self, cluster_name: &str) -> Result<()> {
        let name = naming::kube_api_load_balancer(cluster_name);
        if let Some(lb) = self.infra.get_load_balancer_by_name(&name).await? {
            if verify_ownership("load-balancer", &name, cluster_name, &lb.labels).is_err() {
                warn!("load balancer {} is not ours, leaving it", name);
                return Ok(());
            }
            info!("deleting load balancer {} (ID {})", name, lb.id);
            self.infra
                .delete_load_balancer(lb.id)
                .await
                .context("failed to delete load balancer")?;
        }
        Ok(())
    }

    async fn delete_placement_group(&self, cluster_name: &str) -> Result<()> {
        let name = naming::placement_group(cluster_name, roles::CONTROL_PLANE);
        if let Some(pg) = self.infra.get_placement_group_by_name(&name).await? {
            if verify_ownership("placement-group", &name, cluster_name, &pg.labels).is_err() {
                warn!("placement group {} is not ours, leaving it", name);
                return Ok(());
            }
            info!("deleting placement group {} (ID {})", name, pg.id);
            self.infra
                .delete_placement_group(pg.id)
                .await
                .context("failed to delete placement group")?;
        }
        Ok(())
    }

    /// The firewall may still be applied while servers are mid-deletion;
    /// retry for a bounded window.
    async fn delete_firewall(&self, cluster_name: &str, cancel: &CancellationToken) -> Result<()> {
        let name = naming::firewall(cluster_name);
        let Some(firewall) = self.infra.get_firewall_by_name(&name).await? else {
            return Ok(());
        };
        if verify_ownership("firewall", &name, cluster_name, &firewall.labels).is_err() {
            warn!("firewall {} is not ours, leaving it", name);
            return Ok(());
        }

        info!("deleting firewall {} (ID {})", name, firewall.id);
        for attempt in 1..=FIREWALL_DETACH_ATTEMPTS {
            match self.infra.delete_firewall(firewall.id).await {
                Ok(()) => return Ok(()),
                Err(e) if api_error(&e).is_some_and(|err| err.is_resource_in_use()) => {
                    if attempt == FIREWALL_DETACH_ATTEMPTS {
                        return Err(e)
                            .context("firewall still in use after waiting for server deletion");
                    }
                    info!(
                        "firewall still in use, waiting for servers ({}/{})",
                        attempt, FIREWALL_DETACH_ATTEMPTS
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
                        _ = tokio::time::sleep(FIREWALL_DETACH_DELAY) => {}
                    }
                }
                Err(e) => return Err(e).context("failed to delete firewall"),
            }
        }
        Ok(())
    }

    async fn delete_ssh_keys(&self, cluster_name: &str) -> Result<()> {
        for name in [
            naming::ssh_key(cluster_name),
            naming::image_builder(cluster_name),
        ] {
            if let Some(key) = self.infra.get_ssh_key_by_name(&name).await? {
                if verify_ownership("ssh-key", &name, cluster_name, &key.labels).is_err() {
                    warn!("SSH key {} is not ours, leaving it", name);
                    continue;
                }
                info!("deleting SSH key {} (ID {})", name, key.id);
                self.infra
                    .delete_ssh_key(key.id)
                    .await
                    .context("failed to delete SSH key")?;
            }
        }
        Ok(())
    }

    async fn delete_snapshots(&self, cluster_name: &str) -> Result<()> {
        let snapshots = self
            .infra
            .list_snapshots(&owner_selector(cluster_name))
            .await?;
        for snapshot in snapshots {
            info!("deleting snapshot {} (ID {})", snapshot.description, snapshot.id);
            if let Err(e) = self.infra.delete_snapshot(snapshot.id).await {
                warn!("failed to delete snapshot {}: {:#}", snapshot.id, e);
            }
        }
        Ok(())
    }

    async fn delete_network(&self, cluster_name: &str) -> Result<()> {
        let name = naming::network(cluster_name);
        if let Some(network) = self.infra.get_network_by_name(&name).await? {
            if verify_ownership("network", &name, cluster_name, &network.labels).is_err() {
                warn!("network {} is not ours, leaving it", name);
                return Ok(());
            }
            info!("deleting network {} (ID {})", name, network.id);
            self.infra
                .delete_network(network.id)
                .await
                .context("failed to delete network")?;
        } else {
            info!("network {} already gone", name);
        }
        Ok(())
    }
}
