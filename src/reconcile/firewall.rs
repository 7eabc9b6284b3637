/// Firewall reconciliation
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::hcloud::models::{Firewall, FirewallRule};
use crate::infra::{CreateFirewallRequest, InfrastructureManager};
use crate::naming;
use crate::observe::Observer;

use super::{get_or_create, owner_labels, roles};

const TALOS_API_PORT: &str = "50000";
const KUBE_API_PORT: &str = "6443";

/// Ensures the cluster firewall exists with the admin-access rules.
///
/// Only the Talos and Kubernetes API ports are restricted to the operator's
/// addresses; ingress traffic flows through the load balancer, which the
/// firewall does not see.
pub struct FirewallReconciler {
    infra: Arc<dyn InfrastructureManager>,
}

impl FirewallReconciler {
    pub fn new(infra: Arc<dyn InfrastructureManager>) -> Self {
        Self { infra }
    }

    pub async fn ensure(&self, config: &Config, observer: &Arc<dyn Observer>) -> Result<Firewall> {
        let name = naming::firewall(&config.cluster_name);
        let rules = admin_rules(&config.firewall_source_ips);

        let request = CreateFirewallRequest {
            name: name.clone(),
            rules,
            labels: owner_labels(&config.cluster_name, roles::FIREWALL),
        };

        get_or_create(
            "firewall",
            &name,
            &config.cluster_name,
            observer,
            || self.infra.get_firewall_by_name(&name),
            || async {
                info!(
                    "creating firewall {} (allowed sources: {})",
                    name,
                    config.firewall_source_ips.join(", ")
                );
                self.infra
                    .create_firewall(request)
                    .await
                    .context("failed to create firewall")
            },
            |firewall: &Firewall| &firewall.labels,
        )
        .await
    }

    /// Apply the firewall to servers that are not yet covered.
    pub async fn apply_to(&self, firewall: &Firewall, server_ids: &[u64]) -> Result<()> {
        let missing: Vec<u64> = server_ids
            .iter()
            .copied()
            .filter(|&id| {
                !firewall
                    .applied_to
                    .iter()
                    .any(|r| r.server.as_ref().is_some_and(|s| s.id == id))
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.infra
            .apply_firewall_to_servers(firewall.id, &missing)
            .await
            .context("failed to apply firewall to servers")
    }
}

fn admin_rules(source_ips: &[String]) -> Vec<FirewallRule> {
    let sources: Vec<String> = source_ips
        .iter()
        .map(|ip| {
            if ip.contains('/') {
                ip.clone()
            } else if ip.contains(':') {
                format!("{}/128", ip)
            } else {
                format!("{}/32", ip)
            }
        })
        .collect();

    [TALOS_API_PORT, KUBE_API_PORT]
        .iter()
        .map(|port| FirewallRule {
            direction: "in".to_string(),
            source_ips: sources.clone(),
            destination_ips: Vec::new(),
            protocol: "tcp".to_string(),
            port: Some(port.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::infra::FakeInfrastructure;
    use crate::observe::RecordingObserver;

    #[tokio::test]
    async fn test_rules_restrict_admin_ports_only() {
        let rules = admin_rules(&["198.51.100.7".to_string(), "2001:db8::7/128".to_string()]);
        assert_eq!(rules.len(), 2);
        for rule in &rules {
            assert_eq!(
                rule.source_ips,
                vec!["198.51.100.7/32".to_string(), "2001:db8::7/128".to_string()]
            );
        }
        let ports: Vec<&str> = rules.iter().filter_map(|r| r.port.as_deref()).collect();
        assert_eq!(ports, vec!["50000", "6443"]);
    }

    #[tokio::test]
    async fn test_ensure_and_apply() {
        let fake = Arc::new(FakeInfrastructure::new());
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let reconciler = FirewallReconciler::new(fake.clone());
        let config = test_config("test");

        let first = reconciler.ensure(&config, &observer).await.unwrap();
        let second = reconciler.ensure(&config, &observer).await.unwrap();
        assert_eq!(first.id, second.id);

        let server = fake.seed_server(
            "test-cp-01",
            "192.0.2.1",
            super::super::owner_labels("test", roles::CONTROL_PLANE),
        );
        reconciler.apply_to(&second, &[server]).await.unwrap();

        let refreshed = fake
            .get_firewall_by_name("test-firewall")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.applied_to.len(), 1);

        // Re-applying to an already-covered server is a no-op.
        reconciler.apply_to(&refreshed, &[server]).await.unwrap();
    }
}
