/// Capability contract over the cloud provider
///
/// The reconcilers speak to this trait only; a real Hetzner Cloud
/// implementation and an in-memory fake behave identically from their
/// perspective, down to the typed conflict errors.
pub mod fake;
pub mod hcloud;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;

use crate::hcloud::models::{
    Firewall, FirewallRule, Image, LoadBalancer, LoadBalancerService, Network, PlacementGroup,
    Pricing, Server, SshKey,
};

pub use fake::FakeInfrastructure;
pub use hcloud::HcloudInfrastructure;

/// Label selector used for ownership-scoped lookups. Serialises to the
/// provider's `k=v,k=v` query form and doubles as an in-memory matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn to_query(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// True when every selector entry appears in `labels`.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|found| found == v))
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Provider-neutral create requests. The implementations map these onto
/// their wire formats.
#[derive(Debug, Clone)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub ip_range: String,
    pub subnets: Vec<SubnetSpec>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SubnetSpec {
    pub ip_range: String,
    pub network_zone: String,
}

#[derive(Debug, Clone)]
pub struct CreateFirewallRequest {
    pub name: String,
    pub rules: Vec<FirewallRule>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub lb_type: String,
    pub location: String,
    /// Private network to attach the balancer to.
    pub network_id: Option<u64>,
    pub services: Vec<LoadBalancerService>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreatePlacementGroupRequest {
    pub name: String,
    pub group_type: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub location: String,
    /// Image or snapshot ID to boot from.
    pub image: String,
    pub ssh_key_ids: Vec<u64>,
    pub user_data: Option<String>,
    /// Attach to this network with a fixed private address.
    pub network: Option<NetworkAttachment>,
    pub firewall_ids: Vec<u64>,
    pub placement_group_id: Option<u64>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    pub network_id: u64,
    pub private_ip: String,
}

/// A `(server, address)` pair attached to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub server_id: u64,
    pub server_name: String,
    pub ip: String,
}

/// The operations the core needs from the cloud IaaS.
#[async_trait]
pub trait InfrastructureManager: Send + Sync {
    // -- network --
    async fn get_network_by_name(&self, name: &str) -> Result<Option<Network>>;
    async fn create_network(&self, request: CreateNetworkRequest) -> Result<Network>;
    async fn delete_network(&self, id: u64) -> Result<()>;
    async fn attach_server_to_network(
        &self,
        server_id: u64,
        network_id: u64,
        private_ip: &str,
    ) -> Result<()>;
    /// Every `(server, address)` currently attached to the network.
    async fn list_network_attachments(&self, network_id: u64) -> Result<Vec<AttachmentInfo>>;

    // -- firewall --
    async fn get_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>>;
    async fn create_firewall(&self, request: CreateFirewallRequest) -> Result<Firewall>;
    async fn delete_firewall(&self, id: u64) -> Result<()>;
    async fn apply_firewall_to_servers(&self, firewall_id: u64, server_ids: &[u64]) -> Result<()>;

    // -- load balancer --
    async fn get_load_balancer(&self, id: u64) -> Result<LoadBalancer>;
    async fn get_load_balancer_by_name(&self, name: &str) -> Result<Option<LoadBalancer>>;
    async fn create_load_balancer(
        &self,
        request: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer>;
    async fn delete_load_balancer(&self, id: u64) -> Result<()>;
    async fn add_load_balancer_target(&self, lb_id: u64, server_id: u64) -> Result<()>;

    // -- placement group --
    async fn get_placement_group_by_name(&self, name: &str) -> Result<Option<PlacementGroup>>;
    async fn create_placement_group(
        &self,
        request: CreatePlacementGroupRequest,
    ) -> Result<PlacementGroup>;
    async fn delete_placement_group(&self, id: u64) -> Result<()>;

    // -- server --
    async fn get_server(&self, id: u64) -> Result<Server>;
    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>>;
    async fn list_servers(&self, selector: &LabelSelector) -> Result<Vec<Server>>;
    async fn create_server(&self, request: CreateServerRequest) -> Result<Server>;
    async fn delete_server(&self, id: u64) -> Result<()>;
    /// Boot the server into the rescue system; returns the rescue root
    /// password.
    async fn enable_rescue(&self, server_id: u64, ssh_key_ids: &[u64]) -> Result<String>;
    async fn reboot_server(&self, id: u64) -> Result<()>;
    async fn shutdown_server(&self, id: u64) -> Result<()>;

    // -- snapshot --
    async fn list_snapshots(&self, selector: &LabelSelector) -> Result<Vec<Image>>;
    async fn create_snapshot(
        &self,
        server_id: u64,
        description: &str,
        labels: HashMap<String, String>,
    ) -> Result<Image>;
    async fn delete_snapshot(&self, id: u64) -> Result<()>;

    // -- ssh key --
    async fn get_ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>>;
    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: HashMap<String, String>,
    ) -> Result<SshKey>;
    async fn delete_ssh_key(&self, id: u64) -> Result<()>;

    // -- pricing --
    async fn get_pricing(&self) -> Result<Pricing>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_query_is_sorted() {
        let selector = LabelSelector::new()
            .with("managed-by", "k8zner")
            .with("cluster", "test");
        assert_eq!(selector.to_query(), "cluster=test,managed-by=k8zner");
    }

    #[test]
    fn test_selector_matching() {
        let selector = LabelSelector::new()
            .with("cluster", "test")
            .with("role", "worker");

        let mut labels = HashMap::new();
        labels.insert("cluster".to_string(), "test".to_string());
        labels.insert("role".to_string(), "worker".to_string());
        labels.insert("extra".to_string(), "ignored".to_string());
        assert!(selector.matches(&labels));

        labels.insert("role".to_string(), "control-plane".to_string());
        assert!(!selector.matches(&labels));
    }
}
