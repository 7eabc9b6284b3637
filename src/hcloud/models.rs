/// Hetzner Cloud API data models
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Server resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub server_type: ServerType,
    pub datacenter: Datacenter,
    pub public_net: PublicNetwork,
    #[serde(default)]
    pub private_net: Vec<PrivateNetwork>,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Server {
    /// Primary public IPv4, if any.
    pub fn public_ip(&self) -> Option<String> {
        self.public_net.ipv4.as_ref().map(|v4| v4.ip.clone())
    }

    /// Private address on the given network, if attached.
    pub fn private_ip_on(&self, network_id: u64) -> Option<String> {
        self.private_net
            .iter()
            .find(|net| net.network == network_id)
            .map(|net| net.ip.clone())
    }

    /// First private address regardless of network.
    pub fn private_ip(&self) -> Option<String> {
        self.private_net.first().map(|net| net.ip.clone())
    }
}

/// Server type information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerType {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub cores: u32,
    pub memory: f64,
    pub disk: u64,
    #[serde(default)]
    pub architecture: String,
}

/// Datacenter information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: u64,
    pub name: String,
    pub location: Location,
}

/// Location information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: u64,
    pub name: String,
    pub network_zone: String,
}

/// Public network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicNetwork {
    pub ipv4: Option<PublicIp>,
    pub ipv6: Option<PublicIp>,
}

/// Public address entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIp {
    pub ip: String,
}

/// Private network attachment on a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateNetwork {
    pub network: u64,
    pub ip: String,
}

/// Network resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: u64,
    pub name: String,
    pub ip_range: String,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub servers: Vec<u64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Network subnet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub ip_range: String,
    pub network_zone: String,
    #[serde(rename = "type")]
    pub subnet_type: String,
}

/// Firewall resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firewall {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
    #[serde(default)]
    pub applied_to: Vec<FirewallResource>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub direction: String,
    #[serde(default)]
    pub source_ips: Vec<String>,
    #[serde(default)]
    pub destination_ips: Vec<String>,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// Firewall resource attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub server: Option<ServerRef>,
}

/// Bare server reference used by attachments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRef {
    pub id: u64,
}

/// Load balancer resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: u64,
    pub name: String,
    pub public_net: LoadBalancerPublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNetwork>,
    #[serde(default)]
    pub services: Vec<LoadBalancerService>,
    #[serde(default)]
    pub targets: Vec<LoadBalancerTarget>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl LoadBalancer {
    pub fn public_ip(&self) -> Option<String> {
        self.public_net.ipv4.as_ref().map(|v4| v4.ip.clone())
    }

    pub fn private_ip(&self) -> Option<String> {
        self.private_net.first().map(|net| net.ip.clone())
    }

    /// True when at least one target reports healthy on `port`.
    pub fn has_healthy_target(&self, port: u16) -> bool {
        self.targets.iter().any(|target| {
            target
                .health_status
                .iter()
                .any(|h| h.listen_port == port && h.status == "healthy")
        })
    }

    pub fn has_target(&self, server_id: u64) -> bool {
        self.targets
            .iter()
            .any(|t| t.server.as_ref().is_some_and(|s| s.id == server_id))
    }
}

/// Load balancer public addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerPublicNet {
    pub ipv4: Option<PublicIp>,
    pub ipv6: Option<PublicIp>,
}

/// Load balancer service (frontend/backend port pair)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerService {
    pub protocol: String,
    pub listen_port: u16,
    pub destination_port: u16,
}

/// Load balancer target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    pub server: Option<ServerRef>,
    #[serde(default)]
    pub health_status: Vec<TargetHealth>,
}

/// Per-target per-port health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHealth {
    pub listen_port: u16,
    pub status: String,
}

/// Placement group resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub servers: Vec<u64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Image resource; snapshots are images of type "snapshot"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub status: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// SSH key resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub fingerprint: String,
    pub public_key: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Asynchronous provider-side operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub command: String,
    pub status: String,
    pub progress: u32,
    pub error: Option<ActionError>,
}

/// Action error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

/// Per-location monthly price for one server type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTypePricing {
    pub name: String,
    #[serde(default)]
    pub prices: Vec<LocationPrice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationPrice {
    pub location: String,
    pub price_monthly: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub gross: String,
}

/// Pricing catalogue, consumed read-only by the external cost estimator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub server_types: Vec<ServerTypePricing>,
}

// ---- response envelopes ----

#[derive(Debug, Deserialize)]
pub struct ServerResponse {
    pub server: Server,
}

#[derive(Debug, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServerResponse {
    pub server: Server,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub struct NetworkResponse {
    pub network: Network,
}

#[derive(Debug, Deserialize)]
pub struct NetworkListResponse {
    pub networks: Vec<Network>,
}

#[derive(Debug, Deserialize)]
pub struct FirewallResponse {
    pub firewall: Firewall,
}

#[derive(Debug, Deserialize)]
pub struct FirewallListResponse {
    pub firewalls: Vec<Firewall>,
}

#[derive(Debug, Deserialize)]
pub struct LoadBalancerResponse {
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Deserialize)]
pub struct LoadBalancerListResponse {
    pub load_balancers: Vec<LoadBalancer>,
}

#[derive(Debug, Deserialize)]
pub struct PlacementGroupResponse {
    pub placement_group: PlacementGroup,
}

#[derive(Debug, Deserialize)]
pub struct PlacementGroupListResponse {
    pub placement_groups: Vec<PlacementGroup>,
}

#[derive(Debug, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
pub struct SshKeyResponse {
    pub ssh_key: SshKey,
}

#[derive(Debug, Deserialize)]
pub struct SshKeyListResponse {
    pub ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Deserialize)]
pub struct ActionResponse {
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub struct CreateImageResponse {
    pub image: Image,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub struct EnableRescueResponse {
    pub root_password: String,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub struct PricingResponse {
    pub pricing: Pricing,
}

/// Error envelope from the API
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiErrorBody,
}

/// API error details
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_address_helpers() {
        let server: Server = serde_json::from_value(serde_json::json!({
            "id": 42,
            "name": "test-cp-01",
            "status": "running",
            "server_type": {
                "id": 1, "name": "cx23", "description": "", "cores": 2,
                "memory": 4.0, "disk": 40, "architecture": "x86"
            },
            "datacenter": {
                "id": 1, "name": "fsn1-dc14",
                "location": {"id": 1, "name": "fsn1", "network_zone": "eu-central"}
            },
            "public_net": {"ipv4": {"ip": "5.5.5.5"}, "ipv6": null},
            "private_net": [{"network": 7, "ip": "10.0.0.2"}],
            "created": "2026-01-01T00:00:00Z",
            "labels": {"cluster": "test"}
        }))
        .unwrap();

        assert_eq!(server.public_ip().unwrap(), "5.5.5.5");
        assert_eq!(server.private_ip_on(7).unwrap(), "10.0.0.2");
        assert!(server.private_ip_on(8).is_none());
    }

    #[test]
    fn test_load_balancer_health() {
        let lb: LoadBalancer = serde_json::from_value(serde_json::json!({
            "id": 9,
            "name": "test-kube-api",
            "public_net": {"ipv4": {"ip": "1.2.3.4"}, "ipv6": null},
            "private_net": [{"network": 7, "ip": "10.0.0.100"}],
            "services": [{"protocol": "tcp", "listen_port": 6443, "destination_port": 6443}],
            "targets": [{
                "type": "server",
                "server": {"id": 42},
                "health_status": [{"listen_port": 6443, "status": "healthy"}]
            }],
            "labels": {}
        }))
        .unwrap();

        assert!(lb.has_healthy_target(6443));
        assert!(!lb.has_healthy_target(80));
        assert!(lb.has_target(42));
        assert!(!lb.has_target(43));
    }
}
