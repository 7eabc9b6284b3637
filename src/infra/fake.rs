/// In-memory fake provider for tests
///
/// Mirrors the real backend's observable behaviour, including typed
/// uniqueness conflicts and label-filtered listing, so engine tests exercise
/// the same code paths as production.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::hcloud::models::*;
use crate::hcloud::HcloudError;

use super::{
    AttachmentInfo, CreateFirewallRequest, CreateLoadBalancerRequest, CreateNetworkRequest,
    CreatePlacementGroupRequest, CreateServerRequest, InfrastructureManager, LabelSelector,
};

#[derive(Default)]
struct Inner {
    next_id: u64,
    networks: HashMap<u64, Network>,
    firewalls: HashMap<u64, Firewall>,
    load_balancers: HashMap<u64, LoadBalancer>,
    placement_groups: HashMap<u64, PlacementGroup>,
    servers: HashMap<u64, Server>,
    snapshots: HashMap<u64, Image>,
    ssh_keys: HashMap<u64, SshKey>,
    /// Per-operation queues of injected failures, drained one per call.
    failures: HashMap<String, VecDeque<String>>,
    /// When false, load-balancer targets report unhealthy.
    targets_healthy: bool,
}

/// Fake in-memory cloud.
pub struct FakeInfrastructure {
    inner: Mutex<Inner>,
}

impl Default for FakeInfrastructure {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInfrastructure {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                targets_healthy: true,
                ..Inner::default()
            }),
        }
    }

    /// Queue a failure for the next call to `operation`. Messages containing
    /// a transient marker exercise the retry path.
    pub fn inject_failure(&self, operation: &str, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    /// Toggle reported load-balancer target health.
    pub fn set_targets_healthy(&self, healthy: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.targets_healthy = healthy;
        let status = if healthy { "healthy" } else { "unhealthy" };
        for lb in inner.load_balancers.values_mut() {
            for target in &mut lb.targets {
                for health in &mut target.health_status {
                    health.status = status.to_string();
                }
            }
        }
    }

    /// Seed a resource that this system did not create (foreign labels).
    pub fn seed_network(&self, name: &str, ip_range: &str, labels: HashMap<String, String>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc_id();
        inner.networks.insert(
            id,
            Network {
                id,
                name: name.to_string(),
                ip_range: ip_range.to_string(),
                subnets: Vec::new(),
                servers: Vec::new(),
                labels,
            },
        );
        id
    }

    /// Seed a pre-existing server, e.g. the CLI-created bootstrap node.
    pub fn seed_server(
        &self,
        name: &str,
        public_ip: &str,
        labels: HashMap<String, String>,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc_id();
        let server = make_server(id, name, "cx23", "fsn1", Some(public_ip), labels);
        inner.servers.insert(id, server);
        id
    }

    pub fn server_count(&self) -> usize {
        self.inner.lock().unwrap().servers.len()
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.failures.get_mut(operation) {
            if let Some(message) = queue.pop_front() {
                anyhow::bail!("{}", message);
            }
        }
        Ok(())
    }
}

impl Inner {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn conflict(message: &str) -> anyhow::Error {
    HcloudError {
        status: 409,
        code: "uniqueness_error".to_string(),
        message: message.to_string(),
    }
    .into()
}

fn not_found(message: &str) -> anyhow::Error {
    HcloudError {
        status: 404,
        code: "not_found".to_string(),
        message: message.to_string(),
    }
    .into()
}

fn make_server(
    id: u64,
    name: &str,
    server_type: &str,
    location: &str,
    public_ip: Option<&str>,
    labels: HashMap<String, String>,
) -> Server {
    Server {
        id,
        name: name.to_string(),
        status: "running".to_string(),
        server_type: ServerType {
            id: 1,
            name: server_type.to_string(),
            description: server_type.to_string(),
            cores: 2,
            memory: 4.0,
            disk: 40,
            architecture: "x86".to_string(),
        },
        datacenter: Datacenter {
            id: 1,
            name: format!("{}-dc14", location),
            location: Location {
                id: 1,
                name: location.to_string(),
                network_zone: "eu-central".to_string(),
            },
        },
        public_net: PublicNetwork {
            ipv4: public_ip.map(|ip| PublicIp { ip: ip.to_string() }),
            ipv6: None,
        },
        private_net: Vec::new(),
        created: "2026-01-01T00:00:00Z".to_string(),
        labels,
    }
}

#[async_trait]
impl InfrastructureManager for FakeInfrastructure {
    async fn get_network_by_name(&self, name: &str) -> Result<Option<Network>> {
        self.check_failure("get_network_by_name")?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.networks.values().find(|n| n.name == name).cloned())
    }

    async fn create_network(&self, request: CreateNetworkRequest) -> Result<Network> {
        self.check_failure("create_network")?;
        let mut inner = self.inner.lock().unwrap();
        if inner.networks.values().any(|n| n.name == request.name) {
            return Err(conflict("network name is already used"));
        }
        let id = inner.alloc_id();
        let network = Network {
            id,
            name: request.name,
            ip_range: request.ip_range,
            subnets: request
                .subnets
                .into_iter()
                .map(|s| Subnet {
                    ip_range: s.ip_range,
                    network_zone: s.network_zone,
                    subnet_type: "cloud".to_string(),
                })
                .collect(),
            servers: Vec::new(),
            labels: request.labels,
        };
        inner.networks.insert(id, network.clone());
        Ok(network)
    }

    async fn delete_network(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .networks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("network not found"))
    }

    async fn attach_server_to_network(
        &self,
        server_id: u64,
        network_id: u64,
        private_ip: &str,
    ) -> Result<()> {
        self.check_failure("attach_server_to_network")?;
        let mut inner = self.inner.lock().unwrap();

        let taken = inner.servers.values().any(|s| {
            s.private_net
                .iter()
                .any(|net| net.network == network_id && net.ip == private_ip)
        });
        if taken {
            return Err(conflict("ip is already used in this network"));
        }

        let network = inner
            .networks
            .get_mut(&network_id)
            .ok_or_else(|| not_found("network not found"))?;
        if !network.servers.contains(&server_id) {
            network.servers.push(server_id);
        }

        let server = inner
            .servers
            .get_mut(&server_id)
            .ok_or_else(|| not_found("server not found"))?;
        server.private_net.push(PrivateNetwork {
            network: network_id,
            ip: private_ip.to_string(),
        });
        Ok(())
    }

    async fn list_network_attachments(&self, network_id: u64) -> Result<Vec<AttachmentInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut attachments: Vec<AttachmentInfo> = inner
            .servers
            .values()
            .filter_map(|server| {
                server.private_ip_on(network_id).map(|ip| AttachmentInfo {
                    server_id: server.id,
                    server_name: server.name.clone(),
                    ip,
                })
            })
            .collect();
        attachments.sort_by_key(|a| a.server_id);
        Ok(attachments)
    }

    async fn get_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>> {
        self.check_failure("get_firewall_by_name")?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.firewalls.values().find(|f| f.name == name).cloned())
    }

    async fn create_firewall(&self, request: CreateFirewallRequest) -> Result<Firewall> {
        self.check_failure("create_firewall")?;
        let mut inner = self.inner.lock().unwrap();
        if inner.firewalls.values().any(|f| f.name == request.name) {
            return Err(conflict("firewall name is already used"));
        }
        let id = inner.alloc_id();
        let firewall = Firewall {
            id,
            name: request.name,
            rules: request.rules,
            applied_to: Vec::new(),
            labels: request.labels,
        };
        inner.firewalls.insert(id, firewall.clone());
        Ok(firewall)
    }

    async fn delete_firewall(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let still_applied = inner
            .firewalls
            .get(&id)
            .is_some_and(|f| !f.applied_to.is_empty());
        // Mirrors the provider refusing to delete an applied firewall while
        // its servers still exist.
        if still_applied {
            let applied_servers: Vec<u64> = inner.firewalls[&id]
                .applied_to
                .iter()
                .filter_map(|r| r.server.as_ref().map(|s| s.id))
                .collect();
            if applied_servers
                .iter()
                .any(|sid| inner.servers.contains_key(sid))
            {
                return Err(HcloudError {
                    status: 423,
                    code: "resource_in_use".to_string(),
                    message: "firewall is still applied to servers".to_string(),
                }
                .into());
            }
        }
        inner
            .firewalls
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("firewall not found"))
    }

    async fn apply_firewall_to_servers(&self, firewall_id: u64, server_ids: &[u64]) -> Result<()> {
        self.check_failure("apply_firewall_to_servers")?;
        let mut inner = self.inner.lock().unwrap();
        let firewall = inner
            .firewalls
            .get_mut(&firewall_id)
            .ok_or_else(|| not_found("firewall not found"))?;
        for &id in server_ids {
            if !firewall
                .applied_to
                .iter()
                .any(|r| r.server.as_ref().is_some_and(|s| s.id == id))
            {
                firewall.applied_to.push(FirewallResource {
                    resource_type: "server".to_string(),
                    server: Some(ServerRef { id }),
                });
            }
        }
        Ok(())
    }

    async fn get_load_balancer(&self, id: u64) -> Result<LoadBalancer> {
        let inner = self.inner.lock().unwrap();
        inner
            .load_balancers
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("load balancer not found"))
    }

    async fn get_load_balancer_by_name(&self, name: &str) -> Result<Option<LoadBalancer>> {
        self.check_failure("get_load_balancer_by_name")?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .load_balancers
            .values()
            .find(|lb| lb.name == name)
            .cloned())
    }

    async fn create_load_balancer(
        &self,
        request: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer> {
        self.check_failure("create_load_balancer")?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .load_balancers
            .values()
            .any(|lb| lb.name == request.name)
        {
            return Err(conflict("load balancer name is already used"));
        }
        let id = inner.alloc_id();
        let lb = LoadBalancer {
            id,
            name: request.name,
            public_net: LoadBalancerPublicNet {
                ipv4: Some(PublicIp {
                    ip: format!("203.0.113.{}", id % 250),
                }),
                ipv6: None,
            },
            private_net: request
                .network_id
                .map(|network| {
                    vec![PrivateNetwork {
                        network,
                        ip: "10.0.0.100".to_string(),
                    }]
                })
                .unwrap_or_default(),
            services: request.services,
            targets: Vec::new(),
            labels: request.labels,
        };
        inner.load_balancers.insert(id, lb.clone());
        Ok(lb)
    }

    async fn delete_load_balancer(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .load_balancers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("load balancer not found"))
    }

    async fn add_load_balancer_target(&self, lb_id: u64, server_id: u64) -> Result<()> {
        self.check_failure("add_load_balancer_target")?;
        let mut inner = self.inner.lock().unwrap();
        let healthy = inner.targets_healthy;
        let lb = inner
            .load_balancers
            .get_mut(&lb_id)
            .ok_or_else(|| not_found("load balancer not found"))?;
        if lb.has_target(server_id) {
            return Err(conflict("target already added"));
        }
        let status = if healthy { "healthy" } else { "unhealthy" };
        let health_status = lb
            .services
            .iter()
            .map(|s| TargetHealth {
                listen_port: s.listen_port,
                status: status.to_string(),
            })
            .collect();
        lb.targets.push(LoadBalancerTarget {
            target_type: "server".to_string(),
            server: Some(ServerRef { id: server_id }),
            health_status,
        });
        Ok(())
    }

    async fn get_placement_group_by_name(&self, name: &str) -> Result<Option<PlacementGroup>> {
        self.check_failure("get_placement_group_by_name")?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .placement_groups
            .values()
            .find(|pg| pg.name == name)
            .cloned())
    }

    async fn create_placement_group(
        &self,
        request: CreatePlacementGroupRequest,
    ) -> Result<PlacementGroup> {
        self.check_failure("create_placement_group")?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .placement_groups
            .values()
            .any(|pg| pg.name == request.name)
        {
            return Err(conflict("placement group name is already used"));
        }
        let id = inner.alloc_id();
        let pg = PlacementGroup {
            id,
            name: request.name,
            group_type: request.group_type,
            servers: Vec::new(),
            labels: request.labels,
        };
        inner.placement_groups.insert(id, pg.clone());
        Ok(pg)
    }

    async fn delete_placement_group(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .placement_groups
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("placement group not found"))
    }

    async fn get_server(&self, id: u64) -> Result<Server> {
        let inner = self.inner.lock().unwrap();
        inner
            .servers
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("server not found"))
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>> {
        self.check_failure("get_server_by_name")?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.servers.values().find(|s| s.name == name).cloned())
    }

    async fn list_servers(&self, selector: &LabelSelector) -> Result<Vec<Server>> {
        self.check_failure("list_servers")?;
        let inner = self.inner.lock().unwrap();
        let mut servers: Vec<Server> = inner
            .servers
            .values()
            .filter(|s| selector.matches(&s.labels))
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn create_server(&self, request: CreateServerRequest) -> Result<Server> {
        self.check_failure("create_server")?;
        let mut inner = self.inner.lock().unwrap();
        if inner.servers.values().any(|s| s.name == request.name) {
            return Err(conflict("server name is already used"));
        }
        let id = inner.alloc_id();
        let public_ip = format!("192.0.2.{}", id % 250);
        let mut server = make_server(
            id,
            &request.name,
            &request.server_type,
            &request.location,
            Some(&public_ip),
            request.labels,
        );

        if let Some(attachment) = &request.network {
            let taken = inner.servers.values().any(|s| {
                s.private_net.iter().any(|net| {
                    net.network == attachment.network_id && net.ip == attachment.private_ip
                })
            });
            if taken {
                return Err(conflict("ip is already used in this network"));
            }
            server.private_net.push(PrivateNetwork {
                network: attachment.network_id,
                ip: attachment.private_ip.clone(),
            });
            if let Some(network) = inner.networks.get_mut(&attachment.network_id) {
                network.servers.push(id);
            }
        }

        for &firewall_id in &request.firewall_ids {
            if let Some(firewall) = inner.firewalls.get_mut(&firewall_id) {
                firewall.applied_to.push(FirewallResource {
                    resource_type: "server".to_string(),
                    server: Some(ServerRef { id }),
                });
            }
        }

        if let Some(pg_id) = request.placement_group_id {
            if let Some(pg) = inner.placement_groups.get_mut(&pg_id) {
                pg.servers.push(id);
            }
        }

        inner.servers.insert(id, server.clone());
        Ok(server)
    }

    async fn delete_server(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .servers
            .remove(&id)
            .ok_or_else(|| not_found("server not found"))?;
        for network in inner.networks.values_mut() {
            network.servers.retain(|&sid| sid != id);
        }
        for firewall in inner.firewalls.values_mut() {
            firewall
                .applied_to
                .retain(|r| r.server.as_ref().map(|s| s.id) != Some(id));
        }
        for lb in inner.load_balancers.values_mut() {
            lb.targets
                .retain(|t| t.server.as_ref().map(|s| s.id) != Some(id));
        }
        Ok(())
    }

    async fn enable_rescue(&self, server_id: u64, _ssh_key_ids: &[u64]) -> Result<String> {
        self.check_failure("enable_rescue")?;
        let inner = self.inner.lock().unwrap();
        if !inner.servers.contains_key(&server_id) {
            return Err(not_found("server not found"));
        }
        Ok("fake-rescue-password".to_string())
    }

    async fn reboot_server(&self, id: u64) -> Result<()> {
        self.check_failure("reboot_server")?;
        let inner = self.inner.lock().unwrap();
        if !inner.servers.contains_key(&id) {
            return Err(not_found("server not found"));
        }
        Ok(())
    }

    async fn shutdown_server(&self, id: u64) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if !inner.servers.contains_key(&id) {
            return Err(not_found("server not found"));
        }
        Ok(())
    }

    async fn list_snapshots(&self, selector: &LabelSelector) -> Result<Vec<Image>> {
        self.check_failure("list_snapshots")?;
        let inner = self.inner.lock().unwrap();
        let mut snapshots: Vec<Image> = inner
            .snapshots
            .values()
            .filter(|img| selector.matches(&img.labels))
            .cloned()
            .collect();
        snapshots.sort_by_key(|img| img.id);
        Ok(snapshots)
    }

    async fn create_snapshot(
        &self,
        server_id: u64,
        description: &str,
        labels: HashMap<String, String>,
    ) -> Result<Image> {
        self.check_failure("create_snapshot")?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.servers.contains_key(&server_id) {
            return Err(not_found("server not found"));
        }
        let id = inner.alloc_id();
        let image = Image {
            id,
            description: description.to_string(),
            image_type: "snapshot".to_string(),
            status: "available".to_string(),
            architecture: "x86".to_string(),
            labels,
        };
        inner.snapshots.insert(id, image.clone());
        Ok(image)
    }

    async fn delete_snapshot(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .snapshots
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("snapshot not found"))
    }

    async fn get_ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>> {
        self.check_failure("get_ssh_key_by_name")?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.ssh_keys.values().find(|k| k.name == name).cloned())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: HashMap<String, String>,
    ) -> Result<SshKey> {
        self.check_failure("create_ssh_key")?;
        let mut inner = self.inner.lock().unwrap();
        if inner.ssh_keys.values().any(|k| k.name == name) {
            return Err(conflict("SSH key name is already used"));
        }
        let id = inner.alloc_id();
        let key = SshKey {
            id,
            name: name.to_string(),
            fingerprint: format!("fake:fingerprint:{}", id),
            public_key: public_key.to_string(),
            labels,
        };
        inner.ssh_keys.insert(id, key.clone());
        Ok(key)
    }

    async fn delete_ssh_key(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .ssh_keys
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("SSH key not found"))
    }

    async fn get_pricing(&self) -> Result<Pricing> {
        Ok(Pricing {
            server_types: vec![ServerTypePricing {
                name: "cx23".to_string(),
                prices: vec![LocationPrice {
                    location: "fsn1".to_string(),
                    price_monthly: Price {
                        gross: "4.5500".to_string(),
                    },
                }],
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcloud::api_error;

    fn labels(cluster: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("managed-by".to_string(), "k8zner".to_string());
        map.insert("cluster".to_string(), cluster.to_string());
        map
    }

    #[tokio::test]
    async fn test_create_network_conflict_is_typed() {
        let fake = FakeInfrastructure::new();
        let request = CreateNetworkRequest {
            name: "test-network".to_string(),
            ip_range: "10.0.0.0/16".to_string(),
            subnets: Vec::new(),
            labels: labels("test"),
        };
        fake.create_network(request.clone()).await.unwrap();

        let err = fake.create_network(request).await.unwrap_err();
        assert!(api_error(&err).unwrap().is_conflict());
    }

    #[tokio::test]
    async fn test_label_selector_scoping() {
        let fake = FakeInfrastructure::new();
        fake.seed_server("alpha-cp-01", "192.0.2.1", labels("alpha"));
        fake.seed_server("beta-cp-01", "192.0.2.2", labels("beta"));

        let selector = LabelSelector::new()
            .with("managed-by", "k8zner")
            .with("cluster", "alpha");
        let servers = fake.list_servers(&selector).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "alpha-cp-01");
    }

    #[tokio::test]
    async fn test_attach_rejects_taken_ip() {
        let fake = FakeInfrastructure::new();
        let network = fake
            .create_network(CreateNetworkRequest {
                name: "test-network".to_string(),
                ip_range: "10.0.0.0/16".to_string(),
                subnets: Vec::new(),
                labels: labels("test"),
            })
            .await
            .unwrap();
        let first = fake.seed_server("test-cp-01", "192.0.2.1", labels("test"));
        let second = fake.seed_server("test-cp-02", "192.0.2.2", labels("test"));

        fake.attach_server_to_network(first, network.id, "10.0.0.2")
            .await
            .unwrap();
        let err = fake
            .attach_server_to_network(second, network.id, "10.0.0.2")
            .await
            .unwrap_err();
        assert!(api_error(&err).unwrap().is_conflict());

        let attachments = fake.list_network_attachments(network.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_injected_failures_drain() {
        let fake = FakeInfrastructure::new();
        fake.inject_failure("list_servers", "connection refused");

        let selector = LabelSelector::new();
        assert!(fake.list_servers(&selector).await.is_err());
        assert!(fake.list_servers(&selector).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_server_detaches_everywhere() {
        let fake = FakeInfrastructure::new();
        let lb = fake
            .create_load_balancer(CreateLoadBalancerRequest {
                name: "test-kube-api".to_string(),
                lb_type: "lb11".to_string(),
                location: "fsn1".to_string(),
                network_id: None,
                services: vec![crate::hcloud::models::LoadBalancerService {
                    protocol: "tcp".to_string(),
                    listen_port: 6443,
                    destination_port: 6443,
                }],
                labels: labels("test"),
            })
            .await
            .unwrap();
        let server = fake.seed_server("test-cp-01", "192.0.2.1", labels("test"));
        fake.add_load_balancer_target(lb.id, server).await.unwrap();

        fake.delete_server(server).await.unwrap();
        let lb = fake.get_load_balancer(lb.id).await.unwrap();
        assert!(lb.targets.is_empty());
    }
}
