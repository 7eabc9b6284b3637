/// Hetzner Cloud implementation of the capability contract
use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::hcloud::models::*;
use crate::hcloud::HcloudClient;

use super::{
    AttachmentInfo, CreateFirewallRequest, CreateLoadBalancerRequest, CreateNetworkRequest,
    CreatePlacementGroupRequest, CreateServerRequest, InfrastructureManager, LabelSelector,
};

const ACTION_TIMEOUT_SECS: u64 = 300;

/// Real provider backend; all calls go through the shared REST client.
#[derive(Clone)]
pub struct HcloudInfrastructure {
    client: HcloudClient,
}

impl HcloudInfrastructure {
    pub fn new(client: HcloudClient) -> Self {
        Self { client }
    }

    async fn find_by_name<T, F>(&self, endpoint: &str, name: &str, extract: F) -> Result<Option<T>>
    where
        F: FnOnce(serde_json::Value) -> Result<Vec<T>>,
    {
        // The API filters server-side by exact name.
        let value: serde_json::Value = self
            .client
            .get(&format!("{}?name={}", endpoint, name))
            .await?;
        let mut items = extract(value)?;
        Ok(if items.is_empty() {
            None
        } else {
            Some(items.remove(0))
        })
    }
}

#[derive(Serialize)]
struct NetworkWire<'a> {
    name: &'a str,
    ip_range: &'a str,
    subnets: Vec<SubnetWire>,
    labels: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct SubnetWire {
    ip_range: String,
    network_zone: String,
    #[serde(rename = "type")]
    subnet_type: &'static str,
}

#[derive(Serialize)]
struct FirewallWire<'a> {
    name: &'a str,
    rules: &'a [FirewallRule],
    labels: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct LoadBalancerWire<'a> {
    name: &'a str,
    load_balancer_type: &'a str,
    location: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<u64>,
    services: Vec<LoadBalancerServiceWire>,
    algorithm: AlgorithmWire,
    labels: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct LoadBalancerServiceWire {
    protocol: String,
    listen_port: u16,
    destination_port: u16,
    health_check: HealthCheckWire,
}

#[derive(Serialize)]
struct HealthCheckWire {
    protocol: &'static str,
    port: u16,
    interval: u16,
    timeout: u16,
    retries: u16,
}

#[derive(Serialize)]
struct AlgorithmWire {
    #[serde(rename = "type")]
    algorithm_type: &'static str,
}

#[derive(Serialize)]
struct PlacementGroupWire<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    group_type: &'a str,
    labels: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct ServerWire<'a> {
    name: &'a str,
    server_type: &'a str,
    location: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    firewalls: Vec<FirewallRefWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    placement_group: Option<u64>,
    labels: &'a HashMap<String, String>,
    start_after_create: bool,
}

#[derive(Serialize)]
struct FirewallRefWire {
    firewall: u64,
}

#[async_trait]
impl InfrastructureManager for HcloudInfrastructure {
    async fn get_network_by_name(&self, name: &str) -> Result<Option<Network>> {
        self.find_by_name("networks", name, |v| {
            let parsed: NetworkListResponse = serde_json::from_value(v)?;
            Ok(parsed.networks)
        })
        .await
    }

    async fn create_network(&self, request: CreateNetworkRequest) -> Result<Network> {
        let wire = NetworkWire {
            name: &request.name,
            ip_range: &request.ip_range,
            subnets: request
                .subnets
                .iter()
                .map(|s| SubnetWire {
                    ip_range: s.ip_range.clone(),
                    network_zone: s.network_zone.clone(),
                    subnet_type: "cloud",
                })
                .collect(),
            labels: &request.labels,
        };
        let response: NetworkResponse = self
            .client
            .post("networks", &wire)
            .await
            .context("failed to create network")?;
        Ok(response.network)
    }

    async fn delete_network(&self, id: u64) -> Result<()> {
        self.client.delete(&format!("networks/{}", id)).await
    }

    async fn attach_server_to_network(
        &self,
        server_id: u64,
        network_id: u64,
        private_ip: &str,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Request<'a> {
            network: u64,
            ip: &'a str,
        }

        let response: ActionResponse = self
            .client
            .post(
                &format!("servers/{}/actions/attach_to_network", server_id),
                &Request {
                    network: network_id,
                    ip: private_ip,
                },
            )
            .await
            .context("failed to attach server to network")?;
        self.client
            .wait_for_action(response.action.id, ACTION_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn list_network_attachments(&self, network_id: u64) -> Result<Vec<AttachmentInfo>> {
        let response: NetworkResponse =
            self.client.get(&format!("networks/{}", network_id)).await?;

        let mut attachments = Vec::new();
        for server_id in response.network.servers {
            let server = self.get_server(server_id).await?;
            if let Some(ip) = server.private_ip_on(network_id) {
                attachments.push(AttachmentInfo {
                    server_id,
                    server_name: server.name,
                    ip,
                });
            }
        }
        Ok(attachments)
    }

    async fn get_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>> {
        self.find_by_name("firewalls", name, |v| {
            let parsed: FirewallListResponse = serde_json::from_value(v)?;
            Ok(parsed.firewalls)
        })
        .await
    }

    async fn create_firewall(&self, request: CreateFirewallRequest) -> Result<Firewall> {
        let wire = FirewallWire {
            name: &request.name,
            rules: &request.rules,
            labels: &request.labels,
        };
        let response: FirewallResponse = self
            .client
            .post("firewalls", &wire)
            .await
            .context("failed to create firewall")?;
        Ok(response.firewall)
    }

    async fn delete_firewall(&self, id: u64) -> Result<()> {
        self.client.delete(&format!("firewalls/{}", id)).await
    }

    async fn apply_firewall_to_servers(&self, firewall_id: u64, server_ids: &[u64]) -> Result<()> {
        #[derive(Serialize)]
        struct Request {
            apply_to: Vec<ApplyTo>,
        }
        #[derive(Serialize)]
        struct ApplyTo {
            #[serde(rename = "type")]
            resource_type: &'static str,
            server: ServerRef,
        }

        let request = Request {
            apply_to: server_ids
                .iter()
                .map(|&id| ApplyTo {
                    resource_type: "server",
                    server: ServerRef { id },
                })
                .collect(),
        };

        let _: serde_json::Value = self
            .client
            .post(
                &format!("firewalls/{}/actions/apply_to_resources", firewall_id),
                &request,
            )
            .await
            .context("failed to apply firewall to servers")?;
        Ok(())
    }

    async fn get_load_balancer(&self, id: u64) -> Result<LoadBalancer> {
        let response: LoadBalancerResponse =
            self.client.get(&format!("load_balancers/{}", id)).await?;
        Ok(response.load_balancer)
    }

    async fn get_load_balancer_by_name(&self, name: &str) -> Result<Option<LoadBalancer>> {
        self.find_by_name("load_balancers", name, |v| {
            let parsed: LoadBalancerListResponse = serde_json::from_value(v)?;
            Ok(parsed.load_balancers)
        })
        .await
    }

    async fn create_load_balancer(
        &self,
        request: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer> {
        let wire = LoadBalancerWire {
            name: &request.name,
            load_balancer_type: &request.lb_type,
            location: &request.location,
            network: request.network_id,
            services: request
                .services
                .iter()
                .map(|s| LoadBalancerServiceWire {
                    protocol: s.protocol.clone(),
                    listen_port: s.listen_port,
                    destination_port: s.destination_port,
                    health_check: HealthCheckWire {
                        protocol: "tcp",
                        port: s.destination_port,
                        interval: 15,
                        timeout: 10,
                        retries: 3,
                    },
                })
                .collect(),
            algorithm: AlgorithmWire {
                algorithm_type: "round_robin",
            },
            labels: &request.labels,
        };
        let response: LoadBalancerResponse = self
            .client
            .post("load_balancers", &wire)
            .await
            .context("failed to create load balancer")?;
        Ok(response.load_balancer)
    }

    async fn delete_load_balancer(&self, id: u64) -> Result<()> {
        self.client.delete(&format!("load_balancers/{}", id)).await
    }

    async fn add_load_balancer_target(&self, lb_id: u64, server_id: u64) -> Result<()> {
        #[derive(Serialize)]
        struct Request {
            #[serde(rename = "type")]
            target_type: &'static str,
            server: ServerRef,
            use_private_ip: bool,
        }

        let response: ActionResponse = self
            .client
            .post(
                &format!("load_balancers/{}/actions/add_target", lb_id),
                &Request {
                    target_type: "server",
                    server: ServerRef { id: server_id },
                    use_private_ip: true,
                },
            )
            .await
            .context("failed to add load balancer target")?;
        self.client
            .wait_for_action(response.action.id, ACTION_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn get_placement_group_by_name(&self, name: &str) -> Result<Option<PlacementGroup>> {
        self.find_by_name("placement_groups", name, |v| {
            let parsed: PlacementGroupListResponse = serde_json::from_value(v)?;
            Ok(parsed.placement_groups)
        })
        .await
    }

    async fn create_placement_group(
        &self,
        request: CreatePlacementGroupRequest,
    ) -> Result<PlacementGroup> {
        let wire = PlacementGroupWire {
            name: &request.name,
            group_type: &request.group_type,
            labels: &request.labels,
        };
        let response: PlacementGroupResponse = self
            .client
            .post("placement_groups", &wire)
            .await
            .context("failed to create placement group")?;
        Ok(response.placement_group)
    }

    async fn delete_placement_group(&self, id: u64) -> Result<()> {
        self.client
            .delete(&format!("placement_groups/{}", id))
            .await
    }

    async fn get_server(&self, id: u64) -> Result<Server> {
        let response: ServerResponse = self.client.get(&format!("servers/{}", id)).await?;
        Ok(response.server)
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>> {
        self.find_by_name("servers", name, |v| {
            let parsed: ServerListResponse = serde_json::from_value(v)?;
            Ok(parsed.servers)
        })
        .await
    }

    async fn list_servers(&self, selector: &LabelSelector) -> Result<Vec<Server>> {
        let response: ServerListResponse = self
            .client
            .get(&format!("servers?label_selector={}", selector.to_query()))
            .await?;
        Ok(response.servers)
    }

    async fn create_server(&self, request: CreateServerRequest) -> Result<Server> {
        let wire = ServerWire {
            name: &request.name,
            server_type: &request.server_type,
            location: &request.location,
            image: &request.image,
            ssh_keys: request.ssh_key_ids.clone(),
            user_data: request.user_data.as_deref(),
            firewalls: request
                .firewall_ids
                .iter()
                .map(|&firewall| FirewallRefWire { firewall })
                .collect(),
            placement_group: request.placement_group_id,
            labels: &request.labels,
            start_after_create: true,
        };

        let response: CreateServerResponse = self
            .client
            .post("servers", &wire)
            .await
            .with_context(|| format!("failed to create server {}", request.name))?;

        self.client
            .wait_for_action(response.action.id, ACTION_TIMEOUT_SECS)
            .await
            .context("server creation action failed")?;

        // The private address is assigned by a follow-up action so that the
        // caller controls it; create-time attachment picks its own.
        if let Some(attachment) = &request.network {
            self.attach_server_to_network(
                response.server.id,
                attachment.network_id,
                &attachment.private_ip,
            )
            .await?;
        }

        self.get_server(response.server.id).await
    }

    async fn delete_server(&self, id: u64) -> Result<()> {
        self.client.delete(&format!("servers/{}", id)).await
    }

    async fn enable_rescue(&self, server_id: u64, ssh_key_ids: &[u64]) -> Result<String> {
        #[derive(Serialize)]
        struct Request<'a> {
            #[serde(rename = "type")]
            rescue_type: &'static str,
            ssh_keys: &'a [u64],
        }

        let response: EnableRescueResponse = self
            .client
            .post(
                &format!("servers/{}/actions/enable_rescue", server_id),
                &Request {
                    rescue_type: "linux64",
                    ssh_keys: ssh_key_ids,
                },
            )
            .await
            .context("failed to enable rescue mode")?;
        self.client
            .wait_for_action(response.action.id, ACTION_TIMEOUT_SECS)
            .await?;
        Ok(response.root_password)
    }

    async fn reboot_server(&self, id: u64) -> Result<()> {
        let response: ActionResponse = self
            .client
            .post(
                &format!("servers/{}/actions/reset", id),
                &serde_json::json!({}),
            )
            .await
            .context("failed to reboot server")?;
        self.client
            .wait_for_action(response.action.id, ACTION_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn shutdown_server(&self, id: u64) -> Result<()> {
        let response: ActionResponse = self
            .client
            .post(
                &format!("servers/{}/actions/shutdown", id),
                &serde_json::json!({}),
            )
            .await
            .context("failed to shut down server")?;
        self.client
            .wait_for_action(response.action.id, ACTION_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn list_snapshots(&self, selector: &LabelSelector) -> Result<Vec<Image>> {
        let response: ImageListResponse = self
            .client
            .get(&format!(
                "images?type=snapshot&label_selector={}",
                selector.to_query()
            ))
            .await?;
        Ok(response.images)
    }

    async fn create_snapshot(
        &self,
        server_id: u64,
        description: &str,
        labels: HashMap<String, String>,
    ) -> Result<Image> {
        #[derive(Serialize)]
        struct Request<'a> {
            description: &'a str,
            #[serde(rename = "type")]
            image_type: &'static str,
            labels: HashMap<String, String>,
        }

        let response: CreateImageResponse = self
            .client
            .post(
                &format!("servers/{}/actions/create_image", server_id),
                &Request {
                    description,
                    image_type: "snapshot",
                    labels,
                },
            )
            .await
            .context("failed to create snapshot")?;

        // Snapshotting a whole disk takes a while.
        self.client
            .wait_for_action(response.action.id, 1800)
            .await
            .context("snapshot action failed")?;
        Ok(response.image)
    }

    async fn delete_snapshot(&self, id: u64) -> Result<()> {
        self.client.delete(&format!("images/{}", id)).await
    }

    async fn get_ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>> {
        self.find_by_name("ssh_keys", name, |v| {
            let parsed: SshKeyListResponse = serde_json::from_value(v)?;
            Ok(parsed.ssh_keys)
        })
        .await
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: HashMap<String, String>,
    ) -> Result<SshKey> {
        #[derive(Serialize)]
        struct Request<'a> {
            name: &'a str,
            public_key: &'a str,
            labels: HashMap<String, String>,
        }

        let response: SshKeyResponse = self
            .client
            .post(
                "ssh_keys",
                &Request {
                    name,
                    public_key,
                    labels,
                },
            )
            .await
            .context("failed to create SSH key")?;
        Ok(response.ssh_key)
    }

    async fn delete_ssh_key(&self, id: u64) -> Result<()> {
        self.client.delete(&format!("ssh_keys/{}", id)).await
    }

    async fn get_pricing(&self) -> Result<Pricing> {
        let response: PricingResponse = self.client.get("pricing").await?;
        Ok(response.pricing)
    }
}
