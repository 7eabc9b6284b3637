/// Bootstrap protocol
///
/// Takes the first control-plane node from "freshly booted from snapshot" to
/// "etcd member serving the Kubernetes API behind the load balancer". The
/// etcd bootstrap itself is a one-shot action and is guarded twice: by the
/// spec's recorded completion and by a live etcd-members check.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::ProvisionError;
use crate::hcloud::models::Server;
use crate::infra::InfrastructureManager;
use crate::naming;
use crate::observe::{Event, Observer};
use crate::reconcile::load_balancer::KUBE_API_PORT;
use crate::reconcile::State;
use crate::retry::{Backoff, RetryPolicy};
use crate::talos::TalosApi;
use crate::utils::polling::PollingConfig;

/// Health probe against the Kubernetes API endpoint; injectable for tests.
#[async_trait]
pub trait ApiHealthProbe: Send + Sync {
    async fn healthy(&self, endpoint: &str) -> bool;
}

/// Probes `<endpoint>/version` over TLS without verifying the serving cert;
/// any authenticated-or-not HTTP answer means the API server is up.
pub struct HttpsApiProbe;

#[async_trait]
impl ApiHealthProbe for HttpsApiProbe {
    async fn healthy(&self, endpoint: &str) -> bool {
        let client = match reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.get(format!("{}/version", endpoint)).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                status == 200 || status == 401 || status == 403
            }
            Err(_) => false,
        }
    }
}

/// Everything the coordinator reports back on success.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub node_name: String,
    pub node_id: u64,
    pub public_ip: String,
    /// Admin kubeconfig with the server URL rewritten to the load balancer.
    pub kubeconfig: String,
}

pub struct BootstrapCoordinator {
    talos: Arc<dyn TalosApi>,
    infra: Arc<dyn InfrastructureManager>,
    probe: Arc<dyn ApiHealthProbe>,
    retry: RetryPolicy,
    api_deadline: Duration,
    lb_deadline: Duration,
}

impl BootstrapCoordinator {
    pub fn new(
        talos: Arc<dyn TalosApi>,
        infra: Arc<dyn InfrastructureManager>,
        probe: Arc<dyn ApiHealthProbe>,
    ) -> Self {
        Self {
            talos,
            infra,
            probe,
            retry: RetryPolicy::default(),
            api_deadline: Duration::from_secs(600),
            lb_deadline: Duration::from_secs(600),
        }
    }

    pub fn with_timing(
        mut self,
        retry: RetryPolicy,
        api_deadline: Duration,
        lb_deadline: Duration,
    ) -> Self {
        self.retry = retry;
        self.api_deadline = api_deadline;
        self.lb_deadline = lb_deadline;
        self
    }

    /// Run the protocol against the first control plane in `state`.
    /// `machine_config` is the node's generated control-plane config.
    pub async fn run(
        &self,
        config: &Config,
        machine_config: &str,
        state: &State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<BootstrapOutcome> {
        let node = first_control_plane(state)?;
        let node_ip = node
            .public_ip()
            .context("bootstrap control plane has no public IP")?;
        let node_name = node.name.clone();

        let lb = state
            .load_balancer
            .as_ref()
            .context("bootstrap requires the load balancer")?;
        let lb_public_ip = lb
            .public_ip()
            .context("load balancer has no public IP")?;

        // Steps 3..7 are idempotent as a block; transient I/O failures rerun
        // from the config application.
        let already_bootstrapped = state.bootstrap_completed();
        let outcome = self
            .retry
            .run(cancel, "bootstrap sequence", || {
                self.attempt(
                    &node_name,
                    &node_ip,
                    &lb_public_ip,
                    machine_config,
                    already_bootstrapped,
                    cancel,
                )
            })
            .await?;

        observer.event(
            Event::info(format!("control plane bootstrapped on {}", node_name))
                .with_resource(&node_name),
        );

        // Step 7: at least one target healthy on the API port.
        self.wait_for_lb_health(lb.id, cancel).await?;

        Ok(BootstrapOutcome {
            node_name: naming::short_node_name(&config.cluster_name, &node_name),
            node_id: node.id,
            public_ip: node_ip,
            kubeconfig: outcome,
        })
    }

    /// One pass of steps 3..6; returns the rewritten kubeconfig.
    async fn attempt(
        &self,
        node_name: &str,
        node_ip: &str,
        lb_public_ip: &str,
        machine_config: &str,
        already_bootstrapped: bool,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.talos.probe(node_ip).await?;
        self.talos
            .apply_configuration(node_ip, machine_config, false)
            .await?;

        if already_bootstrapped {
            info!("bootstrap already recorded for {}, skipping", node_name);
        } else {
            // The RPC is not idempotent; only send into an empty etcd.
            let members = self.talos.etcd_members(node_ip).await?;
            if members.is_empty() {
                info!("bootstrapping etcd on {} ({})", node_name, node_ip);
                if let Err(err) = self.talos.bootstrap(node_ip).await {
                    let message = format!("{:#}", err);
                    if message.contains("already bootstrapped")
                        || message.contains("AlreadyExists")
                    {
                        return Err(ProvisionError::BootstrapConflict {
                            node: node_name.to_string(),
                            reason: message,
                        }
                        .into());
                    }
                    return Err(err);
                }
            } else {
                info!(
                    "etcd already has {} member(s) on {}, not bootstrapping again",
                    members.len(),
                    node_name
                );
            }
        }

        self.wait_for_api(node_ip, cancel).await?;

        let kubeconfig = self.talos.kubeconfig(node_ip).await?;
        rewrite_server_url(&kubeconfig, lb_public_ip)
    }

    /// Step 5: poll the API health endpoint with exponential backoff until
    /// the deadline.
    async fn wait_for_api(&self, node_ip: &str, cancel: &CancellationToken) -> Result<()> {
        let endpoint = format!("https://{}:{}", node_ip, KUBE_API_PORT);
        info!("waiting for Kubernetes API at {}", endpoint);

        let start = std::time::Instant::now();
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled.into());
            }
            if self.probe.healthy(&endpoint).await {
                info!("Kubernetes API is answering");
                return Ok(());
            }
            if start.elapsed() > self.api_deadline {
                anyhow::bail!(
                    "Kubernetes API did not become ready within {}s: i/o timeout",
                    self.api_deadline.as_secs()
                );
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn wait_for_lb_health(&self, lb_id: u64, cancel: &CancellationToken) -> Result<()> {
        PollingConfig::new(
            self.lb_deadline,
            Duration::from_secs(10),
            "waiting for a healthy load-balancer target on the API port",
        )
        .poll_until(cancel, || async {
            match self.infra.get_load_balancer(lb_id).await {
                Ok(lb) => Ok(lb.has_healthy_target(KUBE_API_PORT)),
                Err(err) => {
                    warn!("load balancer health read failed: {:#}", err);
                    Ok(false)
                }
            }
        })
        .await
    }
}

fn first_control_plane(state: &State) -> Result<&Server> {
    state
        .sorted_control_planes()
        .first()
        .copied()
        .context("no control-plane server available for bootstrap")
}

/// Rewrite the kubeconfig's server URL so admin access goes through the
/// stable load-balancer endpoint instead of the node that happened to serve
/// the fetch.
pub fn rewrite_server_url(kubeconfig: &str, lb_ip: &str) -> Result<String> {
    let mut doc: serde_yaml::Value =
        serde_yaml::from_str(kubeconfig).context("kubeconfig is not valid YAML")?;

    let clusters = doc
        .get_mut("clusters")
        .and_then(|c| c.as_sequence_mut())
        .context("kubeconfig has no clusters section")?;
    for cluster in clusters {
        if let Some(cluster) = cluster.get_mut("cluster") {
            cluster["server"] = serde_yaml::Value::String(format!(
                "https://{}:{}",
                lb_ip, KUBE_API_PORT
            ));
        }
    }

    serde_yaml::to_string(&doc).context("failed to serialise kubeconfig")
}
