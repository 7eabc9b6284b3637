/// Phase adapters over the reconcilers
///
/// Each step wraps one slice of the provisioning work behind the engine's
/// postcondition contract. The CLI and the operator build the same step list
/// and differ only in dependencies and the control-plane scale limit.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::addons::install::AddonInstallerFactory;
use crate::addons::AddonEngine;
use crate::bootstrap::{ApiHealthProbe, BootstrapCoordinator};
use crate::config::Config;
use crate::crd::{BootstrapState, ProvisioningPhase};
use crate::image::ImageBuilder;
use crate::infra::InfrastructureManager;
use crate::k8s::{ClusterApi, ClusterApiFactory};
use crate::naming;
use crate::netplan::NetworkPlan;
use crate::observe::Observer;
use crate::reconcile::firewall::FirewallReconciler;
use crate::reconcile::load_balancer::LoadBalancerReconciler;
use crate::reconcile::network::NetworkReconciler;
use crate::reconcile::placement_group::PlacementGroupReconciler;
use crate::reconcile::servers::{InfraRefs, NodeSpec, ServerReconciler, WORKER_CREATE_CONCURRENCY};
use crate::reconcile::ssh_key::SshKeyReconciler;
use crate::reconcile::{roles, verify_ownership, State};
use crate::retry::RetryPolicy;
use crate::talos::{MachineConfigSource, TalosApi};
use crate::utils::polling::PollingConfig;

use super::{PhaseEngine, PhaseStep, Timeouts};

/// Everything the steps need, bundled once by the front end.
#[derive(Clone)]
pub struct EngineDeps {
    pub infra: Arc<dyn InfrastructureManager>,
    pub talos: Arc<dyn TalosApi>,
    pub k8s_factory: Arc<dyn ClusterApiFactory>,
    pub probe: Arc<dyn ApiHealthProbe>,
    pub installer_factory: Arc<dyn AddonInstallerFactory>,
    pub config_source: Arc<dyn MachineConfigSource>,
    pub timeouts: Timeouts,
    /// CLI path caps control planes at one until operator handover.
    pub control_plane_limit: Option<u32>,
}

/// The standard provisioning step list, in machine order.
pub fn standard_steps(deps: &EngineDeps) -> Vec<Box<dyn PhaseStep>> {
    vec![
        Box::new(ImageStep::new(deps)),
        Box::new(InfrastructureStep::new(deps)),
        Box::new(ComputeStep::new(deps)),
        Box::new(BootstrapStep::new(deps)),
        Box::new(CniStep::new(deps)),
        Box::new(AddonsStep::new(deps)),
    ]
}

/// Convenience: engine with the standard steps and the default retry policy.
pub fn build_engine(deps: &EngineDeps) -> PhaseEngine {
    PhaseEngine::new(
        standard_steps(deps),
        RetryPolicy::default(),
        deps.timeouts.clone(),
    )
}

fn plan_for(config: &Config) -> Result<NetworkPlan> {
    NetworkPlan::new(&config.network_cidr)
}

/// Fetch the kubeconfig for an already-bootstrapped cluster when this
/// reconcile has not seen it yet (operator restart, handover).
async fn ensure_kubeconfig(
    talos: &Arc<dyn TalosApi>,
    state: &mut State,
) -> Result<()> {
    if state.kubeconfig.is_some() || !state.bootstrap_completed() {
        return Ok(());
    }

    let node_ip = state
        .sorted_control_planes()
        .first()
        .and_then(|s| s.public_ip())
        .or_else(|| {
            state
                .bootstrap
                .as_ref()
                .and_then(|b| b.public_ip.clone())
        })
        .context("no reachable node to fetch the kubeconfig from")?;

    let kubeconfig = talos.kubeconfig(&node_ip).await?;
    let lb_ip = state
        .load_balancer
        .as_ref()
        .and_then(|lb| lb.public_ip())
        .context("load balancer address unknown while rewriting kubeconfig")?;
    state.kubeconfig = Some(crate::bootstrap::rewrite_server_url(&kubeconfig, &lb_ip)?);
    Ok(())
}

// ---- Image ----

pub struct ImageStep {
    builder: ImageBuilder,
}

impl ImageStep {
    fn new(deps: &EngineDeps) -> Self {
        Self {
            builder: ImageBuilder::new(deps.infra.clone(), deps.timeouts.image),
        }
    }
}

#[async_trait]
impl PhaseStep for ImageStep {
    fn phase(&self) -> ProvisioningPhase {
        ProvisioningPhase::Image
    }

    async fn is_complete(&self, config: &Config, state: &mut State) -> Result<bool> {
        if state.snapshot_id.is_some() {
            return Ok(true);
        }
        if let Some(id) = self.builder.find_snapshot(config).await? {
            state.snapshot_id = Some(id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let id = self
            .builder
            .ensure_snapshot(config, cancel, observer)
            .await
            .context("image provisioning failed")?;
        state.snapshot_id = Some(id);
        Ok(())
    }
}

// ---- Infrastructure ----

pub struct InfrastructureStep {
    infra: Arc<dyn InfrastructureManager>,
    network: NetworkReconciler,
    firewall: FirewallReconciler,
    load_balancer: LoadBalancerReconciler,
    placement_group: PlacementGroupReconciler,
    ssh_key: SshKeyReconciler,
}

impl InfrastructureStep {
    fn new(deps: &EngineDeps) -> Self {
        Self {
            infra: deps.infra.clone(),
            network: NetworkReconciler::new(deps.infra.clone()),
            firewall: FirewallReconciler::new(deps.infra.clone()),
            load_balancer: LoadBalancerReconciler::new(deps.infra.clone()),
            placement_group: PlacementGroupReconciler::new(deps.infra.clone()),
            ssh_key: SshKeyReconciler::new(deps.infra.clone()),
        }
    }
}

#[async_trait]
impl PhaseStep for InfrastructureStep {
    fn phase(&self) -> ProvisioningPhase {
        ProvisioningPhase::Infrastructure
    }

    async fn is_complete(&self, config: &Config, state: &mut State) -> Result<bool> {
        let cluster = &config.cluster_name;

        if let Some(network) = self
            .infra
            .get_network_by_name(&naming::network(cluster))
            .await?
        {
            verify_ownership("network", &network.name, cluster, &network.labels)?;
            state.network = Some(network);
        }
        if let Some(firewall) = self
            .infra
            .get_firewall_by_name(&naming::firewall(cluster))
            .await?
        {
            verify_ownership("firewall", &firewall.name, cluster, &firewall.labels)?;
            state.firewall = Some(firewall);
        }
        if let Some(lb) = self
            .infra
            .get_load_balancer_by_name(&naming::kube_api_load_balancer(cluster))
            .await?
        {
            verify_ownership("load-balancer", &lb.name, cluster, &lb.labels)?;
            state.load_balancer = Some(lb);
        }
        if let Some(pg) = self
            .infra
            .get_placement_group_by_name(&naming::placement_group(cluster, roles::CONTROL_PLANE))
            .await?
        {
            verify_ownership("placement-group", &pg.name, cluster, &pg.labels)?;
            state.placement_group = Some(pg);
        }
        if let Some(key) = self
            .infra
            .get_ssh_key_by_name(&naming::ssh_key(cluster))
            .await?
        {
            verify_ownership("ssh-key", &key.name, cluster, &key.labels)?;
            state.ssh_key = Some(key);
        }

        Ok(state.network.is_some()
            && state.firewall.is_some()
            && state.load_balancer.is_some()
            && state.placement_group.is_some()
            && state.ssh_key.is_some())
    }

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        _cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let plan = plan_for(config)?;

        let network = self.network.ensure(config, &plan, observer).await?;
        let network_id = network.id;
        state.network = Some(network);

        state.firewall = Some(self.firewall.ensure(config, observer).await?);
        state.load_balancer = Some(
            self.load_balancer
                .ensure(config, network_id, observer)
                .await?,
        );
        state.placement_group = Some(self.placement_group.ensure(config, observer).await?);

        let (key, private_key) = self.ssh_key.ensure(&config.cluster_name, observer).await?;
        state.ssh_key = Some(key);
        if private_key.is_some() {
            state.ssh_private_key = private_key;
        }
        Ok(())
    }
}

// ---- Compute ----

pub struct ComputeStep {
    infra: Arc<dyn InfrastructureManager>,
    servers: ServerReconciler,
    load_balancer: LoadBalancerReconciler,
    talos: Arc<dyn TalosApi>,
    k8s_factory: Arc<dyn ClusterApiFactory>,
    config_source: Arc<dyn MachineConfigSource>,
    control_plane_limit: Option<u32>,
    node_ready_timeout: Duration,
}

impl ComputeStep {
    fn new(deps: &EngineDeps) -> Self {
        Self {
            infra: deps.infra.clone(),
            servers: ServerReconciler::new(deps.infra.clone()),
            load_balancer: LoadBalancerReconciler::new(deps.infra.clone()),
            talos: deps.talos.clone(),
            k8s_factory: deps.k8s_factory.clone(),
            config_source: deps.config_source.clone(),
            control_plane_limit: deps.control_plane_limit,
            node_ready_timeout: deps.timeouts.compute,
        }
    }

    fn desired_control_planes(&self, config: &Config) -> u32 {
        match self.control_plane_limit {
            Some(limit) => config.control_planes.count.min(limit),
            None => config.control_planes.count,
        }
    }

    fn cert_sans(state: &State) -> Vec<String> {
        let mut sans = Vec::new();
        if let Some(lb) = &state.load_balancer {
            sans.extend(lb.public_ip());
            sans.extend(lb.private_ip());
        }
        sans
    }

    /// The handover case: bootstrap ran in the CLI but the node was never
    /// attached to the private network.
    fn attachment_pending(&self, state: &State) -> bool {
        let Some(bootstrap) = &state.bootstrap else {
            return false;
        };
        if !bootstrap.completed {
            return false;
        }
        let Some(node_id) = bootstrap.bootstrap_node_id else {
            return false;
        };
        let Some(network_id) = state.network_id() else {
            return true;
        };
        !state
            .control_planes
            .iter()
            .any(|s| s.id == node_id && s.private_ip_on(network_id).is_some())
    }

    async fn wait_node_ready(&self, state: &State, node_name: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(kubeconfig) = &state.kubeconfig else {
            return Ok(());
        };
        let k8s = self.k8s_factory.connect(kubeconfig).await?;
        PollingConfig::new(
            self.node_ready_timeout,
            Duration::from_secs(10),
            format!("waiting for node {} to become Ready", node_name),
        )
        .poll_until(cancel, || {
            let k8s = k8s.clone();
            let node_name = node_name.to_string();
            async move { k8s.node_ready(&node_name).await }
        })
        .await
    }
}

#[async_trait]
impl PhaseStep for ComputeStep {
    fn phase(&self) -> ProvisioningPhase {
        ProvisioningPhase::Compute
    }

    async fn is_complete(&self, config: &Config, state: &mut State) -> Result<bool> {
        state.control_planes = self.servers.list_control_planes(&config.cluster_name).await?;
        state.workers = self.servers.list_workers(&config.cluster_name).await?;

        if self.attachment_pending(state) {
            return Ok(false);
        }

        let desired = self.desired_control_planes(config);
        for ordinal in 1..=desired {
            let name = naming::control_plane_server(&config.cluster_name, ordinal);
            if !state.control_planes.iter().any(|s| s.name == name) {
                return Ok(false);
            }
        }

        if (state.workers.len() as u32) < config.workers.count {
            return Ok(false);
        }

        // Every control plane serves behind the API load balancer.
        if let Some(lb_id) = state.load_balancer.as_ref().map(|lb| lb.id) {
            let lb = self.infra.get_load_balancer(lb_id).await?;
            let all_targets = state
                .control_planes
                .iter()
                .all(|s| lb.has_target(s.id));
            state.load_balancer = Some(lb);
            if !all_targets {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let plan = plan_for(config)?;
        let network = state.network.as_ref().context("network not reconciled")?;
        let firewall = state.firewall.as_ref().context("firewall not reconciled")?;
        let lb = state
            .load_balancer
            .clone()
            .context("load balancer not reconciled")?;
        let refs = InfraRefs {
            network_id: network.id,
            firewall_id: firewall.id,
            placement_group_id: state.placement_group.as_ref().map(|pg| pg.id),
            ssh_key_id: state.ssh_key.as_ref().map(|k| k.id).context("SSH key not reconciled")?,
        };
        let snapshot_id = state.snapshot_id.context("snapshot not provisioned")?;

        // Handover: attach the CLI-created bootstrap node first.
        if let Some(bootstrap) = state.bootstrap.clone() {
            if bootstrap.completed {
                if let Some(attached) = self
                    .servers
                    .attach_bootstrap_node(config, &plan, refs.network_id, &bootstrap)
                    .await?
                {
                    if let Some(existing) = state
                        .control_planes
                        .iter_mut()
                        .find(|s| s.id == attached.id)
                    {
                        *existing = attached;
                    } else {
                        state.control_planes.push(attached);
                    }
                }
                ensure_kubeconfig(&self.talos, state).await?;
            }
        }

        let sans = Self::cert_sans(state);
        let desired = self.desired_control_planes(config);

        for ordinal in 1..=desired {
            let name = naming::control_plane_server(&config.cluster_name, ordinal);
            if let Some(existing) = state
                .control_planes
                .iter()
                .find(|s| s.name == name)
                .cloned()
            {
                self.load_balancer.ensure_target(&lb, existing.id).await?;
                continue;
            }

            // Joining members go one at a time: the previous member must be
            // Ready before the next one boots.
            if ordinal > 1 {
                let previous = naming::control_plane_server(&config.cluster_name, ordinal - 1);
                self.wait_node_ready(state, &previous, cancel).await?;
            }

            let user_data = self
                .config_source
                .control_plane_config(config, state, &name, &sans)
                .await?;
            let node = NodeSpec {
                name: name.clone(),
                role: roles::CONTROL_PLANE,
                pool: config.control_planes.name.clone(),
                server_type: config.control_planes.server_type.clone(),
                private_ip: plan.control_plane_ip(ordinal)?.to_string(),
                user_data,
            };
            let server = self
                .servers
                .ensure_node(config, &node, refs, snapshot_id, observer)
                .await?;
            self.load_balancer.ensure_target(&lb, server.id).await?;
            state.control_planes.push(server);
        }

        // Worker counts in the canonical config are zero on the provisioning
        // path; scale-out happens in the running-phase loop. This handles
        // any future non-zero count uniformly.
        let existing_workers = state.workers.len() as u32;
        if existing_workers < config.workers.count {
            let mut specs = Vec::new();
            for ordinal in (existing_workers + 1)..=config.workers.count {
                let name =
                    naming::worker_server(&config.cluster_name, &config.workers.name, ordinal);
                let user_data = self
                    .config_source
                    .worker_config(config, state, &name)
                    .await?;
                specs.push(NodeSpec {
                    name,
                    role: roles::WORKER,
                    pool: config.workers.name.clone(),
                    server_type: config.workers.server_type.clone(),
                    private_ip: plan.worker_ip(ordinal)?.to_string(),
                    user_data,
                });
            }
            let mut created = self
                .servers
                .ensure_nodes_parallel(
                    config,
                    specs,
                    refs,
                    snapshot_id,
                    WORKER_CREATE_CONCURRENCY,
                    observer,
                )
                .await?;
            state.workers.append(&mut created);
        }

        state.load_balancer = Some(self.infra.get_load_balancer(lb.id).await?);
        Ok(())
    }
}

// ---- Bootstrap ----

pub struct BootstrapStep {
    talos: Arc<dyn TalosApi>,
    infra: Arc<dyn InfrastructureManager>,
    probe: Arc<dyn ApiHealthProbe>,
    config_source: Arc<dyn MachineConfigSource>,
    timeouts: Timeouts,
}

impl BootstrapStep {
    fn new(deps: &EngineDeps) -> Self {
        Self {
            talos: deps.talos.clone(),
            infra: deps.infra.clone(),
            probe: deps.probe.clone(),
            config_source: deps.config_source.clone(),
            timeouts: deps.timeouts.clone(),
        }
    }
}

#[async_trait]
impl PhaseStep for BootstrapStep {
    fn phase(&self) -> ProvisioningPhase {
        ProvisioningPhase::Bootstrap
    }

    async fn is_complete(&self, _config: &Config, state: &mut State) -> Result<bool> {
        if !state.bootstrap_completed() {
            return Ok(false);
        }
        ensure_kubeconfig(&self.talos, state).await?;
        Ok(state.kubeconfig.is_some())
    }

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let node = state
            .sorted_control_planes()
            .first()
            .cloned()
            .cloned()
            .context("no control plane available for bootstrap")?;
        let sans = ComputeStep::cert_sans(state);
        let machine_config = self
            .config_source
            .control_plane_config(config, state, &node.name, &sans)
            .await
            .context("failed to generate bootstrap machine config")?;

        let coordinator = BootstrapCoordinator::new(
            self.talos.clone(),
            self.infra.clone(),
            self.probe.clone(),
        )
        .with_timing(
            RetryPolicy::default(),
            self.timeouts.bootstrap,
            self.timeouts.lb_health,
        );

        let outcome = coordinator
            .run(config, &machine_config, state, cancel, observer)
            .await?;

        state.kubeconfig = Some(outcome.kubeconfig);
        state.bootstrap = Some(BootstrapState {
            completed: true,
            bootstrap_node: Some(outcome.node_name),
            bootstrap_node_id: Some(outcome.node_id),
            public_ip: Some(outcome.public_ip),
            completed_at: Some(chrono::Utc::now().to_rfc3339()),
        });
        Ok(())
    }
}

// ---- CNI and addons ----

async fn addon_engine(
    k8s_factory: &Arc<dyn ClusterApiFactory>,
    installer_factory: &Arc<dyn AddonInstallerFactory>,
    config: &Config,
    state: &State,
    addon_timeout: Duration,
) -> Result<(AddonEngine, Arc<dyn ClusterApi>)> {
    let kubeconfig = state
        .kubeconfig
        .as_ref()
        .context("kubeconfig not available yet")?;
    let k8s = k8s_factory.connect(kubeconfig).await?;
    let installer = installer_factory
        .create(config, kubeconfig, k8s.clone())
        .await?;
    Ok((AddonEngine::new(k8s.clone(), installer, addon_timeout), k8s))
}

pub struct CniStep {
    k8s_factory: Arc<dyn ClusterApiFactory>,
    installer_factory: Arc<dyn AddonInstallerFactory>,
    timeouts: Timeouts,
}

impl CniStep {
    fn new(deps: &EngineDeps) -> Self {
        Self {
            k8s_factory: deps.k8s_factory.clone(),
            installer_factory: deps.installer_factory.clone(),
            timeouts: deps.timeouts.clone(),
        }
    }
}

#[async_trait]
impl PhaseStep for CniStep {
    fn phase(&self) -> ProvisioningPhase {
        ProvisioningPhase::Cni
    }

    async fn is_complete(&self, config: &Config, state: &mut State) -> Result<bool> {
        if state.kubeconfig.is_none() {
            return Ok(false);
        }
        let (engine, _) = addon_engine(
            &self.k8s_factory,
            &self.installer_factory,
            config,
            state,
            self.timeouts.cni,
        )
        .await?;
        let cilium = crate::addons::catalogue().into_iter().next().expect("catalogue is never empty");
        engine.is_healthy(&cilium).await
    }

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let (engine, _) = addon_engine(
            &self.k8s_factory,
            &self.installer_factory,
            config,
            state,
            self.timeouts.cni,
        )
        .await?;
        engine.ensure_addon("cilium", config, cancel, observer).await
    }
}

pub struct AddonsStep {
    k8s_factory: Arc<dyn ClusterApiFactory>,
    installer_factory: Arc<dyn AddonInstallerFactory>,
    timeouts: Timeouts,
}

impl AddonsStep {
    fn new(deps: &EngineDeps) -> Self {
        Self {
            k8s_factory: deps.k8s_factory.clone(),
            installer_factory: deps.installer_factory.clone(),
            timeouts: deps.timeouts.clone(),
        }
    }
}

#[async_trait]
impl PhaseStep for AddonsStep {
    fn phase(&self) -> ProvisioningPhase {
        ProvisioningPhase::Addons
    }

    async fn is_complete(&self, config: &Config, state: &mut State) -> Result<bool> {
        if state.kubeconfig.is_none() {
            return Ok(false);
        }
        let (engine, _) = addon_engine(
            &self.k8s_factory,
            &self.installer_factory,
            config,
            state,
            self.timeouts.addon,
        )
        .await?;
        let health = engine.check_all(config).await;
        let all_healthy = !health.is_empty() && health.values().all(|&h| h);
        if all_healthy {
            info!("all {} enabled addons healthy", health.len());
        }
        Ok(all_healthy)
    }

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let (engine, _) = addon_engine(
            &self.k8s_factory,
            &self.installer_factory,
            config,
            state,
            self.timeouts.addon,
        )
        .await?;
        state.addons = engine.install_all(config, cancel, observer).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::addons::{AddonInstaller, AddonSpec};
    use crate::config::test_config;
    use crate::crd::ProvisioningPhase;
    use crate::infra::FakeInfrastructure;
    use crate::k8s::fake::FakeClusterApiFactory;
    use crate::k8s::FakeClusterApi;
    use crate::observe::{Observer, RecordingObserver};
    use crate::reconcile::owner_labels;
    use crate::talos::api::FakeTalos;
    use crate::talos::producer::FakeConfigSource;

    struct AlwaysHealthyProbe;

    #[async_trait]
    impl ApiHealthProbe for AlwaysHealthyProbe {
        async fn healthy(&self, _endpoint: &str) -> bool {
            true
        }
    }

    /// Installer that flips pods healthy in the fake cluster.
    struct PodFlippingInstaller {
        k8s: Arc<FakeClusterApi>,
    }

    #[async_trait]
    impl AddonInstaller for PodFlippingInstaller {
        async fn install(&self, addon: &AddonSpec, _config: &Config) -> Result<()> {
            let (key, value) = addon.selector.split_once('=').unwrap();
            self.k8s.set_pods(addon.namespace, &[(key, value)], 2, true);
            Ok(())
        }
    }

    struct FakeInstallerFactory {
        k8s: Arc<FakeClusterApi>,
    }

    #[async_trait]
    impl AddonInstallerFactory for FakeInstallerFactory {
        async fn create(
            &self,
            _config: &Config,
            _kubeconfig: &str,
            _k8s: Arc<dyn ClusterApi>,
        ) -> Result<Arc<dyn AddonInstaller>> {
            Ok(Arc::new(PodFlippingInstaller {
                k8s: self.k8s.clone(),
            }))
        }
    }

    pub struct Harness {
        pub infra: Arc<FakeInfrastructure>,
        pub talos: Arc<FakeTalos>,
        pub k8s: Arc<FakeClusterApi>,
        pub deps: EngineDeps,
    }

    pub fn harness(control_plane_limit: Option<u32>) -> Harness {
        let infra = Arc::new(FakeInfrastructure::new());
        let talos = FakeTalos::new();
        let k8s = FakeClusterApi::shared();

        let deps = EngineDeps {
            infra: infra.clone(),
            talos: talos.clone(),
            k8s_factory: Arc::new(FakeClusterApiFactory::new(k8s.clone())),
            probe: Arc::new(AlwaysHealthyProbe),
            installer_factory: Arc::new(FakeInstallerFactory { k8s: k8s.clone() }),
            config_source: Arc::new(FakeConfigSource),
            timeouts: Timeouts {
                // Tight ceilings keep failing tests fast.
                cni: Duration::from_secs(5),
                addon: Duration::from_secs(5),
                ..Timeouts::default()
            },
            control_plane_limit,
        };

        Harness {
            infra,
            talos,
            k8s,
            deps,
        }
    }

    /// Seed the snapshot a previous image build would have left behind.
    pub async fn seed_snapshot(harness: &Harness, config: &Config) -> u64 {
        let seed = harness.infra.seed_server(
            "seed-builder",
            "192.0.2.200",
            owner_labels(&config.cluster_name, roles::IMAGE_BUILDER),
        );
        let mut labels = owner_labels(&config.cluster_name, roles::SNAPSHOT);
        labels.insert("os".to_string(), "talos".to_string());
        labels.insert("talos_version".to_string(), config.talos.version.clone());
        labels.insert("schematic_id".to_string(), config.talos.schematic_id.clone());
        labels.insert("arch".to_string(), "amd64".to_string());
        let snapshot = harness
            .infra
            .create_snapshot(seed, "talos", labels)
            .await
            .unwrap();
        harness.infra.delete_server(seed).await.unwrap();
        snapshot.id
    }

    fn engine(harness: &Harness) -> PhaseEngine {
        PhaseEngine::new(
            standard_steps(&harness.deps),
            RetryPolicy::new(3, Duration::from_millis(1)),
            harness.deps.timeouts.clone(),
        )
    }

    #[tokio::test]
    async fn test_happy_path_minimal_cluster() {
        let harness = harness(None);
        let config = test_config("test");
        seed_snapshot(&harness, &config).await;

        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();
        let mut state = State::default();

        let report = engine(&harness)
            .reconcile(&config, &mut state, &cancel, &observer)
            .await;

        assert!(report.is_complete(), "error: {:?}", report.error);
        assert_eq!(state.control_planes.len(), 1);
        assert_eq!(state.control_planes[0].name, "test-cp-01");
        assert_eq!(
            state.control_planes[0]
                .private_ip_on(state.network_id().unwrap())
                .unwrap(),
            "10.0.0.2"
        );
        assert!(state.workers.is_empty());
        assert_eq!(harness.talos.bootstrap_calls(), 1);
        assert!(state.bootstrap_completed());
        assert!(state.kubeconfig.is_some());
        // The three core addons converged.
        assert_eq!(state.addons.len(), 3);
        assert!(state.addons.values().all(|a| a.healthy));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let harness = harness(None);
        let config = test_config("test");
        seed_snapshot(&harness, &config).await;

        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();
        let engine = engine(&harness);

        let mut state = State::default();
        let first = engine.reconcile(&config, &mut state, &cancel, &observer).await;
        assert!(first.is_complete());
        let servers_after_first = harness.infra.server_count();
        let network_id = state.network_id();

        // Second pass starts from a blank state record, as every reconcile
        // does, and observes the same world.
        let mut state = State::default();
        state.bootstrap = first_bootstrap(&harness, &config).await;
        let second = engine.reconcile(&config, &mut state, &cancel, &observer).await;

        assert!(second.is_complete(), "error: {:?}", second.error);
        assert_eq!(harness.infra.server_count(), servers_after_first);
        assert_eq!(state.network_id(), network_id);
        assert_eq!(harness.talos.bootstrap_calls(), 1);
        assert!(second.runs.is_empty(), "re-entry must not re-run phases");
    }

    async fn first_bootstrap(
        harness: &Harness,
        config: &Config,
    ) -> Option<crate::crd::BootstrapState> {
        let cp = harness
            .infra
            .get_server_by_name(&naming::control_plane_server(&config.cluster_name, 1))
            .await
            .unwrap()?;
        Some(crate::crd::BootstrapState {
            completed: true,
            bootstrap_node: Some("cp-01".to_string()),
            bootstrap_node_id: Some(cp.id),
            public_ip: cp.public_ip(),
            completed_at: None,
        })
    }

    #[tokio::test]
    async fn test_ownership_conflict_fails_within_one_reconcile() {
        let harness = harness(None);
        let config = test_config("test");
        seed_snapshot(&harness, &config).await;

        let mut foreign = std::collections::HashMap::new();
        foreign.insert("cluster".to_string(), "other-cluster".to_string());
        harness
            .infra
            .seed_network("test-network", "10.0.0.0/16", foreign);

        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();
        let mut state = State::default();

        let report = engine(&harness)
            .reconcile(&config, &mut state, &cancel, &observer)
            .await;

        assert_eq!(report.failed, Some(ProvisioningPhase::Infrastructure));
        assert_eq!(
            crate::errors::reason_for(report.error.as_ref().unwrap()),
            "OwnershipConflict"
        );
        // The foreign network is untouched.
        let network = harness
            .infra
            .get_network_by_name("test-network")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(network.labels.get("cluster").unwrap(), "other-cluster");
    }

    #[tokio::test]
    async fn test_operator_reentry_after_cli_handover() {
        let harness = harness(None);
        let mut config = test_config("test");
        config.control_planes.count = 3;
        seed_snapshot(&harness, &config).await;

        // What the CLI left behind: full infrastructure and one bootstrapped,
        // unattached control plane.
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();
        {
            let mut cli_config = config.clone();
            cli_config.control_planes.count = 1;
            let mut state = State::default();
            let cli_engine = PhaseEngine::new(
                standard_steps(&EngineDeps {
                    control_plane_limit: Some(1),
                    ..harness.deps.clone()
                }),
                RetryPolicy::new(3, Duration::from_millis(1)),
                harness.deps.timeouts.clone(),
            );
            let report = cli_engine
                .reconcile(&cli_config, &mut state, &cancel, &observer)
                .await;
            assert!(report.is_complete());
        }
        assert_eq!(harness.talos.bootstrap_calls(), 1);

        // Nodes report Ready as they join.
        for ordinal in 1..=3 {
            harness
                .k8s
                .set_node(&naming::control_plane_server("test", ordinal), true);
        }

        let mut state = State::default();
        state.bootstrap = first_bootstrap(&harness, &config).await;
        let report = engine(&harness)
            .reconcile(&config, &mut state, &cancel, &observer)
            .await;

        assert!(report.is_complete(), "error: {:?}", report.error);
        // No second bootstrap RPC.
        assert_eq!(harness.talos.bootstrap_calls(), 1);
        // Scaled to three control planes with deterministic addresses.
        assert_eq!(state.control_planes.len(), 3);
        let network_id = state.network_id().unwrap();
        let ips: Vec<String> = state
            .sorted_control_planes()
            .iter()
            .filter_map(|s| s.private_ip_on(network_id))
            .collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        // All three are load-balancer targets.
        let lb = state.load_balancer.as_ref().unwrap();
        assert!(state.control_planes.iter().all(|s| lb.has_target(s.id)));
    }

    #[tokio::test]
    async fn test_transient_cloud_failures_are_retried() {
        let harness = harness(None);
        let config = test_config("test");
        seed_snapshot(&harness, &config).await;
        harness
            .infra
            .inject_failure("create_network", "request failed: connection reset");

        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();
        let mut state = State::default();

        let report = engine(&harness)
            .reconcile(&config, &mut state, &cancel, &observer)
            .await;
        assert!(report.is_complete(), "error: {:?}", report.error);
    }
}
