/// In-cluster operator
///
/// Watches `Cluster` resources and drives the shared engine on every
/// reconcile. One reconcile per object at a time comes from the controller
/// work queue; partial state is never cleaned up here, the next reconcile
/// extends it.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::addons::install::HelmInstallerFactory;
use crate::bootstrap::HttpsApiProbe;
use crate::config::Config;
use crate::credentials::{Credentials, S3Credentials, KEY_TALOS_CONFIG, KEY_TALOS_SECRETS};
use crate::crd::Cluster;
use crate::destroy::Destroyer;
use crate::hcloud::HcloudClient;
use crate::infra::HcloudInfrastructure;
use crate::k8s::{ClusterApi, ClusterApiFactory, KubeClusterApi, KubeClusterApiFactory};
use crate::naming;
use crate::observe::{Event, Observer};
use crate::phases::steps::{build_engine, EngineDeps};
use crate::phases::Timeouts;
use crate::reconcile::servers::{NodeSpec, ServerReconciler, WORKER_CREATE_CONCURRENCY};
use crate::reconcile::{roles, State};
use crate::status::{render_status, StatusReporter};
use crate::talos::{
    EndpointCandidates, MachineConfigSource, SecretsBundle, TalosApi, TalosConfigProducer,
    TalosctlClient, TalosctlConfigSource,
};
use crate::translate;

pub const FINALIZER: &str = "k8zner.io/cleanup";

const REQUEUE_RUNNING: Duration = Duration::from_secs(5 * 60);
const REQUEUE_ERROR: Duration = Duration::from_secs(60);

/// Controller error; the runtime only needs Display + Error.
#[derive(Debug)]
pub struct Error(pub anyhow::Error);

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

pub struct Ctx {
    pub client: Client,
}

/// Run the controller until shutdown.
pub async fn run() -> Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let clusters: Api<Cluster> = Api::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!(
            "Cluster CRD is not queryable: {e}. Install it with `k8zner crd | kubectl apply -f -`"
        );
        anyhow::bail!("Cluster CRD is not installed");
    }

    info!("starting cluster controller");
    Controller::new(clusters, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Ctx { client }))
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("reconciled {}", object.name),
                Err(e) => warn!("reconcile failed: {:#?}", e),
            }
        })
        .await;
    Ok(())
}

async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => apply(cluster, ctx.clone()).await,
            Finalizer::Cleanup(cluster) => cleanup(cluster, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error(anyhow::anyhow!("{}", e)))
}

fn error_policy(_cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!("reconcile failed: {}", error);
    Action::requeue(REQUEUE_ERROR)
}

async fn apply(cluster: Arc<Cluster>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();
    let spec = &cluster.spec;

    info!("reconciling cluster {}/{}", namespace, name);
    let kube_api = Arc::new(KubeClusterApi::new(ctx.client.clone()));
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let reporter = StatusReporter::new(api.clone());

    // Credentials enter the reconcile once, as values.
    let secret = kube_api
        .get_secret_data(&namespace, &spec.credentials_ref)
        .await
        .map_err(Error::from)?
        .with_context(|| format!("credentials secret '{}' not found", spec.credentials_ref))
        .map_err(Error::from)?;
    let credentials = Credentials::from_secret_data(&secret).map_err(Error::from)?;

    let s3 = resolve_backup_credentials(spec, &namespace, kube_api.as_ref()).await;
    let source_ips = translate::detect_source_ips().await;

    let config = match translate::translate(spec, &credentials, s3.as_ref(), source_ips) {
        Ok(config) => config,
        Err(err) => {
            // Rejected before any side effect.
            let report = crate::phases::EngineReport {
                reached: crate::crd::ProvisioningPhase::Image,
                failed: None,
                runs: Vec::new(),
                error: Some(err),
            };
            let state = State::default();
            let rendered = render_status(
                cluster.status.clone().unwrap_or_default(),
                &fallback_config(spec),
                spec.workers.count,
                &state,
                &report,
            );
            reporter
                .update(&name, |status| *status = rendered.clone())
                .await
                .map_err(Error::from)?;
            return Ok(Action::requeue(REQUEUE_ERROR));
        }
    };

    let scratch = tempfile::tempdir()
        .context("failed to create scratch directory")
        .map_err(Error::from)?;
    let secrets_path = materialize_secrets(
        &credentials,
        &namespace,
        &spec.credentials_ref,
        kube_api.as_ref(),
        scratch.path(),
    )
    .await
    .map_err(Error::from)?;

    let talos = talos_client(
        &credentials,
        &config,
        &namespace,
        &spec.credentials_ref,
        kube_api.as_ref(),
        &secrets_path,
    )
    .await
    .map_err(Error::from)?;

    let infra: Arc<dyn crate::infra::InfrastructureManager> = Arc::new(HcloudInfrastructure::new(
        HcloudClient::new(&credentials.hcloud_token).map_err(Error::from)?,
    ));

    let deps = EngineDeps {
        infra,
        talos,
        k8s_factory: Arc::new(KubeClusterApiFactory),
        probe: Arc::new(HttpsApiProbe),
        installer_factory: Arc::new(
            HelmInstallerFactory::new(
                credentials.hcloud_token.clone(),
                credentials.cloudflare_api_token.clone(),
            )
            .map_err(Error::from)?,
        ),
        config_source: Arc::new(TalosctlConfigSource::new(secrets_path)),
        timeouts: Timeouts::default(),
        control_plane_limit: None,
    };

    let observer = kube_event_observer(&ctx.client, &cluster);
    let cancel = CancellationToken::new();
    let engine = build_engine(&deps);

    let mut state = State {
        bootstrap: spec.bootstrap.clone(),
        ..State::default()
    };
    let report = engine.reconcile(&config, &mut state, &cancel, &observer).await;

    // Handover bookkeeping: record a bootstrap that this reconcile performed.
    if state.bootstrap_completed() && !spec.bootstrap.as_ref().is_some_and(|b| b.completed) {
        let patch = json!({"spec": {"bootstrap": state.bootstrap}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("failed to record bootstrap state")
            .map_err(Error::from)?;
    }

    // Worker scale-out and scale-in run only on an otherwise-converged
    // cluster.
    let mut scale_error = None;
    if report.is_complete() {
        if let Some(kubeconfig) = state.kubeconfig.clone() {
            match deps.k8s_factory.connect(&kubeconfig).await {
                Ok(k8s) => {
                    if let Err(err) = reconcile_workers(
                        &config,
                        spec.workers.count,
                        &deps,
                        &k8s,
                        &mut state,
                        &cancel,
                        &observer,
                    )
                    .await
                    {
                        warn!("worker reconciliation failed: {:#}", err);
                        scale_error = Some(err);
                    }
                }
                Err(err) => {
                    warn!("could not connect to workload cluster: {:#}", err);
                    scale_error = Some(err);
                }
            }
        }
    }

    let rendered = render_status(
        cluster.status.clone().unwrap_or_default(),
        &config,
        spec.workers.count,
        &state,
        &report,
    );
    reporter
        .update(&name, |status| *status = rendered.clone())
        .await
        .map_err(Error::from)?;

    if let Some(err) = report.error {
        return Err(Error(err.context(format!("cluster {} reconcile failed", name))));
    }
    if let Some(err) = scale_error {
        return Err(Error(err));
    }
    Ok(Action::requeue(REQUEUE_RUNNING))
}

async fn cleanup(cluster: Arc<Cluster>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();
    info!("destroying cluster {}/{}", namespace, name);

    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let reporter = StatusReporter::new(api);
    if let Err(e) = reporter
        .update(&name, |status| {
            status.phase = crate::crd::ClusterPhase::Destroying;
        })
        .await
    {
        debug!("could not record Destroying phase: {:#}", e);
    }

    let kube_api = KubeClusterApi::new(ctx.client.clone());
    let secret = kube_api
        .get_secret_data(&namespace, &cluster.spec.credentials_ref)
        .await
        .map_err(Error::from)?;
    let Some(secret) = secret else {
        // Without credentials nothing can be deleted; do not block removal.
        warn!(
            "credentials secret '{}' is gone, leaving cloud resources behind",
            cluster.spec.credentials_ref
        );
        return Ok(Action::await_change());
    };
    let credentials = Credentials::from_secret_data(&secret).map_err(Error::from)?;

    let infra: Arc<dyn crate::infra::InfrastructureManager> = Arc::new(HcloudInfrastructure::new(
        HcloudClient::new(&credentials.hcloud_token).map_err(Error::from)?,
    ));
    let observer = kube_event_observer(&ctx.client, &cluster);
    let cancel = CancellationToken::new();

    Destroyer::new(infra)
        .destroy(&cluster.spec.cluster_name, &cancel, &observer)
        .await
        .map_err(Error::from)?;

    Ok(Action::await_change())
}

fn fallback_config(spec: &crate::crd::ClusterSpec) -> Config {
    Config {
        cluster_name: spec.cluster_name.clone(),
        location: spec.region.clone(),
        domain: None,
        network_cidr: crate::config::DEFAULT_NETWORK_CIDR.to_string(),
        pod_cidr: crate::config::DEFAULT_POD_CIDR.to_string(),
        service_cidr: crate::config::DEFAULT_SERVICE_CIDR.to_string(),
        control_planes: crate::config::NodePool {
            name: "cp".to_string(),
            count: spec.control_plane.count,
            server_type: spec.control_plane.size.clone(),
        },
        workers: crate::config::NodePool {
            name: "worker".to_string(),
            count: 0,
            server_type: spec.workers.size.clone(),
        },
        talos: crate::config::TalosSettings {
            version: spec.talos.version.clone(),
            schematic_id: spec.talos.schematic_id.clone(),
            extensions: Vec::new(),
        },
        kubernetes_version: spec.kubernetes.version.clone(),
        addons: crate::config::AddonConfig::default(),
        firewall_source_ips: Vec::new(),
    }
}

async fn resolve_backup_credentials(
    spec: &crate::crd::ClusterSpec,
    namespace: &str,
    kube_api: &dyn ClusterApi,
) -> Option<S3Credentials> {
    let backup = spec.backup.as_ref()?;
    if !backup.enabled {
        return None;
    }
    let secret_ref = backup.s3_secret_ref.as_ref()?;
    match kube_api.get_secret_data(namespace, secret_ref).await {
        Ok(Some(data)) => S3Credentials::from_secret_data(&data)
            .map_err(|e| warn!("backup secret '{}' incomplete: {:#}", secret_ref, e))
            .ok(),
        Ok(None) => {
            warn!("backup secret '{}' not found, skipping backups", secret_ref);
            None
        }
        Err(e) => {
            warn!("could not read backup secret '{}': {:#}", secret_ref, e);
            None
        }
    }
}

/// Talos PKI material: reuse the persisted bundle, or generate once and
/// store it back so it survives restarts.
async fn materialize_secrets(
    credentials: &Credentials,
    namespace: &str,
    secret_name: &str,
    kube_api: &dyn ClusterApi,
    scratch: &std::path::Path,
) -> Result<std::path::PathBuf> {
    match &credentials.talos_secrets {
        Some(yaml) => {
            let bundle = SecretsBundle::from_yaml(yaml.clone())?;
            bundle.materialize(scratch).await
        }
        None => {
            let path = scratch.join("secrets.yaml");
            let (bundle, generated) = SecretsBundle::load_or_generate(&path).await?;
            if generated {
                kube_api
                    .put_secret_key(
                        namespace,
                        secret_name,
                        KEY_TALOS_SECRETS,
                        bundle.yaml().as_bytes(),
                    )
                    .await
                    .context("failed to persist Talos secrets bundle")?;
            }
            Ok(path)
        }
    }
}

/// Admin client config: from the credentials secret, or generated from the
/// bundle and persisted alongside it.
async fn talos_client(
    credentials: &Credentials,
    config: &Config,
    namespace: &str,
    secret_name: &str,
    kube_api: &dyn ClusterApi,
    secrets_path: &std::path::Path,
) -> Result<Arc<dyn TalosApi>> {
    if let Some(yaml) = &credentials.talos_config {
        return Ok(Arc::new(TalosctlClient::from_yaml(yaml)?));
    }

    // Endpoint in the client config is advisory; calls always pass explicit
    // node addresses.
    let producer = TalosConfigProducer::new(
        config,
        &EndpointCandidates {
            first_control_plane_public_ip: Some("127.0.0.1".to_string()),
            ..EndpointCandidates::default()
        },
        secrets_path.to_path_buf(),
    )?;
    let talosconfig = producer.client_config().await?;
    kube_api
        .put_secret_key(
            namespace,
            secret_name,
            KEY_TALOS_CONFIG,
            talosconfig.as_bytes(),
        )
        .await
        .context("failed to persist talosconfig")?;
    Ok(Arc::new(TalosctlClient::from_yaml(&talosconfig)?))
}

/// Converge worker servers on the desired count.
///
/// Scale-out creates the missing ordinals with bounded parallelism;
/// scale-in removes the highest ordinals gracefully (Talos reset, node
/// deletion, then the server).
pub async fn reconcile_workers(
    config: &Config,
    desired: u32,
    deps: &EngineDeps,
    k8s: &Arc<dyn ClusterApi>,
    state: &mut State,
    cancel: &CancellationToken,
    observer: &Arc<dyn Observer>,
) -> Result<()> {
    let servers = ServerReconciler::new(deps.infra.clone());
    state.workers = servers.list_workers(&config.cluster_name).await?;
    let observed = state.workers.len() as u32;

    if observed < desired {
        let plan = crate::netplan::NetworkPlan::new(&config.network_cidr)?;
        let refs = crate::reconcile::servers::InfraRefs {
            network_id: state.network_id().context("network not reconciled")?,
            firewall_id: state.firewall_id().context("firewall not reconciled")?,
            placement_group_id: None,
            ssh_key_id: state
                .ssh_key
                .as_ref()
                .map(|k| k.id)
                .context("SSH key not reconciled")?,
        };
        let snapshot_id = state.snapshot_id.context("snapshot not provisioned")?;

        let mut specs = Vec::new();
        for ordinal in 1..=desired {
            let node_name =
                naming::worker_server(&config.cluster_name, &config.workers.name, ordinal);
            if state.workers.iter().any(|s| s.name == node_name) {
                continue;
            }
            let user_data = deps
                .config_source
                .worker_config(config, state, &node_name)
                .await?;
            specs.push(NodeSpec {
                name: node_name,
                role: roles::WORKER,
                pool: config.workers.name.clone(),
                server_type: config.workers.server_type.clone(),
                private_ip: plan.worker_ip(ordinal)?.to_string(),
                user_data,
            });
        }

        info!("scaling workers {} -> {}", observed, desired);
        observer.progress("Workers", observed, desired);
        servers
            .ensure_nodes_parallel(
                config,
                specs,
                refs,
                snapshot_id,
                WORKER_CREATE_CONCURRENCY,
                observer,
            )
            .await?;
    } else if observed > desired {
        // Newest nodes go first so ordinals stay dense from the bottom.
        let mut doomed = state.workers.clone();
        doomed.sort_by(|a, b| b.name.cmp(&a.name));
        doomed.truncate((observed - desired) as usize);

        info!("scaling workers {} -> {}", observed, desired);
        for server in doomed {
            if cancel.is_cancelled() {
                return Err(crate::errors::ProvisionError::Cancelled.into());
            }
            info!("removing worker {}", server.name);
            if let Some(ip) = server.public_ip() {
                if let Err(e) = deps.talos.reset_node(&ip).await {
                    // A reset that powers the node down drops the connection.
                    warn!("reset of {} did not confirm: {:#}", server.name, e);
                }
            }
            if let Err(e) = k8s.delete_node(&server.name).await {
                warn!("could not delete node {}: {:#}", server.name, e);
            }
            deps.infra
                .delete_server(server.id)
                .await
                .with_context(|| format!("failed to delete server {}", server.name))?;
            observer.event(Event::info(format!("worker {} removed", server.name)));
        }
    }

    state.workers = servers.list_workers(&config.cluster_name).await?;
    Ok(())
}

/// Event sink publishing Kubernetes events for the cluster object while
/// keeping the structured log in sync.
struct KubeEventObserver {
    sender: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl Observer for KubeEventObserver {
    fn event(&self, event: Event) {
        if event.event_type.is_failure() {
            warn!(kind = event.event_type.as_str(), "{}", event.message);
        } else {
            info!(kind = event.event_type.as_str(), "{}", event.message);
        }
        let _ = self.sender.send(event);
    }

    fn progress(&self, phase: &str, current: u32, total: u32) {
        debug!(phase, current, total, "progress");
    }
}

fn kube_event_observer(client: &Client, cluster: &Cluster) -> Arc<dyn Observer> {
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "k8zner".to_string(),
            instance: None,
        },
    );
    let reference = cluster.object_ref(&());
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let kube_event = KubeEvent {
                type_: if event.event_type.is_failure() {
                    KubeEventType::Warning
                } else {
                    KubeEventType::Normal
                },
                reason: event.event_type.as_str().to_string(),
                note: Some(event.message.clone()),
                action: event
                    .phase
                    .clone()
                    .unwrap_or_else(|| "Reconcile".to_string()),
                secondary: None,
            };
            if let Err(e) = recorder.publish(&kube_event, &reference).await {
                debug!("could not publish event: {:#}", e);
            }
        }
    });

    Arc::new(KubeEventObserver { sender })
}
