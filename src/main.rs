/// k8zner - Talos Kubernetes clusters on Hetzner Cloud
///
/// One binary, two front ends: a one-shot CLI that bootstraps a cluster and
/// hands it over, and a long-running operator reconciling Cluster resources.
/// Both drive the same provisioning engine.
mod addons;
mod bootstrap;
mod config;
mod crd;
mod credentials;
mod destroy;
mod errors;
mod hcloud;
mod image;
mod infra;
mod k8s;
mod naming;
mod netplan;
mod observe;
mod operator;
mod phases;
mod reconcile;
mod retry;
mod status;
mod talos;
mod translate;
mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::addons::install::{AddonInstaller, HelmInstaller, HelmInstallerFactory};
use crate::addons::AddonEngine;
use crate::bootstrap::HttpsApiProbe;
use crate::config::Config;
use crate::credentials::Credentials;
use crate::crd::{Cluster, ClusterSpec};
use crate::destroy::Destroyer;
use crate::hcloud::HcloudClient;
use crate::infra::{HcloudInfrastructure, InfrastructureManager};
use crate::k8s::{KubeClusterApi, KubeClusterApiFactory};
use crate::observe::{ConsoleObserver, LogObserver, Observer};
use crate::phases::steps::{build_engine, EngineDeps};
use crate::phases::Timeouts;
use crate::reconcile::State;
use crate::talos::{
    EndpointCandidates, SecretsBundle, TalosConfigProducer, TalosctlClient, TalosctlConfigSource,
};

#[derive(Parser)]
#[command(name = "k8zner")]
#[command(about = "Deploy Talos Linux Kubernetes clusters on Hetzner Cloud", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cluster specification file
    #[arg(short, long, default_value = "cluster.yaml")]
    config: PathBuf,

    /// Output directory for generated files
    #[arg(short, long, default_value = "./output")]
    output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster and hand it over to the operator
    Create,

    /// Destroy an existing cluster
    Destroy,

    /// Show cluster status
    Status,

    /// Generate an example cluster specification
    Init,

    /// Run the in-cluster operator
    Operator,

    /// Print the Cluster CustomResourceDefinition
    Crd,
}

/// Exit codes: 0 success, 1 failure, 2 validation error, 3 cancelled.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if errors::is_validation(err) {
        2
    } else if errors::is_cancelled(err) {
        3
    } else {
        1
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("k8zner={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Create => create_cluster(&cli).await,
        Commands::Destroy => destroy_cluster(&cli).await,
        Commands::Status => show_status(&cli).await,
        Commands::Init => init_spec(&cli).await,
        Commands::Operator => operator::run().await,
        Commands::Crd => print_crd(),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(exit_code_for(&e));
    }
}

/// Line-oriented output by default; CI environments get the structured log
/// instead (`CI` or `K8ZNER_NO_TUI` suppress terminal output).
fn cli_observer() -> Arc<dyn Observer> {
    let suppress = std::env::var_os("CI").is_some() || std::env::var_os("K8ZNER_NO_TUI").is_some();
    if suppress {
        Arc::new(LogObserver)
    } else {
        Arc::new(ConsoleObserver)
    }
}

/// Cancellation token tripped by SIGINT.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            trip.cancel();
        }
    });
    cancel
}

fn load_spec(path: &Path) -> Result<ClusterSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))
}

async fn load_config(spec: &ClusterSpec, credentials: &Credentials) -> Result<Config> {
    // Backup S3 credentials live in a cluster secret; on the CLI path they
    // only resolve once the operator takes over.
    let source_ips = translate::detect_source_ips().await;
    translate::translate(spec, credentials, None, source_ips)
}

fn infra_for(credentials: &Credentials) -> Result<Arc<dyn InfrastructureManager>> {
    Ok(Arc::new(HcloudInfrastructure::new(HcloudClient::new(
        &credentials.hcloud_token,
    )?)))
}

/// The client config needs to exist before the engine runs; its embedded
/// endpoint is advisory because every call passes explicit node addresses.
async fn ensure_talosconfig(
    config: &Config,
    secrets_path: &Path,
    output: &Path,
) -> Result<PathBuf> {
    let path = output.join("talosconfig");
    if path.exists() {
        return Ok(path);
    }
    let producer = TalosConfigProducer::new(
        config,
        &EndpointCandidates {
            first_control_plane_public_ip: Some("127.0.0.1".to_string()),
            ..EndpointCandidates::default()
        },
        secrets_path.to_path_buf(),
    )?;
    let talosconfig = producer.client_config().await?;
    tokio::fs::write(&path, &talosconfig)
        .await
        .context("failed to write talosconfig")?;
    talos::secrets::restrict_permissions(&path).await?;
    Ok(path)
}

async fn create_cluster(cli: &Cli) -> Result<()> {
    info!("Starting cluster creation...");

    TalosctlClient::check_talosctl_installed()
        .await
        .context("talosctl is required")?;
    HelmInstaller::check_helm_installed()
        .await
        .context("helm is required")?;

    let mut spec = load_spec(&cli.config)?;
    let credentials = Credentials::from_env()?;
    let config = load_config(&spec, &credentials).await?;

    info!("Cluster name: {}", config.cluster_name);

    tokio::fs::create_dir_all(&cli.output)
        .await
        .context("failed to create output directory")?;
    let (_, generated) =
        SecretsBundle::load_or_generate(&cli.output.join("secrets.yaml")).await?;
    if generated {
        info!("Talos secrets bundle generated");
    }
    let secrets_path = cli.output.join("secrets.yaml");
    let talosconfig_path = ensure_talosconfig(&config, &secrets_path, &cli.output).await?;

    let infra = infra_for(&credentials)?;
    let deps = EngineDeps {
        infra: infra.clone(),
        talos: Arc::new(TalosctlClient::from_path(talosconfig_path.clone())),
        k8s_factory: Arc::new(KubeClusterApiFactory),
        probe: Arc::new(HttpsApiProbe),
        installer_factory: Arc::new(HelmInstallerFactory::new(
            credentials.hcloud_token.clone(),
            credentials.cloudflare_api_token.clone(),
        )?),
        config_source: Arc::new(TalosctlConfigSource::new(secrets_path)),
        timeouts: Timeouts::default(),
        // The CLI creates exactly one control plane; the operator scales.
        control_plane_limit: Some(1),
    };

    let cancel = interrupt_token();
    let observer = cli_observer();
    let engine = build_engine(&deps);

    let mut state = State {
        bootstrap: spec.bootstrap.clone(),
        ..State::default()
    };
    let report = engine.reconcile(&config, &mut state, &cancel, &observer).await;

    if let Some(err) = report.error {
        // Bootstrap failures after infrastructure exists tear the partial
        // cluster back down; a cancelled run keeps its progress.
        if report.failed == Some(crd::ProvisioningPhase::Bootstrap)
            && !errors::is_cancelled(&err)
            && state.network.is_some()
        {
            error!("bootstrap failed, cleaning up partial resources: {:#}", err);
            Destroyer::new(infra)
                .destroy(&config.cluster_name, &CancellationToken::new(), &observer)
                .await
                .context("cleanup after failed bootstrap also failed")?;
        }
        return Err(err);
    }

    write_artifacts(cli, &config, &state).await?;

    // Handover record: the operator must know bootstrap already ran.
    if let Some(bootstrap) = &state.bootstrap {
        spec.bootstrap = Some(bootstrap.clone());
        let rendered = serde_yaml::to_string(&spec)?;
        tokio::fs::write(&cli.config, rendered)
            .await
            .context("failed to update cluster specification")?;
    }

    print_summary(cli, &config, &state);
    Ok(())
}

async fn write_artifacts(cli: &Cli, config: &Config, state: &State) -> Result<()> {
    let kubeconfig = state
        .kubeconfig
        .as_ref()
        .context("reconcile finished without a kubeconfig")?;
    let kubeconfig_path = cli.output.join("kubeconfig");
    tokio::fs::write(&kubeconfig_path, kubeconfig)
        .await
        .context("failed to write kubeconfig")?;
    talos::secrets::restrict_permissions(&kubeconfig_path).await?;

    // Regenerate the client config against the real endpoint.
    let producer = TalosConfigProducer::new(
        config,
        &talos::endpoint_candidates(state),
        cli.output.join("secrets.yaml"),
    )?;
    let talosconfig_path = cli.output.join("talosconfig");
    tokio::fs::write(&talosconfig_path, producer.client_config().await?)
        .await
        .context("failed to write talosconfig")?;
    talos::secrets::restrict_permissions(&talosconfig_path).await?;

    // Human-readable access summary.
    let mut access = serde_yaml::Mapping::new();
    access.insert("cluster".into(), config.cluster_name.clone().into());
    if let Some(lb) = &state.load_balancer {
        if let Some(ip) = lb.public_ip() {
            access.insert("kubeAPI".into(), format!("https://{}:6443", ip).into());
        }
    }
    access.insert(
        "kubeconfig".into(),
        kubeconfig_path.display().to_string().into(),
    );
    access.insert(
        "talosconfig".into(),
        talosconfig_path.display().to_string().into(),
    );
    let mut urls = serde_yaml::Mapping::new();
    if let Some(ingress) = config.addons.argocd.as_ref().and_then(|a| a.ingress.as_ref()) {
        urls.insert("argocd".into(), format!("https://{}", ingress.host).into());
    }
    if let Some(ingress) = config
        .addons
        .monitoring
        .as_ref()
        .and_then(|m| m.grafana_ingress.as_ref())
    {
        urls.insert("grafana".into(), format!("https://{}", ingress.host).into());
    }
    if !urls.is_empty() {
        access.insert("addonUrls".into(), serde_yaml::Value::Mapping(urls));
    }
    let access_path = cli.output.join("access-data.yaml");
    tokio::fs::write(
        &access_path,
        serde_yaml::to_string(&serde_yaml::Value::Mapping(access))?,
    )
    .await
    .context("failed to write access data")?;
    talos::secrets::restrict_permissions(&access_path).await?;

    Ok(())
}

fn print_summary(cli: &Cli, config: &Config, state: &State) {
    info!("Cluster creation completed successfully!");
    info!("");
    info!("Cluster details:");
    info!("  Name: {}", config.cluster_name);
    if let Some(lb) = &state.load_balancer {
        if let Some(ip) = lb.public_ip() {
            info!("  Endpoint: https://{}:6443", ip);
        }
    }
    info!("  Control planes: {}", state.control_planes.len());
    info!("  Workers: {}", state.workers.len());
    info!("");
    info!("To access your cluster:");
    info!("  export KUBECONFIG={}", cli.output.join("kubeconfig").display());
    info!("  kubectl get nodes");
    info!("");
    info!("Install the operator and apply the updated {} to scale further.", cli.config.display());
}

async fn destroy_cluster(cli: &Cli) -> Result<()> {
    info!("Starting cluster destruction...");

    let spec = load_spec(&cli.config)?;
    let credentials = Credentials::from_env()?;
    let infra = infra_for(&credentials)?;

    let cancel = interrupt_token();
    let observer = cli_observer();

    Destroyer::new(infra)
        .destroy(&spec.cluster_name, &cancel, &observer)
        .await?;

    info!("Cluster destroyed successfully");
    Ok(())
}

/// Installer stand-in for read-only paths; health checks never install.
struct NullInstaller;

#[async_trait::async_trait]
impl AddonInstaller for NullInstaller {
    async fn install(&self, addon: &addons::AddonSpec, _config: &Config) -> Result<()> {
        anyhow::bail!("addon {} is not installed", addon.name)
    }
}

async fn show_status(cli: &Cli) -> Result<()> {
    let spec = load_spec(&cli.config)?;
    let credentials = Credentials::from_env()?;
    let config = load_config(&spec, &credentials).await?;
    let infra = infra_for(&credentials)?;

    let selector = reconcile::owner_selector(&config.cluster_name);
    let mut servers = infra.list_servers(&selector).await?;
    servers.sort_by(|a, b| a.name.cmp(&b.name));

    if servers.is_empty() {
        info!("No servers found for cluster: {}", config.cluster_name);
        return Ok(());
    }

    info!("Cluster: {}", config.cluster_name);
    for server in &servers {
        let role = server
            .labels
            .get(reconcile::LABEL_NODE_ROLE)
            .map(String::as_str)
            .unwrap_or("unknown");
        info!(
            "  {} [{}] status={} public={} private={}",
            server.name,
            role,
            server.status,
            server.public_ip().unwrap_or_else(|| "-".to_string()),
            server.private_ip().unwrap_or_else(|| "-".to_string()),
        );
    }

    let kubeconfig_path = cli.output.join("kubeconfig");
    if kubeconfig_path.exists() {
        let kubeconfig = tokio::fs::read_to_string(&kubeconfig_path).await?;
        match KubeClusterApi::from_kubeconfig(&kubeconfig).await {
            Ok(k8s) => {
                let engine = AddonEngine::new(
                    Arc::new(k8s),
                    Arc::new(NullInstaller),
                    Timeouts::default().addon,
                );
                info!("Addons:");
                for (addon, healthy) in engine.check_all(&config).await {
                    info!("  {} {}", addon, if healthy { "healthy" } else { "unhealthy" });
                }
            }
            Err(e) => info!("Could not reach the cluster API: {:#}", e),
        }
    }

    Ok(())
}

async fn init_spec(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "specification file already exists: {}",
            cli.config.display()
        );
    }

    let example = example_spec();
    tokio::fs::write(&cli.config, serde_yaml::to_string(&example)?)
        .await
        .context("failed to write specification file")?;

    info!("Example specification created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the specification to match your requirements");
    info!("  2. export HCLOUD_TOKEN=your-token-here");
    info!("  3. k8zner create");
    Ok(())
}

fn example_spec() -> ClusterSpec {
    ClusterSpec {
        cluster_name: "my-cluster".to_string(),
        region: "fsn1".to_string(),
        domain: None,
        control_plane: crd::NodeGroupSpec {
            count: 1,
            size: "cx23".to_string(),
        },
        workers: crd::NodeGroupSpec {
            count: 2,
            size: "cx23".to_string(),
        },
        network_cidr: None,
        pod_cidr: None,
        service_cidr: None,
        talos: crd::TalosSpec {
            version: "v1.10.2".to_string(),
            schematic_id: String::new(),
            extensions: Vec::new(),
        },
        kubernetes: crd::KubernetesSpec {
            version: "1.32.2".to_string(),
        },
        addons: crd::AddonToggles::default(),
        backup: None,
        credentials_ref: "my-cluster-credentials".to_string(),
        bootstrap: None,
    }
}

fn print_crd() -> Result<()> {
    println!("{}", serde_yaml::to_string(&Cluster::crd())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let validation: anyhow::Error =
            errors::ProvisionError::Validation("bad".to_string()).into();
        assert_eq!(exit_code_for(&validation), 2);

        let cancelled: anyhow::Error = errors::ProvisionError::Cancelled.into();
        assert_eq!(exit_code_for(&cancelled), 3);

        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_example_spec_is_translatable() {
        let spec = example_spec();
        let credentials = Credentials {
            hcloud_token: "token".to_string(),
            talos_secrets: None,
            talos_config: None,
            cloudflare_api_token: None,
        };
        let config = translate::translate(
            &spec,
            &credentials,
            None,
            vec!["198.51.100.7/32".to_string()],
        )
        .unwrap();
        assert_eq!(config.cluster_name, "my-cluster");
        // Workers are the operator's job.
        assert_eq!(config.workers.count, 0);
    }

    #[test]
    fn test_example_spec_roundtrips() {
        let spec = example_spec();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let parsed: ClusterSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.cluster_name, spec.cluster_name);
        assert_eq!(parsed.workers.count, 2);
    }
}
