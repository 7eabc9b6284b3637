/// Machine-config generation
///
/// Wraps `talosctl gen config` with the persistent secrets bundle and
/// per-hostname patches, so every server boots with its identity and the
/// shared cluster endpoint baked into its user-data.
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use handlebars::Handlebars;
use serde::Serialize;

use crate::config::Config;
use crate::reconcile::State;
use crate::utils::command::CommandBuilder;

const CONTROL_PLANE_PATCH: &str = r#"machine:
  network:
    hostname: {{hostname}}
  install:
    disk: /dev/sda
    image: factory.talos.dev/installer/{{schematic_id}}:{{talos_version}}
{{#if sans}}
  certSANs:
{{#each sans}}
    - "{{this}}"
{{/each}}
{{/if}}
cluster:
  network:
    podSubnets:
      - {{pod_cidr}}
    serviceSubnets:
      - {{service_cidr}}
{{#if sans}}
  apiServer:
    certSANs:
{{#each sans}}
      - "{{this}}"
{{/each}}
{{/if}}
"#;

const WORKER_PATCH: &str = r#"machine:
  network:
    hostname: {{hostname}}
  install:
    disk: /dev/sda
    image: factory.talos.dev/installer/{{schematic_id}}:{{talos_version}}
cluster:
  network:
    podSubnets:
      - {{pod_cidr}}
    serviceSubnets:
      - {{service_cidr}}
"#;

#[derive(Serialize)]
struct PatchData {
    hostname: String,
    schematic_id: String,
    talos_version: String,
    pod_cidr: String,
    service_cidr: String,
    sans: Vec<String>,
}

/// Known addresses to build the control-plane endpoint from.
#[derive(Debug, Clone, Default)]
pub struct EndpointCandidates {
    pub load_balancer_private_ip: Option<String>,
    pub load_balancer_public_ip: Option<String>,
    pub first_control_plane_private_ip: Option<String>,
    pub first_control_plane_public_ip: Option<String>,
}

/// The endpoint every kubelet dials. Preference order keeps traffic on the
/// private network when possible and fails when nothing is known.
pub fn select_endpoint(candidates: &EndpointCandidates) -> Result<String> {
    let host = candidates
        .load_balancer_private_ip
        .as_deref()
        .or(candidates.load_balancer_public_ip.as_deref())
        .or(candidates.first_control_plane_private_ip.as_deref())
        .or(candidates.first_control_plane_public_ip.as_deref())
        .context("no reachable control-plane endpoint is known yet")?;
    let endpoint = format!("https://{}:6443", host);
    url::Url::parse(&endpoint)
        .with_context(|| format!("endpoint address '{}' is not usable", host))?;
    Ok(endpoint)
}

/// Per-state endpoint candidates, read off the shared reconcile record.
pub fn endpoint_candidates(state: &State) -> EndpointCandidates {
    let first_cp = state.sorted_control_planes().first().cloned().cloned();
    EndpointCandidates {
        load_balancer_private_ip: state.load_balancer.as_ref().and_then(|lb| lb.private_ip()),
        load_balancer_public_ip: state.load_balancer.as_ref().and_then(|lb| lb.public_ip()),
        first_control_plane_private_ip: first_cp.as_ref().and_then(|s| s.private_ip()),
        first_control_plane_public_ip: first_cp.as_ref().and_then(|s| s.public_ip()),
    }
}

/// Where phase steps get machine configs from; production renders through
/// `talosctl`, tests substitute canned documents.
#[async_trait]
pub trait MachineConfigSource: Send + Sync {
    async fn control_plane_config(
        &self,
        config: &Config,
        state: &State,
        hostname: &str,
        sans: &[String],
    ) -> Result<String>;

    async fn worker_config(&self, config: &Config, state: &State, hostname: &str)
        -> Result<String>;

    async fn client_config(&self, config: &Config, state: &State) -> Result<String>;
}

/// Production source: one `TalosConfigProducer` per call, bound to the
/// endpoint the current state supports.
pub struct TalosctlConfigSource {
    secrets_path: PathBuf,
}

impl TalosctlConfigSource {
    pub fn new(secrets_path: PathBuf) -> Self {
        Self { secrets_path }
    }

    fn producer(&self, config: &Config, state: &State) -> Result<TalosConfigProducer> {
        TalosConfigProducer::new(config, &endpoint_candidates(state), self.secrets_path.clone())
    }
}

#[async_trait]
impl MachineConfigSource for TalosctlConfigSource {
    async fn control_plane_config(
        &self,
        config: &Config,
        state: &State,
        hostname: &str,
        sans: &[String],
    ) -> Result<String> {
        self.producer(config, state)?
            .control_plane_config(hostname, sans)
            .await
    }

    async fn worker_config(
        &self,
        config: &Config,
        state: &State,
        hostname: &str,
    ) -> Result<String> {
        self.producer(config, state)?.worker_config(hostname).await
    }

    async fn client_config(&self, config: &Config, state: &State) -> Result<String> {
        self.producer(config, state)?.client_config().await
    }
}

/// Canned machine configs for engine tests.
#[cfg(test)]
pub struct FakeConfigSource;

#[cfg(test)]
#[async_trait]
impl MachineConfigSource for FakeConfigSource {
    async fn control_plane_config(
        &self,
        _config: &Config,
        state: &State,
        hostname: &str,
        _sans: &[String],
    ) -> Result<String> {
        // Refuses without an endpoint, like the real producer.
        select_endpoint(&endpoint_candidates(state))?;
        Ok(format!("#control-plane {}\n", hostname))
    }

    async fn worker_config(
        &self,
        _config: &Config,
        state: &State,
        hostname: &str,
    ) -> Result<String> {
        select_endpoint(&endpoint_candidates(state))?;
        Ok(format!("#worker {}\n", hostname))
    }

    async fn client_config(&self, _config: &Config, _state: &State) -> Result<String> {
        Ok("#talosconfig\n".to_string())
    }
}

pub struct TalosConfigProducer {
    cluster_name: String,
    endpoint: String,
    kubernetes_version: String,
    talos_version: String,
    schematic_id: String,
    pod_cidr: String,
    service_cidr: String,
    secrets_path: PathBuf,
    registry: Handlebars<'static>,
}

impl TalosConfigProducer {
    /// Refuses to construct without a resolvable endpoint.
    pub fn new(
        config: &Config,
        candidates: &EndpointCandidates,
        secrets_path: PathBuf,
    ) -> Result<Self> {
        let endpoint = select_endpoint(candidates)?;

        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry
            .register_template_string("control-plane", CONTROL_PLANE_PATCH)
            .context("invalid control-plane patch template")?;
        registry
            .register_template_string("worker", WORKER_PATCH)
            .context("invalid worker patch template")?;

        Ok(Self {
            cluster_name: config.cluster_name.clone(),
            endpoint,
            kubernetes_version: config.kubernetes_version.clone(),
            talos_version: config.talos.version.clone(),
            schematic_id: config.talos.schematic_id.clone(),
            pod_cidr: config.pod_cidr.clone(),
            service_cidr: config.service_cidr.clone(),
            secrets_path,
            registry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Machine config for a control-plane node, with the load-balancer
    /// addresses as extra certificate SANs.
    pub async fn control_plane_config(&self, hostname: &str, sans: &[String]) -> Result<String> {
        self.generate("control-plane", "controlplane.yaml", hostname, sans.to_vec())
            .await
    }

    /// Machine config for a worker node.
    pub async fn worker_config(&self, hostname: &str) -> Result<String> {
        self.generate("worker", "worker.yaml", hostname, Vec::new())
            .await
    }

    /// The admin-side client config.
    pub async fn client_config(&self) -> Result<String> {
        let dir = tempfile::tempdir().context("failed to create scratch directory")?;
        self.run_gen(&dir, "talosconfig", None).await?;
        tokio::fs::read_to_string(dir.path().join("talosconfig"))
            .await
            .context("failed to read generated talosconfig")
    }

    async fn generate(
        &self,
        template: &str,
        output_file: &str,
        hostname: &str,
        sans: Vec<String>,
    ) -> Result<String> {
        let data = PatchData {
            hostname: hostname.to_string(),
            schematic_id: self.schematic_id.clone(),
            talos_version: self.talos_version.clone(),
            pod_cidr: self.pod_cidr.clone(),
            service_cidr: self.service_cidr.clone(),
            sans,
        };
        let patch = self
            .registry
            .render(template, &data)
            .context("failed to render machine-config patch")?;

        let dir = tempfile::tempdir().context("failed to create scratch directory")?;
        let patch_path = dir.path().join("patch.yaml");
        tokio::fs::write(&patch_path, &patch)
            .await
            .context("failed to write patch file")?;

        self.run_gen(&dir, "controlplane,worker", Some(&patch_path))
            .await?;

        tokio::fs::read_to_string(dir.path().join(output_file))
            .await
            .with_context(|| format!("failed to read generated {}", output_file))
    }

    async fn run_gen(
        &self,
        dir: &tempfile::TempDir,
        output_types: &str,
        patch: Option<&std::path::Path>,
    ) -> Result<()> {
        let mut builder = CommandBuilder::new("talosctl")
            .args(["gen", "config", &self.cluster_name, &self.endpoint])
            .args(["--kubernetes-version", &self.kubernetes_version])
            .arg("--with-secrets")
            .arg(&self.secrets_path)
            .args(["--output-types", output_types])
            .arg("--output")
            .arg(dir.path())
            // Docs and examples would push user-data past the 32 KiB limit.
            .args(["--force", "--with-docs=false", "--with-examples=false"]);

        if let Some(patch) = patch {
            builder = builder
                .arg("--config-patch")
                .arg(format!("@{}", patch.display()));
        }

        builder
            .context("talosctl gen config failed")
            .run_silent()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_preference_order() {
        let mut candidates = EndpointCandidates {
            load_balancer_private_ip: Some("10.0.0.100".to_string()),
            load_balancer_public_ip: Some("1.2.3.4".to_string()),
            first_control_plane_private_ip: Some("10.0.0.2".to_string()),
            first_control_plane_public_ip: Some("5.5.5.5".to_string()),
        };
        assert_eq!(
            select_endpoint(&candidates).unwrap(),
            "https://10.0.0.100:6443"
        );

        candidates.load_balancer_private_ip = None;
        assert_eq!(select_endpoint(&candidates).unwrap(), "https://1.2.3.4:6443");

        candidates.load_balancer_public_ip = None;
        assert_eq!(
            select_endpoint(&candidates).unwrap(),
            "https://10.0.0.2:6443"
        );

        candidates.first_control_plane_private_ip = None;
        assert_eq!(select_endpoint(&candidates).unwrap(), "https://5.5.5.5:6443");

        candidates.first_control_plane_public_ip = None;
        assert!(select_endpoint(&candidates).is_err());
    }

    #[test]
    fn test_patch_templates_render() {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry
            .register_template_string("control-plane", CONTROL_PLANE_PATCH)
            .unwrap();
        registry
            .register_template_string("worker", WORKER_PATCH)
            .unwrap();

        let data = PatchData {
            hostname: "test-cp-01".to_string(),
            schematic_id: "abc".to_string(),
            talos_version: "v1.10.2".to_string(),
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            sans: vec!["1.2.3.4".to_string(), "10.0.0.100".to_string()],
        };

        let rendered = registry.render("control-plane", &data).unwrap();
        assert!(rendered.contains("hostname: test-cp-01"));
        assert!(rendered.contains("factory.talos.dev/installer/abc:v1.10.2"));
        assert!(rendered.contains("- \"1.2.3.4\""));
        assert!(rendered.contains("podSubnets"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert!(parsed.get("machine").is_some());

        let worker = registry
            .render(
                "worker",
                &PatchData {
                    sans: Vec::new(),
                    hostname: "test-worker-01".to_string(),
                    schematic_id: "abc".to_string(),
                    talos_version: "v1.10.2".to_string(),
                    pod_cidr: "10.244.0.0/16".to_string(),
                    service_cidr: "10.96.0.0/12".to_string(),
                },
            )
            .unwrap();
        assert!(worker.contains("hostname: test-worker-01"));
        assert!(!worker.contains("certSANs"));
    }
}
