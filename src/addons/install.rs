/// Chart and manifest installation
///
/// Production installer drives helm (and kubectl for raw manifests) against
/// the cluster kubeconfig, mirroring how an operator at a terminal would
/// install these components.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::config::Config;
use crate::k8s::ClusterApi;
use crate::utils::command::CommandBuilder;

pub use super::AddonInstaller;
use super::AddonSpec;

/// Chart coordinates per addon.
struct ChartRef {
    repo_name: &'static str,
    repo_url: &'static str,
    chart: &'static str,
    release: &'static str,
}

fn chart_for(addon: &AddonSpec) -> Option<ChartRef> {
    let chart = match addon.name {
        "cilium" => ChartRef {
            repo_name: "cilium",
            repo_url: "https://helm.cilium.io/",
            chart: "cilium/cilium",
            release: "cilium",
        },
        "cloud-controller-manager" => ChartRef {
            repo_name: "hcloud",
            repo_url: "https://charts.hetzner.cloud",
            chart: "hcloud/hcloud-cloud-controller-manager",
            release: "hccm",
        },
        "csi" => ChartRef {
            repo_name: "hcloud",
            repo_url: "https://charts.hetzner.cloud",
            chart: "hcloud/hcloud-csi",
            release: "hcloud-csi",
        },
        "metrics-server" => ChartRef {
            repo_name: "metrics-server",
            repo_url: "https://kubernetes-sigs.github.io/metrics-server/",
            chart: "metrics-server/metrics-server",
            release: "metrics-server",
        },
        "cert-manager" => ChartRef {
            repo_name: "jetstack",
            repo_url: "https://charts.jetstack.io",
            chart: "jetstack/cert-manager",
            release: "cert-manager",
        },
        "traefik" => ChartRef {
            repo_name: "traefik",
            repo_url: "https://traefik.github.io/charts",
            chart: "traefik/traefik",
            release: "traefik",
        },
        "external-dns" => ChartRef {
            repo_name: "external-dns",
            repo_url: "https://kubernetes-sigs.github.io/external-dns/",
            chart: "external-dns/external-dns",
            release: "external-dns",
        },
        "argocd" => ChartRef {
            repo_name: "argo",
            repo_url: "https://argoproj.github.io/argo-helm",
            chart: "argo/argo-cd",
            release: "argocd",
        },
        "monitoring" => ChartRef {
            repo_name: "prometheus-community",
            repo_url: "https://prometheus-community.github.io/helm-charts",
            chart: "prometheus-community/kube-prometheus-stack",
            release: "monitoring",
        },
        // talos-backup ships as a raw CronJob manifest.
        _ => return None,
    };
    Some(chart)
}

pub struct HelmInstaller {
    kubeconfig_path: PathBuf,
    k8s: Arc<dyn ClusterApi>,
    hcloud_token: String,
    cloudflare_api_token: Option<String>,
    control_plane_count: u32,
}

impl HelmInstaller {
    pub fn new(
        kubeconfig_path: PathBuf,
        k8s: Arc<dyn ClusterApi>,
        hcloud_token: String,
        cloudflare_api_token: Option<String>,
        control_plane_count: u32,
    ) -> Self {
        Self {
            kubeconfig_path,
            k8s,
            hcloud_token,
            cloudflare_api_token,
            control_plane_count,
        }
    }

    pub async fn check_helm_installed() -> Result<()> {
        crate::utils::command::check_tool_installed(
            "helm",
            &["version"],
            "https://helm.sh/docs/intro/install/",
        )
        .await
    }

    async fn add_repo(&self, chart: &ChartRef) -> Result<()> {
        let output = CommandBuilder::new("helm")
            .args(["repo", "add", chart.repo_name, chart.repo_url])
            .kubeconfig(&self.kubeconfig_path)
            .output()
            .await?;
        if !output.success && !output.stderr.contains("already exists") {
            anyhow::bail!("failed to add helm repo {}: {}", chart.repo_name, output.stderr);
        }

        CommandBuilder::new("helm")
            .args(["repo", "update", chart.repo_name])
            .kubeconfig(&self.kubeconfig_path)
            .context("failed to update helm repos")
            .run_silent()
            .await
    }

    async fn upgrade_install(
        &self,
        addon: &AddonSpec,
        chart: &ChartRef,
        values: serde_json::Value,
    ) -> Result<()> {
        let values_yaml =
            serde_yaml::to_string(&values).context("failed to serialise helm values")?;
        let mut values_file =
            tempfile::NamedTempFile::new().context("failed to create values file")?;
        std::io::Write::write_all(&mut values_file, values_yaml.as_bytes())
            .context("failed to write values file")?;

        CommandBuilder::new("helm")
            .args(["upgrade", "--install", chart.release, chart.chart])
            .args(["--namespace", addon.namespace, "--create-namespace"])
            .arg("--values")
            .arg(values_file.path())
            .args(["--wait", "--timeout", "10m"])
            .kubeconfig(&self.kubeconfig_path)
            .context(format!("helm install of {} failed", addon.name))
            .run_silent()
            .await
    }

    async fn apply_manifest(&self, manifest: String) -> Result<()> {
        CommandBuilder::new("kubectl")
            .args(["apply", "-f", "-"])
            .stdin_data(manifest)
            .kubeconfig(&self.kubeconfig_path)
            .context("kubectl apply failed")
            .run_silent()
            .await
    }

    /// Secrets the charts reference; created before the release so pods
    /// never crash-loop on a missing credential.
    async fn prepare_credentials(&self, addon: &AddonSpec) -> Result<()> {
        match addon.name {
            "cloud-controller-manager" | "csi" => {
                self.k8s
                    .put_secret_key(
                        addon.namespace,
                        "hcloud",
                        "token",
                        self.hcloud_token.as_bytes(),
                    )
                    .await
            }
            "cert-manager" | "external-dns" => {
                if let Some(token) = &self.cloudflare_api_token {
                    self.k8s
                        .put_secret_key(
                            addon.namespace,
                            "cloudflare-api-token",
                            "api-token",
                            token.as_bytes(),
                        )
                        .await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn values_for(&self, addon: &AddonSpec, config: &Config) -> serde_json::Value {
        match addon.name {
            "cilium" => json!({
                "ipam": {"mode": "kubernetes"},
                "kubeProxyReplacement": true,
                // KubePrism endpoint on every Talos node.
                "k8sServiceHost": "localhost",
                "k8sServicePort": 7445,
                "operator": {
                    "replicas": if self.control_plane_count > 1 { 2 } else { 1 },
                },
                "securityContext": {
                    "capabilities": {
                        "ciliumAgent": [
                            "CHOWN", "KILL", "NET_ADMIN", "NET_RAW", "IPC_LOCK",
                            "SYS_ADMIN", "SYS_RESOURCE", "DAC_OVERRIDE", "FOWNER",
                            "SETGID", "SETUID"
                        ],
                        "cleanCiliumState": ["NET_ADMIN", "SYS_ADMIN", "SYS_RESOURCE"],
                    },
                },
                "cgroup": {
                    "autoMount": {"enabled": false},
                    "hostRoot": "/sys/fs/cgroup",
                },
            }),
            "cloud-controller-manager" => json!({
                "networking": {
                    "enabled": true,
                    "clusterCIDR": config.pod_cidr,
                },
            }),
            "csi" => json!({
                "storageClasses": [{
                    "name": "hcloud-volumes",
                    "defaultStorageClass": true,
                    "reclaimPolicy": "Delete",
                }],
            }),
            "metrics-server" => json!({
                "args": ["--kubelet-insecure-tls"],
            }),
            "cert-manager" => json!({
                "crds": {"enabled": true},
            }),
            "traefik" => json!({
                "ingressClass": {"enabled": true, "isDefaultClass": true},
                "service": {
                    "annotations": {
                        "load-balancer.hetzner.cloud/location": config.location,
                        "load-balancer.hetzner.cloud/use-private-ip": "true",
                    },
                },
            }),
            "external-dns" => {
                let dns = config.addons.external_dns.as_ref();
                json!({
                    "provider": {"name": "cloudflare"},
                    "txtOwnerId": dns.map(|d| d.txt_owner_id.as_str()).unwrap_or(""),
                    "policy": dns.map(|d| d.policy.as_str()).unwrap_or("sync"),
                    "sources": [dns.map(|d| d.source.as_str()).unwrap_or("ingress")],
                    "env": [{
                        "name": "CF_API_TOKEN",
                        "valueFrom": {"secretKeyRef": {
                            "name": "cloudflare-api-token",
                            "key": "api-token",
                        }},
                    }],
                })
            }
            "argocd" => {
                let ingress = config
                    .addons
                    .argocd
                    .as_ref()
                    .and_then(|a| a.ingress.as_ref());
                match ingress {
                    Some(ingress) => json!({
                        "server": {
                            "ingress": {
                                "enabled": true,
                                "ingressClassName": ingress.class,
                                "hostname": ingress.host,
                                "tls": ingress.tls,
                            },
                        },
                    }),
                    None => json!({}),
                }
            }
            "monitoring" => {
                let ingress = config
                    .addons
                    .monitoring
                    .as_ref()
                    .and_then(|m| m.grafana_ingress.as_ref());
                match ingress {
                    Some(ingress) => json!({
                        "grafana": {
                            "ingress": {
                                "enabled": true,
                                "ingressClassName": ingress.class,
                                "hosts": [ingress.host],
                                "tls": [{
                                    "hosts": [ingress.host],
                                    "secretName": "grafana-tls",
                                }],
                            },
                        },
                    }),
                    None => json!({}),
                }
            }
            _ => json!({}),
        }
    }

    /// DNS-01 issuer; applied once cert-manager's webhooks are up.
    fn cluster_issuer(email: &str) -> String {
        format!(
            r#"apiVersion: cert-manager.io/v1
kind: ClusterIssuer
metadata:
  name: letsencrypt-dns01
spec:
  acme:
    email: {}
    server: https://acme-v02.api.letsencrypt.org/directory
    privateKeySecretRef:
      name: letsencrypt-dns01-account-key
    solvers:
      - dns01:
          cloudflare:
            apiTokenSecretRef:
              name: cloudflare-api-token
              key: api-token
"#,
            email
        )
    }

    fn backup_cron_job(config: &Config) -> Option<String> {
        let backup = config.addons.talos_backup.as_ref()?;
        Some(format!(
            r#"apiVersion: batch/v1
kind: CronJob
metadata:
  name: talos-backup
  namespace: kube-system
  labels:
    app: talos-backup
spec:
  schedule: "{schedule}"
  jobTemplate:
    spec:
      template:
        metadata:
          labels:
            app: talos-backup
        spec:
          restartPolicy: OnFailure
          containers:
            - name: talos-backup
              image: ghcr.io/siderolabs/talos-backup:latest
              env:
                - name: AWS_ACCESS_KEY_ID
                  value: "{access_key}"
                - name: AWS_SECRET_ACCESS_KEY
                  value: "{secret_key}"
                - name: AWS_REGION
                  value: "{region}"
                - name: CUSTOM_S3_ENDPOINT
                  value: "{endpoint}"
                - name: BUCKET
                  value: "{bucket}"
                - name: CLUSTER_NAME
                  value: "{cluster}"
                - name: DISABLE_ENCRYPTION
                  value: "{disable_encryption}"
"#,
            schedule = backup.schedule,
            access_key = backup.access_key,
            secret_key = backup.secret_key,
            region = backup.region,
            endpoint = backup.endpoint,
            bucket = backup.bucket,
            cluster = config.cluster_name,
            disable_encryption = backup.encryption_disabled,
        ))
    }
}

#[async_trait]
impl AddonInstaller for HelmInstaller {
    async fn install(&self, addon: &AddonSpec, config: &Config) -> Result<()> {
        self.prepare_credentials(addon).await?;

        match chart_for(addon) {
            Some(chart) => {
                self.add_repo(&chart).await?;
                self.upgrade_install(addon, &chart, self.values_for(addon, config))
                    .await?;

                if addon.name == "cert-manager" {
                    if let Some(email) = config
                        .addons
                        .cert_manager
                        .as_ref()
                        .and_then(|cm| cm.cloudflare_email.as_deref())
                    {
                        self.apply_manifest(Self::cluster_issuer(email)).await?;
                    }
                }
                Ok(())
            }
            None => {
                let manifest = Self::backup_cron_job(config)
                    .context("backup addon enabled without backup configuration")?;
                self.apply_manifest(manifest).await
            }
        }
    }
}

/// Late-bound installer construction: the kubeconfig the installer needs
/// only exists after bootstrap.
#[async_trait]
pub trait AddonInstallerFactory: Send + Sync {
    async fn create(
        &self,
        config: &Config,
        kubeconfig: &str,
        k8s: Arc<dyn ClusterApi>,
    ) -> Result<Arc<dyn AddonInstaller>>;
}

/// Produces `HelmInstaller`s over a scratch kubeconfig file.
pub struct HelmInstallerFactory {
    scratch: tempfile::TempDir,
    hcloud_token: String,
    cloudflare_api_token: Option<String>,
}

impl HelmInstallerFactory {
    pub fn new(hcloud_token: String, cloudflare_api_token: Option<String>) -> Result<Self> {
        Ok(Self {
            scratch: tempfile::tempdir().context("failed to create scratch directory")?,
            hcloud_token,
            cloudflare_api_token,
        })
    }
}

#[async_trait]
impl AddonInstallerFactory for HelmInstallerFactory {
    async fn create(
        &self,
        config: &Config,
        kubeconfig: &str,
        k8s: Arc<dyn ClusterApi>,
    ) -> Result<Arc<dyn AddonInstaller>> {
        let kubeconfig_path = write_kubeconfig(self.scratch.path(), kubeconfig).await?;
        Ok(Arc::new(HelmInstaller::new(
            kubeconfig_path,
            k8s,
            self.hcloud_token.clone(),
            self.cloudflare_api_token.clone(),
            config.control_planes.count,
        )))
    }
}

/// Kubeconfig written to disk for the helm/kubectl boundary.
pub async fn write_kubeconfig(dir: &Path, kubeconfig: &str) -> Result<PathBuf> {
    let path = dir.join("kubeconfig");
    tokio::fs::write(&path, kubeconfig)
        .await
        .context("failed to write kubeconfig")?;
    crate::talos::secrets::restrict_permissions(&path).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::config::{ExternalDnsConfig, TalosBackupConfig};

    #[test]
    fn test_every_chart_addon_has_coordinates() {
        for addon in super::super::catalogue() {
            if addon.name == "talos-backup" {
                assert!(chart_for(&addon).is_none());
            } else {
                let chart = chart_for(&addon).unwrap();
                assert!(chart.chart.starts_with(chart.repo_name));
            }
        }
    }

    #[test]
    fn test_external_dns_values() {
        let installer = HelmInstaller::new(
            PathBuf::from("/tmp/kubeconfig"),
            crate::k8s::FakeClusterApi::shared(),
            "token".to_string(),
            Some("cf".to_string()),
            1,
        );
        let mut config = test_config("test");
        config.addons.external_dns = Some(ExternalDnsConfig {
            provider: "cloudflare".to_string(),
            txt_owner_id: "test".to_string(),
            policy: "sync".to_string(),
            source: "ingress".to_string(),
        });

        let addon = super::super::catalogue()
            .into_iter()
            .find(|a| a.name == "external-dns")
            .unwrap();
        let values = installer.values_for(&addon, &config);
        assert_eq!(values["txtOwnerId"], "test");
        assert_eq!(values["policy"], "sync");
        assert_eq!(values["sources"][0], "ingress");
    }

    #[test]
    fn test_cilium_operator_replicas_follow_cp_count() {
        let k8s = crate::k8s::FakeClusterApi::shared();
        let config = test_config("test");
        let addon = super::super::catalogue().into_iter().next().unwrap();

        let single = HelmInstaller::new(
            PathBuf::from("/tmp/kubeconfig"),
            k8s.clone(),
            "token".to_string(),
            None,
            1,
        );
        assert_eq!(single.values_for(&addon, &config)["operator"]["replicas"], 1);

        let ha = HelmInstaller::new(
            PathBuf::from("/tmp/kubeconfig"),
            k8s,
            "token".to_string(),
            None,
            3,
        );
        assert_eq!(ha.values_for(&addon, &config)["operator"]["replicas"], 2);
    }

    #[test]
    fn test_backup_manifest_renders() {
        let mut config = test_config("test");
        config.addons.talos_backup = Some(TalosBackupConfig {
            schedule: "0 */6 * * *".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            endpoint: "https://s3.example.com".to_string(),
            bucket: "backups".to_string(),
            region: "eu-central-1".to_string(),
            encryption_disabled: true,
        });

        let manifest = HelmInstaller::backup_cron_job(&config).unwrap();
        assert!(manifest.contains("schedule: \"0 */6 * * *\""));
        assert!(manifest.contains("value: \"backups\""));
        assert!(manifest.contains("DISABLE_ENCRYPTION"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&manifest).unwrap();
        assert_eq!(parsed["kind"], "CronJob");
    }

    #[test]
    fn test_cluster_issuer_embeds_email() {
        let manifest = HelmInstaller::cluster_issuer("admin@example.com");
        assert!(manifest.contains("email: admin@example.com"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&manifest).unwrap();
        assert_eq!(parsed["kind"], "ClusterIssuer");
    }
}
