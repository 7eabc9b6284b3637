/// Addon dependency engine
///
/// Addons install strictly in catalogue order, each gated on the previous
/// one's health. Cilium comes first: until the CNI is up no other addon can
/// schedule pods, so the engine never looks past a failing gate.
pub mod install;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::crd::AddonStatus;
use crate::k8s::ClusterApi;
use crate::observe::{Event, Observer};
use crate::utils::polling::PollingConfig;

/// Bound on concurrent addon health polls.
pub const HEALTH_POLL_CONCURRENCY: usize = 8;

/// Prefix of the per-addon presence configmap.
pub const SENTINEL_PREFIX: &str = "k8zner-addon-";

/// Per-addon lifecycle phase reported in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonPhase {
    Pending,
    Installing,
    Installed,
    Failed,
    Upgrading,
}

impl AddonPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddonPhase::Pending => "Pending",
            AddonPhase::Installing => "Installing",
            AddonPhase::Installed => "Installed",
            AddonPhase::Failed => "Failed",
            AddonPhase::Upgrading => "Upgrading",
        }
    }
}

/// One catalogue entry.
#[derive(Debug, Clone)]
pub struct AddonSpec {
    pub name: &'static str,
    pub install_order: u32,
    pub namespace: &'static str,
    /// Label selector whose pods define health.
    pub selector: &'static str,
}

/// The full catalogue in install order. Disabled addons keep their slot.
pub fn catalogue() -> Vec<AddonSpec> {
    vec![
        AddonSpec {
            name: "cilium",
            install_order: 1,
            namespace: "kube-system",
            selector: "k8s-app=cilium",
        },
        AddonSpec {
            name: "cloud-controller-manager",
            install_order: 2,
            namespace: "kube-system",
            selector: "app.kubernetes.io/name=hcloud-cloud-controller-manager",
        },
        AddonSpec {
            name: "csi",
            install_order: 3,
            namespace: "kube-system",
            selector: "app=hcloud-csi",
        },
        AddonSpec {
            name: "metrics-server",
            install_order: 4,
            namespace: "kube-system",
            selector: "app.kubernetes.io/name=metrics-server",
        },
        AddonSpec {
            name: "cert-manager",
            install_order: 5,
            namespace: "cert-manager",
            selector: "app.kubernetes.io/instance=cert-manager",
        },
        AddonSpec {
            name: "traefik",
            install_order: 6,
            namespace: "traefik",
            selector: "app.kubernetes.io/name=traefik",
        },
        AddonSpec {
            name: "external-dns",
            install_order: 7,
            namespace: "external-dns",
            selector: "app.kubernetes.io/name=external-dns",
        },
        AddonSpec {
            name: "argocd",
            install_order: 8,
            namespace: "argocd",
            selector: "app.kubernetes.io/part-of=argocd",
        },
        AddonSpec {
            name: "monitoring",
            install_order: 9,
            namespace: "monitoring",
            selector: "release=monitoring",
        },
        AddonSpec {
            name: "talos-backup",
            install_order: 10,
            namespace: "kube-system",
            selector: "app=talos-backup",
        },
    ]
}

/// Whether an addon is enabled for this cluster. The first three are the
/// unconditional core.
pub fn is_enabled(addon: &AddonSpec, config: &Config) -> bool {
    match addon.name {
        "cilium" | "cloud-controller-manager" | "csi" => true,
        "metrics-server" => config.addons.metrics_server,
        "cert-manager" => config.addons.cert_manager.is_some(),
        "traefik" => config.addons.traefik,
        "external-dns" => config.addons.external_dns.is_some(),
        "argocd" => config.addons.argocd.is_some(),
        "monitoring" => config.addons.monitoring.is_some(),
        "talos-backup" => config.addons.talos_backup.is_some(),
        _ => false,
    }
}

/// Performs the actual chart/manifest installation for one addon.
#[async_trait]
pub trait AddonInstaller: Send + Sync {
    async fn install(&self, addon: &AddonSpec, config: &Config) -> Result<()>;
}

pub struct AddonEngine {
    k8s: Arc<dyn ClusterApi>,
    installer: Arc<dyn AddonInstaller>,
    addon_timeout: Duration,
}

impl AddonEngine {
    pub fn new(
        k8s: Arc<dyn ClusterApi>,
        installer: Arc<dyn AddonInstaller>,
        addon_timeout: Duration,
    ) -> Self {
        Self {
            k8s,
            installer,
            addon_timeout,
        }
    }

    /// Live pod-readiness check; the presence sentinel is never consulted
    /// for health.
    pub async fn is_healthy(&self, addon: &AddonSpec) -> Result<bool> {
        let pods = self.k8s.list_pods(addon.namespace, addon.selector).await?;
        Ok(!pods.is_empty() && pods.iter().all(|p| p.is_healthy()))
    }

    /// Install every enabled addon in ascending order, each step blocking on
    /// the previous one's health. Returns the per-addon status map.
    pub async fn install_all(
        &self,
        config: &Config,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<BTreeMap<String, AddonStatus>> {
        let mut statuses = BTreeMap::new();
        let enabled: Vec<AddonSpec> = catalogue()
            .into_iter()
            .filter(|addon| is_enabled(addon, config))
            .collect();
        let total = enabled.len() as u32;

        for (index, addon) in enabled.iter().enumerate() {
            observer.progress("Addons", index as u32 + 1, total);

            if self.is_healthy(addon).await? {
                statuses.insert(
                    addon.name.to_string(),
                    addon_status(addon, AddonPhase::Installed, true, "healthy"),
                );
                continue;
            }

            info!("installing addon {} ({}/{})", addon.name, index + 1, total);
            statuses.insert(
                addon.name.to_string(),
                addon_status(addon, AddonPhase::Installing, false, "installing"),
            );

            let result = self.install_one(addon, config, cancel).await;
            match result {
                Ok(()) => {
                    observer.event(Event::resource_created("addon", addon.name));
                    statuses.insert(
                        addon.name.to_string(),
                        addon_status(addon, AddonPhase::Installed, true, "healthy"),
                    );
                }
                Err(err) => {
                    observer.event(Event::resource_failed("addon", addon.name, &err));
                    statuses.insert(
                        addon.name.to_string(),
                        addon_status(
                            addon,
                            AddonPhase::Failed,
                            false,
                            &format!("{:#}", err),
                        ),
                    );
                    // Everything behind this slot stays blocked.
                    return Err(err)
                        .with_context(|| format!("addon {} failed", addon.name));
                }
            }
        }

        Ok(statuses)
    }

    /// Converge a single catalogue entry; used by the CNI phase for the
    /// Cilium gate.
    pub async fn ensure_addon(
        &self,
        name: &str,
        config: &Config,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let addon = catalogue()
            .into_iter()
            .find(|a| a.name == name)
            .with_context(|| format!("unknown addon {}", name))?;
        if self.is_healthy(&addon).await? {
            return Ok(());
        }
        info!("installing addon {}", addon.name);
        self.install_one(&addon, config, cancel).await?;
        observer.event(Event::resource_created("addon", addon.name));
        Ok(())
    }

    async fn install_one(
        &self,
        addon: &AddonSpec,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.k8s
            .ensure_namespace(addon.namespace)
            .await
            .with_context(|| format!("failed to ensure namespace {}", addon.namespace))?;

        self.installer
            .install(addon, config)
            .await
            .with_context(|| format!("failed to install {}", addon.name))?;

        self.write_sentinel(addon).await?;
        self.wait_healthy(addon, cancel).await
    }

    /// Presence marker: namespace + configmap pair recording the install.
    async fn write_sentinel(&self, addon: &AddonSpec) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("installed".to_string(), "true".to_string());
        data.insert(
            "installOrder".to_string(),
            addon.install_order.to_string(),
        );
        self.k8s
            .upsert_config_map(
                addon.namespace,
                &format!("{}{}", SENTINEL_PREFIX, addon.name),
                data,
            )
            .await
    }

    async fn wait_healthy(&self, addon: &AddonSpec, cancel: &CancellationToken) -> Result<()> {
        PollingConfig::new(
            self.addon_timeout,
            Duration::from_secs(10),
            format!("waiting for addon {} to become healthy", addon.name),
        )
        .poll_until(cancel, || async { self.is_healthy(addon).await })
        .await
    }

    /// Health of every enabled addon, polled with bounded parallelism.
    pub async fn check_all(&self, config: &Config) -> BTreeMap<String, bool> {
        let enabled: Vec<AddonSpec> = catalogue()
            .into_iter()
            .filter(|addon| is_enabled(addon, config))
            .collect();

        stream::iter(enabled.into_iter().map(|addon| async move {
            let healthy = self.is_healthy(&addon).await.unwrap_or(false);
            (addon.name.to_string(), healthy)
        }))
        .buffer_unordered(HEALTH_POLL_CONCURRENCY)
        .collect()
        .await
    }
}

fn addon_status(
    addon: &AddonSpec,
    phase: AddonPhase,
    healthy: bool,
    message: &str,
) -> AddonStatus {
    AddonStatus {
        installed: matches!(phase, AddonPhase::Installed | AddonPhase::Upgrading),
        healthy,
        phase: phase.as_str().to_string(),
        message: message.to_string(),
        install_order: addon.install_order,
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::k8s::FakeClusterApi;
    use crate::observe::{Observer, RecordingObserver};

    /// Installer that marks pods healthy in the fake cluster.
    struct FakeInstaller {
        k8s: Arc<FakeClusterApi>,
        fail_on: Option<&'static str>,
        installed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AddonInstaller for FakeInstaller {
        async fn install(&self, addon: &AddonSpec, _config: &Config) -> Result<()> {
            if self.fail_on == Some(addon.name) {
                anyhow::bail!("chart render failed");
            }
            self.installed.lock().unwrap().push(addon.name.to_string());
            let (key, value) = addon.selector.split_once('=').unwrap();
            self.k8s.set_pods(addon.namespace, &[(key, value)], 2, true);
            Ok(())
        }
    }

    fn engine(
        k8s: Arc<FakeClusterApi>,
        fail_on: Option<&'static str>,
    ) -> (AddonEngine, Arc<FakeInstaller>) {
        let installer = Arc::new(FakeInstaller {
            k8s: k8s.clone(),
            fail_on,
            installed: std::sync::Mutex::new(Vec::new()),
        });
        (
            AddonEngine::new(k8s, installer.clone(), Duration::from_secs(2)),
            installer,
        )
    }

    #[test]
    fn test_catalogue_order_is_fixed() {
        let entries = catalogue();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].name, "cilium");
        for (i, addon) in entries.iter().enumerate() {
            assert_eq!(addon.install_order, i as u32 + 1);
        }
    }

    #[test]
    fn test_core_addons_always_enabled() {
        let config = test_config("test");
        let enabled: Vec<&str> = catalogue()
            .iter()
            .filter(|a| is_enabled(a, &config))
            .map(|a| a.name)
            .collect();
        assert_eq!(enabled, vec!["cilium", "cloud-controller-manager", "csi"]);
    }

    #[tokio::test]
    async fn test_install_all_in_order() {
        let k8s = FakeClusterApi::shared();
        let (engine, installer) = engine(k8s.clone(), None);
        let mut config = test_config("test");
        config.addons.metrics_server = true;
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();

        let statuses = engine
            .install_all(&config, &cancel, &observer)
            .await
            .unwrap();

        assert_eq!(
            installer.installed.lock().unwrap().clone(),
            vec!["cilium", "cloud-controller-manager", "csi", "metrics-server"]
        );
        assert!(statuses.values().all(|s| s.healthy));
        assert_eq!(statuses.get("cilium").unwrap().install_order, 1);
        // Sentinels were written alongside.
        assert!(k8s
            .config_map_names()
            .contains(&("kube-system".to_string(), "k8zner-addon-cilium".to_string())));
    }

    #[tokio::test]
    async fn test_cni_failure_blocks_everything() {
        let k8s = FakeClusterApi::shared();
        let (engine, installer) = engine(k8s, Some("cilium"));
        let config = test_config("test");
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();

        let err = engine
            .install_all(&config, &cancel, &observer)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cilium"));
        assert!(installer.installed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_healthy_addons_are_skipped() {
        let k8s = FakeClusterApi::shared();
        k8s.set_pods("kube-system", &[("k8s-app", "cilium")], 2, true);
        let (engine, installer) = engine(k8s, None);
        let config = test_config("test");
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();

        engine
            .install_all(&config, &cancel, &observer)
            .await
            .unwrap();
        let installed = installer.installed.lock().unwrap().clone();
        assert!(!installed.contains(&"cilium".to_string()));
        assert!(installed.contains(&"csi".to_string()));
    }

    #[tokio::test]
    async fn test_unhealthy_pods_fail_health_check() {
        let k8s = FakeClusterApi::shared();
        k8s.set_pods("kube-system", &[("k8s-app", "cilium")], 2, false);
        let (engine, _) = engine(k8s, None);
        let addon = catalogue().into_iter().next().unwrap();
        assert!(!engine.is_healthy(&addon).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_all_reports_per_addon() {
        let k8s = FakeClusterApi::shared();
        k8s.set_pods("kube-system", &[("k8s-app", "cilium")], 1, true);
        let (engine, _) = engine(k8s, None);
        let config = test_config("test");

        let health = engine.check_all(&config).await;
        assert_eq!(health.get("cilium"), Some(&true));
        assert_eq!(health.get("csi"), Some(&false));
        assert!(!health.contains_key("argocd"));
    }
}
