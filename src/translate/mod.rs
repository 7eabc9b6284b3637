/// Spec-to-config translation
///
/// Pure function from the declarative spec plus credentials to the canonical
/// internal configuration. Accepts a superset (legacy server types, missing
/// optionals) and emits the fully-expanded form the engine runs on.
use anyhow::Result;
use tracing::warn;

use crate::config::{
    server_types, AddonConfig, ArgoCdConfig, CertManagerConfig, Config, ExternalDnsConfig,
    IngressConfig, MonitoringConfig, NodePool, TalosBackupConfig, TalosSettings,
    DEFAULT_NETWORK_CIDR, DEFAULT_POD_CIDR, DEFAULT_SERVICE_CIDR,
};
use crate::credentials::{Credentials, S3Credentials};
use crate::crd::ClusterSpec;

/// Schematic of the stock Talos factory image (no extra extensions).
const DEFAULT_SCHEMATIC_ID: &str =
    "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

const DEFAULT_BACKUP_SCHEDULE: &str = "0 */6 * * *";
const DEFAULT_ARGOCD_SUBDOMAIN: &str = "argo";
const DEFAULT_GRAFANA_SUBDOMAIN: &str = "grafana";

/// Translate a spec into the canonical config.
///
/// `s3` carries the resolved backup credentials, if any; `firewall_source_ips`
/// are the operator's detected public addresses for the admin rules. The
/// result is validated, so a returned config is safe to act on.
pub fn translate(
    spec: &ClusterSpec,
    credentials: &Credentials,
    s3: Option<&S3Credentials>,
    firewall_source_ips: Vec<String>,
) -> Result<Config> {
    let cluster_name = spec.cluster_name.clone();

    let control_planes = NodePool {
        name: "cp".to_string(),
        count: spec.control_plane.count,
        server_type: normalize_size(&spec.control_plane.size),
    };

    // Workers are created by the operator's scale loop, never by the phase
    // engine; a non-zero count here would duplicate-create on handover.
    let workers = NodePool {
        name: "worker".to_string(),
        count: 0,
        server_type: if spec.workers.size.is_empty() {
            control_planes.server_type.clone()
        } else {
            normalize_size(&spec.workers.size)
        },
    };

    let talos = TalosSettings {
        version: spec.talos.version.clone(),
        schematic_id: if spec.talos.schematic_id.is_empty() {
            DEFAULT_SCHEMATIC_ID.to_string()
        } else {
            spec.talos.schematic_id.clone()
        },
        extensions: spec.talos.extensions.clone(),
    };

    let addons = translate_addons(spec, credentials, s3);

    let config = Config {
        cluster_name,
        location: spec.region.clone(),
        domain: spec.domain.clone(),
        network_cidr: spec
            .network_cidr
            .clone()
            .unwrap_or_else(|| DEFAULT_NETWORK_CIDR.to_string()),
        pod_cidr: spec
            .pod_cidr
            .clone()
            .unwrap_or_else(|| DEFAULT_POD_CIDR.to_string()),
        service_cidr: spec
            .service_cidr
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVICE_CIDR.to_string()),
        control_planes,
        workers,
        talos,
        kubernetes_version: spec.kubernetes.version.clone(),
        addons,
        firewall_source_ips,
    };

    config.validate()?;
    Ok(config)
}

fn normalize_size(size: &str) -> String {
    if size.is_empty() {
        "cx23".to_string()
    } else {
        server_types::normalize(size)
    }
}

fn translate_addons(
    spec: &ClusterSpec,
    credentials: &Credentials,
    s3: Option<&S3Credentials>,
) -> AddonConfig {
    let toggles = &spec.addons;
    let domain = spec.domain.as_deref();

    let ingress_for = |enabled: bool, subdomain: &str| -> Option<IngressConfig> {
        match (enabled, domain) {
            (true, Some(domain)) => Some(IngressConfig {
                host: format!("{}.{}", subdomain, domain),
                class: "traefik".to_string(),
                tls: true,
            }),
            _ => None,
        }
    };

    let argocd = toggles.argocd.then(|| ArgoCdConfig {
        ingress: ingress_for(
            true,
            toggles
                .argocd_subdomain
                .as_deref()
                .unwrap_or(DEFAULT_ARGOCD_SUBDOMAIN),
        ),
    });

    let monitoring = toggles.monitoring.then(|| MonitoringConfig {
        grafana_ingress: ingress_for(
            true,
            toggles
                .grafana_subdomain
                .as_deref()
                .unwrap_or(DEFAULT_GRAFANA_SUBDOMAIN),
        ),
    });

    let external_dns = toggles.external_dns.then(|| {
        if credentials.cloudflare_api_token.is_none() {
            warn!("externalDNS enabled without a cloudflare-api-token; records will not sync");
        }
        ExternalDnsConfig {
            provider: "cloudflare".to_string(),
            txt_owner_id: spec.cluster_name.clone(),
            policy: "sync".to_string(),
            source: "ingress".to_string(),
        }
    });

    let cert_manager = toggles.cert_manager.then(|| CertManagerConfig {
        cloudflare_email: domain.map(|d| format!("admin@{}", d)),
    });

    // Absent or incomplete S3 credentials mean the backup addon is skipped,
    // never a failure.
    let talos_backup = match (&spec.backup, s3) {
        (Some(backup), Some(s3)) if backup.enabled => Some(TalosBackupConfig {
            schedule: backup
                .schedule
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKUP_SCHEDULE.to_string()),
            access_key: s3.access_key.clone(),
            secret_key: s3.secret_key.clone(),
            endpoint: s3.endpoint.clone(),
            bucket: s3.bucket.clone(),
            region: s3.region.clone(),
            // The operator has no age keypair to encrypt with.
            encryption_disabled: true,
        }),
        _ => None,
    };

    AddonConfig {
        metrics_server: toggles.metrics_server,
        cert_manager,
        traefik: toggles.traefik,
        external_dns,
        argocd,
        monitoring,
        talos_backup,
    }
}

/// Detect the caller's public addresses for the restricted admin-access
/// firewall rules. Best-effort: an unreachable detector just narrows the
/// rules to whatever was found.
pub async fn detect_source_ips() -> Vec<String> {
    let client = reqwest::Client::new();
    let mut ips = Vec::new();

    for (url, suffix) in [
        ("https://ipv4.icanhazip.com", "/32"),
        ("https://ipv6.icanhazip.com", "/128"),
    ] {
        match client.get(url).send().await {
            Ok(response) => match response.text().await {
                Ok(text) if !text.trim().is_empty() => {
                    ips.push(format!("{}{}", text.trim(), suffix));
                }
                _ => {}
            },
            Err(e) => warn!("could not detect public IP via {}: {}", url, e),
        }
    }

    ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AddonToggles, BackupSpec, KubernetesSpec, NodeGroupSpec, TalosSpec,
    };

    fn base_spec() -> ClusterSpec {
        ClusterSpec {
            cluster_name: "test".to_string(),
            region: "fsn1".to_string(),
            domain: None,
            control_plane: NodeGroupSpec {
                count: 1,
                size: "cx23".to_string(),
            },
            workers: NodeGroupSpec {
                count: 0,
                size: String::new(),
            },
            network_cidr: None,
            pod_cidr: None,
            service_cidr: None,
            talos: TalosSpec {
                version: "v1.10.2".to_string(),
                schematic_id: String::new(),
                extensions: Vec::new(),
            },
            kubernetes: KubernetesSpec {
                version: "1.32.2".to_string(),
            },
            addons: AddonToggles::default(),
            backup: None,
            credentials_ref: "test-credentials".to_string(),
            bootstrap: None,
        }
    }

    fn credentials(cloudflare: bool) -> Credentials {
        Credentials {
            hcloud_token: "token".to_string(),
            talos_secrets: None,
            talos_config: None,
            cloudflare_api_token: cloudflare.then(|| "cf-token".to_string()),
        }
    }

    fn sources() -> Vec<String> {
        vec!["198.51.100.7/32".to_string()]
    }

    #[test]
    fn test_defaults_expand() {
        let config = translate(&base_spec(), &credentials(false), None, sources()).unwrap();
        assert_eq!(config.network_cidr, "10.0.0.0/16");
        assert_eq!(config.pod_cidr, "10.244.0.0/16");
        assert_eq!(config.service_cidr, "10.96.0.0/12");
        assert_eq!(config.talos.schematic_id, DEFAULT_SCHEMATIC_ID);
    }

    #[test]
    fn test_legacy_server_type_is_normalised() {
        let mut spec = base_spec();
        spec.control_plane.size = "cx22".to_string();
        let config = translate(&spec, &credentials(false), None, sources()).unwrap();
        assert_eq!(config.control_planes.server_type, "cx23");
    }

    #[test]
    fn test_worker_count_is_forced_to_zero() {
        let mut spec = base_spec();
        spec.workers = NodeGroupSpec {
            count: 5,
            size: "cx33".to_string(),
        };
        let config = translate(&spec, &credentials(false), None, sources()).unwrap();
        assert_eq!(config.workers.count, 0);
        assert_eq!(config.workers.server_type, "cx33");
    }

    #[test]
    fn test_domain_wiring() {
        let mut spec = base_spec();
        spec.domain = Some("example.com".to_string());
        spec.addons = AddonToggles {
            argocd: true,
            monitoring: true,
            external_dns: true,
            cert_manager: true,
            ..AddonToggles::default()
        };
        let config = translate(&spec, &credentials(true), None, sources()).unwrap();

        let argocd_ingress = config.addons.argocd.unwrap().ingress.unwrap();
        assert_eq!(argocd_ingress.host, "argo.example.com");
        assert_eq!(argocd_ingress.class, "traefik");
        assert!(argocd_ingress.tls);

        let grafana_ingress = config
            .addons
            .monitoring
            .unwrap()
            .grafana_ingress
            .unwrap();
        assert_eq!(grafana_ingress.host, "grafana.example.com");

        let external_dns = config.addons.external_dns.unwrap();
        assert_eq!(external_dns.provider, "cloudflare");
        assert_eq!(external_dns.txt_owner_id, "test");
        assert_eq!(external_dns.policy, "sync");
        assert_eq!(external_dns.source, "ingress");

        let cert_manager = config.addons.cert_manager.unwrap();
        assert_eq!(
            cert_manager.cloudflare_email.as_deref(),
            Some("admin@example.com")
        );
    }

    #[test]
    fn test_subdomain_override() {
        let mut spec = base_spec();
        spec.domain = Some("example.com".to_string());
        spec.addons.argocd = true;
        spec.addons.argocd_subdomain = Some("deploy".to_string());
        let config = translate(&spec, &credentials(false), None, sources()).unwrap();
        assert_eq!(
            config.addons.argocd.unwrap().ingress.unwrap().host,
            "deploy.example.com"
        );
    }

    #[test]
    fn test_no_domain_means_no_ingress() {
        let mut spec = base_spec();
        spec.addons.argocd = true;
        let config = translate(&spec, &credentials(false), None, sources()).unwrap();
        assert!(config.addons.argocd.unwrap().ingress.is_none());
    }

    #[test]
    fn test_backup_without_credentials_is_skipped() {
        let mut spec = base_spec();
        spec.backup = Some(BackupSpec {
            enabled: true,
            schedule: None,
            s3_secret_ref: Some("backup-creds".to_string()),
        });
        let config = translate(&spec, &credentials(false), None, sources()).unwrap();
        assert!(config.addons.talos_backup.is_none());
    }

    #[test]
    fn test_backup_with_credentials() {
        let mut spec = base_spec();
        spec.backup = Some(BackupSpec {
            enabled: true,
            schedule: Some("@hourly".to_string()),
            s3_secret_ref: Some("backup-creds".to_string()),
        });
        let s3 = S3Credentials {
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            endpoint: "https://s3.example.com".to_string(),
            bucket: "backups".to_string(),
            region: "eu-central-1".to_string(),
        };
        let config = translate(&spec, &credentials(false), Some(&s3), sources()).unwrap();
        let backup = config.addons.talos_backup.unwrap();
        assert_eq!(backup.schedule, "@hourly");
        assert!(backup.encryption_disabled);
        assert_eq!(backup.bucket, "backups");
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let mut spec = base_spec();
        spec.region = "nowhere".to_string();
        let err = translate(&spec, &credentials(false), None, sources()).unwrap_err();
        assert!(crate::errors::is_validation(&err));
    }
}
