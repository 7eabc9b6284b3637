/// Internal configuration graph
///
/// The canonical, fully-expanded form the engine runs on. Produced from the
/// declarative spec by the translator; nothing downstream re-applies defaults
/// or normalisation.
pub mod server_types;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;

/// Locations the provider offers; the region field is validated against this
/// closed set.
pub const LOCATIONS: &[&str] = &["fsn1", "nbg1", "hel1", "ash", "hil", "sin"];

pub const DEFAULT_NETWORK_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// Network zone for a location.
pub fn network_zone(location: &str) -> &'static str {
    match location {
        "ash" => "us-east",
        "hil" => "us-west",
        "sin" => "ap-southeast",
        _ => "eu-central",
    }
}

/// Canonical cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster_name: String,
    pub location: String,
    pub domain: Option<String>,

    pub network_cidr: String,
    pub pod_cidr: String,
    pub service_cidr: String,

    pub control_planes: NodePool,
    pub workers: NodePool,

    pub talos: TalosSettings,
    pub kubernetes_version: String,

    pub addons: AddonConfig,

    /// Source addresses allowed through the admin firewall rules.
    pub firewall_source_ips: Vec<String>,
}

/// One pool of identical servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub count: u32,
    pub server_type: String,
}

/// Talos image selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalosSettings {
    pub version: String,
    pub schematic_id: String,
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// Ingress exposure for an addon UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressConfig {
    pub host: String,
    pub class: String,
    pub tls: bool,
}

/// Fully-resolved addon configuration. Cilium, the cloud controller and CSI
/// are unconditional; the rest reflect user intent plus domain wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddonConfig {
    pub metrics_server: bool,
    pub cert_manager: Option<CertManagerConfig>,
    pub traefik: bool,
    pub external_dns: Option<ExternalDnsConfig>,
    pub argocd: Option<ArgoCdConfig>,
    pub monitoring: Option<MonitoringConfig>,
    pub talos_backup: Option<TalosBackupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertManagerConfig {
    /// ACME registration address for DNS-01; set when a domain is known.
    pub cloudflare_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDnsConfig {
    pub provider: String,
    pub txt_owner_id: String,
    pub policy: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgoCdConfig {
    pub ingress: Option<IngressConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub grafana_ingress: Option<IngressConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalosBackupConfig {
    pub schedule: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub encryption_disabled: bool,
}

impl Config {
    /// Validate the canonical form. Runs before any side effect; failures
    /// carry the `ValidationError` reason.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster_name.is_empty() {
            return Err(invalid("cluster_name cannot be empty"));
        }
        if !self
            .cluster_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.cluster_name.starts_with('-')
            || self.cluster_name.ends_with('-')
        {
            return Err(invalid(
                "cluster_name must be lowercase alphanumerics and dashes",
            ));
        }
        if !LOCATIONS.contains(&self.location.as_str()) {
            return Err(invalid(&format!(
                "unknown location '{}', expected one of {}",
                self.location,
                LOCATIONS.join(", ")
            )));
        }
        if self.control_planes.count < 1 {
            return Err(invalid("at least one control plane is required"));
        }

        let network = parse_cidr("network_cidr", &self.network_cidr)?;
        let pods = parse_cidr("pod_cidr", &self.pod_cidr)?;
        let services = parse_cidr("service_cidr", &self.service_cidr)?;

        if overlaps(pods, services) {
            return Err(invalid(&format!(
                "pod_cidr {} overlaps service_cidr {}",
                pods, services
            )));
        }
        if overlaps(network, pods) {
            return Err(invalid(&format!(
                "pod_cidr {} overlaps network_cidr {}",
                pods, network
            )));
        }
        if overlaps(network, services) {
            return Err(invalid(&format!(
                "service_cidr {} overlaps network_cidr {}",
                services, network
            )));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> anyhow::Error {
    ProvisionError::Validation(message.to_string()).into()
}

fn parse_cidr(field: &str, value: &str) -> anyhow::Result<Ipv4Net> {
    value
        .parse()
        .map_err(|_| invalid(&format!("{} '{}' is not a valid CIDR", field, value)))
}

fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[cfg(test)]
pub fn test_config(cluster_name: &str) -> Config {
    Config {
        cluster_name: cluster_name.to_string(),
        location: "fsn1".to_string(),
        domain: None,
        network_cidr: DEFAULT_NETWORK_CIDR.to_string(),
        pod_cidr: DEFAULT_POD_CIDR.to_string(),
        service_cidr: DEFAULT_SERVICE_CIDR.to_string(),
        control_planes: NodePool {
            name: "cp".to_string(),
            count: 1,
            server_type: "cx23".to_string(),
        },
        workers: NodePool {
            name: "worker".to_string(),
            count: 0,
            server_type: "cx23".to_string(),
        },
        talos: TalosSettings {
            version: "v1.10.2".to_string(),
            schematic_id: "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba"
                .to_string(),
            extensions: Vec::new(),
        },
        kubernetes_version: "1.32.2".to_string(),
        addons: AddonConfig::default(),
        firewall_source_ips: vec!["198.51.100.7/32".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config("test").validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_cluster_names() {
        for name in ["", "Has-Caps", "under_score", "-leading", "trailing-"] {
            let mut config = test_config("test");
            config.cluster_name = name.to_string();
            let err = config.validate().unwrap_err();
            assert!(crate::errors::is_validation(&err), "accepted '{}'", name);
        }
    }

    #[test]
    fn test_rejects_unknown_location() {
        let mut config = test_config("test");
        config.location = "atlantis".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_pod_service_overlap() {
        let mut config = test_config("test");
        config.pod_cidr = "10.96.0.0/16".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_rejects_node_network_overlap() {
        let mut config = test_config("test");
        config.pod_cidr = "10.0.128.0/17".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requires_control_plane() {
        let mut config = test_config("test");
        config.control_planes.count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_zones() {
        assert_eq!(network_zone("fsn1"), "eu-central");
        assert_eq!(network_zone("ash"), "us-east");
        assert_eq!(network_zone("sin"), "ap-southeast");
    }
}
