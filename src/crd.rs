/// The Cluster custom resource: declarative input and status subresource
///
/// The CLI consumes the same spec shape from a file; the operator watches it
/// as a namespaced custom resource. Edits here ripple through the translator
/// and the status reporter.
use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Top-level cluster state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Failed,
    Destroying,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::Running => "Running",
            ClusterPhase::Failed => "Failed",
            ClusterPhase::Destroying => "Destroying",
        };
        f.write_str(s)
    }
}

/// Sub-state while `phase = Provisioning`. Closed enumeration; every match
/// over it is exhaustive and unknown values are rejected at deserialisation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum ProvisioningPhase {
    Image,
    Infrastructure,
    Compute,
    Bootstrap,
    #[serde(rename = "CNI")]
    Cni,
    Addons,
    Complete,
}

impl ProvisioningPhase {
    /// All phases in execution order.
    pub const ORDERED: &'static [ProvisioningPhase] = &[
        ProvisioningPhase::Image,
        ProvisioningPhase::Infrastructure,
        ProvisioningPhase::Compute,
        ProvisioningPhase::Bootstrap,
        ProvisioningPhase::Cni,
        ProvisioningPhase::Addons,
        ProvisioningPhase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningPhase::Image => "Image",
            ProvisioningPhase::Infrastructure => "Infrastructure",
            ProvisioningPhase::Compute => "Compute",
            ProvisioningPhase::Bootstrap => "Bootstrap",
            ProvisioningPhase::Cni => "CNI",
            ProvisioningPhase::Addons => "Addons",
            ProvisioningPhase::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative cluster specification.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "k8zner.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "kc",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Step","type":"string","jsonPath":".status.provisioningPhase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stable identifier every resource name derives from. Immutable.
    pub cluster_name: String,
    /// Provider location tag, e.g. `fsn1`.
    pub region: String,
    /// Root DNS suffix for synthesised ingress hostnames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    pub control_plane: NodeGroupSpec,
    #[serde(default)]
    pub workers: NodeGroupSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    pub talos: TalosSpec,
    pub kubernetes: KubernetesSpec,

    #[serde(default)]
    pub addons: AddonToggles,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Name of the secret bundling cloud token, Talos PKI and optional DNS
    /// token.
    pub credentials_ref: String,

    /// Filled by the CLI on handover; never set by users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TalosSpec {
    pub version: String,
    #[serde(default)]
    pub schematic_id: String,
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    pub version: String,
}

/// User-facing addon switches. Cilium, the cloud controller and CSI are
/// always on and have no switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonToggles {
    #[serde(default)]
    pub metrics_server: bool,
    #[serde(default)]
    pub cert_manager: bool,
    #[serde(default)]
    pub traefik: bool,
    #[serde(default)]
    pub external_dns: bool,
    #[serde(default)]
    pub argocd: bool,
    #[serde(default)]
    pub monitoring: bool,
    /// Subdomain overrides for synthesised ingress hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd_subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana_subdomain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Cron expression for etcd snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Secret holding `{access-key, secret-key, endpoint, bucket, region}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_secret_ref: Option<String>,
}

/// Handover record written once by the CLI after a successful bootstrap.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapState {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Observed state, written only by the status reporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_phase: Option<ProvisioningPhase>,
    #[serde(default)]
    pub infrastructure: InfrastructureStatus,
    #[serde(default)]
    pub control_planes: NodeGroupStatus,
    #[serde(default)]
    pub workers: NodeGroupStatus,
    #[serde(default)]
    pub addons: BTreeMap<String, AddonStatus>,
    #[serde(default)]
    pub connectivity: ConnectivityStatus,
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
    /// Bounded ring of past phase transitions, oldest first.
    #[serde(default)]
    pub phase_history: Vec<PhaseTransition>,
    /// Bounded ring of recent failures, oldest first.
    #[serde(default)]
    pub last_errors: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<u64>,
    #[serde(default)]
    pub network_ready: bool,
    #[serde(default)]
    pub firewall_ready: bool,
    #[serde(default)]
    pub load_balancer_ready: bool,
    #[serde(default)]
    pub placement_group_ready: bool,
    #[serde(default)]
    pub snapshot_ready: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    #[serde(default)]
    pub desired: u32,
    #[serde(default)]
    pub ready: u32,
    #[serde(default)]
    pub unhealthy: u32,
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub healthy: bool,
}

/// Per-addon install state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub install_order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    #[serde(default)]
    pub kube_api_ready: bool,
    #[serde(default)]
    pub metrics_api_ready: bool,
    #[serde(default)]
    pub endpoints: Vec<EndpointStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    pub host: String,
    #[serde(default)]
    pub dns_ready: bool,
    #[serde(default)]
    pub tls_ready: bool,
    #[serde(default)]
    pub http_ready: bool,
}

/// Condition entry; `status` is the Kubernetes-conventional True/False/Unknown.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub phase: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub component: String,
    pub message: String,
    pub at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialisation() {
        assert_eq!(
            serde_json::to_string(&ProvisioningPhase::Cni).unwrap(),
            "\"CNI\""
        );
        assert_eq!(
            serde_json::from_str::<ProvisioningPhase>("\"Infrastructure\"").unwrap(),
            ProvisioningPhase::Infrastructure
        );
        // Unknown phase values are rejected, not coerced.
        assert!(serde_json::from_str::<ProvisioningPhase>("\"Warp\"").is_err());
    }

    #[test]
    fn test_phase_order() {
        let phases = ProvisioningPhase::ORDERED;
        for pair in phases.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(phases.len(), 7);
    }

    #[test]
    fn test_spec_roundtrip_with_defaults() {
        let yaml = r#"
clusterName: test
region: fsn1
controlPlane:
  count: 1
  size: cx22
talos:
  version: v1.10.2
kubernetes:
  version: 1.32.2
credentialsRef: test-credentials
"#;
        let spec: ClusterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.cluster_name, "test");
        assert_eq!(spec.workers.count, 0);
        assert!(spec.network_cidr.is_none());
        assert!(!spec.addons.argocd);
        assert!(spec.bootstrap.is_none());
    }

    #[test]
    fn test_status_defaults() {
        let status = ClusterStatus::default();
        assert_eq!(status.phase, ClusterPhase::Pending);
        assert!(status.provisioning_phase.is_none());
        assert!(status.conditions.is_empty());
    }
}
