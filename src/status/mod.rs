/// Status reporting
///
/// Renders the reconcile outcome into the status subresource (operator) or a
/// printable summary (CLI). All writes go through optimistic concurrency;
/// conditions keep their transition time when nothing changed.
use anyhow::{Context, Result};
use chrono::Utc;
use kube::api::{Api, PostParams};
use tracing::debug;

use crate::config::Config;
use crate::crd::{
    Cluster, ClusterPhase, ClusterStatus, ConnectivityStatus, EndpointStatus, ErrorRecord,
    InfrastructureStatus, NodeGroupStatus, NodeStatus, PhaseTransition, StatusCondition,
};
use crate::errors::{is_cancelled, reason_for};
use crate::hcloud::models::Server;
use crate::phases::EngineReport;
use crate::reconcile::State;

/// Bound on the phase-history and error rings.
pub const RING_CAP: usize = 20;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROGRESSING: &str = "Progressing";

/// Set a condition, preserving `lastTransitionTime` when the status value is
/// unchanged.
pub fn set_condition(
    conditions: &mut Vec<StatusCondition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status == status {
            // Same observed value: refresh reason/message only.
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            return;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.last_transition_time = Utc::now().to_rfc3339();
        return;
    }
    conditions.push(StatusCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now().to_rfc3339(),
    });
}

/// Append to a bounded ring, dropping the oldest entries.
pub fn push_bounded<T>(ring: &mut Vec<T>, item: T, cap: usize) {
    ring.push(item);
    if ring.len() > cap {
        let excess = ring.len() - cap;
        ring.drain(0..excess);
    }
}

fn node_status(server: &Server, network_id: Option<u64>) -> NodeStatus {
    NodeStatus {
        name: server.name.clone(),
        server_id: Some(server.id),
        public_ip: server.public_ip(),
        private_ip: network_id.and_then(|id| server.private_ip_on(id)),
        healthy: server.status == "running",
    }
}

fn node_group(servers: &[Server], desired: u32, network_id: Option<u64>) -> NodeGroupStatus {
    let nodes: Vec<NodeStatus> = servers.iter().map(|s| node_status(s, network_id)).collect();
    let ready = nodes.iter().filter(|n| n.healthy).count() as u32;
    NodeGroupStatus {
        desired,
        ready,
        unhealthy: nodes.len() as u32 - ready,
        nodes,
    }
}

/// Fold one reconcile outcome into the previous status.
pub fn render_status(
    previous: ClusterStatus,
    config: &Config,
    desired_workers: u32,
    state: &State,
    report: &EngineReport,
) -> ClusterStatus {
    let mut status = previous;
    let network_id = state.network_id();

    status.infrastructure = InfrastructureStatus {
        network_id,
        firewall_id: state.firewall_id(),
        load_balancer_id: state.load_balancer.as_ref().map(|lb| lb.id),
        load_balancer_ip: state.load_balancer.as_ref().and_then(|lb| lb.public_ip()),
        load_balancer_private_ip: state.load_balancer.as_ref().and_then(|lb| lb.private_ip()),
        ssh_key_id: state.ssh_key.as_ref().map(|k| k.id),
        placement_group_id: state.placement_group.as_ref().map(|pg| pg.id),
        snapshot_id: state.snapshot_id,
        network_ready: state.network.is_some(),
        firewall_ready: state.firewall.is_some(),
        load_balancer_ready: state.load_balancer.is_some(),
        placement_group_ready: state.placement_group.is_some(),
        snapshot_ready: state.snapshot_id.is_some(),
    };

    status.control_planes = node_group(
        &state.control_planes,
        config.control_planes.count,
        network_id,
    );
    status.workers = node_group(&state.workers, desired_workers, network_id);

    if !state.addons.is_empty() {
        status.addons = state.addons.clone();
    }

    status.connectivity = ConnectivityStatus {
        kube_api_ready: state.kubeconfig.is_some(),
        metrics_api_ready: state
            .addons
            .get("metrics-server")
            .map(|a| a.healthy)
            .unwrap_or(false),
        endpoints: ingress_endpoints(config),
    };

    for run in &report.runs {
        push_bounded(
            &mut status.phase_history,
            PhaseTransition {
                phase: run.phase.to_string(),
                started_at: run.started_at.to_rfc3339(),
                completed_at: Some(run.completed_at.to_rfc3339()),
                duration_seconds: Some(
                    (run.completed_at - run.started_at).num_seconds().max(0) as u64,
                ),
                outcome: run.outcome.to_string(),
            },
            RING_CAP,
        );
    }

    match &report.error {
        None => {
            status.phase = if report.is_complete() {
                ClusterPhase::Running
            } else {
                ClusterPhase::Provisioning
            };
            status.provisioning_phase = Some(report.reached);
            set_condition(
                &mut status.conditions,
                CONDITION_READY,
                if report.is_complete() { "True" } else { "False" },
                if report.is_complete() {
                    "ReconcileSucceeded"
                } else {
                    "Provisioning"
                },
                &format!("provisioning phase {}", report.reached),
            );
        }
        Some(err) if is_cancelled(err) => {
            // Cancellation is not a failure; the next reconcile continues.
            status.phase = ClusterPhase::Provisioning;
            status.provisioning_phase = report.failed.or(Some(report.reached));
        }
        Some(err) => {
            status.phase = ClusterPhase::Failed;
            status.provisioning_phase = report.failed.or(Some(report.reached));
            let reason = reason_for(err);
            let message = format!("{:#}", err);
            set_condition(&mut status.conditions, CONDITION_READY, "False", reason, &message);
            push_bounded(
                &mut status.last_errors,
                ErrorRecord {
                    component: report
                        .failed
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "engine".to_string()),
                    message,
                    at: Utc::now().to_rfc3339(),
                },
                RING_CAP,
            );
        }
    }

    set_condition(
        &mut status.conditions,
        CONDITION_PROGRESSING,
        if status.phase == ClusterPhase::Provisioning {
            "True"
        } else {
            "False"
        },
        &status.phase.to_string(),
        "",
    );

    status.last_reconcile_time = Some(Utc::now().to_rfc3339());
    status
}

fn ingress_endpoints(config: &Config) -> Vec<EndpointStatus> {
    let mut endpoints = Vec::new();
    if let Some(ingress) = config.addons.argocd.as_ref().and_then(|a| a.ingress.as_ref()) {
        endpoints.push(EndpointStatus {
            host: ingress.host.clone(),
            ..EndpointStatus::default()
        });
    }
    if let Some(ingress) = config
        .addons
        .monitoring
        .as_ref()
        .and_then(|m| m.grafana_ingress.as_ref())
    {
        endpoints.push(EndpointStatus {
            host: ingress.host.clone(),
            ..EndpointStatus::default()
        });
    }
    endpoints
}

/// Owns writes to the status subresource.
pub struct StatusReporter {
    api: Api<Cluster>,
}

impl StatusReporter {
    pub fn new(api: Api<Cluster>) -> Self {
        Self { api }
    }

    /// Read-modify-write with a resource-version check; re-reads and
    /// re-applies on conflict, up to a small cap.
    pub async fn update<F>(&self, name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut ClusterStatus),
    {
        const MAX_CONFLICTS: u32 = 3;

        for attempt in 1..=MAX_CONFLICTS {
            let mut cluster = self
                .api
                .get_status(name)
                .await
                .context("failed to read cluster status")?;
            let mut status = cluster.status.take().unwrap_or_default();
            mutate(&mut status);
            cluster.status = Some(status);
            cluster.metadata.managed_fields = None;

            match self
                .api
                .replace_status(
                    name,
                    &PostParams::default(),
                    serde_json::to_vec(&cluster).context("failed to serialise status")?,
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(err)) if err.code == 409 && attempt < MAX_CONFLICTS => {
                    debug!("status write conflict on {}, retrying", name);
                }
                Err(e) => return Err(e).context("failed to write cluster status"),
            }
        }
        anyhow::bail!("status write for {} kept conflicting", name)
    }
}

/// Human-readable one-liner for the CLI status command.
pub fn summarize(status: &ClusterStatus) -> String {
    let step = status
        .provisioning_phase
        .map(|p| format!(" ({})", p))
        .unwrap_or_default();
    format!(
        "phase {}{} | control planes {}/{} | workers {}/{}",
        status.phase,
        step,
        status.control_planes.ready,
        status.control_planes.desired,
        status.workers.ready,
        status.workers.desired,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::crd::ProvisioningPhase;
    use crate::phases::PhaseRun;

    fn report_complete() -> EngineReport {
        EngineReport {
            reached: ProvisioningPhase::Complete,
            failed: None,
            runs: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_set_condition_preserves_transition_time() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", "False", "Provisioning", "starting");
        let original_time = conditions[0].last_transition_time.clone();

        set_condition(&mut conditions, "Ready", "False", "Provisioning", "still going");
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].message, "still going");

        set_condition(&mut conditions, "Ready", "True", "ReconcileSucceeded", "done");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn test_push_bounded_drops_oldest() {
        let mut ring = Vec::new();
        for i in 0..25 {
            push_bounded(&mut ring, i, RING_CAP);
        }
        assert_eq!(ring.len(), RING_CAP);
        assert_eq!(ring[0], 5);
        assert_eq!(*ring.last().unwrap(), 24);
    }

    #[test]
    fn test_render_complete_status() {
        let config = test_config("test");
        let mut state = State::default();
        state.snapshot_id = Some(7);

        let status = render_status(
            ClusterStatus::default(),
            &config,
            0,
            &state,
            &report_complete(),
        );

        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.provisioning_phase, Some(ProvisioningPhase::Complete));
        assert!(status.infrastructure.snapshot_ready);
        assert!(!status.infrastructure.network_ready);
        let ready = status
            .conditions
            .iter()
            .find(|c| c.condition_type == "Ready")
            .unwrap();
        assert_eq!(ready.status, "True");
    }

    #[test]
    fn test_render_failed_status() {
        let config = test_config("test");
        let state = State::default();
        let report = EngineReport {
            reached: ProvisioningPhase::Image,
            failed: Some(ProvisioningPhase::Infrastructure),
            runs: vec![PhaseRun {
                phase: ProvisioningPhase::Infrastructure,
                started_at: Utc::now(),
                completed_at: Utc::now(),
                outcome: "Failed",
            }],
            error: Some(
                crate::errors::ProvisionError::OwnershipConflict {
                    kind: "network",
                    name: "test-network".to_string(),
                    cluster: "test".to_string(),
                }
                .into(),
            ),
        };

        let status = render_status(ClusterStatus::default(), &config, 0, &state, &report);

        assert_eq!(status.phase, ClusterPhase::Failed);
        assert_eq!(
            status.provisioning_phase,
            Some(ProvisioningPhase::Infrastructure)
        );
        let ready = status
            .conditions
            .iter()
            .find(|c| c.condition_type == "Ready")
            .unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "OwnershipConflict");
        assert_eq!(status.last_errors.len(), 1);
        assert_eq!(status.phase_history.len(), 1);
        assert_eq!(status.phase_history[0].outcome, "Failed");
    }

    #[test]
    fn test_cancellation_is_not_failure() {
        let config = test_config("test");
        let state = State::default();
        let report = EngineReport {
            reached: ProvisioningPhase::Compute,
            failed: Some(ProvisioningPhase::Bootstrap),
            runs: Vec::new(),
            error: Some(crate::errors::ProvisionError::Cancelled.into()),
        };

        let status = render_status(ClusterStatus::default(), &config, 0, &state, &report);
        assert_eq!(status.phase, ClusterPhase::Provisioning);
        assert!(status.last_errors.is_empty());
    }

    #[test]
    fn test_domain_endpoints_reported() {
        let mut config = test_config("test");
        config.addons.argocd = Some(crate::config::ArgoCdConfig {
            ingress: Some(crate::config::IngressConfig {
                host: "argo.example.com".to_string(),
                class: "traefik".to_string(),
                tls: true,
            }),
        });

        let status = render_status(
            ClusterStatus::default(),
            &config,
            0,
            &State::default(),
            &report_complete(),
        );
        assert_eq!(status.connectivity.endpoints.len(), 1);
        assert_eq!(status.connectivity.endpoints[0].host, "argo.example.com");
    }
}
