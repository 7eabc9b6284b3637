/// Idempotent resource reconciliation
///
/// Every cloud resource follows the same dance: look up by canonical name,
/// verify ownership labels, create with the full label set when absent.
/// Reconcilers only ever add; destruction lives in its own path.
pub mod firewall;
pub mod load_balancer;
pub mod network;
pub mod placement_group;
pub mod servers;
pub mod ssh_key;

pub use servers::node_labels;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use crate::crd::{AddonStatus, BootstrapState};
use crate::errors::ProvisionError;
use crate::hcloud::api_error;
use crate::hcloud::models::{Firewall, LoadBalancer, Network, PlacementGroup, Server, SshKey};
use crate::infra::LabelSelector;
use crate::naming::MANAGED_BY;
use crate::observe::{Event, Observer};

pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_NODE_ROLE: &str = "node-role";
pub const LABEL_POOL: &str = "pool";

/// Resource roles recorded in the `role` label.
pub mod roles {
    pub const NETWORK: &str = "network";
    pub const FIREWALL: &str = "firewall";
    pub const LOAD_BALANCER: &str = "load-balancer";
    pub const PLACEMENT_GROUP: &str = "placement-group";
    pub const SNAPSHOT: &str = "snapshot";
    pub const CONTROL_PLANE: &str = "control-plane";
    pub const WORKER: &str = "worker";
    pub const IMAGE_BUILDER: &str = "image-builder";
    pub const SSH_KEY: &str = "ssh-key";
}

/// The full ownership label set for a resource of the given role.
pub fn owner_labels(cluster_name: &str, role: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster_name.to_string());
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels
}

/// Selector matching everything this cluster owns.
pub fn owner_selector(cluster_name: &str) -> LabelSelector {
    LabelSelector::new()
        .with(LABEL_MANAGED_BY, MANAGED_BY)
        .with(LABEL_CLUSTER, cluster_name)
}

/// Selector matching this cluster's resources of one role.
pub fn role_selector(cluster_name: &str, role: &str) -> LabelSelector {
    owner_selector(cluster_name).with(LABEL_ROLE, role)
}

/// The ownership check: a same-named resource missing any part of our label
/// set belongs to someone else and is never touched.
pub fn verify_ownership(
    kind: &'static str,
    name: &str,
    cluster_name: &str,
    labels: &HashMap<String, String>,
) -> Result<()> {
    let owned = labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY)
        && labels.get(LABEL_CLUSTER).map(String::as_str) == Some(cluster_name);
    if owned {
        Ok(())
    } else {
        Err(ProvisionError::OwnershipConflict {
            kind,
            name: name.to_string(),
            cluster: cluster_name.to_string(),
        }
        .into())
    }
}

/// Shared get-or-create core. `get` runs again after a create-time uniqueness
/// conflict, which covers the benign race where a concurrent reconcile won.
pub async fn get_or_create<T, G, GFut, C, CFut, L>(
    kind: &'static str,
    name: &str,
    cluster_name: &str,
    observer: &Arc<dyn Observer>,
    get: G,
    create: C,
    labels_of: L,
) -> Result<T>
where
    G: Fn() -> GFut,
    GFut: Future<Output = Result<Option<T>>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<T>>,
    L: Fn(&T) -> &HashMap<String, String>,
{
    if let Some(existing) = get().await? {
        verify_ownership(kind, name, cluster_name, labels_of(&existing))?;
        return Ok(existing);
    }

    match create().await {
        Ok(created) => {
            observer.event(Event::resource_created(kind, name));
            Ok(created)
        }
        Err(err) if api_error(&err).is_some_and(|e| e.is_conflict()) => {
            let found = get().await?.ok_or(err)?;
            verify_ownership(kind, name, cluster_name, labels_of(&found))?;
            Ok(found)
        }
        Err(err) => {
            observer.event(Event::resource_failed(kind, name, &err));
            Err(err)
        }
    }
}

/// Shared record of what a reconcile has observed and created so far. Owned
/// by the reconcile task; phase steps fill it in order.
#[derive(Default)]
pub struct State {
    pub network: Option<Network>,
    pub firewall: Option<Firewall>,
    pub load_balancer: Option<LoadBalancer>,
    pub placement_group: Option<PlacementGroup>,
    pub ssh_key: Option<SshKey>,
    /// Private half of a freshly generated cluster key; present only on the
    /// reconcile that created it.
    pub ssh_private_key: Option<String>,
    pub snapshot_id: Option<u64>,
    pub control_planes: Vec<Server>,
    pub workers: Vec<Server>,
    /// Admin kubeconfig, rewritten to the load-balancer endpoint.
    pub kubeconfig: Option<String>,
    /// Bootstrap record carried over from the spec.
    pub bootstrap: Option<BootstrapState>,
    /// Addon states accumulated by the addon phases.
    pub addons: BTreeMap<String, AddonStatus>,
}

impl State {
    pub fn network_id(&self) -> Option<u64> {
        self.network.as_ref().map(|n| n.id)
    }

    pub fn firewall_id(&self) -> Option<u64> {
        self.firewall.as_ref().map(|f| f.id)
    }

    pub fn bootstrap_completed(&self) -> bool {
        self.bootstrap.as_ref().is_some_and(|b| b.completed)
    }

    /// Control planes ordered by canonical name; index 0 is the bootstrap
    /// candidate.
    pub fn sorted_control_planes(&self) -> Vec<&Server> {
        let mut nodes: Vec<&Server> = self.control_planes.iter().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }
}
