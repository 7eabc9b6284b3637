/// Deterministic resource naming
///
/// Every cloud resource name derives from the cluster name through these
/// functions. Identical inputs always produce identical names, so repeated
/// reconciles find what earlier runs created. Singletons carry no suffix;
/// servers carry a zero-padded ordinal so lexicographic order matches
/// creation order.

/// Value of the `managed-by` label on every resource we create.
pub const MANAGED_BY: &str = "k8zner";

pub fn network(cluster_name: &str) -> String {
    format!("{}-network", cluster_name)
}

pub fn firewall(cluster_name: &str) -> String {
    format!("{}-firewall", cluster_name)
}

pub fn kube_api_load_balancer(cluster_name: &str) -> String {
    format!("{}-kube-api", cluster_name)
}

pub fn placement_group(cluster_name: &str, role: &str) -> String {
    format!("{}-{}-pg", cluster_name, role)
}

pub fn ssh_key(cluster_name: &str) -> String {
    format!("{}-{}", cluster_name, MANAGED_BY)
}

/// Control-plane server name; `ordinal` is 1-based.
pub fn control_plane_server(cluster_name: &str, ordinal: u32) -> String {
    format!("{}-cp-{:02}", cluster_name, ordinal)
}

/// Worker server name within a pool; `ordinal` is 1-based.
pub fn worker_server(cluster_name: &str, pool_name: &str, ordinal: u32) -> String {
    format!("{}-{}-{:02}", cluster_name, pool_name, ordinal)
}

/// Snapshot description. Lookup goes by labels, the name is informational.
pub fn snapshot(talos_version: &str, arch: &str) -> String {
    format!("talos-{}-{}", talos_version, arch)
}

/// Disposable server used while building a snapshot.
pub fn image_builder(cluster_name: &str) -> String {
    format!("{}-image-builder", cluster_name)
}

/// Short node name (without the cluster prefix) recorded in the cluster
/// resource's bootstrap block.
pub fn short_node_name(cluster_name: &str, server_name: &str) -> String {
    server_name
        .strip_prefix(&format!("{}-", cluster_name))
        .unwrap_or(server_name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_stable() {
        assert_eq!(network("test"), "test-network");
        assert_eq!(network("test"), network("test"));
        assert_eq!(firewall("test"), "test-firewall");
        assert_eq!(kube_api_load_balancer("test"), "test-kube-api");
        assert_eq!(placement_group("test", "control-plane"), "test-control-plane-pg");
        assert_eq!(ssh_key("test"), "test-k8zner");
    }

    #[test]
    fn test_distinct_clusters_never_collide() {
        assert_ne!(network("alpha"), network("beta"));
        assert_ne!(
            control_plane_server("alpha", 1),
            control_plane_server("beta", 1)
        );
    }

    #[test]
    fn test_server_ordinals() {
        assert_eq!(control_plane_server("test", 1), "test-cp-01");
        assert_eq!(control_plane_server("test", 3), "test-cp-03");
        assert_eq!(worker_server("test", "worker", 2), "test-worker-02");
    }

    #[test]
    fn test_ordinal_order_is_lexicographic() {
        let names: Vec<String> = (1..=12)
            .map(|i| control_plane_server("test", i))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_short_node_name() {
        assert_eq!(short_node_name("test", "test-cp-01"), "cp-01");
        assert_eq!(short_node_name("test", "unrelated"), "unrelated");
    }
}
