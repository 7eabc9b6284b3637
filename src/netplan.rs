/// Subnet planning for the cluster network
///
/// All addressing derives from one root CIDR with the two RFC 4632
/// primitives below, so the CLI and the operator always compute the same
/// addresses without storing them anywhere.
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;

/// Extend `prefix` by `new_bits` and select the `index`-th sub-block.
pub fn cidr_subnet(prefix: Ipv4Net, new_bits: u8, index: u32) -> Result<Ipv4Net> {
    let new_len = prefix.prefix_len() + new_bits;
    if new_len > 32 {
        anyhow::bail!(
            "cannot extend {} by {} bits: prefix would exceed /32",
            prefix,
            new_bits
        );
    }
    if new_bits >= 32 || u64::from(index) >= 1u64 << new_bits {
        anyhow::bail!(
            "subnet index {} out of range for {} extra bits",
            index,
            new_bits
        );
    }

    let base = u32::from(prefix.network());
    let step = 1u32 << (32 - new_len);
    let address = base
        .checked_add(index.checked_mul(step).context("subnet offset overflow")?)
        .context("subnet address overflow")?;

    Ipv4Net::new(Ipv4Addr::from(address), new_len).context("invalid derived subnet")
}

/// The `host_index`-th address inside `prefix`, counting from the network
/// address. Index 0 is the network address itself.
pub fn cidr_host(prefix: Ipv4Net, host_index: u32) -> Result<Ipv4Addr> {
    let base = u32::from(prefix.network());
    let address = base
        .checked_add(host_index)
        .context("host offset overflow")?;
    if address > u32::from(prefix.broadcast()) {
        anyhow::bail!("host index {} out of range for {}", host_index, prefix);
    }
    Ok(Ipv4Addr::from(address))
}

/// Per-role subnet indexes inside the node CIDR.
const CONTROL_PLANE_INDEX: u32 = 0;
const WORKER_INDEX: u32 = 1;
const INGRESS_INDEX: u32 = 2;

/// Offset of the first node address inside a role subnet. `.0` is the
/// network address and `.1` is the cloud gateway, so nodes start at `.2` —
/// which also pins the bootstrap control-plane to a known address.
const FIRST_NODE_HOST: u32 = 2;

/// The derived subnet tree for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    pub root: Ipv4Net,
    pub node: Ipv4Net,
    pub control_plane: Ipv4Net,
    pub worker: Ipv4Net,
    pub ingress: Ipv4Net,
    pub bootstrap_ip: Ipv4Addr,
}

impl NetworkPlan {
    /// Derive the plan from the root network CIDR.
    pub fn new(network_cidr: &str) -> Result<Self> {
        let root: Ipv4Net = network_cidr
            .parse()
            .with_context(|| format!("invalid network CIDR '{}'", network_cidr))?;
        if root.prefix_len() > 24 {
            anyhow::bail!(
                "network CIDR {} is too small: need at least a /24 to carve role subnets",
                root
            );
        }

        // First half of the root is for nodes; the rest stays free for pods
        // or future use.
        let node = cidr_subnet(root, 1, 0)?;
        let role_bits = 25 - node.prefix_len();

        let control_plane = cidr_subnet(node, role_bits, CONTROL_PLANE_INDEX)?;
        let worker = cidr_subnet(node, role_bits, WORKER_INDEX)?;
        let ingress = cidr_subnet(node, role_bits, INGRESS_INDEX)?;
        let bootstrap_ip = cidr_host(control_plane, FIRST_NODE_HOST)?;

        Ok(Self {
            root,
            node,
            control_plane,
            worker,
            ingress,
            bootstrap_ip,
        })
    }

    /// Private address of the `ordinal`-th control-plane node (1-based).
    /// Ordinal 1 is the bootstrap node.
    pub fn control_plane_ip(&self, ordinal: u32) -> Result<Ipv4Addr> {
        cidr_host(self.control_plane, FIRST_NODE_HOST + ordinal - 1)
    }

    /// Private address of the `ordinal`-th worker node (1-based).
    pub fn worker_ip(&self, ordinal: u32) -> Result<Ipv4Addr> {
        cidr_host(self.worker, FIRST_NODE_HOST + ordinal - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_subnet() {
        let root: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        assert_eq!(
            cidr_subnet(root, 1, 0).unwrap(),
            "10.0.0.0/17".parse::<Ipv4Net>().unwrap()
        );
        assert_eq!(
            cidr_subnet(root, 1, 1).unwrap(),
            "10.0.128.0/17".parse::<Ipv4Net>().unwrap()
        );
        assert_eq!(
            cidr_subnet(root, 8, 3).unwrap(),
            "10.0.3.0/24".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn test_cidr_subnet_index_out_of_range() {
        let root: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        assert!(cidr_subnet(root, 1, 2).is_err());
        assert!(cidr_subnet(root, 2, 4).is_err());
    }

    #[test]
    fn test_cidr_host() {
        let subnet: Ipv4Net = "10.0.0.0/25".parse().unwrap();
        assert_eq!(cidr_host(subnet, 2).unwrap(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            cidr_host(subnet, 127).unwrap(),
            "10.0.0.127".parse::<Ipv4Addr>().unwrap()
        );
        assert!(cidr_host(subnet, 128).is_err());
    }

    #[test]
    fn test_plan_is_deterministic() {
        // The stable 6-tuple for the default root.
        let plan = NetworkPlan::new("10.0.0.0/16").unwrap();
        assert_eq!(plan.root, "10.0.0.0/16".parse::<Ipv4Net>().unwrap());
        assert_eq!(plan.node, "10.0.0.0/17".parse::<Ipv4Net>().unwrap());
        assert_eq!(
            plan.control_plane,
            "10.0.0.0/25".parse::<Ipv4Net>().unwrap()
        );
        assert_eq!(plan.worker, "10.0.0.128/25".parse::<Ipv4Net>().unwrap());
        assert_eq!(plan.ingress, "10.0.1.0/25".parse::<Ipv4Net>().unwrap());
        assert_eq!(
            plan.bootstrap_ip,
            "10.0.0.2".parse::<Ipv4Addr>().unwrap()
        );

        assert_eq!(plan, NetworkPlan::new("10.0.0.0/16").unwrap());
    }

    #[test]
    fn test_node_addresses() {
        let plan = NetworkPlan::new("10.0.0.0/16").unwrap();
        assert_eq!(plan.control_plane_ip(1).unwrap(), plan.bootstrap_ip);
        assert_eq!(
            plan.control_plane_ip(2).unwrap(),
            "10.0.0.3".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            plan.worker_ip(1).unwrap(),
            "10.0.0.130".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_rejects_tiny_root() {
        assert!(NetworkPlan::new("10.0.0.0/28").is_err());
        assert!(NetworkPlan::new("not-a-cidr").is_err());
    }
}
