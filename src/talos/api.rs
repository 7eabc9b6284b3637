/// Talos node API boundary
///
/// The engine sees the trait; production drives `talosctl`, tests use the
/// in-memory fake.
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::utils::command::CommandBuilder;

#[async_trait]
pub trait TalosApi: Send + Sync {
    /// Cheap reachability probe of the node's Talos API.
    async fn probe(&self, node: &str) -> Result<()>;

    /// Apply a machine configuration. `insecure` targets maintenance mode
    /// (first contact, before the node has our PKI).
    async fn apply_configuration(
        &self,
        node: &str,
        machine_config: &str,
        insecure: bool,
    ) -> Result<()>;

    /// The one-shot etcd bootstrap. Not idempotent on the wire; callers
    /// guard with `etcd_members` first.
    async fn bootstrap(&self, node: &str) -> Result<()>;

    /// Current etcd member names, empty when etcd has not been bootstrapped.
    async fn etcd_members(&self, node: &str) -> Result<Vec<String>>;

    /// Fetch the admin kubeconfig through the node.
    async fn kubeconfig(&self, node: &str) -> Result<String>;

    /// Graceful reset: cordon, drain, leave etcd, wipe, power down.
    async fn reset_node(&self, node: &str) -> Result<()>;
}

/// Production implementation shelling out to `talosctl`.
pub struct TalosctlClient {
    talosconfig_path: PathBuf,
    /// Keeps a client config written from memory alive for our lifetime.
    _scratch: Option<tempfile::NamedTempFile>,
}

impl TalosctlClient {
    pub fn from_path(talosconfig_path: PathBuf) -> Self {
        Self {
            talosconfig_path,
            _scratch: None,
        }
    }

    /// Operator path: the client config comes out of the credentials secret.
    pub fn from_yaml(talosconfig: &str) -> Result<Self> {
        let mut file =
            tempfile::NamedTempFile::new().context("failed to create talosconfig file")?;
        file.write_all(talosconfig.as_bytes())
            .context("failed to write talosconfig")?;
        file.flush().context("failed to flush talosconfig")?;
        Ok(Self {
            talosconfig_path: file.path().to_path_buf(),
            _scratch: Some(file),
        })
    }

    pub async fn check_talosctl_installed() -> Result<()> {
        crate::utils::command::check_tool_installed(
            "talosctl",
            &["version", "--client"],
            "https://www.talos.dev/latest/talos-guides/install/talosctl/",
        )
        .await
    }

    fn talosctl(&self, node: &str) -> CommandBuilder {
        CommandBuilder::new("talosctl")
            .args(["--nodes", node, "--endpoints", node, "--talosconfig"])
            .arg(&self.talosconfig_path)
    }
}

#[async_trait]
impl TalosApi for TalosctlClient {
    async fn probe(&self, node: &str) -> Result<()> {
        self.talosctl(node)
            .arg("version")
            .context(format!("Talos API on {} is not reachable", node))
            .run_silent()
            .await
    }

    async fn apply_configuration(
        &self,
        node: &str,
        machine_config: &str,
        insecure: bool,
    ) -> Result<()> {
        let mut file =
            tempfile::NamedTempFile::new().context("failed to create machine-config file")?;
        file.write_all(machine_config.as_bytes())
            .context("failed to write machine config")?;
        file.flush().context("failed to flush machine config")?;

        let mut builder = if insecure {
            // Maintenance mode has no PKI yet; the client config would be
            // rejected.
            CommandBuilder::new("talosctl").args(["--nodes", node, "apply-config", "--insecure"])
        } else {
            self.talosctl(node).arg("apply-config")
        };
        builder = builder.arg("--file").arg(file.path());

        builder
            .context(format!("failed to apply configuration to {}", node))
            .run_silent()
            .await
    }

    async fn bootstrap(&self, node: &str) -> Result<()> {
        self.talosctl(node)
            .arg("bootstrap")
            .context(format!("bootstrap failed on {}", node))
            .run_silent()
            .await
    }

    async fn etcd_members(&self, node: &str) -> Result<Vec<String>> {
        let output = self.talosctl(node).args(["etcd", "members"]).output().await?;

        if !output.success {
            // An uninitialised etcd is the expected pre-bootstrap answer.
            if output.stderr.contains("etcd is not initialized")
                || output.stderr.contains("no members")
            {
                return Ok(Vec::new());
            }
            anyhow::bail!("failed to list etcd members on {}: {}", node, output.stderr);
        }

        Ok(output
            .stdout
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().nth(1).map(str::to_string))
            .collect())
    }

    async fn kubeconfig(&self, node: &str) -> Result<String> {
        let dir = tempfile::tempdir().context("failed to create scratch directory")?;
        let path = dir.path().join("kubeconfig");

        self.talosctl(node)
            .arg("kubeconfig")
            .arg(&path)
            .arg("--force")
            .context(format!("failed to fetch kubeconfig from {}", node))
            .run_silent()
            .await?;

        tokio::fs::read_to_string(&path)
            .await
            .context("failed to read fetched kubeconfig")
    }

    async fn reset_node(&self, node: &str) -> Result<()> {
        self.talosctl(node)
            .args(["reset", "--graceful"])
            .context(format!("failed to reset {}", node))
            .run_silent()
            .await
    }
}

/// In-memory fake for engine tests.
#[cfg(test)]
pub struct FakeTalos {
    inner: std::sync::Mutex<FakeTalosState>,
}

#[cfg(test)]
#[derive(Default)]
struct FakeTalosState {
    pub applied: Vec<(String, bool)>,
    pub bootstrapped: bool,
    pub bootstrap_calls: u32,
    pub members: Vec<String>,
    pub reset_nodes: Vec<String>,
    pub unreachable: bool,
}

#[cfg(test)]
impl FakeTalos {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            inner: std::sync::Mutex::new(FakeTalosState::default()),
        })
    }

    pub fn bootstrap_calls(&self) -> u32 {
        self.inner.lock().unwrap().bootstrap_calls
    }

    pub fn applied_count(&self) -> usize {
        self.inner.lock().unwrap().applied.len()
    }

    pub fn reset_nodes(&self) -> Vec<String> {
        self.inner.lock().unwrap().reset_nodes.clone()
    }

    pub fn set_bootstrapped(&self, members: Vec<String>) {
        let mut state = self.inner.lock().unwrap();
        state.bootstrapped = true;
        state.members = members;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }
}

#[cfg(test)]
#[async_trait]
impl TalosApi for FakeTalos {
    async fn probe(&self, _node: &str) -> Result<()> {
        if self.inner.lock().unwrap().unreachable {
            anyhow::bail!("dial tcp: connection refused");
        }
        Ok(())
    }

    async fn apply_configuration(
        &self,
        node: &str,
        _machine_config: &str,
        insecure: bool,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.unreachable {
            anyhow::bail!("dial tcp: connection refused");
        }
        state.applied.push((node.to_string(), insecure));
        Ok(())
    }

    async fn bootstrap(&self, node: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.bootstrap_calls += 1;
        if state.bootstrapped {
            anyhow::bail!("etcd: cluster is already bootstrapped");
        }
        state.bootstrapped = true;
        state.members = vec![node.to_string()];
        Ok(())
    }

    async fn etcd_members(&self, _node: &str) -> Result<Vec<String>> {
        let state = self.inner.lock().unwrap();
        if state.unreachable {
            anyhow::bail!("dial tcp: connection refused");
        }
        Ok(state.members.clone())
    }

    async fn kubeconfig(&self, _node: &str) -> Result<String> {
        Ok(concat!(
            "apiVersion: v1\n",
            "kind: Config\n",
            "clusters:\n",
            "- cluster:\n",
            "    server: https://10.0.0.2:6443\n",
            "  name: test\n",
            "contexts:\n",
            "- context: {cluster: test, user: admin@test}\n",
            "  name: admin@test\n",
            "current-context: admin@test\n",
            "users:\n",
            "- name: admin@test\n",
            "  user: {}\n",
        )
        .to_string())
    }

    async fn reset_node(&self, node: &str) -> Result<()> {
        self.inner.lock().unwrap().reset_nodes.push(node.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_bootstrap_is_one_shot() {
        let talos = FakeTalos::new();
        assert!(talos.etcd_members("1.2.3.4").await.unwrap().is_empty());

        talos.bootstrap("1.2.3.4").await.unwrap();
        assert_eq!(talos.etcd_members("1.2.3.4").await.unwrap().len(), 1);

        let err = talos.bootstrap("1.2.3.4").await.unwrap_err();
        assert!(err.to_string().contains("already bootstrapped"));
        assert_eq!(talos.bootstrap_calls(), 2);
    }

    #[tokio::test]
    async fn test_fake_unreachable_is_transient() {
        let talos = FakeTalos::new();
        talos.set_unreachable(true);
        let err = talos.probe("1.2.3.4").await.unwrap_err();
        assert!(crate::retry::is_transient(&err));
    }
}
