/// Persistent Talos secrets bundle
///
/// The PKI root material is generated exactly once per cluster and reused
/// for every subsequent config generation; losing it means losing admin
/// access. It survives operator restarts inside the credentials secret and
/// CLI runs as `secrets.yaml` on disk.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::utils::command::CommandBuilder;

#[derive(Clone)]
pub struct SecretsBundle {
    yaml: String,
}

impl SecretsBundle {
    /// Wrap an existing serialised bundle, verifying it parses.
    pub fn from_yaml(yaml: String) -> Result<Self> {
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&yaml).context("talos secrets bundle is not valid YAML")?;
        if parsed.get("secrets").is_none() && parsed.get("certs").is_none() {
            anyhow::bail!("talos secrets bundle is missing key material");
        }
        Ok(Self { yaml })
    }

    /// Load the bundle from `path`, generating it first if absent.
    /// Returns the bundle and whether it was newly generated.
    pub async fn load_or_generate(path: &Path) -> Result<(Self, bool)> {
        if path.exists() {
            let yaml = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            return Ok((Self::from_yaml(yaml)?, false));
        }

        info!("generating Talos secrets bundle");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create output directory")?;
        }

        CommandBuilder::new("talosctl")
            .args(["gen", "secrets", "--output-file"])
            .arg(path)
            .context("failed to generate Talos secrets")
            .run_silent()
            .await?;
        restrict_permissions(path).await?;

        let yaml = tokio::fs::read_to_string(path)
            .await
            .context("failed to read generated secrets")?;
        Ok((Self::from_yaml(yaml)?, true))
    }

    pub fn yaml(&self) -> &str {
        &self.yaml
    }

    /// Persist at `path` with owner-only permissions.
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create output directory")?;
        }
        tokio::fs::write(path, &self.yaml)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        restrict_permissions(path).await
    }

    /// Materialise the bundle into `dir` for tools that want a file.
    pub async fn materialize(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("secrets.yaml");
        self.write(&path).await?;
        Ok(path)
    }
}

/// chmod 0600; secret-bearing files are never group/world readable.
pub async fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(path, perms)
            .await
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }
    Ok(())
}
