/// Talos snapshot production
///
/// Locates a bootable Talos snapshot for `(version, schematic, arch)` or
/// builds one: a disposable server is rescue-booted, the factory image is
/// written straight onto its disk over SSH, and the disk is snapshotted.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::ProvisionError;
use crate::infra::{CreateServerRequest, InfrastructureManager, LabelSelector};
use crate::naming::{self, MANAGED_BY};
use crate::observe::{Event, Observer};
use crate::reconcile::ssh_key::generate_ed25519_keypair;
use crate::reconcile::{owner_labels, roles, LABEL_CLUSTER, LABEL_MANAGED_BY};
use crate::utils::command::CommandBuilder;
use crate::utils::polling::PollingConfig;

pub const LABEL_OS: &str = "os";
pub const LABEL_TALOS_VERSION: &str = "talos_version";
pub const LABEL_SCHEMATIC_ID: &str = "schematic_id";
pub const LABEL_ARCH: &str = "arch";

/// Rescue image used while writing the Talos disk.
const BUILDER_BASE_IMAGE: &str = "ubuntu-24.04";

/// Architecture of a server type: the `cax` line is arm64, the rest x86.
pub fn arch_for_server_type(server_type: &str) -> &'static str {
    if server_type.to_ascii_lowercase().starts_with("cax") {
        "arm64"
    } else {
        "amd64"
    }
}

fn builder_server_type(arch: &str) -> &'static str {
    if arch == "arm64" {
        "cax11"
    } else {
        "cx23"
    }
}

/// Selector finding a usable snapshot regardless of which cluster built it.
fn snapshot_selector(talos_version: &str, schematic_id: &str, arch: &str) -> LabelSelector {
    LabelSelector::new()
        .with(LABEL_MANAGED_BY, MANAGED_BY)
        .with(LABEL_OS, "talos")
        .with(LABEL_TALOS_VERSION, talos_version)
        .with(LABEL_SCHEMATIC_ID, schematic_id)
        .with(LABEL_ARCH, arch)
}

fn factory_url(schematic_id: &str, talos_version: &str, arch: &str) -> String {
    format!(
        "https://factory.talos.dev/image/{}/{}/hcloud-{}.raw.xz",
        schematic_id, talos_version, arch
    )
}

pub struct ImageBuilder {
    infra: Arc<dyn InfrastructureManager>,
    build_timeout: Duration,
}

impl ImageBuilder {
    pub fn new(infra: Arc<dyn InfrastructureManager>, build_timeout: Duration) -> Self {
        Self {
            infra,
            build_timeout,
        }
    }

    /// Find or build the snapshot; returns its ID. Safe to race: concurrent
    /// invocations converge on one snapshot via the label lookup.
    pub async fn ensure_snapshot(
        &self,
        config: &Config,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<u64> {
        let arch = arch_for_server_type(&config.control_planes.server_type);
        let selector = snapshot_selector(&config.talos.version, &config.talos.schematic_id, arch);

        if let Some(existing) = self.lookup(&selector).await? {
            info!(
                "found existing Talos {} snapshot (ID {})",
                config.talos.version, existing
            );
            return Ok(existing);
        }

        observer.event(Event::info(format!(
            "building Talos {} ({}) snapshot",
            config.talos.version, arch
        )));

        let build = self.build(config, arch, cancel);
        let built = match tokio::time::timeout(self.build_timeout, build).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::SnapshotBuildTimeout(self.build_timeout).into()),
        };

        // The disposable server and key must not outlive the build, success
        // or not.
        self.cleanup_builder(config).await;

        let built = built?;

        // If a concurrent build finished first, converge on the older
        // snapshot and drop ours.
        let snapshots = self.infra.list_snapshots(&selector).await?;
        if let Some(first) = snapshots.first() {
            if first.id != built {
                warn!(
                    "concurrent snapshot build won (ID {}), discarding our {}",
                    first.id, built
                );
                let _ = self.infra.delete_snapshot(built).await;
                return Ok(first.id);
            }
        }
        Ok(built)
    }

    /// Snapshot lookup without building; the compute phase postcondition
    /// uses the same predicate the build path starts with.
    pub async fn find_snapshot(&self, config: &Config) -> Result<Option<u64>> {
        let arch = arch_for_server_type(&config.control_planes.server_type);
        let selector = snapshot_selector(&config.talos.version, &config.talos.schematic_id, arch);
        self.lookup(&selector).await
    }

    async fn lookup(&self, selector: &LabelSelector) -> Result<Option<u64>> {
        let snapshots = self.infra.list_snapshots(selector).await?;
        Ok(snapshots
            .iter()
            .find(|img| img.status == "available")
            .map(|img| img.id))
    }

    async fn build(
        &self,
        config: &Config,
        arch: &'static str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let cluster = &config.cluster_name;
        let builder_name = naming::image_builder(cluster);

        // Fresh ephemeral keypair per build; a stale uploaded key has an
        // unknown private half and gets replaced.
        let (public_key, private_key) = generate_ed25519_keypair();
        if let Some(stale) = self.infra.get_ssh_key_by_name(&builder_name).await? {
            self.infra.delete_ssh_key(stale.id).await?;
        }
        let ssh_key = self
            .infra
            .create_ssh_key(
                &builder_name,
                &public_key,
                owner_labels(cluster, roles::IMAGE_BUILDER),
            )
            .await?;

        let server = self
            .infra
            .create_server(CreateServerRequest {
                name: builder_name.clone(),
                server_type: builder_server_type(arch).to_string(),
                location: config.location.clone(),
                image: BUILDER_BASE_IMAGE.to_string(),
                ssh_key_ids: vec![ssh_key.id],
                user_data: None,
                network: None,
                firewall_ids: Vec::new(),
                placement_group_id: None,
                labels: owner_labels(cluster, roles::IMAGE_BUILDER),
            })
            .await
            .context("failed to create image-builder server")?;

        let public_ip = server
            .public_ip()
            .context("image-builder server has no public IP")?;

        info!("image builder {} up at {}", builder_name, public_ip);
        self.infra.enable_rescue(server.id, &[ssh_key.id]).await?;
        self.infra.reboot_server(server.id).await?;

        let key_file = write_key_file(&private_key)?;
        let key_path = key_file.path().to_path_buf();

        PollingConfig::new(
            Duration::from_secs(300),
            Duration::from_secs(5),
            format!("waiting for rescue system on {}", public_ip),
        )
        .poll_until(cancel, || {
            let key_path = key_path.clone();
            let public_ip = public_ip.clone();
            async move {
                Ok(ssh_command(&key_path, &public_ip, "true")
                    .output()
                    .await
                    .map(|out| out.success)
                    .unwrap_or(false))
            }
        })
        .await?;

        let url = factory_url(&config.talos.schematic_id, &config.talos.version, arch);
        info!("writing Talos image from {}", url);
        let script = format!(
            "set -euo pipefail; wget -qO- '{}' | xz -d | dd of=/dev/sda bs=4M conv=fsync && sync",
            url
        );
        ssh_command(&key_path, &public_ip, &script)
            .context("failed to write Talos image to disk")
            .run_silent()
            .await?;

        self.infra.shutdown_server(server.id).await?;

        let mut labels = owner_labels(cluster, roles::SNAPSHOT);
        labels.insert(LABEL_OS.to_string(), "talos".to_string());
        labels.insert(
            LABEL_TALOS_VERSION.to_string(),
            config.talos.version.clone(),
        );
        labels.insert(
            LABEL_SCHEMATIC_ID.to_string(),
            config.talos.schematic_id.clone(),
        );
        labels.insert(LABEL_ARCH.to_string(), arch.to_string());

        let snapshot = self
            .infra
            .create_snapshot(
                server.id,
                &naming::snapshot(&config.talos.version, arch),
                labels,
            )
            .await?;

        info!("Talos snapshot created (ID {})", snapshot.id);
        Ok(snapshot.id)
    }

    /// Best-effort removal of the disposable server and its key.
    async fn cleanup_builder(&self, config: &Config) {
        let builder_name = naming::image_builder(&config.cluster_name);
        if let Ok(Some(server)) = self.infra.get_server_by_name(&builder_name).await {
            if let Err(e) = self.infra.delete_server(server.id).await {
                warn!("could not delete image builder {}: {:#}", builder_name, e);
            }
        }
        if let Ok(Some(key)) = self.infra.get_ssh_key_by_name(&builder_name).await {
            if let Err(e) = self.infra.delete_ssh_key(key.id).await {
                warn!("could not delete image-builder key {}: {:#}", builder_name, e);
            }
        }
    }
}

fn write_key_file(private_key: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    // NamedTempFile is created 0600, which ssh insists on.
    let mut file = tempfile::NamedTempFile::new().context("failed to create key file")?;
    file.write_all(private_key.as_bytes())
        .context("failed to write key file")?;
    file.flush().context("failed to flush key file")?;
    Ok(file)
}

fn ssh_command(key_path: &std::path::Path, host: &str, script: &str) -> CommandBuilder {
    CommandBuilder::new("ssh")
        .arg("-i")
        .arg(key_path)
        .args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
        ])
        .arg(format!("root@{}", host))
        .arg(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::infra::FakeInfrastructure;
    use crate::observe::RecordingObserver;

    #[test]
    fn test_arch_mapping() {
        assert_eq!(arch_for_server_type("cx23"), "amd64");
        assert_eq!(arch_for_server_type("cpx31"), "amd64");
        assert_eq!(arch_for_server_type("cax11"), "arm64");
        assert_eq!(arch_for_server_type("CAX21"), "arm64");
    }

    #[test]
    fn test_factory_url() {
        assert_eq!(
            factory_url("abc123", "v1.10.2", "amd64"),
            "https://factory.talos.dev/image/abc123/v1.10.2/hcloud-amd64.raw.xz"
        );
    }

    #[tokio::test]
    async fn test_existing_snapshot_short_circuits() {
        let fake = Arc::new(FakeInfrastructure::new());
        let config = test_config("test");
        let arch = "amd64";

        // Seed a snapshot the way a previous build labelled it.
        let seed_server = fake.seed_server(
            "seed",
            "192.0.2.1",
            owner_labels("test", roles::IMAGE_BUILDER),
        );
        let mut labels = owner_labels("test", roles::SNAPSHOT);
        labels.insert(LABEL_OS.to_string(), "talos".to_string());
        labels.insert(LABEL_TALOS_VERSION.to_string(), config.talos.version.clone());
        labels.insert(LABEL_SCHEMATIC_ID.to_string(), config.talos.schematic_id.clone());
        labels.insert(LABEL_ARCH.to_string(), arch.to_string());
        let snapshot = fake
            .create_snapshot(seed_server, "talos", labels)
            .await
            .unwrap();
        fake.delete_server(seed_server).await.unwrap();

        let builder = ImageBuilder::new(fake.clone(), Duration::from_secs(60));
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let cancel = CancellationToken::new();

        let found = builder
            .ensure_snapshot(&config, &cancel, &observer)
            .await
            .unwrap();
        assert_eq!(found, snapshot.id);
        // No builder server was created.
        assert_eq!(fake.server_count(), 0);
    }

    #[tokio::test]
    async fn test_lookup_ignores_other_versions() {
        let fake = Arc::new(FakeInfrastructure::new());
        let config = test_config("test");

        let seed_server = fake.seed_server(
            "seed",
            "192.0.2.1",
            owner_labels("test", roles::IMAGE_BUILDER),
        );
        let mut labels = owner_labels("test", roles::SNAPSHOT);
        labels.insert(LABEL_OS.to_string(), "talos".to_string());
        labels.insert(LABEL_TALOS_VERSION.to_string(), "v1.9.0".to_string());
        labels.insert(LABEL_SCHEMATIC_ID.to_string(), config.talos.schematic_id.clone());
        labels.insert(LABEL_ARCH.to_string(), "amd64".to_string());
        fake.create_snapshot(seed_server, "talos", labels)
            .await
            .unwrap();

        let builder = ImageBuilder::new(fake, Duration::from_secs(60));
        let selector =
            snapshot_selector(&config.talos.version, &config.talos.schematic_id, "amd64");
        assert!(builder.lookup(&selector).await.unwrap().is_none());
    }
}
