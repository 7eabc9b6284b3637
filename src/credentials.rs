/// Credential bundles flowing through the reconcile context
///
/// Credentials are loaded once per reconcile (environment in CLI mode, a
/// cluster secret in operator mode) and passed by value; there is no global
/// credential state.
use std::collections::BTreeMap;

use anyhow::{Context, Result};

pub const KEY_HCLOUD_TOKEN: &str = "hcloud-token";
pub const KEY_TALOS_SECRETS: &str = "talos-secrets";
pub const KEY_TALOS_CONFIG: &str = "talos-config";
pub const KEY_CLOUDFLARE_API_TOKEN: &str = "cloudflare-api-token";

/// The recognised keys of the cluster credentials secret.
#[derive(Clone)]
pub struct Credentials {
    pub hcloud_token: String,
    /// Serialised Talos PKI bundle (YAML), present after first bootstrap.
    pub talos_secrets: Option<String>,
    /// Admin client config for Talos.
    pub talos_config: Option<String>,
    pub cloudflare_api_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Token material stays out of logs.
        f.debug_struct("Credentials")
            .field("hcloud_token", &"<redacted>")
            .field("talos_secrets", &self.talos_secrets.is_some())
            .field("talos_config", &self.talos_config.is_some())
            .field("cloudflare_api_token", &self.cloudflare_api_token.is_some())
            .finish()
    }
}

impl Credentials {
    /// CLI path: cloud token from `HCLOUD_TOKEN`, optional DNS token from
    /// `CLOUDFLARE_API_TOKEN`. Talos material is file-based in CLI mode and
    /// joins the bundle when the caller loads it.
    pub fn from_env() -> Result<Self> {
        let hcloud_token = std::env::var("HCLOUD_TOKEN").context(
            "Hetzner Cloud API token not found. Set the HCLOUD_TOKEN environment variable",
        )?;
        Ok(Self {
            hcloud_token,
            talos_secrets: None,
            talos_config: None,
            cloudflare_api_token: std::env::var("CLOUDFLARE_API_TOKEN").ok(),
        })
    }

    /// Operator path: decode the referenced secret's data map.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let read = |key: &str| -> Option<String> {
            data.get(key)
                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
        };

        let hcloud_token = read(KEY_HCLOUD_TOKEN)
            .with_context(|| format!("credentials secret is missing key '{}'", KEY_HCLOUD_TOKEN))?;

        Ok(Self {
            hcloud_token,
            talos_secrets: read(KEY_TALOS_SECRETS),
            talos_config: read(KEY_TALOS_CONFIG),
            cloudflare_api_token: read(KEY_CLOUDFLARE_API_TOKEN),
        })
    }
}

/// Backup object-storage credentials, kept in a separate secret referenced by
/// `backup.s3SecretRef`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
}

impl S3Credentials {
    /// All five keys are required; a partially-filled secret is treated as
    /// absent by the caller.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let read = |key: &str| -> Result<String> {
            data.get(key)
                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                .with_context(|| format!("backup secret is missing key '{}'", key))
        };

        Ok(Self {
            access_key: read("access-key")?,
            secret_key: read("secret-key")?,
            endpoint: read("endpoint")?,
            bucket: read("bucket")?,
            region: read("region")?,
        })
    }
}
