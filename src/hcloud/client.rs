/// Hetzner Cloud API transport
use anyhow::{Context, Result};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::models::{Action, ActionResponse, ErrorResponse};

const HCLOUD_API_BASE: &str = "https://api.hetzner.cloud/v1";

/// Typed API error. The code is the provider's machine-readable error class;
/// callers branch on it instead of matching message text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("hcloud API error {code}: {message}")]
pub struct HcloudError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl HcloudError {
    /// Name/uniqueness conflict on create.
    pub fn is_conflict(&self) -> bool {
        self.code == "uniqueness_error" || self.status == StatusCode::CONFLICT.as_u16()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "not_found" || self.status == StatusCode::NOT_FOUND.as_u16()
    }

    /// Deletion blocked because another resource still references this one.
    pub fn is_resource_in_use(&self) -> bool {
        self.code == "resource_in_use"
    }

    pub fn is_rate_limit(&self) -> bool {
        self.code == "rate_limit_exceeded"
            || self.status == StatusCode::TOO_MANY_REQUESTS.as_u16()
    }
}

/// The typed API error inside an anyhow chain, if any.
pub fn api_error(err: &anyhow::Error) -> Option<&HcloudError> {
    err.downcast_ref::<HcloudError>()
}

/// Hetzner Cloud REST client. Cheap to clone; holds one connection pool.
#[derive(Clone)]
pub struct HcloudClient {
    client: Client,
    api_base: String,
}

impl HcloudClient {
    /// Build a client carrying the bearer token on every request.
    pub fn new(api_token: &str) -> Result<Self> {
        Self::with_base(api_token, HCLOUD_API_BASE)
    }

    /// Build a client against a non-default API base; test seam.
    pub fn with_base(api_token: &str, api_base: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", api_token))
            .context("invalid API token format")?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}/{}", self.api_base, endpoint);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", endpoint))?;

        Self::handle_response(response).await
    }

    pub async fn post<T: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        let url = format!("{}/{}", self.api_base, endpoint);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", endpoint))?;

        Self::handle_response(response).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<()> {
        let url = format!("{}/{}", self.api_base, endpoint);
        debug!("DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", endpoint))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await.into())
        }
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if response.status().is_success() {
            response
                .json::<T>()
                .await
                .context("failed to parse API response")
        } else {
            Err(Self::error_from(response).await.into())
        }
    }

    /// Build the typed error from a failed response, falling back to the raw
    /// body when the envelope does not parse.
    async fn error_from(response: reqwest::Response) -> HcloudError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(envelope) => HcloudError {
                status,
                code: envelope.error.code,
                message: envelope.error.message,
            },
            Err(_) => HcloudError {
                status,
                code: "unknown".to_string(),
                message: body,
            },
        }
    }

    /// Poll a provider-side action to completion.
    pub async fn wait_for_action(&self, action_id: u64, timeout_secs: u64) -> Result<Action> {
        use tokio::time::{sleep, Duration};

        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        loop {
            let response: ActionResponse = self.get(&format!("actions/{}", action_id)).await?;
            let action = response.action;

            match action.status.as_str() {
                "success" => return Ok(action),
                "error" => {
                    let error_msg = action
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| "unknown error".to_string());
                    anyhow::bail!("action {} failed: {}", action_id, error_msg);
                }
                "running" => {
                    if start.elapsed() > timeout {
                        anyhow::bail!(
                            "action {} timed out after {} seconds",
                            action_id,
                            timeout_secs
                        );
                    }
                    debug!("action {} progress: {}%", action_id, action.progress);
                    sleep(Duration::from_secs(2)).await;
                }
                status => {
                    warn!("unknown action status: {}", status);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        assert!(HcloudClient::new("test-token").is_ok());
    }

    #[test]
    fn test_error_classification() {
        let conflict = HcloudError {
            status: 409,
            code: "uniqueness_error".to_string(),
            message: "server name is already used".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());

        let in_use = HcloudError {
            status: 423,
            code: "resource_in_use".to_string(),
            message: "firewall is still applied".to_string(),
        };
        assert!(in_use.is_resource_in_use());
    }

    #[test]
    fn test_api_error_downcast() {
        let err: anyhow::Error = HcloudError {
            status: 404,
            code: "not_found".to_string(),
            message: "no such server".to_string(),
        }
        .into();
        let wrapped = err.context("fetching server");
        assert!(api_error(&wrapped).unwrap().is_not_found());
    }
}
