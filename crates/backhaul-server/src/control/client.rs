//! Control-plane client.
//!
//! The control plane owns customers, projects and app-projects. The relay
//! only ever reads the full active sets, authenticating with OAuth2 client
//! credentials when an identity provider is configured.

use crate::config::ControlPlaneConfig;
use backhaul_core::{AppProject, BoxFuture, Project, RelayError, RelayResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Source of the current tenant routing data.
pub trait ControlPlane: Send + Sync {
    fn fetch_active_projects(&self) -> BoxFuture<'_, RelayResult<Vec<Project>>>;
    fn fetch_active_app_projects(&self) -> BoxFuture<'_, RelayResult<Vec<AppProject>>>;
}

/// Envelope every control-plane API response is wrapped in.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse<T> {
    data: Option<T>,
    #[serde(default)]
    status: bool,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    fn into_data(self, endpoint: &str) -> RelayResult<T> {
        if !self.status {
            return Err(RelayError::ControlPlane(format!(
                "{endpoint}: {} (code {})",
                self.error_message.as_deref().unwrap_or("request failed"),
                self.error_code.unwrap_or_default()
            )));
        }
        self.data
            .ok_or_else(|| RelayError::ControlPlane(format!("{endpoint}: response has no data")))
    }
}

#[derive(Debug, Deserialize)]
struct Discovery {
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// HTTP client for the control-plane API.
pub struct ApiClient {
    config: ControlPlaneConfig,
    http_client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl ApiClient {
    pub fn new(config: ControlPlaneConfig) -> RelayResult<Self> {
        if config.api_url.trim().is_empty() {
            return Err(RelayError::Config("control_plane.api_url is required".into()));
        }
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayError::ControlPlane(format!("http client: {e}")))?;
        Ok(Self {
            config,
            http_client,
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Current bearer token, or `None` when no identity provider is set.
    async fn bearer_token(&self) -> RelayResult<Option<String>> {
        if self.config.identity_url.trim().is_empty() {
            return Ok(None);
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.value.clone()));
            }
        }

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.config.identity_url.trim_end_matches('/')
        );
        let discovery: Discovery = self.get_json(&discovery_url, None).await?;

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", self.config.scope.as_str()),
        ];
        let response = self
            .http_client
            .post(&discovery.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| RelayError::ControlPlane(format!("token request: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::ControlPlane(format!(
                "token request returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RelayError::ControlPlane(format!("token response: {e}")))?;

        // Renew a little early so a request never carries an expired token.
        let lifetime = token.expires_in.unwrap_or(300).saturating_sub(30);
        debug!(lifetime_secs = lifetime, "access token acquired");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(Some(token.access_token))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> RelayResult<T> {
        let mut request = self.http_client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::ControlPlane(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::ControlPlane(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RelayError::ControlPlane(format!("{url}: {e}")))
    }

    async fn fetch_all<T: DeserializeOwned>(&self, path: &str) -> RelayResult<Vec<T>> {
        let token = self.bearer_token().await?;
        let url = self.endpoint(path);
        let response: ApiResponse<Vec<T>> = self.get_json(&url, token.as_deref()).await?;
        let data = response.into_data(path)?;
        info!(endpoint = %path, count = data.len(), "fetched from control plane");
        Ok(data)
    }
}

impl ControlPlane for ApiClient {
    fn fetch_active_projects(&self) -> BoxFuture<'_, RelayResult<Vec<Project>>> {
        Box::pin(self.fetch_all("Project/All"))
    }

    fn fetch_active_app_projects(&self) -> BoxFuture<'_, RelayResult<Vec<AppProject>>> {
        Box::pin(self.fetch_all("AppProject/All"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: &str) -> ControlPlaneConfig {
        ControlPlaneConfig {
            api_url: api_url.to_string(),
            ..ControlPlaneConfig::default()
        }
    }

    #[test]
    fn test_api_url_is_required() {
        assert!(matches!(
            ApiClient::new(config("  ")),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let client = ApiClient::new(config("https://api.example.com/")).unwrap();
        assert_eq!(client.endpoint("Project/All"), "https://api.example.com/Project/All");
    }

    #[tokio::test]
    async fn test_no_identity_means_no_token() {
        let client = ApiClient::new(config("https://api.example.com")).unwrap();
        assert!(client.bearer_token().await.unwrap().is_none());
    }

    #[test]
    fn test_api_response_success_unwraps_data() {
        let json = r#"{
            "data": [{
                "id": 4,
                "viewId": "6f1c1bb0-8e57-4d5c-9d0e-2a9d1a3f2f10",
                "customerId": 1,
                "domainType": "Custom",
                "domain": "shop.io",
                "internalUrl": "http://localhost:8000",
                "state": "Active",
                "customer": {
                    "id": 1,
                    "viewId": "0a3c7a5e-21a6-4b8e-a7a4-4b0f3b9f6f11",
                    "username": "erin"
                }
            }],
            "status": true,
            "errorMessage": null,
            "errorCode": 0
        }"#;
        let response: ApiResponse<Vec<Project>> = serde_json::from_str(json).unwrap();
        let projects = response.into_data("Project/All").unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].customer.username, "erin");
    }

    #[test]
    fn test_api_response_failure_is_control_plane_error() {
        let json = r#"{"data": null, "status": false, "errorMessage": "denied", "errorCode": 403}"#;
        let response: ApiResponse<Vec<Project>> = serde_json::from_str(json).unwrap();
        let err = response.into_data("Project/All").unwrap_err();
        assert!(err.to_string().contains("denied"));

        let json = r#"{"status": true}"#;
        let response: ApiResponse<Vec<Project>> = serde_json::from_str(json).unwrap();
        assert!(response.into_data("Project/All").is_err());
    }
}
