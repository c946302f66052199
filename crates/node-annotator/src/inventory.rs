//! Cloud inventory client
//!
//! Read-only lookups of GCE instances through the Compute Engine REST API.
//! Authentication is delegated to a [`TokenSource`]; on GCE the default
//! source is the metadata server's service-account token endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use node_annotator_common::{Error, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Default Compute Engine API base URL
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

/// Default GCE metadata server base URL
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal/computeMetadata/v1";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// Refresh cached tokens this long before they expire
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// The parts of a Compute instance the annotator cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Provider-assigned numeric id
    pub id: u64,
    /// Instance name
    pub name: String,
    /// Lifecycle status (RUNNING, TERMINATED, ...)
    pub status: Option<String>,
}

/// Trait abstracting instance lookups
///
/// Allows mocking the Compute API in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceInventory: Send + Sync {
    /// Fetch the instance `name` in `project`/`zone`
    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<InstanceRecord>;
}

/// Source of OAuth2 access tokens for the Compute API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a currently valid access token
    async fn token(&self) -> Result<String>;
}

/// A fixed token, for running outside GCE with a pre-issued credential
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Wrap a pre-issued access token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Fetches the default service account's token from the metadata server
pub struct MetadataTokenSource {
    http: reqwest::Client,
    endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataTokenSource {
    /// Create a token source against the given metadata server base URL
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build metadata client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let url = format!(
            "{}/instance/service-accounts/default/token",
            self.endpoint.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::http(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http(format!(
                "token request returned {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::http(format!("invalid token response: {}", e)))
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_SLACK < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        debug!(expires_in = fresh.expires_in, "Fetched access token from metadata server");
        let value = fresh.access_token.clone();
        *cached = Some(CachedToken {
            value: fresh.access_token,
            expires_at: Instant::now() + Duration::from_secs(fresh.expires_in),
        });
        Ok(value)
    }
}

/// Compute API representation; `id` is a uint64 encoded as a JSON string
#[derive(Debug, Deserialize)]
struct ComputeInstance {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
}

/// Compute Engine backed [`InstanceInventory`]
pub struct GceInventory {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
}

impl GceInventory {
    /// Create an inventory client against `endpoint` using `tokens` for auth
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("creating GCE API client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            tokens,
        })
    }
}

#[async_trait]
impl InstanceInventory for GceInventory {
    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<InstanceRecord> {
        let lookup_err = |msg: String| Error::lookup(project, zone, name, msg);

        let token = self.tokens.token().await.map_err(|e| lookup_err(e.to_string()))?;
        let url = instance_url(&self.endpoint, project, zone, name);

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| lookup_err(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| lookup_err(e.to_string()))?;
        if !status.is_success() {
            return Err(lookup_err(format!("HTTP {}: {}", status, body)));
        }

        parse_instance(&body).map_err(lookup_err)
    }
}

/// Build the Compute API URL for one instance
fn instance_url(endpoint: &str, project: &str, zone: &str, name: &str) -> String {
    format!(
        "{}/projects/{}/zones/{}/instances/{}",
        endpoint.trim_end_matches('/'),
        project,
        zone,
        name
    )
}

/// Decode an instance resource body
fn parse_instance(body: &str) -> std::result::Result<InstanceRecord, String> {
    let raw: ComputeInstance =
        serde_json::from_str(body).map_err(|e| format!("invalid instance resource: {}", e))?;
    let id = raw
        .id
        .parse::<u64>()
        .map_err(|e| format!("invalid instance id {:?}: {}", raw.id, e))?;
    Ok(InstanceRecord {
        id,
        name: raw.name,
        status: raw.status,
    })
}
