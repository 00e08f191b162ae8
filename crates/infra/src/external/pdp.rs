//! Policy Decision Point (PDP) client.
//!
//! The PDP owns field-level access policy. The portal only needs two calls:
//! registering policy metadata for a newly created schema, and granting an
//! application access to the fields it selected (the allow list).
//!
//! Every non-200 response, transport failure or unparseable body is a
//! [`PdpError`]; callers treat all of them as transient.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use portal_core::{ApplicationId, SchemaId};

/// A single field an application wants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedFieldRecord {
    pub field_name: String,
    pub schema_id: SchemaId,
}

impl SelectedFieldRecord {
    pub fn new(field_name: impl Into<String>, schema_id: SchemaId) -> Self {
        Self {
            field_name: field_name.into(),
            schema_id,
        }
    }
}

/// How long an allow-list grant stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GrantDuration {
    #[default]
    #[serde(rename = "30d")]
    OneMonth,
    #[serde(rename = "365d")]
    OneYear,
}

impl GrantDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantDuration::OneMonth => "30d",
            GrantDuration::OneYear => "365d",
        }
    }
}

impl FromStr for GrantDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "30d" => Ok(GrantDuration::OneMonth),
            "365d" => Ok(GrantDuration::OneYear),
            other => Err(format!("unknown grant duration: {other}")),
        }
    }
}

impl std::fmt::Display for GrantDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadataCreateRequest {
    pub schema_id: SchemaId,
    pub sdl: String,
}

/// One policy record created by the PDP for a schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadataRecord {
    pub id: String,
    pub schema_id: String,
    pub field_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub access_control_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyMetadataCreateResponse {
    #[serde(default)]
    pub records: Vec<PolicyMetadataRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListUpdateRequest {
    pub application_id: ApplicationId,
    pub records: Vec<SelectedFieldRecord>,
    pub grant_duration: GrantDuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListUpdateResponseRecord {
    pub field_name: String,
    pub schema_id: String,
    pub expires_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllowListUpdateResponse {
    #[serde(default)]
    pub records: Vec<AllowListUpdateResponseRecord>,
}

/// PDP call failure.
#[derive(Debug, thiserror::Error)]
pub enum PdpError {
    #[error("failed to send request to PDP: {0}")]
    Transport(String),
    #[error("PDP returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse PDP response: {0}")]
    Decode(String),
    #[error("failed to build PDP client: {0}")]
    Request(String),
}

/// Remote operations the job handlers and the saga path depend on.
#[async_trait]
pub trait PdpClient: Send + Sync {
    /// Register policy metadata for every field declared in `sdl`.
    async fn create_policy_metadata(
        &self,
        schema_id: SchemaId,
        sdl: &str,
    ) -> Result<PolicyMetadataCreateResponse, PdpError>;

    /// Grant `request.application_id` access to the listed fields.
    async fn update_allow_list(
        &self,
        request: &AllowListUpdateRequest,
    ) -> Result<AllowListUpdateResponse, PdpError>;
}

/// Connection settings for [`HttpPdpClient`].
#[derive(Debug, Clone)]
pub struct PdpClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl PdpClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP implementation of [`PdpClient`].
///
/// Requests carry the `apikey` header; the timeout applies to the whole
/// request so a hung PDP cannot stall a dispatcher tick indefinitely.
#[derive(Debug, Clone)]
pub struct HttpPdpClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPdpClient {
    pub fn new(config: PdpClientConfig) -> Result<Self, PdpError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PdpError::Request(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    /// `GET /health`; any non-200 status is an error.
    pub async fn health_check(&self) -> Result<(), PdpError> {
        let res = self
            .http
            .get(format!("{}/health", self.base_url))
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| PdpError::Transport(e.to_string()))?;

        let status = res.status();
        if status != reqwest::StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            return Err(PdpError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, PdpError>
    where
        B: Serialize + ?Sized + Sync,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "sending PDP request");

        let res = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| PdpError::Transport(e.to_string()))?;

        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| PdpError::Transport(format!("failed to read response body: {e}")))?;

        if status != reqwest::StatusCode::OK {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            error!(url = %url, status = status.as_u16(), body = %body, "PDP returned error");
            return Err(PdpError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| PdpError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PdpClient for HttpPdpClient {
    async fn create_policy_metadata(
        &self,
        schema_id: SchemaId,
        sdl: &str,
    ) -> Result<PolicyMetadataCreateResponse, PdpError> {
        let request = PolicyMetadataCreateRequest {
            schema_id,
            sdl: sdl.to_string(),
        };
        let response: PolicyMetadataCreateResponse =
            self.post_json("/api/v1/policy/metadata", &request).await?;

        info!(
            schema_id = %schema_id,
            records_created = response.records.len(),
            "created policy metadata in PDP"
        );
        Ok(response)
    }

    async fn update_allow_list(
        &self,
        request: &AllowListUpdateRequest,
    ) -> Result<AllowListUpdateResponse, PdpError> {
        let response: AllowListUpdateResponse = self
            .post_json("/api/v1/policy/update-allowlist", request)
            .await?;

        info!(
            application_id = %request.application_id,
            records_updated = response.records.len(),
            "updated allow list in PDP"
        );
        Ok(response)
    }
}
