//! Flux (Black Forest Labs) generation client.

use crate::error::{FluxViewError, Result};
use crate::image::backend::GenerationBackend;
use crate::image::types::{GenerationRequest, JobHandle, JobStatus};
use crate::store::credential::Credential;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API host.
pub const DEFAULT_BASE_URL: &str = "https://api.bfl.ml";

/// Flux model endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FluxEngine {
    /// Flux Pro 1.1 Ultra, supports raw mode.
    #[default]
    FluxPro11Ultra,
    /// Flux Pro 1.1.
    FluxPro11,
    /// Flux Pro.
    FluxPro,
    /// Flux Dev.
    FluxDev,
    /// Any other endpoint name under `/v1/`.
    Custom(String),
}

impl FluxEngine {
    /// Returns the endpoint path segment.
    pub fn as_str(&self) -> &str {
        match self {
            Self::FluxPro11Ultra => "flux-pro-1.1-ultra",
            Self::FluxPro11 => "flux-pro-1.1",
            Self::FluxPro => "flux-pro",
            Self::FluxDev => "flux-dev",
            Self::Custom(name) => name,
        }
    }

    /// Maps an endpoint name to an engine; unknown names become [`Self::Custom`].
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "flux-pro-1.1-ultra" => Self::FluxPro11Ultra,
            "flux-pro-1.1" => Self::FluxPro11,
            "flux-pro" => Self::FluxPro,
            "flux-dev" => Self::FluxDev,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::str::FromStr for FluxEngine {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

/// Builder for [`FluxClient`].
#[derive(Debug, Clone)]
pub struct FluxClientBuilder {
    credential: Option<Credential>,
    engine: FluxEngine,
    base_url: String,
    request_timeout: Duration,
}

impl Default for FluxClientBuilder {
    fn default() -> Self {
        Self {
            credential: None,
            engine: FluxEngine::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl FluxClientBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the credential used for authenticated calls.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets the generation endpoint.
    pub fn engine(mut self, engine: FluxEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Overrides the API host.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<FluxClient> {
        let credential = self
            .credential
            .ok_or_else(|| FluxViewError::Auth("no API key provided".into()))?;

        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()?;

        Ok(FluxClient {
            client,
            credential,
            engine: self.engine,
            base_url: self.base_url,
        })
    }
}

/// Client for the Flux create/poll/fetch endpoints.
pub struct FluxClient {
    client: reqwest::Client,
    credential: Credential,
    engine: FluxEngine,
    base_url: String,
}

impl FluxClient {
    /// Creates a new [`FluxClientBuilder`].
    pub fn builder() -> FluxClientBuilder {
        FluxClientBuilder::new()
    }

    /// Returns the configured engine.
    pub fn engine(&self) -> &FluxEngine {
        &self.engine
    }

    /// Submits a generation job.
    pub async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle> {
        let url = format!("{}/v1/{}", self.base_url, self.engine.as_str());
        let body = FluxRequest::from_generation_request(request);

        let response = self
            .client
            .post(&url)
            .header("x-key", self.credential.api_key())
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_error(status, &text));
        }

        let submit_response: FluxSubmitResponse = response.json().await?;
        tracing::debug!(job_id = %submit_response.id, engine = %self.engine.as_str(), "submitted generation request");

        Ok(JobHandle {
            id: submit_response.id,
            submitted_at: chrono::Utc::now(),
            request: request.clone(),
        })
    }

    /// Fetches the current status of a job.
    pub async fn poll_job(&self, id: &str) -> Result<JobStatus> {
        let url = format!("{}/v1/get_result", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("id", id)])
            .header("x-key", self.credential.api_key())
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match parse_error(status, &text) {
                // A 4xx while polling is not a payload problem.
                FluxViewError::Validation { status, message } => {
                    FluxViewError::Http { status, message }
                }
                other => other,
            });
        }

        let result: FluxResultResponse = response.json().await?;
        Ok(result.into_status())
    }

    /// Downloads the generated image. The sample URL is pre-signed, so no key is sent.
    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FluxViewError::Fetch {
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Checks that the API is reachable and the key is accepted.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/v1/get_result", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("id", "health-check")])
            .header("x-key", self.credential.api_key())
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FluxViewError::Auth("Invalid API key".into()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl GenerationBackend for FluxClient {
    async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle> {
        FluxClient::create_job(self, request).await
    }

    async fn poll_job(&self, id: &str) -> Result<JobStatus> {
        FluxClient::poll_job(self, id).await
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        FluxClient::fetch_image(self, url).await
    }

    fn name(&self) -> &str {
        "Flux (Black Forest Labs)"
    }
}

fn parse_error(status: StatusCode, body: &str) -> FluxViewError {
    let message = describe_error_body(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FluxViewError::Auth(message),
        s if s.is_client_error() => FluxViewError::Validation {
            status: s.as_u16(),
            message,
        },
        s => FluxViewError::Http {
            status: s.as_u16(),
            message,
        },
    }
}

/// Pulls a readable reason out of an error body.
///
/// The API answers with `{"detail": "..."}` or a list of
/// `{"msg": "...", "loc": [...]}` validation entries.
fn describe_error_body(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        detail: serde_json::Value,
    }

    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        return body.trim().to_string();
    };

    match parsed.detail {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct FluxRequest {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<&'static str>,
    output_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    raw: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_upsampling: Option<bool>,
}

impl FluxRequest {
    fn from_generation_request(req: &GenerationRequest) -> Self {
        Self {
            prompt: req.prompt.clone(),
            aspect_ratio: req.aspect_ratio.map(|ar| ar.as_str()),
            output_format: req.output_format().extension(),
            width: req.width,
            height: req.height,
            raw: req.raw,
            prompt_upsampling: req.prompt_upsampling,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FluxSubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FluxResultResponse {
    status: String,
    #[serde(default)]
    result: Option<FluxResult>,
}

#[derive(Debug, Deserialize)]
struct FluxResult {
    #[serde(default)]
    sample: Option<String>,
}

impl FluxResultResponse {
    fn into_status(self) -> JobStatus {
        match self.status.as_str() {
            "Ready" => match self.result.and_then(|r| r.sample) {
                Some(sample_url) => JobStatus::Ready { sample_url },
                None => JobStatus::Failed {
                    reason: "Ready status but no sample URL".into(),
                },
            },
            "Error" | "Failed" | "Content Moderated" | "Request Moderated" | "Task not found" => {
                JobStatus::Failed {
                    reason: self.status,
                }
            }
            other => {
                if other != "Pending" {
                    tracing::debug!(status = %other, "treating unrecognised status as pending");
                }
                JobStatus::Pending
            }
        }
    }
}
