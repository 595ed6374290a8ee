//! FusionBrain (Kandinsky) generation API client.
//!
//! The service is asynchronous: a submission returns a `uuid` that is then
//! polled on the status endpoint. Protocol quirks (a `201` carrying an
//! `INITIAL` body, a `404` embedded in an error body) are folded into typed
//! outcomes here so callers never look at response text.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::models::generation::{GenerationRequest, GenerationStatus, PollResponse};

/// Outcome of a submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The service queued the request under `correlation_id`.
    Accepted {
        correlation_id: String,
        status: String,
    },
    Rejected {
        cause: GenerationError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode generation API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Generation API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Generation API accepted the request without a uuid")]
    MissingCorrelationId,

    #[error("No generation pipelines available")]
    NoPipeline,

    #[error("FusionBrain credentials are missing or not valid header text")]
    InvalidCredentials,

    /// The service no longer knows this correlation id.
    #[error("Generation {correlation_id} not found")]
    NotFound { correlation_id: String },
}

/// Remote image generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> SubmitOutcome;

    async fn poll(&self, correlation_id: &str) -> Result<PollResponse, GenerationError>;
}

#[derive(Deserialize)]
struct PipelineEntry {
    id: String,
}

#[derive(Deserialize)]
struct SubmitBody {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(default)]
    uuid: Option<String>,
    status: String,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    result: Option<StatusResult>,
}

#[derive(Deserialize, Default)]
struct StatusResult {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    censored: bool,
}

/// Client for the FusionBrain key API.
pub struct FusionBrainClient {
    http: Client,
    base_url: String,
    pipeline_id: OnceCell<String>,
}

impl FusionBrainClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        if api_key.trim().is_empty() || secret_key.trim().is_empty() {
            return Err(GenerationError::InvalidCredentials);
        }

        let mut headers = HeaderMap::new();
        headers.insert("X-Key", header_value(&format!("Key {api_key}"))?);
        headers.insert("X-Secret", header_value(&format!("Secret {secret_key}"))?);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            pipeline_id: OnceCell::new(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, GenerationError> {
        Self::new(
            &config.fusion_brain_base_url,
            &config.fusion_brain_api_key,
            &config.fusion_brain_secret_key,
            config.generation_timeout(),
        )
    }

    /// Id of the first published pipeline, fetched once.
    async fn pipeline_id(&self) -> Result<&str, GenerationError> {
        let id = self
            .pipeline_id
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(format!("{}/key/api/v1/pipelines", self.base_url))
                    .send()
                    .await?;

                let status = response.status().as_u16();
                let body = response.text().await?;
                if status != 200 {
                    return Err(GenerationError::Api { status, body });
                }

                let pipelines: Vec<PipelineEntry> = serde_json::from_str(&body)?;
                pipelines
                    .into_iter()
                    .next()
                    .map(|p| p.id)
                    .ok_or(GenerationError::NoPipeline)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn try_submit(&self, request: &GenerationRequest) -> Result<SubmitOutcome, GenerationError> {
        let pipeline_id = self.pipeline_id().await?.to_string();
        let params = build_params(request);

        let form = Form::new().text("pipeline_id", pipeline_id).part(
            "params",
            Part::text(params.to_string()).mime_str("application/json")?,
        );

        let response = self
            .http
            .post(format!("{}/key/api/v1/pipeline/run", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        interpret_submit_response(status, &body)
    }
}

#[async_trait]
impl GenerationClient for FusionBrainClient {
    async fn submit(&self, request: &GenerationRequest) -> SubmitOutcome {
        match self.try_submit(request).await {
            Ok(outcome) => outcome,
            Err(cause) => SubmitOutcome::Rejected { cause },
        }
    }

    async fn poll(&self, correlation_id: &str) -> Result<PollResponse, GenerationError> {
        let response = self
            .http
            .get(format!(
                "{}/key/api/v1/pipeline/status/{}",
                self.base_url, correlation_id
            ))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        interpret_poll_response(correlation_id, status, &body)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, GenerationError> {
    HeaderValue::from_str(value).map_err(|_| GenerationError::InvalidCredentials)
}

/// `params` JSON part of the run request.
fn build_params(request: &GenerationRequest) -> serde_json::Value {
    let mut params = serde_json::json!({
        "type": "GENERATE",
        "width": request.width,
        "height": request.height,
        "numImages": request.num_images,
        "generateParams": {
            "query": request.prompt,
        },
    });

    if let Some(style) = request.style.as_deref().filter(|s| !s.is_empty()) {
        params["style"] = style.into();
    }
    if let Some(negative) = request.negative_prompt.as_deref().filter(|s| !s.is_empty()) {
        params["negativePromptDecoder"] = negative.into();
    }
    params
}

/// Map a run response to an outcome.
///
/// Besides a plain `200`, the service answers `201` with
/// `{"uuid": "...", "status": "INITIAL"}` when it has queued the request;
/// that is an acceptance, not an error.
fn interpret_submit_response(status: u16, body: &str) -> Result<SubmitOutcome, GenerationError> {
    let accepted_initial = status == 201;
    if status != 200 && !accepted_initial {
        return Err(GenerationError::Api {
            status,
            body: body.to_string(),
        });
    }

    let parsed: SubmitBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) if status == 200 => return Err(e.into()),
        Err(_) => {
            return Err(GenerationError::Api {
                status,
                body: body.to_string(),
            })
        }
    };

    let remote_status = parsed.status.unwrap_or_default();
    if accepted_initial && remote_status != "INITIAL" {
        return Err(GenerationError::Api {
            status,
            body: body.to_string(),
        });
    }

    match parsed.uuid.filter(|id| !id.is_empty()) {
        Some(correlation_id) => Ok(SubmitOutcome::Accepted {
            correlation_id,
            status: remote_status,
        }),
        None if accepted_initial => Err(GenerationError::Api {
            status,
            body: body.to_string(),
        }),
        None => Err(GenerationError::MissingCorrelationId),
    }
}

/// Map a status response to a [`PollResponse`].
///
/// Unknown ids come back either as HTTP `404` or as an error body carrying
/// `"status": 404`; both become [`GenerationError::NotFound`].
fn interpret_poll_response(
    correlation_id: &str,
    status: u16,
    body: &str,
) -> Result<PollResponse, GenerationError> {
    let value: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let embedded_404 = value
        .as_ref()
        .and_then(|v| v.get("status"))
        .and_then(|s| s.as_u64())
        == Some(404);

    if status == 404 || embedded_404 {
        return Err(GenerationError::NotFound {
            correlation_id: correlation_id.to_string(),
        });
    }

    if status != 200 {
        return Err(GenerationError::Api {
            status,
            body: body.to_string(),
        });
    }

    let parsed: StatusBody = serde_json::from_str(body)?;
    let result = parsed.result.unwrap_or_default();

    Ok(PollResponse {
        correlation_id: parsed.uuid.unwrap_or_else(|| correlation_id.to_string()),
        status: GenerationStatus::parse(&parsed.status),
        files: result.files,
        censored: result.censored,
        error_description: parsed.error_description.filter(|d| !d.is_empty()),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Failed to check generation status: {0}")]
    Poll(#[source] GenerationError),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Max attempts ({0}) reached waiting for generation")]
    AttemptsExhausted(u32),

    #[error("Wait for generation cancelled")]
    Cancelled,
}

/// Block until one generation finishes.
///
/// Polls every `interval` up to `max_attempts` times. Unlike the batch
/// polling stage, a poll error ends the wait and nothing is written to the
/// job store.
pub async fn wait_for_generation(
    client: &dyn GenerationClient,
    correlation_id: &str,
    interval: Duration,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<PollResponse, WaitError> {
    for attempt in 1..=max_attempts {
        let response = client.poll(correlation_id).await.map_err(WaitError::Poll)?;

        match response.status {
            GenerationStatus::Done => return Ok(response),
            GenerationStatus::Failed => {
                return Err(WaitError::GenerationFailed(
                    response.error_description.unwrap_or_default(),
                ))
            }
            ref other => {
                tracing::debug!(
                    correlation_id,
                    attempt,
                    max_attempts,
                    status = %other,
                    "Generation still in progress"
                );
            }
        }

        if attempt < max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    Err(WaitError::AttemptsExhausted(max_attempts))
}
