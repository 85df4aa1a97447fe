//! HTTP client for OpenAI-compatible chat completion services.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::planner::{changes_of, dedupe_models, extract_json};
use super::{InferenceService, PlanRequest};
use crate::config::InferenceConfig;
use crate::error::{InferenceError, InferenceResult};

const TEMPERATURE: f64 = 0.2;

#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiClient {
    pub fn new(config: &InferenceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        OpenAiClient {
            base_url: config.base_url.trim().to_string(),
            api_key: config.api_key.trim().to_string(),
            client,
        }
    }

    fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn models_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/chat/completions").unwrap_or(base);
        format!("{base}/models")
    }

    async fn read_success(response: reqwest::Response) -> InferenceResult<Vec<u8>> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| InferenceError::Unreachable(format!("failed reading response body: {e}")))?;
        if !status.is_success() {
            let message = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .pointer("/error/message")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&body).chars().take(200).collect());
            return Err(InferenceError::Rejected(format!("{status}: {message}")));
        }
        Ok(body.to_vec())
    }
}

fn transport_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Unreachable(format!("request timed out: {e}"))
    } else {
        InferenceError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl InferenceService for OpenAiClient {
    fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty()
    }

    async fn propose(&self, request: &PlanRequest) -> InferenceResult<Vec<serde_json::Value>> {
        let body = serde_json::json!({
            "model": request.model,
            "temperature": TEMPERATURE,
            "response_format": {"type": "json_object"},
            "messages": request.messages(),
        });
        tracing::debug!(url = %self.chat_url(), model = %request.model, "Requesting plan");

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let body = Self::read_success(response).await?;

        let completion: ChatCompletion = serde_json::from_slice(&body)
            .map_err(|e| InferenceError::MalformedResponse(format!("invalid completion: {e}")))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::MalformedResponse("completion has no content".into()))?;

        Ok(changes_of(&extract_json(&content)?))
    }

    async fn list_models(&self) -> InferenceResult<Vec<String>> {
        let response = self
            .client
            .get(self.models_url())
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let body = Self::read_success(response).await?;
        let models: ModelList = serde_json::from_slice(&body)
            .map_err(|e| InferenceError::MalformedResponse(format!("invalid model list: {e}")))?;
        Ok(dedupe_models(models.data.into_iter().map(|m| m.id)))
    }
}
