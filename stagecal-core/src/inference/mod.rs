//! The inference seam: a planner that proposes event changes.

pub mod openai;
pub mod planner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InferenceResult;

pub use openai::OpenAiClient;
pub use planner::{PlanningEvent, PlanningPayload, ProposedChange};

/// Everything one planning call needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub model: String,
    pub system_prompt: String,
    pub payload: PlanningPayload,
}

impl PlanRequest {
    /// Chat messages in the order the service receives them.
    pub fn messages(&self) -> serde_json::Value {
        let payload = serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string());
        serde_json::json!([
            {"role": "system", "content": self.system_prompt},
            {"role": "user", "content": payload},
        ])
    }
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Whether the service has what it needs to be called at all.
    fn is_configured(&self) -> bool {
        true
    }

    /// Raw changes as returned by the model; see [`planner::normalize_changes`].
    async fn propose(&self, request: &PlanRequest) -> InferenceResult<Vec<serde_json::Value>>;

    /// Model ids in the service's order, without duplicates.
    async fn list_models(&self) -> InferenceResult<Vec<String>>;
}

#[async_trait]
impl<S: InferenceService + ?Sized> InferenceService for std::sync::Arc<S> {
    fn is_configured(&self) -> bool {
        (**self).is_configured()
    }

    async fn propose(&self, request: &PlanRequest) -> InferenceResult<Vec<serde_json::Value>> {
        (**self).propose(request).await
    }

    async fn list_models(&self) -> InferenceResult<Vec<String>> {
        (**self).list_models().await
    }
}
