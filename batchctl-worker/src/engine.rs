//! The in-process boundary to the (out-of-scope) model-serving component.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// A single chat-completion request taken from one line of an input file.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub custom_id: String,
    #[serde(default = "default_endpoint")]
    pub method: String,
    #[serde(default = "default_url")]
    pub url: String,
    pub body: Value,
}

fn default_endpoint() -> String {
    "POST".to_string()
}

fn default_url() -> String {
    "/v1/chat/completions".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponseBody {
    pub status_code: u16,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatErrorBody {
    pub message: String,
    pub r#type: &'static str,
    pub code: &'static str,
}

/// One output record, one-to-one with an input `ChatRequest`, destined for either the output
/// or the error stream depending on which field is populated.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResult {
    pub id: String,
    pub custom_id: String,
    pub response: Option<ChatResponseBody>,
    pub error: Option<ChatErrorBody>,
}

impl ChatResult {
    pub fn is_success(&self) -> bool {
        self.response.is_some()
    }

    pub fn ok(custom_id: String, body: Value, tokens: u64) -> (Self, u64) {
        let result = ChatResult {
            id: format!("batchresp_{custom_id}"),
            custom_id,
            response: Some(ChatResponseBody {
                status_code: 200,
                body,
            }),
            error: None,
        };
        (result, tokens)
    }

    pub fn failed(custom_id: String, message: String, code: &'static str) -> Self {
        ChatResult {
            id: format!("batchresp_{custom_id}"),
            custom_id,
            response: None,
            error: Some(ChatErrorBody {
                message,
                r#type: "inference_error",
                code,
            }),
        }
    }
}

/// The out-of-scope inference capability: load a model, unload it, and run chat completions
/// against the currently loaded model. Production deployments provide their own implementation
/// and wire it into `batchctl-worker::main`. `infer` returns each result paired with the number
/// of tokens it produced, so the caller can accumulate `tokens_processed` and derive
/// `current_throughput` from real token output rather than a request count.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load_model(&self, model: &str) -> Result<(), EngineError>;
    async fn unload_model(&self) -> Result<(), EngineError>;
    async fn infer(
        &self,
        model: &str,
        requests: Vec<ChatRequest>,
    ) -> Result<Vec<(ChatResult, u64)>, EngineError>;
}

/// Deterministic, in-process engine with no real GPU or model, used for tests and local runs.
/// Echoes a canned completion for every request so output ordering and chunking logic can be
/// exercised without external dependencies.
#[derive(Default)]
pub struct StubInferenceEngine;

#[async_trait]
impl InferenceEngine for StubInferenceEngine {
    async fn load_model(&self, _model: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn unload_model(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn infer(
        &self,
        model: &str,
        requests: Vec<ChatRequest>,
    ) -> Result<Vec<(ChatResult, u64)>, EngineError> {
        let results = requests
            .into_iter()
            .map(|req| {
                ChatResult::ok(
                    req.custom_id,
                    serde_json::json!({
                        "model": model,
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": "stub completion"},
                            "finish_reason": "stop",
                        }],
                        "usage": {"prompt_tokens": 8, "completion_tokens": 4, "total_tokens": 12},
                    }),
                    12,
                )
            })
            .collect();
        Ok(results)
    }
}
