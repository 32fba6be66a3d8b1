use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::matching::prompt::{parse_match_response, MatchResponse, OracleRequest};

/// External semantic-matching service
#[async_trait]
pub trait InferenceOracle: Send + Sync {
    async fn infer(&self, request: &OracleRequest) -> Result<MatchResponse, OracleError>;
}

/// Oracle client for the `generateContent` REST API
pub struct GeminiOracle {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl GeminiOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        // The proposer enforces the hard cutoff; this only stops a leaked socket.
        let client = Client::builder()
            .timeout(config.timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| OracleError::Transport(format!("client setup failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn build_body(request: &OracleRequest) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        for attachment in &request.attachments {
            parts.push(json!({ "text": format!("Image for item {}:", attachment.item_id) }));
            parts.push(json!({
                "inline_data": {
                    "mime_type": attachment.content.mime_type,
                    "data": BASE64.encode(&attachment.content.bytes),
                }
            }));
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": request.schema,
                "temperature": 0,
            }
        })
    }

    /// Concatenate the text parts of the first candidate
    fn extract_text(body: &Value) -> Result<String, OracleError> {
        let parts = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| OracleError::Schema("response has no candidate parts".to_string()))?;

        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();

        if text.trim().is_empty() {
            return Err(OracleError::Schema("candidate text is empty".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl InferenceOracle for GeminiOracle {
    async fn infer(&self, request: &OracleRequest) -> Result<MatchResponse, OracleError> {
        debug!(
            "Oracle request: {} prompt chars, {} attachments",
            request.prompt.len(),
            request.attachments.len()
        );

        let mut call = self.client.post(self.endpoint()).json(&Self::build_body(request));
        if let Some(key) = &self.api_key {
            call = call.header("x-goog-api-key", key);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(self.timeout)
            } else {
                OracleError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OracleError::Schema(format!("response is not JSON: {}", e)))?;

        let verdict = parse_match_response(&Self::extract_text(&body)?)?;
        info!("Oracle verdict: {:?}", verdict.proposed);
        Ok(verdict)
    }
}
