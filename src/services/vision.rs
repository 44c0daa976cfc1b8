use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::services::slug_bug::ImageClassifier;

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// What the vision model saw in a dashcam frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub slug_bug: bool,
    #[serde(default)]
    pub description: String,
}

/// Client for Cloudflare Workers AI LLaVA model.
pub struct WorkersAiClient {
    http: Client,
    base_url: String,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiClient {
    pub fn new(account_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }

    /// Send a dashcam image to Workers AI LLaVA and ask whether it shows a Beetle.
    pub async fn classify_image(&self, image_bytes: &[u8]) -> Result<Classification, VisionError> {
        let url = format!(
            "{}/accounts/{}/ai/run/@cf/llava-hf/llava-1.5-7b-hf",
            self.base_url, self.account_id
        );

        let prompt = concat!(
            "This is a photo from a vehicle's road-facing dashcam. ",
            "Is there a Volkswagen Beetle (a \"slug bug\") anywhere in the image? ",
            "Answer with JSON only, using these exact field names: ",
            "{\"slug_bug\": true or false, \"description\": \"one short sentence\"}."
        );

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "prompt": prompt,
            "max_tokens": 256
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(VisionError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(VisionError::Status(status.as_u16()));
        }

        let llava_resp: LlavaResponse = response.json().await.map_err(VisionError::Http)?;
        parse_classification(&llava_resp.result.description)
    }
}

#[async_trait]
impl ImageClassifier for WorkersAiClient {
    async fn classify(&self, image_bytes: &[u8]) -> Result<Classification, VisionError> {
        self.classify_image(image_bytes).await
    }
}

/// The model tends to wrap its JSON in prose; take the outermost object.
fn parse_classification(text: &str) -> Result<Classification, VisionError> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&text[start..=end]).map_err(VisionError::Parse)
        }
        _ => Err(VisionError::NoAnswer(text.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Workers AI returned status {0}")]
    Status(u16),

    #[error("Failed to parse LLaVA response as a classification: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("LLaVA response contained no JSON answer: {0}")]
    NoAnswer(String),
}
