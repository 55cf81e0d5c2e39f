//! Gemini adjudication client.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{build_prompt, parse_verdict, Adjudicator, Verdict};
use crate::database::TargetCandidate;
use crate::error::{AppError, AppResult};
use crate::models::SourceCode;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Generation budget; keeps adjudication latency predictable.
const MAX_OUTPUT_TOKENS: u32 = 1024;

#[derive(Clone)]
pub struct GeminiAdjudicator {
    api_key: Option<String>,
    client: reqwest::Client,
    model: String,
    base_url: String,
}

impl GeminiAdjudicator {
    pub fn new(api_key: Option<String>, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| BASE_URL.to_string());
        Self {
            api_key,
            client,
            model: model.to_string(),
            base_url,
        }
    }

    async fn generate(&self, prompt: &str) -> AppResult<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::Upstream("GEMINI_API_KEY not configured".to_string()))?;
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, key
        );

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "contents": [{"role": "user", "parts": [{"text": prompt}]}],
                "generationConfig": {
                    "temperature": 0.1,
                    "maxOutputTokens": MAX_OUTPUT_TOKENS,
                },
            }))
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("adjudicator request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "adjudicator API error {}: {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct GenerateResponse {
            candidates: Vec<ResponseCandidate>,
        }
        #[derive(Deserialize)]
        struct ResponseCandidate {
            content: Content,
        }
        #[derive(Deserialize)]
        struct Content {
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Part {
            text: Option<String>,
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed adjudicator response: {}", e)))?;
        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().find_map(|p| p.text))
            .ok_or_else(|| AppError::Upstream("empty adjudicator response".to_string()))
    }
}

#[async_trait]
impl Adjudicator for GeminiAdjudicator {
    async fn adjudicate(
        &self,
        source: &SourceCode,
        candidates: &[TargetCandidate],
    ) -> AppResult<Verdict> {
        let prompt = build_prompt(source, candidates);
        let reply = self.generate(&prompt).await?;
        parse_verdict(&reply)
    }
}
