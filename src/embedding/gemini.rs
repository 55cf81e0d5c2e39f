//! Gemini embedding client (text-embedding-004, 768 dimensions).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::Embedder;
use crate::config::EMBEDDING_DIM;
use crate::error::{AppError, AppResult};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Task mode strings understood by the embedding API. Queries and documents
/// are embedded asymmetrically but land in the same vector space.
const TASK_QUERY: &str = "RETRIEVAL_QUERY";
const TASK_DOCUMENT: &str = "RETRIEVAL_DOCUMENT";

#[derive(Clone)]
pub struct GeminiEmbedder {
    api_key: Option<String>,
    client: reqwest::Client,
    model: String,
    base_url: String,
}

impl GeminiEmbedder {
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

    fn key(&self) -> AppResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| AppError::Upstream("GEMINI_API_KEY not configured".to_string()))
    }

    async fn embed_one(&self, text: &str, task_type: &str) -> AppResult<Vec<f32>> {
        let key = self.key()?;
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, self.model, key
        );

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "content": {"parts": [{"text": text}]},
                "taskType": task_type,
            }))
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "embedding API error {}: {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct EmbedResponse {
            embedding: EmbeddingValues,
        }
        #[derive(Deserialize)]
        struct EmbeddingValues {
            values: Vec<f32>,
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed embedding response: {}", e)))?;
        check_dimension(&parsed.embedding.values)?;
        Ok(parsed.embedding.values)
    }
}

fn check_dimension(values: &[f32]) -> AppResult<()> {
    if values.len() != EMBEDDING_DIM {
        return Err(AppError::Upstream(format!(
            "embedding dimension {} (expected {})",
            values.len(),
            EMBEDDING_DIM
        )));
    }
    Ok(())
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        self.embed_one(text, TASK_QUERY).await
    }

    async fn embed_document(&self, text: &str) -> AppResult<Vec<f32>> {
        self.embed_one(text, TASK_DOCUMENT).await
    }

    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.key()?;
        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.base_url, self.model, key
        );
        let model_path = format!("models/{}", self.model);

        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": model_path,
                    "content": {"parts": [{"text": text}]},
                    "taskType": TASK_DOCUMENT,
                })
            })
            .collect();

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({"requests": requests}))
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("batch embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "embedding API error {}: {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct BatchResponse {
            embeddings: Vec<EmbeddingValues>,
        }
        #[derive(Deserialize)]
        struct EmbeddingValues {
            values: Vec<f32>,
        }

        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed embedding response: {}", e)))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(AppError::Upstream(format!(
                "batch embedding returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        let vectors: Vec<Vec<f32>> = parsed.embeddings.into_iter().map(|e| e.values).collect();
        for vector in &vectors {
            check_dimension(vector)?;
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_an_upstream_error() {
        let embedder = GeminiEmbedder::new(None, "text-embedding-004", Duration::from_secs(1));
        let err = embedder.embed_query("fever").await.unwrap_err();
        assert_eq!(err.label(), "upstream_unavailable");
    }

    #[test]
    fn dimension_check_rejects_short_vectors() {
        assert!(check_dimension(&vec![0.0; EMBEDDING_DIM]).is_ok());
        assert!(check_dimension(&vec![0.0; 384]).is_err());
    }
}
