//! Embeddings client for semantic catalog search
//!
//! Talks to an OpenAI-compatible `/v1/embeddings` endpoint. When no API key
//! is configured the registry falls back to keyword scoring, so every failure
//! here is recoverable by the caller.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::SearchSettings;
use crate::{Error, Result};

/// Raw embedding item from the `/embeddings` endpoint
#[derive(Debug, Deserialize)]
struct RawEmbeddingItem {
    embedding: Vec<f32>,
}

/// Parsed embedding response
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<RawEmbeddingItem>,
}

/// Client for one embeddings endpoint
pub struct EmbeddingsClient {
    http: Client,
    url: String,
    api_key: String,
    model: String,
}

impl EmbeddingsClient {
    /// Build a client from search settings; `None` when no API key is set
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(settings: &SearchSettings) -> Result<Option<Self>> {
        let Some(api_key) = settings.api_key.clone() else {
            return Ok(None);
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create embeddings client: {e}")))?;

        Ok(Some(Self {
            http,
            url: settings.embeddings_url.clone(),
            api_key,
            model: settings.model.clone(),
        }))
    }

    /// Embed a single text
    ///
    /// # Errors
    ///
    /// Returns an error on HTTP failure or an empty response.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "Embeddings request failed (HTTP {status}): {body}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| Error::Internal("Empty embeddings response".to_string()))?;

        debug!(dims = embedding.len(), "Embedded query");
        Ok(embedding)
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 on dimension mismatch or a zero-norm input so a single bad
/// catalog vector never poisons a whole search.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        let score = cosine_similarity(&v, &v);
        assert!((score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-5);
    }

    #[test]
    fn cosine_opposite_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_dimension_mismatch_is_zero() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_zero_norm_is_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn client_absent_without_api_key() {
        let settings = SearchSettings::default();
        assert!(EmbeddingsClient::from_settings(&settings).unwrap().is_none());
    }

    #[test]
    fn client_present_with_api_key() {
        let settings = SearchSettings {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let client = EmbeddingsClient::from_settings(&settings).unwrap().unwrap();
        assert_eq!(client.model, "text-embedding-ada-002");
    }
}
