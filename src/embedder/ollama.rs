//! Ollama embedding client.
//!
//! POSTs `{model, prompt}` to `<base_url>/embeddings` and reads back a
//! single `embedding` array. `pull_model` asks the server to download the
//! model ahead of the first embedding call.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{EmbedError, Embedder, NormalizationCheck};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/api";
pub const DEFAULT_DIMENSIONS: u32 = 768;

pub struct OllamaEmbedder {
    base_url: String,
    client: reqwest::Client,
    model: String,
    dimensions: u32,
    normalization: NormalizationCheck,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct PullResponse {
    #[serde(default)]
    status: String,
}

impl OllamaEmbedder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
            model: model.into(),
            dimensions: DEFAULT_DIMENSIONS,
            normalization: NormalizationCheck::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_dimensions(mut self, dimensions: u32) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Asks the Ollama server to download the model.
    pub async fn pull_model(&self, ctx: &CancellationToken) -> Result<(), EmbedError> {
        let request = self
            .client
            .post(format!("{}/pull", self.base_url))
            .json(&serde_json::json!({ "name": self.model, "stream": false }))
            .send();

        let response = tokio::select! {
            response = request => response?,
            _ = ctx.cancelled() => return Err(EmbedError::Canceled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(EmbedError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: PullResponse = response.json().await?;
        if body.status != "success" {
            return Err(EmbedError::Api {
                status: status.as_u16(),
                body: format!("bad pull status: {}", body.status),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimensions(&self) -> u32 {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_embeddings(
        &self,
        ctx: &CancellationToken,
        data: &str,
    ) -> Result<Vec<f32>, EmbedError> {
        let request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": self.model, "prompt": data }))
            .send();

        let response = tokio::select! {
            response = request => response?,
            _ = ctx.cancelled() => return Err(EmbedError::Canceled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(EmbedError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: EmbeddingsResponse = response.json().await?;
        if body.embedding.is_empty() {
            return Err(EmbedError::EmptyResponse);
        }
        if body.embedding.len() != self.dimensions as usize {
            return Err(EmbedError::WrongDimensions {
                want: self.dimensions,
                got: body.embedding.len(),
            });
        }

        let mut vector = body.embedding;
        self.normalization.apply(&mut vector);
        Ok(vector)
    }
}
