//! OpenAI embedding client.
//!
//! POSTs `{input, model, dimensions}` to `<base_url>/embeddings` with
//! bearer authentication and reads the first element of the `data` array.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{EmbedError, Embedder, NormalizationCheck};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_DIMENSIONS: u32 = 1536;

pub struct OpenAiEmbedder {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    model: String,
    dimensions: u32,
    normalization: NormalizationCheck,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
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
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
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
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "input": data,
                "model": self.model,
                "dimensions": self.dimensions,
            }))
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
        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .filter(|v| !v.is_empty())
            .ok_or(EmbedError::EmptyResponse)?;

        if embedding.len() != self.dimensions as usize {
            return Err(EmbedError::WrongDimensions {
                want: self.dimensions,
                got: embedding.len(),
            });
        }

        let mut vector = embedding;
        self.normalization.apply(&mut vector);
        Ok(vector)
    }
}
