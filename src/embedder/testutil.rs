//! Deterministic embedding fake for tests.
//!
//! Hashes the input text into a pseudo-random direction, so equal texts
//! map to equal vectors and different texts map to (almost certainly)
//! different ones. Vectors are unit-normalized like the real providers'.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::vector;

use super::{EmbedError, Embedder};

pub struct MockEmbedder {
    dimensions: u32,
    model: String,
    calls: AtomicUsize,
    fail_with: Option<String>,
}

impl MockEmbedder {
    pub fn new(dimensions: u32) -> Self {
        Self {
            dimensions,
            model: "mock-embedder".to_string(),
            calls: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Makes every call fail with an API error carrying `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    /// Number of embedding calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// The vector this fake returns for `data`.
    pub fn vector_for(&self, data: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions as usize);
        let mut counter = 0u32;
        let mut digest = Sha256::digest(data.as_bytes());
        loop {
            for chunk in digest.chunks_exact(4) {
                if out.len() == self.dimensions as usize {
                    let mut v = out;
                    vector::normalize_in_place(&mut v);
                    return v;
                }
                let bits = u32::from_le_bytes(chunk.try_into().unwrap());
                // Map to (-1, 1); avoids the all-zero vector.
                out.push((bits as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
            let mut hasher = Sha256::new();
            hasher.update(data.as_bytes());
            hasher.update(counter.to_le_bytes());
            digest = hasher.finalize();
        }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
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
        if ctx.is_cancelled() {
            return Err(EmbedError::Canceled);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(message) = &self.fail_with {
            return Err(EmbedError::Api {
                status: 500,
                body: message.clone(),
            });
        }

        Ok(self.vector_for(data))
    }
}
