//! Embedding provider contract and implementations.
//!
//! An embedder maps a text chunk to a fixed-dimension vector of 32-bit
//! floats. The similarity search contract requires unit-L2 vectors, so
//! every implementation checks — once, on the first successful call —
//! whether its backend already normalizes, and normalizes in place when it
//! does not.
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | [`ollama::OllamaEmbedder`] | Ollama `/api/embeddings` |
//! | [`openai::OpenAiEmbedder`] | OpenAI `/v1/embeddings` |
//! | [`testutil::MockEmbedder`] | Deterministic fake for tests |

pub mod ollama;
pub mod openai;
pub mod testutil;

use std::sync::OnceLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::vector;

/// Errors surfaced by embedding providers.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("error response from the embedding API: {status}: {body}")]
    Api { status: u16, body: String },

    #[error("no embeddings found in the response")]
    EmptyResponse,

    #[error("backend returned embeddings vector of wrong size: wanted {want}, returned {got}")]
    WrongDimensions { want: u32, got: usize },

    #[error("embedding canceled")]
    Canceled,
}

/// Produces unit-normalized embedding vectors from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimensionality of returned vectors.
    fn dimensions(&self) -> u32;

    /// Model identifier; part of the processor version that decides when
    /// stored embeddings are invalidated.
    fn model_name(&self) -> &str;

    /// Embed `data`. The returned vector has [`Embedder::dimensions`]
    /// elements and unit L2 norm.
    async fn generate_embeddings(
        &self,
        ctx: &CancellationToken,
        data: &str,
    ) -> Result<Vec<f32>, EmbedError>;
}

/// Shared "does the backend normalize?" latch.
///
/// The decision is made from the first successful response and cached:
/// checking every vector would be wasted work, and a backend does not
/// change its behavior between calls.
#[derive(Default)]
pub(crate) struct NormalizationCheck {
    normalized: OnceLock<bool>,
}

impl NormalizationCheck {
    /// Ensures `v` is unit-normalized, consulting the cached verdict.
    pub(crate) fn apply(&self, v: &mut [f32]) {
        let backend_normalizes = *self
            .normalized
            .get_or_init(|| vector::is_normalized(v));
        if !backend_normalizes {
            vector::normalize_in_place(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_check_is_sticky() {
        let check = NormalizationCheck::default();

        // First vector is not normalized: the backend is marked as raw and
        // every following vector gets normalized.
        let mut v1 = vec![3.0, 4.0];
        check.apply(&mut v1);
        assert!(vector::is_normalized(&v1));

        let mut v2 = vec![0.0, 5.0];
        check.apply(&mut v2);
        assert!(vector::is_normalized(&v2));
    }

    #[test]
    fn normalized_backend_is_left_alone() {
        let check = NormalizationCheck::default();

        let mut v1 = vec![1.0, 0.0];
        check.apply(&mut v1);
        assert_eq!(v1, vec![1.0, 0.0]);

        // Later vectors are trusted, even if slightly off, because the
        // backend declared itself normalized on the first call.
        let mut v2 = vec![0.9, 0.1];
        check.apply(&mut v2);
        assert_eq!(v2, vec![0.9, 0.1]);
    }
}
