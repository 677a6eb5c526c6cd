//! OCR provider contract.
//!
//! An OCR backend turns image bytes into text. Backends are expensive and
//! usually CPU-bound, so the contract comes in two flavors:
//!
//! - [`OcrProvider::ocr`] — run to completion and return the text.
//! - [`OcrProvider::ocr_with_progress`] — return an [`OcrProgress`] handle
//!   immediately. The handle exposes a lossy bounded stream of completion
//!   percentages, an atomic last-seen counter that can be peeked without
//!   draining, and the final text.
//!
//! Implementations in this crate:
//!
//! | Provider | Backing |
//! |----------|---------|
//! | [`pool::OcrPool`] | Bounded worker pool over any inner provider |
//! | [`server::OcrServer`] | HTTP OCR server (tesseract-server wire shape) |
//! | [`testutil::MockOcr`] | Deterministic fake for tests |

pub mod pool;
pub mod server;
pub mod testutil;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Errors surfaced by OCR providers.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The backend rejected or failed to process the image.
    #[error("OCR backend error: {0}")]
    Backend(String),

    /// The worker pool was used before `init` (or after `destroy`).
    #[error("OCR worker pool is not initialized")]
    PoolNotInitialized,

    /// The caller's cancellation token fired before the job finished.
    #[error("OCR canceled")]
    Canceled,
}

/// Provides OCR functionality. Implementations must be thread safe.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Run OCR on `image` and block until the text is available.
    async fn ocr(&self, ctx: &CancellationToken, image: &[u8]) -> Result<String, OcrError>;

    /// Start OCR on `image` and return immediately with a progress handle.
    fn ocr_with_progress(&self, ctx: CancellationToken, image: Vec<u8>) -> OcrProgress;

    /// Whether the backend accepts `mime_type` natively. Parsers transcode
    /// to PNG when this returns `false`.
    fn supports(&self, mime_type: &str) -> bool;
}

/// Handle to a running OCR job.
///
/// Progress updates are lossy: a slow consumer never blocks the OCR worker,
/// it just observes fewer intermediate percentages. The last reported value
/// is always available through [`OcrProgress::completion`].
pub struct OcrProgress {
    updates: mpsc::Receiver<u8>,
    last: Arc<AtomicU8>,
    result: oneshot::Receiver<Result<String, OcrError>>,
}

impl OcrProgress {
    /// Creates a connected `(sender, handle)` pair. Providers keep the sender
    /// on the worker side and hand the handle to the caller.
    pub fn channel() -> (OcrProgressSender, OcrProgress) {
        let (tx, rx) = mpsc::channel(1);
        let (result_tx, result_rx) = oneshot::channel();
        let last = Arc::new(AtomicU8::new(0));

        (
            OcrProgressSender {
                updates: tx,
                last: last.clone(),
                result: Some(result_tx),
            },
            OcrProgress {
                updates: rx,
                last,
                result: result_rx,
            },
        )
    }

    /// Receives the next completion percentage, or `None` once the job is
    /// finished and the update stream is closed.
    pub async fn next_update(&mut self) -> Option<u8> {
        self.updates.recv().await
    }

    /// Last reported completion percentage, without draining updates.
    pub fn completion(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }

    /// Waits for the job to finish and returns the final text.
    pub async fn text(self) -> Result<String, OcrError> {
        match self.result.await {
            Ok(res) => res,
            // The producing task went away without reporting a result.
            Err(_) => Err(OcrError::Canceled),
        }
    }
}

/// Worker-side end of an [`OcrProgress`] handle.
pub struct OcrProgressSender {
    updates: mpsc::Sender<u8>,
    last: Arc<AtomicU8>,
    result: Option<oneshot::Sender<Result<String, OcrError>>>,
}

impl OcrProgressSender {
    /// Publishes a completion percentage. Never blocks: if the consumer has
    /// not drained the previous value the update is dropped.
    pub fn update(&self, percent: u8) {
        self.last.store(percent.min(100), Ordering::Relaxed);
        let _ = self.updates.try_send(percent.min(100));
    }

    /// Publishes the final result and closes the update stream.
    pub fn finish(mut self, result: Result<String, OcrError>) {
        if result.is_ok() {
            self.last.store(100, Ordering::Relaxed);
        }
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
        // Dropping self closes the updates channel, which is how consumers
        // learn the job is done.
    }
}

/// Strips characters that corrupt downstream UTF-8 tokenizers from OCR
/// output, keeping newlines, spaces, letters, numbers, punctuation and
/// symbols.
pub fn filter_text(text: &str) -> String {
    text.chars()
        .filter(|&c| {
            c == '\n' || c == ' ' || c.is_alphanumeric() || c.is_ascii_punctuation()
        })
        .collect()
}
