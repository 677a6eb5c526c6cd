//! Deterministic OCR fake for tests.
//!
//! Returns a configured string for every image and records the bytes each
//! call received, so parser tests can assert what actually reached the
//! backend (e.g. that a BMP was transcoded to PNG first).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{OcrError, OcrProgress, OcrProvider};

#[derive(Clone)]
pub struct MockOcr {
    text: String,
    supported: Vec<String>,
    delay: Duration,
    fail_with: Option<String>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockOcr {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            supported: vec!["image/png".to_string()],
            delay: Duration::ZERO,
            fail_with: None,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replaces the set of natively accepted content types.
    pub fn with_supported(mut self, mime_types: &[&str]) -> Self {
        self.supported = mime_types.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Adds an artificial processing delay per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes every call fail with the given backend message.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    /// Bytes received by each OCR call, in order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    async fn run(&self, ctx: &CancellationToken, image: &[u8]) -> Result<String, OcrError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancelled() => return Err(OcrError::Canceled),
            }
        } else if ctx.is_cancelled() {
            return Err(OcrError::Canceled);
        }

        self.received.lock().unwrap().push(image.to_vec());

        match &self.fail_with {
            Some(message) => Err(OcrError::Backend(message.clone())),
            None => Ok(self.text.clone()),
        }
    }
}

#[async_trait]
impl OcrProvider for MockOcr {
    async fn ocr(&self, ctx: &CancellationToken, image: &[u8]) -> Result<String, OcrError> {
        self.run(ctx, image).await
    }

    fn ocr_with_progress(&self, ctx: CancellationToken, image: Vec<u8>) -> OcrProgress {
        let (sender, handle) = OcrProgress::channel();
        let this = self.clone();

        tokio::spawn(async move {
            sender.update(0);
            let result = this.run(&ctx, &image).await;
            sender.update(100);
            sender.finish(result);
        });

        handle
    }

    fn supports(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|m| m == mime_type)
    }
}
