//! HTTP OCR server provider.
//!
//! Talks to a tesseract-server style endpoint: the image is uploaded as a
//! multipart form (`file` part plus a JSON `options` field carrying the
//! language list) and the response reports the engine's exit code and
//! captured stdout/stderr. Useful when the OCR engine cannot be linked into
//! the process.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{filter_text, OcrError, OcrProgress, OcrProvider};

#[derive(Debug, Clone)]
pub struct OcrServerConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8884`.
    pub base_url: String,
    /// Language codes to recognize, primary language first.
    pub languages: Vec<String>,
    /// Content types the server accepts without transcoding.
    pub supported_mime_types: Vec<String>,
}

impl Default for OcrServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8884".to_string(),
            languages: vec!["eng".to_string()],
            supported_mime_types: vec!["image/png".to_string(), "image/jpeg".to_string()],
        }
    }
}

/// OCR provider backed by a remote HTTP OCR server.
#[derive(Clone)]
pub struct OcrServer {
    config: OcrServerConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ServerResponse {
    data: ServerResponseData,
}

#[derive(Deserialize)]
struct ServerResponseData {
    exit: ServerExit,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    stdout: String,
}

#[derive(Deserialize)]
struct ServerExit {
    code: u32,
}

impl OcrServer {
    pub fn new(config: OcrServerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn request(&self, image: &[u8]) -> Result<String, OcrError> {
        let options = serde_json::json!({ "languages": self.config.languages });
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(image.to_vec()).file_name("data"),
            )
            .text("options", options.to_string());

        let response = self
            .client
            .post(format!("{}/tesseract", self.config.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| OcrError::Backend(format!("HTTP request to OCR server failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OcrError::Backend(format!(
                "bad status code from OCR server: {status}"
            )));
        }

        let body: ServerResponse = response
            .json()
            .await
            .map_err(|e| OcrError::Backend(format!("failed to decode OCR server response: {e}")))?;

        if body.data.exit.code != 0 {
            return Err(OcrError::Backend(format!(
                "OCR engine exited with code {}: {}",
                body.data.exit.code, body.data.stderr
            )));
        }

        Ok(filter_text(&body.data.stdout))
    }
}

#[async_trait]
impl OcrProvider for OcrServer {
    async fn ocr(&self, ctx: &CancellationToken, image: &[u8]) -> Result<String, OcrError> {
        tokio::select! {
            result = self.request(image) => result,
            _ = ctx.cancelled() => Err(OcrError::Canceled),
        }
    }

    fn ocr_with_progress(&self, ctx: CancellationToken, image: Vec<u8>) -> OcrProgress {
        let (sender, handle) = OcrProgress::channel();
        let this = self.clone();

        tokio::spawn(async move {
            let result = this.ocr(&ctx, &image).await;
            sender.finish(result);
        });

        handle
    }

    fn supports(&self, mime_type: &str) -> bool {
        self.config
            .supported_mime_types
            .iter()
            .any(|m| m == mime_type)
    }
}
