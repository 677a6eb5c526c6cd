//! Image format parsers.
//!
//! All raster formats funnel into the same stream shape: prepare the bytes
//! (pass through, or decode and re-encode to PNG when the OCR backend does
//! not accept the format natively), start an OCR job, forward its progress
//! updates, and finish with the recognized text.
//!
//! PNG is the one format every backend must accept, so it always passes
//! through. BMP is always transcoded: compressed BMP support is too
//! inconsistent across OCR engines to trust a backend that claims it.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ocr::{OcrProgress, OcrProvider};

use super::{Input, ParseError, ParseStream, Parser, Stage, StreamResult};

/// When an image is decoded and re-encoded before OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transcode {
    /// Forward the original bytes untouched.
    Never,
    /// Re-encode to PNG unless the backend accepts the format natively.
    IfUnsupported(ImageFormat),
    /// Always re-encode to PNG.
    Always(ImageFormat),
}

/// Parser for one raster image content type.
pub struct ImageParser {
    mime: &'static str,
    transcode: Transcode,
    ocr: Arc<dyn OcrProvider>,
}

impl ImageParser {
    /// `image/png` — passed straight to OCR.
    pub fn png(ocr: Arc<dyn OcrProvider>) -> Self {
        Self {
            mime: "image/png",
            transcode: Transcode::Never,
            ocr,
        }
    }

    /// `image/jpeg` — forwarded when supported, transcoded otherwise.
    pub fn jpeg(ocr: Arc<dyn OcrProvider>) -> Self {
        Self {
            mime: "image/jpeg",
            transcode: Transcode::IfUnsupported(ImageFormat::Jpeg),
            ocr,
        }
    }

    /// `image/bmp` — always transcoded to PNG.
    pub fn bmp(ocr: Arc<dyn OcrProvider>) -> Self {
        Self {
            mime: "image/bmp",
            transcode: Transcode::Always(ImageFormat::Bmp),
            ocr,
        }
    }

    /// `image/gif` — forwarded when supported, transcoded otherwise.
    pub fn gif(ocr: Arc<dyn OcrProvider>) -> Self {
        Self {
            mime: "image/gif",
            transcode: Transcode::IfUnsupported(ImageFormat::Gif),
            ocr,
        }
    }

    /// `image/tiff` — forwarded when supported, transcoded otherwise.
    pub fn tiff(ocr: Arc<dyn OcrProvider>) -> Self {
        Self {
            mime: "image/tiff",
            transcode: Transcode::IfUnsupported(ImageFormat::Tiff),
            ocr,
        }
    }

    /// `image/webp` — forwarded when supported, transcoded otherwise.
    pub fn webp(ocr: Arc<dyn OcrProvider>) -> Self {
        Self {
            mime: "image/webp",
            transcode: Transcode::IfUnsupported(ImageFormat::WebP),
            ocr,
        }
    }
}

impl Parser for ImageParser {
    fn supported_mime_types(&self) -> Vec<String> {
        vec![self.mime.to_string()]
    }

    fn parse_stream(
        &self,
        ctx: CancellationToken,
        input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        let prepare: PrepareFn = match self.transcode {
            Transcode::Never => Box::new(|bytes| Ok(bytes)),
            Transcode::IfUnsupported(_) if self.ocr.supports(self.mime) => {
                Box::new(|bytes| Ok(bytes))
            }
            Transcode::IfUnsupported(format) | Transcode::Always(format) => {
                Box::new(move |bytes| transcode_to_png(&bytes, format))
            }
        };

        // The stream owns a child token so `close` can cancel its OCR job
        // without touching the caller's context.
        Box::new(OcrImageStream::new(
            ctx.child_token(),
            path,
            input,
            self.ocr.clone(),
            prepare,
        ))
    }
}

/// Maps the raw input bytes to the bytes handed to OCR.
pub(crate) type PrepareFn =
    Box<dyn FnOnce(Vec<u8>) -> Result<Vec<u8>, ParseError> + Send>;

/// Decodes `bytes` as `format` and re-encodes them as PNG.
pub(crate) fn transcode_to_png(bytes: &[u8], format: ImageFormat) -> Result<Vec<u8>, ParseError> {
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ParseError::BadFile(format!("failed to decode image for transcoding: {e}")))?;

    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ParseError::BadFile(format!("failed to transcode image to PNG: {e}")))?;
    Ok(out.into_inner())
}

enum OcrImageState {
    Pending { input: Input, prepare: PrepareFn },
    Running { job: OcrProgress },
    Done,
}

/// Shared stream driving one OCR job over one image.
pub(crate) struct OcrImageStream {
    ctx: CancellationToken,
    path: String,
    ocr: Arc<dyn OcrProvider>,
    state: OcrImageState,
    announced: bool,
}

impl OcrImageStream {
    pub(crate) fn new(
        ctx: CancellationToken,
        path: &str,
        input: Input,
        ocr: Arc<dyn OcrProvider>,
        prepare: PrepareFn,
    ) -> Self {
        Self {
            ctx,
            path: path.to_string(),
            ocr,
            state: OcrImageState::Pending { input, prepare },
            announced: false,
        }
    }

    fn completed(&mut self, result: StreamResult) -> Option<StreamResult> {
        self.state = OcrImageState::Done;
        Some(result)
    }
}

#[async_trait]
impl ParseStream for OcrImageStream {
    async fn next(&mut self) -> Option<StreamResult> {
        if !self.announced {
            self.announced = true;
            return Some(StreamResult::new(&self.path, Stage::New));
        }

        loop {
            match std::mem::replace(&mut self.state, OcrImageState::Done) {
                OcrImageState::Pending { mut input, prepare } => {
                    let cancel = self.ctx.clone();
                    let mut bytes = Vec::new();
                    let read = tokio::select! {
                        read = input.read_to_end(&mut bytes) => read,
                        _ = cancel.cancelled() => {
                            let result = StreamResult::new(&self.path, Stage::Completed)
                                .with_error(ParseError::Canceled);
                            return self.completed(result);
                        }
                    };
                    if let Err(err) = read {
                        let result = StreamResult::new(&self.path, Stage::Completed)
                            .with_error(ParseError::Io(err));
                        return self.completed(result);
                    }

                    let prepared = match prepare(bytes) {
                        Ok(prepared) => prepared,
                        Err(err) => {
                            let result =
                                StreamResult::new(&self.path, Stage::Completed).with_error(err);
                            return self.completed(result);
                        }
                    };

                    debug!(path = %self.path, bytes = prepared.len(), "starting OCR job");
                    let job = self
                        .ocr
                        .ocr_with_progress(self.ctx.child_token(), prepared);
                    self.state = OcrImageState::Running { job };
                }
                OcrImageState::Running { mut job } => match job.next_update().await {
                    Some(percent) => {
                        let result = StreamResult::new(&self.path, Stage::Update)
                            .with_progress(percent);
                        self.state = OcrImageState::Running { job };
                        return Some(result);
                    }
                    None => {
                        let result = match job.text().await {
                            Ok(text) => StreamResult::new(&self.path, Stage::Completed)
                                .with_progress(100)
                                .with_text(text),
                            Err(err) => StreamResult::new(&self.path, Stage::Completed)
                                .with_error(ParseError::Ocr(err)),
                        };
                        return self.completed(result);
                    }
                },
                OcrImageState::Done => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let OcrImageState::Running { job } =
            std::mem::replace(&mut self.state, OcrImageState::Done)
        {
            // Join the job so a pooled worker is returned before we go away.
            self.ctx.cancel();
            let _ = job.text().await;
        }
    }
}
