//! PDF parser.
//!
//! Each page is rasterized at 400 DPI (ARGB32, white background) through
//! poppler/cairo, wrapped into a Raw-BGRA frame and handed back to the
//! composite parser, which routes it through the raw-BGRA path into OCR.
//! Document metadata, when present, is reported as an early `Update`
//! framed with `------METADATA START------` / `------METADATA END------`;
//! the terminal event carries the aggregated text of all pages.
//!
//! Rendering requires the poppler-glib and cairo system libraries and is
//! gated behind the `pdf` cargo feature. Without it every PDF finishes
//! immediately with [`ParseError::ParserDisabled`].

use std::sync::Weak;

use tokio_util::sync::CancellationToken;

#[cfg(not(feature = "pdf"))]
use super::{ImmediateStream, ParseError, Stage, StreamResult};
use super::{Input, ParseStream, Parser};

/// Render resolution. Poppler page sizes are in points (1/72 inch).
#[cfg(feature = "pdf")]
const RENDER_DPI: f64 = 400.0;

pub struct PdfParser {
    /// Back-edge to the composite parser that OCRs rendered pages.
    #[cfg_attr(not(feature = "pdf"), allow(dead_code))]
    inner: Weak<dyn Parser>,
}

impl PdfParser {
    pub fn new(inner: Weak<dyn Parser>) -> Self {
        Self { inner }
    }
}

impl Parser for PdfParser {
    fn supported_mime_types(&self) -> Vec<String> {
        vec!["application/pdf".to_string()]
    }

    #[cfg(not(feature = "pdf"))]
    fn parse_stream(
        &self,
        _ctx: CancellationToken,
        _input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        Box::new(ImmediateStream::new(vec![
            StreamResult::new(path, Stage::New),
            StreamResult::new(path, Stage::Completed).with_error(ParseError::ParserDisabled),
        ]))
    }

    #[cfg(feature = "pdf")]
    fn parse_stream(
        &self,
        ctx: CancellationToken,
        input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        Box::new(enabled::PdfStream::new(
            ctx,
            input,
            path,
            self.inner.clone(),
        ))
    }
}

#[cfg(feature = "pdf")]
mod enabled {
    use std::sync::{Arc, Weak};

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;
    use tracing::debug;

    use crate::parser::bgra::BgraImage;
    use crate::parser::{Input, ParseError, ParseStream, Parser, Stage, StreamResult};

    use super::RENDER_DPI;

    /// Opens the document and returns `(n_pages, metadata)`.
    ///
    /// Poppler objects are not `Send`, so every call opens the document,
    /// does its work and drops it before returning to the async world.
    fn inspect_document(data: &[u8]) -> Result<(i32, Option<String>), ParseError> {
        let bytes = glib::Bytes::from(data);
        let document = poppler::Document::from_bytes(&bytes, None)
            .map_err(|e| ParseError::BadFile(format!("failed to open PDF document: {e}")))?;
        let metadata = document.metadata().map(|m| m.to_string());
        Ok((document.n_pages(), metadata))
    }

    /// Renders one page to a Raw-BGRA frame at [`RENDER_DPI`].
    fn render_page(data: &[u8], index: i32) -> Result<Vec<u8>, ParseError> {
        let bytes = glib::Bytes::from(data);
        let document = poppler::Document::from_bytes(&bytes, None)
            .map_err(|e| ParseError::BadFile(format!("failed to open PDF document: {e}")))?;
        let page = document
            .page(index)
            .ok_or_else(|| ParseError::BadFile(format!("PDF page {index} is missing")))?;

        let scale = RENDER_DPI / 72.0;
        let (width_pt, height_pt) = page.size();
        let width = (width_pt * scale).ceil() as i32;
        let height = (height_pt * scale).ceil() as i32;

        let surface = cairo::ImageSurface::create(cairo::Format::ARgb32, width, height)
            .map_err(|e| ParseError::BadFile(format!("failed to create render surface: {e}")))?;
        {
            let cr = cairo::Context::new(&surface)
                .map_err(|e| ParseError::BadFile(format!("failed to create cairo context: {e}")))?;
            cr.set_source_rgb(1.0, 1.0, 1.0);
            cr.paint()
                .map_err(|e| ParseError::BadFile(format!("failed to paint background: {e}")))?;
            cr.scale(scale, scale);
            page.render(&cr);
        }
        surface.flush();

        let stride = surface.stride() as u64;
        let pixels = surface
            .data()
            .map_err(|e| ParseError::BadFile(format!("failed to read rendered pixels: {e}")))?
            .to_vec();

        // Cairo ARGB32 is BGRA in memory on little-endian hosts, which is
        // exactly what the raw carrier transports.
        Ok(BgraImage {
            width: width as u64,
            height: height as u64,
            stride,
            data: pixels,
        }
        .encode())
    }

    enum PdfState {
        Init { input: Input },
        Page { index: i32 },
        Done,
    }

    pub(super) struct PdfStream {
        ctx: CancellationToken,
        path: String,
        inner_parser: Weak<dyn Parser>,
        state: PdfState,
        data: Arc<Vec<u8>>,
        n_pages: i32,
        aggregated: String,
        inner: Option<Box<dyn ParseStream>>,
        pending: std::collections::VecDeque<StreamResult>,
    }

    impl PdfStream {
        pub(super) fn new(
            ctx: CancellationToken,
            input: Input,
            path: &str,
            inner_parser: Weak<dyn Parser>,
        ) -> Self {
            Self {
                ctx,
                path: path.to_string(),
                inner_parser,
                state: PdfState::Init { input },
                data: Arc::new(Vec::new()),
                n_pages: 0,
                aggregated: String::new(),
                inner: None,
                pending: std::collections::VecDeque::new(),
            }
        }

        fn terminal(&mut self, result: StreamResult) -> Option<StreamResult> {
            self.state = PdfState::Done;
            Some(result)
        }

        fn page_progress(&self, page: i32, inner_progress: u8) -> u8 {
            if self.n_pages <= 0 {
                return 100;
            }
            let combined = (100 * page as u32 + u32::from(inner_progress)) / self.n_pages as u32;
            combined.min(100) as u8
        }
    }

    #[async_trait]
    impl ParseStream for PdfStream {
        async fn next(&mut self) -> Option<StreamResult> {
            loop {
                if let Some(event) = self.pending.pop_front() {
                    return Some(event);
                }

                if let Some(inner) = self.inner.as_mut() {
                    let page = match self.state {
                        PdfState::Page { index } => index,
                        _ => 0,
                    };
                    match inner.next().await {
                        Some(event) => match event.stage {
                            Stage::New => continue,
                            Stage::Update => {
                                return Some(
                                    StreamResult::new(&self.path, Stage::Update)
                                        .with_progress(self.page_progress(page, event.progress)),
                                );
                            }
                            Stage::Completed => {
                                if let Some(mut inner) = self.inner.take() {
                                    inner.close().await;
                                }
                                if let Some(err) = event.error {
                                    return self.terminal(
                                        StreamResult::new(&self.path, Stage::Completed)
                                            .with_error(ParseError::Inner {
                                                path: format!("{}#page={}", self.path, page + 1),
                                                source: Box::new(err),
                                            }),
                                    );
                                }
                                if !event.text.is_empty() {
                                    if !self.aggregated.is_empty() {
                                        self.aggregated.push('\n');
                                    }
                                    self.aggregated.push_str(&event.text);
                                }
                                self.state = PdfState::Page { index: page + 1 };
                                return Some(
                                    StreamResult::new(&self.path, Stage::Update)
                                        .with_progress(self.page_progress(page, 100)),
                                );
                            }
                        },
                        None => {
                            self.inner = None;
                        }
                    }
                }

                match std::mem::replace(&mut self.state, PdfState::Done) {
                    PdfState::Init { mut input } => {
                        let cancel = self.ctx.clone();
                        let mut data = Vec::new();
                        let read = tokio::select! {
                            read = input.read_to_end(&mut data) => read,
                            _ = cancel.cancelled() => {
                                return self.terminal(
                                    StreamResult::new(&self.path, Stage::Completed)
                                        .with_error(ParseError::Canceled),
                                );
                            }
                        };
                        if let Err(err) = read {
                            return self.terminal(
                                StreamResult::new(&self.path, Stage::Completed)
                                    .with_error(ParseError::Io(err)),
                            );
                        }

                        let data = Arc::new(data);
                        let inspect_data = data.clone();
                        let inspected = tokio::task::spawn_blocking(move || {
                            inspect_document(&inspect_data)
                        })
                        .await;

                        match inspected {
                            Ok(Ok((n_pages, metadata))) => {
                                debug!(path = %self.path, pages = n_pages, "rendering PDF");
                                self.data = data;
                                self.n_pages = n_pages;
                                self.state = PdfState::Page { index: 0 };
                                if let Some(metadata) = metadata {
                                    self.pending.push_back(
                                        StreamResult::new(&self.path, Stage::Update).with_text(
                                            format!(
                                                "------METADATA START------\n{metadata}\n------METADATA END------\n"
                                            ),
                                        ),
                                    );
                                }
                                return Some(StreamResult::new(&self.path, Stage::New));
                            }
                            Ok(Err(err)) => {
                                self.pending.push_back(
                                    StreamResult::new(&self.path, Stage::Completed)
                                        .with_error(err),
                                );
                                return Some(StreamResult::new(&self.path, Stage::New));
                            }
                            Err(join_err) => {
                                return self.terminal(
                                    StreamResult::new(&self.path, Stage::Completed).with_error(
                                        ParseError::BadFile(format!(
                                            "PDF inspection task failed: {join_err}"
                                        )),
                                    ),
                                );
                            }
                        }
                    }
                    PdfState::Page { index } => {
                        if index >= self.n_pages {
                            let text = std::mem::take(&mut self.aggregated);
                            return self.terminal(
                                StreamResult::new(&self.path, Stage::Completed)
                                    .with_progress(100)
                                    .with_text(text),
                            );
                        }

                        let cancel = self.ctx.clone();
                        let render_data = self.data.clone();
                        let rendered = tokio::select! {
                            rendered = tokio::task::spawn_blocking(move || {
                                render_page(&render_data, index)
                            }) => rendered,
                            _ = cancel.cancelled() => {
                                return self.terminal(
                                    StreamResult::new(&self.path, Stage::Completed)
                                        .with_error(ParseError::Canceled),
                                );
                            }
                        };

                        let frame = match rendered {
                            Ok(Ok(frame)) => frame,
                            Ok(Err(err)) => {
                                return self.terminal(
                                    StreamResult::new(&self.path, Stage::Completed)
                                        .with_error(err),
                                );
                            }
                            Err(join_err) => {
                                return self.terminal(
                                    StreamResult::new(&self.path, Stage::Completed).with_error(
                                        ParseError::BadFile(format!(
                                            "PDF render task failed: {join_err}"
                                        )),
                                    ),
                                );
                            }
                        };

                        let Some(parser) = self.inner_parser.upgrade() else {
                            return self.terminal(
                                StreamResult::new(&self.path, Stage::Completed).with_error(
                                    ParseError::BadFile("inner parser is gone".into()),
                                ),
                            );
                        };
                        self.inner = Some(parser.parse_stream(
                            self.ctx.child_token(),
                            Box::new(std::io::Cursor::new(frame)),
                            &self.path,
                        ));
                        self.state = PdfState::Page { index };
                    }
                    PdfState::Done => return None,
                }
            }
        }

        async fn close(&mut self) {
            if let Some(mut inner) = self.inner.take() {
                inner.close().await;
            }
            self.state = PdfState::Done;
            self.pending.clear();
        }
    }
}

#[cfg(all(test, not(feature = "pdf")))]
mod tests {
    use super::*;
    use crate::parser::composite::CompositeParser;

    #[tokio::test]
    async fn disabled_parser_reports_parser_disabled() {
        let composite = CompositeParser::with_default_parsers(None);
        let parser = PdfParser::new(std::sync::Arc::downgrade(
            &(composite as std::sync::Arc<dyn Parser>),
        ));

        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(std::io::Cursor::new(b"%PDF-1.4".to_vec())),
            "doc.pdf",
        );

        let first = stream.next().await.unwrap();
        assert_eq!(first.stage, Stage::New);
        let second = stream.next().await.unwrap();
        assert_eq!(second.stage, Stage::Completed);
        assert!(matches!(second.error, Some(ParseError::ParserDisabled)));
        assert!(stream.next().await.is_none());
    }
}
