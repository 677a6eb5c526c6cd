//! Composite parser: sniff the content type, dispatch to a format parser.
//!
//! The composite reads up to [`SNIFF_LEN`] bytes from the front of the
//! stream, detects the content type, and replays the sniffed bytes followed
//! by the rest of the stream into the registered parser. Container parsers
//! (PDF, TAR, EML) are constructed with a weak back-edge to the composite so
//! their children go through the same dispatch; recursion terminates because
//! every level either consumes bytes or unwraps one container.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ocr::OcrProvider;

use super::eml::EmlParser;
use super::image::ImageParser;
use super::pdf::PdfParser;
use super::raw_bgra::RawBgraParser;
use super::tar::TarParser;
use super::{detect, Input, ParseError, ParseStream, Parser, Stage, StreamResult};

/// Bytes read from the front of a stream to detect its content type.
pub const SNIFF_LEN: usize = 1024;

pub struct CompositeParser {
    parsers: RwLock<HashMap<String, Arc<dyn Parser>>>,
}

impl CompositeParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            parsers: RwLock::new(HashMap::new()),
        })
    }

    /// Builds the default parser graph: image parsers and the raw-BGRA
    /// carrier when an OCR provider is available, plus the PDF, TAR and
    /// EML container parsers wired back to this composite.
    pub fn with_default_parsers(ocr: Option<Arc<dyn OcrProvider>>) -> Arc<Self> {
        let composite = Self::new();

        if let Some(ocr) = ocr {
            composite.register(Arc::new(ImageParser::png(ocr.clone())));
            composite.register(Arc::new(ImageParser::jpeg(ocr.clone())));
            composite.register(Arc::new(ImageParser::bmp(ocr.clone())));
            composite.register(Arc::new(ImageParser::gif(ocr.clone())));
            composite.register(Arc::new(ImageParser::tiff(ocr.clone())));
            composite.register(Arc::new(ImageParser::webp(ocr.clone())));
            composite.register(Arc::new(RawBgraParser::new(ocr)));
        }

        let back_edge = Arc::downgrade(&(composite.clone() as Arc<dyn Parser>));
        composite.register(Arc::new(PdfParser::new(back_edge.clone())));
        composite.register(Arc::new(TarParser::new(back_edge.clone())));
        composite.register(Arc::new(EmlParser::new(back_edge)));

        composite
    }

    /// Registers a parser for every content type it supports. Later
    /// registrations win on conflict.
    pub fn register(&self, parser: Arc<dyn Parser>) {
        let mut parsers = self.parsers.write().expect("parser map lock poisoned");
        for mime in parser.supported_mime_types() {
            parsers.insert(mime, parser.clone());
        }
    }

    fn snapshot(&self) -> HashMap<String, Arc<dyn Parser>> {
        self.parsers
            .read()
            .expect("parser map lock poisoned")
            .clone()
    }
}

impl Parser for CompositeParser {
    fn supported_mime_types(&self) -> Vec<String> {
        self.parsers
            .read()
            .expect("parser map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn parse_stream(
        &self,
        ctx: CancellationToken,
        input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        Box::new(CompositeStream {
            ctx,
            path: path.to_string(),
            state: CompositeState::Sniff {
                input,
                parsers: self.snapshot(),
            },
            inner: None,
            pending_error: None,
        })
    }
}

enum CompositeState {
    Sniff {
        input: Input,
        parsers: HashMap<String, Arc<dyn Parser>>,
    },
    Active,
    Done,
}

struct CompositeStream {
    ctx: CancellationToken,
    path: String,
    state: CompositeState,
    inner: Option<Box<dyn ParseStream>>,
    pending_error: Option<ParseError>,
}

#[async_trait]
impl ParseStream for CompositeStream {
    async fn next(&mut self) -> Option<StreamResult> {
        loop {
            if let Some(inner) = self.inner.as_mut() {
                match inner.next().await {
                    Some(event) => return Some(event),
                    None => {
                        self.inner = None;
                        self.state = CompositeState::Done;
                        return None;
                    }
                }
            }

            match std::mem::replace(&mut self.state, CompositeState::Done) {
                CompositeState::Sniff { mut input, parsers } => {
                    let cancel = self.ctx.clone();
                    let mut sniff = vec![0u8; SNIFF_LEN];
                    let mut filled = 0;
                    loop {
                        let read = tokio::select! {
                            read = input.read(&mut sniff[filled..]) => read,
                            _ = cancel.cancelled() => {
                                self.pending_error = Some(ParseError::Canceled);
                                return Some(StreamResult::new(&self.path, Stage::New));
                            }
                        };
                        match read {
                            Ok(0) => break,
                            Ok(n) => {
                                filled += n;
                                if filled == SNIFF_LEN {
                                    break;
                                }
                            }
                            Err(err) => {
                                self.pending_error = Some(ParseError::Io(err));
                                return Some(StreamResult::new(&self.path, Stage::New));
                            }
                        }
                    }
                    sniff.truncate(filled);

                    let mime = detect::detect(&sniff);
                    debug!(path = %self.path, mime = %mime, "dispatching stream");

                    match parsers.get(&mime) {
                        Some(parser) => {
                            let replay: Input =
                                Box::new(Cursor::new(sniff).chain(input));
                            self.inner = Some(parser.parse_stream(
                                self.ctx.clone(),
                                replay,
                                &self.path,
                            ));
                            self.state = CompositeState::Active;
                        }
                        None => {
                            self.pending_error =
                                Some(ParseError::MimeTypeNotSupported(mime));
                            return Some(StreamResult::new(&self.path, Stage::New));
                        }
                    }
                }
                CompositeState::Active => return None,
                CompositeState::Done => {
                    return self.pending_error.take().map(|err| {
                        StreamResult::new(&self.path, Stage::Completed).with_error(err)
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close().await;
        }
        self.state = CompositeState::Done;
        self.pending_error = None;
    }
}
