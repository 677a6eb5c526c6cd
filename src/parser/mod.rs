//! Recursive streaming parser.
//!
//! Parsers turn a byte stream into a stream of [`StreamResult`] progress
//! events. Plain formats (images) produce events for a single logical file;
//! container formats (TAR archives, emails, PDFs) recurse through the
//! [`composite::CompositeParser`] and surface inner work as nested
//! `sub` results, so consumers always see a flat event stream with a tree
//! inside each event.
//!
//! ```text
//! CompositeParser ──sniff──► PngParser / JpegParser / … ──► OCR
//!        ▲                   RawBgraParser ───────────────► OCR
//!        │ back-edge         PdfParser ──render──► Raw-BGRA frames
//!        └────────────────── TarParser / EmlParser (children)
//! ```
//!
//! Every stream obeys the same protocol: a `New` event introduces a logical
//! file, any number of `Update` events follow, and exactly one terminal
//! `Completed` event ends it — even on error. Progress, when known, is a
//! non-decreasing percentage.

pub mod bgra;
pub mod composite;
pub mod detect;
pub mod eml;
pub mod image;
pub mod pdf;
pub mod raw_bgra;
pub mod tar;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::ocr::OcrError;

/// Content-type token of the in-process Raw-BGRA image carrier.
pub const RAW_BGRA_MIME: &str = "image/file2llm-raw-bgra";

/// Byte stream handed to a parser.
pub type Input = Box<dyn AsyncRead + Send + Unpin>;

/// Errors attached to parse stream events.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The bytes do not conform to the advertised content type.
    #[error("bad file or corrupted: {0}")]
    BadFile(String),

    /// No parser is registered for the detected content type.
    #[error("mime type of the file is not supported: {0}")]
    MimeTypeNotSupported(String),

    /// A parser for the type exists but its feature was compiled out.
    #[error("parser disabled")]
    ParserDisabled,

    /// The OCR backend failed or was canceled.
    #[error("OCR failed")]
    Ocr(#[from] OcrError),

    /// Reading the input stream failed.
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    /// A nested child of a container failed.
    #[error("failed to parse embedded part {path}")]
    Inner {
        path: String,
        #[source]
        source: Box<ParseError>,
    },

    /// The cancellation token fired mid-parse.
    #[error("parse canceled")]
    Canceled,
}

/// Progress stage carried by a [`StreamResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A new logical file is about to stream.
    New,
    /// Intermediate progress (and possibly text) for the file.
    Update,
    /// Terminal event; exactly one per logical file, even on error.
    Completed,
}

/// One progress event.
///
/// Containers report inner work through `sub`: the outer node names the
/// container, the deepest nested node names the file the work currently
/// concerns. Consumers that only care about the active file should call
/// [`StreamResult::deepest`].
#[derive(Debug)]
pub struct StreamResult {
    pub path: String,
    pub stage: Stage,
    /// Completion percentage in `[0, 100]` when known.
    pub progress: u8,
    /// Incremental or final text payload.
    pub text: String,
    /// Message headers, present on the `New` event of email streams.
    pub headers: Option<BTreeMap<String, Vec<String>>>,
    /// Nested result for container formats.
    pub sub: Option<Box<StreamResult>>,
    pub error: Option<ParseError>,
}

impl StreamResult {
    pub fn new(path: impl Into<String>, stage: Stage) -> Self {
        Self {
            path: path.into(),
            stage,
            progress: 0,
            text: String::new(),
            headers: None,
            sub: None,
            error: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, Vec<String>>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_sub(mut self, sub: StreamResult) -> Self {
        self.sub = Some(Box::new(sub));
        self
    }

    pub fn with_error(mut self, error: ParseError) -> Self {
        self.error = Some(error);
        self
    }

    /// The deepest nested result. This is the node that is authoritative for
    /// the file currently being worked on.
    pub fn deepest(&self) -> &StreamResult {
        let mut node = self;
        while let Some(sub) = &node.sub {
            node = sub;
        }
        node
    }

    /// Consuming variant of [`StreamResult::deepest`].
    pub fn into_deepest(mut self) -> StreamResult {
        while let Some(sub) = self.sub {
            self = *sub;
        }
        self
    }
}

/// Pull iterator over parse events.
///
/// After the terminal `Completed` event, `next` keeps returning `None`.
/// `close` releases backing resources (OCR jobs, renderers) and cancels
/// inner work; it is safe to call mid-stream or more than once.
#[async_trait]
pub trait ParseStream: Send {
    async fn next(&mut self) -> Option<StreamResult>;
    async fn close(&mut self);
}

/// A format parser.
pub trait Parser: Send + Sync {
    /// Content types this parser accepts.
    fn supported_mime_types(&self) -> Vec<String>;

    /// Starts parsing `input`. The returned stream does no work until
    /// polled.
    fn parse_stream(&self, ctx: CancellationToken, input: Input, path: &str)
        -> Box<dyn ParseStream>;
}

/// A stream that is already finished: it emits the given events and stops.
/// Used for terminal error paths where no real work happens.
#[cfg(not(feature = "pdf"))]
pub(crate) struct ImmediateStream {
    events: std::collections::VecDeque<StreamResult>,
}

#[cfg(not(feature = "pdf"))]
impl ImmediateStream {
    pub(crate) fn new(events: Vec<StreamResult>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

#[cfg(not(feature = "pdf"))]
#[async_trait]
impl ParseStream for ImmediateStream {
    async fn next(&mut self) -> Option<StreamResult> {
        self.events.pop_front()
    }

    async fn close(&mut self) {
        self.events.clear();
    }
}
