//! TAR archive parser.
//!
//! Walks entries in header order and delegates every regular file to the
//! composite parser. Inner events are forwarded wrapped as sub-results
//! under the archive's own path, so the archive brackets its children:
//! outer `New` first, then each child's full stream, then the outer
//! terminal event. A child that fails to parse carries the error on its
//! own terminal event and the walk continues.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Weak;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Input, ParseError, ParseStream, Parser, Stage, StreamResult};

pub struct TarParser {
    /// Back-edge to the composite parser that decodes archive entries.
    inner: Weak<dyn Parser>,
}

impl TarParser {
    pub fn new(inner: Weak<dyn Parser>) -> Self {
        Self { inner }
    }
}

impl Parser for TarParser {
    fn supported_mime_types(&self) -> Vec<String> {
        vec!["application/x-tar".to_string()]
    }

    fn parse_stream(
        &self,
        ctx: CancellationToken,
        input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        Box::new(TarStream {
            ctx,
            path: path.to_string(),
            inner_parser: self.inner.clone(),
            state: TarState::Announce { input },
            current: None,
        })
    }
}

struct TarEntry {
    path: String,
    bytes: Vec<u8>,
}

enum TarState {
    Announce { input: Input },
    Walking {
        entries: VecDeque<TarEntry>,
        terminal_error: Option<ParseError>,
    },
    Done,
}

struct TarStream {
    ctx: CancellationToken,
    path: String,
    inner_parser: Weak<dyn Parser>,
    state: TarState,
    current: Option<Box<dyn ParseStream>>,
}

/// Reads the archive into per-entry buffers. A malformed header stops the
/// walk but the entries collected so far are still processed; the error is
/// reported on the archive's terminal event.
fn collect_entries(archive_path: &str, bytes: &[u8]) -> (VecDeque<TarEntry>, Option<ParseError>) {
    let mut entries = VecDeque::new();
    let mut archive = ::tar::Archive::new(bytes);

    let iter = match archive.entries() {
        Ok(iter) => iter,
        Err(err) => {
            return (
                entries,
                Some(ParseError::BadFile(format!("failed to open tar archive: {err}"))),
            )
        }
    };

    for entry in iter {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                return (
                    entries,
                    Some(ParseError::BadFile(format!("failed to read tar header: {err}"))),
                )
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = match entry.path() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(err) => {
                return (
                    entries,
                    Some(ParseError::BadFile(format!("bad tar entry name: {err}"))),
                )
            }
        };

        let mut data = Vec::with_capacity(entry.size() as usize);
        if let Err(err) = entry.read_to_end(&mut data) {
            return (
                entries,
                Some(ParseError::BadFile(format!("failed to read tar entry: {err}"))),
            );
        }

        entries.push_back(TarEntry {
            path: join_paths(archive_path, &name),
            bytes: data,
        });
    }

    (entries, None)
}

pub(crate) fn join_paths(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if base.is_empty() {
        child.to_string()
    } else {
        format!("{base}/{child}")
    }
}

#[async_trait]
impl ParseStream for TarStream {
    async fn next(&mut self) -> Option<StreamResult> {
        loop {
            // Drain the active child stream first.
            if let Some(stream) = self.current.as_mut() {
                match stream.next().await {
                    Some(event) => {
                        return Some(
                            StreamResult::new(&self.path, Stage::Update).with_sub(event),
                        );
                    }
                    None => {
                        if let Some(mut stream) = self.current.take() {
                            stream.close().await;
                        }
                    }
                }
            }

            match std::mem::replace(&mut self.state, TarState::Done) {
                TarState::Announce { mut input } => {
                    let mut bytes = Vec::new();
                    let read = tokio::select! {
                        read = input.read_to_end(&mut bytes) => read,
                        _ = self.ctx.cancelled() => {
                            return Some(
                                StreamResult::new(&self.path, Stage::Completed)
                                    .with_error(ParseError::Canceled),
                            );
                        }
                    };
                    if let Err(err) = read {
                        return Some(
                            StreamResult::new(&self.path, Stage::Completed)
                                .with_error(ParseError::Io(err)),
                        );
                    }

                    let (entries, terminal_error) = collect_entries(&self.path, &bytes);
                    debug!(path = %self.path, entries = entries.len(), "walking tar archive");
                    self.state = TarState::Walking {
                        entries,
                        terminal_error,
                    };
                    return Some(StreamResult::new(&self.path, Stage::New));
                }
                TarState::Walking {
                    mut entries,
                    terminal_error,
                } => match entries.pop_front() {
                    Some(entry) => {
                        let Some(parser) = self.inner_parser.upgrade() else {
                            return Some(
                                StreamResult::new(&self.path, Stage::Completed).with_error(
                                    ParseError::BadFile("inner parser is gone".into()),
                                ),
                            );
                        };
                        self.current = Some(parser.parse_stream(
                            self.ctx.child_token(),
                            Box::new(std::io::Cursor::new(entry.bytes)),
                            &entry.path,
                        ));
                        self.state = TarState::Walking {
                            entries,
                            terminal_error,
                        };
                    }
                    None => {
                        let mut result = StreamResult::new(&self.path, Stage::Completed);
                        if let Some(err) = terminal_error {
                            result = result.with_error(err);
                        }
                        return Some(result);
                    }
                },
                TarState::Done => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.current.take() {
            stream.close().await;
        }
        self.state = TarState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::testutil::MockOcr;
    use crate::parser::composite::CompositeParser;
    use crate::parser::image::ImageParser;
    use std::io::Cursor;
    use std::sync::Arc;

    fn png_fixture() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 255, 255, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn tar_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = ::tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = ::tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn composite_with_png() -> Arc<CompositeParser> {
        let ocr: Arc<dyn crate::ocr::OcrProvider> = Arc::new(MockOcr::new("inner text"));
        let composite = CompositeParser::new();
        composite.register(Arc::new(ImageParser::png(ocr)));
        composite
    }

    async fn drain(stream: &mut dyn ParseStream) -> Vec<StreamResult> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn join_handles_slashes() {
        assert_eq!(join_paths("a/b.tar", "c.png"), "a/b.tar/c.png");
        assert_eq!(join_paths("a/b.tar/", "/c.png"), "a/b.tar/c.png");
        assert_eq!(join_paths("", "c.png"), "c.png");
    }

    #[tokio::test]
    async fn forwards_children_as_sub_results() {
        let composite = composite_with_png();
        let png = png_fixture();
        let tar_bytes = tar_fixture(&[("one.png", &png), ("two.png", &png)]);

        let parser = TarParser::new(Arc::downgrade(
            &(composite.clone() as Arc<dyn Parser>),
        ));
        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(tar_bytes)),
            "bundle.tar",
        );
        let events = drain(stream.as_mut()).await;

        assert_eq!(events.first().unwrap().stage, Stage::New);
        assert_eq!(events.first().unwrap().path, "bundle.tar");

        let child_completions: Vec<&StreamResult> = events
            .iter()
            .filter(|e| e.sub.is_some())
            .map(|e| e.deepest())
            .filter(|d| d.stage == Stage::Completed)
            .collect();
        assert_eq!(child_completions.len(), 2);
        assert_eq!(child_completions[0].path, "bundle.tar/one.png");
        assert_eq!(child_completions[0].text, "inner text");
        assert_eq!(child_completions[1].path, "bundle.tar/two.png");

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert_eq!(last.path, "bundle.tar");
        assert!(last.error.is_none());
    }

    #[tokio::test]
    async fn failing_child_does_not_stop_the_archive() {
        let composite = composite_with_png();
        let png = png_fixture();
        let tar_bytes = tar_fixture(&[
            ("broken.xyz", b"unsupported content"),
            ("good.png", &png),
        ]);

        let parser = TarParser::new(Arc::downgrade(
            &(composite.clone() as Arc<dyn Parser>),
        ));
        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(tar_bytes)),
            "bundle.tar",
        );
        let events = drain(stream.as_mut()).await;

        let completions: Vec<&StreamResult> = events
            .iter()
            .filter(|e| e.sub.is_some())
            .map(|e| e.deepest())
            .filter(|d| d.stage == Stage::Completed)
            .collect();
        assert_eq!(completions.len(), 2);
        assert!(matches!(
            completions[0].error,
            Some(ParseError::MimeTypeNotSupported(_))
        ));
        assert!(completions[1].error.is_none());

        assert!(events.last().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn garbage_archive_is_terminal_bad_file() {
        let composite = composite_with_png();
        let parser = TarParser::new(Arc::downgrade(
            &(composite.clone() as Arc<dyn Parser>),
        ));
        // 1024 bytes of zeros parse as an empty (terminated) archive, so use
        // text junk long enough to break the header checksum instead.
        let junk = b"this is definitely not a tar archive".repeat(40);
        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(junk)),
            "bundle.tar",
        );
        let events = drain(stream.as_mut()).await;

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert!(matches!(last.error, Some(ParseError::BadFile(_))));
    }
}
