//! Email (`message/rfc822`) parser.
//!
//! The message headers are reported on the `New` event, both as a map and
//! rendered into the event text. `text/plain` body parts accumulate into
//! the email's own text; every other part is delegated to the composite
//! parser under a synthetic child path and forwarded as sub-results.
//! Inline parts (anything without `Content-Disposition: attachment`)
//! additionally have their final text appended to the email's text between
//! framing markers, so the email reads as one document while attachments
//! stay separately addressable.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Weak;

use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders, PartType};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::tar::join_paths;
use super::{Input, ParseError, ParseStream, Parser, Stage, StreamResult};

pub struct EmlParser {
    /// Back-edge to the composite parser that decodes non-text parts.
    inner: Weak<dyn Parser>,
}

impl EmlParser {
    pub fn new(inner: Weak<dyn Parser>) -> Self {
        Self { inner }
    }
}

impl Parser for EmlParser {
    fn supported_mime_types(&self) -> Vec<String> {
        vec![super::detect::EML_MIME.to_string()]
    }

    fn parse_stream(
        &self,
        ctx: CancellationToken,
        input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        Box::new(EmlStream {
            ctx,
            path: path.to_string(),
            inner_parser: self.inner.clone(),
            state: EmlState::Init { input },
            current: None,
            pending: VecDeque::new(),
        })
    }
}

/// One body part, extracted up front so the stream owns its data.
enum PlannedPart {
    /// A `text/plain` body: becomes the email's own text.
    Text(String),
    /// Anything else: delegated to the inner parser.
    Delegate {
        path: String,
        bytes: Vec<u8>,
        attachment: bool,
    },
}

enum EmlState {
    Init { input: Input },
    Walking { parts: VecDeque<PlannedPart> },
    Done,
}

struct EmlStream {
    ctx: CancellationToken,
    path: String,
    inner_parser: Weak<dyn Parser>,
    state: EmlState,
    /// Active child stream and whether its part is inline.
    current: Option<(Box<dyn ParseStream>, String, bool)>,
    pending: VecDeque<StreamResult>,
}

/// Parses the raw RFC 822 header block into a name → values map, unfolding
/// continuation lines. Used for the `New` event; body decoding is done by
/// `mail-parser`.
fn raw_headers(data: &[u8]) -> BTreeMap<String, Vec<String>> {
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let text = String::from_utf8_lossy(data);
    let head = text
        .split("\r\n\r\n")
        .next()
        .and_then(|h| h.split("\n\n").next())
        .unwrap_or("");

    let mut lines = head.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let mut value = value.trim().to_string();
        while let Some(next) = lines.peek() {
            if next.starts_with(' ') || next.starts_with('\t') {
                value.push(' ');
                value.push_str(next.trim());
                lines.next();
            } else {
                break;
            }
        }
        headers
            .entry(name.trim().to_string())
            .or_default()
            .push(value);
    }
    headers
}

fn render_headers(headers: &BTreeMap<String, Vec<String>>) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let mut out = String::from("------ Headers start------\n");
    for (name, values) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&values.join(", "));
        out.push('\n');
    }
    out.push_str("------ Headers end------\n\n");
    out
}

/// Part file name, in order of preference: the disposition `filename`
/// parameter, the content-type `name` parameter, or `ext_<partIndex>`.
fn part_file_name(part: &mail_parser::MessagePart<'_>, index: usize) -> String {
    let from_disposition = part
        .content_disposition()
        .and_then(|d| d.attribute("filename"))
        .map(str::to_string);
    let from_content_type = part
        .content_type()
        .and_then(|ct| ct.attribute("name"))
        .map(str::to_string);

    from_disposition
        .or(from_content_type)
        .map(|name| {
            name.rsplit(['/', '\\'])
                .next()
                .unwrap_or(&name)
                .to_string()
        })
        .unwrap_or_else(|| format!("ext_{index}"))
}

fn is_attachment(part: &mail_parser::MessagePart<'_>) -> bool {
    part.content_disposition()
        .map(|d| d.ctype().eq_ignore_ascii_case("attachment"))
        .unwrap_or(false)
}

fn is_plain_text(part: &mail_parser::MessagePart<'_>) -> bool {
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct
                    .subtype()
                    .map(|s| s.eq_ignore_ascii_case("plain"))
                    .unwrap_or(true)
        }
        // No content type on a text part means plain text.
        None => true,
    }
}

/// Flattens the message into planned parts. Returns the header map as well.
fn plan_message(
    path: &str,
    data: &[u8],
) -> Result<(BTreeMap<String, Vec<String>>, VecDeque<PlannedPart>), ParseError> {
    let message = MessageParser::default()
        .parse(data)
        .filter(|m| !m.parts.is_empty())
        .ok_or_else(|| ParseError::BadFile("failed to parse email message".into()))?;

    let headers = raw_headers(data);
    let mut parts = VecDeque::new();

    for (index, part) in message.parts.iter().enumerate() {
        match &part.body {
            PartType::Multipart(_) => continue,
            PartType::Text(text) if is_plain_text(part) => {
                parts.push_back(PlannedPart::Text(text.to_string()));
            }
            PartType::Text(text) => {
                parts.push_back(PlannedPart::Delegate {
                    path: join_paths(path, &part_file_name(part, index)),
                    bytes: text.as_bytes().to_vec(),
                    attachment: is_attachment(part),
                });
            }
            PartType::Html(html) => {
                parts.push_back(PlannedPart::Delegate {
                    path: join_paths(path, &part_file_name(part, index)),
                    bytes: html.as_bytes().to_vec(),
                    attachment: is_attachment(part),
                });
            }
            PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
                parts.push_back(PlannedPart::Delegate {
                    path: join_paths(path, &part_file_name(part, index)),
                    bytes: bytes.to_vec(),
                    attachment: is_attachment(part),
                });
            }
            PartType::Message(nested) => {
                parts.push_back(PlannedPart::Delegate {
                    path: join_paths(path, &part_file_name(part, index)),
                    bytes: nested.raw_message.to_vec(),
                    attachment: is_attachment(part),
                });
            }
        }
    }

    Ok((headers, parts))
}

#[async_trait]
impl ParseStream for EmlStream {
    async fn next(&mut self) -> Option<StreamResult> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            // Drain the active child stream.
            if let Some((stream, part_path, attachment)) = self.current.as_mut() {
                match stream.next().await {
                    Some(event) => {
                        let inline_final = !*attachment
                            && event.stage == Stage::Completed
                            && event.path == *part_path
                            && event.error.is_none();
                        if inline_final && !event.text.is_empty() {
                            self.pending.push_back(
                                StreamResult::new(&self.path, Stage::Update).with_text(format!(
                                    "--- Inline attachment begin: {part_path} ---\n{}\n--- Inline attachment end: {part_path} ---\n",
                                    event.text
                                )),
                            );
                        }
                        return Some(
                            StreamResult::new(&self.path, Stage::Update).with_sub(event),
                        );
                    }
                    None => {
                        if let Some((mut stream, _, _)) = self.current.take() {
                            stream.close().await;
                        }
                    }
                }
            }

            match std::mem::replace(&mut self.state, EmlState::Done) {
                EmlState::Init { mut input } => {
                    let mut data = Vec::new();
                    let read = tokio::select! {
                        read = input.read_to_end(&mut data) => read,
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

                    match plan_message(&self.path, &data) {
                        Ok((headers, parts)) => {
                            debug!(path = %self.path, parts = parts.len(), "walking email parts");
                            self.state = EmlState::Walking { parts };
                            let rendered = render_headers(&headers);
                            return Some(
                                StreamResult::new(&self.path, Stage::New)
                                    .with_headers(headers)
                                    .with_text(rendered),
                            );
                        }
                        Err(err) => {
                            self.pending.push_back(
                                StreamResult::new(&self.path, Stage::Completed).with_error(err),
                            );
                            return Some(StreamResult::new(&self.path, Stage::New));
                        }
                    }
                }
                EmlState::Walking { mut parts } => match parts.pop_front() {
                    Some(PlannedPart::Text(text)) => {
                        self.state = EmlState::Walking { parts };
                        return Some(
                            StreamResult::new(&self.path, Stage::Update).with_text(text),
                        );
                    }
                    Some(PlannedPart::Delegate {
                        path,
                        bytes,
                        attachment,
                    }) => {
                        let Some(parser) = self.inner_parser.upgrade() else {
                            return Some(
                                StreamResult::new(&self.path, Stage::Completed).with_error(
                                    ParseError::BadFile("inner parser is gone".into()),
                                ),
                            );
                        };
                        let stream = parser.parse_stream(
                            self.ctx.child_token(),
                            Box::new(std::io::Cursor::new(bytes)),
                            &path,
                        );
                        self.current = Some((stream, path, attachment));
                        self.state = EmlState::Walking { parts };
                    }
                    None => {
                        return Some(StreamResult::new(&self.path, Stage::Completed));
                    }
                },
                EmlState::Done => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Some((mut stream, _, _)) = self.current.take() {
            stream.close().await;
        }
        self.state = EmlState::Done;
        self.pending.clear();
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

    fn base64_encode(data: &[u8]) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let mut out = String::new();
        for chunk in data.chunks(3) {
            let b = [
                chunk[0],
                chunk.get(1).copied().unwrap_or(0),
                chunk.get(2).copied().unwrap_or(0),
            ];
            let n = u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]);
            out.push(ALPHABET[(n >> 18 & 63) as usize] as char);
            out.push(ALPHABET[(n >> 12 & 63) as usize] as char);
            out.push(if chunk.len() > 1 {
                ALPHABET[(n >> 6 & 63) as usize] as char
            } else {
                '='
            });
            out.push(if chunk.len() > 2 {
                ALPHABET[(n & 63) as usize] as char
            } else {
                '='
            });
        }
        out
    }

    fn eml_with_attachment(disposition: &str) -> Vec<u8> {
        let png = base64_encode(&png_fixture());
        format!(
            "From: alice@example.com\r\n\
             To: bob@example.com\r\n\
             Subject: report\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"XBOUNDARYX\"\r\n\
             \r\n\
             --XBOUNDARYX\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             body1\r\n\
             --XBOUNDARYX\r\n\
             Content-Type: image/png; name=\"scan.png\"\r\n\
             Content-Disposition: {disposition}; filename=\"scan.png\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {png}\r\n\
             --XBOUNDARYX--\r\n"
        )
        .into_bytes()
    }

    fn parser_with_composite() -> (Arc<CompositeParser>, EmlParser) {
        let ocr: Arc<dyn crate::ocr::OcrProvider> = Arc::new(MockOcr::new("scanned words"));
        let composite = CompositeParser::new();
        composite.register(Arc::new(ImageParser::png(ocr)));
        let weak = Arc::downgrade(&(composite.clone() as Arc<dyn Parser>));
        (composite, EmlParser::new(weak))
    }

    async fn drain(stream: &mut dyn ParseStream) -> Vec<StreamResult> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn raw_headers_unfold_continuations() {
        let headers = raw_headers(
            b"Subject: a very\r\n long subject\r\nTo: bob@example.com\r\nTo: carol@example.com\r\n\r\nbody",
        );
        assert_eq!(headers["Subject"], vec!["a very long subject"]);
        assert_eq!(headers["To"], vec!["bob@example.com", "carol@example.com"]);
    }

    #[tokio::test]
    async fn plain_body_and_attachment_stream() {
        let (_composite, parser) = parser_with_composite();
        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(eml_with_attachment("attachment"))),
            "mail.eml",
        );
        let events = drain(stream.as_mut()).await;

        // New event carries the header map and renders it as text.
        let first = events.first().unwrap();
        assert_eq!(first.stage, Stage::New);
        let headers = first.headers.as_ref().unwrap();
        assert_eq!(headers["Subject"], vec!["report"]);
        assert!(first.text.contains("Subject: report"));

        // The plain body arrives as the email's own update.
        assert!(events
            .iter()
            .any(|e| e.sub.is_none() && e.stage == Stage::Update && e.text.contains("body1")));

        // The attachment streams as a sub-result under its child path.
        let attachment_end = events
            .iter()
            .filter(|e| e.sub.is_some())
            .map(|e| e.deepest())
            .find(|d| d.stage == Stage::Completed)
            .expect("attachment terminal event");
        assert_eq!(attachment_end.path, "mail.eml/scan.png");
        assert!(attachment_end.error.is_none());
        assert_eq!(attachment_end.text, "scanned words");

        // Attachments are not appended to the email text.
        assert!(!events
            .iter()
            .filter(|e| e.sub.is_none())
            .any(|e| e.text.contains("Inline attachment")));

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert_eq!(last.path, "mail.eml");
        assert!(last.error.is_none());
    }

    #[tokio::test]
    async fn inline_part_text_is_appended_framed() {
        let (_composite, parser) = parser_with_composite();
        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(eml_with_attachment("inline"))),
            "mail.eml",
        );
        let events = drain(stream.as_mut()).await;

        let framed = events
            .iter()
            .filter(|e| e.sub.is_none())
            .find(|e| e.text.contains("Inline attachment begin"))
            .expect("framed inline text");
        assert!(framed
            .text
            .contains("--- Inline attachment begin: mail.eml/scan.png ---"));
        assert!(framed.text.contains("scanned words"));
        assert!(framed
            .text
            .contains("--- Inline attachment end: mail.eml/scan.png ---"));
    }

    #[tokio::test]
    async fn unparseable_message_is_terminal_bad_file() {
        let (_composite, parser) = parser_with_composite();
        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            // Empty input: nothing for the message parser to work with.
            Box::new(Cursor::new(Vec::new())),
            "mail.eml",
        );
        let events = drain(stream.as_mut()).await;

        assert_eq!(events.first().unwrap().stage, Stage::New);
        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert!(matches!(last.error, Some(ParseError::BadFile(_))));
    }
}
