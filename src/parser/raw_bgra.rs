//! Parser for the in-process `image/file2llm-raw-bgra` carrier.
//!
//! Frames arrive from the PDF renderer (see [`super::bgra`] for the wire
//! layout). When the OCR backend declares support for the raw carrier the
//! frame is forwarded untouched; otherwise the pixels are channel-swapped
//! to RGBA in place and PNG-encoded first.

use std::io::Cursor;
use std::sync::Arc;

use image::ImageFormat;
use tokio_util::sync::CancellationToken;

use crate::ocr::OcrProvider;

use super::bgra::BgraImage;
use super::image::{OcrImageStream, PrepareFn};
use super::{Input, ParseError, ParseStream, Parser, RAW_BGRA_MIME};

pub struct RawBgraParser {
    ocr: Arc<dyn OcrProvider>,
}

impl RawBgraParser {
    pub fn new(ocr: Arc<dyn OcrProvider>) -> Self {
        Self { ocr }
    }
}

fn frame_to_png(frame: Vec<u8>) -> Result<Vec<u8>, ParseError> {
    let mut image = BgraImage::decode(&frame)?;
    image.swap_to_rgba_in_place();

    let width = u32::try_from(image.width)
        .map_err(|_| ParseError::BadFile("raw BGRA frame width out of range".into()))?;
    let height = u32::try_from(image.height)
        .map_err(|_| ParseError::BadFile("raw BGRA frame height out of range".into()))?;

    let rgba = image::RgbaImage::from_raw(width, height, image.packed_rows())
        .ok_or_else(|| ParseError::BadFile("raw BGRA frame pixel buffer mismatch".into()))?;

    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(rgba)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ParseError::BadFile(format!("failed to convert frame to PNG: {e}")))?;
    Ok(out.into_inner())
}

impl Parser for RawBgraParser {
    fn supported_mime_types(&self) -> Vec<String> {
        vec![RAW_BGRA_MIME.to_string()]
    }

    fn parse_stream(
        &self,
        ctx: CancellationToken,
        input: Input,
        path: &str,
    ) -> Box<dyn ParseStream> {
        let prepare: PrepareFn = if self.ocr.supports(RAW_BGRA_MIME) {
            // Validate the frame even when forwarding it untouched.
            Box::new(|frame| {
                BgraImage::decode(&frame)?;
                Ok(frame)
            })
        } else {
            Box::new(frame_to_png)
        };

        Box::new(OcrImageStream::new(
            ctx.child_token(),
            path,
            input,
            self.ocr.clone(),
            prepare,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::testutil::MockOcr;
    use crate::parser::Stage;

    fn white_frame(width: u64, height: u64, stride: u64) -> Vec<u8> {
        BgraImage {
            width,
            height,
            stride,
            data: vec![0xFF; (height * stride) as usize],
        }
        .encode()
    }

    async fn drain(stream: &mut dyn ParseStream) -> Vec<crate::parser::StreamResult> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn frame_is_png_encoded_for_png_only_backends() {
        let ocr = MockOcr::new("hello");
        let parser = RawBgraParser::new(Arc::new(ocr.clone()));

        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(white_frame(2, 2, 8))),
            "page-1",
        );
        let events = drain(stream.as_mut()).await;

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert!(last.error.is_none(), "unexpected error: {:?}", last.error);
        assert_eq!(last.text, "hello");
        assert!(ocr.received()[0].starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[tokio::test]
    async fn frame_is_forwarded_raw_when_backend_supports_it() {
        let ocr = MockOcr::new("hello").with_supported(&["image/png", RAW_BGRA_MIME]);
        let parser = RawBgraParser::new(Arc::new(ocr.clone()));
        let frame = white_frame(2, 2, 8);

        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(frame.clone())),
            "page-1",
        );
        drain(stream.as_mut()).await;

        assert_eq!(ocr.received(), vec![frame]);
    }

    #[tokio::test]
    async fn malformed_frame_is_terminal() {
        let parser = RawBgraParser::new(Arc::new(MockOcr::new("hello")));

        let mut stream = parser.parse_stream(
            CancellationToken::new(),
            Box::new(Cursor::new(b"definitely not a frame".to_vec())),
            "page-1",
        );
        let events = drain(stream.as_mut()).await;

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Completed);
        assert!(matches!(last.error, Some(ParseError::BadFile(_))));
    }
}
