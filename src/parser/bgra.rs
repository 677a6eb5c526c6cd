//! Raw-BGRA in-process image carrier.
//!
//! Rendered PDF pages are handed to OCR as raw pixel buffers instead of
//! paying for an intermediate PNG round-trip. The frame layout, big-endian:
//!
//! ```text
//! magic:  25 bytes, literal "FILE2LLM_RAW_RGBA______%%"
//! width:  u64
//! height: u64
//! stride: u64
//! pixels: height·stride bytes of row-major BGRA, rows padded to stride
//! ```
//!
//! Invariants: `width·4 ≤ stride` and `pixels.len() == height·stride`.
//! The carrier never leaves the process; the composite parser recognizes it
//! by the magic prefix under the content type `image/file2llm-raw-bgra`.

use super::ParseError;

/// Frame magic. The literal is fixed wire format; do not change it.
pub const RAW_BGRA_MAGIC: &[u8] = b"FILE2LLM_RAW_RGBA______%%";

const HEADER_LEN: usize = 25 + 8 + 8 + 8;

/// A decoded Raw-BGRA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgraImage {
    pub width: u64,
    pub height: u64,
    pub stride: u64,
    /// Row-major pixel data, `height * stride` bytes.
    pub data: Vec<u8>,
}

impl BgraImage {
    /// Parses a full frame from bytes.
    pub fn decode(frame: &[u8]) -> Result<Self, ParseError> {
        if frame.len() < HEADER_LEN {
            return Err(ParseError::BadFile("raw BGRA frame too small".into()));
        }
        if &frame[..RAW_BGRA_MAGIC.len()] != RAW_BGRA_MAGIC {
            return Err(ParseError::BadFile(
                "raw BGRA frame header does not match".into(),
            ));
        }

        let mut offset = RAW_BGRA_MAGIC.len();
        let mut read_u64 = || {
            let value = u64::from_be_bytes(frame[offset..offset + 8].try_into().unwrap());
            offset += 8;
            value
        };
        let width = read_u64();
        let height = read_u64();
        let stride = read_u64();
        let data = frame[HEADER_LEN..].to_vec();

        let image = Self {
            width,
            height,
            stride,
            data,
        };
        image.validate()?;
        Ok(image)
    }

    /// Serializes the frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(RAW_BGRA_MAGIC);
        out.extend_from_slice(&self.width.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.stride.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.width.checked_mul(4).map(|w| w > self.stride).unwrap_or(true) {
            return Err(ParseError::BadFile(
                "bad raw BGRA frame: width*4 must be less or equal to stride".into(),
            ));
        }
        let expected = self
            .height
            .checked_mul(self.stride)
            .ok_or_else(|| ParseError::BadFile("raw BGRA frame dimensions overflow".into()))?;
        if self.data.len() as u64 != expected {
            return Err(ParseError::BadFile(
                "raw BGRA frame data size does not match height and stride".into(),
            ));
        }
        Ok(())
    }

    /// Swaps the blue and red channels of every pixel, turning BGRA rows
    /// into RGBA rows without reallocating.
    pub fn swap_to_rgba_in_place(&mut self) {
        let width = self.width as usize;
        let stride = self.stride as usize;
        for row in self.data.chunks_exact_mut(stride.max(1)) {
            for pixel in row[..width * 4].chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }
    }

    /// Copies the pixel rows into a tightly packed `width·height·4` buffer,
    /// dropping stride padding.
    pub fn packed_rows(&self) -> Vec<u8> {
        let width = self.width as usize;
        let stride = self.stride as usize;
        let mut out = Vec::with_capacity(width * 4 * self.height as usize);
        for row in self.data.chunks_exact(stride.max(1)) {
            out.extend_from_slice(&row[..width * 4]);
        }
        out
    }
}
