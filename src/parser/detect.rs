//! Content-type detection over sniffed bytes.
//!
//! Wraps [`infer`] with two custom matchers the registry does not know
//! about: the in-process Raw-BGRA carrier (magic prefix) and RFC 822
//! messages (header-line heuristic, the way general-purpose sniffers
//! detect `message/rfc822`).

use std::sync::OnceLock;

use super::bgra::RAW_BGRA_MAGIC;
use super::RAW_BGRA_MIME;

/// Fallback when nothing matches.
pub const OCTET_STREAM: &str = "application/octet-stream";

pub const EML_MIME: &str = "message/rfc822";

fn raw_bgra_matcher(buf: &[u8]) -> bool {
    buf.starts_with(RAW_BGRA_MAGIC)
}

const EML_HEADER_PREFIXES: &[&str] = &[
    "received:",
    "return-path:",
    "delivered-to:",
    "from:",
    "to:",
    "subject:",
    "date:",
    "message-id:",
    "mime-version:",
    "x-",
];

fn eml_matcher(buf: &[u8]) -> bool {
    let head = match std::str::from_utf8(&buf[..buf.len().min(128)]) {
        Ok(s) => s,
        Err(e) if e.valid_up_to() > 0 => {
            match std::str::from_utf8(&buf[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    let lower = head.to_ascii_lowercase();
    EML_HEADER_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn registry() -> &'static infer::Infer {
    static REGISTRY: OnceLock<infer::Infer> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = infer::Infer::new();
        registry.add(RAW_BGRA_MIME, "file2llm-raw-bgra", raw_bgra_matcher);
        registry.add(EML_MIME, "eml", eml_matcher);
        registry
    })
}

/// Detects the content type of `buf` (the sniff prefix of a stream).
/// Returns [`OCTET_STREAM`] when the bytes match nothing known.
pub fn detect(buf: &[u8]) -> String {
    registry()
        .get(buf)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_png() {
        let png = [0x89u8, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(detect(&png), "image/png");
    }

    #[test]
    fn detects_raw_bgra_frame() {
        let mut frame = RAW_BGRA_MAGIC.to_vec();
        frame.extend_from_slice(&[0u8; 24]);
        assert_eq!(detect(&frame), RAW_BGRA_MIME);
    }

    #[test]
    fn detects_eml_by_headers() {
        let eml = b"From: alice@example.com\r\nTo: bob@example.com\r\n\r\nhi";
        assert_eq!(detect(eml), EML_MIME);
    }

    #[test]
    fn detects_tar_archive() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_cksum();
        builder.append_data(&mut header, "a.txt", &b"hi"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();
        assert_eq!(detect(&bytes), "application/x-tar");
    }

    #[test]
    fn unknown_bytes_fall_back_to_octet_stream() {
        assert_eq!(detect(b"just some plain text"), OCTET_STREAM);
    }
}
