//! Payload framing: optional gzip compression with magic-byte sniffing.
//!
//! Compression is signaled implicitly by the gzip magic bytes at the start of
//! the raw frame, so the wire envelope needs no out-of-band flag. Decoding is
//! best-effort: anything that is not valid gzip is treated as raw UTF-8 text.

use std::io::{Read as _, Write as _};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// First two bytes of every gzip stream (RFC 1952).
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Check whether a raw frame starts with the gzip magic number.
#[must_use]
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= GZIP_MAGIC.len() && data[..GZIP_MAGIC.len()] == GZIP_MAGIC
}

/// Gzip-compress a text payload.
///
/// Falls back to the raw UTF-8 bytes if the encoder fails, so a compression
/// problem degrades to an uncompressed send instead of a lost message.
#[must_use]
pub fn compress(payload: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(payload.as_bytes()).is_err() {
        tracing::error!("gzip encode failed, sending payload uncompressed");
        return payload.as_bytes().to_vec();
    }
    match encoder.finish() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "gzip finish failed, sending payload uncompressed");
            payload.as_bytes().to_vec()
        }
    }
}

/// Decode a raw inbound frame into text.
///
/// Sniffs the gzip magic number; compressed frames are inflated, everything
/// else is interpreted as UTF-8 (lossily, matching the best-effort decode
/// contract for malformed input).
#[must_use]
pub fn decompress(data: &[u8]) -> String {
    if is_gzip(data) {
        let mut decoder = GzDecoder::new(data);
        let mut text = String::new();
        match decoder.read_to_string(&mut text) {
            Ok(_) => return text,
            Err(e) => {
                tracing::warn!(error = %e, "gzip decode failed, falling back to raw text");
            }
        }
    }
    String::from_utf8_lossy(data).into_owned()
}

/// Encode an outbound payload, compressing only when enabled and the payload
/// exceeds the configured threshold.
#[must_use]
pub fn encode(payload: &str, enable_compression: bool, threshold: usize) -> Vec<u8> {
    if enable_compression && payload.len() > threshold {
        compress(payload)
    } else {
        payload.as_bytes().to_vec()
    }
}
