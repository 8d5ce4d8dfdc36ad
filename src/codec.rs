//! Reversible compression for document bodies.
//!
//! Bodies are deflated when a document is idle and inflated again when it
//! is loaded or opened for editing. The JSON configuration stores the
//! deflated bytes as standard base64 text.
use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use log::trace;

use crate::{NotebookError, Result};

/// Largest body a decode is allowed to inflate to.
pub const MAX_DECODED_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Upper bound on the encoded size of a body of `len` bytes.
///
/// Deflate falls back to stored blocks for incompressible input, which costs
/// a few bytes per block; this bound is well above that overhead.
pub fn encoded_len_bound(len: usize) -> usize {
    len + (len >> 3) + 64
}

/// Deflates `text` into raw deflate bytes.
///
/// The output is deterministic for identical input.
pub fn encode(text: &str) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(text.len() / 2 + 16),
        Compression::default(),
    );
    encoder.write_all(text.as_bytes())?;
    let bytes = encoder.finish()?;

    let bound = encoded_len_bound(text.len());
    if bytes.len() > bound {
        return Err(NotebookError::InvalidFormat {
            message: format!(
                "encoded body of {} bytes exceeds bound of {} bytes",
                bytes.len(),
                bound
            ),
        });
    }

    trace!("Encoded body: {} -> {} bytes", text.len(), bytes.len());
    Ok(bytes)
}

/// Inflates bytes produced by [`encode`] back into text.
pub fn decode(bytes: &[u8]) -> Result<String> {
    let mut decoder = DeflateDecoder::new(bytes).take(MAX_DECODED_BODY_BYTES + 1);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| NotebookError::CorruptBody {
            message: format!("invalid deflate stream: {}", e),
        })?;

    if raw.len() as u64 > MAX_DECODED_BODY_BYTES {
        return Err(NotebookError::CorruptBody {
            message: format!("body exceeds {} bytes once inflated", MAX_DECODED_BODY_BYTES),
        });
    }

    String::from_utf8(raw).map_err(|e| NotebookError::CorruptBody {
        message: format!("inflated body is not UTF-8: {}", e),
    })
}

/// Encodes `text` and armors it as base64 for storage inside JSON.
pub fn encode_to_string(text: &str) -> Result<String> {
    Ok(STANDARD.encode(encode(text)?))
}

/// Reverses [`encode_to_string`].
pub fn decode_from_str(armored: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(armored.trim())
        .map_err(|e| NotebookError::CorruptBody {
            message: format!("invalid base64: {}", e),
        })?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_and_unicode_text() {
        let long = "repeat ".repeat(5_000);
        for text in [
            "",
            "a",
            "Shopping list\n- milk\n- eggs",
            "Ünïcødé ✓ 日本語のメモ",
            long.as_str(),
        ] {
            let bytes = encode(text).unwrap();
            assert_eq!(decode(&bytes).unwrap(), text);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(encode(text).unwrap(), encode(text).unwrap());
        assert_eq!(
            encode_to_string(text).unwrap(),
            encode_to_string(text).unwrap()
        );
    }

    #[test]
    fn incompressible_input_stays_within_bound() {
        // Pseudo-random printable characters defeat the compressor.
        let mut state: u32 = 0x1234_5678;
        let text: String = (0..20_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                char::from(b'!' + (state % 94) as u8)
            })
            .collect();

        let bytes = encode(&text).unwrap();
        assert!(bytes.len() <= encoded_len_bound(text.len()));
        assert_eq!(decode(&bytes).unwrap(), text);
    }

    #[test]
    fn garbage_bytes_are_reported_as_corrupt() {
        // 'n' sets the reserved deflate block type.
        let err = decode(b"not deflate at all").unwrap_err();
        assert!(matches!(err, NotebookError::CorruptBody { .. }));
    }

    #[test]
    fn invalid_base64_is_reported_as_corrupt() {
        let err = decode_from_str("%%% not base64 %%%").unwrap_err();
        assert!(matches!(err, NotebookError::CorruptBody { .. }));
    }

    #[test]
    fn armored_round_trip() {
        let armored = encode_to_string("hello notebook").unwrap();
        assert_eq!(decode_from_str(&armored).unwrap(), "hello notebook");
    }
}
