//! Envelope framing with optional zlib compression
//!
//! Every envelope starts with a mark byte. `0x00` is followed by the raw
//! payload. `0x01` is followed by the original length as a 4-byte big-endian
//! integer and the deflated payload.

use crate::config::CompressionConfig;
use crate::{Error, Result};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::Write;

/// Mark byte of an uncompressed envelope
pub const MARK_RAW: u8 = 0x00;

/// Mark byte of a deflated envelope
pub const MARK_DEFLATED: u8 = 0x01;

const LENGTH_PREFIX: usize = 4;

/// Frame a payload, deflating it when it reaches the configured threshold
pub fn compress(data: &[u8], config: &CompressionConfig) -> Result<Vec<u8>> {
    if data.len() < config.threshold {
        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.push(MARK_RAW);
        framed.extend_from_slice(data);
        return Ok(framed);
    }

    let size = u32::try_from(data.len())
        .map_err(|_| Error::Serialization(format!("payload of {} bytes is too large", data.len())))?;

    let mut framed = Vec::with_capacity(data.len() / 2 + 1 + LENGTH_PREFIX);
    framed.push(MARK_DEFLATED);
    framed.extend_from_slice(&size.to_be_bytes());

    let mut encoder = ZlibEncoder::new(framed, Compression::new(config.level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Unframe an envelope produced by [`compress`]
pub fn decompress(envelope: &[u8]) -> Result<Vec<u8>> {
    let (mark, body) = envelope
        .split_first()
        .ok_or_else(|| Error::CorruptPayload("empty envelope".to_string()))?;

    match *mark {
        MARK_RAW => Ok(body.to_vec()),
        MARK_DEFLATED => inflate(body),
        other => Err(Error::CorruptPayload(format!("unknown mark byte 0x{:02x}", other))),
    }
}

fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < LENGTH_PREFIX {
        return Err(Error::CorruptPayload("truncated length prefix".to_string()));
    }

    let (prefix, deflated) = body.split_at(LENGTH_PREFIX);
    let size = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    // One spare byte so an oversized stream shows up as a length mismatch.
    // The prefix is untrusted: grow towards it as output arrives.
    let limit = size.saturating_add(1);
    let first_guess = size.min(deflated.len().saturating_mul(4)).max(64);
    let mut out = Vec::with_capacity(first_guess.min(limit));
    let mut inflater = Decompress::new(true);

    let status = loop {
        let consumed = inflater.total_in() as usize;
        let status = inflater
            .decompress_vec(&deflated[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| Error::CorruptPayload(format!("inflate failed: {}", e)))?;

        // room left over means the input ran out
        if status == Status::StreamEnd || out.len() >= limit || out.len() < out.capacity() {
            break status;
        }
        let grow = out.capacity().max(1024).min(limit - out.len());
        out.reserve_exact(grow);
    };

    if out.len() > size {
        return Err(Error::CorruptPayload(format!(
            "length mismatch: expected {} bytes, got more",
            size
        )));
    }
    if status != Status::StreamEnd {
        return Err(Error::CorruptPayload("truncated deflate stream".to_string()));
    }
    if inflater.total_in() as usize != deflated.len() {
        return Err(Error::CorruptPayload(
            "trailing bytes after deflate stream".to_string(),
        ));
    }
    if out.len() != size {
        return Err(Error::CorruptPayload(format!(
            "length mismatch: expected {} bytes, got {}",
            size,
            out.len()
        )));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompressionConfig {
        CompressionConfig::default()
    }

    #[test]
    fn test_small_payload_is_marked_raw() {
        let framed = compress(b"{\"id\":1}", &config()).unwrap();
        assert_eq!(framed[0], MARK_RAW);
        assert_eq!(&framed[1..], b"{\"id\":1}");
        assert_eq!(decompress(&framed).unwrap(), b"{\"id\":1}");
    }

    #[test]
    fn test_large_payload_is_deflated() {
        let data = "x".repeat(4096).into_bytes();
        let framed = compress(&data, &config()).unwrap();

        assert_eq!(framed[0], MARK_DEFLATED);
        assert_eq!(&framed[1..5], &4096u32.to_be_bytes());
        assert!(framed.len() < data.len());
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let cfg = CompressionConfig {
            threshold: 8,
            ..config()
        };
        assert_eq!(compress(b"1234567", &cfg).unwrap()[0], MARK_RAW);
        assert_eq!(compress(b"12345678", &cfg).unwrap()[0], MARK_DEFLATED);
    }

    #[test]
    fn test_empty_envelope_is_corrupt() {
        assert!(matches!(decompress(&[]), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_unknown_mark_is_corrupt() {
        assert!(matches!(decompress(&[0x07, 1, 2]), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let data = "y".repeat(2048).into_bytes();
        let mut framed = compress(&data, &config()).unwrap();
        framed[1..5].copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(decompress(&framed), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let data = "z".repeat(2048).into_bytes();
        let framed = compress(&data, &config()).unwrap();
        let truncated = &framed[..framed.len() - 3];
        assert!(matches!(decompress(truncated), Err(Error::CorruptPayload(_))));
        assert!(matches!(decompress(&framed[..3]), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"a").unwrap();
        let deflated = encoder.finish().unwrap();

        let mut framed = vec![MARK_DEFLATED, 0xff, 0xff, 0xff, 0xff];
        framed.extend_from_slice(&deflated);
        assert!(matches!(decompress(&framed), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_stream_larger_than_first_guess_is_inflated() {
        // highly compressible: the output is far beyond four times the input
        let data = "q".repeat(256 * 1024).into_bytes();
        let framed = compress(&data, &config()).unwrap();
        assert!(framed.len() * 4 < data.len());
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let data = "w".repeat(2048).into_bytes();
        let mut framed = compress(&data, &config()).unwrap();
        framed.extend_from_slice(b"junk");
        assert!(matches!(decompress(&framed), Err(Error::CorruptPayload(_))));
    }
}
