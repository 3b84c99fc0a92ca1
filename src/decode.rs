//! Upstream payload decoding.
//!
//! One compressed ZeroMQ frame in, one canonical JSON byte string out.
//! The canonical form sorts object keys lexicographically at every depth and
//! uses compact separators, so identical documents always serialize to
//! identical bytes regardless of upstream key order.
//!
//! `decode_message` is pure and thread-safe; callers run it on the blocking
//! worker pool to keep inflation and parsing off the I/O path.

use flate2::{Decompress, FlushDecompress, Status};
use serde_json::Value;

/// Growth step for the inflate buffer when no size limit is configured.
const INFLATE_BLOCK: usize = 64 * 1024;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("size limit exceeded")]
    SizeLimitExceeded,
    #[error("trailing garbage after deflate stream")]
    TrailingGarbage,
    #[error("truncated payload")]
    Truncated,
    #[error("inflate failed: {0}")]
    Inflate(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing $schemaRef")]
    MissingSchemaRef,
}

/// Decompress, validate and canonicalize one upstream payload.
///
/// `size_limit` bounds the decompressed size in bytes; 0 disables the bound.
/// On any error no partial output escapes.
pub fn decode_message(payload: &[u8], size_limit: usize) -> Result<Vec<u8>, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let inflated = inflate_bounded(payload, size_limit)?;
    if inflated.is_empty() {
        return Err(DecodeError::Truncated);
    }

    let value: Value =
        serde_json::from_slice(&inflated).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    match &value {
        Value::Object(object) if object.contains_key("$schemaRef") => {}
        _ => return Err(DecodeError::MissingSchemaRef),
    }

    // serde_json backs objects with a sorted map, so re-serializing yields
    // lexicographic keys at every depth with compact separators.
    serde_json::to_vec(&value).map_err(|err| DecodeError::InvalidJson(err.to_string()))
}

/// Inflate a zlib stream, enforcing `size_limit` on the output.
fn inflate_bounded(payload: &[u8], size_limit: usize) -> Result<Vec<u8>, DecodeError> {
    let mut inflater = Decompress::new(true);
    let mut output = Vec::with_capacity(if size_limit > 0 { size_limit } else { INFLATE_BLOCK });

    loop {
        let consumed = inflater.total_in() as usize;
        let progress = (inflater.total_in(), inflater.total_out());
        let status = inflater
            .decompress_vec(&payload[consumed..], &mut output, FlushDecompress::Finish)
            .map_err(|err| DecodeError::Inflate(err.to_string()))?;
        let consumed = inflater.total_in() as usize;

        match status {
            Status::StreamEnd => {
                if consumed < payload.len() {
                    return Err(DecodeError::TrailingGarbage);
                }
                return Ok(output);
            }
            Status::Ok | Status::BufError => {
                if size_limit > 0 && output.len() >= size_limit {
                    // Input left over means the limit cut the stream short;
                    // exhausted input means the stream itself was incomplete.
                    if consumed < payload.len() {
                        return Err(DecodeError::SizeLimitExceeded);
                    }
                    return Err(DecodeError::Truncated);
                }
                if output.len() == output.capacity() {
                    output.reserve(INFLATE_BLOCK);
                    continue;
                }
                if consumed == payload.len() {
                    return Err(DecodeError::Truncated);
                }
                if (inflater.total_in(), inflater.total_out()) == progress {
                    return Err(DecodeError::Inflate("inflater made no progress".to_owned()));
                }
            }
        }
    }
}
