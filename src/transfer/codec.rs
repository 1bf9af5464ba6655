//! Byte-count request codec.
//!
//! The request is the decimal ASCII representation of the byte count with
//! no terminator or length prefix. Its end is the sender's end-of-input on
//! the stream, so decoding only runs once the whole request has arrived.

use bytes::Bytes;

/// Longest request accepted before decoding. Twenty digits cover
/// `u64::MAX`; the slack allows leading zeros.
pub const MAX_REQUEST_LEN: usize = 64;

/// Request decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("requested byte count exceeds the supported range")]
    Overflow,
}

/// Encode a byte count as a request.
pub fn encode(byte_count: u64) -> Bytes {
    Bytes::from(byte_count.to_string())
}

/// Decode a complete request.
pub fn decode(input: &[u8]) -> Result<u64, CodecError> {
    if input.is_empty() {
        return Err(CodecError::Malformed("empty request".to_string()));
    }
    if input.len() > MAX_REQUEST_LEN {
        return Err(CodecError::Malformed(format!(
            "request is {} bytes, limit is {}",
            input.len(),
            MAX_REQUEST_LEN
        )));
    }

    if let Some(b) = input.iter().find(|b| !b.is_ascii_digit()) {
        return Err(CodecError::Malformed(format!(
            "unexpected byte 0x{b:02x} in {:?}",
            String::from_utf8_lossy(input)
        )));
    }

    input.iter().try_fold(0u64, |acc, &b| {
        acc.checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or(CodecError::Overflow)
    })
}
