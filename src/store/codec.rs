//! Stored form of a counter total: ASCII decimal digits, nothing else

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty value")]
    Empty,
    #[error("invalid byte 0x{0:02x} in decimal value")]
    InvalidByte(u8),
    #[error("value exceeds u64")]
    OutOfRange,
}

pub fn encode_total(total: u64) -> Vec<u8> {
    total.to_string().into_bytes()
}

/// Strict decode. Signs and whitespace are rejected even though
/// `u64::from_str` would take a leading `+`.
pub fn decode_total(bytes: &[u8]) -> Result<u64, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(&bad) = bytes.iter().find(|b| !b.is_ascii_digit()) {
        return Err(DecodeError::InvalidByte(bad));
    }
    bytes.iter().try_fold(0u64, |acc, &digit| {
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(u64::from(digit - b'0')))
            .ok_or(DecodeError::OutOfRange)
    })
}
