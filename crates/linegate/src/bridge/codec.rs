//! JSON codec for single framed records.
//!
//! Decoding is per record so one malformed line never poisons the stream.
//! Encoding produces compact single-line JSON suitable for the framer.

use tokio_util::bytes::Bytes;

use super::protocol::{ProtocolMessage, RawRecord};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("serialized message contains a line terminator")]
    EmbeddedNewline,
}

/// Parse one record as a protocol message.
pub fn decode(record: &RawRecord) -> Result<ProtocolMessage, DecodeError> {
    let text = std::str::from_utf8(record.as_bytes())?;
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(ProtocolMessage::new(value))
}

/// Serialize a message as one line, without terminator.
pub fn encode(message: &ProtocolMessage) -> Result<RawRecord, EncodeError> {
    let json = serde_json::to_vec(message)?;
    if json.iter().any(|b| *b == b'\n' || *b == b'\r') {
        return Err(EncodeError::EmbeddedNewline);
    }
    let json_len = json.len();
    tracing::trace!(json_size_bytes = json_len, "Encoding record");
    if json_len > 100_000 {
        tracing::info!(
            json_size_bytes = json_len,
            json_size_kb = json_len / 1024,
            "Large record being encoded"
        );
    }
    Ok(RawRecord::new(Bytes::from(json)))
}
