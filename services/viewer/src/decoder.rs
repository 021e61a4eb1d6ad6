//! Frame decoding for both wire layouts.
//!
//! Binary layout (network byte order):
//!
//! ```text
//! +----------------+---------------------------+------------------+
//! | length L (u32) | metadata JSON (L bytes)   | JPEG (remainder) |
//! +----------------+---------------------------+------------------+
//! ```
//!
//! Legacy text layout:
//!
//! ```json
//! {"type": "frame", "data": "<base64 JPEG>", "detections": [...], "alerts": [...]}
//! ```
//!
//! The layout is detected per message, so a connection that interleaves
//! both formats decodes every message it can.

use crate::model::{DecodedFrame, FrameFormat, FrameMetadata};
use crate::transport::TransportMessage;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Instant;
use thiserror::Error;

/// Size of the big-endian metadata length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Discriminator value carried by legacy text frames.
pub const LEGACY_FRAME_TYPE: &str = "frame";

/// Errors that can occur while decoding a transport message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Message too short for length prefix: {0} bytes")]
    Truncated(usize),

    #[error("Metadata length {declared} exceeds available {available} bytes")]
    LengthOutOfRange { declared: usize, available: usize },

    #[error("Metadata is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Invalid metadata JSON: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Invalid base64 image data: {0}")]
    Base64(String),

    #[error("Unexpected message type: {0:?}")]
    UnexpectedType(Option<String>),
}

/// Legacy text frame with the image inline.
#[derive(Debug, Deserialize)]
struct LegacyFrame {
    #[serde(rename = "type")]
    kind: Option<String>,

    #[serde(default, with = "base64_serde")]
    data: Vec<u8>,

    #[serde(flatten)]
    metadata: FrameMetadata,
}

/// Base64 deserialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.trim())
            .map_err(|e| serde::de::Error::custom(format!("base64: {e}")))
    }
}

/// Decode one transport message, stamping it with the current time.
pub fn decode(message: &TransportMessage) -> Result<DecodedFrame, DecodeError> {
    decode_at(message, Instant::now())
}

/// Decode one transport message that arrived at `arrived_at`.
pub fn decode_at(message: &TransportMessage, arrived_at: Instant) -> Result<DecodedFrame, DecodeError> {
    match message {
        TransportMessage::Text(text) => decode_legacy(text.as_bytes(), arrived_at),
        TransportMessage::Binary(data) => match decode_binary(data, arrived_at) {
            Ok(frame) => Ok(frame),
            // A JSON document sent as a binary message reads as a huge length prefix
            Err(DecodeError::LengthOutOfRange { .. }) if looks_like_json(data) => {
                decode_legacy(data, arrived_at)
            }
            Err(e) => Err(e),
        },
    }
}

/// Decode the length-prefixed binary layout.
pub fn decode_binary(data: &Bytes, arrived_at: Instant) -> Result<DecodedFrame, DecodeError> {
    if data.len() < LENGTH_PREFIX_LEN {
        return Err(DecodeError::Truncated(data.len()));
    }

    let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let available = data.len() - LENGTH_PREFIX_LEN;
    if declared > available {
        return Err(DecodeError::LengthOutOfRange {
            declared,
            available,
        });
    }

    let meta_end = LENGTH_PREFIX_LEN + declared;
    let json = std::str::from_utf8(&data[LENGTH_PREFIX_LEN..meta_end])?;
    let metadata: FrameMetadata = serde_json::from_str(json)?;

    Ok(DecodedFrame {
        metadata,
        image: data.slice(meta_end..),
        format: FrameFormat::Binary,
        arrived_at,
    })
}

/// Decode the legacy JSON layout.
pub fn decode_legacy(json: &[u8], arrived_at: Instant) -> Result<DecodedFrame, DecodeError> {
    let frame: LegacyFrame = serde_json::from_slice(json).map_err(|e| {
        if e.to_string().starts_with("base64:") {
            DecodeError::Base64(e.to_string())
        } else {
            DecodeError::Metadata(e)
        }
    })?;

    if frame.kind.as_deref() != Some(LEGACY_FRAME_TYPE) {
        return Err(DecodeError::UnexpectedType(frame.kind));
    }

    Ok(DecodedFrame {
        metadata: frame.metadata,
        image: Bytes::from(frame.data),
        format: FrameFormat::LegacyText,
        arrived_at,
    })
}

/// Encode metadata and image into the binary layout.
///
/// The viewer only decodes; this is the producer side, used by tools and tests.
pub fn encode_binary(metadata: &FrameMetadata, image: &[u8]) -> Result<Bytes, DecodeError> {
    let json = serde_json::to_vec(metadata)?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + json.len() + image.len());
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(image);
    Ok(Bytes::from(out))
}

fn looks_like_json(data: &[u8]) -> bool {
    data.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}
