//! Error types for the envelope codec.

use thiserror::Error;

/// Errors that can occur while decoding an envelope from bytes.
///
/// Decode failures are never fatal to the pipeline: the consumer routes the
/// offending record to the dead-letter sink and keeps going.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("unsupported specversion: {0}")]
    UnsupportedSpecVersion(String),

    #[error("unsupported datacontenttype: {0}")]
    UnsupportedContentType(String),

    #[error("payload does not match the expected shape: {0}")]
    Payload(String),
}

/// Errors that can occur while encoding an envelope or its payload.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}
