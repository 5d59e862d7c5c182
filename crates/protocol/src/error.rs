use thiserror::Error;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("message has no kind field")]
    MissingKind,

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("envelope kind {envelope} does not match payload kind {payload}")]
    KindMismatch { envelope: String, payload: String },

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}
