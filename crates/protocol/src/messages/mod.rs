//! Message bodies exchanged with execution units.

pub mod kinds;
pub mod reply;
pub mod request;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Scheduler-assigned job identifier. Monotonic within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Read the `kind` tag of a decoded JSON message and check it against `known`.
pub(crate) fn checked_kind(
    value: &serde_json::Value,
    known: &[&str],
) -> Result<String, ProtocolError> {
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or(ProtocolError::MissingKind)?;
    if !known.contains(&kind) {
        return Err(ProtocolError::UnknownKind(kind.to_string()));
    }
    Ok(kind.to_string())
}

/// Decode a JSON value whose kind has already been checked.
pub(crate) fn decode_checked<T: for<'de> Deserialize<'de>>(
    value: serde_json::Value,
    known: &[&str],
) -> Result<T, ProtocolError> {
    let kind = checked_kind(&value, known)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}
