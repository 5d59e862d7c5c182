use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::messages::kinds;
use crate::messages::reply::UnitReply;
use crate::messages::request::UnitRequest;

/// Wire-format envelope for the MessagePack framing.
///
/// The `kind` field is checked against the closed set of known kinds before
/// the payload is touched, so an unknown message never reaches a decoder.
/// `correlation_id` ties log lines on both sides of the pipe together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind, identical to the `kind` tag inside the payload.
    pub kind: String,

    /// MessagePack-encoded message bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When this envelope was sealed.
    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Envelope {
    fn seal<T: Serialize>(kind: &str, message: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.to_string(),
            // Named encoding: the tagged enums need field names to round-trip.
            payload: rmp_serde::to_vec_named(message)?,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            version: 1,
        })
    }

    /// Seal a scheduler → unit message.
    pub fn request(request: &UnitRequest) -> Result<Self, ProtocolError> {
        Self::seal(request.kind(), request)
    }

    /// Seal a unit → scheduler message.
    pub fn reply(reply: &UnitReply) -> Result<Self, ProtocolError> {
        Self::seal(reply.kind(), reply)
    }

    /// Open as a request, rejecting kinds a unit cannot receive.
    pub fn open_request(&self) -> Result<UnitRequest, ProtocolError> {
        self.check_kind(kinds::REQUEST_KINDS)?;
        let request: UnitRequest = rmp_serde::from_slice(&self.payload)?;
        self.check_payload_kind(request.kind())?;
        Ok(request)
    }

    /// Open as a reply, rejecting kinds a unit cannot send.
    pub fn open_reply(&self) -> Result<UnitReply, ProtocolError> {
        self.check_kind(kinds::REPLY_KINDS)?;
        let reply: UnitReply = rmp_serde::from_slice(&self.payload)?;
        self.check_payload_kind(reply.kind())?;
        Ok(reply)
    }

    fn check_kind(&self, known: &[&str]) -> Result<(), ProtocolError> {
        if known.contains(&self.kind.as_str()) {
            Ok(())
        } else {
            Err(ProtocolError::UnknownKind(self.kind.clone()))
        }
    }

    fn check_payload_kind(&self, payload_kind: &str) -> Result<(), ProtocolError> {
        if payload_kind == self.kind {
            Ok(())
        } else {
            Err(ProtocolError::KindMismatch {
                envelope: self.kind.clone(),
                payload: payload_kind.to_string(),
            })
        }
    }

    /// Serialize this envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Serde helper so `Vec<u8>` is written as a MessagePack bin, not an array.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
