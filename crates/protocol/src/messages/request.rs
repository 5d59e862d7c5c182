use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{decode_checked, kinds, JobId};
use crate::capability::Capability;
use crate::error::ProtocolError;

/// Body of a dispatch message: one attempt of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub job_id: JobId,
    /// Opaque to the scheduler; interpreted by the collaborator only.
    pub payload: serde_json::Value,
    /// Per-job settings forwarded untouched.
    #[serde(default)]
    pub settings: serde_json::Value,
    pub start_time: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(job_id: JobId, payload: serde_json::Value, settings: serde_json::Value) -> Self {
        Self {
            job_id,
            payload,
            settings,
            start_time: Utc::now(),
        }
    }
}

/// Message sent from the scheduler to an execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitRequest {
    /// Conversion job.
    Process(Dispatch),
    /// Validation job.
    Validate(Dispatch),
    /// Export job.
    Export(Dispatch),
    /// Liveness probe; answered with a pong.
    Ping,
    /// Best-effort request to abandon a running job.
    Cancel { job_id: JobId },
}

impl UnitRequest {
    /// Wrap a dispatch in the variant matching `capability`.
    pub fn dispatch(capability: Capability, dispatch: Dispatch) -> Self {
        match capability {
            Capability::Conversion => UnitRequest::Process(dispatch),
            Capability::Validation => UnitRequest::Validate(dispatch),
            Capability::Export => UnitRequest::Export(dispatch),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UnitRequest::Process(_) => kinds::PROCESS,
            UnitRequest::Validate(_) => kinds::VALIDATE,
            UnitRequest::Export(_) => kinds::EXPORT,
            UnitRequest::Ping => kinds::PING,
            UnitRequest::Cancel { .. } => kinds::CANCEL,
        }
    }

    /// The job this message concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            UnitRequest::Process(d) | UnitRequest::Validate(d) | UnitRequest::Export(d) => {
                Some(d.job_id)
            }
            UnitRequest::Cancel { job_id } => Some(*job_id),
            UnitRequest::Ping => None,
        }
    }

    /// Capability and body for dispatch messages.
    pub fn as_dispatch(&self) -> Option<(Capability, &Dispatch)> {
        match self {
            UnitRequest::Process(d) => Some((Capability::Conversion, d)),
            UnitRequest::Validate(d) => Some((Capability::Validation, d)),
            UnitRequest::Export(d) => Some((Capability::Export, d)),
            _ => None,
        }
    }

    /// Decode one JSON line, rejecting unknown kinds.
    pub fn from_json_line(line: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(line.trim())?;
        decode_checked(value, kinds::REQUEST_KINDS)
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
