use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{decode_checked, kinds, JobId};
use crate::capability::Capability;
use crate::error::ProtocolError;

/// Progress notification for a running job. Zero or more per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub job_id: JobId,
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub message: Option<String>,
}

impl Progress {
    /// Completed fraction in `[0, 1]`; `None` when the total is unknown (zero).
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some((self.current as f64 / self.total as f64).clamp(0.0, 1.0))
        }
    }
}

/// Successful terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub output: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Failed terminal outcome reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub message: String,
}

/// Startup handshake announcing what the unit can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub capability: Capability,
    #[serde(default)]
    pub supported_modes: Vec<String>,
}

/// Message sent from an execution unit to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitReply {
    Progress(Progress),
    Result(JobResult),
    Error(JobFailure),
    Ready(Ready),
    Pong { timestamp: DateTime<Utc> },
}

impl UnitReply {
    pub fn pong() -> Self {
        UnitReply::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UnitReply::Progress(_) => kinds::PROGRESS,
            UnitReply::Result(_) => kinds::RESULT,
            UnitReply::Error(_) => kinds::ERROR,
            UnitReply::Ready(_) => kinds::READY,
            UnitReply::Pong { .. } => kinds::PONG,
        }
    }

    /// Result and error end an attempt; everything else does not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitReply::Result(_) | UnitReply::Error(_))
    }

    /// The job this reply concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            UnitReply::Progress(p) => Some(p.job_id),
            UnitReply::Result(r) => Some(r.job_id),
            UnitReply::Error(e) => Some(e.job_id),
            UnitReply::Ready(_) | UnitReply::Pong { .. } => None,
        }
    }

    /// Decode one JSON line, rejecting unknown kinds.
    pub fn from_json_line(line: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(line.trim())?;
        decode_checked(value, kinds::REPLY_KINDS)
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_reply_kind() {
        let progress = UnitReply::from_json_line(
            r#"{"kind":"progress","job_id":1,"current":5,"total":10,"message":"half"}"#,
        )
        .unwrap();
        assert_eq!(progress.job_id(), Some(JobId(1)));
        assert!(!progress.is_terminal());

        let result =
            UnitReply::from_json_line(r#"{"kind":"result","job_id":1,"output":[1,2]}"#).unwrap();
        assert!(result.is_terminal());
        match result {
            UnitReply::Result(r) => {
                assert_eq!(r.output, json!([1, 2]));
                assert_eq!(r.metadata, serde_json::Value::Null);
            }
            other => panic!("expected result, got {other:?}"),
        }

        let error =
            UnitReply::from_json_line(r#"{"kind":"error","job_id":2,"message":"bad row"}"#).unwrap();
        assert!(error.is_terminal());

        let ready = UnitReply::from_json_line(
            r#"{"kind":"ready","capability":"export","supported_modes":["json","xml"]}"#,
        )
        .unwrap();
        assert_eq!(ready.kind(), "ready");
        assert_eq!(ready.job_id(), None);

        let pong =
            UnitReply::from_json_line(r#"{"kind":"pong","timestamp":"2024-05-01T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(pong.kind(), "pong");
    }

    #[test]
    fn unknown_and_missing_kinds_are_rejected() {
        let err = UnitReply::from_json_line(r#"{"kind":"log","line":"hi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(ref k) if k == "log"));

        let err = UnitReply::from_json_line(r#"{"job_id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingKind));
    }

    #[test]
    fn known_kind_with_wrong_shape_is_malformed() {
        let err = UnitReply::from_json_line(r#"{"kind":"result","output":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { ref kind, .. } if kind == "result"));
    }

    #[test]
    fn progress_fraction() {
        let p = Progress {
            job_id: JobId(1),
            current: 3,
            total: 4,
            message: None,
        };
        assert_eq!(p.fraction(), Some(0.75));
        let unknown = Progress { total: 0, ..p };
        assert_eq!(unknown.fraction(), None);
    }
}
