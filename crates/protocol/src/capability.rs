use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::messages::kinds;

/// Category of work a job requests and a unit understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Delimited text into quoted CSV rows.
    Conversion,
    /// Structural, format and PII checks.
    Validation,
    /// Format-specific serialization.
    Export,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 3] = [
        Capability::Conversion,
        Capability::Validation,
        Capability::Export,
    ];

    /// Lower-case name used in configs and job requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Conversion => "conversion",
            Capability::Validation => "validation",
            Capability::Export => "export",
        }
    }

    /// Wire `kind` of the dispatch message that carries a job of this capability.
    pub fn dispatch_kind(&self) -> &'static str {
        match self {
            Capability::Conversion => kinds::PROCESS,
            Capability::Validation => kinds::VALIDATE,
            Capability::Export => kinds::EXPORT,
        }
    }

    /// Inverse of [`Capability::dispatch_kind`].
    pub fn from_dispatch_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.dispatch_kind() == kind)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| ProtocolError::UnknownCapability(s.to_string()))
    }
}
