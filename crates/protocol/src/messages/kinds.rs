//! Wire `kind` tags.

// Scheduler → unit
pub const PROCESS: &str = "process";
pub const VALIDATE: &str = "validate";
pub const EXPORT: &str = "export";
pub const PING: &str = "ping";
pub const CANCEL: &str = "cancel";

// Unit → scheduler
pub const PROGRESS: &str = "progress";
pub const RESULT: &str = "result";
pub const ERROR: &str = "error";
pub const READY: &str = "ready";
pub const PONG: &str = "pong";

/// Every kind a unit may receive.
pub const REQUEST_KINDS: &[&str] = &[PROCESS, VALIDATE, EXPORT, PING, CANCEL];

/// Every kind a unit may send.
pub const REPLY_KINDS: &[&str] = &[PROGRESS, RESULT, ERROR, READY, PONG];
