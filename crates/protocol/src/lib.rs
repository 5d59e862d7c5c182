//! Wire protocol between the offload scheduler and its execution units.
//!
//! The scheduler sends [`UnitRequest`]s (dispatch, ping, cancel) and units
//! answer with [`UnitReply`]s (ready, progress, result, error, pong). Both are
//! closed tagged unions keyed on `kind`; anything else is rejected once, at
//! the decoding boundary, as a [`ProtocolError`].
//!
//! Two framings are supported on byte streams (see [`codec`]): newline
//! delimited JSON and length-prefixed MessagePack [`Envelope`]s.

pub mod capability;
pub mod codec;
pub mod error;
pub mod message;
pub mod messages;

pub use capability::Capability;
pub use codec::{read_frame, write_frame, Framing};
pub use error::ProtocolError;
pub use message::Envelope;
pub use messages::kinds;
pub use messages::reply::{JobFailure, JobResult, Progress, Ready, UnitReply};
pub use messages::request::{Dispatch, UnitRequest};
pub use messages::JobId;
