//! Byte-stream framing for units that live behind a pipe or socket.
//!
//! - [`Framing::JsonLines`]: one JSON message per `\n`-terminated line.
//! - [`Framing::MessagePack`]: big-endian `u32` length prefix followed by an
//!   [`Envelope`] encoded with MessagePack.
//!
//! Neither reader is cancel-safe; callers that `select!` on a stream should
//! read from a dedicated task and forward decoded messages over a channel.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::message::Envelope;
use crate::messages::reply::UnitReply;
use crate::messages::request::UnitRequest;

/// Largest accepted frame: a MessagePack envelope or one JSON line.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Stream framing, chosen per unit in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    JsonLines,
    MessagePack,
}

/// A protocol message that can cross a framed stream.
pub trait WireMessage: Sized {
    fn to_json_line(&self) -> Result<String, ProtocolError>;
    fn from_json_line(line: &str) -> Result<Self, ProtocolError>;
    fn to_envelope(&self) -> Result<Envelope, ProtocolError>;
    fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError>;
}

impl WireMessage for UnitRequest {
    fn to_json_line(&self) -> Result<String, ProtocolError> {
        UnitRequest::to_json_line(self)
    }
    fn from_json_line(line: &str) -> Result<Self, ProtocolError> {
        UnitRequest::from_json_line(line)
    }
    fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Envelope::request(self)
    }
    fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        envelope.open_request()
    }
}

impl WireMessage for UnitReply {
    fn to_json_line(&self) -> Result<String, ProtocolError> {
        UnitReply::to_json_line(self)
    }
    fn from_json_line(line: &str) -> Result<Self, ProtocolError> {
        UnitReply::from_json_line(line)
    }
    fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Envelope::reply(self)
    }
    fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        envelope.open_reply()
    }
}

/// Write one framed message and flush.
pub async fn write_frame<W, M>(
    writer: &mut W,
    framing: Framing,
    message: &M,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: WireMessage,
{
    match framing {
        Framing::JsonLines => {
            let mut line = message.to_json_line()?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
        }
        Framing::MessagePack => {
            let bytes = message.to_envelope()?.to_bytes()?;
            if bytes.len() > MAX_FRAME_BYTES {
                return Err(ProtocolError::FrameTooLarge(bytes.len()));
            }
            writer.write_u32(bytes.len() as u32).await?;
            writer.write_all(&bytes).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. `Ok(None)` means the stream ended cleanly.
pub async fn read_frame<R, M>(reader: &mut R, framing: Framing) -> Result<Option<M>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    M: WireMessage,
{
    match framing {
        Framing::JsonLines => read_json_line(reader, MAX_FRAME_BYTES).await,
        Framing::MessagePack => {
            let len = match reader.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if len > MAX_FRAME_BYTES {
                return Err(ProtocolError::FrameTooLarge(len));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            let envelope = Envelope::from_bytes(&buf)?;
            M::from_envelope(&envelope).map(Some)
        }
    }
}

/// Next non-blank line, refusing lines longer than `limit` bytes before
/// they are fully buffered.
async fn read_json_line<R, M>(reader: &mut R, limit: usize) -> Result<Option<M>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    M: WireMessage,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut *reader)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if buf.len() > limit && buf.last() != Some(&b'\n') {
            return Err(ProtocolError::FrameTooLarge(buf.len()));
        }
        let line = std::str::from_utf8(&buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if !line.trim().is_empty() {
            return M::from_json_line(line).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::reply::{JobResult, Ready};
    use crate::messages::JobId;
    use crate::Capability;
    use tokio::io::BufReader;

    async fn pipe_through(framing: Framing, replies: &[UnitReply]) -> Vec<UnitReply> {
        let mut wire = Vec::new();
        for reply in replies {
            write_frame(&mut wire, framing, reply).await.unwrap();
        }
        let mut reader = BufReader::new(wire.as_slice());
        let mut out = Vec::new();
        while let Some(reply) = read_frame::<_, UnitReply>(&mut reader, framing).await.unwrap() {
            out.push(reply);
        }
        out
    }

    fn sample() -> Vec<UnitReply> {
        vec![
            UnitReply::Ready(Ready {
                capability: Capability::Conversion,
                supported_modes: vec!["csv".into()],
            }),
            UnitReply::Result(JobResult {
                job_id: JobId(1),
                output: serde_json::json!({"rows": ["\"a\",\"b\""]}),
                metadata: serde_json::json!({"elapsed_ms": 3}),
            }),
        ]
    }

    #[tokio::test]
    async fn json_lines_stream() {
        assert_eq!(pipe_through(Framing::JsonLines, &sample()).await, sample());
    }

    #[tokio::test]
    async fn messagepack_stream() {
        assert_eq!(pipe_through(Framing::MessagePack, &sample()).await, sample());
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_unknown_kinds_fail() {
        let wire = b"\n\n{\"kind\":\"shout\"}\n".to_vec();
        let mut reader = BufReader::new(wire.as_slice());
        let err = read_frame::<_, UnitReply>(&mut reader, Framing::JsonLines)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn json_line_without_end_is_cut_off_at_the_limit() {
        let mut wire = vec![b' '; 64];
        wire.extend_from_slice(b"{\"kind\":\"ping\"}");
        let mut reader = BufReader::new(wire.as_slice());
        let err = read_json_line::<_, UnitRequest>(&mut reader, 32)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(33)), "{err}");
    }

    #[tokio::test]
    async fn json_line_at_the_limit_is_accepted() {
        let line = b"{\"kind\":\"ping\"}\n";
        let mut reader = BufReader::new(&line[..]);
        let request = read_json_line::<_, UnitRequest>(&mut reader, line.len() - 1)
            .await
            .unwrap();
        assert_eq!(request, Some(UnitRequest::Ping));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        let mut reader = BufReader::new(wire.as_slice());
        let err = read_frame::<_, UnitReply>(&mut reader, Framing::MessagePack)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }
}
