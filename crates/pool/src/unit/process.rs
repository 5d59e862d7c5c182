//! Subprocess execution unit.
//!
//! The child reads [`UnitRequest`]s on stdin and writes [`UnitReply`]s on
//! stdout using the configured framing. Stderr is inherited so the child's
//! logs end up next to the pool's.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use offload_protocol::{read_frame, write_frame, Capability, ProtocolError, UnitReply, UnitRequest};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExecutionUnit, UnitFactory, UnitId};
use crate::config::ProcessUnitConfig;
use crate::error::UnitError;

/// Time a child gets to exit after its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

type ReplyRx = mpsc::UnboundedReceiver<Result<UnitReply, ProtocolError>>;

struct Launched {
    child: Child,
    stdin: ChildStdin,
    replies: ReplyRx,
    reader: JoinHandle<()>,
}

fn launch(
    id: UnitId,
    capability: Capability,
    config: &ProcessUnitConfig,
) -> Result<Launched, UnitError> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .envs(&config.env)
        .env("OFFLOAD_UNIT_ID", id.0.to_string())
        .env("OFFLOAD_UNIT_CAPABILITY", capability.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| UnitError::Handshake("child stdin was not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| UnitError::Handshake("child stdout was not captured".into()))?;

    info!(unit_id = %id, program = %config.program, pid = ?child.id(), "unit process started");

    let (tx, replies) = mpsc::unbounded_channel();
    let framing = config.framing;
    let reader = tokio::spawn(async move {
        let mut stdout = BufReader::new(stdout);
        loop {
            match read_frame::<_, UnitReply>(&mut stdout, framing).await {
                Ok(Some(reply)) => {
                    if tx.send(Ok(reply)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                // The stream is out of sync or gone; nothing after this can be trusted.
                Err(e @ (ProtocolError::Io(_) | ProtocolError::FrameTooLarge(_))) => {
                    let _ = tx.send(Err(e));
                    break;
                }
                Err(e) => {
                    if tx.send(Err(e)).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(Launched {
        child,
        stdin,
        replies,
        reader,
    })
}

pub struct ProcessUnit {
    id: UnitId,
    capability: Capability,
    config: ProcessUnitConfig,
    child: Child,
    stdin: Option<ChildStdin>,
    replies: ReplyRx,
    reader: JoinHandle<()>,
}

impl ProcessUnit {
    pub fn spawn(
        id: UnitId,
        capability: Capability,
        config: ProcessUnitConfig,
    ) -> Result<Self, UnitError> {
        let launched = launch(id, capability, &config)?;
        Ok(Self {
            id,
            capability,
            config,
            child: launched.child,
            stdin: Some(launched.stdin),
            replies: launched.replies,
            reader: launched.reader,
        })
    }

    async fn kill(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.kill().await {
            debug!(unit_id = %self.id, error = %e, "kill failed, child already gone");
        }
        self.reader.abort();
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    async fn send(&mut self, request: UnitRequest) -> Result<(), UnitError> {
        let stdin = self.stdin.as_mut().ok_or(UnitError::Closed)?;
        write_frame(stdin, self.config.framing, &request).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<UnitReply>, UnitError> {
        match self.replies.recv().await {
            Some(Ok(reply)) => Ok(Some(reply)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// A child process cannot be told to drop a job, so it is replaced.
    /// The new child announces itself with a fresh `ready`.
    async fn reset(&mut self) -> Result<(), UnitError> {
        warn!(unit_id = %self.id, "restarting unit process");
        self.kill().await;
        let launched = launch(self.id, self.capability, &self.config)?;
        self.child = launched.child;
        self.stdin = Some(launched.stdin);
        self.replies = launched.replies;
        self.reader = launched.reader;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), UnitError> {
        // Closing stdin asks the child to exit on its own.
        self.stdin = None;
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(unit_id = %self.id, %status, "unit process exited");
                self.reader.abort();
                Ok(())
            }
            Ok(Err(e)) => {
                self.kill().await;
                Err(e.into())
            }
            Err(_) => {
                warn!(unit_id = %self.id, "unit process ignored stdin close, killing");
                self.kill().await;
                Ok(())
            }
        }
    }
}

/// Spawns [`ProcessUnit`]s from one launch config.
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    config: ProcessUnitConfig,
}

impl ProcessFactory {
    pub fn new(config: ProcessUnitConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl UnitFactory for ProcessFactory {
    async fn spawn(
        &self,
        id: UnitId,
        capability: Capability,
    ) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        Ok(Box::new(ProcessUnit::spawn(id, capability, self.config.clone())?))
    }
}
