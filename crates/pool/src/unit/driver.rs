//! One task per unit, bridging the coordinator and the unit.
//!
//! The driver owns the unit. It multiplexes coordinator commands and unit
//! replies with `select!` and forwards every reply tagged with the unit id,
//! so the coordinator sees all units through a single channel.

use std::sync::Arc;
use std::time::Duration;

use offload_protocol::{Capability, Ready, UnitReply, UnitRequest};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExecutionUnit, UnitFactory, UnitId};
use crate::error::UnitError;

pub(crate) enum DriverCommand {
    Send(UnitRequest),
    /// Abandon the in-flight job after a timeout.
    Reset,
    /// Stop the unit; the sender, if any, is notified once it is down.
    Terminate(Option<oneshot::Sender<()>>),
}

#[derive(Debug)]
pub(crate) struct UnitEvent {
    pub unit: UnitId,
    pub kind: UnitEventKind,
}

#[derive(Debug)]
pub(crate) enum UnitEventKind {
    Reply(UnitReply),
    /// The unit produced something that is not a valid reply, or refused a
    /// request.
    Malformed(String),
    /// The unit is gone. No further events follow.
    Exited,
}

pub(crate) struct DriverHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    /// Queue a command. Returns `false` when the driver has already stopped.
    pub fn command(&self, command: DriverCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn send(&self, request: UnitRequest) -> bool {
        self.command(DriverCommand::Send(request))
    }

    /// Ask the driver to stop without waiting for it.
    pub fn terminate(&self) {
        let _ = self.commands.send(DriverCommand::Terminate(None));
    }

    /// Stop the unit and wait for it, up to `grace`. Aborts the driver task
    /// if the unit does not go down in time.
    pub async fn shutdown(self, grace: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(DriverCommand::Terminate(Some(tx))).is_ok()
            && tokio::time::timeout(grace, rx).await.is_ok()
        {
            return;
        }
        self.task.abort();
    }
}

/// Spawn a unit, wait for its `ready` handshake, then start its driver.
pub(crate) async fn start_unit(
    factory: Arc<dyn UnitFactory>,
    id: UnitId,
    capability: Capability,
    start_timeout: Duration,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> Result<(DriverHandle, Ready), UnitError> {
    let handshake = async {
        let mut unit = factory.spawn(id, capability).await?;
        match unit.recv().await {
            Ok(Some(UnitReply::Ready(ready))) => Ok::<_, UnitError>((unit, ready)),
            Ok(Some(other)) => {
                let _ = unit.terminate().await;
                Err(UnitError::Handshake(format!(
                    "expected ready, got {}",
                    other.kind()
                )))
            }
            Ok(None) => Err(UnitError::Handshake("unit exited before ready".into())),
            Err(e) => {
                let _ = unit.terminate().await;
                Err(e)
            }
        }
    };

    let (unit, ready) = tokio::time::timeout(start_timeout, handshake)
        .await
        .map_err(|_| UnitError::Handshake(format!("no ready within {start_timeout:?}")))??;

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(drive(id, unit, rx, events));
    Ok((DriverHandle { commands: tx, task }, ready))
}

async fn drive(
    id: UnitId,
    mut unit: Box<dyn ExecutionUnit>,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    let emit = |kind| {
        let _ = events.send(UnitEvent { unit: id, kind });
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(DriverCommand::Send(request)) => {
                    let kind = request.kind();
                    if let Err(e) = unit.send(request).await {
                        if e.is_fatal() {
                            warn!(unit_id = %id, error = %e, "unit unreachable");
                            emit(UnitEventKind::Exited);
                            return;
                        }
                        warn!(unit_id = %id, kind, error = %e, "unit refused request");
                        emit(UnitEventKind::Malformed(e.to_string()));
                    }
                }
                Some(DriverCommand::Reset) => {
                    if let Err(e) = unit.reset().await {
                        warn!(unit_id = %id, error = %e, "unit reset failed");
                    }
                }
                Some(DriverCommand::Terminate(ack)) => {
                    if let Err(e) = unit.terminate().await {
                        debug!(unit_id = %id, error = %e, "unit terminate reported an error");
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                None => {
                    let _ = unit.terminate().await;
                    return;
                }
            },
            reply = unit.recv() => match reply {
                Ok(Some(reply)) => emit(UnitEventKind::Reply(reply)),
                Ok(None) => {
                    debug!(unit_id = %id, "unit closed its reply stream");
                    emit(UnitEventKind::Exited);
                    return;
                }
                Err(e) if e.is_fatal() => {
                    warn!(unit_id = %id, error = %e, "unit reply stream failed");
                    emit(UnitEventKind::Exited);
                    return;
                }
                Err(e) => emit(UnitEventKind::Malformed(e.to_string())),
            },
        }
    }
}
