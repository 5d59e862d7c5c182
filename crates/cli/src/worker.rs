//! `offload worker`: an execution unit behind stdin/stdout.
//!
//! The pool's process units launch this binary. Requests arrive on stdin,
//! replies leave on stdout, logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use offload_pool::{Capability, EchoHandler, ExecutionUnit, InProcessUnit, UnitId};
use offload_protocol::{
    read_frame, write_frame, Framing, JobFailure, ProtocolError, UnitReply, UnitRequest,
};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::WorkerArgs;

pub async fn run(args: WorkerArgs) -> Result<()> {
    let capability: Capability = args
        .capability
        .parse()
        .with_context(|| format!("unsupported capability '{}'", args.capability))?;
    let unit = InProcessUnit::new(UnitId(args.unit_id), capability, Arc::new(EchoHandler));
    info!(unit_id = args.unit_id, %capability, "worker started");
    serve(
        unit,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        args.framing.into(),
    )
    .await
}

/// Pump requests from `reader` into `unit` and its replies out to `writer`
/// until the input ends or the unit stops.
pub async fn serve<U, R, W>(mut unit: U, reader: R, mut writer: W, framing: Framing) -> Result<()>
where
    U: ExecutionUnit,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    // Frame reads are not cancel-safe, so they get their own task.
    let (tx, mut requests) = mpsc::channel::<UnitRequest>(16);
    let reader_task = tokio::spawn(read_requests(reader, framing, tx));

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => {
                    let job_id = request.job_id();
                    if let Err(e) = unit.send(request).await {
                        warn!(error = %e, "request rejected");
                        if let Some(job_id) = job_id {
                            let failure = UnitReply::Error(JobFailure {
                                job_id,
                                message: e.to_string(),
                            });
                            write_frame(&mut writer, framing, &failure).await?;
                        }
                    }
                }
                None => {
                    debug!("input closed");
                    break;
                }
            },
            reply = unit.recv() => match reply? {
                Some(reply) => write_frame(&mut writer, framing, &reply).await?,
                None => break,
            },
        }
    }

    reader_task.abort();
    unit.terminate().await?;
    info!("worker stopped");
    Ok(())
}

async fn read_requests<R>(mut reader: R, framing: Framing, tx: mpsc::Sender<UnitRequest>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_frame::<_, UnitRequest>(&mut reader, framing).await {
            Ok(Some(request)) => {
                if tx.send(request).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e @ (ProtocolError::Io(_) | ProtocolError::FrameTooLarge(_))) => {
                warn!(error = %e, "request stream broken");
                return;
            }
            Err(e) => warn!(error = %e, "skipping invalid request"),
        }
    }
}
