use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use offload_pool::{
    factory_from_config, Capability, EchoHandler, JobOutput, JobRequest, PoolConfig, PoolError,
    Scheduler,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::RunArgs;
use crate::metrics_server;

/// Longest pause between resubmissions of a job the pool turned away.
const MAX_RESUBMIT_DELAY: Duration = Duration::from_secs(1);

const FIRST_RESUBMIT_DELAY: Duration = Duration::from_millis(10);

/// One line of a job file.
#[derive(Debug, Deserialize)]
pub struct JobLine {
    /// 1-based line in the source file; position for synthetic jobs.
    #[serde(skip)]
    pub line: usize,
    pub capability: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

impl JobLine {
    /// Build a request, rejecting unknown capability names.
    pub fn into_request(self) -> Result<JobRequest, PoolError> {
        let capability: Capability = self
            .capability
            .parse()
            .map_err(|_| PoolError::UnknownCapability(self.capability.clone()))?;
        let mut request = JobRequest::new(capability, self.payload)
            .priority(self.priority)
            .settings(self.settings);
        if let Some(ms) = self.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        if let Some(budget) = self.retry_budget {
            request = request.retry_budget(budget);
        }
        Ok(request)
    }
}

/// Outcome line written to stdout.
#[derive(Debug, Serialize)]
pub struct OutcomeLine {
    line: usize,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OutcomeLine {
    fn new(line: usize, result: Result<JobOutput, PoolError>) -> Self {
        match result {
            Ok(out) => Self {
                line,
                ok: true,
                job_id: Some(out.job_id.0),
                output: Some(out.output),
                attempts: Some(out.attempts),
                latency_ms: Some(out.latency.as_millis() as u64),
                error: None,
            },
            Err(e) => Self {
                line,
                ok: false,
                job_id: None,
                output: None,
                attempts: None,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Parse a JSON-lines job file. Blank lines and `#` comments are skipped.
pub async fn read_jobs<R: AsyncBufRead + Unpin>(reader: R) -> Result<Vec<JobLine>> {
    let mut lines = reader.lines();
    let mut jobs = Vec::new();
    let mut number = 0usize;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut job: JobLine = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid job on line {number}"))?;
        job.line = number;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Synthetic jobs for smoke runs.
pub fn synthetic_jobs(count: usize, capability: &str) -> Vec<JobLine> {
    (0..count)
        .map(|index| JobLine {
            line: index + 1,
            capability: capability.to_string(),
            payload: json!({ "index": index, "text": format!("row {index};value {index}") }),
            settings: Value::Null,
            priority: 0,
            timeout_ms: None,
            retry_budget: None,
        })
        .collect()
}

async fn load_jobs(args: &RunArgs) -> Result<Vec<JobLine>> {
    match args.input.as_deref() {
        Some(path) if path == Path::new("-") => {
            read_jobs(BufReader::new(tokio::io::stdin())).await
        }
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open job file {}", path.display()))?;
            read_jobs(BufReader::new(file)).await
        }
        None => Ok(synthetic_jobs(args.jobs, &args.capability)),
    }
}

fn load_config(path: Option<&Path>) -> Result<PoolConfig> {
    let config = match path {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("failed to load pool config from {}", path.display()))?,
        // Empty file: defaults, then environment overrides and validation.
        None => PoolConfig::from_toml("").context("invalid pool configuration")?,
    };
    Ok(config)
}

/// Run a request, resubmitting with a growing pause while the pool answers
/// `QueueFull`.
async fn execute_with_backpressure(
    pool: &Scheduler,
    request: JobRequest,
) -> Result<JobOutput, PoolError> {
    let mut delay = FIRST_RESUBMIT_DELAY;
    loop {
        match pool.execute(request.clone()).await {
            Err(PoolError::QueueFull { capacity }) => {
                debug!(capacity, delay_ms = delay.as_millis() as u64, "queue full, resubmitting");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RESUBMIT_DELAY);
            }
            outcome => return outcome,
        }
    }
}

/// Execute `jobs` with at most `in_flight` submissions outstanding.
/// Outcomes come back in source order.
pub async fn execute_all(
    pool: &Scheduler,
    jobs: Vec<JobLine>,
    default_timeout: Option<Duration>,
    in_flight: usize,
) -> Vec<OutcomeLine> {
    let mut outcomes: Vec<OutcomeLine> = stream::iter(jobs)
        .map(|job| async move {
            let line = job.line;
            let result = match job.into_request() {
                Ok(mut request) => {
                    if let (None, Some(timeout)) = (request.timeout, default_timeout) {
                        request = request.timeout(timeout);
                    }
                    execute_with_backpressure(pool, request).await
                }
                Err(e) => Err(e),
            };
            OutcomeLine::new(line, result)
        })
        .buffer_unordered(in_flight.max(1))
        .collect()
        .await;
    outcomes.sort_by_key(|outcome| outcome.line);
    outcomes
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let jobs = load_jobs(&args).await?;
    info!(
        jobs = jobs.len(),
        min_units = config.min_units,
        max_units = config.max_units,
        strategy = %config.strategy,
        unit_kind = ?config.unit.kind,
        "starting batch"
    );

    // Enough to keep every unit busy and the queue full, no more.
    let in_flight = config.max_units + config.max_queue_size;
    let factory = factory_from_config(&config.unit, Arc::new(EchoHandler))?;
    let pool = Scheduler::start(config, factory)
        .await
        .context("failed to start pool")?;

    let mut events = pool.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    event = %serde_json::to_string(&event).unwrap_or_default(),
                    "pool event"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = match args.metrics_port {
        Some(port) => Some(metrics_server::spawn(pool.clone(), port).await?),
        None => None,
    };

    let default_timeout = args.timeout_ms.map(Duration::from_millis);
    let outcomes = execute_all(&pool, jobs, default_timeout, in_flight).await;

    let mut stdout = tokio::io::stdout();
    let mut failed = 0usize;
    for outcome in &outcomes {
        if !outcome.ok {
            failed += 1;
        }
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
    }
    stdout.flush().await?;

    let snapshot = pool.snapshot().await?;
    info!(
        completed = snapshot.metrics.jobs_completed,
        failed,
        retried = snapshot.metrics.jobs_retried,
        timed_out = snapshot.metrics.jobs_timed_out,
        peak_units = snapshot.metrics.peak_units,
        avg_latency_ms = snapshot.metrics.avg_latency.as_millis() as u64,
        "batch finished"
    );

    if args.linger {
        info!("serving metrics until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    pool.shutdown().await?;
    if let Some(server) = server {
        server.abort();
    }
    event_log.abort();

    if failed > 0 {
        anyhow::bail!("{failed} of {} job(s) failed", outcomes.len());
    }
    Ok(())
}
