//! End-to-end: a pool of `offload worker` child processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::time::timeout;

use offload_pool::{
    factory_from_config, Capability, EchoHandler, JobRequest, PoolConfig, ProcessUnitConfig,
    Scheduler, UnitConfig, UnitKind,
};
use offload_protocol::Framing;

const TIMEOUT: Duration = Duration::from_secs(20);

fn process_config(framing: Framing, extra_args: &[&str]) -> PoolConfig {
    let mut args = vec!["worker".to_string()];
    args.extend(extra_args.iter().map(|a| a.to_string()));
    PoolConfig {
        min_units: 1,
        max_units: 2,
        unit_start_timeout_ms: 10_000,
        unit: UnitConfig {
            kind: UnitKind::Process,
            process: Some(ProcessUnitConfig {
                program: env!("CARGO_BIN_EXE_offload").to_string(),
                args,
                env: HashMap::from([("RUST_LOG".to_string(), "warn".to_string())]),
                framing,
            }),
        },
        ..PoolConfig::default()
    }
}

async fn start(config: PoolConfig) -> Scheduler {
    let factory = factory_from_config(&config.unit, Arc::new(EchoHandler)).unwrap();
    Scheduler::start(config, factory).await.unwrap()
}

#[tokio::test]
async fn json_lines_workers_run_jobs() {
    let pool = start(process_config(Framing::JsonLines, &[])).await;

    let jobs = (0..4).map(|n| {
        pool.execute(JobRequest::new(Capability::Conversion, json!({ "n": n })))
    });
    let outcomes = timeout(TIMEOUT, join_all(jobs)).await.unwrap();
    for (n, outcome) in outcomes.into_iter().enumerate() {
        let out = outcome.unwrap();
        assert_eq!(out.output, json!({ "n": n }));
        assert_eq!(out.metadata["capability"], json!("conversion"));
    }

    let snapshot = pool.snapshot().await.unwrap();
    assert!(snapshot.units.len() <= 2);
    assert!(snapshot
        .units
        .iter()
        .all(|u| u.supported_modes == vec!["echo".to_string()]));
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn messagepack_worker_declares_its_capability() {
    let pool = start(process_config(Framing::MessagePack, &["--framing", "message-pack"])).await;

    let out = timeout(
        TIMEOUT,
        pool.execute(JobRequest::new(Capability::Export, json!({ "format": "yaml" }))),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(out.output, json!({ "format": "yaml" }));
    assert_eq!(out.metadata["capability"], json!("export"));

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(
        snapshot.unit(out.unit).unwrap().capability,
        Capability::Export
    );
    pool.shutdown().await.unwrap();
}
