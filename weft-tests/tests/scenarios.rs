//! Deterministic end-to-end DAG scenarios
//!
//! Each test drives the full stack: submission through the dispatcher,
//! dependency analysis, scheduling, in-process workers with real data
//! managers, and completion flow back to the master.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use weft_core::{
    AccessMode, Direction, Error, Implementation, ResourceDescription, Result, RuntimeConfig,
    SchedulerPolicyKind, WorkerId,
};
use weft_runtime::{JobRequest, Weft};
use weft_tests::{DataPlane, EventLog, FnInvoker, InProcessWorker, TaskBuilder};
use weft_worker::{InvocationOutput, LoadedParam, LoadedValue, OutputValue};

const WAIT: Duration = Duration::from_secs(10);

fn config(policy: SchedulerPolicyKind) -> RuntimeConfig {
    RuntimeConfig {
        scheduler_policy: policy,
        max_retries: 2,
        cancel_timeout: Duration::from_millis(500),
        ..RuntimeConfig::default()
    }
}

async fn barrier(runtime: &Weft, app: Uuid) {
    tokio::time::timeout(WAIT, runtime.barrier(app))
        .await
        .expect("barrier timed out")
        .expect("barrier failed");
}

/// Reads every In-param file, concatenates the contents, writes
/// `<signature>(<inputs>)` into every Out-param file, and records
/// `<signature>@<worker>` in the log.
fn pipeline_invoker(log: Arc<EventLog>, worker: &str) -> Arc<FnInvoker> {
    let worker = worker.to_string();
    FnInvoker::new(move |job: &JobRequest, params: Vec<LoadedParam>| {
        log.record(format!("{}@{}", job.signature, worker));
        let mut inputs = Vec::new();
        for param in &params {
            if param.direction == Direction::In {
                if let LoadedValue::Path(path) = &param.value {
                    let bytes =
                        std::fs::read(path).map_err(|e| Error::TaskFailure(e.to_string()))?;
                    inputs.push(String::from_utf8_lossy(&bytes).to_string());
                }
            }
        }
        let rendered = format!("{}({})", job.signature, inputs.join("+"));
        let mut outputs = Vec::new();
        for param in &params {
            if param.direction == Direction::Out {
                if let LoadedValue::Path(path) = &param.value {
                    std::fs::write(path, &rendered)
                        .map_err(|e| Error::TaskFailure(e.to_string()))?;
                    outputs.push(InvocationOutput {
                        name: param.name.clone(),
                        value: OutputValue::File,
                    });
                }
            }
        }
        Ok(outputs)
    })
}

struct Cluster {
    runtime: Weft,
    plane: Arc<DataPlane>,
    log: Arc<EventLog>,
}

impl Cluster {
    async fn start(policy: SchedulerPolicyKind) -> Self {
        let (runtime, _handle) = Weft::start(config(policy));
        Self {
            runtime,
            plane: DataPlane::new(),
            log: EventLog::new(),
        }
    }

    async fn add_worker(&self, name: &str, cores: u32) -> Arc<InProcessWorker> {
        self.add_kinded_worker(name, "cpu", cores).await
    }

    async fn add_kinded_worker(&self, name: &str, kind: &str, cores: u32) -> Arc<InProcessWorker> {
        let worker = InProcessWorker::build(
            name,
            kind,
            ResourceDescription::new(cores, 4096),
            &self.plane,
            &self.runtime,
            pipeline_invoker(self.log.clone(), name),
        );
        self.runtime.add_worker(worker.clone()).await.unwrap();
        worker
    }

    /// Bytes of the renaming, looked up across all workers.
    async fn read(&self, renaming: &str, workers: &[&str]) -> Option<Vec<u8>> {
        for name in workers {
            if let Some(manager) = self.plane.manager(&WorkerId::new(*name)) {
                if let Ok(bytes) = manager.get_object(renaming).await {
                    return Some(bytes);
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------
// S1: read-after-write chain
// ---------------------------------------------------------------------

#[tokio::test]
async fn s1_raw_chain_runs_in_order() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    cluster.add_worker("w1", 1).await;
    cluster.add_worker("w2", 1).await;
    let app = Uuid::new_v4();

    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "f").out_file("/d1").build())
        .await
        .unwrap();
    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "g").in_file("/d1").out_file("/d2").build())
        .await
        .unwrap();
    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "h").in_file("/d2").out_file("/d3").build())
        .await
        .unwrap();

    barrier(&cluster.runtime, app).await;

    let order: Vec<String> = cluster
        .log
        .events()
        .iter()
        .map(|e| e.split('@').next().unwrap().to_string())
        .collect();
    assert_eq!(order, vec!["f", "g", "h"]);

    // h observed g's output, which observed f's
    let d3 = cluster.read("d3_v2", &["w1", "w2"]).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&d3), "h(g(f()))");
}

// ---------------------------------------------------------------------
// S2: fan-out / fan-in
// ---------------------------------------------------------------------

#[tokio::test]
async fn s2_fan_out_fan_in() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    cluster.add_worker("w1", 2).await;
    cluster.add_worker("w2", 2).await;
    let app = Uuid::new_v4();

    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "producer").out_file("/d1").build())
        .await
        .unwrap();
    for i in 0..4 {
        cluster
            .runtime
            .submit_task(
                TaskBuilder::new(app, format!("map{i}"))
                    .in_file("/d1")
                    .out_file(&format!("/r{i}"))
                    .build(),
            )
            .await
            .unwrap();
    }
    cluster
        .runtime
        .submit_task(
            TaskBuilder::new(app, "reduce")
                .in_file("/r0")
                .in_file("/r1")
                .in_file("/r2")
                .in_file("/r3")
                .out_file("/final")
                .build(),
        )
        .await
        .unwrap();

    barrier(&cluster.runtime, app).await;

    let events = cluster.log.events();
    assert_eq!(events.len(), 6);
    assert!(events[0].starts_with("producer@"));
    assert!(events[5].starts_with("reduce@"));

    // The reduce saw all four map outputs
    let final_renaming = "d6_v2"; // d1..d5 are producer output + four map outputs
    let out = cluster.read(final_renaming, &["w1", "w2"]).await.unwrap();
    let text = String::from_utf8_lossy(&out);
    for i in 0..4 {
        assert!(text.contains(&format!("map{i}(producer())")), "missing map{i} in {text}");
    }
}

// ---------------------------------------------------------------------
// S3: write-after-read
// ---------------------------------------------------------------------

#[tokio::test]
async fn s3_write_waits_for_pending_read() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    cluster.add_worker("w1", 2).await;
    let app = Uuid::new_v4();

    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "seed").out_file("/d1").build())
        .await
        .unwrap();
    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "r").in_file("/d1").out_file("/obs").build())
        .await
        .unwrap();
    // No data dependency on r, but the write must not overtake the read
    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "w").out_file("/d1").build())
        .await
        .unwrap();

    barrier(&cluster.runtime, app).await;

    let order: Vec<String> = cluster
        .log
        .events()
        .iter()
        .map(|e| e.split('@').next().unwrap().to_string())
        .collect();
    assert_eq!(order, vec!["seed", "r", "w"]);

    // The reader observed the seeded version, not w's
    let obs = cluster.read("d2_v2", &["w1"]).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&obs), "r(seed())");
}

// ---------------------------------------------------------------------
// S4: retry with worker exclusion
// ---------------------------------------------------------------------

#[tokio::test]
async fn s4_retry_excludes_faulty_worker() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    let app = Uuid::new_v4();

    // w1 aborts the flaky signature with a transient transfer error
    let log = cluster.log.clone();
    let flaky_log = log.clone();
    let flaky_invoker = FnInvoker::new(move |job: &JobRequest, params: Vec<LoadedParam>| {
        flaky_log.record(format!("{}@w1", job.signature));
        if job.signature == "flaky" {
            return Err(Error::Transfer("synthetic link failure".into()));
        }
        write_outputs(job, &params)
    });
    let w1 = InProcessWorker::build(
        "w1",
        "cpu",
        ResourceDescription::new(1, 4096),
        &cluster.plane,
        &cluster.runtime,
        flaky_invoker,
    );
    cluster.runtime.add_worker(w1.clone()).await.unwrap();
    cluster.add_worker("w2", 1).await;

    // Locality draws the task to w1 where its input lives
    w1.seed_file("/in.dat", b"seed").await.unwrap();

    cluster
        .runtime
        .submit_task(
            TaskBuilder::new(app, "flaky")
                .in_file("/in.dat")
                .out_file("/out.dat")
                .build(),
        )
        .await
        .unwrap();

    barrier(&cluster.runtime, app).await;

    let events = cluster.log.events();
    assert_eq!(
        events,
        vec!["flaky@w1", "flaky@w1", "flaky@w2"],
        "expected two faults on w1 then success on the excluded-fault path"
    );
    assert!(cluster.read("d2_v2", &["w2"]).await.is_some());
}

fn write_outputs(job: &JobRequest, params: &[LoadedParam]) -> Result<Vec<InvocationOutput>> {
    let mut outputs = Vec::new();
    for param in params {
        if param.direction == Direction::Out {
            if let LoadedValue::Path(path) = &param.value {
                std::fs::write(path, job.signature.as_bytes())
                    .map_err(|e| Error::TaskFailure(e.to_string()))?;
                outputs.push(InvocationOutput {
                    name: param.name.clone(),
                    value: OutputValue::File,
                });
            }
        }
    }
    Ok(outputs)
}

// ---------------------------------------------------------------------
// S5: locality scoring
// ---------------------------------------------------------------------

#[tokio::test]
async fn s5_locality_prefers_larger_input() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    let w1 = cluster.add_worker("w1", 1).await;
    let w2 = cluster.add_worker("w2", 1).await;
    let app = Uuid::new_v4();

    w1.seed_file("/small.dat", &[0u8; 64]).await.unwrap();
    w2.seed_file("/large.dat", &[0u8; 65536]).await.unwrap();

    cluster
        .runtime
        .submit_task(
            TaskBuilder::new(app, "t")
                .in_file("/small.dat")
                .in_file("/large.dat")
                .out_file("/out.dat")
                .build(),
        )
        .await
        .unwrap();

    barrier(&cluster.runtime, app).await;
    assert_eq!(cluster.log.events(), vec!["t@w2"]);
}

// ---------------------------------------------------------------------
// S6: commutative group
// ---------------------------------------------------------------------

#[tokio::test]
async fn s6_commutative_members_merge_before_reader() {
    let (runtime, _handle) = Weft::start(config(SchedulerPolicyKind::Locality));
    let plane = DataPlane::new();
    let log = EventLog::new();
    let app = Uuid::new_v4();

    // Commutative members append one line each; the reader snapshots the
    // accumulator. One worker with three slots lets members overlap.
    let inv_log = log.clone();
    let invoker = FnInvoker::new(move |job: &JobRequest, params: Vec<LoadedParam>| {
        inv_log.record(job.signature.clone());
        for param in &params {
            match (&param.direction, &param.value) {
                (Direction::Commutative, LoadedValue::Path(path)) => {
                    use std::io::Write;
                    let mut file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| Error::TaskFailure(e.to_string()))?;
                    writeln!(file, "{}", job.signature)
                        .map_err(|e| Error::TaskFailure(e.to_string()))?;
                }
                (Direction::In, LoadedValue::Path(path)) => {
                    let bytes =
                        std::fs::read(path).map_err(|e| Error::TaskFailure(e.to_string()))?;
                    for out in &params {
                        if out.direction == Direction::Out {
                            if let LoadedValue::Path(out_path) = &out.value {
                                std::fs::write(out_path, &bytes)
                                    .map_err(|e| Error::TaskFailure(e.to_string()))?;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        let mut outputs = Vec::new();
        for param in &params {
            if matches!(param.direction, Direction::Out | Direction::Commutative) {
                outputs.push(InvocationOutput {
                    name: param.name.clone(),
                    value: OutputValue::File,
                });
            }
        }
        Ok(outputs)
    });
    let worker = InProcessWorker::build(
        "w1",
        "cpu",
        ResourceDescription::new(3, 4096),
        &plane,
        &runtime,
        invoker,
    );
    runtime.add_worker(worker.clone()).await.unwrap();

    worker.seed_file("/acc", b"").await.unwrap();

    for i in 0..3 {
        runtime
            .submit_task(
                TaskBuilder::new(app, format!("m{i}"))
                    .commutative_file("/acc")
                    .build(),
            )
            .await
            .unwrap();
    }
    runtime
        .submit_task(
            TaskBuilder::new(app, "reader")
                .in_file("/acc")
                .out_file("/snapshot")
                .build(),
        )
        .await
        .unwrap();

    tokio::time::timeout(WAIT, runtime.barrier(app))
        .await
        .expect("barrier timed out")
        .expect("barrier failed");

    // The reader ran last
    let events = log.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[3], "reader");

    // And observed all three contributions, in whatever order they landed
    let snapshot = plane
        .manager(&WorkerId::new("w1"))
        .unwrap()
        .get_object("d2_v2")
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&snapshot);
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["m0", "m1", "m2"]);
}

// ---------------------------------------------------------------------
// Cross-worker transfer
// ---------------------------------------------------------------------

#[tokio::test]
async fn transfer_pulls_input_from_remote_worker() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    let w1 = cluster.add_worker("w1", 1).await;
    cluster.add_kinded_worker("w2", "gpu", 1).await;
    let app = Uuid::new_v4();

    w1.seed_file("/input.dat", b"tensor").await.unwrap();

    // The only implementation targets gpu workers, forcing a transfer
    cluster
        .runtime
        .submit_task(
            TaskBuilder::new(app, "infer")
                .implementation(
                    Implementation::new("infer", ResourceDescription::new(1, 64))
                        .with_worker_kind("gpu"),
                )
                .in_file("/input.dat")
                .out_file("/result.dat")
                .build(),
        )
        .await
        .unwrap();

    barrier(&cluster.runtime, app).await;
    assert_eq!(cluster.log.events(), vec!["infer@w2"]);
    let result = cluster.read("d2_v2", &["w2"]).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&result), "infer(tensor)");
}

// ---------------------------------------------------------------------
// Barrier semantics
// ---------------------------------------------------------------------

#[tokio::test]
async fn barrier_returns_only_after_all_tasks_terminal() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    cluster.add_worker("w1", 2).await;
    let app = Uuid::new_v4();

    for i in 0..5 {
        cluster
            .runtime
            .submit_task(
                TaskBuilder::new(app, format!("t{i}"))
                    .out_file(&format!("/o{i}"))
                    .build(),
            )
            .await
            .unwrap();
    }
    barrier(&cluster.runtime, app).await;
    assert_eq!(cluster.log.events().len(), 5);

    // An idle application's barrier returns immediately
    barrier(&cluster.runtime, Uuid::new_v4()).await;
}

// ---------------------------------------------------------------------
// Blocking read from the user thread
// ---------------------------------------------------------------------

#[tokio::test]
async fn open_file_blocks_until_producer_commits() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    cluster.add_worker("w1", 1).await;
    let app = Uuid::new_v4();

    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "make").out_file("/result").build())
        .await
        .unwrap();

    let open = cluster
        .runtime
        .open_file("/result", AccessMode::Read)
        .await
        .unwrap();
    let committed = tokio::time::timeout(WAIT, open.ready)
        .await
        .expect("blocking read timed out")
        .expect("runtime stopped")
        .expect("producer failed");
    assert_eq!(committed.renaming(), "d1_v2");

    let bytes = cluster.read(&committed.renaming(), &["w1"]).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&bytes), "make()");

    cluster.runtime.close_file(open.instance).await.unwrap();
}

// ---------------------------------------------------------------------
// Application cancellation
// ---------------------------------------------------------------------

#[tokio::test]
async fn cancelled_application_produces_nothing() {
    // No workers: tasks stay queued until cancelled
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    let app = Uuid::new_v4();

    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "f").out_file("/d1").build())
        .await
        .unwrap();
    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "g").in_file("/d1").out_file("/d2").build())
        .await
        .unwrap();

    cluster.runtime.cancel_application(app).await.unwrap();
    barrier(&cluster.runtime, app).await;

    // A late worker must not revive cancelled work
    cluster.add_worker("w1", 1).await;
    barrier(&cluster.runtime, app).await;
    assert!(cluster.log.events().is_empty());
}

// ---------------------------------------------------------------------
// Group barriers
// ---------------------------------------------------------------------

#[tokio::test]
async fn barrier_group_scopes_to_group_members() {
    let cluster = Cluster::start(SchedulerPolicyKind::Locality).await;
    cluster.add_worker("w1", 2).await;
    let app = Uuid::new_v4();

    cluster
        .runtime
        .submit_task(
            TaskBuilder::new(app, "grouped")
                .group("stage-1")
                .out_file("/g1")
                .build(),
        )
        .await
        .unwrap();
    cluster
        .runtime
        .submit_task(TaskBuilder::new(app, "loose").out_file("/g2").build())
        .await
        .unwrap();

    tokio::time::timeout(WAIT, cluster.runtime.barrier_group(app, "stage-1"))
        .await
        .expect("group barrier timed out")
        .expect("group barrier failed");
    assert!(cluster
        .log
        .events()
        .iter()
        .any(|e| e.starts_with("grouped@")));

    barrier(&cluster.runtime, app).await;
}
