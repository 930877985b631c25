//! Orchestrator behavior: local execution, delegation, verification modes,
//! cancellation and timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use weft_compute::{ComputeError, Delegator, Orchestrator, OrchestratorConfig};
use weft_types::{JobManifest, Task, TaskResult, TaskStatus, VerificationMode};

/// Bump allocator plus a `process` entry that echoes its input.
const GUEST: &str = r#"
    (module
      (memory (export "memory") 16)
      (global $heap (mut i32) (i32.const 1024))
      (func (export "alloc") (param $n i32) (result i32)
        (local $p i32)
        global.get $heap
        local.set $p
        global.get $heap
        local.get $n
        i32.add
        global.set $heap
        local.get $p)
      (func (export "process") (param $ptr i32) (param $len i32) (result i64)
        local.get $ptr
        i64.extend_i32_u
        i64.const 32
        i64.shl
        local.get $len
        i64.extend_i32_u
        i64.or))
"#;

fn manifest(job_id: &str, input: Vec<u8>, min_chunk: usize, max_chunk: usize) -> JobManifest {
    JobManifest {
        job_id: job_id.to_string(),
        wasm_module: GUEST.as_bytes().to_vec(),
        input,
        min_chunk,
        max_chunk,
        timeout_secs: 10,
        retries: 2,
        priority: 100,
        redundancy: 1,
        verification_mode: VerificationMode::Hash,
    }
}

fn orchestrator() -> Orchestrator {
    Orchestrator::new(OrchestratorConfig::default()).expect("orchestrator builds")
}

struct MockWorker {
    calls: AtomicUsize,
    last_task: Mutex<Option<Task>>,
    output: Vec<u8>,
}

impl MockWorker {
    fn new(output: &[u8]) -> Arc<Self> {
        Arc::new(MockWorker {
            calls: AtomicUsize::new(0),
            last_task: Mutex::new(None),
            output: output.to_vec(),
        })
    }
}

#[async_trait]
impl Delegator for MockWorker {
    fn has_workers(&self) -> bool {
        true
    }

    fn available_workers(&self) -> Vec<String> {
        vec!["mock-worker".to_string()]
    }

    async fn delegate(&self, worker_id: &str, task: Task) -> Result<TaskResult, ComputeError> {
        assert_eq!(worker_id, "mock-worker");
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_task.lock().unwrap() = Some(task.clone());
        Ok(TaskResult::completed(
            task.task_id,
            self.output.clone(),
            5,
            worker_id.to_string(),
        ))
    }
}

#[tokio::test]
async fn local_three_chunk_job_round_trips() {
    let orch = orchestrator();
    let scheduler = orch.start();

    let input = vec![0xC3u8; 3 * 512];
    let job_id = orch
        .submit_job(manifest("job-local", input.clone(), 512, 512))
        .expect("submit succeeds");

    // No delegator set: everything runs locally; the job leaves Pending
    // quickly.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = orch.get_job_status(&job_id).expect("job exists");
    assert_ne!(status.status, TaskStatus::Pending);
    assert_eq!(status.total_chunks, 3);

    let (bytes, worker) = orch
        .get_job_result(&job_id, Duration::from_secs(10))
        .await
        .expect("job completes");
    assert_eq!(bytes, input);
    assert_eq!(worker, "local");

    let done = orch.get_job_status(&job_id).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 1.0);

    orch.shutdown();
    let _ = scheduler.await;
}

#[tokio::test]
async fn single_chunk_job_is_delegated_exactly_once() {
    let orch = orchestrator();
    let scheduler = orch.start();

    let worker = MockWorker::new(b"remote output");
    orch.set_delegator(worker.clone());

    let input = b"fits in one chunk".to_vec();
    let job_id = orch
        .submit_job(manifest("job-remote", input, 1, 4_096))
        .expect("submit succeeds");

    let (bytes, executed_by) = orch
        .get_job_result(&job_id, Duration::from_secs(10))
        .await
        .expect("job completes");

    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(bytes, b"remote output");
    assert_eq!(executed_by, "mock-worker");
    let task = worker.last_task.lock().unwrap().clone().unwrap();
    assert_eq!(task.parent_job_id, "job-remote");
    assert_eq!(task.chunk_index, 0);

    orch.shutdown();
    let _ = scheduler.await;
}

struct FailingWorker;

#[async_trait]
impl Delegator for FailingWorker {
    fn has_workers(&self) -> bool {
        true
    }

    fn available_workers(&self) -> Vec<String> {
        vec!["flaky".to_string()]
    }

    async fn delegate(&self, _worker_id: &str, _task: Task) -> Result<TaskResult, ComputeError> {
        Err(ComputeError::DelegationFailed("connection reset".into()))
    }
}

#[tokio::test]
async fn delegation_failure_falls_back_to_local() {
    let orch = orchestrator();
    let scheduler = orch.start();
    orch.set_delegator(Arc::new(FailingWorker));

    let input = b"will run locally after the worker flakes".to_vec();
    let job_id = orch
        .submit_job(manifest("job-fallback", input.clone(), 1, 4_096))
        .expect("submit succeeds");

    let (bytes, worker) = orch
        .get_job_result(&job_id, Duration::from_secs(30))
        .await
        .expect("local fallback completes");
    assert_eq!(bytes, input);
    assert_eq!(worker, "local");

    // The flaky worker's trust dropped below the 0.5 starting point.
    let state = orch.workers().get("flaky").expect("worker was scored");
    assert!(state.trust_score < 0.5);

    orch.shutdown();
    let _ = scheduler.await;
}

#[tokio::test]
async fn duplicate_job_id_is_a_capacity_error() {
    let orch = orchestrator();
    orch.submit_job(manifest("dup", b"x".to_vec(), 1, 16)).unwrap();
    assert!(matches!(
        orch.submit_job(manifest("dup", b"y".to_vec(), 1, 16)),
        Err(ComputeError::DuplicateJob(_))
    ));
}

#[tokio::test]
async fn cancelled_job_refuses_scheduling() {
    let orch = orchestrator();
    // Scheduler intentionally not started: tasks stay queued.
    let job_id = orch
        .submit_job(manifest("job-cancel", vec![1u8; 64], 16, 16))
        .expect("submit succeeds");
    orch.cancel_job(&job_id).expect("cancel succeeds");

    assert_eq!(
        orch.get_job_status(&job_id).unwrap().status,
        TaskStatus::Cancelled
    );
    let err = orch
        .get_job_result(&job_id, Duration::from_secs(1))
        .await
        .expect_err("cancelled job has no result");
    assert!(matches!(err, ComputeError::Cancelled));
}

#[tokio::test]
async fn result_timeout_transitions_job() {
    let orch = orchestrator();
    // No scheduler: the job can never complete.
    let job_id = orch
        .submit_job(manifest("job-stuck", b"x".to_vec(), 1, 16))
        .expect("submit succeeds");

    let err = orch
        .get_job_result(&job_id, Duration::from_millis(50))
        .await
        .expect_err("must time out");
    assert!(matches!(err, ComputeError::Timeout));
    assert_eq!(
        orch.get_job_status(&job_id).unwrap().status,
        TaskStatus::Timeout
    );
}

#[tokio::test]
async fn merkle_mode_round_trips() {
    let orch = orchestrator();
    let scheduler = orch.start();

    let input = vec![0x5Au8; 2048];
    let mut m = manifest("job-merkle", input.clone(), 256, 256);
    m.verification_mode = VerificationMode::MerkleTree;
    let job_id = orch.submit_job(m).expect("submit succeeds");

    let (bytes, _) = orch
        .get_job_result(&job_id, Duration::from_secs(10))
        .await
        .expect("job completes");
    assert_eq!(bytes, input);

    orch.shutdown();
    let _ = scheduler.await;
}

#[tokio::test]
async fn redundant_mode_accepts_majority() {
    let orch = orchestrator();
    let scheduler = orch.start();

    // No delegator: redundancy is satisfied by repeated local runs, which
    // agree trivially.
    let input = b"redundant payload".to_vec();
    let mut m = manifest("job-redundant", input.clone(), 1, 4_096);
    m.verification_mode = VerificationMode::Redundant;
    m.redundancy = 3;
    let job_id = orch.submit_job(m).expect("submit succeeds");

    let (bytes, _) = orch
        .get_job_result(&job_id, Duration::from_secs(30))
        .await
        .expect("job completes");
    assert_eq!(bytes, input);

    orch.shutdown();
    let _ = scheduler.await;
}

#[tokio::test]
async fn unknown_job_queries_fail() {
    let orch = orchestrator();
    assert!(matches!(
        orch.get_job_status("ghost"),
        Err(ComputeError::UnknownJob(_))
    ));
    assert!(matches!(
        orch.cancel_job("ghost"),
        Err(ComputeError::UnknownJob(_))
    ));
}
