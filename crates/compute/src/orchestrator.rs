//! Job intake, scheduling, execution and result delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};
use weft_metrics::COMPUTE_METRICS;
use weft_types::{
    Capacity, JobManifest, JobStatus, Task, TaskResult, TaskStatus, VerificationMode,
};

use crate::capacity::CapacityTracker;
use crate::delegate::Delegator;
use crate::error::ComputeError;
use crate::merkle::{self, MerkleTree};
use crate::queue::TaskQueue;
use crate::sandbox::{Sandbox, SandboxLimits};
use crate::split;
use crate::verify;
use crate::workers::WorkerRegistry;
use crate::backoff_delay;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub sandbox_limits: SandboxLimits,
    /// Scheduler wake cadence when idle; cancellations land within one tick.
    pub tick: Duration,
    /// In-flight task ceiling.
    pub max_parallel: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            sandbox_limits: SandboxLimits::default(),
            tick: Duration::from_millis(50),
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
        }
    }
}

type JobOutcome = Result<(Vec<u8>, String), String>;

struct JobEntry {
    manifest: JobManifest,
    status: TaskStatus,
    total_chunks: u32,
    completed: HashMap<u32, TaskResult>,
    /// Hash mode: first verified hash becomes authoritative.
    authoritative_hash: Option<String>,
    /// Merkle mode: leaf hashes by chunk index.
    chunk_leaves: HashMap<u32, merkle::Hash32>,
    workers_used: HashSet<String>,
    result_tx: Option<oneshot::Sender<JobOutcome>>,
    result_rx: Option<oneshot::Receiver<JobOutcome>>,
    started_at: Instant,
}

impl JobEntry {
    fn transition(&mut self, next: TaskStatus) {
        if !self.status.is_terminal() {
            self.status = next;
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    sandbox: Sandbox,
    jobs: RwLock<HashMap<String, Arc<Mutex<JobEntry>>>>,
    /// WASM modules known to this node, keyed by job id. Locally submitted
    /// jobs register their module here; a worker must hold a job's module
    /// before it can execute the job's chunks.
    modules: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    queue: Mutex<TaskQueue>,
    workers: Arc<WorkerRegistry>,
    delegator: RwLock<Option<Arc<dyn Delegator>>>,
    capacity: CapacityTracker,
    wake: Notify,
    slots: Arc<Semaphore>,
    shutdown: AtomicBool,
}

/// The compute orchestrator. Cheap to clone; `start` spawns the scheduler.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, ComputeError> {
        let sandbox = Sandbox::new(config.sandbox_limits)?;
        let slots = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config,
                sandbox,
                jobs: RwLock::new(HashMap::new()),
                modules: RwLock::new(HashMap::new()),
                queue: Mutex::new(TaskQueue::new()),
                workers: Arc::new(WorkerRegistry::new()),
                delegator: RwLock::new(None),
                capacity: CapacityTracker::new(),
                wake: Notify::new(),
                slots,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Installs the remote-delegation capability. Absent a delegator every
    /// task runs locally.
    pub fn set_delegator(&self, delegator: Arc<dyn Delegator>) {
        *self.inner.delegator.write().expect("delegator poisoned") = Some(delegator);
    }

    pub fn workers(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.inner.workers)
    }

    /// Makes a job's module executable on this node without submitting the
    /// job here (the worker side of delegation).
    pub fn register_module(&self, job_id: &str, wasm: Vec<u8>) {
        self.inner
            .modules
            .write()
            .expect("modules poisoned")
            .insert(job_id.to_string(), Arc::new(wasm));
    }

    /// Spawns the scheduler loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run().await })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.wake.notify_waiters();
    }

    /// Registers the job, splits its input and enqueues every chunk.
    pub fn submit_job(&self, manifest: JobManifest) -> Result<String, ComputeError> {
        let chunks = split::split(&manifest.input, manifest.min_chunk, manifest.max_chunk)?;
        let job_id = manifest.job_id.clone();

        {
            let mut jobs = self.inner.jobs.write().expect("jobs poisoned");
            if jobs.contains_key(&job_id) {
                return Err(ComputeError::DuplicateJob(job_id));
            }
            let (result_tx, result_rx) = oneshot::channel();
            jobs.insert(
                job_id.clone(),
                Arc::new(Mutex::new(JobEntry {
                    status: TaskStatus::Pending,
                    total_chunks: chunks.len() as u32,
                    completed: HashMap::new(),
                    authoritative_hash: None,
                    chunk_leaves: HashMap::new(),
                    workers_used: HashSet::new(),
                    result_tx: Some(result_tx),
                    result_rx: Some(result_rx),
                    started_at: Instant::now(),
                    manifest: manifest.clone(),
                })),
            );
        }
        self.register_module(&job_id, manifest.wasm_module.clone());

        {
            let mut queue = self.inner.queue.lock().expect("queue poisoned");
            for (index, chunk) in chunks.into_iter().enumerate() {
                queue.push(
                    Task {
                        task_id: format!("{job_id}:{index}"),
                        parent_job_id: job_id.clone(),
                        chunk_index: index as u32,
                        input: chunk,
                        function_name: "process".to_string(),
                        timeout_ms: manifest.timeout_secs.saturating_mul(1000),
                    },
                    manifest.priority,
                );
            }
            COMPUTE_METRICS.queue_depth.set(queue.len() as i64);
        }

        COMPUTE_METRICS.jobs_submitted.inc();
        info!(job = %job_id, "job submitted");
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    /// Blocks until the job's result lands or `timeout` elapses; a timeout
    /// transitions the job to `Timeout`.
    pub async fn get_job_result(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<(Vec<u8>, String), ComputeError> {
        let rx = {
            let entry = self.job(job_id)?;
            let mut entry = entry.lock().expect("job poisoned");
            entry.result_rx.take().ok_or(ComputeError::ResultTaken)?
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(description))) => {
                let status = self.status_of(job_id);
                if status == Some(TaskStatus::Cancelled) {
                    Err(ComputeError::Cancelled)
                } else {
                    Err(ComputeError::JobFailed(description))
                }
            }
            Ok(Err(_)) => Err(ComputeError::JobFailed("result channel dropped".into())),
            Err(_) => {
                if let Ok(entry) = self.job(job_id) {
                    let mut entry = entry.lock().expect("job poisoned");
                    entry.transition(TaskStatus::Timeout);
                }
                COMPUTE_METRICS.jobs_failed.inc();
                Err(ComputeError::Timeout)
            }
        }
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatus, ComputeError> {
        let entry = self.job(job_id)?;
        let entry = entry.lock().expect("job poisoned");
        let completed = entry.completed.len() as u32;
        let total = entry.total_chunks.max(1);
        let progress = completed as f64 / total as f64;
        let eta_secs = if completed > 0 && !entry.status.is_terminal() {
            let elapsed = entry.started_at.elapsed().as_secs_f64();
            let remaining = elapsed / progress.max(f64::EPSILON) * (1.0 - progress);
            Some(remaining.ceil() as u64)
        } else {
            None
        };
        Ok(JobStatus {
            status: entry.status,
            progress,
            completed_chunks: completed,
            total_chunks: entry.total_chunks,
            eta_secs,
        })
    }

    /// Transitions the job to `Cancelled` and purges its queued tasks; the
    /// change is visible to the scheduler within one tick.
    pub fn cancel_job(&self, job_id: &str) -> Result<(), ComputeError> {
        let entry = self.job(job_id)?;
        {
            let mut entry = entry.lock().expect("job poisoned");
            if entry.status.is_terminal() {
                return Ok(());
            }
            entry.status = TaskStatus::Cancelled;
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err("job cancelled".into()));
            }
        }
        let purged = self
            .inner
            .queue
            .lock()
            .expect("queue poisoned")
            .remove_job(job_id);
        COMPUTE_METRICS.jobs_failed.inc();
        info!(job = job_id, purged, "job cancelled");
        Ok(())
    }

    /// This node's own capacity snapshot.
    pub fn get_capacity(&self) -> Capacity {
        self.inner.capacity.snapshot()
    }

    fn job(&self, job_id: &str) -> Result<Arc<Mutex<JobEntry>>, ComputeError> {
        self.inner
            .jobs
            .read()
            .expect("jobs poisoned")
            .get(job_id)
            .cloned()
            .ok_or_else(|| ComputeError::UnknownJob(job_id.to_string()))
    }

    fn status_of(&self, job_id: &str) -> Option<TaskStatus> {
        self.job(job_id)
            .ok()
            .map(|e| e.lock().expect("job poisoned").status)
    }

    async fn run(self) {
        loop {
            if self.inner.shutdown.load(Ordering::Relaxed) {
                return;
            }
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(self.inner.config.tick) => {}
            }
            self.drain_queue().await;
        }
    }

    async fn drain_queue(&self) {
        loop {
            let task = {
                let mut queue = self.inner.queue.lock().expect("queue poisoned");
                let task = queue.pop();
                COMPUTE_METRICS.queue_depth.set(queue.len() as i64);
                task
            };
            let Some(task) = task else { return };

            let Ok(entry) = self.job(&task.parent_job_id) else {
                continue;
            };
            {
                let mut entry = entry.lock().expect("job poisoned");
                if entry.status.is_terminal() {
                    continue;
                }
                entry.transition(TaskStatus::Assigned);
            }

            let permit = match Arc::clone(&self.inner.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.run_task(task).await;
                drop(permit);
            });
        }
    }

    async fn run_task(&self, task: Task) {
        let Ok(entry) = self.job(&task.parent_job_id) else {
            return;
        };
        let (verification, redundancy, retries) = {
            let mut guard = entry.lock().expect("job poisoned");
            if guard.status.is_terminal() {
                return;
            }
            guard.transition(TaskStatus::Computing);
            (
                guard.manifest.verification_mode,
                guard.manifest.redundancy.clamp(1, 3),
                guard.manifest.retries,
            )
        };

        let outcome = if verification == VerificationMode::Redundant {
            self.run_redundant(&task, redundancy, retries).await
        } else {
            self.run_with_retries(&task, retries, &[]).await
        };

        match outcome {
            Ok(result) => self.accept_result(&task, result, verification),
            Err(err) => {
                warn!(task = %task.task_id, %err, "task exhausted its attempts");
                self.fail_job(&task.parent_job_id, err.to_string());
            }
        }
    }

    /// Delegation-first execution with local fallback and exponential
    /// backoff across the retry budget.
    async fn run_with_retries(
        &self,
        task: &Task,
        retries: u32,
        exclude: &[String],
    ) -> Result<TaskResult, ComputeError> {
        let mut tried: Vec<String> = exclude.to_vec();
        let mut last_err: Option<ComputeError> = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            if self
                .status_of(&task.parent_job_id)
                .map_or(true, |s| s.is_terminal())
            {
                return Err(ComputeError::Cancelled);
            }

            let delegator = self
                .inner
                .delegator
                .read()
                .expect("delegator poisoned")
                .clone();
            let remote = delegator.as_ref().filter(|d| d.has_workers()).and_then(|d| {
                let candidates = d.available_workers();
                let excluded: Vec<&str> = tried.iter().map(String::as_str).collect();
                self.inner
                    .workers
                    .select_from(&candidates, &excluded)
                    .map(|w| (Arc::clone(d), w))
            });

            match remote {
                Some((delegator, worker)) => {
                    COMPUTE_METRICS.tasks_delegated.inc();
                    match delegator.delegate(&worker, task.clone()).await {
                        Ok(result)
                            if result.status == TaskStatus::Completed && result.hash_matches() =>
                        {
                            self.inner.workers.record_result(&worker, true, None);
                            return Ok(result);
                        }
                        Ok(result) if result.status == TaskStatus::Completed => {
                            // Integrity failure: discard, penalize, try
                            // another worker.
                            self.inner.workers.record_result(&worker, false, None);
                            tried.push(worker);
                            COMPUTE_METRICS.verification_failures.inc();
                            last_err = Some(ComputeError::VerificationFailed(
                                "delegated result hash mismatch".into(),
                            ));
                        }
                        Ok(result) => {
                            self.inner.workers.record_result(&worker, false, None);
                            tried.push(worker);
                            last_err = Some(ComputeError::DelegationFailed(
                                result.error.unwrap_or_else(|| "worker reported failure".into()),
                            ));
                        }
                        Err(err) => {
                            self.inner.workers.record_result(&worker, false, None);
                            tried.push(worker);
                            debug!(task = %task.task_id, %err, "delegation failed, will fall back");
                            last_err = Some(err);
                        }
                    }
                }
                None => match self.execute_local(task).await {
                    Ok(result) => return Ok(result),
                    Err(err) if err.is_retryable() => last_err = Some(err),
                    Err(err) => return Err(err),
                },
            }
        }

        // The retry budget is spent; one final local attempt so a flaky
        // worker set cannot sink an executable task.
        match self.execute_local(task).await {
            Ok(result) => Ok(result),
            Err(err) => Err(last_err.unwrap_or(err)),
        }
    }

    /// Redundant mode: the same chunk on `redundancy` distinct workers,
    /// local executions filling any shortfall, then majority vote.
    async fn run_redundant(
        &self,
        task: &Task,
        redundancy: u8,
        retries: u32,
    ) -> Result<TaskResult, ComputeError> {
        let mut results = Vec::with_capacity(redundancy as usize);
        let mut used: Vec<String> = Vec::new();
        for _ in 0..redundancy {
            let result = self.run_with_retries(task, retries, &used).await?;
            used.push(result.worker_id.clone());
            results.push(result);
        }
        verify::majority(results)
    }

    async fn execute_local(&self, task: &Task) -> Result<TaskResult, ComputeError> {
        let module = self
            .inner
            .modules
            .read()
            .expect("modules poisoned")
            .get(&task.parent_job_id)
            .cloned()
            .ok_or_else(|| {
                ComputeError::InvalidModule(format!("no module for job {}", task.parent_job_id))
            })?;

        COMPUTE_METRICS.tasks_local.inc();
        self.inner.capacity.task_started();
        let sandbox = self.inner.sandbox.clone();
        let function = task.function_name.clone();
        let input = task.input.clone();
        let timeout = Duration::from_millis(task.timeout_ms.max(1));
        let joined = tokio::task::spawn_blocking(move || {
            sandbox.execute(module.as_slice(), &function, &input, Some(timeout))
        })
        .await;
        self.inner.capacity.task_finished();

        let output = joined.map_err(|e| ComputeError::Trapped(e.to_string()))??;
        COMPUTE_METRICS
            .task_seconds
            .observe(output.elapsed.as_secs_f64());
        Ok(TaskResult::completed(
            task.task_id.clone(),
            output.bytes,
            output.elapsed.as_millis() as u64,
            "local".to_string(),
        ))
    }

    /// Verifies and records a completed chunk; merges when the job is done.
    fn accept_result(&self, task: &Task, result: TaskResult, mode: VerificationMode) {
        let Ok(entry) = self.job(&task.parent_job_id) else {
            return;
        };
        let mut guard = entry.lock().expect("job poisoned");
        if guard.status.is_terminal() {
            return;
        }
        guard.transition(TaskStatus::Verifying);

        let verdict = match mode {
            VerificationMode::Hash => {
                let authoritative = guard.authoritative_hash.clone();
                verify::check_hash(&result, authoritative.as_deref()).map(|()| {
                    guard
                        .authoritative_hash
                        .get_or_insert_with(|| result.result_hash.clone());
                })
            }
            VerificationMode::MerkleTree => verify::check_hash(&result, None).map(|()| {
                guard
                    .chunk_leaves
                    .insert(task.chunk_index, merkle::leaf_hash(&result.result));
            }),
            // Majority voting already ran; keep the carried-hash belt check.
            VerificationMode::Redundant => verify::check_hash(&result, None),
        };

        if let Err(err) = verdict {
            COMPUTE_METRICS.verification_failures.inc();
            drop(guard);
            self.fail_job(&task.parent_job_id, err.to_string());
            return;
        }

        guard.workers_used.insert(result.worker_id.clone());
        guard.completed.insert(task.chunk_index, result);

        if guard.completed.len() as u32 == guard.total_chunks {
            if mode == VerificationMode::MerkleTree && !merkle_consistent(&guard) {
                COMPUTE_METRICS.verification_failures.inc();
                drop(guard);
                self.fail_job(&task.parent_job_id, "merkle root mismatch".into());
                return;
            }

            let mut ordered: Vec<(u32, Vec<u8>)> = guard
                .completed
                .iter()
                .map(|(idx, r)| (*idx, r.result.clone()))
                .collect();
            ordered.sort_by_key(|(idx, _)| *idx);
            let chunks: Vec<Vec<u8>> = ordered.into_iter().map(|(_, bytes)| bytes).collect();
            let merged = split::merge(&chunks);

            let worker = if guard.workers_used.len() == 1 {
                guard
                    .workers_used
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "local".into())
            } else {
                "mixed".to_string()
            };

            guard.status = TaskStatus::Completed;
            if let Some(tx) = guard.result_tx.take() {
                let _ = tx.send(Ok((merged, worker)));
            }
            COMPUTE_METRICS.jobs_completed.inc();
            info!(job = %task.parent_job_id, chunks = guard.total_chunks, "job completed");
        }
    }

    fn fail_job(&self, job_id: &str, description: String) {
        let Ok(entry) = self.job(job_id) else { return };
        let mut guard = entry.lock().expect("job poisoned");
        if guard.status.is_terminal() {
            return;
        }
        guard.status = TaskStatus::Failed;
        if let Some(tx) = guard.result_tx.take() {
            let _ = tx.send(Err(description));
        }
        COMPUTE_METRICS.jobs_failed.inc();
        let _ = self
            .inner
            .queue
            .lock()
            .expect("queue poisoned")
            .remove_job(job_id);
    }
}

/// Rebuilds the tree from recorded leaves and re-verifies every proof.
fn merkle_consistent(entry: &JobEntry) -> bool {
    let mut leaves = Vec::with_capacity(entry.total_chunks as usize);
    for index in 0..entry.total_chunks {
        match entry.chunk_leaves.get(&index) {
            Some(leaf) => leaves.push(*leaf),
            None => return false,
        }
    }
    let tree = MerkleTree::from_leaves(leaves.clone());
    let root = tree.root();
    leaves.iter().enumerate().all(|(index, leaf)| {
        tree.proof(index)
            .map(|proof| merkle::verify_proof(*leaf, &proof, root))
            .unwrap_or(false)
    })
}

/// Worker-side entry points used by the network layer: execute a chunk in
/// the local sandbox and report capacity.
#[async_trait]
impl weft_p2p::ComputeHandler for Orchestrator {
    async fn execute(&self, task: Task) -> TaskResult {
        match self.execute_local(&task).await {
            Ok(result) => result,
            Err(err) => TaskResult::failed(task.task_id, "local".into(), err.to_string()),
        }
    }

    fn capacity(&self) -> Capacity {
        self.get_capacity()
    }
}
