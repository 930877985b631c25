use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::unix_now;

/// How a compute result is checked before being accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMode {
    /// Compare sha256(result) against the authoritative first return.
    Hash,
    /// Chunks carry Merkle proofs; the orchestrator rebuilds the root.
    MerkleTree,
    /// Run on `redundancy` distinct workers and accept the majority.
    Redundant,
}

/// A submitted compute job: a WASM module plus the input it maps over.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub wasm_module: Vec<u8>,
    pub input: Vec<u8>,
    /// Lower bound on chunk size in bytes.
    pub min_chunk: usize,
    /// Upper bound on chunk size in bytes.
    pub max_chunk: usize,
    pub timeout_secs: u64,
    pub retries: u32,
    pub priority: u8,
    /// Distinct workers per chunk in redundant mode, 1..=3.
    pub redundancy: u8,
    pub verification_mode: VerificationMode,
}

/// Job/task lifecycle states.
///
/// `Completed`, `Failed`, `Timeout` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Computing,
    Verifying,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

/// One schedulable chunk of a job. Serialized as JSON on the compute wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub parent_job_id: String,
    pub chunk_index: u32,
    pub input: Vec<u8>,
    pub function_name: String,
    pub timeout_ms: u64,
}

/// Outcome of executing a task, local or remote.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Vec<u8>,
    /// sha256 over `result`, hex-encoded.
    pub result_hash: String,
    pub execution_ms: u64,
    /// "local" or the executing worker's peer id string.
    pub worker_id: String,
    pub error: Option<String>,
}

impl TaskResult {
    /// Builds a completed result, stamping the sha256 of the payload.
    pub fn completed(task_id: String, result: Vec<u8>, execution_ms: u64, worker_id: String) -> Self {
        let result_hash = hex::encode(Sha256::digest(&result));
        TaskResult {
            task_id,
            status: TaskStatus::Completed,
            result,
            result_hash,
            execution_ms,
            worker_id,
            error: None,
        }
    }

    pub fn failed(task_id: String, worker_id: String, error: impl Into<String>) -> Self {
        TaskResult {
            task_id,
            status: TaskStatus::Failed,
            result: Vec::new(),
            result_hash: String::new(),
            execution_ms: 0,
            worker_id,
            error: Some(error.into()),
        }
    }

    /// Recomputes the payload hash and compares it to the carried one.
    pub fn hash_matches(&self) -> bool {
        hex::encode(Sha256::digest(&self.result)) == self.result_hash
    }
}

/// Advertised resources of a worker (or this node).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub bandwidth_mbps: u64,
    /// Fraction of capacity in use, [0, 1].
    pub current_load: f64,
}

impl Capacity {
    pub fn idle_fraction(&self) -> f64 {
        (1.0 - self.current_load).clamp(0.0, 1.0)
    }
}

/// Registry entry for a remote worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub capacity: Capacity,
    /// EWMA of the success ratio, [0, 1].
    pub trust_score: f64,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    /// Unix seconds of the last report.
    pub last_seen: u64,
}

impl WorkerState {
    pub fn new(worker_id: impl Into<String>, capacity: Capacity) -> Self {
        WorkerState {
            worker_id: worker_id.into(),
            capacity,
            trust_score: 0.5,
            total_tasks: 0,
            successful_tasks: 0,
            last_seen: unix_now(),
        }
    }
}

/// Point-in-time view of a job used by status queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: TaskStatus,
    /// Completed fraction, [0, 1].
    pub progress: f64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    /// Estimated seconds to completion, if derivable.
    pub eta_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_result_hash_matches() {
        let r = TaskResult::completed("t1".into(), b"output".to_vec(), 12, "local".into());
        assert_eq!(r.status, TaskStatus::Completed);
        assert!(r.hash_matches());
    }

    #[test]
    fn tampered_result_hash_mismatches() {
        let mut r = TaskResult::completed("t1".into(), b"output".to_vec(), 12, "local".into());
        r.result[0] ^= 0xFF;
        assert!(!r.hash_matches());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Computing.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn idle_fraction_clamps() {
        let mut cap = Capacity {
            cpu_cores: 8,
            ram_mb: 16_384,
            disk_mb: 512_000,
            bandwidth_mbps: 1_000,
            current_load: 0.25,
        };
        assert_eq!(cap.idle_fraction(), 0.75);
        cap.current_load = 1.5;
        assert_eq!(cap.idle_fraction(), 0.0);
    }
}
