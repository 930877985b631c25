//! Remote worker registry: capacity, trust, and selection scoring.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;
use weft_types::{unix_now, Capacity, WorkerState};

/// Trust EWMA smoothing factor.
const TRUST_ALPHA: f64 = 0.1;

const WEIGHT_LOAD: f64 = 0.4;
const WEIGHT_TRUST: f64 = 0.4;
const WEIGHT_RECENCY: f64 = 0.2;

/// Score of a candidate the registry has no record for: idle, trust 0.5,
/// just seen.
const FRESH_SCORE: f64 = WEIGHT_LOAD + WEIGHT_TRUST * 0.5 + WEIGHT_RECENCY;

/// Thread-safe registry of known workers.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerState>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers or refreshes a worker. New workers start at trust 0.5.
    pub fn upsert(&self, worker_id: &str, capacity: Capacity) {
        let mut workers = self.workers.write().expect("worker registry poisoned");
        workers
            .entry(worker_id.to_string())
            .and_modify(|w| {
                w.capacity = capacity.clone();
                w.last_seen = unix_now();
            })
            .or_insert_with(|| WorkerState::new(worker_id, capacity));
    }

    /// Folds a task outcome into the worker's trust EWMA and refreshes its
    /// reported load. A worker seen for the first time through an outcome
    /// gets a placeholder capacity until it reports one.
    pub fn record_result(&self, worker_id: &str, success: bool, reported_load: Option<f64>) {
        let mut workers = self.workers.write().expect("worker registry poisoned");
        workers.entry(worker_id.to_string()).or_insert_with(|| {
            WorkerState::new(
                worker_id,
                Capacity {
                    cpu_cores: 1,
                    ram_mb: 0,
                    disk_mb: 0,
                    bandwidth_mbps: 0,
                    current_load: 0.0,
                },
            )
        });
        if let Some(worker) = workers.get_mut(worker_id) {
            let sample = if success { 1.0 } else { 0.0 };
            worker.trust_score += TRUST_ALPHA * (sample - worker.trust_score);
            worker.total_tasks += 1;
            if success {
                worker.successful_tasks += 1;
            }
            if let Some(load) = reported_load {
                worker.capacity.current_load = load.clamp(0.0, 1.0);
            }
            worker.last_seen = unix_now();
            debug!(worker = worker_id, trust = worker.trust_score, success, "trust updated");
        }
    }

    /// Picks the highest-scoring worker not in `exclude`.
    ///
    /// score = 0.4·(1 − load) + 0.4·trust + 0.2·recency,
    /// recency = 1 / (1 + idle_secs / 60)
    pub fn select(&self, exclude: &[&str]) -> Option<String> {
        let now = unix_now();
        let workers = self.workers.read().expect("worker registry poisoned");
        workers
            .values()
            .filter(|w| !exclude.contains(&w.worker_id.as_str()))
            .map(|w| (w.worker_id.clone(), score(w, now)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }

    /// Like [`WorkerRegistry::select`] but restricted to `candidates`
    /// (typically the delegator's available-worker list). A candidate the
    /// registry has never scored gets the fresh-worker default.
    pub fn select_from(&self, candidates: &[String], exclude: &[&str]) -> Option<String> {
        let now = unix_now();
        let workers = self.workers.read().expect("worker registry poisoned");
        candidates
            .iter()
            .filter(|c| !exclude.contains(&c.as_str()))
            .map(|c| {
                let s = workers.get(c).map(|w| score(w, now)).unwrap_or(FRESH_SCORE);
                (c.clone(), s)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerState> {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .get(worker_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.read().expect("worker registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn score(worker: &WorkerState, now: u64) -> f64 {
    let idle = now.saturating_sub(worker.last_seen) as f64;
    let recency = 1.0 / (1.0 + idle / 60.0);
    WEIGHT_LOAD * worker.capacity.idle_fraction()
        + WEIGHT_TRUST * worker.trust_score
        + WEIGHT_RECENCY * recency
}
