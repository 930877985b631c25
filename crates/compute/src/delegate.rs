//! Delegation seam between the orchestrator and the network.
//!
//! The orchestrator only sees this trait; swapping the p2p-backed
//! implementation for a mock changes nothing about scheduling, retry or
//! verification behavior.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use weft_p2p::NetworkHandle;
use weft_types::{Task, TaskResult};

use crate::error::ComputeError;
use crate::workers::WorkerRegistry;

#[async_trait]
pub trait Delegator: Send + Sync {
    fn has_workers(&self) -> bool;
    fn available_workers(&self) -> Vec<String>;
    async fn delegate(&self, worker_id: &str, task: Task) -> Result<TaskResult, ComputeError>;
}

/// Delegator speaking the compute protocol over the overlay. Worker ids are
/// peer-id strings; capacity refreshes land in the shared registry.
pub struct P2pDelegator {
    network: NetworkHandle,
    workers: Arc<WorkerRegistry>,
}

impl P2pDelegator {
    pub fn new(network: NetworkHandle, workers: Arc<WorkerRegistry>) -> Self {
        P2pDelegator { network, workers }
    }

    /// Queries a connected peer's capacity and registers it as a worker.
    pub async fn enroll(&self, peer: PeerId) -> Result<(), ComputeError> {
        let capacity = self
            .network
            .query_capacity(peer)
            .await
            .map_err(|e| ComputeError::DelegationFailed(e.to_string()))?;
        self.workers.upsert(&peer.to_string(), capacity);
        Ok(())
    }
}

#[async_trait]
impl Delegator for P2pDelegator {
    fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    fn available_workers(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for _ in 0..self.workers.len() {
            // Registry selection is score-ordered; collect distinct ids.
            if let Some(id) = self
                .workers
                .select(&ids.iter().map(String::as_str).collect::<Vec<_>>())
            {
                ids.push(id);
            } else {
                break;
            }
        }
        ids
    }

    async fn delegate(&self, worker_id: &str, task: Task) -> Result<TaskResult, ComputeError> {
        let peer = PeerId::from_str(worker_id)
            .map_err(|_| ComputeError::DelegationFailed(format!("bad worker id {worker_id}")))?;
        self.network
            .delegate(peer, task)
            .await
            .map_err(|e| ComputeError::DelegationFailed(e.to_string()))
    }
}
