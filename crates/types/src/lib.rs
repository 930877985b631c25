//! Shared data model for the weft network.
//!
//! Everything that crosses a crate boundary lives here: content hashes and
//! short peer aliases, shard and manifest records for the storage path, and
//! the job/task/worker model for the compute path. All wire-visible types
//! implement serde; hashing helpers are deterministic.

pub mod compute;
pub mod ids;
pub mod node;
pub mod shard;

pub use compute::{
    Capacity, JobManifest, JobStatus, Task, TaskResult, TaskStatus, VerificationMode, WorkerState,
};
pub use ids::{ContentHash, ShortId};
pub use node::{NodeRecord, NodeStatus};
pub use shard::{Manifest, Shard};

/// Seconds since the Unix epoch. The data model stores wall-clock instants
/// as plain u64 seconds so records stay serde-friendly.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
