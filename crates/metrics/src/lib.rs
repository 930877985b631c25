//! Prometheus metrics for the weft node.
//!
//! One metric family per subsystem, registered lazily against the default
//! registry. Gauges labelled "estimated" are heuristics, not measurements.
//!
//! Usage:
//!   P2P_METRICS.connected_peers.set(n);
//!   CES_METRICS.process_seconds.observe(elapsed);

pub mod ces;
pub mod compute;
pub mod exporter;
pub mod p2p;

pub use ces::CES_METRICS;
pub use compute::COMPUTE_METRICS;
pub use p2p::P2P_METRICS;
