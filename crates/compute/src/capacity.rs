//! Local capacity probe.
//!
//! Core count comes from the OS; memory, disk and bandwidth are static
//! estimates refined by operator configuration where it matters. Load is
//! tracked by the orchestrator as in-flight tasks over cores.

use std::sync::atomic::{AtomicUsize, Ordering};

use weft_types::Capacity;

/// Default static estimates for resources the probe cannot measure.
const DEFAULT_RAM_MB: u64 = 8_192;
const DEFAULT_DISK_MB: u64 = 100_000;
const DEFAULT_BANDWIDTH_MBPS: u64 = 100;

/// Tracks in-flight tasks to derive `current_load`.
pub struct CapacityTracker {
    cores: u32,
    in_flight: AtomicUsize,
}

impl CapacityTracker {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        CapacityTracker {
            cores,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Capacity {
        let in_flight = self.in_flight.load(Ordering::Relaxed) as f64;
        Capacity {
            cpu_cores: self.cores,
            ram_mb: DEFAULT_RAM_MB,
            disk_mb: DEFAULT_DISK_MB,
            bandwidth_mbps: DEFAULT_BANDWIDTH_MBPS,
            current_load: (in_flight / self.cores as f64).clamp(0.0, 1.0),
        }
    }
}

impl Default for CapacityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_follows_in_flight_tasks() {
        let tracker = CapacityTracker::new();
        assert_eq!(tracker.snapshot().current_load, 0.0);
        tracker.task_started();
        assert!(tracker.snapshot().current_load > 0.0);
        tracker.task_finished();
        assert_eq!(tracker.snapshot().current_load, 0.0);
    }

    #[test]
    fn load_saturates_at_one() {
        let tracker = CapacityTracker::new();
        for _ in 0..10_000 {
            tracker.task_started();
        }
        assert_eq!(tracker.snapshot().current_load, 1.0);
    }
}
