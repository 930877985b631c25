use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

pub struct ComputeMetrics {
    pub jobs_submitted: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub tasks_delegated: IntCounter,
    pub tasks_local: IntCounter,
    pub verification_failures: IntCounter,
    pub queue_depth: IntGauge,
    pub task_seconds: Histogram,
}

impl ComputeMetrics {
    fn new() -> Self {
        ComputeMetrics {
            jobs_submitted: register_int_counter!("weft_compute_jobs_submitted", "Jobs accepted")
                .expect("register jobs_submitted"),
            jobs_completed: register_int_counter!("weft_compute_jobs_completed", "Jobs completed")
                .expect("register jobs_completed"),
            jobs_failed: register_int_counter!(
                "weft_compute_jobs_failed",
                "Jobs that ended failed, timed out or cancelled"
            )
            .expect("register jobs_failed"),
            tasks_delegated: register_int_counter!(
                "weft_compute_tasks_delegated",
                "Tasks sent to remote workers"
            )
            .expect("register tasks_delegated"),
            tasks_local: register_int_counter!(
                "weft_compute_tasks_local",
                "Tasks executed in the local sandbox"
            )
            .expect("register tasks_local"),
            verification_failures: register_int_counter!(
                "weft_compute_verification_failures",
                "Results discarded by verification"
            )
            .expect("register verification_failures"),
            queue_depth: register_int_gauge!("weft_compute_queue_depth", "Tasks waiting to run")
                .expect("register queue_depth"),
            task_seconds: register_histogram!(
                "weft_compute_task_seconds",
                "Wall time of one task execution"
            )
            .expect("register task_seconds"),
        }
    }
}

pub static COMPUTE_METRICS: Lazy<ComputeMetrics> = Lazy::new(ComputeMetrics::new);
