use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

pub struct CesMetrics {
    pub process_calls: IntCounter,
    pub reconstruct_calls: IntCounter,
    pub process_seconds: Histogram,
    pub bytes_processed: IntCounter,
}

impl CesMetrics {
    fn new() -> Self {
        CesMetrics {
            process_calls: register_int_counter!("weft_ces_process_calls", "Pipeline forward passes")
                .expect("register process_calls"),
            reconstruct_calls: register_int_counter!(
                "weft_ces_reconstruct_calls",
                "Pipeline inverse passes"
            )
            .expect("register reconstruct_calls"),
            process_seconds: register_histogram!(
                "weft_ces_process_seconds",
                "Wall time of one forward pass"
            )
            .expect("register process_seconds"),
            bytes_processed: register_int_counter!(
                "weft_ces_bytes_processed",
                "Input bytes accepted by the pipeline"
            )
            .expect("register bytes_processed"),
        }
    }
}

pub static CES_METRICS: Lazy<CesMetrics> = Lazy::new(CesMetrics::new);
