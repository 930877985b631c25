use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

pub struct P2pMetrics {
    pub connected_peers: IntGauge,
    pub dials_attempted: IntCounter,
    pub dials_failed: IntCounter,
    pub rpc_served: IntCounter,
    pub rpc_refused: IntCounter,
    pub handshakes_completed: IntCounter,
    pub ping_rtt_seconds: Histogram,
    /// Estimate scaled from connected-peer count, not a measurement.
    pub bandwidth_mbps_estimate: IntGauge,
}

impl P2pMetrics {
    fn new() -> Self {
        P2pMetrics {
            connected_peers: register_int_gauge!(
                "weft_p2p_connected_peers",
                "Currently connected peers"
            )
            .expect("register connected_peers"),
            dials_attempted: register_int_counter!(
                "weft_p2p_dials_attempted",
                "Outbound dial attempts"
            )
            .expect("register dials_attempted"),
            dials_failed: register_int_counter!("weft_p2p_dials_failed", "Outbound dial failures")
                .expect("register dials_failed"),
            rpc_served: register_int_counter!("weft_p2p_rpc_served", "Inbound rpc requests served")
                .expect("register rpc_served"),
            rpc_refused: register_int_counter!(
                "weft_p2p_rpc_refused",
                "Inbound rpc requests refused by the guard"
            )
            .expect("register rpc_refused"),
            handshakes_completed: register_int_counter!(
                "weft_p2p_handshakes_completed",
                "Session handshakes completed"
            )
            .expect("register handshakes_completed"),
            ping_rtt_seconds: register_histogram!(
                "weft_p2p_ping_rtt_seconds",
                "Round-trip time measured by the 5s ping"
            )
            .expect("register ping_rtt_seconds"),
            bandwidth_mbps_estimate: register_int_gauge!(
                "weft_p2p_bandwidth_mbps_estimate",
                "Estimated available bandwidth (heuristic, scaled by peer count)"
            )
            .expect("register bandwidth_estimate"),
        }
    }
}

pub static P2P_METRICS: Lazy<P2pMetrics> = Lazy::new(P2pMetrics::new);
