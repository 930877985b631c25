//! Minimal HTTP text exporter for the default registry.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use prometheus::{Encoder, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serves the Prometheus text format on every request to `addr`.
///
/// The endpoint speaks just enough HTTP for a scraper; the request itself is
/// not parsed.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("metrics exporter bind {addr}"))?;
    info!(%addr, "metrics exporter listening");

    loop {
        let (mut socket, _) = listener.accept().await.context("metrics accept")?;
        tokio::spawn(async move {
            let body = render();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            if let Err(err) = socket.write_all(response.as_bytes()).await {
                warn!(%err, "metrics response write failed");
            }
        });
    }
}

/// Encodes every registered metric family to the text format.
pub fn render() -> String {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        warn!(%err, "metrics encode failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_registered_families() {
        crate::P2P_METRICS.dials_attempted.inc();
        crate::COMPUTE_METRICS.jobs_submitted.inc();
        let body = render();
        assert!(body.contains("weft_p2p_dials_attempted"));
        assert!(body.contains("weft_compute_jobs_submitted"));
    }
}
