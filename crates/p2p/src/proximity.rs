//! RTT-based upload-target selection.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// RTT below which a peer scores a full 1.0.
const RTT_FLOOR_MS: f64 = 10.0;
/// RTT at or beyond which a peer scores the 0.1 floor.
const RTT_CEIL_MS: f64 = 500.0;

#[derive(Clone, Copy, Debug)]
struct RttEntry {
    rtt_ms: f64,
    last_update: Instant,
    score: f64,
}

/// Scores peers by measured round-trip time.
///
/// The score is piecewise linear: 1.0 under 10 ms, decaying to 0.1 at
/// 500 ms and flat beyond. Entries older than the staleness window are
/// ignored by selection but kept for history.
pub struct RttTable {
    entries: RwLock<HashMap<String, RttEntry>>,
    staleness: Duration,
}

impl RttTable {
    pub fn new(staleness: Duration) -> Self {
        RttTable {
            entries: RwLock::new(HashMap::new()),
            staleness,
        }
    }

    pub fn update(&self, peer_id: &str, rtt: Duration) {
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        let entry = RttEntry {
            rtt_ms,
            last_update: Instant::now(),
            score: score_rtt(rtt_ms),
        };
        self.entries
            .write()
            .expect("rtt table poisoned")
            .insert(peer_id.to_string(), entry);
    }

    pub fn score(&self, peer_id: &str) -> Option<f64> {
        self.entries
            .read()
            .expect("rtt table poisoned")
            .get(peer_id)
            .map(|e| e.score)
    }

    pub fn rtt_ms(&self, peer_id: &str) -> Option<f64> {
        self.entries
            .read()
            .expect("rtt table poisoned")
            .get(peer_id)
            .map(|e| e.rtt_ms)
    }

    /// Top-`n` peers by score. A `stride` greater than one spreads the
    /// selection across the ranked candidates so placements cluster less
    /// when candidates are plentiful; it degrades to plain top-`n` when
    /// there are not enough fresh entries.
    pub fn upload_targets(&self, n: usize, stride: usize) -> Vec<String> {
        let now = Instant::now();
        let mut ranked: Vec<(String, f64)> = self
            .entries
            .read()
            .expect("rtt table poisoned")
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_update) < self.staleness)
            .map(|(peer, e)| (peer.clone(), e.score))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let stride = stride.max(1);
        if ranked.len() >= n * stride {
            ranked
                .into_iter()
                .step_by(stride)
                .take(n)
                .map(|(peer, _)| peer)
                .collect()
        } else {
            ranked.into_iter().take(n).map(|(peer, _)| peer).collect()
        }
    }
}

fn score_rtt(rtt_ms: f64) -> f64 {
    if rtt_ms < RTT_FLOOR_MS {
        1.0
    } else if rtt_ms >= RTT_CEIL_MS {
        0.1
    } else {
        1.0 - 0.9 * (rtt_ms - RTT_FLOOR_MS) / (RTT_CEIL_MS - RTT_FLOOR_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_piecewise_linear() {
        assert_eq!(score_rtt(5.0), 1.0);
        assert_eq!(score_rtt(500.0), 0.1);
        assert_eq!(score_rtt(900.0), 0.1);
        let mid = score_rtt(255.0);
        assert!(mid > 0.5 && mid < 0.6);
    }

    #[test]
    fn targets_ranked_by_score() {
        let table = RttTable::new(Duration::from_secs(60));
        table.update("fast", Duration::from_millis(5));
        table.update("medium", Duration::from_millis(120));
        table.update("slow", Duration::from_millis(600));

        let targets = table.upload_targets(2, 1);
        assert_eq!(targets, vec!["fast".to_string(), "medium".to_string()]);
    }

    #[test]
    fn stride_spreads_when_plentiful() {
        let table = RttTable::new(Duration::from_secs(60));
        for (i, rtt) in [5u64, 20, 40, 80, 160, 320].iter().enumerate() {
            table.update(&format!("p{i}"), Duration::from_millis(*rtt));
        }
        let spread = table.upload_targets(3, 2);
        assert_eq!(spread, vec!["p0".to_string(), "p2".to_string(), "p4".to_string()]);
        // Not enough candidates for the stride: degrade to top-n.
        let plain = table.upload_targets(4, 2);
        assert_eq!(plain.len(), 4);
        assert_eq!(plain[0], "p0");
    }
}
