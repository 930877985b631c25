use serde::{Deserialize, Serialize};

use crate::ids::ShortId;
use crate::unix_now;

/// Health state of a known peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Peer is usable for placement and delegation.
    Active,
    /// Threat score crossed the upper threshold; peer is quarantined until
    /// the score decays below the lower threshold.
    Purgatory,
    /// Peer is considered gone; record retained for history only.
    Dead,
}

/// Upper threat threshold; crossing it moves a peer into purgatory.
pub const THREAT_PURGATORY: f64 = 0.8;
/// Lower threat threshold; dropping below it restores a peer to active.
pub const THREAT_RECOVER: f64 = 0.3;

/// Per-peer health record maintained by the node store.
///
/// The node store is the sole writer; every other component reads. Latency
/// and jitter are EWMAs, threat follows an explicit hysteresis rule so a
/// peer oscillating around a single threshold does not flap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Canonical peer identifier string (hash of the peer's public key).
    pub peer_id: String,
    /// Process-local alias used on the rpc wire.
    pub short_id: ShortId,
    pub status: NodeStatus,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    /// Observed packet loss, clamped to [0, 1].
    pub packet_loss: f64,
    /// Behavioural threat score, clamped to [0, 1].
    pub threat_score: f64,
    /// Unix seconds of the last observation.
    pub last_seen: u64,
}

impl NodeRecord {
    pub fn new(peer_id: impl Into<String>, short_id: ShortId) -> Self {
        NodeRecord {
            peer_id: peer_id.into(),
            short_id,
            status: NodeStatus::Active,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss: 0.0,
            threat_score: 0.0,
            last_seen: unix_now(),
        }
    }

    /// Applies the threat hysteresis rule and returns the resulting status.
    pub fn apply_threat(&mut self, score: f64) -> NodeStatus {
        self.threat_score = score.clamp(0.0, 1.0);
        if self.threat_score > THREAT_PURGATORY {
            self.status = NodeStatus::Purgatory;
        } else if self.threat_score < THREAT_RECOVER {
            self.status = NodeStatus::Active;
        }
        // Between the thresholds the previous status sticks.
        self.status
    }

    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_hysteresis() {
        let mut rec = NodeRecord::new("12D3KooWTest", ShortId(1));
        assert_eq!(rec.apply_threat(0.85), NodeStatus::Purgatory);
        // Mid-band keeps the previous state.
        assert_eq!(rec.apply_threat(0.5), NodeStatus::Purgatory);
        assert_eq!(rec.apply_threat(0.25), NodeStatus::Active);
        assert_eq!(rec.apply_threat(0.5), NodeStatus::Active);
    }

    #[test]
    fn threat_is_clamped() {
        let mut rec = NodeRecord::new("12D3KooWTest", ShortId(2));
        rec.apply_threat(7.0);
        assert_eq!(rec.threat_score, 1.0);
        rec.apply_threat(-3.0);
        assert_eq!(rec.threat_score, 0.0);
    }
}
