use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;
use weft_types::{NodeRecord, NodeStatus, ShortId};

use crate::ewma::Ewma;

/// EWMA smoothing factor for latency and jitter.
const HEALTH_ALPHA: f64 = 0.1;

struct Entry {
    record: NodeRecord,
    latency: Ewma,
    jitter: Ewma,
}

/// Thread-safe registry of known peers, keyed by short id.
///
/// The outer map is read-locked for lookups; each record sits behind its own
/// mutex so updates for unrelated peers do not contend.
pub struct NodeStore {
    entries: RwLock<HashMap<ShortId, Arc<Mutex<Entry>>>>,
}

impl NodeStore {
    pub fn new() -> Self {
        NodeStore {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a peer on first contact. Returns the fresh record, or the
    /// existing one when the short id is already known.
    pub fn create(&self, peer_id: impl Into<String>, short_id: ShortId) -> NodeRecord {
        let mut entries = self.entries.write().expect("node store poisoned");
        let entry = entries.entry(short_id).or_insert_with(|| {
            Arc::new(Mutex::new(Entry {
                record: NodeRecord::new(peer_id, short_id),
                latency: Ewma::new(HEALTH_ALPHA),
                jitter: Ewma::new(HEALTH_ALPHA),
            }))
        });
        let record = entry.lock().expect("entry poisoned").record.clone();
        record
    }

    pub fn get(&self, short_id: ShortId) -> Option<NodeRecord> {
        let entry = self.entry(short_id)?;
        let guard = entry.lock().expect("entry poisoned");
        Some(guard.record.clone())
    }

    pub fn get_all(&self) -> Vec<NodeRecord> {
        let entries = self.entries.read().expect("node store poisoned");
        entries
            .values()
            .map(|e| e.lock().expect("entry poisoned").record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("node store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds a latency sample in; jitter tracks the EWMA of |Δlatency|.
    pub fn update_latency(&self, short_id: ShortId, latency_ms: f64) {
        if let Some(entry) = self.entry(short_id) {
            let mut guard = entry.lock().expect("entry poisoned");
            let prev = guard.record.latency_ms;
            if guard.record.last_seen > 0 && prev > 0.0 {
                guard.jitter.update((latency_ms - prev).abs());
            }
            guard.latency.update(latency_ms);
            guard.record.latency_ms = guard.latency.value();
            guard.record.jitter_ms = guard.jitter.value();
            guard.record.touch();
        }
    }

    pub fn update_packet_loss(&self, short_id: ShortId, loss: f64) {
        if let Some(entry) = self.entry(short_id) {
            let mut guard = entry.lock().expect("entry poisoned");
            guard.record.packet_loss = loss.clamp(0.0, 1.0);
            guard.record.touch();
        }
    }

    /// Applies the threat hysteresis rule; returns the resulting status.
    pub fn update_threat_score(&self, short_id: ShortId, score: f64) -> Option<NodeStatus> {
        let entry = self.entry(short_id)?;
        let mut guard = entry.lock().expect("entry poisoned");
        let status = guard.record.apply_threat(score);
        guard.record.touch();
        if status == NodeStatus::Purgatory {
            debug!(peer = %guard.record.short_id, score, "peer quarantined");
        }
        Some(status)
    }

    /// Drops records idle for at least `max_idle_secs`, unless `is_banned`
    /// says the peer must be remembered. Returns the number pruned.
    pub fn prune_idle(&self, max_idle_secs: u64, is_banned: impl Fn(&str) -> bool) -> usize {
        let now = weft_types::unix_now();
        let mut entries = self.entries.write().expect("node store poisoned");
        let before = entries.len();
        entries.retain(|_, entry| {
            let guard = entry.lock().expect("entry poisoned");
            now.saturating_sub(guard.record.last_seen) < max_idle_secs
                || is_banned(&guard.record.peer_id)
        });
        before - entries.len()
    }

    fn entry(&self, short_id: ShortId) -> Option<Arc<Mutex<Entry>>> {
        let entries = self.entries.read().expect("node store poisoned");
        entries.get(&short_id).cloned()
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}
