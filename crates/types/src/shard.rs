use serde::{Deserialize, Serialize};

use crate::ids::{ContentHash, ShortId};

/// One immutable erasure-coded fragment of a processed payload.
///
/// A shard set of `n = k + m` shards tolerates the loss of any `m`;
/// reconstruction needs any `k`. Shards carry their index so the set can be
/// reassembled in any arrival order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub index: u32,
    pub data: Vec<u8>,
}

impl Shard {
    pub fn new(index: u32, data: Vec<u8>) -> Self {
        Shard { index, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Locator record linking a content hash to its shard placements.
///
/// The manifest is the sole artifact needed to download a file; the CES
/// pipeline treats it as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub file_hash: ContentHash,
    pub file_size: u64,
    /// Number of data shards (k).
    pub shard_count: u32,
    /// Number of parity shards (m).
    pub parity_count: u32,
    /// `(shard_index, peer_short_id)` placement tuples. Order is not
    /// meaningful; the shard index defines reconstruction order.
    pub shard_locations: Vec<(u32, ShortId)>,
    /// Unix seconds at creation.
    pub timestamp: u64,
    /// Seconds the placements are considered fresh.
    pub ttl: u64,
}

impl Manifest {
    /// Total shards in the set.
    pub fn total_shards(&self) -> u32 {
        self.shard_count + self.parity_count
    }

    /// Peers holding a given shard index.
    pub fn holders(&self, index: u32) -> impl Iterator<Item = ShortId> + '_ {
        self.shard_locations
            .iter()
            .filter(move |(i, _)| *i == index)
            .map(|(_, peer)| *peer)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            file_hash: ContentHash::digest(b"payload"),
            file_size: 7,
            shard_count: 8,
            parity_count: 4,
            shard_locations: vec![(0, ShortId(1)), (0, ShortId(2)), (5, ShortId(3))],
            timestamp: 1_000,
            ttl: 60,
        }
    }

    #[test]
    fn holders_filters_by_index() {
        let m = manifest();
        let holders: Vec<_> = m.holders(0).collect();
        assert_eq!(holders, vec![ShortId(1), ShortId(2)]);
        assert_eq!(m.holders(7).count(), 0);
    }

    #[test]
    fn expiry_uses_ttl_window() {
        let m = manifest();
        assert!(!m.is_expired(1_050));
        assert!(m.is_expired(1_061));
    }

    #[test]
    fn total_shards_sums_data_and_parity() {
        assert_eq!(manifest().total_shards(), 12);
    }
}
