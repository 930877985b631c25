//! Local shard and share storage backing the rpc server side.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{MAX_SHARD_BYTES, MAX_SHARE_BYTES};

/// A threshold share held for a file id, with provenance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareRecord {
    pub from_peer: u32,
    pub bytes: Vec<u8>,
}

/// In-memory store for shards (keyed by file hash and index) and threshold
/// shares (keyed by file id). Shards are immutable: the first write wins.
pub struct BlobStore {
    shards: RwLock<HashMap<(Vec<u8>, u32), Vec<u8>>>,
    shares: RwLock<HashMap<Vec<u8>, Vec<ShareRecord>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        BlobStore {
            shards: RwLock::new(HashMap::new()),
            shares: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a shard; rejects oversized payloads. Re-storing the same
    /// `(hash, index)` is a no-op.
    pub fn put_shard(&self, file_hash: &[u8], index: u32, bytes: Vec<u8>) -> Result<(), usize> {
        if bytes.len() > MAX_SHARD_BYTES {
            return Err(bytes.len());
        }
        self.shards
            .write()
            .expect("blob store poisoned")
            .entry((file_hash.to_vec(), index))
            .or_insert(bytes);
        Ok(())
    }

    pub fn get_shard(&self, file_hash: &[u8], index: u32) -> Option<Vec<u8>> {
        self.shards
            .read()
            .expect("blob store poisoned")
            .get(&(file_hash.to_vec(), index))
            .cloned()
    }

    pub fn put_share(&self, file_id: &[u8], from_peer: u32, bytes: Vec<u8>) -> Result<(), usize> {
        if bytes.len() > MAX_SHARE_BYTES {
            return Err(bytes.len());
        }
        self.shares
            .write()
            .expect("blob store poisoned")
            .entry(file_id.to_vec())
            .or_default()
            .push(ShareRecord { from_peer, bytes });
        Ok(())
    }

    /// Latest share held for the file id, if any.
    pub fn get_share(&self, file_id: &[u8]) -> Option<Vec<u8>> {
        self.shares
            .read()
            .expect("blob store poisoned")
            .get(file_id)
            .and_then(|records| records.last())
            .map(|record| record.bytes.clone())
    }

    pub fn shares_for(&self, file_id: &[u8]) -> Vec<ShareRecord> {
        self.shares
            .read()
            .expect("blob store poisoned")
            .get(file_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().expect("blob store poisoned").len()
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new()
    }
}
