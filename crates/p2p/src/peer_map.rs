use std::collections::HashMap;
use std::sync::RwLock;

use weft_types::ShortId;

/// Bidirectional registry mapping long peer-id strings to 32-bit aliases.
///
/// `intern` allocates the next id on first sight; `insert` records an alias
/// a peer announced for itself during the session handshake. Both directions
/// stay consistent for the process lifetime; an interned id is never reused.
pub struct PeerRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    forward: HashMap<String, ShortId>,
    reverse: HashMap<ShortId, String>,
    next: u32,
}

impl PeerRegistry {
    /// `first_id` seeds the allocator; id 0 is reserved for "self".
    pub fn new() -> Self {
        PeerRegistry {
            inner: RwLock::new(Inner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Returns the alias for `peer_id`, allocating the next one on first
    /// sight.
    pub fn intern(&self, peer_id: &str) -> ShortId {
        if let Some(id) = self.lookup_peer(peer_id) {
            return id;
        }
        let mut inner = self.inner.write().expect("peer registry poisoned");
        if let Some(id) = inner.forward.get(peer_id) {
            return *id;
        }
        let mut id = ShortId(inner.next);
        // Skip aliases already claimed through `insert`.
        while inner.reverse.contains_key(&id) {
            inner.next = inner.next.wrapping_add(1).max(1);
            id = ShortId(inner.next);
        }
        inner.next = inner.next.wrapping_add(1).max(1);
        inner.forward.insert(peer_id.to_string(), id);
        inner.reverse.insert(id, peer_id.to_string());
        id
    }

    /// Records an announced alias. A peer already mapped keeps its existing
    /// alias (stability wins over the announcement); an alias already taken
    /// by another peer falls back to allocation.
    pub fn insert(&self, peer_id: &str, announced: ShortId) -> ShortId {
        {
            let inner = self.inner.read().expect("peer registry poisoned");
            if let Some(existing) = inner.forward.get(peer_id) {
                return *existing;
            }
            if inner.reverse.contains_key(&announced) {
                drop(inner);
                return self.intern(peer_id);
            }
        }
        let mut inner = self.inner.write().expect("peer registry poisoned");
        if let Some(existing) = inner.forward.get(peer_id) {
            return *existing;
        }
        if inner.reverse.contains_key(&announced) {
            drop(inner);
            return self.intern(peer_id);
        }
        inner.forward.insert(peer_id.to_string(), announced);
        inner.reverse.insert(announced, peer_id.to_string());
        announced
    }

    pub fn lookup(&self, short_id: ShortId) -> Option<String> {
        self.inner
            .read()
            .expect("peer registry poisoned")
            .reverse
            .get(&short_id)
            .cloned()
    }

    pub fn lookup_peer(&self, peer_id: &str) -> Option<ShortId> {
        self.inner
            .read()
            .expect("peer registry poisoned")
            .forward
            .get(peer_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("peer registry poisoned").forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
