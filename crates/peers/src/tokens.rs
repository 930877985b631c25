use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Registry of authentication tokens, stored as SHA-256 digests only.
///
/// Raw tokens never enter the registry; verification hashes the presented
/// token and compares digests in constant time.
pub struct TokenRegistry {
    entries: Vec<([u8; 32], Instant)>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        TokenRegistry { entries: Vec::new() }
    }

    /// Registers `token`, valid for `ttl` from now.
    pub fn issue(&mut self, token: &str, ttl: Duration) {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let expiry = Instant::now() + ttl;
        // Re-issuing refreshes the expiry.
        if let Some(entry) = self.entries.iter_mut().find(|(d, _)| *d == digest) {
            entry.1 = expiry;
        } else {
            self.entries.push((digest, expiry));
        }
    }

    /// True iff the token's digest is registered and unexpired. Scans every
    /// entry with a constant-time digest comparison.
    pub fn verify(&self, token: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let now = Instant::now();
        let mut matched = false;
        for (stored, expiry) in &self.entries {
            let equal: bool = stored.ct_eq(&digest).into();
            matched |= equal && *expiry > now;
        }
        matched
    }

    pub fn revoke(&mut self, token: &str) {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        self.entries.retain(|(stored, _)| *stored != digest);
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|(_, expiry)| *expiry > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored digests, for tests asserting raw tokens never appear.
    #[cfg(test)]
    pub(crate) fn digests(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.entries.iter().map(|(d, _)| d)
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}
