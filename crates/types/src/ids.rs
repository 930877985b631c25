use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte content address, computed with BLAKE3 over the raw payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub const fn zero() -> Self {
        ContentHash([0u8; 32])
    }

    /// Hashes `data` into a content address.
    pub fn digest(data: &[u8]) -> Self {
        ContentHash(*blake3::hash(data).as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != 32 {
            return Err("invalid length");
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(ContentHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // short form for logs
        write!(f, "0x{}", hex::encode(&self.0[..8]))
    }
}

/// Process-local 32-bit alias for a long peer identifier string.
///
/// Allocated monotonically by the p2p layer's interning registry; stable and
/// unique for the process lifetime, never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortId(pub u32);

impl ShortId {
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        ShortId(u32::from_be_bytes(bytes))
    }
}

impl fmt::Debug for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        let a = ContentHash::digest(b"weft");
        let b = ContentHash::digest(b"weft");
        assert_eq!(a, b);
        assert_ne!(a, ContentHash::digest(b"warp"));
    }

    #[test]
    fn content_hash_rejects_bad_length() {
        assert!(ContentHash::from_slice(&[0u8; 31]).is_err());
        assert!(ContentHash::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn short_id_round_trips_big_endian() {
        let id = ShortId(0x0102_0304);
        assert_eq!(id.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(ShortId::from_be_bytes([1, 2, 3, 4]), id);
    }
}
