//! Fixed header prepended to the cipher stream before sharding.
//!
//! The header travels in shard 0 and is the only metadata `reconstruct`
//! needs: the exact cipher length (to trim erasure padding), the nonce, and
//! whether the compression stage ran.

use crate::encrypt::NONCE_LEN;
use crate::error::CesError;

const MAGIC: [u8; 2] = *b"WF";
const VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Encoded size: magic(2) + version(1) + flags(1) + cipher_len(8) + nonce(24).
pub const HEADER_LEN: usize = 36;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardHeader {
    pub compressed: bool,
    pub cipher_len: u64,
    pub nonce: [u8; NONCE_LEN],
}

impl ShardHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..2].copy_from_slice(&MAGIC);
        out[2] = VERSION;
        out[3] = if self.compressed { FLAG_COMPRESSED } else { 0 };
        out[4..12].copy_from_slice(&self.cipher_len.to_be_bytes());
        out[12..36].copy_from_slice(&self.nonce);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CesError> {
        if bytes.len() < HEADER_LEN {
            return Err(CesError::InvalidShardHeader("truncated"));
        }
        if bytes[..2] != MAGIC {
            return Err(CesError::InvalidShardHeader("bad magic"));
        }
        if bytes[2] != VERSION {
            return Err(CesError::InvalidShardHeader("unsupported version"));
        }
        if bytes[3] & !FLAG_COMPRESSED != 0 {
            return Err(CesError::InvalidShardHeader("unknown flags"));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[4..12]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[12..36]);
        Ok(ShardHeader {
            compressed: bytes[3] & FLAG_COMPRESSED != 0,
            cipher_len: u64::from_be_bytes(len_bytes),
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let hdr = ShardHeader {
            compressed: true,
            cipher_len: 0xDEAD_BEEF,
            nonce: [0x42; NONCE_LEN],
        };
        let decoded = ShardHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = ShardHeader {
            compressed: false,
            cipher_len: 1,
            nonce: [0; NONCE_LEN],
        }
        .encode();
        bytes[0] = b'X';
        assert_eq!(
            ShardHeader::decode(&bytes),
            Err(CesError::InvalidShardHeader("bad magic"))
        );
    }

    #[test]
    fn rejects_truncated_and_unknown_flags() {
        assert!(matches!(
            ShardHeader::decode(&[0u8; 10]),
            Err(CesError::InvalidShardHeader("truncated"))
        ));
        let mut bytes = ShardHeader {
            compressed: false,
            cipher_len: 1,
            nonce: [0; NONCE_LEN],
        }
        .encode();
        bytes[3] = 0b1000_0000;
        assert_eq!(
            ShardHeader::decode(&bytes),
            Err(CesError::InvalidShardHeader("unknown flags"))
        );
    }
}
