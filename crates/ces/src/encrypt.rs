use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Key, XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CesError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Pipeline encryption key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        CipherKey(bytes)
    }

    /// Draws a random key. Two pipelines built this way cannot decrypt each
    /// other's output; cross-process use requires an explicit key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        CipherKey(bytes)
    }

    fn as_key(&self) -> &Key {
        Key::from_slice(&self.0)
    }
}

/// Encrypts `plaintext`, returning the fresh nonce and the ciphertext
/// (which carries the 16-byte Poly1305 tag).
pub fn seal(key: &CipherKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CesError> {
    let cipher = XChaCha20Poly1305::new(key.as_key());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CesError::EncryptionFailed)?;
    Ok((nonce.into(), ciphertext))
}

/// Inverse of [`seal`]. Tag verification happens inside the cipher and is
/// constant-time; any mismatch surfaces as `AeadVerificationFailed`.
pub fn open(key: &CipherKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CesError> {
    let cipher = XChaCha20Poly1305::new(key.as_key());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CesError::AeadVerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = CipherKey::random();
        let (nonce, ct) = seal(&key, b"weft payload").unwrap();
        assert_eq!(open(&key, &nonce, &ct).unwrap(), b"weft payload");
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = CipherKey::random();
        let (n1, _) = seal(&key, b"x").unwrap();
        let (n2, _) = seal(&key, b"x").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn tampered_ciphertext_fails_verification() {
        let key = CipherKey::random();
        let (nonce, mut ct) = seal(&key, b"integrity").unwrap();
        ct[0] ^= 0x01;
        assert_eq!(open(&key, &nonce, &ct), Err(CesError::AeadVerificationFailed));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (nonce, ct) = seal(&CipherKey::random(), b"secret").unwrap();
        assert_eq!(
            open(&CipherKey::random(), &nonce, &ct),
            Err(CesError::AeadVerificationFailed)
        );
    }
}
