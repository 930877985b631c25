//! Persistent node identity.
//!
//! The Ed25519 host keypair is stored protobuf-encoded next to the config
//! and reloaded on restart, so the peer id survives the process. The
//! session-handshake X25519 static key is persisted alongside as raw bytes.
//! Both files are written with owner-only permissions.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use libp2p::identity;
use x25519_dalek::StaticSecret;

const HOST_KEY_FILE: &str = "identity.key";
const SESSION_KEY_FILE: &str = "session.key";

/// Loads the host keypair, generating and persisting one on first start.
/// A corrupt key file is fatal; delete it deliberately to rotate identity.
pub fn load_or_generate_host_key(dir: &Path) -> Result<identity::Keypair> {
    let path = dir.join(HOST_KEY_FILE);
    if path.exists() {
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        return identity::Keypair::from_protobuf_encoding(&bytes)
            .with_context(|| format!("decode {}", path.display()));
    }

    let keypair = identity::Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .context("encode host keypair")?;
    write_secret(&path, &bytes)?;
    Ok(keypair)
}

/// Loads the 32-byte X25519 session static, generating one on first start.
pub fn load_or_generate_session_key(dir: &Path) -> Result<StaticSecret> {
    let path = dir.join(SESSION_KEY_FILE);
    if path.exists() {
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .with_context(|| format!("{} is not 32 bytes", path.display()))?;
        return Ok(StaticSecret::from(raw));
    }

    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    write_secret(&path, secret.as_bytes())?;
    Ok(secret)
}

fn write_secret(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_host_key(dir.path()).unwrap();
        let second = load_or_generate_host_key(dir.path()).unwrap();
        assert_eq!(
            first.public().to_peer_id(),
            second.public().to_peer_id()
        );
    }

    #[test]
    fn session_key_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_session_key(dir.path()).unwrap();
        let second = load_or_generate_session_key(dir.path()).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn corrupt_host_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HOST_KEY_FILE), b"garbage").unwrap();
        assert!(load_or_generate_host_key(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        load_or_generate_host_key(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(HOST_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
