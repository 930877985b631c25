//! Compress/Encrypt/Shard pipeline.
//!
//! `process` turns an opaque payload into `n = k + m` erasure-coded shards;
//! `reconstruct` inverts it from any `k` of them. Compression is skipped for
//! payloads whose leading bytes identify an already-compressed container.
//! Encryption is XChaCha20-Poly1305 with a fresh 24-byte nonce per call; the
//! key is either supplied by the caller (the production contract) or drawn at
//! construction time for single-instance use.

pub mod compress;
pub mod detect;
pub mod encoding;
pub mod encrypt;
pub mod error;
pub mod header;
pub mod pipeline;

pub use error::CesError;
pub use pipeline::{Pipeline, PipelineConfig};

/// Hard cap on input bytes accepted per `process` call (1 GiB).
pub const MAX_INPUT_BYTES: usize = 1 << 30;

/// Hard cap on the total shard count (`k + m`).
pub const MAX_SHARD_COUNT: usize = 1000;
