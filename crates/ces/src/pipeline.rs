use tracing::debug;
use weft_types::Shard;

use crate::compress;
use crate::detect;
use crate::encoding;
use crate::encrypt::{self, CipherKey, KEY_LEN};
use crate::error::CesError;
use crate::header::{ShardHeader, HEADER_LEN};
use crate::{MAX_INPUT_BYTES, MAX_SHARD_COUNT};

/// Erasure-coding geometry and compression level.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Data shards (k). Any k of the n = k + m shards reconstruct.
    pub data_shards: usize,
    /// Parity shards (m).
    pub parity_shards: usize,
    /// zstd level for the compression stage.
    pub compression_level: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data_shards: 8,
            parity_shards: 4,
            compression_level: compress::DEFAULT_LEVEL,
        }
    }
}

/// The Compress/Encrypt/Shard pipeline.
///
/// A pipeline is a plain value: construct one per upload/download flow and
/// pass it explicitly. The key is part of the value, so two pipelines built
/// with the same explicit key interoperate across processes; an ephemeral
/// pipeline only round-trips with itself.
pub struct Pipeline {
    key: CipherKey,
    config: PipelineConfig,
}

impl Pipeline {
    /// Production constructor: the 32-byte key is supplied by the caller.
    pub fn with_key(key: [u8; KEY_LEN], config: PipelineConfig) -> Result<Self, CesError> {
        Self::validate(&config)?;
        Ok(Pipeline {
            key: CipherKey::from_bytes(key),
            config,
        })
    }

    /// Draws a random key at construction. `process` and `reconstruct` must
    /// then happen on this same instance; useful for tests and single-process
    /// flows only.
    pub fn ephemeral(config: PipelineConfig) -> Result<Self, CesError> {
        Self::validate(&config)?;
        Ok(Pipeline {
            key: CipherKey::random(),
            config,
        })
    }

    fn validate(config: &PipelineConfig) -> Result<(), CesError> {
        let total = config.data_shards + config.parity_shards;
        if config.data_shards == 0 || config.parity_shards == 0 || total > MAX_SHARD_COUNT {
            return Err(CesError::TooManyShards {
                requested: total,
                limit: MAX_SHARD_COUNT,
            });
        }
        Ok(())
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Total shards emitted per `process` call.
    pub fn total_shards(&self) -> usize {
        self.config.data_shards + self.config.parity_shards
    }

    /// Transforms `data` into `n = k + m` shards: compress (unless the
    /// payload is already a compressed container), AEAD-encrypt with a fresh
    /// nonce, then Reed-Solomon encode. Any `k` of the returned shards
    /// reconstruct `data` exactly.
    pub fn process(&self, data: &[u8]) -> Result<Vec<Shard>, CesError> {
        if data.is_empty() {
            return Err(CesError::EmptyInput);
        }
        if data.len() > MAX_INPUT_BYTES {
            return Err(CesError::InputTooLarge { limit: MAX_INPUT_BYTES });
        }

        let compressed = !detect::should_skip_compression(data);
        let body = if compressed {
            compress::compress(data, self.config.compression_level)?
        } else {
            data.to_vec()
        };
        debug!(
            input = data.len(),
            staged = body.len(),
            compressed,
            "ces forward pass"
        );

        let (nonce, cipher) = encrypt::seal(&self.key, &body)?;
        let header = ShardHeader {
            compressed,
            cipher_len: cipher.len() as u64,
            nonce,
        };

        let mut payload = Vec::with_capacity(HEADER_LEN + cipher.len());
        payload.extend_from_slice(&header.encode());
        payload.extend_from_slice(&cipher);

        encoding::encode(&payload, self.config.data_shards, self.config.parity_shards)
    }

    /// Inverse of [`Pipeline::process`]. `present[i]` marks whether
    /// `shards[i]` holds real bytes; succeeds iff at least `k` are present.
    pub fn reconstruct(&self, shards: &[Shard], present: &[bool]) -> Result<Vec<u8>, CesError> {
        let payload = encoding::decode(
            shards,
            present,
            self.config.data_shards,
            self.config.parity_shards,
        )?;

        let header = ShardHeader::decode(&payload)?;
        let cipher_end = HEADER_LEN
            .checked_add(header.cipher_len as usize)
            .ok_or(CesError::InvalidShardHeader("length overflow"))?;
        if cipher_end > payload.len() {
            return Err(CesError::InvalidShardHeader("length out of range"));
        }

        let body = encrypt::open(&self.key, &header.nonce, &payload[HEADER_LEN..cipher_end])?;
        if header.compressed {
            compress::decompress(&body)
        } else {
            Ok(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_present(n: usize) -> Vec<bool> {
        vec![true; n]
    }

    #[test]
    fn process_rejects_empty_input() {
        let p = Pipeline::ephemeral(PipelineConfig::default()).unwrap();
        assert_eq!(p.process(&[]), Err(CesError::EmptyInput));
    }

    #[test]
    fn single_byte_round_trip() {
        let p = Pipeline::ephemeral(PipelineConfig::default()).unwrap();
        let shards = p.process(&[0xAB]).unwrap();
        assert_eq!(shards.len(), 12);
        assert_eq!(p.reconstruct(&shards, &all_present(12)).unwrap(), vec![0xAB]);
    }

    #[test]
    fn shard_count_limits() {
        let ok = PipelineConfig {
            data_shards: 996,
            parity_shards: 4,
            ..Default::default()
        };
        assert!(Pipeline::ephemeral(ok).is_ok());

        let too_many = PipelineConfig {
            data_shards: 997,
            parity_shards: 4,
            ..Default::default()
        };
        assert!(matches!(
            Pipeline::ephemeral(too_many),
            Err(CesError::TooManyShards { requested: 1001, .. })
        ));
    }

    #[test]
    fn explicit_key_pipelines_interoperate() {
        let key = [7u8; KEY_LEN];
        let sender = Pipeline::with_key(key, PipelineConfig::default()).unwrap();
        let receiver = Pipeline::with_key(key, PipelineConfig::default()).unwrap();

        let data = b"cross-process payload".to_vec();
        let shards = sender.process(&data).unwrap();
        assert_eq!(receiver.reconstruct(&shards, &all_present(12)).unwrap(), data);
    }

    #[test]
    fn ephemeral_pipelines_do_not_interoperate() {
        let a = Pipeline::ephemeral(PipelineConfig::default()).unwrap();
        let b = Pipeline::ephemeral(PipelineConfig::default()).unwrap();
        let shards = a.process(b"sealed to instance a").unwrap();
        assert_eq!(
            b.reconstruct(&shards, &vec![true; 12]),
            Err(CesError::AeadVerificationFailed)
        );
    }

    #[test]
    fn compressed_container_skips_compression_stage() {
        let p = Pipeline::ephemeral(PipelineConfig::default()).unwrap();
        // gzip magic; payload otherwise compressible
        let mut data = vec![0x1F, 0x8B, 0x08];
        data.extend(std::iter::repeat(b'a').take(4000));
        let shards = p.process(&data).unwrap();
        assert_eq!(p.reconstruct(&shards, &all_present(12)).unwrap(), data);
    }
}
