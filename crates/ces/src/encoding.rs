//! Systematic Reed-Solomon sharding over GF(2^8).

use reed_solomon_erasure::galois_8::ReedSolomon;
use weft_types::Shard;

use crate::error::CesError;

/// Splits `payload` into `k` data shards plus `m` parity shards of uniform
/// size `ceil(len / k)`; the last data shard is zero-padded.
pub fn encode(payload: &[u8], data_shards: usize, parity_shards: usize) -> Result<Vec<Shard>, CesError> {
    let shard_size = payload.len().div_ceil(data_shards).max(1);

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(data_shards + parity_shards);
    for i in 0..data_shards {
        let start = (i * shard_size).min(payload.len());
        let end = (start + shard_size).min(payload.len());
        let mut chunk = vec![0u8; shard_size];
        chunk[..end - start].copy_from_slice(&payload[start..end]);
        shards.push(chunk);
    }
    for _ in 0..parity_shards {
        shards.push(vec![0u8; shard_size]);
    }

    let rs = ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| CesError::ShardingFailed(format!("{e:?}")))?;
    rs.encode(&mut shards)
        .map_err(|e| CesError::ShardingFailed(format!("{e:?}")))?;

    Ok(shards
        .into_iter()
        .enumerate()
        .map(|(i, data)| Shard::new(i as u32, data))
        .collect())
}

/// Rebuilds the first `k * shard_size` payload bytes from any `k` present
/// shards. `present[i]` marks whether `shards[i]` holds real data.
pub fn decode(
    shards: &[Shard],
    present: &[bool],
    data_shards: usize,
    parity_shards: usize,
) -> Result<Vec<u8>, CesError> {
    let total = data_shards + parity_shards;
    if shards.len() != total || present.len() != total {
        return Err(CesError::ShardingFailed(format!(
            "expected {total} shard slots, got {}/{}",
            shards.len(),
            present.len()
        )));
    }

    let available = present.iter().filter(|&&p| p).count();
    if available < data_shards {
        return Err(CesError::InsufficientShards {
            present: available,
            needed: data_shards,
        });
    }

    let mut slots: Vec<Option<Vec<u8>>> = shards
        .iter()
        .zip(present)
        .map(|(shard, &p)| p.then(|| shard.data.clone()))
        .collect();

    let rs = ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| CesError::ShardingFailed(format!("{e:?}")))?;
    rs.reconstruct(&mut slots)
        .map_err(|e| CesError::ShardingFailed(format!("{e:?}")))?;

    let mut out = Vec::with_capacity(data_shards * slots[0].as_ref().map_or(0, |s| s.len()));
    for slot in slots.into_iter().take(data_shards) {
        let chunk = slot.ok_or_else(|| CesError::ShardingFailed("reconstruction hole".into()))?;
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
