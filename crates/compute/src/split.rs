//! Deterministic input splitting and order-preserving merge.

use crate::error::ComputeError;

/// Splits `input` into fixed-size chunks bounded by `[min_chunk, max_chunk]`
/// bytes. Chunks preserve byte order; the final chunk may be shorter than
/// `min_chunk` when the input does not divide evenly.
pub fn split(input: &[u8], min_chunk: usize, max_chunk: usize) -> Result<Vec<Vec<u8>>, ComputeError> {
    if min_chunk == 0 || min_chunk > max_chunk {
        return Err(ComputeError::InvalidChunkBounds {
            min: min_chunk,
            max: max_chunk,
        });
    }
    if input.is_empty() {
        return Ok(Vec::new());
    }
    let chunk_size = input.len().clamp(min_chunk, max_chunk);
    Ok(input.chunks(chunk_size).map(|c| c.to_vec()).collect())
}

/// Concatenates chunk results by index. Inverse of [`split`].
pub fn merge(chunks: &[Vec<u8>]) -> Vec<u8> {
    let total = chunks.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn small_input_is_one_chunk() {
        let chunks = split(b"tiny", 16, 1024).unwrap();
        assert_eq!(chunks, vec![b"tiny".to_vec()]);
    }

    #[test]
    fn chunks_are_bounded_by_max() {
        let input = vec![7u8; 10_000];
        let chunks = split(&input, 256, 4_096).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 4_096));
        assert_eq!(merge(&chunks), input);
    }

    #[test]
    fn invalid_bounds_rejected() {
        assert!(matches!(
            split(b"x", 0, 10),
            Err(ComputeError::InvalidChunkBounds { .. })
        ));
        assert!(matches!(
            split(b"x", 10, 5),
            Err(ComputeError::InvalidChunkBounds { .. })
        ));
    }

    proptest! {
        #[test]
        fn merge_inverts_split(
            input in proptest::collection::vec(any::<u8>(), 0..20_000),
            min in 1usize..512,
            extra in 0usize..4_096,
        ) {
            let max = min + extra;
            let chunks = split(&input, min, max).unwrap();
            prop_assert_eq!(merge(&chunks), input);
        }
    }
}
