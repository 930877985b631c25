use crate::error::CesError;

/// Default zstd level; 3 is the library's balanced default.
pub const DEFAULT_LEVEL: i32 = 3;

/// Compresses `data` with zstd at the given level.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CesError> {
    zstd::stream::encode_all(data, level).map_err(|e| CesError::CompressionFailed(e.to_string()))
}

/// Inverse of [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CesError> {
    zstd::stream::decode_all(data).map_err(|e| CesError::CompressionFailed(e.to_string()))
}
