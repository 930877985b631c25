//! Magic-byte sniffing for already-compressed containers.
//!
//! Compressing a zip or a jpeg again wastes cycles for no ratio, so the
//! pipeline skips its compression stage when the payload's leading bytes
//! identify a compressed format. A short entropy heuristic over the tail
//! catches high-entropy blobs that carry no recognizable magic.

/// Container formats whose payloads are already compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Zip,
    Gzip,
    Zstd,
    Brotli,
    Png,
    Jpeg,
    Mp4,
    /// No compressed-container signature found.
    Unknown,
}

impl FileKind {
    pub fn is_compressed(self) -> bool {
        self != FileKind::Unknown
    }
}

/// Bytes inspected by the tail entropy heuristic.
const ENTROPY_TAIL: usize = 4096;
/// Shannon entropy (bits/byte) above which a payload is treated as
/// incompressible even without a known signature.
const ENTROPY_SKIP_THRESHOLD: f64 = 7.8;

/// Identifies the payload's container format from its leading bytes.
pub fn sniff(data: &[u8]) -> FileKind {
    if data.len() >= 4 {
        match &data[..4] {
            [0x50, 0x4B, 0x03, 0x04] | [0x50, 0x4B, 0x05, 0x06] => return FileKind::Zip,
            [0x28, 0xB5, 0x2F, 0xFD] => return FileKind::Zstd,
            [0x89, 0x50, 0x4E, 0x47] => return FileKind::Png,
            _ => {}
        }
        // ISO-BMFF: size(4) then "ftyp"
        if data.len() >= 8 && &data[4..8] == b"ftyp" {
            return FileKind::Mp4;
        }
    }
    if data.len() >= 3 && data[..2] == [0x1F, 0x8B] {
        return FileKind::Gzip;
    }
    if data.len() >= 3 && data[..3] == [0xFF, 0xD8, 0xFF] {
        return FileKind::Jpeg;
    }
    // Brotli has no magic; the conventional stream header starts 0xCE 0xB2
    // when emitted by the reference encoder with a window size byte.
    if data.len() >= 2 && data[..2] == [0xCE, 0xB2] {
        return FileKind::Brotli;
    }
    FileKind::Unknown
}

/// True when compression should be skipped for `data`.
pub fn should_skip_compression(data: &[u8]) -> bool {
    if sniff(data).is_compressed() {
        return true;
    }
    // Sample the tail: container headers can be low-entropy while the body
    // is packed.
    let tail = &data[data.len().saturating_sub(ENTROPY_TAIL)..];
    tail.len() >= 256 && shannon_entropy(tail) > ENTROPY_SKIP_THRESHOLD
}

fn shannon_entropy(data: &[u8]) -> f64 {
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_signatures() {
        assert_eq!(sniff(&[0x50, 0x4B, 0x03, 0x04, 0, 0]), FileKind::Zip);
        assert_eq!(sniff(&[0x1F, 0x8B, 0x08]), FileKind::Gzip);
        assert_eq!(sniff(&[0x28, 0xB5, 0x2F, 0xFD, 1]), FileKind::Zstd);
        assert_eq!(sniff(&[0x89, 0x50, 0x4E, 0x47, 0x0D]), FileKind::Png);
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), FileKind::Jpeg);
        assert_eq!(sniff(b"\x00\x00\x00\x18ftypmp42"), FileKind::Mp4);
        assert_eq!(sniff(b"plain text payload"), FileKind::Unknown);
    }

    #[test]
    fn short_inputs_are_unknown() {
        assert_eq!(sniff(&[]), FileKind::Unknown);
        assert_eq!(sniff(&[0x50]), FileKind::Unknown);
    }

    #[test]
    fn low_entropy_text_is_compressed() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(100);
        assert!(!should_skip_compression(&data));
    }

    #[test]
    fn high_entropy_tail_skips_compression() {
        // A pseudo-random tail pushes entropy close to 8 bits/byte.
        let mut data = vec![0u8; 8192];
        let mut state = 0x12345678u32;
        for b in &mut data {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (state >> 24) as u8;
        }
        assert!(should_skip_compression(&data));
    }
}
