//! BLTE container parsing and decompression.
//!
//! Layout: magic `BLTE`, u32BE header size, then for multi-chunk files
//! a flag byte, a u24BE chunk count and per-chunk
//! `{u32BE compressed_size, u32BE decompressed_size, 16-byte MD5}`
//! entries. Header size 0 means the remainder is a single chunk.
//!
//! Each chunk starts with a mode byte: `N` raw, `Z` zlib. Encrypted
//! (`E`) and frame (`F`) chunks are not served by the cache pipeline
//! and fail with `UnsupportedBlteEncoding`.

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// `"BLTE"` (0x45544C42 read as a little-endian u32).
pub const BLTE_MAGIC: [u8; 4] = *b"BLTE";

/// Per-chunk metadata from the header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Payload size, not counting the chunk's mode byte.
    pub compressed_size: u32,
    pub decompressed_size: u32,
    pub checksum: [u8; 16],
}

/// Parsed BLTE header.
#[derive(Debug, Clone)]
pub struct BlteHeader {
    pub header_size: u32,
    /// Empty for single-chunk files.
    pub chunks: Vec<ChunkInfo>,
}

impl BlteHeader {
    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != BLTE_MAGIC {
            return Err(Error::BadMagic);
        }

        let header_size = reader.read_u32::<BigEndian>()?;
        if header_size == 0 {
            return Ok(Self {
                header_size,
                chunks: Vec::new(),
            });
        }

        // Chunk count lives in bytes 1-3 of the next 4-byte field; the
        // leading byte carries table flags the cache does not use.
        let _flags = reader.read_u8()?;
        let chunk_count = reader.read_u24::<BigEndian>()?;
        trace!("BLTE chunk count: {chunk_count}");

        let mut chunks = Vec::with_capacity(chunk_count as usize);
        for _ in 0..chunk_count {
            let compressed_size = reader.read_u32::<BigEndian>()?;
            let decompressed_size = reader.read_u32::<BigEndian>()?;
            let mut checksum = [0u8; 16];
            reader.read_exact(&mut checksum)?;
            chunks.push(ChunkInfo {
                compressed_size,
                decompressed_size,
                checksum,
            });
        }

        Ok(Self { header_size, chunks })
    }

    pub fn is_single_chunk(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Decompress a whole BLTE payload.
pub fn decompress_blte(data: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(data);
    let header = BlteHeader::parse(&mut cursor)?;
    let mut offset = cursor.position() as usize;

    if header.is_single_chunk() {
        let chunk = &data[offset..];
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        return decompress_chunk(chunk[0], &chunk[1..], None);
    }

    let total: usize = header
        .chunks
        .iter()
        .map(|c| c.decompressed_size as usize)
        .sum();
    let mut result = Vec::with_capacity(total);

    for (index, info) in header.chunks.iter().enumerate() {
        let chunk_len = 1 + info.compressed_size as usize;
        if offset + chunk_len > data.len() {
            return Err(Error::TruncatedData {
                expected: offset + chunk_len,
                actual: data.len(),
            });
        }
        let chunk = &data[offset..offset + chunk_len];
        offset += chunk_len;

        verify_checksum(chunk, &info.checksum, index)?;
        let decompressed = decompress_chunk(chunk[0], &chunk[1..], Some(info))?;
        result.extend_from_slice(&decompressed);
    }

    debug!("BLTE: {} bytes -> {} bytes", data.len(), result.len());
    Ok(result)
}

/// All-zero checksums (synthetic or stripped manifests) are skipped.
fn verify_checksum(chunk: &[u8], expected: &[u8; 16], index: usize) -> Result<()> {
    if expected.iter().all(|b| *b == 0) {
        return Ok(());
    }
    let actual = md5::compute(chunk).0;
    if actual != *expected {
        trace!("chunk {index} checksum mismatch");
        return Err(Error::ChecksumMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

fn decompress_chunk(mode: u8, payload: &[u8], info: Option<&ChunkInfo>) -> Result<Vec<u8>> {
    match mode {
        b'N' => Ok(payload.to_vec()),
        b'Z' => {
            let mut decoder = ZlibDecoder::new(payload);
            let mut result = info.map_or_else(Vec::new, |i| {
                Vec::with_capacity(i.decompressed_size as usize)
            });
            decoder
                .read_to_end(&mut result)
                .map_err(|e| Error::Decompression(format!("zlib: {e}")))?;
            Ok(result)
        }
        // Encrypted and recursive-frame chunks never appear in the
        // manifests the attributor fetches.
        b'E' | b'F' => Err(Error::UnsupportedBlteEncoding(mode)),
        other => Err(Error::UnsupportedBlteEncoding(other)),
    }
}

/// Wrap `data` in a single-chunk mode-`Z` container.
///
/// The pipeline only ever reads BLTE; this writer exists for the
/// round-trip law and for fixture construction.
pub fn compress_blte_z(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Decompression(format!("zlib: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Decompression(format!("zlib: {e}")))?;

    let mut out = Vec::with_capacity(9 + compressed.len());
    out.extend_from_slice(&BLTE_MAGIC);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(b'Z');
    out.extend_from_slice(&compressed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn single_chunk(mode: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&BLTE_MAGIC);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.push(mode);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn reference_mode_n_vector() {
        // BLTE, header size 0x18, one chunk of 10 -> 10 bytes, mode N.
        let mut data = Vec::new();
        data.extend_from_slice(&[0x42, 0x4C, 0x54, 0x45]);
        data.extend_from_slice(&0x18u32.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&10u32.to_be_bytes());
        data.extend_from_slice(&10u32.to_be_bytes());
        let chunk: Vec<u8> = std::iter::once(b'N')
            .chain(b"hello wrld".iter().copied())
            .collect();
        data.extend_from_slice(&md5::compute(&chunk).0);
        data.extend_from_slice(&chunk);

        let result = decompress_blte(&data).unwrap();
        assert_eq!(result, b"hello wrld");
        assert_eq!(result.len(), 10);
    }

    #[test]
    fn single_chunk_mode_n() {
        let data = single_chunk(b'N', b"Hello, BLTE!");
        assert_eq!(decompress_blte(&data).unwrap(), b"Hello, BLTE!");
    }

    #[test]
    fn single_chunk_mode_z() {
        let compressed = compress_blte_z(b"Hello, BLTE! A longer string compresses.").unwrap();
        assert_eq!(
            decompress_blte(&compressed).unwrap(),
            b"Hello, BLTE! A longer string compresses."
        );
    }

    #[test]
    fn encrypted_and_frame_modes_are_unsupported() {
        for mode in [b'E', b'F'] {
            let data = single_chunk(mode, &[0u8; 32]);
            assert!(matches!(
                decompress_blte(&data),
                Err(Error::UnsupportedBlteEncoding(m)) if m == mode
            ));
        }
    }

    #[test]
    fn unknown_mode_is_unsupported() {
        let data = single_chunk(b'X', b"junk");
        assert!(matches!(
            decompress_blte(&data),
            Err(Error::UnsupportedBlteEncoding(b'X'))
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data = single_chunk(b'N', b"x");
        data[0] = b'Q';
        assert!(matches!(decompress_blte(&data), Err(Error::BadMagic)));
    }

    #[test]
    fn multi_chunk_concatenates() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"BLTE!").unwrap();
        let second = encoder.finish().unwrap();

        let chunk1: Vec<u8> = std::iter::once(b'N')
            .chain(b"Hello, ".iter().copied())
            .collect();
        let chunk2: Vec<u8> = std::iter::once(b'Z').chain(second.iter().copied()).collect();

        let mut data = Vec::new();
        data.extend_from_slice(&BLTE_MAGIC);
        let header_size = 8 + 4 + 2 * 24;
        data.extend_from_slice(&(header_size as u32).to_be_bytes());
        data.push(0x0F);
        data.extend_from_slice(&[0x00, 0x00, 0x02]);
        for (chunk, decompressed) in [(&chunk1, 7u32), (&chunk2, 5u32)] {
            data.extend_from_slice(&((chunk.len() as u32) - 1).to_be_bytes());
            data.extend_from_slice(&decompressed.to_be_bytes());
            data.extend_from_slice(&md5::compute(chunk).0);
        }
        data.extend_from_slice(&chunk1);
        data.extend_from_slice(&chunk2);

        assert_eq!(decompress_blte(&data).unwrap(), b"Hello, BLTE!");
    }

    #[test]
    fn checksum_mismatch_detected() {
        let chunk: Vec<u8> = std::iter::once(b'N').chain(b"data".iter().copied()).collect();
        let mut data = Vec::new();
        data.extend_from_slice(&BLTE_MAGIC);
        data.extend_from_slice(&36u32.to_be_bytes());
        data.push(0x0F);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(&[0xAB; 16]); // wrong, non-zero
        data.extend_from_slice(&chunk);

        assert!(matches!(
            decompress_blte(&data),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_chunk_detected() {
        let mut data = Vec::new();
        data.extend_from_slice(&BLTE_MAGIC);
        data.extend_from_slice(&36u32.to_be_bytes());
        data.push(0x0F);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(b"Nshort");

        assert!(matches!(
            decompress_blte(&data),
            Err(Error::TruncatedData { .. })
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// decompress(compress(x)) == x for mode Z at the default
            /// zlib level.
            #[test]
            fn zlib_round_trip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
                let compressed = compress_blte_z(&data).unwrap();
                let decompressed = decompress_blte(&compressed).unwrap();
                prop_assert_eq!(decompressed, data);
            }

            /// Arbitrary non-BLTE prefixes never panic, they error.
            #[test]
            fn garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = decompress_blte(&data);
            }
        }
    }
}
