//! Chunked I/O: splits extents into requests no larger than a device's
//! maximum request size, and optionally LZ4-compresses each chunk.
//!
//! Generalized from the teacher's `VmdkReader::chunks` (memory-mapped,
//! fixed-size chunk iteration) to operate over an arbitrary [`BlockDevice`]
//! and a single extent, since NBD requests must stay under
//! `max_request_size` rather than under a compile-time chunk size.

use crate::device::BlockDevice;
use crate::error::Result;
use crate::extent::Extent;

/// One bounded-size slice of an extent, ready to be read from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
}

/// Splits `extent` into chunks no larger than `max_request_size`.
pub fn split_extent(extent: &Extent, max_request_size: u64) -> Vec<Chunk> {
    assert!(max_request_size > 0, "max_request_size must be positive");
    let mut chunks = Vec::new();
    let mut offset = extent.offset;
    let end = extent.end();
    while offset < end {
        let length = (end - offset).min(max_request_size);
        chunks.push(Chunk { offset, length });
        offset += length;
    }
    chunks
}

/// Reads every chunk of `extent` from `device`, honoring
/// `device.max_request_size()`.
pub fn read_extent(device: &dyn BlockDevice, extent: &Extent) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(extent.length as usize);
    for chunk in split_extent(extent, device.max_request_size()) {
        buf.extend(device.read_at(chunk.offset, chunk.length)?);
    }
    Ok(buf)
}

/// Compresses `data` with LZ4 block compression, splitting it into chunks
/// no larger than `chunk_size` first so a reader can decompress
/// incrementally rather than holding a whole block in memory.
///
/// Returns the concatenated compressed bytes and the compressed length of
/// each chunk, which the sparse stream trailer records so restore can find
/// chunk boundaries without re-scanning.
pub fn compress_chunks(data: &[u8], chunk_size: usize) -> (Vec<u8>, Vec<u32>) {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut compressed = Vec::new();
    let mut sizes = Vec::new();
    for raw_chunk in data.chunks(chunk_size) {
        let packed = lz4_flex::block::compress_prepend_size(raw_chunk);
        sizes.push(packed.len() as u32);
        compressed.extend(packed);
    }
    (compressed, sizes)
}

/// Reverses [`compress_chunks`] given the same per-chunk compressed sizes.
pub fn decompress_chunks(compressed: &[u8], chunk_sizes: &[u32]) -> Result<Vec<u8>> {
    use crate::error::Error;

    let mut decompressed = Vec::new();
    let mut offset = 0usize;
    for &size in chunk_sizes {
        let size = size as usize;
        let slice = compressed
            .get(offset..offset + size)
            .ok_or_else(|| Error::stream_format("compressed chunk runs past end of block"))?;
        let chunk = lz4_flex::block::decompress_size_prepended(slice)
            .map_err(|e| Error::stream_format(format!("LZ4 decompression failed: {e}")))?;
        decompressed.extend(chunk);
        offset += size;
    }
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;
    use tempfile::tempdir;

    #[test]
    fn split_extent_respects_max_request_size() {
        let extent = Extent { offset: 0, length: 25, data: true };
        let chunks = split_extent(&extent, 10);
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0, length: 10 },
                Chunk { offset: 10, length: 10 },
                Chunk { offset: 20, length: 5 },
            ]
        );
    }

    #[test]
    fn split_extent_single_chunk_when_smaller_than_limit() {
        let extent = Extent { offset: 100, length: 4, data: true };
        let chunks = split_extent(&extent, 1 << 20);
        assert_eq!(chunks, vec![Chunk { offset: 100, length: 4 }]);
    }

    #[test]
    fn read_extent_reassembles_full_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev = FileBlockDevice::create(&path, 64).unwrap();
        dev.write_at(0, &(0u8..64).collect::<Vec<u8>>()).unwrap();
        let extent = Extent { offset: 0, length: 64, data: true };
        let data = read_extent(&dev, &extent).unwrap();
        assert_eq!(data, (0u8..64).collect::<Vec<u8>>());
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let data = vec![42u8; 10_000];
        let (compressed, sizes) = compress_chunks(&data, 4096);
        assert!(compressed.len() < data.len());
        let decompressed = decompress_chunks(&compressed, &sizes).unwrap();
        assert_eq!(decompressed, data);
    }
}
