//! Instant-recovery block map and NBD-plugin-style read path.
//!
//! A prescan of an uncompressed sparse stream builds an ordered
//! [`BlockMap`]: for every `DATA`/`ZERO` frame, the original guest offset
//! range it represents and, for `DATA` frames, the byte offset within the
//! backup file where its payload lives. Serving a read means translating a
//! guest offset into a file offset by binary search and reading straight
//! out of the backup file — no decompression, no replay.

use crate::error::{Error, Result};
use crate::stream::{Frame, FrameKind, Metadata, SparseStreamReader};
use std::io::{Read, Seek};

/// One entry of the block map: a contiguous run of the guest disk and
/// where to find it in the backup file, if it has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapEntry {
    pub original_offset: u64,
    pub next_original_offset: u64,
    pub length: u64,
    pub stream_offset: u64,
    pub data: bool,
    pub next_block_offset: u64,
}

impl BlockMapEntry {
    fn contains(&self, offset: u64) -> bool {
        offset >= self.original_offset && offset < self.next_original_offset
    }
}

/// The full, ordered block map for one backup file.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    entries: Vec<BlockMapEntry>,
}

impl BlockMap {
    /// Scans `reader` (the backup file, opened for random access) and
    /// builds the block map. Refuses compressed streams per spec, since a
    /// stream-offset-to-file-offset mapping only holds when each frame's
    /// payload is stored uncompressed and contiguous.
    pub fn build<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        // Parse the metadata frame through `SparseStreamReader` for its
        // validation, but track absolute file offsets via `stream_position`
        // rather than manual byte counting, since the mapper's
        // `stream_offset` values must address the *original* backup file,
        // metadata frame included.
        let metadata = {
            let mut stream = SparseStreamReader::new(&mut *reader);
            stream.read_metadata()?
        };
        if metadata.compressed {
            return Err(Error::CompressionUnsupportedForMapping);
        }

        let mut entries = Vec::new();
        loop {
            let frame_start = reader.stream_position().map_err(Error::io_simple)?;
            let frame = match Frame::read_from(reader)? {
                Some(f) => f,
                None => break,
            };
            if frame.kind == FrameKind::Stop {
                break;
            }
            let length = frame.length;
            let data = frame.kind == FrameKind::Data;
            let stream_offset = if data { frame_start + FRAME_HEADER_LEN } else { 0 };
            entries.push(BlockMapEntry {
                original_offset: frame.start,
                next_original_offset: frame.start + length,
                length,
                stream_offset,
                data,
                next_block_offset: 0,
            });
        }

        let file_end = reader.stream_position().map_err(Error::io_simple)?;
        for i in 0..entries.len() {
            let next = entries
                .get(i + 1)
                .map(|e| e.stream_offset)
                .unwrap_or(file_end);
            entries[i].next_block_offset = next;
        }

        Ok(BlockMap { entries })
    }

    /// Builds a map directly from metadata + pre-decoded frames, useful in
    /// tests and when the caller already parsed the stream once.
    pub fn from_entries(entries: Vec<BlockMapEntry>) -> Self {
        BlockMap { entries }
    }

    pub fn metadata_len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the entry covering `offset`, by binary search over
    /// `original_offset`.
    pub fn locate(&self, offset: u64) -> Option<&BlockMapEntry> {
        let idx = self
            .entries
            .partition_point(|e| e.next_original_offset <= offset);
        self.entries.get(idx).filter(|e| e.contains(offset))
    }

    pub fn entries(&self) -> &[BlockMapEntry] {
        &self.entries
    }
}

const FRAME_HEADER_LEN: u64 = 2 + 1 + 16 + 1 + 16 + 2;

/// Serves reads for the instant-recovery NBD export. Each `pread` must fall
/// entirely within one block map entry; spanning a boundary is a caller
/// error (the NBD blocksize-filter is expected to prevent it in practice).
pub struct MapperServer<R> {
    file: R,
    map: BlockMap,
    virtual_size: u64,
}

impl<R: Read + Seek> MapperServer<R> {
    pub fn new(file: R, map: BlockMap, metadata: &Metadata) -> Self {
        MapperServer {
            file,
            map,
            virtual_size: metadata.virtual_size,
        }
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Reads `length` bytes starting at guest `offset`.
    pub fn pread(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let entry = self
            .map
            .locate(offset)
            .ok_or_else(|| Error::stream_format("offset not covered by block map"))?;
        if offset + length > entry.next_original_offset {
            return Err(Error::UnexpectedBlockRange { offset, length });
        }

        if !entry.data {
            return Ok(vec![0u8; length as usize]);
        }

        let within_block = offset - entry.original_offset;
        let file_offset = entry.stream_offset + within_block;
        self.file
            .seek(std::io::SeekFrom::Start(file_offset))
            .map_err(Error::io_simple)?;
        let mut buf = vec![0u8; length as usize];
        self.file.read_exact(&mut buf).map_err(Error::io_simple)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BackupLevel, SparseStreamWriter};
    use std::io::Cursor;

    fn write_sample_stream() -> Vec<u8> {
        let mut writer = SparseStreamWriter::new(Vec::new(), false);
        writer
            .write_metadata(&Metadata {
                disk_name: "vda".into(),
                virtual_size: 8192,
                checkpoint_name: "sparsebak.0".into(),
                parent_checkpoint: None,
                level: BackupLevel::Full,
                compressed: false,
                data_size: 4096,
                extra: serde_json::Map::new(),
            })
            .unwrap();
        writer
            .write_frame(&Frame::data(0, vec![1u8; 4096]), vec![])
            .unwrap();
        writer.write_frame(&Frame::zero(4096, 4096), vec![]).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn build_and_locate_round_trip() {
        let buf = write_sample_stream();
        let mut cursor = Cursor::new(buf);
        let map = BlockMap::build(&mut cursor).unwrap();
        assert_eq!(map.metadata_len(), 2);

        let data_entry = map.locate(100).unwrap();
        assert!(data_entry.data);

        let zero_entry = map.locate(5000).unwrap();
        assert!(!zero_entry.data);
    }

    #[test]
    fn pread_reads_data_block() {
        let buf = write_sample_stream();
        let mut cursor = Cursor::new(buf.clone());
        let map = BlockMap::build(&mut cursor).unwrap();
        let metadata = {
            let mut c2 = Cursor::new(buf.clone());
            SparseStreamReader::new(&mut c2).read_metadata().unwrap()
        };
        let mut server = MapperServer::new(Cursor::new(buf), map, &metadata);
        let data = server.pread(0, 16).unwrap();
        assert_eq!(data, vec![1u8; 16]);
    }

    #[test]
    fn pread_zero_block_returns_zeros() {
        let buf = write_sample_stream();
        let mut cursor = Cursor::new(buf.clone());
        let map = BlockMap::build(&mut cursor).unwrap();
        let metadata = {
            let mut c2 = Cursor::new(buf.clone());
            SparseStreamReader::new(&mut c2).read_metadata().unwrap()
        };
        let mut server = MapperServer::new(Cursor::new(buf), map, &metadata);
        let data = server.pread(4096, 32).unwrap();
        assert_eq!(data, vec![0u8; 32]);
    }

    #[test]
    fn pread_spanning_blocks_is_rejected() {
        let buf = write_sample_stream();
        let mut cursor = Cursor::new(buf.clone());
        let map = BlockMap::build(&mut cursor).unwrap();
        let metadata = {
            let mut c2 = Cursor::new(buf.clone());
            SparseStreamReader::new(&mut c2).read_metadata().unwrap()
        };
        let mut server = MapperServer::new(Cursor::new(buf), map, &metadata);
        let err = server.pread(4090, 100);
        assert!(matches!(err, Err(Error::UnexpectedBlockRange { .. })));
    }

    #[test]
    fn compressed_stream_refuses_mapping() {
        let mut writer = SparseStreamWriter::new(Vec::new(), true);
        writer
            .write_metadata(&Metadata {
                disk_name: "vda".into(),
                virtual_size: 8192,
                checkpoint_name: "sparsebak.0".into(),
                parent_checkpoint: None,
                level: BackupLevel::Full,
                compressed: true,
                data_size: 4096,
                extra: serde_json::Map::new(),
            })
            .unwrap();
        let buf = writer.finish().unwrap();
        let mut cursor = Cursor::new(buf);
        let err = BlockMap::build(&mut cursor);
        assert!(matches!(err, Err(Error::CompressionUnsupportedForMapping)));
    }
}
