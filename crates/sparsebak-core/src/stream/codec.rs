//! Sparse stream: metadata header, frame sequence and compression trailer.
//!
//! A sparse stream is, in order:
//!
//! 1. One `META` frame whose payload is a JSON-encoded [`Metadata`].
//! 2. Any number of `DATA`/`ZERO` frames describing the disk's extents.
//! 3. One `STOP` frame.
//! 4. If compression is enabled, a [`CompressionTrailer`] appended after the
//!    `STOP` frame: a JSON blob followed by an 8-byte little-endian length
//!    so a restoring reader can seek to the trailer without scanning the
//!    whole stream.
//!
//! Restore, unlike backup, must read the trailer *before* it starts
//! streaming frames, because chunk boundaries inside each `DATA` frame are
//! only recoverable from the trailer once compression has collapsed them.
//! Backup never needs to seek: it appends the trailer purely by continuing
//! to write.

use crate::error::{Error, Result};
use crate::stream::frame::{Frame, FrameKind};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

/// The JSON-encoded payload of the stream's single `META` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub disk_name: String,
    pub virtual_size: u64,
    pub checkpoint_name: String,
    pub parent_checkpoint: Option<String>,
    pub level: BackupLevel,
    pub compressed: bool,
    /// Sum of `DATA` frame original (uncompressed) lengths. Restore sums
    /// the `DATA` frames it actually applies and compares against this,
    /// since a mismatch means the stream is truncated or corrupt.
    pub data_size: u64,
    /// Free-form fields carried through without interpretation, so readers
    /// written against an older `Metadata` shape tolerate new producers.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The four backup levels a sparse stream can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupLevel {
    Full,
    Incremental,
    Differential,
    Copy,
}

/// Per-block, per-chunk compressed sizes, written once at end of stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompressionTrailer {
    pub blocks: Vec<BlockCompressionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockCompressionInfo {
    /// Offset of the originating `DATA` frame's payload within the stream.
    pub stream_offset: u64,
    /// Compressed size of each chunk the block was split into.
    pub chunk_compressed_sizes: Vec<u32>,
}

/// Writes a sparse stream. Owns nothing about compression itself — callers
/// pass already-framed `DATA`/`ZERO` frames via [`write_frame`] — but
/// accumulates the trailer entries needed to make a compressed stream
/// restorable.
pub struct SparseStreamWriter<W: Write> {
    inner: W,
    compressed: bool,
    trailer: CompressionTrailer,
    wrote_meta: bool,
    finished: bool,
}

impl<W: Write> SparseStreamWriter<W> {
    pub fn new(inner: W, compressed: bool) -> Self {
        SparseStreamWriter {
            inner,
            compressed,
            trailer: CompressionTrailer::default(),
            wrote_meta: false,
            finished: false,
        }
    }

    pub fn write_metadata(&mut self, metadata: &Metadata) -> Result<()> {
        let payload = serde_json::to_vec(metadata)
            .map_err(|e| Error::stream_format(format!("failed to encode metadata: {e}")))?;
        Frame::meta(payload).write_to(&mut self.inner)?;
        self.wrote_meta = true;
        Ok(())
    }

    /// Writes a `DATA` or `ZERO` frame. If `chunk_compressed_sizes` is
    /// non-empty, records a trailer entry for this block.
    pub fn write_frame(&mut self, frame: &Frame, chunk_compressed_sizes: Vec<u32>) -> Result<()> {
        if !self.wrote_meta {
            return Err(Error::stream_format("wrote a data frame before the metadata frame"));
        }
        let stream_offset = frame.start;
        frame.write_to(&mut self.inner)?;
        if self.compressed && frame.kind == FrameKind::Data {
            self.trailer.blocks.push(BlockCompressionInfo {
                stream_offset,
                chunk_compressed_sizes,
            });
        }
        Ok(())
    }

    /// Writes the `STOP` frame and, if enabled, the compression trailer.
    pub fn finish(mut self) -> Result<W> {
        Frame::stop().write_to(&mut self.inner)?;
        if self.compressed {
            let encoded = serde_json::to_vec(&self.trailer)
                .map_err(|e| Error::stream_format(format!("failed to encode trailer: {e}")))?;
            self.inner.write_all(&encoded).map_err(Error::io_simple)?;
            self.inner
                .write_all(&(encoded.len() as u64).to_le_bytes())
                .map_err(Error::io_simple)?;
        }
        self.finished = true;
        Ok(self.inner)
    }
}

/// Reads a sparse stream. For compressed streams, [`read_trailer`] must be
/// called before frames are consumed.
pub struct SparseStreamReader<R> {
    inner: R,
}

impl<R: Read> SparseStreamReader<R> {
    pub fn new(inner: R) -> Self {
        SparseStreamReader { inner }
    }

    pub fn read_metadata(&mut self) -> Result<Metadata> {
        let frame = Frame::read_from(&mut self.inner)?
            .ok_or_else(|| Error::stream_format("stream ended before metadata frame"))?;
        if frame.kind != FrameKind::Meta {
            return Err(Error::stream_format("expected metadata frame first"));
        }
        serde_json::from_slice(&frame.payload)
            .map_err(|e| Error::stream_format(format!("failed to decode metadata: {e}")))
    }

    /// Reads the next frame. Returns `Ok(None)` after the `STOP` frame has
    /// been consumed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = Frame::read_from(&mut self.inner)?;
        match frame {
            Some(f) if f.kind == FrameKind::Stop => Ok(None),
            other => Ok(other),
        }
    }
}

impl<R: Read + Seek> SparseStreamReader<R> {
    /// Seeks to and reads the trailer appended after `STOP`, then rewinds
    /// to the start of the stream so frame-by-frame reading can proceed
    /// normally. Must be called, if at all, before `read_metadata`.
    pub fn read_trailer(&mut self) -> Result<CompressionTrailer> {
        self.inner.seek(SeekFrom::End(-8)).map_err(Error::io_simple)?;
        let mut len_buf = [0u8; 8];
        self.inner.read_exact(&mut len_buf).map_err(Error::io_simple)?;
        let len = u64::from_le_bytes(len_buf);

        self.inner
            .seek(SeekFrom::End(-8 - len as i64))
            .map_err(Error::io_simple)?;
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).map_err(Error::io_simple)?;

        let trailer = serde_json::from_slice(&buf)
            .map_err(|e| Error::stream_format(format!("failed to decode trailer: {e}")))?;

        self.inner.seek(SeekFrom::Start(0)).map_err(Error::io_simple)?;
        Ok(trailer)
    }
}
