//! Sparse stream wire format: frame codec, metadata header and trailer.

pub mod codec;
pub mod frame;

pub use codec::{BackupLevel, BlockCompressionInfo, CompressionTrailer, Metadata, SparseStreamReader, SparseStreamWriter};
pub use frame::{Frame, FrameKind};
