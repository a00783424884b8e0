//! Restore pipeline: replays a checkpoint chain onto a target device.
//!
//! Grounded on `flyingcircusio-backy-extract`'s `Extractor::extract`
//! (crossbeam-channel pipeline of read → decompress → write stages, with
//! progress reporting) generalized from a single revision to a chain of
//! sparse streams applied in order. Unlike backup, restore must read a
//! compressed stream's trailer before it starts streaming frames, since
//! chunk boundaries are only recoverable from the trailer once
//! compression has collapsed them.

use crate::checkpoint::{CheckpointChain, CheckpointRecord};
use crate::chunked::decompress_chunks;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::stream::{Frame, FrameKind, SparseStreamReader};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Parameters for a restore run.
pub struct RestoreConfig {
    pub backup_dir: PathBuf,
    pub disk_name: String,
    /// Stop after replaying this checkpoint, inclusive. `None` replays the
    /// whole chain.
    pub until: Option<String>,
}

/// What the restore actually did, reported back to the CLI.
pub struct RestoreOutcome {
    pub checkpoints_applied: Vec<String>,
    pub bytes_written: u64,
    /// Set when the walk stopped early because `until` was reached, rather
    /// than because the chain ended naturally.
    pub stopped_at_until: bool,
}

/// Replays `chain` onto `device`, honoring `config.until`.
#[instrument(skip(chain, device, config), fields(disk = %config.disk_name))]
pub fn run_restore(
    chain: &CheckpointChain,
    device: &dyn BlockDevice,
    config: &RestoreConfig,
) -> Result<RestoreOutcome> {
    let records: Vec<CheckpointRecord> = match &config.until {
        Some(until) => chain.up_to(until)?,
        None => chain.records().to_vec(),
    };
    if records.is_empty() {
        return Err(Error::NoCheckpoints(config.disk_name.clone()));
    }

    let mut bytes_written = 0u64;
    let mut applied = Vec::new();
    let mut stopped_at_until = false;

    for record in &records {
        let path = config.backup_dir.join(format!(
            "{}.{}.{}.data",
            config.disk_name,
            level_tag(record.level),
            record.name
        ));
        bytes_written += apply_stream(&path, device)?;
        applied.push(record.name.clone());

        if config.until.as_deref() == Some(record.name.as_str()) {
            stopped_at_until = true;
            break;
        }
    }

    info!(bytes_written, checkpoints = applied.len(), "restore complete");
    Ok(RestoreOutcome {
        checkpoints_applied: applied,
        bytes_written,
        stopped_at_until,
    })
}

/// Applies one sparse stream file to `device`, writing data blocks and
/// zeroing hole blocks in place. Verifies Σ of the `DATA` frames' original
/// lengths against the stream's own `meta.data_size`; a mismatch means the
/// stream is truncated or corrupt and is fatal.
fn apply_stream(path: &Path, device: &dyn BlockDevice) -> Result<u64> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;

    // Compressed streams must be trailer-read before frames are streamed,
    // since chunk boundaries live only in the trailer.
    let mut reader = SparseStreamReader::new(file);
    let metadata = reader.read_metadata()?;

    let trailer = if metadata.compressed {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut trailer_reader = SparseStreamReader::new(file);
        Some(trailer_reader.read_trailer()?)
    } else {
        None
    };

    let mut bytes_written = 0u64;
    let mut data_bytes = 0u64;
    while let Some(frame) = reader.next_frame()? {
        match frame.kind {
            FrameKind::Zero => {
                device.zero_at(frame.start, frame.length)?;
                bytes_written += frame.length;
            }
            FrameKind::Data => {
                let payload = if let Some(trailer) = &trailer {
                    let chunk_sizes = find_chunk_sizes(trailer, frame.start)?;
                    decompress_chunks(&frame.payload, chunk_sizes)?
                } else {
                    frame.payload.clone()
                };
                device.write_at(frame.start, &payload)?;
                bytes_written += payload.len() as u64;
                data_bytes += payload.len() as u64;
            }
            _ => {}
        }
    }

    if data_bytes != metadata.data_size {
        return Err(Error::RestoreSizeMismatch {
            expected: metadata.data_size,
            actual: data_bytes,
        });
    }

    Ok(bytes_written)
}

fn find_chunk_sizes(trailer: &crate::stream::CompressionTrailer, frame_start: u64) -> Result<&[u32]> {
    trailer
        .blocks
        .iter()
        .find(|b| b.stream_offset == frame_start)
        .map(|b| b.chunk_compressed_sizes.as_slice())
        .ok_or_else(|| Error::stream_format("no trailer entry for data block"))
}

fn level_tag(level: crate::stream::BackupLevel) -> &'static str {
    use crate::stream::BackupLevel::*;
    match level {
        Full => "full",
        Incremental => "inc",
        Differential => "diff",
        Copy => "copy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;
    use crate::stream::{BackupLevel, Metadata, SparseStreamWriter};
    use tempfile::tempdir;

    fn write_full_stream(dir: &Path, disk: &str, checkpoint: &str, size: u64) {
        let path = dir.join(format!("{disk}.full.{checkpoint}.data"));
        let file = File::create(&path).unwrap();
        let mut writer = SparseStreamWriter::new(file, false);
        writer
            .write_metadata(&Metadata {
                disk_name: disk.to_string(),
                virtual_size: size,
                checkpoint_name: checkpoint.to_string(),
                parent_checkpoint: None,
                level: BackupLevel::Full,
                compressed: false,
                data_size: 8,
                extra: serde_json::Map::new(),
            })
            .unwrap();
        writer.write_frame(&Frame::data(0, vec![5u8; 8]), vec![]).unwrap();
        writer.write_frame(&Frame::zero(8, size - 8), vec![]).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn restores_a_single_full_backup() {
        let dir = tempdir().unwrap();
        write_full_stream(dir.path(), "vda", "sparsebak.0", 64);

        let mut chain = CheckpointChain::new();
        chain.append("sparsebak.0", BackupLevel::Full).unwrap();

        let target_path = dir.path().join("restored.img");
        let device = FileBlockDevice::create(&target_path, 64).unwrap();

        let config = RestoreConfig {
            backup_dir: dir.path().to_path_buf(),
            disk_name: "vda".to_string(),
            until: None,
        };
        let outcome = run_restore(&chain, &device, &config).unwrap();
        assert_eq!(outcome.checkpoints_applied, vec!["sparsebak.0"]);
        assert!(!outcome.stopped_at_until);
        assert_eq!(&device.read_at(0, 8).unwrap(), &vec![5u8; 8]);
    }

    #[test]
    fn restore_stops_at_until_checkpoint() {
        let dir = tempdir().unwrap();
        write_full_stream(dir.path(), "vda", "sparsebak.0", 64);

        let mut chain = CheckpointChain::new();
        chain.append("sparsebak.0", BackupLevel::Full).unwrap();

        let target_path = dir.path().join("restored.img");
        let device = FileBlockDevice::create(&target_path, 64).unwrap();

        let config = RestoreConfig {
            backup_dir: dir.path().to_path_buf(),
            disk_name: "vda".to_string(),
            until: Some("sparsebak.0".to_string()),
        };
        let outcome = run_restore(&chain, &device, &config).unwrap();
        assert!(outcome.stopped_at_until);
    }

    #[test]
    fn restore_with_no_checkpoints_fails() {
        let dir = tempdir().unwrap();
        let chain = CheckpointChain::new();
        let target_path = dir.path().join("restored.img");
        let device = FileBlockDevice::create(&target_path, 64).unwrap();
        let config = RestoreConfig {
            backup_dir: dir.path().to_path_buf(),
            disk_name: "vda".to_string(),
            until: None,
        };
        assert!(run_restore(&chain, &device, &config).is_err());
    }
}
