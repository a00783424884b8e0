//! Capability boundaries for the virtualization host and the NBD transport.
//!
//! The backup/restore/mapper pipelines never talk to libvirt or an NBD
//! socket directly; they depend only on these two traits. Production
//! binaries wire a real NBD client and host-control implementation behind
//! them; tests and local-file workflows use [`FileBlockDevice`] and
//! [`StubHostControl`].

use crate::error::{Error, Result};
use crate::extent::Extent;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A readable/writable block device, as exposed by an NBD export.
pub trait BlockDevice: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Writes `data` starting at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Zeroes `len` bytes starting at `offset`, without necessarily
    /// transferring any payload over the wire.
    fn zero_at(&self, offset: u64, len: u64) -> Result<()>;

    /// Returns the allocated/dirty extent map. `dirty_bitmap` selects an
    /// incremental/differential context (`qemu:dirty-bitmap:<name>`); `None`
    /// queries the base allocation map for a full or copy backup.
    fn extents(&self, dirty_bitmap: Option<&str>) -> Result<Vec<Extent>>;

    /// The largest single read/write request the transport will accept.
    fn max_request_size(&self) -> u64;

    /// The virtual size of the exported disk.
    fn virtual_size(&self) -> u64;
}

/// The virtualization host's control plane: checkpoint lifecycle and
/// filesystem quiescing.
pub trait HostControl: Send + Sync {
    fn list_checkpoints(&self, domain: &str) -> Result<Vec<String>>;
    fn create_checkpoint(&self, domain: &str, name: &str, parent: Option<&str>) -> Result<()>;
    fn redefine_checkpoint(&self, domain: &str, name: &str) -> Result<()>;
    fn delete_checkpoint(&self, domain: &str, name: &str) -> Result<()>;
    fn fsfreeze(&self, domain: &str) -> Result<()>;
    fn fsthaw(&self, domain: &str) -> Result<()>;
}

/// A [`BlockDevice`] backed by a plain file, generalized from the teacher's
/// memory-mapped `VmdkReader` to support writes and zero-fills as well as
/// reads.
pub struct FileBlockDevice {
    file: Mutex<File>,
    path: PathBuf,
    size: u64,
    max_request_size: u64,
}

impl FileBlockDevice {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path))?;
        let size = file.metadata().map_err(|e| Error::io(e, &path))?.len();
        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            max_request_size: 32 * 1024 * 1024,
        })
    }

    pub fn create(path: impl Into<PathBuf>, size: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path))?;
        file.set_len(size).map_err(|e| Error::io(e, &path))?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            max_request_size: 32 * 1024 * 1024,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        // Memory-mapped per-request reads, generalized from the teacher's
        // whole-file `VmdkReader` mmap to a bounded window matching
        // whatever range this request covers, since the underlying file
        // may be concurrently written by other requests.
        let file = self.file.lock().expect("file lock poisoned");
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(&*file)
                .map_err(|e| Error::io(e, &self.path))?
        };
        Ok(mmap.to_vec())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().expect("file lock poisoned");
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io(e, &self.path))?;
        file.write_all(data).map_err(|e| Error::io(e, &self.path))
    }

    fn zero_at(&self, offset: u64, len: u64) -> Result<()> {
        let zeros = vec![0u8; len as usize];
        self.write_at(offset, &zeros)
    }

    fn extents(&self, _dirty_bitmap: Option<&str>) -> Result<Vec<Extent>> {
        Ok(vec![Extent {
            offset: 0,
            length: self.size,
            data: true,
        }])
    }

    fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    fn virtual_size(&self) -> u64 {
        self.size
    }
}

/// An in-memory [`HostControl`] double used in tests and by callers that
/// manage checkpoints entirely through this tool's own chain file.
#[derive(Default)]
pub struct StubHostControl {
    checkpoints: Mutex<HashMap<String, Vec<String>>>,
}

impl StubHostControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostControl for StubHostControl {
    fn list_checkpoints(&self, domain: &str) -> Result<Vec<String>> {
        Ok(self
            .checkpoints
            .lock()
            .expect("lock poisoned")
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    fn create_checkpoint(&self, domain: &str, name: &str, _parent: Option<&str>) -> Result<()> {
        self.checkpoints
            .lock()
            .expect("lock poisoned")
            .entry(domain.to_string())
            .or_default()
            .push(name.to_string());
        Ok(())
    }

    fn redefine_checkpoint(&self, _domain: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    fn delete_checkpoint(&self, domain: &str, name: &str) -> Result<()> {
        if let Some(list) = self.checkpoints.lock().expect("lock poisoned").get_mut(domain) {
            list.retain(|n| n != name);
        }
        Ok(())
    }

    fn fsfreeze(&self, _domain: &str) -> Result<()> {
        Ok(())
    }

    fn fsthaw(&self, _domain: &str) -> Result<()> {
        Ok(())
    }
}

/// Checks whether `path` names an existing `.partial` file left over from
/// an interrupted backup, per the ownership/lifecycle rule that such files
/// block any new backup of the same disk until resolved.
pub fn check_no_partial(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::PartialBackupPresent(path.to_path_buf()));
    }
    Ok(())
}
