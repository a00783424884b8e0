//! Error types for the sparsebak core library.

use std::path::PathBuf;

/// The main error type for sparsebak operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A frame or stream did not match the sparse-stream wire format.
    #[error("stream format error: {message}")]
    StreamFormat { message: String },

    /// The sum of a stream's applied `DATA` frame lengths didn't match the
    /// `data_size` recorded in its metadata header — the stream is
    /// truncated or corrupt.
    #[error("restore size mismatch: expected {expected} bytes, got {actual} bytes")]
    RestoreSizeMismatch { expected: u64, actual: u64 },

    /// The restore chain walker reached the `--until` checkpoint. Not a
    /// failure; callers treat this as a normal stopping point.
    #[error("reached checkpoint '{0}'")]
    UntilCheckpointReached(String),

    /// A checkpoint present on the host was not created by this tool.
    #[error("checkpoint '{0}' was not created by this tool")]
    ForeignCheckpoint(String),

    /// An operation that requires an existing checkpoint chain found none.
    #[error("no checkpoints found for domain '{0}'")]
    NoCheckpoints(String),

    /// A `.partial` file from an interrupted backup is present and must be
    /// resolved before continuing.
    #[error("partial backup file present: {0}")]
    PartialBackupPresent(PathBuf),

    /// Redefining (renaming) a checkpoint on the host failed.
    #[error("failed to redefine checkpoint '{name}': {message}")]
    RedefineCheckpoint { name: String, message: String },

    /// Could not establish or maintain an NBD connection.
    #[error("NBD connection error: {message}")]
    NbdConnect { message: String },

    /// The virtualization host control plane reported an error.
    #[error("host control error: {message}")]
    HostControl { message: String },

    /// A compressed sparse stream cannot be served by the instant-recovery mapper.
    #[error("compressed streams cannot be mapped for instant recovery")]
    CompressionUnsupportedForMapping,

    /// The mapper received a read request that spans more than one block.
    #[error("read request [{offset}, {offset}+{length}) spans more than one mapped block")]
    UnexpectedBlockRange { offset: u64, length: u64 },

    /// Error parsing or serializing the checkpoint chain file.
    #[error("checkpoint chain error: {message}")]
    Checkpoint { message: String },

    /// Error loading or parsing a configuration file.
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// A specialized Result type for sparsebak operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    pub fn stream_format(message: impl Into<String>) -> Self {
        Self::StreamFormat {
            message: message.into(),
        }
    }

    pub fn redefine_checkpoint(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RedefineCheckpoint {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn nbd_connect(message: impl Into<String>) -> Self {
        Self::NbdConnect {
            message: message.into(),
        }
    }

    pub fn host_control(message: impl Into<String>) -> Self {
        Self::HostControl {
            message: message.into(),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Exit codes follow the CLI contract: 1 for ordinary failures, 2 is
    /// reserved for "succeeded with warnings" and is never returned here.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/dev/sparsebak/disk.img");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/dev/sparsebak/disk.img"));
    }

    #[test]
    fn io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        assert!(!err.to_string().contains("at '"));
    }

    #[test]
    fn stream_format_message() {
        let err = Error::stream_format("bad frame kind 'XX'");
        assert!(err.to_string().contains("bad frame kind"));
    }

    #[test]
    fn restore_size_mismatch_reports_both_sizes() {
        let err = Error::RestoreSizeMismatch {
            expected: 100,
            actual: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
