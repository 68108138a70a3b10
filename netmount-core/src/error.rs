//! Error types for the NetMount server core.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::dos;

/// Errors raised by the filesystem adapter and the drive/handle table.
///
/// Every variant maps to a DOS extended error code via [`FsError::dos_code`];
/// the dispatcher is the only place that conversion happens.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("access denied: {}", .0.display())]
    AccessDenied(PathBuf),

    #[error("drive is shared read-only")]
    ReadOnlyDrive,

    #[error("invalid handle: {0}")]
    InvalidHandle(u16),

    #[error("write fault on \"{}\": {source}", path.display())]
    WriteFault {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} \"{}\": {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Wraps a host I/O error, classifying the common kinds.
    pub fn from_io(op: &'static str, path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => FsError::FileNotFound(path),
            io::ErrorKind::PermissionDenied => FsError::AccessDenied(path),
            _ => FsError::Io { op, path, source },
        }
    }

    /// The DOS extended error code reported in the reply `AX` field.
    pub fn dos_code(&self) -> u16 {
        match self {
            FsError::FileNotFound(_) => dos::ERR_FILE_NOT_FOUND,
            FsError::PathNotFound(_) => dos::ERR_PATH_NOT_FOUND,
            FsError::AccessDenied(_) | FsError::ReadOnlyDrive => dos::ERR_ACCESS_DENIED,
            FsError::InvalidHandle(_) => dos::ERR_FILE_NOT_FOUND,
            FsError::WriteFault { .. } => dos::ERR_WRITE_FAULT,
            FsError::Io { .. } => dos::ERR_ACCESS_DENIED,
        }
    }
}

/// Result type for filesystem adapter operations.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let err = FsError::from_io(
            "open",
            PathBuf::from("/nope"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(matches!(err, FsError::FileNotFound(_)));
        assert_eq!(err.dos_code(), dos::ERR_FILE_NOT_FOUND);

        let err = FsError::from_io(
            "open",
            PathBuf::from("/secret"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.dos_code(), dos::ERR_ACCESS_DENIED);
    }

    #[test]
    fn test_read_only_share_is_access_denied() {
        assert_eq!(FsError::ReadOnlyDrive.dos_code(), dos::ERR_ACCESS_DENIED);
    }
}
