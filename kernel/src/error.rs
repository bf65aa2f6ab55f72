// Storage Errors
//
// Every failure the engine can surface to a caller. Incomplete frames
// at the end of a segment are not errors; they end a read early.

use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error while {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt index {}: {line}", path.display())]
    CorruptIndex { path: PathBuf, line: String },

    #[error("offset {offset} out of order for segment {base_offset} (last offset {last_offset:?})")]
    OffsetOutOfOrder {
        offset: u64,
        base_offset: u64,
        last_offset: Option<u64>,
    },

    #[error("payload of {size} bytes exceeds max {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("log is closed")]
    Closed,
}

impl StorageError {
    /// Wraps an I/O error with the operation and file it happened on.
    pub fn io(op: &'static str, path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { op, path, source }
    }

    /// True for errors caused by unreadable on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptIndex { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_operation_and_path() {
        let wrap = StorageError::io("opening", "/data/segment-00000000000000000000.log");
        let err = wrap(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));

        let msg = err.to_string();
        assert!(msg.contains("opening"));
        assert!(msg.contains("segment-00000000000000000000.log"));
        assert!(msg.contains("denied"));
        assert!(!err.is_corruption());
    }

    #[test]
    fn corrupt_index_is_corruption() {
        let err = StorageError::CorruptIndex {
            path: PathBuf::from("segment.idx"),
            line: "garbage".into(),
        };
        assert!(err.is_corruption());
    }
}
