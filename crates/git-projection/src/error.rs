use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid index file: {0}")]
    Format(String),

    #[error("Unexpected end of index stream after {offset} bytes")]
    UnexpectedEof { offset: u64 },

    #[error("Projection tree corrupt: {0}")]
    Corrupt(String),

    #[error("Index file missing: {0}")]
    IndexMissing(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Blob sizes unavailable: {0}")]
    SizesUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Projection engine is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, ProjectionError>;

impl ProjectionError {
    /// Returns true for failures that clear up on their own, such as git
    /// holding the index open or a permission race while a file is replaced.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(error) => is_transient_io(error),
            Self::IndexMissing(_) | Self::UnexpectedEof { .. } => true,
            _ => false,
        }
    }
}

/// Windows reports a file held open by another writer as a sharing violation.
const ERROR_SHARING_VIOLATION: i32 = 32;
const ERROR_LOCK_VIOLATION: i32 = 33;

fn is_transient_io(error: &io::Error) -> bool {
    if matches!(
        error.raw_os_error(),
        Some(ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION)
    ) && cfg!(windows)
    {
        return true;
    }
    matches!(
        error.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

pub(crate) fn format_error(message: impl Into<String>) -> ProjectionError {
    ProjectionError::Format(message.into())
}
