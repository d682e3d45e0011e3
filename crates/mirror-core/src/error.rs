//! Error types reported by block-storage backends.

use thiserror::Error;

/// Errno-style status codes.
///
/// The replayer records its terminal status as an `(error_code, description)`
/// pair so that it is directly comparable with what the cluster client
/// reports. Codes are negative; `0` is reserved for terminal-success reasons
/// such as "remote image demoted".
pub mod code {
    /// Requested entity does not exist.
    pub const ENOENT: i32 = -2;
    /// Generic I/O failure.
    pub const EIO: i32 = -5;
    /// Entity already exists (also used as the "not implemented" sentinel of
    /// the replay-status placeholder).
    pub const EEXIST: i32 = -17;
    /// Invalid argument or protocol violation.
    pub const EINVAL: i32 = -22;
}

/// Error raised by image and deep-copy operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl ImageError {
    /// Errno-style code for this error.
    pub fn code(&self) -> i32 {
        match self {
            ImageError::NotFound => code::ENOENT,
            ImageError::Exists => code::EEXIST,
            ImageError::InvalidArgument(_) => code::EINVAL,
            ImageError::Io(_) => code::EIO,
        }
    }
}

pub type ImageResult<T> = Result<T, ImageError>;
