//! Error taxonomy shared by every filesystem operation.

use rm_cloud::CloudError;
use thiserror::Error;

use crate::render::RenderError;

/// Errors surfaced to filesystem callers.
#[derive(Debug, Error)]
pub enum FsError {
    /// `ENOENT`.
    #[error("no such file or directory")]
    NotFound,

    /// `EINVAL`, with the reason.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `EPERM`.
    #[error("operation not permitted")]
    PermissionDenied,

    /// `EOPNOTSUPP`: an upload that is neither PDF nor EPUB.
    #[error("only PDF and EPUB files can be uploaded")]
    UnsupportedContentType,

    /// `EIO`: the store failed.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(#[from] CloudError),

    /// `EIO`: the renderer failed.
    #[error("rendering failed: {0}")]
    RenderFailure(#[from] RenderError),

    /// `ENODATA`: a read beyond the materialized end.
    #[error("no data available past the end of the file")]
    NoDataAvailable,

    /// `EEXIST`.
    #[error("file exists")]
    AlreadyExists,

    /// `ENOTDIR`.
    #[error("not a directory")]
    NotADirectory,

    /// `EISDIR`.
    #[error("is a directory")]
    IsADirectory,

    /// `ENOTEMPTY`.
    #[error("directory not empty")]
    NotEmpty,

    /// `EBADF`.
    #[error("file not open")]
    BadFileHandle,

    /// `EFBIG`: a pending upload would grow past the upload limit.
    #[error("file too large to upload")]
    FileTooLarge,
}

impl FsError {
    /// The errno to hand back to the kernel.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::PermissionDenied => libc::EPERM,
            Self::UnsupportedContentType => libc::EOPNOTSUPP,
            Self::RemoteUnavailable(_) | Self::RenderFailure(_) => libc::EIO,
            Self::NoDataAvailable => libc::ENODATA,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::BadFileHandle => libc::EBADF,
            Self::FileTooLarge => libc::EFBIG,
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.to_errno()
    }
}
