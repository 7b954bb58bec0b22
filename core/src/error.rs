//! Layered error types, one per filesystem layer, each wrapping the layer
//! beneath it via `#[from]` so that `?` threads a failure from a raw disk
//! read all the way up to a `rename` call without manual matching anywhere
//! in between.

use namei_api::error::ApiError;
use thiserror::Error;

/// Errors from the block layer (`BlockLayerFs`).
#[derive(Error, Debug)]
pub enum BlockLayerError {
    /// Error from the underlying API/controller layer.
    #[error("API error in the block layer")]
    ApiError(#[from] ApiError),
    /// Invalid input to a block-layer operation.
    #[error("invalid block layer input: {0}")]
    BlockLayerInput(&'static str),
    /// A block-layer operation could not complete (e.g. no free blocks left).
    #[error("block layer operation failed: {0}")]
    BlockLayerOp(&'static str),
}

/// Errors from the inode layer (`InodeLayerFs`).
#[derive(Error, Debug)]
pub enum InodeLayerError {
    /// Error from the block layer beneath.
    #[error("block layer error")]
    BlockLayerError(#[from] BlockLayerError),
    /// Error from a direct buffer (de)serialization call at this layer.
    #[error("API error in the inode layer")]
    ApiError(#[from] ApiError),
    /// Invalid input to an inode-layer operation.
    #[error("invalid inode layer input: {0}")]
    InodeLayerInput(&'static str),
    /// An inode-layer operation could not complete (e.g. no free inodes left).
    #[error("inode layer operation failed: {0}")]
    InodeLayerOp(&'static str),
}

/// Errors from the directory layer (`DirLayerFs`).
#[derive(Error, Debug)]
pub enum DirLayerError {
    /// Error from the inode layer beneath.
    #[error("inode layer error")]
    InodeLayerError(#[from] InodeLayerError),
    /// Error from a direct buffer (de)serialization call at this layer.
    #[error("API error in the directory layer")]
    ApiError(#[from] ApiError),
    /// Invalid input to a directory-layer operation.
    #[error("invalid directory layer input: {0}")]
    DirLayerInput(&'static str),
    /// A directory-layer operation could not complete.
    #[error("directory layer operation failed: {0}")]
    DirLayerOp(&'static str),
}

/// Errors from the namei path-resolution engine (`PathFs`), the richest
/// layer: it carries the classic namei failure kinds in addition to
/// wrapping whatever the directory layer reports.
#[derive(Error, Debug)]
pub enum PathLayerError {
    /// Error from the directory layer beneath.
    #[error("directory layer error")]
    DirLayerError(#[from] DirLayerError),
    /// Error from a direct buffer (de)serialization call at this layer.
    #[error("API error in the path layer")]
    ApiError(#[from] ApiError),
    /// No such file or directory (`ENOENT`).
    #[error("no such file or directory: {0}")]
    NoEntry(String),
    /// The target of a creating operation already exists (`EEXIST`).
    #[error("already exists: {0}")]
    Exists(String),
    /// Operation not permitted given ownership/mode (`EPERM`).
    #[error("operation not permitted: {0}")]
    Permission(String),
    /// Access denied by the permission bits (`EACCES`).
    #[error("access denied: {0}")]
    Access(String),
    /// Expected a non-directory but found one (`EISDIR`).
    #[error("is a directory: {0}")]
    IsDir(String),
    /// Expected a directory but found something else (`ENOTDIR`).
    #[error("not a directory: {0}")]
    NotDir(String),
    /// A directory to be removed/renamed-over was not empty (`ENOTEMPTY`).
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    /// No space left to complete the operation (`ENOSPC`).
    #[error("no space left on device")]
    NoSpace,
    /// Rename attempted across devices/mounts (`EXDEV`).
    #[error("cross-device link: {0}")]
    CrossDevice(String),
    /// The path was syntactically invalid.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Too many symbolic links were followed while resolving a path (`ELOOP`).
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),
    /// The rename lock was held by another logical operation and the caller
    /// must restart path resolution from scratch, mirroring the original
    /// kernel's `-ERESTARTNOINTR` retry protocol around `do_rename`.
    #[error("operation must be restarted")]
    RestartRequired,
}

/// Shorthand `Result` alias used throughout `namei_core`.
pub type Result<T> = std::result::Result<T, PathLayerError>;
