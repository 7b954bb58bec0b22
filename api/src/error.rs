//! The error type used by the lowest layer of the API: the block device
//! controller and the raw `Block`/`Buffer` types.
//!
//! Higher layers (in `namei_core`) wrap this error in their own, layered
//! error types via `thiserror`'s `#[from]`, so that `?` threads a failure
//! all the way from a disk read up to a `rename` call without any manual
//! matching in between.

use std::io;
use thiserror::Error;

/// Error type used in the API's controller and type layer.
#[derive(Error, Debug)]
pub enum ApiError {
    /// I/O failure performed by the controller (file open/mmap/flush).
    #[error("I/O error in the controller layer")]
    Io(#[from] io::Error),
    /// (De)serialization failure while reading or writing a block.
    #[error("serialization error in the controller layer")]
    Serialize(#[from] bincode::Error),
    /// Invalid input to the controller layer (bad device geometry, etc).
    #[error("invalid controller input: {0}")]
    ControllerInput(&'static str),
    /// Invalid input to a block or buffer (out-of-bounds read/write).
    #[error("invalid block input: {0}")]
    BlockInput(&'static str),
    /// Catch-all for anything that does not need to be matched on.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand `Result` alias used throughout the API crate.
pub type Result<T> = std::result::Result<T, ApiError>;
