//! On-disk and in-memory types, the block device controller, and the trait
//! surface that the `namei_core` layers build on.
//!
//! Kept free of any namei-specific logic on purpose: everything path- and
//! directory-resolution related lives in `namei_core`, layered on top of the
//! block/inode/directory traits defined here.

#![deny(missing_docs)]

/// Block device controller.
pub mod controller;
/// Base error type for the controller and type layer.
pub mod error;

/// Core on-disk and in-memory types.
pub mod types;

/// Trait surface implemented by the filesystem layers in `namei_core`.
pub mod fs;
