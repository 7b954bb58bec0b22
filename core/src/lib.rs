//! A Minix-like filesystem core built around a Unix-style pathname resolver.
//!
//! The crate is layered bottom-up, each layer implementing one more trait
//! from [`namei_api::fs`] on top of the one beneath it:
//!
//! - [`block_layer`]: raw block (de)allocation over a bitmap.
//! - [`inode_layer`]: inode allocation and direct-block-backed reads/writes.
//! - [`indirect`]: an alternative inode representation that adds one level
//!   of indirection, for files larger than the direct block budget.
//! - [`dir_layer`]: directory entry scanning and linking on top of inodes.
//! - [`path`]: [`path::PathFs`], the namei path-resolution engine (open,
//!   mkdir, unlink, rename, symlink, ...) built on the directory layer.
//! - [`cache`]: a shared, mutable inode cache that can front the inode
//!   layer instead of handing out independent owned copies.
//!
//! [`error`] collects one error enum per layer, each wrapping the layer
//! beneath it so a single `?` threads failures from a raw disk read all the
//! way up to a `rename` call.

#![deny(missing_docs)]

pub mod block_layer;
pub mod cache;
pub mod dir_layer;
pub mod error;
pub mod indirect;
pub mod inode_layer;
pub mod path;

#[cfg(test)]
mod test_support;
