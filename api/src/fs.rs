//! Trait surface shared by the filesystem layers: block access, inode
//! access, inode read/write, and directory entries.
//!
//! Each layer builds on the one below it (`BlockSupport: FileSysSupport`,
//! `InodeSupport: BlockSupport`, and so on), so a type implementing
//! `DirectorySupport` automatically has the full stack available. The
//! namei-specific operations (path resolution, `mkdir`/`unlink`/`rename`,
//! symlink following) are not part of this trait surface — they are
//! concrete methods on `namei_core`'s `PathFs`, built on top of
//! `DirectorySupport`, since they are specific to exactly one filesystem
//! implementation rather than a shape other filesystems would want to swap in.

use super::{
    controller::Device,
    types::{Block, Buffer, DirEntry, FType, InodeLike, SuperBlock},
};
use std::{error, path::Path};

/// General trait each filesystem layer implements, used to set up, tear down
/// and load file systems.
///
/// Also defines the error type used across all the other traits. This trait
/// is implemented anew (not blanket-reused) at each layer: e.g. the block
/// layer's `mkfs` must not create a root inode, since that notion does not
/// exist yet at that layer, while the directory layer's `mkfs` must.
pub trait FileSysSupport: Sized {
    /// The error type of this layer.
    type Error: error::Error;

    /// Check if a given superblock represents a valid file system:
    /// - the regions appear in the right order
    /// - the regions are large enough to hold `ninodes` inodes and
    ///   `ndatablocks` data blocks
    /// - the regions fit within the first `nblocks` blocks of the disk
    fn sb_valid(sb: &SuperBlock) -> bool;

    /// Create and mount a new file system from scratch, given a superblock
    /// and a path to back it with. Always:
    /// - checks that `sb` is valid
    /// - creates a new `Device` at the given path
    ///
    /// Layers beneath the inode layer stop there; from the inode layer up,
    /// this additionally initializes every inode as free, and from the
    /// directory layer up, initializes inode 1 as an empty root directory
    /// with `nlink` set to 1 (so it is never deallocated).
    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error>;

    /// Given an existing `Device`, check that its image corresponds to a
    /// valid file system (valid superblock; superblock and device geometry
    /// agree), and if so wrap it and return it.
    fn mountfs(dev: Device) -> Result<Self, Self::Error>;

    /// Unmount the given file system, consuming it and returning the
    /// `Device` backing it.
    fn unmountfs(self) -> Device;
}

/// Adds block-level operations on top of `FileSysSupport`.
pub trait BlockSupport: FileSysSupport {
    /// Read the *n*th block of the entire disk.
    fn b_get(&self, i: u64) -> Result<Block, Self::Error>;

    /// Write the *n*th block of the entire disk.
    fn b_put(&mut self, b: &Block) -> Result<(), Self::Error>;

    /// Free the *i*th block of the data region, by clearing the *i*th bit
    /// of the free bitmap. Bits within a byte are numbered right to left
    /// (bit 0 is the least-significant bit).
    /// Errors if the block is already free, or if `i` is out of bounds.
    fn b_free(&mut self, i: u64) -> Result<(), Self::Error>;

    /// Zero the *i*th block of the data region in place, without freeing it.
    /// Errors if `i` is out of bounds.
    fn b_zero(&mut self, i: u64) -> Result<(), Self::Error>;

    /// Allocate the first free block of the data region (lowest index),
    /// mark its bitmap bit and zero its contents. Returns the index of the
    /// newly allocated block, within the data region.
    /// Errors if no blocks are available.
    fn b_alloc(&mut self) -> Result<u64, Self::Error>;

    /// Get the superblock describing the current file system.
    fn sup_get(&self) -> Result<SuperBlock, Self::Error>;

    /// Write the superblock back to disk (and cache it, if applicable).
    fn sup_put(&mut self, sup: &SuperBlock) -> Result<(), Self::Error>;
}

/// Adds the abstraction of inodes.
pub trait InodeSupport: BlockSupport {
    /// In-memory inode type used by this layer.
    type Inode: InodeLike;

    /// Read the disk inode with index `i` and wrap it into an inode object.
    /// Errors if `i` is greater than the number of inodes in the system.
    fn i_get(&self, i: u64) -> Result<Self::Inode, Self::Error>;

    /// Write the given inode back to disk at the correct position.
    fn i_put(&mut self, ino: &Self::Inode) -> Result<(), Self::Error>;

    /// Free inode `i` if it is no longer referenced anywhere (`nlink == 0`):
    /// sets its `ft` to `TFree` and releases every block it lists. Does
    /// nothing if `nlink != 0`. Errors if `i` is out of range or already free.
    fn i_free(&mut self, i: u64) -> Result<(), Self::Error>;

    /// Allocate the lowest-numbered free inode, set its `ft` to `ft`, and
    /// reset its `size`/`nlink` to 0. Inode 0 is never allocated.
    /// Errors if no inodes are available.
    fn i_alloc(&mut self, ft: FType) -> Result<u64, Self::Error>;

    /// Release all of `inode`'s data blocks (without freeing the inode
    /// itself): points every `direct_blocks` entry within `size` back at 0
    /// and sets `size` to 0. Updates both the in-memory `inode` and its
    /// on-disk copy.
    fn i_trunc(&mut self, inode: &mut Self::Inode) -> Result<(), Self::Error>;
}

/// Adds buffer-based reads and writes through an inode.
pub trait InodeRWSupport: InodeSupport {
    /// Read up to `n` bytes from `inode` into `buf`, starting at byte
    /// offset `off`. Stops early at end of file. A read starting exactly at
    /// `inode.get_size()` reads 0 bytes; starting further out is an error.
    /// If `buf` cannot hold `n` bytes, reads only as many as fit.
    fn i_read(
        &self,
        inode: &Self::Inode,
        buf: &mut Buffer,
        off: u64,
        n: u64,
    ) -> Result<u64, Self::Error>;

    /// Write `n` bytes from `buf` into `inode`, starting at byte offset
    /// `off`, allocating new blocks as needed to grow the file past its
    /// current size. Writes starting exactly at `inode.get_size()` are
    /// allowed (appends); starting further out is an error. Persists the
    /// inode if it changed. Errors without writing anything if `buf`
    /// cannot hold `n` bytes, or if the write would exceed the maximum
    /// possible inode size.
    fn i_write(
        &mut self,
        inode: &mut Self::Inode,
        buf: &Buffer,
        off: u64,
        n: u64,
    ) -> Result<(), Self::Error>;
}

/// Adds the abstraction of directories and their entries.
///
/// `i_free` is unsafe to call directly on a directory inode: freeing it
/// while entries still name it would leave those entries dangling. Higher
/// layers never call `i_free` on a directory directly, routing through
/// wrapper operations (`mkdir`/`unlink`/`rmdir`) that check the necessary
/// preconditions first. The standard `.`/`..` entries present in every
/// directory but the root's special self-referential `..` are likewise the
/// responsibility of the higher layer.
pub trait DirectorySupport: InodeSupport {
    /// Create a new directory entry for `inum`/`name`. Returns `None` if the
    /// name is invalid.
    fn new_de(inum: u64, name: &str) -> Option<DirEntry>;

    /// Get the name of a directory entry as a `String`, stopping at the
    /// first `'\0'` or the end of the name array.
    fn get_name_str(de: &DirEntry) -> String;

    /// Set the name of `de`, if `name` is non-empty, consists only of
    /// alphanumeric characters (or is exactly "." or ".."), and fits within
    /// `DIRNAME_SIZE`. Pads with `'\0'` if shorter. Returns `None` on an
    /// invalid name.
    fn set_name_str(de: &mut DirEntry, name: &str) -> Option<()>;

    /// Look for an entry named `name` within `inode` (which must already be
    /// up to date with disk), restricted to the region covered by
    /// `inode.get_size()`. Returns the referenced inode and the byte offset
    /// the entry was found at. Errors if `inode` is not a directory, or if
    /// the entry is not found.
    fn dirlookup(&self, inode: &Self::Inode, name: &str)
        -> Result<(Self::Inode, u64), Self::Error>;

    /// Write a new entry `(name, inum)` into `inode` (which must already be
    /// up to date with disk), reusing a free slot if one exists or
    /// appending (and growing `inode` if needed) otherwise. Bumps the
    /// target inode's `nlink` by 1, unless `inum` equals `inode`'s own
    /// number (a self-reference, e.g. "."). Returns the byte offset the
    /// entry was written at.
    /// Errors, and does nothing, if `name` is invalid or already present,
    /// if `inode` is not a directory, or if the inode `inum` refers to is
    /// not currently in use.
    fn dirlink(
        &mut self,
        inode: &mut Self::Inode,
        name: &str,
        inum: u64,
    ) -> Result<u64, Self::Error>;
}
