//! Core on-disk and in-memory types: buffers, blocks, the superblock, inodes
//! and directory entries.
//!
//! The on-disk layout mirrors a classic Minix-like filesystem:
//!
//! \[super block | inode blocks | free bit map | data blocks\]

use super::error;
use super::error::ApiError;
use lazy_static::lazy_static;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::prelude::*;
use std::io::{Cursor, SeekFrom};

/// Buffer abstraction, representing some data on the heap.
/// Buffers can have any size, and are used to build file system `Block`s, and
/// as scratch space for reading and writing through an inode.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    /// Contents of the buffer, represented as a boxed slice so its length
    /// never changes once allocated.
    contents: Box<[u8]>,
}

impl Buffer {
    /// Create a new buffer, having the given `data` slice as its data
    pub fn new(data: Box<[u8]>) -> Buffer {
        Buffer { contents: data }
    }

    /// Create an all-zero buffer, with contents length of `len`
    pub fn new_zero(len: u64) -> Buffer {
        Buffer {
            contents: vec![0; len as usize].into_boxed_slice(),
        }
    }

    /// Size of the underlying buffer data
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    /// True if the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Return a reference to this buffer's contents
    pub fn contents_as_ref(&self) -> &[u8] {
        &self.contents
    }

    /// Return a mutable reference to this buffer's contents
    pub fn contents_as_mut(&mut self) -> &mut [u8] {
        &mut self.contents
    }

    /// Reads data from the given buffer into the `data` buffer, starting at the given `offset`.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> error::Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::BlockInput(
                "trying to read beyond the bounds of the buffer",
            ));
        }

        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        c.read_exact(data).map_err(|e| e.into())
    }

    /// Writes data from the given slice into the buffer, starting at the given `offset`.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> error::Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::BlockInput(
                "trying to write beyond the bounds of the buffer",
            ));
        }

        let mut c = Cursor::new(&mut self.contents[..]);
        c.seek(SeekFrom::Start(offset))?;
        c.write_all(data).map_err(|e| e.into())
    }

    /// Read any object that implements `DeserializeOwned` from this buffer.
    pub fn deserialize_from<S>(&self, offset: u64) -> error::Result<S>
    where
        S: DeserializeOwned,
    {
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        Ok(bincode::deserialize_from(c)?)
    }

    /// Write any object that implements `Serialize` into this buffer.
    /// Goes through `write_data` so that bounds errors get triggered.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> error::Result<()>
    where
        S: Serialize,
    {
        let stru_bin = bincode::serialize(stru)?;
        self.write_data(&stru_bin, offset)
    }
}

/// Block abstraction, representing a block of data read from the disk.
/// Provides basic methods to read and write data and (de)serialize
/// structures to and from a block. The basic unit read and written by the
/// device controller.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    /// Index of this block on disk.
    pub block_no: u64,
    /// Contents of the block. The block relays all its method implementations to this buffer.
    buf: Buffer,
}

impl Block {
    /// Create a new block, corresponding to block `block_no` on disk, having the given `data` slice as its data
    pub fn new(block_no: u64, data: Box<[u8]>) -> Block {
        Block {
            block_no,
            buf: Buffer::new(data),
        }
    }

    /// Create an all-zero block, with contents length of `len`
    pub fn new_zero(block_no: u64, len: u64) -> Block {
        Block {
            block_no,
            buf: Buffer::new_zero(len),
        }
    }
    /// Size of the underlying block data
    pub fn len(&self) -> u64 {
        self.buf.len()
    }

    /// True if the block holds no bytes
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Return a reference to this block's contents
    pub fn contents_as_ref(&self) -> &[u8] {
        self.buf.contents_as_ref()
    }

    /// Return a mutable reference to this block's contents
    pub fn contents_as_mut(&mut self) -> &mut [u8] {
        self.buf.contents_as_mut()
    }

    /// Reads data from the given block into the `data` buffer, starting at the given `offset`.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> error::Result<()> {
        self.buf.read_data(data, offset)
    }

    /// Writes data from the given slice into the block, starting at the given `offset`.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> error::Result<()> {
        self.buf.write_data(data, offset)
    }

    /// Read any object that implements `DeserializeOwned` from this block.
    pub fn deserialize_from<S>(&self, offset: u64) -> error::Result<S>
    where
        S: DeserializeOwned,
    {
        self.buf.deserialize_from(offset)
    }

    /// Write any object that implements `Serialize` into this block.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> error::Result<()>
    where
        S: Serialize,
    {
        self.buf.serialize_into(stru, offset)
    }
}

/// Structure representing all file system metadata, and hence the file system's structure.
/// Must fit within a single disk block.
///
/// The layout of the file system is as follows:
///     \[super block | inode blocks | free bit map | data blocks\]
/// , where each component has the following meaning:
///
/// 1. *super block*: aggregates all the file system metadata including the sizes of all
///    subsequent regions. First block read when loading an existing file system, and the
///    first block written when initializing a new one.
/// 2. *inode blocks*: a sequence of blocks containing all the inode metadata, starting from
///    inode 1 (the root directory).
/// 3. *free bit map*: a sequence of blocks tracking the allocation state of the data block region.
/// 4. *data blocks*: file and directory contents.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// Size of the blocks in the current file system, in bytes.
    pub block_size: u64,
    /// Number of blocks in the entire file system, including this block and the 3 other regions.
    pub nblocks: u64,
    /// Number of inodes tracked by the inode region.
    pub ninodes: u64,
    /// The block index of the first block of inodes.
    pub inodestart: u64,
    /// Number of data blocks tracked by the bitmap region.
    pub ndatablocks: u64,
    /// The block index of the first block of the free bit map region.
    pub bmapstart: u64,
    /// The block index of the first block of the data blocks region.
    pub datastart: u64,
}

lazy_static! {
    /// Size the superblock takes up on disk, in bytes. Computed at runtime
    /// since bincode's framing overhead is not a compile-time constant.
    pub static ref SUPERBLOCK_SIZE : u64 = bincode::serialize(&SuperBlock::default()).unwrap().len() as u64;
}

/// Hard-coded number of direct data blocks each inode points to.
pub const DIRECT_POINTERS: u64 = 12;

/// File type tag stored in an inode.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
pub enum FType {
    /// Directory file type.
    TDir,
    /// Regular file type.
    TFile,
    /// Symbolic link; its first data block holds the link target bytes.
    TLnk,
    /// Character-special device; `direct_blocks[0]` holds the device id.
    TChr,
    /// Block-special device; `direct_blocks[0]` holds the device id.
    TBlk,
    /// Free inode, available for allocation.
    TFree,
}
impl Default for FType {
    fn default() -> FType {
        FType::TFree
    }
}

impl FType {
    /// True for the two device-special types, which store a device id in
    /// `direct_blocks[0]` rather than a data block address.
    pub fn is_device(self) -> bool {
        matches!(self, FType::TChr | FType::TBlk)
    }
}

bitflags::bitflags! {
    /// Permission and special-execution bits of an inode's mode, independent
    /// of its `FType`. Modeled as a typed bit set carrying just the rwx
    /// triples plus setuid/setgid/sticky, mirroring the low 12 bits of a
    /// POSIX `st_mode` (the type nibble stays in `FType` instead of being
    /// packed into the same integer).
    #[derive(Default, Serialize, Deserialize)]
    pub struct Mode: u16 {
        /// Owner execute bit.
        const OWNER_X = 0o100;
        /// Owner write bit.
        const OWNER_W = 0o200;
        /// Owner read bit.
        const OWNER_R = 0o400;
        /// Group execute bit.
        const GROUP_X = 0o010;
        /// Group write bit.
        const GROUP_W = 0o020;
        /// Group read bit.
        const GROUP_R = 0o040;
        /// Other execute bit.
        const OTHER_X = 0o001;
        /// Other write bit.
        const OTHER_W = 0o002;
        /// Other read bit.
        const OTHER_R = 0o004;
        /// Set-user-id on execution.
        const SETUID = 0o4000;
        /// Set-group-id on execution.
        const SETGID = 0o2000;
        /// Sticky bit (restricted deletion flag on directories).
        const STICKY = 0o1000;
    }
}

impl Mode {
    /// Build a `Mode` from the low 12 bits of a raw permission value, e.g.
    /// `Mode::from_perm_bits(0o755)`. Bits outside the low 12 are discarded.
    pub fn from_perm_bits(bits: u16) -> Mode {
        Mode::from_bits_truncate(bits & 0o7777)
    }

    /// Selects the owner, group or other rwx triple, matching the
    /// owner/group/other selection policy of the permission check.
    pub fn triple_for(self, is_owner: bool, in_group: bool) -> u8 {
        let raw = self.bits();
        if is_owner {
            ((raw >> 6) & 0o7) as u8
        } else if in_group {
            ((raw >> 3) & 0o7) as u8
        } else {
            (raw & 0o7) as u8
        }
    }
}

/// Struct describing data held by an inode on the disk.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct DInode {
    /// Registers the file type.
    pub ft: FType,
    /// Permission bits plus setuid/setgid/sticky.
    pub mode: Mode,
    /// Owning user id.
    pub uid: u16,
    /// Owning group id.
    pub gid: u16,
    /// Counts the number of directory entries naming this inode. When an
    /// inode reaches an nlink of 0 and is no longer open anywhere, it is
    /// freed (its file type reset to `TFree`).
    pub nlink: u16,
    /// Size in bytes. For directories, the number of bytes spanned by the
    /// entry slots (used and free) rather than the number of used entries.
    pub size: u64,
    /// Last access time, seconds since the epoch.
    pub atime: u32,
    /// Last content modification time, seconds since the epoch.
    pub mtime: u32,
    /// Last metadata change time, seconds since the epoch.
    pub ctime: u32,
    /// A list of up to `DIRECT_POINTERS` valid data block addresses holding
    /// this inode's contents. For `TChr`/`TBlk` inodes, `direct_blocks[0]`
    /// holds the device id instead.
    pub direct_blocks: [u64; DIRECT_POINTERS as usize],
}

lazy_static! {
    /// Size of a serialized inode, in bytes.
    pub static ref DINODE_SIZE : u64 = bincode::serialize(&DInode::default()).unwrap().len() as u64;
}

/// Inode number of the root inode.
pub const ROOT_INUM: u64 = 1;

/// Wrapper around disk inodes `DInode` used for in-memory inodes.
/// Additionally contains the number of the inode `inum`, which is implicit
/// from the block in which the inode is stored, analogous to how a `Block`
/// keeps track of its own `block_no`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Inode {
    /// inode number
    pub inum: u64,
    /// the disk contents corresponding to `inum`
    pub disk_node: DInode,
}

impl Inode {
    /// Create a new inode
    pub fn new(inum: u64, disk_node: DInode) -> Inode {
        Inode { inum, disk_node }
    }
}

/// Trait for inode-like behavior, so alternative inode representations (such
/// as one with indirect block pointers) can share the same trait surface.
pub trait InodeLike: Sized {
    /// Create a new inode from the given parameters. Returns `None` if
    /// `nlink` overflows its on-disk width or `blocks` exceeds the
    /// representation's direct-block capacity.
    fn new(inum: u64, ft: &FType, nlink: u64, size: u64, blocks: &[u64]) -> Option<Self>;
    /// Get the file type of this inode
    fn get_ft(&self) -> FType;
    /// Get the number of links to this inode in the file system
    fn get_nlink(&self) -> u64;
    /// Get the size of this inode in bytes
    fn get_size(&self) -> u64;
    /// Get the address of the *i*th block pointed to by this inode, or 0 if unallocated.
    fn get_block(&self, i: u64) -> u64;
    /// Get the number of this inode on the disk
    fn get_inum(&self) -> u64;
    /// Get the permission/setuid/setgid/sticky bits of this inode.
    fn get_mode(&self) -> Mode;
    /// Get the owning user id of this inode.
    fn get_uid(&self) -> u16;
    /// Get the owning group id of this inode.
    fn get_gid(&self) -> u16;
}

impl InodeLike for Inode {
    fn new(inum: u64, ft: &FType, nlink: u64, size: u64, blocks: &[u64]) -> Option<Self> {
        if nlink > u16::MAX as u64 {
            return None;
        }
        if blocks.len() > DIRECT_POINTERS as usize {
            return None;
        }

        let mut db = [0; DIRECT_POINTERS as usize];
        db[..blocks.len()].copy_from_slice(blocks);

        let di = DInode {
            ft: *ft,
            nlink: nlink as u16,
            size,
            direct_blocks: db,
            ..Default::default()
        };
        Some(Inode::new(inum, di))
    }

    fn get_ft(&self) -> FType {
        self.disk_node.ft
    }
    fn get_nlink(&self) -> u64 {
        self.disk_node.nlink as u64
    }
    fn get_size(&self) -> u64 {
        self.disk_node.size
    }
    fn get_block(&self, i: u64) -> u64 {
        if DIRECT_POINTERS <= i {
            return 0;
        }
        self.disk_node.direct_blocks[i as usize]
    }

    fn get_inum(&self) -> u64 {
        self.inum
    }

    fn get_mode(&self) -> Mode {
        self.disk_node.mode
    }
    fn get_uid(&self) -> u16 {
        self.disk_node.uid
    }
    fn get_gid(&self) -> u16 {
        self.disk_node.gid
    }
}

/// Hard-coded number of characters each directory entry can contain for its name.
pub const DIRNAME_SIZE: usize = 14;

/// Specific type of inode contents for directories.
/// A directory is a file containing a sequence of `DirEntry` structures,
/// with its `FType` set to `TDir`.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct DirEntry {
    /// Number of the inode this directory entry points to. An `inum` of 0
    /// represents a free slot.
    pub inum: u64,
    /// Name of this entry, up to `DIRNAME_SIZE` characters. Shorter names
    /// are padded with the null character `\0`.
    pub name: [char; DIRNAME_SIZE],
}

lazy_static! {
    /// Size of a serialized directory entry, in bytes.
    pub static ref DIRENTRY_SIZE : u64 = bincode::serialize(&DirEntry::default()).unwrap().len() as u64;
}

#[cfg(test)]
mod block_tests {

    use super::Block;
    use serde::{Deserialize, Serialize};

    static BLOCK_SIZE: u64 = 1000;

    #[test]
    fn raw_rw_test() {
        let n1 = 12;
        let mut b1 = Block::new_zero(n1, BLOCK_SIZE);
        assert_eq!(b1.contents_as_ref(), vec![0; BLOCK_SIZE as usize]);

        let raw_data = vec![5; 5];
        b1.write_data(&raw_data, 10).unwrap();
        let mut raw_data = raw_data;
        b1.read_data(&mut raw_data, 8).unwrap();
        assert_eq!(raw_data, vec!(0, 0, 5, 5, 5));

        let emp: Vec<u8> = vec![];
        assert!(b1.write_data(&emp, BLOCK_SIZE).is_ok());
        assert!(b1.write_data(&emp, BLOCK_SIZE + 1).is_err());
        assert!(b1.read_data(&mut emp.clone(), BLOCK_SIZE + 1).is_err());
        let one = vec![1];
        assert!(b1.write_data(&one, BLOCK_SIZE).is_err());
        assert!(b1.read_data(&mut one.clone(), BLOCK_SIZE).is_err());
        let two = vec![1, 2];
        assert!(b1.write_data(&two, BLOCK_SIZE - 1).is_err());
        assert!(b1.read_data(&mut two.clone(), BLOCK_SIZE - 1).is_err());
    }

    use crate::types::{DInode, FType, DINODE_SIZE, DIRECT_POINTERS};
    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
    struct Point(u64, u64);

    #[test]
    fn serialization_test() {
        let p1 = Point(0, 0);
        let p2 = Point(1000, 1000);
        let in1 = DInode::default();
        let in2 = DInode {
            ft: FType::TFree,
            nlink: 13,
            size: 142,
            direct_blocks: [1000; DIRECT_POINTERS as usize],
            ..Default::default()
        };

        assert_eq!(
            bincode::serialize(&in1).unwrap().len(),
            *DINODE_SIZE as usize
        );
        assert_eq!(
            bincode::serialize(&in1).unwrap().len(),
            bincode::serialize(&in2).unwrap().len()
        );

        let n1 = 12;
        let mut b1 = Block::new(n1, vec![1; BLOCK_SIZE as usize].into_boxed_slice());
        let point_size = bincode::serialize(&p1).unwrap().len() as u64;
        b1.serialize_into(&p1, 0).unwrap();
        b1.serialize_into(&p2, point_size).unwrap();
        b1.serialize_into(&in1, 2 * point_size).unwrap();
        b1.serialize_into(&in2, 2 * point_size + *DINODE_SIZE)
            .unwrap();
        assert_eq!(b1.deserialize_from::<Point>(0).unwrap(), p1);
        assert_eq!(b1.deserialize_from::<Point>(point_size).unwrap(), p2);
        assert_eq!(b1.deserialize_from::<DInode>(2 * point_size).unwrap(), in1);
        assert_eq!(
            b1.deserialize_from::<DInode>(2 * point_size + *DINODE_SIZE)
                .unwrap(),
            in2
        );

        let b1 = Block::new_zero(n1, BLOCK_SIZE);
        assert!(b1
            .deserialize_from::<Point>(BLOCK_SIZE + 1 - point_size)
            .is_err());
        assert_eq!(b1.contents_as_ref(), vec![0; BLOCK_SIZE as usize]);
    }

    #[test]
    fn mode_triple_selection() {
        use crate::types::Mode;
        let m = Mode::from_perm_bits(0o740);
        assert_eq!(m.triple_for(true, false), 0o7);
        assert_eq!(m.triple_for(false, true), 0o4);
        assert_eq!(m.triple_for(false, false), 0o0);
    }
}
