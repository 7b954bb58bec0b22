//! An alternative inode representation with one level of indirection.
//!
//! [`InodeLayerFs`] caps a file at `DIRECT_POINTERS` data blocks. This module
//! swaps in a different on-disk inode layout, [`DIndirectInode`], that adds
//! a single extra pointer: once block `DIRECT_POINTERS` is needed, an
//! *indirect block* is allocated to hold further block addresses, extending
//! the maximum file size by `block_size / 8` blocks. Everything up to
//! `DIRECT_POINTERS` blocks behaves exactly as before; [`IndirectInode`]
//! implements the same [`InodeLike`] trait as the base [`Inode`] type, so it
//! slots into [`InodeRWSupport`]/[`InodeSupport`] without any other layer
//! needing to change.
//!
//! [`InodeLayerFs`]: crate::inode_layer::InodeLayerFs
//! [`Inode`]: namei_api::types::Inode
//! [`InodeLike`]: namei_api::types::InodeLike
//! [`InodeRWSupport`]: namei_api::fs::InodeRWSupport
//! [`InodeSupport`]: namei_api::fs::InodeSupport

use lazy_static::lazy_static;
use namei_api::controller::Device;
use namei_api::fs::{BlockSupport, FileSysSupport, InodeRWSupport, InodeSupport};
use namei_api::types::{Block, Buffer, FType, Mode, SuperBlock, DIRECT_POINTERS};
use serde::{Deserialize, Serialize};
use std::cmp::min;
use std::path::Path;

use super::block_layer::BlockLayerFs;
use super::error::InodeLayerError;
use super::inode_layer::now;

/// On-disk inode with one level of indirection, mirroring [`DInode`] but
/// with an extra `indirect` field.
///
/// [`DInode`]: namei_api::types::DInode
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct DIndirectInode {
    /// File type.
    pub ft: FType,
    /// Permission and special-execution bits.
    pub mode: Mode,
    /// Owning user id.
    pub uid: u16,
    /// Owning group id.
    pub gid: u16,
    /// Link count.
    pub nlink: u16,
    /// Size in bytes.
    pub size: u64,
    /// Last access time.
    pub atime: u32,
    /// Last content modification time.
    pub mtime: u32,
    /// Last metadata change time.
    pub ctime: u32,
    /// Direct block pointers, same as [`DInode::direct_blocks`].
    ///
    /// [`DInode::direct_blocks`]: namei_api::types::DInode::direct_blocks
    pub direct_blocks: [u64; DIRECT_POINTERS as usize],
    /// Address of this inode's indirect block, or 0 if it has never needed
    /// one. The indirect block itself holds a sequence of further data
    /// block addresses, one per `size_of::<u64>()` bytes.
    pub indirect: u64,
}

lazy_static! {
    /// Size of a serialized indirect inode, in bytes.
    pub static ref DINDIRECT_SIZE: u64 =
        bincode::serialize(&DIndirectInode::default()).unwrap().len() as u64;
}

/// In-memory wrapper around a [`DIndirectInode`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IndirectInode {
    /// Inode number.
    pub inum: u64,
    /// On-disk contents.
    pub disk_node: DIndirectInode,
}

impl namei_api::types::InodeLike for IndirectInode {
    fn new(inum: u64, ft: &FType, nlink: u64, size: u64, blocks: &[u64]) -> Option<Self> {
        if nlink > u16::MAX as u64 {
            return None;
        }
        // The last slot, if present, is taken to be the indirect block's own
        // address rather than a direct pointer (mirrors `get_block`, below).
        if blocks.len() > DIRECT_POINTERS as usize + 1 {
            return None;
        }
        let mut db = [0u64; DIRECT_POINTERS as usize];
        let direct_len = min(blocks.len(), DIRECT_POINTERS as usize);
        db[..direct_len].copy_from_slice(&blocks[..direct_len]);
        let indirect = if blocks.len() > DIRECT_POINTERS as usize {
            blocks[DIRECT_POINTERS as usize]
        } else {
            0
        };
        Some(IndirectInode {
            inum,
            disk_node: DIndirectInode {
                ft: *ft,
                nlink: nlink as u16,
                size,
                direct_blocks: db,
                indirect,
                ..Default::default()
            },
        })
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
        if i < DIRECT_POINTERS {
            self.disk_node.direct_blocks[i as usize]
        } else if i == DIRECT_POINTERS {
            // The caller needs device access to resolve anything past this;
            // what we can say without it is the indirect block's own address.
            self.disk_node.indirect
        } else {
            0
        }
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

/// Filesystem with inode-level support via [`IndirectInode`], layered on top
/// of [`BlockLayerFs`] exactly like [`InodeLayerFs`], but supporting files
/// larger than `DIRECT_POINTERS` blocks.
///
/// [`InodeLayerFs`]: crate::inode_layer::InodeLayerFs
#[derive(Debug)]
pub struct IndirectInodeFs {
    block_fs: BlockLayerFs,
    inodes_per_block: u64,
}

impl IndirectInodeFs {
    /// Borrow the cached superblock.
    pub fn sup_as_ref(&self) -> &SuperBlock {
        self.block_fs.sup_as_ref()
    }

    /// Number of block-address slots an indirect block can hold.
    fn slots_per_indirect(&self) -> u64 {
        self.sup_as_ref().block_size / 8
    }

    fn get_block_of_inode(&self, i: u64) -> Result<Block, InodeLayerError> {
        if i == 0 || i > self.sup_as_ref().ninodes - 1 {
            return Err(InodeLayerError::InodeLayerInput(
                "inode index out of bounds",
            ));
        }
        let addr = self.sup_as_ref().inodestart + i / self.inodes_per_block;
        self.b_get(addr)
    }

    fn ensure_indirect_block(&mut self, inode: &mut IndirectInode) -> Result<u64, InodeLayerError> {
        if inode.disk_node.indirect != 0 {
            return Ok(inode.disk_node.indirect);
        }
        let rel = self.block_fs.b_alloc()?;
        let abs = self.sup_as_ref().datastart + rel;
        inode.disk_node.indirect = abs;
        Ok(abs)
    }

    fn read_indirect_slot(&self, indirect_addr: u64, rel: u64) -> Result<u64, InodeLayerError> {
        let block = self.b_get(indirect_addr)?;
        Ok(block.deserialize_from(rel * 8)?)
    }

    fn write_indirect_slot(
        &mut self,
        indirect_addr: u64,
        rel: u64,
        addr: u64,
    ) -> Result<(), InodeLayerError> {
        let mut block = self.b_get(indirect_addr)?;
        block.serialize_into(&addr, rel * 8)?;
        self.b_put(&block)
    }

    /// Existing (non-allocating) address of logical block `blk`, or 0 if it
    /// is not yet allocated (a hole).
    fn block_addr_for_read(&self, inode: &IndirectInode, blk: u64) -> Result<u64, InodeLayerError> {
        if blk < DIRECT_POINTERS {
            return Ok(inode.disk_node.direct_blocks[blk as usize]);
        }
        let rel = blk - DIRECT_POINTERS;
        if inode.disk_node.indirect == 0 {
            return Ok(0);
        }
        self.read_indirect_slot(inode.disk_node.indirect, rel)
    }

    /// Address of logical block `blk`, allocating it (and the indirect
    /// block, if needed) on demand.
    fn block_for_write(&mut self, inode: &mut IndirectInode, blk: u64) -> Result<u64, InodeLayerError> {
        if blk < DIRECT_POINTERS {
            let existing = inode.disk_node.direct_blocks[blk as usize];
            if existing != 0 {
                return Ok(existing);
            }
            let rel = self.block_fs.b_alloc()?;
            let abs = self.sup_as_ref().datastart + rel;
            inode.disk_node.direct_blocks[blk as usize] = abs;
            return Ok(abs);
        }

        let rel = blk - DIRECT_POINTERS;
        if rel >= self.slots_per_indirect() {
            return Err(InodeLayerError::InodeLayerInput(
                "write would exceed the maximum indirect-inode size",
            ));
        }
        let indirect_addr = self.ensure_indirect_block(inode)?;
        let existing = self.read_indirect_slot(indirect_addr, rel)?;
        if existing != 0 {
            return Ok(existing);
        }
        let data_rel = self.block_fs.b_alloc()?;
        let abs = self.sup_as_ref().datastart + data_rel;
        self.write_indirect_slot(indirect_addr, rel, abs)?;
        Ok(abs)
    }

    fn release_blocks(&mut self, inode: &mut IndirectInode) -> Result<(), InodeLayerError> {
        let block_size = self.sup_as_ref().block_size;
        let blocks_occupied = (inode.disk_node.size + block_size - 1) / block_size;
        for i in 0..min(blocks_occupied, DIRECT_POINTERS) {
            let addr = inode.disk_node.direct_blocks[i as usize];
            if addr != 0 {
                self.block_fs.b_free(addr - self.sup_as_ref().datastart)?;
                inode.disk_node.direct_blocks[i as usize] = 0;
            }
        }
        if inode.disk_node.indirect != 0 {
            if blocks_occupied > DIRECT_POINTERS {
                for rel in 0..(blocks_occupied - DIRECT_POINTERS) {
                    let addr = self.read_indirect_slot(inode.disk_node.indirect, rel)?;
                    if addr != 0 {
                        self.block_fs.b_free(addr - self.sup_as_ref().datastart)?;
                    }
                }
            }
            self.block_fs
                .b_free(inode.disk_node.indirect - self.sup_as_ref().datastart)?;
            inode.disk_node.indirect = 0;
        }
        Ok(())
    }
}

impl FileSysSupport for IndirectInodeFs {
    type Error = InodeLayerError;

    fn sb_valid(sb: &SuperBlock) -> bool {
        BlockLayerFs::sb_valid(sb)
    }

    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error> {
        let mut block_fs = BlockLayerFs::mkfs(path, sb)?;
        let inodes_per_block = sb.block_size / *DINDIRECT_SIZE;
        let inode_blocks = (sb.ninodes + inodes_per_block - 1) / inodes_per_block;
        let default_dinode = DIndirectInode::default();
        let mut nodes_init = 0;
        for bl in 0..inode_blocks {
            let mut block = block_fs.b_get(sb.inodestart + bl)?;
            for node in 0..inodes_per_block {
                if nodes_init == sb.ninodes {
                    break;
                }
                block.serialize_into(&default_dinode, node * (*DINDIRECT_SIZE))?;
                nodes_init += 1;
            }
            block_fs.b_put(&block)?;
        }
        Ok(IndirectInodeFs {
            block_fs,
            inodes_per_block,
        })
    }

    fn mountfs(dev: Device) -> Result<Self, Self::Error> {
        let block_fs = BlockLayerFs::mountfs(dev)?;
        let inodes_per_block = block_fs.sup_as_ref().block_size / *DINDIRECT_SIZE;
        Ok(IndirectInodeFs {
            block_fs,
            inodes_per_block,
        })
    }

    fn unmountfs(self) -> Device {
        self.block_fs.unmountfs()
    }
}

impl BlockSupport for IndirectInodeFs {
    fn b_get(&self, i: u64) -> Result<Block, Self::Error> {
        Ok(self.block_fs.b_get(i)?)
    }

    fn b_put(&mut self, b: &Block) -> Result<(), Self::Error> {
        Ok(self.block_fs.b_put(b)?)
    }

    fn b_free(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.block_fs.b_free(i)?)
    }

    fn b_zero(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.block_fs.b_zero(i)?)
    }

    fn b_alloc(&mut self) -> Result<u64, Self::Error> {
        Ok(self.block_fs.b_alloc()?)
    }

    fn sup_get(&self) -> Result<SuperBlock, Self::Error> {
        Ok(self.block_fs.sup_get()?)
    }

    fn sup_put(&mut self, sup: &SuperBlock) -> Result<(), Self::Error> {
        Ok(self.block_fs.sup_put(sup)?)
    }
}

impl InodeSupport for IndirectInodeFs {
    type Inode = IndirectInode;

    fn i_get(&self, i: u64) -> Result<Self::Inode, Self::Error> {
        let t_offset = (i % self.inodes_per_block) * (*DINDIRECT_SIZE);
        let target_block = self.get_block_of_inode(i)?;
        let di_node = target_block.deserialize_from::<DIndirectInode>(t_offset)?;
        Ok(IndirectInode {
            inum: i,
            disk_node: di_node,
        })
    }

    fn i_put(&mut self, ino: &Self::Inode) -> Result<(), Self::Error> {
        let t_offset = (ino.inum % self.inodes_per_block) * (*DINDIRECT_SIZE);
        let mut target_block = self.get_block_of_inode(ino.inum)?;
        target_block.serialize_into(&ino.disk_node, t_offset)?;
        self.b_put(&target_block)
    }

    fn i_free(&mut self, i: u64) -> Result<(), Self::Error> {
        let mut inode = self.i_get(i)?;
        if inode.disk_node.ft == FType::TFree {
            return Err(InodeLayerError::InodeLayerOp("trying to free a free inode"));
        }
        if inode.disk_node.nlink != 0 {
            return Ok(());
        }
        if !inode.disk_node.ft.is_device() {
            self.release_blocks(&mut inode)?;
        }
        inode.disk_node = DIndirectInode::default();
        self.i_put(&inode)
    }

    fn i_alloc(&mut self, ft: FType) -> Result<u64, Self::Error> {
        let inode_blocks =
            (self.sup_as_ref().ninodes + self.inodes_per_block - 1) / self.inodes_per_block;
        let mut nodes_searched = 1;
        for bl in 0..inode_blocks {
            let mut block = self.block_fs.b_get(self.sup_as_ref().inodestart + bl)?;
            for node in 0..self.inodes_per_block {
                if bl == 0 && node == 0 {
                    continue;
                }
                if nodes_searched >= self.sup_as_ref().ninodes {
                    break;
                }
                let mut di_node = block.deserialize_from::<DIndirectInode>(node * (*DINDIRECT_SIZE))?;
                if di_node.ft == FType::TFree {
                    di_node.ft = ft;
                    di_node.size = 0;
                    di_node.nlink = 0;
                    block.serialize_into(&di_node, node * (*DINDIRECT_SIZE))?;
                    self.block_fs.b_put(&block)?;
                    return Ok(nodes_searched);
                }
                nodes_searched += 1;
            }
        }
        Err(InodeLayerError::InodeLayerOp(
            "cannot allocate new inode, no space left",
        ))
    }

    fn i_trunc(&mut self, inode: &mut Self::Inode) -> Result<(), Self::Error> {
        self.release_blocks(inode)?;
        inode.disk_node.size = 0;
        self.i_put(inode)
    }
}

impl InodeRWSupport for IndirectInodeFs {
    fn i_read(
        &self,
        inode: &Self::Inode,
        buf: &mut Buffer,
        off: u64,
        n: u64,
    ) -> Result<u64, Self::Error> {
        if off > inode.disk_node.size {
            return Err(InodeLayerError::InodeLayerInput(
                "read offset past end of file",
            ));
        }
        let block_size = self.sup_as_ref().block_size;
        let to_read = min(n, inode.disk_node.size - off);
        let to_read = min(to_read, buf.len());
        let mut done = 0u64;
        while done < to_read {
            let pos = off + done;
            let blk = pos / block_size;
            let blk_off = pos % block_size;
            let chunk = min(to_read - done, block_size - blk_off);
            let addr = self.block_addr_for_read(inode, blk)?;
            if addr != 0 {
                let block = self.b_get(addr)?;
                let mut tmp = vec![0u8; chunk as usize];
                block.read_data(&mut tmp, blk_off)?;
                buf.write_data(&tmp, done)?;
            } else {
                buf.write_data(&vec![0u8; chunk as usize], done)?;
            }
            done += chunk;
        }
        Ok(done)
    }

    fn i_write(
        &mut self,
        inode: &mut Self::Inode,
        buf: &Buffer,
        off: u64,
        n: u64,
    ) -> Result<(), Self::Error> {
        if off > inode.disk_node.size {
            return Err(InodeLayerError::InodeLayerInput(
                "write offset past end of file",
            ));
        }
        if buf.len() < n {
            return Err(InodeLayerError::InodeLayerInput(
                "buffer does not hold enough data for the requested write",
            ));
        }
        let block_size = self.sup_as_ref().block_size;
        let max_size = (DIRECT_POINTERS + self.slots_per_indirect()) * block_size;
        if off + n > max_size {
            return Err(InodeLayerError::InodeLayerOp(
                "write would exceed the maximum possible inode size",
            ));
        }
        let mut done = 0u64;
        while done < n {
            let pos = off + done;
            let blk = pos / block_size;
            let blk_off = pos % block_size;
            let chunk = min(n - done, block_size - blk_off);
            let addr = self.block_for_write(inode, blk)?;
            let mut block = self.b_get(addr)?;
            let mut tmp = vec![0u8; chunk as usize];
            buf.read_data(&mut tmp, done)?;
            block.write_data(&tmp, blk_off)?;
            self.b_put(&block)?;
            done += chunk;
        }
        if off + n > inode.disk_node.size {
            inode.disk_node.size = off + n;
        }
        inode.disk_node.mtime = now();
        self.i_put(inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{disk_destruct, disk_prep_path};

    fn test_sb() -> SuperBlock {
        SuperBlock {
            block_size: 128,
            nblocks: 400,
            ninodes: 8,
            inodestart: 1,
            ndatablocks: 380,
            bmapstart: 4,
            datastart: 5,
        }
    }

    #[test]
    fn stays_within_direct_blocks_like_before() {
        let path = disk_prep_path("indirect", "direct_only");
        let sb = test_sb();
        let mut fs = IndirectInodeFs::mkfs(&path, &sb).unwrap();
        let inum = fs.i_alloc(FType::TFile).unwrap();
        let mut inode = fs.i_get(inum).unwrap();

        let data = vec![7u8; (sb.block_size * 2) as usize];
        let wbuf = Buffer::new(data.clone().into_boxed_slice());
        fs.i_write(&mut inode, &wbuf, 0, data.len() as u64).unwrap();
        assert_eq!(inode.disk_node.indirect, 0);

        let mut rbuf = Buffer::new_zero(data.len() as u64);
        fs.i_read(&inode, &mut rbuf, 0, data.len() as u64).unwrap();
        assert_eq!(rbuf.contents_as_ref(), &data[..]);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn spills_into_indirect_block_past_direct_capacity() {
        let path = disk_prep_path("indirect", "spill");
        let sb = test_sb();
        let mut fs = IndirectInodeFs::mkfs(&path, &sb).unwrap();
        let inum = fs.i_alloc(FType::TFile).unwrap();
        let mut inode = fs.i_get(inum).unwrap();

        let total_blocks = DIRECT_POINTERS + 3;
        let data = vec![9u8; (total_blocks * sb.block_size) as usize];
        let wbuf = Buffer::new(data.clone().into_boxed_slice());
        fs.i_write(&mut inode, &wbuf, 0, data.len() as u64).unwrap();
        assert_ne!(inode.disk_node.indirect, 0);

        let mut rbuf = Buffer::new_zero(data.len() as u64);
        fs.i_read(&inode, &mut rbuf, 0, data.len() as u64).unwrap();
        assert_eq!(rbuf.contents_as_ref(), &data[..]);

        // A fresh inode starts unlinked, so freeing it now releases the
        // indirect block along with the direct ones.
        fs.i_free(inum).unwrap();
        let freed = fs.i_get(inum).unwrap();
        assert_eq!(freed.disk_node.indirect, 0);

        disk_destruct(fs.unmountfs(), &path);
    }
}
