//! File system with inode support.
//!
//! Implements [`InodeSupport`] and [`InodeRWSupport`] on top of
//! [`BlockLayerFs`]: inode allocation/freeing, and buffer-based reads and
//! writes through an inode's direct block pointers.
//!
//! [`InodeSupport`]: namei_api::fs::InodeSupport
//! [`InodeRWSupport`]: namei_api::fs::InodeRWSupport
//! [`BlockLayerFs`]: crate::block_layer::BlockLayerFs

use namei_api::controller::Device;
use namei_api::fs::{BlockSupport, FileSysSupport, InodeRWSupport, InodeSupport};
use namei_api::types::{
    Block, Buffer, DInode, FType, Inode, InodeLike, SuperBlock, DINODE_SIZE, DIRECT_POINTERS,
};
use std::cmp::min;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::block_layer::BlockLayerFs;
use super::error::InodeLayerError;

/// Seconds since the epoch, used to stamp `atime`/`mtime`/`ctime`.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Filesystem with inode-level support, layered on top of `BlockLayerFs`.
#[derive(Debug)]
pub struct InodeLayerFs {
    block_fs: BlockLayerFs,
    inodes_per_block: u64,
}

impl InodeLayerFs {
    /// Borrow the cached superblock.
    pub fn sup_as_ref(&self) -> &SuperBlock {
        self.block_fs.sup_as_ref()
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

    /// Address of the block (logical index `blk` within the file) this
    /// inode points to, allocating a fresh one (and extending
    /// `direct_blocks`) if it is not yet allocated.
    fn block_for_write(
        &mut self,
        inode: &mut Inode,
        blk: u64,
    ) -> Result<u64, InodeLayerError> {
        if blk >= DIRECT_POINTERS {
            return Err(InodeLayerError::InodeLayerInput(
                "write would exceed the maximum inode size",
            ));
        }
        let existing = inode.disk_node.direct_blocks[blk as usize];
        if existing != 0 {
            return Ok(existing);
        }
        let rel = self.block_fs.b_alloc()?;
        let abs = self.sup_as_ref().datastart + rel;
        inode.disk_node.direct_blocks[blk as usize] = abs;
        Ok(abs)
    }
}

impl FileSysSupport for InodeLayerFs {
    type Error = InodeLayerError;

    fn sb_valid(sb: &SuperBlock) -> bool {
        BlockLayerFs::sb_valid(sb)
    }

    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error> {
        let mut block_fs = BlockLayerFs::mkfs(path, sb)?;

        let inodes_per_block = sb.block_size / *DINODE_SIZE;
        let inode_blocks = (sb.ninodes + inodes_per_block - 1) / inodes_per_block;
        let mut nodes_init = 0;
        let default_dinode = DInode::default();
        for bl in 0..inode_blocks {
            let mut block = block_fs.b_get(sb.inodestart + bl)?;
            for node in 0..inodes_per_block {
                if nodes_init == sb.ninodes {
                    break;
                }
                block.serialize_into(&default_dinode, node * (*DINODE_SIZE))?;
                nodes_init += 1;
            }
            block_fs.b_put(&block)?;
        }

        Ok(InodeLayerFs {
            block_fs,
            inodes_per_block,
        })
    }

    fn mountfs(dev: Device) -> Result<Self, Self::Error> {
        let block_fs = BlockLayerFs::mountfs(dev)?;
        let inodes_per_block = block_fs.sup_as_ref().block_size / *DINODE_SIZE;
        Ok(InodeLayerFs {
            block_fs,
            inodes_per_block,
        })
    }

    fn unmountfs(self) -> Device {
        self.block_fs.unmountfs()
    }
}

impl BlockSupport for InodeLayerFs {
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

impl InodeSupport for InodeLayerFs {
    type Inode = Inode;

    fn i_get(&self, i: u64) -> Result<Self::Inode, Self::Error> {
        let t_offset = (i % self.inodes_per_block) * (*DINODE_SIZE);
        let target_block = self.get_block_of_inode(i)?;
        let di_node = target_block.deserialize_from::<DInode>(t_offset)?;
        Ok(Inode {
            inum: i,
            disk_node: di_node,
        })
    }

    fn i_put(&mut self, ino: &Self::Inode) -> Result<(), Self::Error> {
        let t_offset = (ino.inum % self.inodes_per_block) * (*DINODE_SIZE);
        let mut target_block = self.get_block_of_inode(ino.inum)?;
        target_block.serialize_into(&ino.disk_node, t_offset)?;
        self.b_put(&target_block)?;
        Ok(())
    }

    fn i_free(&mut self, i: u64) -> Result<(), Self::Error> {
        let mut inode = self.i_get(i)?;
        if inode.disk_node.ft == FType::TFree {
            return Err(InodeLayerError::InodeLayerOp("trying to free a free inode"));
        }
        if inode.disk_node.nlink != 0 {
            return Ok(());
        }
        let blocks_occupied = if inode.disk_node.ft.is_device() {
            0
        } else {
            (inode.disk_node.size + self.sup_as_ref().block_size - 1) / self.sup_as_ref().block_size
        };
        for i in 0..blocks_occupied {
            let addr = inode.disk_node.direct_blocks[i as usize];
            if addr != 0 {
                let rel = addr - self.sup_as_ref().datastart;
                self.block_fs.b_free(rel)?;
                inode.disk_node.direct_blocks[i as usize] = 0;
            }
        }
        inode.disk_node = DInode::default();
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
                let mut di_node = block.deserialize_from::<DInode>(node * (*DINODE_SIZE))?;
                if di_node.ft == FType::TFree {
                    di_node.ft = ft;
                    di_node.size = 0;
                    di_node.nlink = 0;
                    block.serialize_into(&di_node, node * (*DINODE_SIZE))?;
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
        let blocks_occupied =
            (inode.disk_node.size + self.sup_as_ref().block_size - 1) / self.sup_as_ref().block_size;
        for i in 0..blocks_occupied {
            let addr = inode.disk_node.direct_blocks[i as usize];
            if addr != 0 {
                let rel = addr - self.sup_as_ref().datastart;
                self.block_fs.b_free(rel)?;
                inode.disk_node.direct_blocks[i as usize] = 0;
            }
        }
        inode.disk_node.size = 0;
        self.i_put(inode)
    }
}

impl InodeRWSupport for InodeLayerFs {
    fn i_read(
        &self,
        inode: &Self::Inode,
        buf: &mut Buffer,
        off: u64,
        n: u64,
    ) -> Result<u64, Self::Error> {
        if off > inode.get_size() {
            return Err(InodeLayerError::InodeLayerInput(
                "read offset past end of file",
            ));
        }
        let block_size = self.sup_as_ref().block_size;
        let to_read = min(n, inode.get_size() - off);
        let to_read = min(to_read, buf.len());
        let mut done = 0u64;
        while done < to_read {
            let pos = off + done;
            let blk = pos / block_size;
            let blk_off = pos % block_size;
            let chunk = min(to_read - done, block_size - blk_off);
            let addr = inode.get_block(blk);
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
        if off > inode.get_size() {
            return Err(InodeLayerError::InodeLayerInput(
                "write offset past end of file",
            ));
        }
        if buf.len() < n {
            return Err(InodeLayerError::InodeLayerInput(
                "buffer does not hold enough data for the requested write"
            ));
        }
        let block_size = self.sup_as_ref().block_size;
        if off + n > DIRECT_POINTERS * block_size {
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
            block_size: 512,
            nblocks: 50,
            ninodes: 8,
            inodestart: 1,
            ndatablocks: 30,
            bmapstart: 3,
            datastart: 4,
        }
    }

    #[test]
    fn alloc_put_get_roundtrip() {
        let path = disk_prep_path("inode_layer", "roundtrip");
        let sb = test_sb();
        let mut fs = InodeLayerFs::mkfs(&path, &sb).unwrap();

        let inum = fs.i_alloc(FType::TFile).unwrap();
        let got = fs.i_get(inum).unwrap();
        assert_eq!(got.get_ft(), FType::TFile);
        assert_eq!(got.get_nlink(), 0);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn write_then_read_across_blocks() {
        let path = disk_prep_path("inode_layer", "write_read");
        let sb = test_sb();
        let mut fs = InodeLayerFs::mkfs(&path, &sb).unwrap();
        let inum = fs.i_alloc(FType::TFile).unwrap();
        let mut inode = fs.i_get(inum).unwrap();

        let data: Vec<u8> = (0..(sb.block_size * 2 + 20)).map(|x| (x % 251) as u8).collect();
        let wbuf = Buffer::new(data.clone().into_boxed_slice());
        fs.i_write(&mut inode, &wbuf, 0, data.len() as u64).unwrap();
        assert_eq!(inode.get_size(), data.len() as u64);

        let mut rbuf = Buffer::new_zero(data.len() as u64);
        let n = fs.i_read(&inode, &mut rbuf, 0, data.len() as u64).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(rbuf.contents_as_ref(), &data[..]);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn i_free_releases_blocks_when_unlinked() {
        let path = disk_prep_path("inode_layer", "free");
        let sb = test_sb();
        let mut fs = InodeLayerFs::mkfs(&path, &sb).unwrap();
        let inum = fs.i_alloc(FType::TFile).unwrap();
        let mut inode = fs.i_get(inum).unwrap();
        let wbuf = Buffer::new(vec![1u8; 10].into_boxed_slice());
        fs.i_write(&mut inode, &wbuf, 0, 10).unwrap();

        inode.disk_node.nlink = 0;
        fs.i_put(&inode).unwrap();
        fs.i_free(inum).unwrap();
        let freed = fs.i_get(inum).unwrap();
        assert_eq!(freed.get_ft(), FType::TFree);

        disk_destruct(fs.unmountfs(), &path);
    }
}
