//! File system with block-level support only.
//!
//! Implements [`FileSysSupport`] and [`BlockSupport`] over a raw [`Device`]:
//! a cached superblock and a bitmap-backed block allocator. No notion of
//! inodes or directories exists yet at this layer.
//!
//! [`FileSysSupport`]: namei_api::fs::FileSysSupport
//! [`BlockSupport`]: namei_api::fs::BlockSupport
//! [`Device`]: namei_api::controller::Device

use bit_field::BitField;
use namei_api::controller::Device;
use namei_api::fs::{BlockSupport, FileSysSupport};
use namei_api::types::{Block, SuperBlock, DINODE_SIZE};
use std::path::Path;

use super::error::BlockLayerError;

/// Filesystem with block-level support: a bitmap allocator and a cached
/// superblock sitting directly on top of a `Device`.
#[derive(Debug)]
pub struct BlockLayerFs {
    device: Device,
    sb: SuperBlock,
}

impl BlockLayerFs {
    /// Borrow the cached superblock.
    pub fn sup_as_ref(&self) -> &SuperBlock {
        &self.sb
    }

    /// Number of bitmap blocks needed to track `ndatablocks` bits.
    fn bmap_blocks(sb: &SuperBlock) -> u64 {
        let bits_per_block = sb.block_size * 8;
        (sb.ndatablocks + bits_per_block - 1) / bits_per_block
    }

    /// Number of inode blocks needed to hold `ninodes` inodes.
    fn inode_blocks(sb: &SuperBlock) -> u64 {
        let per_block = sb.block_size / *DINODE_SIZE;
        (sb.ninodes + per_block - 1) / per_block
    }

    fn bit_location(&self, i: u64) -> (u64, u64) {
        let bits_per_block = self.sb.block_size * 8;
        let block = self.sb.bmapstart + i / bits_per_block;
        let bit_in_block = i % bits_per_block;
        (block, bit_in_block)
    }

    fn get_bit(&self, i: u64) -> Result<bool, BlockLayerError> {
        let (block_no, bit) = self.bit_location(i);
        let block = self.b_get(block_no)?;
        let byte = block.contents_as_ref()[(bit / 8) as usize];
        Ok(byte.get_bit((bit % 8) as usize))
    }

    fn set_bit(&mut self, i: u64, value: bool) -> Result<(), BlockLayerError> {
        let (block_no, bit) = self.bit_location(i);
        let mut block = self.b_get(block_no)?;
        let byte_idx = (bit / 8) as usize;
        let mut byte = block.contents_as_ref()[byte_idx];
        byte.set_bit((bit % 8) as usize, value);
        block.contents_as_mut()[byte_idx] = byte;
        self.b_put(&block)
    }
}

impl FileSysSupport for BlockLayerFs {
    type Error = BlockLayerError;

    fn sb_valid(sb: &SuperBlock) -> bool {
        sb.inodestart >= 1
            && sb.inodestart < sb.bmapstart
            && sb.bmapstart < sb.datastart
            && sb.datastart < sb.nblocks
            && sb.inodestart + Self::inode_blocks(sb) <= sb.bmapstart
            && sb.bmapstart + Self::bmap_blocks(sb) <= sb.datastart
            && sb.datastart + sb.ndatablocks <= sb.nblocks
    }

    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error> {
        if !Self::sb_valid(sb) {
            return Err(BlockLayerError::BlockLayerInput("superblock is not valid"));
        }
        let mut device = Device::new(path, sb.block_size, sb.nblocks)?;
        let mut sb_block = Block::new_zero(0, sb.block_size);
        sb_block.serialize_into(sb, 0)?;
        device.write_block(&sb_block)?;
        Ok(BlockLayerFs { device, sb: *sb })
    }

    fn mountfs(dev: Device) -> Result<Self, Self::Error> {
        let sb_block = dev.read_block(0)?;
        let sb: SuperBlock = sb_block.deserialize_from(0)?;
        if !Self::sb_valid(&sb) {
            return Err(BlockLayerError::BlockLayerInput(
                "on-disk superblock is not valid",
            ));
        }
        if sb.block_size != dev.block_size || sb.nblocks != dev.nblocks {
            return Err(BlockLayerError::BlockLayerInput(
                "superblock geometry does not match device geometry",
            ));
        }
        Ok(BlockLayerFs { device: dev, sb })
    }

    fn unmountfs(self) -> Device {
        self.device
    }
}

impl BlockSupport for BlockLayerFs {
    fn b_get(&self, i: u64) -> Result<Block, Self::Error> {
        Ok(self.device.read_block(i)?)
    }

    fn b_put(&mut self, b: &Block) -> Result<(), Self::Error> {
        Ok(self.device.write_block(b)?)
    }

    fn b_free(&mut self, i: u64) -> Result<(), Self::Error> {
        if i >= self.sb.ndatablocks {
            return Err(BlockLayerError::BlockLayerInput(
                "block index out of bounds",
            ));
        }
        if !self.get_bit(i)? {
            return Err(BlockLayerError::BlockLayerOp(
                "block is already free",
            ));
        }
        self.set_bit(i, false)
    }

    fn b_zero(&mut self, i: u64) -> Result<(), Self::Error> {
        if i >= self.sb.ndatablocks {
            return Err(BlockLayerError::BlockLayerInput(
                "block index out of bounds",
            ));
        }
        let block = Block::new_zero(self.sb.datastart + i, self.sb.block_size);
        self.b_put(&block)
    }

    fn b_alloc(&mut self) -> Result<u64, Self::Error> {
        for i in 0..self.sb.ndatablocks {
            if !self.get_bit(i)? {
                self.set_bit(i, true)?;
                self.b_zero(i)?;
                return Ok(i);
            }
        }
        Err(BlockLayerError::BlockLayerOp(
            "no free data blocks remaining",
        ))
    }

    fn sup_get(&self) -> Result<SuperBlock, Self::Error> {
        Ok(self.sb)
    }

    fn sup_put(&mut self, sup: &SuperBlock) -> Result<(), Self::Error> {
        let mut sb_block = self.b_get(0)?;
        sb_block.serialize_into(sup, 0)?;
        self.b_put(&sb_block)?;
        self.sb = *sup;
        Ok(())
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
    fn mkfs_then_alloc_and_free() {
        let path = disk_prep_path("block_layer", "mkfs_alloc");
        let sb = test_sb();
        let mut fs = BlockLayerFs::mkfs(&path, &sb).unwrap();

        let b0 = fs.b_alloc().unwrap();
        let b1 = fs.b_alloc().unwrap();
        assert_eq!(b0, 0);
        assert_eq!(b1, 1);

        fs.b_free(b0).unwrap();
        assert!(fs.b_free(b0).is_err());

        let b2 = fs.b_alloc().unwrap();
        assert_eq!(b2, 0);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn mountfs_roundtrip() {
        let path = disk_prep_path("block_layer", "mountfs");
        let sb = test_sb();
        let fs = BlockLayerFs::mkfs(&path, &sb).unwrap();
        let dev = fs.unmountfs();
        let fs2 = BlockLayerFs::mountfs(dev).unwrap();
        assert_eq!(fs2.sup_as_ref(), &sb);
        disk_destruct(fs2.unmountfs(), &path);
    }

    #[test]
    fn invalid_superblock_rejected() {
        let path = disk_prep_path("block_layer", "invalid_sb");
        let mut sb = test_sb();
        sb.bmapstart = sb.inodestart;
        assert!(BlockLayerFs::mkfs(&path, &sb).is_err());
    }
}
