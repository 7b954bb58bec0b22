//! File system with directory support.
//!
//! Implements [`DirectorySupport`] over [`InodeLayerFs`]: scanning a
//! directory's entries (`find_entry`) and appending or reusing a slot in one
//! (`add_entry`) are the private machinery beneath the public
//! `dirlookup`/`dirlink` operations.
//!
//! [`DirectorySupport`]: namei_api::fs::DirectorySupport
//! [`InodeLayerFs`]: crate::inode_layer::InodeLayerFs

use namei_api::controller::Device;
use namei_api::fs::{BlockSupport, DirectorySupport, FileSysSupport, InodeRWSupport, InodeSupport};
use namei_api::types::{
    Block, Buffer, DirEntry, FType, Inode, InodeLike, SuperBlock, DIRENTRY_SIZE, DIRNAME_SIZE,
};
use std::path::Path;

use super::error::DirLayerError;
use super::inode_layer::{now, InodeLayerFs};

/// Filesystem with directory-level support, layered on top of `InodeLayerFs`.
#[derive(Debug)]
pub struct DirLayerFs {
    inode_fs: InodeLayerFs,
}

impl DirLayerFs {
    /// Borrow the cached superblock.
    pub fn sup_as_ref(&self) -> &SuperBlock {
        self.inode_fs.sup_as_ref()
    }

    /// Number of directory entry slots currently spanned by `inode`'s size
    /// (used and free alike).
    fn nslots(inode: &Inode) -> u64 {
        inode.get_size() / *DIRENTRY_SIZE
    }

    fn read_slot(&self, inode: &Inode, slot: u64) -> Result<DirEntry, DirLayerError> {
        let mut buf = Buffer::new_zero(*DIRENTRY_SIZE);
        self.inode_fs
            .i_read(inode, &mut buf, slot * (*DIRENTRY_SIZE), *DIRENTRY_SIZE)?;
        Ok(buf.deserialize_from(0)?)
    }

    fn write_slot(
        &mut self,
        inode: &mut Inode,
        slot: u64,
        de: &DirEntry,
    ) -> Result<(), DirLayerError> {
        let mut buf = Buffer::new_zero(*DIRENTRY_SIZE);
        buf.serialize_into(de, 0)?;
        self.inode_fs
            .i_write(inode, &buf, slot * (*DIRENTRY_SIZE), *DIRENTRY_SIZE)?;
        Ok(())
    }

    /// Scan `inode`'s entries (within its current size) for one named
    /// `name`. Mirrors `find_entry` in the original namei engine: returns
    /// the slot index and a copy of the entry found there.
    pub(crate) fn find_entry(
        &self,
        inode: &Inode,
        name: &str,
    ) -> Result<(u64, DirEntry), DirLayerError> {
        if inode.get_ft() != FType::TDir {
            return Err(DirLayerError::DirLayerInput(
                "the given inode does not represent a directory",
            ));
        }
        for slot in 0..Self::nslots(inode) {
            let de = self.read_slot(inode, slot)?;
            if de.inum != 0 && Self::get_name_str(&de) == name {
                return Ok((slot, de));
            }
        }
        Err(DirLayerError::DirLayerOp("no such directory entry"))
    }

    /// Write `(name, inum)` into the first free slot of `inode`, or append
    /// a fresh slot (growing the directory) if none is free. Mirrors
    /// `add_entry` in the original namei engine.
    pub(crate) fn add_entry(
        &mut self,
        inode: &mut Inode,
        name: &str,
        inum: u64,
    ) -> Result<u64, DirLayerError> {
        if inode.get_ft() != FType::TDir {
            return Err(DirLayerError::DirLayerInput(
                "the given inode does not represent a directory",
            ));
        }
        let de = Self::new_de(inum, name)
            .ok_or(DirLayerError::DirLayerInput("invalid directory entry name"))?;

        if self.find_entry(inode, name).is_ok() {
            return Err(DirLayerError::DirLayerOp(
                "an entry with this name already exists",
            ));
        }

        let mut free_slot = None;
        for slot in 0..Self::nslots(inode) {
            let existing = self.read_slot(inode, slot)?;
            if existing.inum == 0 {
                free_slot = Some(slot);
                break;
            }
        }
        let slot = free_slot.unwrap_or_else(|| Self::nslots(inode));
        self.write_slot(inode, slot, &de)?;

        if inum != inode.get_inum() {
            let mut target = self.i_get(inum)?;
            if target.get_ft() == FType::TFree {
                return Err(DirLayerError::DirLayerInput(
                    "trying to link to an inode that is not in use",
                ));
            }
            target.disk_node.nlink += 1;
            target.disk_node.ctime = now();
            self.i_put(&target)?;
        }

        Ok(slot * (*DIRENTRY_SIZE))
    }
}

impl FileSysSupport for DirLayerFs {
    type Error = DirLayerError;

    fn sb_valid(sb: &SuperBlock) -> bool {
        InodeLayerFs::sb_valid(sb)
    }

    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error> {
        let mut inode_fs = InodeLayerFs::mkfs(path, sb)?;
        let root = <<Self as InodeSupport>::Inode as InodeLike>::new(1, &FType::TDir, 1, 0, &[])
            .ok_or(DirLayerError::DirLayerOp("could not initialize root inode"))?;
        inode_fs.i_put(&root)?;
        Ok(DirLayerFs { inode_fs })
    }

    fn mountfs(dev: Device) -> Result<Self, Self::Error> {
        Ok(DirLayerFs {
            inode_fs: InodeLayerFs::mountfs(dev)?,
        })
    }

    fn unmountfs(self) -> Device {
        self.inode_fs.unmountfs()
    }
}

impl BlockSupport for DirLayerFs {
    fn b_get(&self, i: u64) -> Result<Block, Self::Error> {
        Ok(self.inode_fs.b_get(i)?)
    }

    fn b_put(&mut self, b: &Block) -> Result<(), Self::Error> {
        Ok(self.inode_fs.b_put(b)?)
    }

    fn b_free(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.inode_fs.b_free(i)?)
    }

    fn b_zero(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.inode_fs.b_zero(i)?)
    }

    fn b_alloc(&mut self) -> Result<u64, Self::Error> {
        Ok(self.inode_fs.b_alloc()?)
    }

    fn sup_get(&self) -> Result<SuperBlock, Self::Error> {
        Ok(self.inode_fs.sup_get()?)
    }

    fn sup_put(&mut self, sup: &SuperBlock) -> Result<(), Self::Error> {
        Ok(self.inode_fs.sup_put(sup)?)
    }
}

impl InodeSupport for DirLayerFs {
    type Inode = Inode;

    fn i_get(&self, i: u64) -> Result<Self::Inode, Self::Error> {
        Ok(self.inode_fs.i_get(i)?)
    }

    fn i_put(&mut self, ino: &Self::Inode) -> Result<(), Self::Error> {
        Ok(self.inode_fs.i_put(ino)?)
    }

    fn i_free(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.inode_fs.i_free(i)?)
    }

    fn i_alloc(&mut self, ft: FType) -> Result<u64, Self::Error> {
        Ok(self.inode_fs.i_alloc(ft)?)
    }

    fn i_trunc(&mut self, inode: &mut Self::Inode) -> Result<(), Self::Error> {
        Ok(self.inode_fs.i_trunc(inode)?)
    }
}

impl InodeRWSupport for DirLayerFs {
    fn i_read(
        &self,
        inode: &Self::Inode,
        buf: &mut Buffer,
        off: u64,
        n: u64,
    ) -> Result<u64, Self::Error> {
        Ok(self.inode_fs.i_read(inode, buf, off, n)?)
    }

    fn i_write(
        &mut self,
        inode: &mut Self::Inode,
        buf: &Buffer,
        off: u64,
        n: u64,
    ) -> Result<(), Self::Error> {
        Ok(self.inode_fs.i_write(inode, buf, off, n)?)
    }
}

impl DirectorySupport for DirLayerFs {
    fn new_de(inum: u64, name: &str) -> Option<DirEntry> {
        if name.is_empty() {
            return None;
        }
        let mut dir_entry = DirEntry {
            inum,
            name: ['\0'; DIRNAME_SIZE],
        };
        Self::set_name_str(&mut dir_entry, name)?;
        Some(dir_entry)
    }

    fn get_name_str(de: &DirEntry) -> String {
        let mut name = String::new();
        for ch in de.name.iter() {
            if *ch == '\0' {
                break;
            }
            name.push(*ch);
        }
        name
    }

    fn set_name_str(de: &mut DirEntry, name: &str) -> Option<()> {
        let valid_special = name == "." || name == "..";
        if name.is_empty()
            || name.len() > DIRNAME_SIZE
            || !(valid_special || name.chars().all(char::is_alphanumeric))
        {
            return None;
        }
        de.name = ['\0'; DIRNAME_SIZE];
        for (i, c) in name.chars().enumerate() {
            de.name[i] = c;
        }
        Some(())
    }

    fn dirlookup(
        &self,
        inode: &Self::Inode,
        name: &str,
    ) -> Result<(Self::Inode, u64), Self::Error> {
        let (slot, de) = self.find_entry(inode, name)?;
        let target = self.i_get(de.inum)?;
        Ok((target, slot * (*DIRENTRY_SIZE)))
    }

    fn dirlink(
        &mut self,
        inode: &mut Self::Inode,
        name: &str,
        inum: u64,
    ) -> Result<u64, Self::Error> {
        self.add_entry(inode, name, inum)
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
    fn link_then_lookup() {
        let path = disk_prep_path("dir_layer", "link_lookup");
        let sb = test_sb();
        let mut fs = DirLayerFs::mkfs(&path, &sb).unwrap();
        let mut root = fs.i_get(1).unwrap();

        let file_inum = fs.i_alloc(FType::TFile).unwrap();
        fs.dirlink(&mut root, "hello", file_inum).unwrap();

        let (found, _) = fs.dirlookup(&root, "hello").unwrap();
        assert_eq!(found.get_inum(), file_inum);
        assert!(fs.dirlookup(&root, "nope").is_err());

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn reuses_freed_slots() {
        let path = disk_prep_path("dir_layer", "reuse_slots");
        let sb = test_sb();
        let mut fs = DirLayerFs::mkfs(&path, &sb).unwrap();
        let mut root = fs.i_get(1).unwrap();

        let a = fs.i_alloc(FType::TFile).unwrap();
        let off_a = fs.dirlink(&mut root, "a", a).unwrap();

        let de = DirEntry {
            inum: 0,
            name: ['\0'; DIRNAME_SIZE],
        };
        let mut buf = Buffer::new_zero(*DIRENTRY_SIZE);
        buf.serialize_into(&de, 0).unwrap();
        fs.i_write(&mut root, &buf, off_a, *DIRENTRY_SIZE).unwrap();

        let b = fs.i_alloc(FType::TFile).unwrap();
        let off_b = fs.dirlink(&mut root, "b", b).unwrap();
        assert_eq!(off_a, off_b);

        disk_destruct(fs.unmountfs(), &path);
    }
}
