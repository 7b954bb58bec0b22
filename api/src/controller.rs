//! Implementation of a physical disk and a very simple device controller for it.
//! The device and its contents are represented by a file on the host file
//! system that is memory-mapped and stored in a `Device` struct.
//! When initializing the controller, supply either a path to a non-existing
//! file, which will then be created and used as the contents of the device,
//! or a path to an existing file, which will be opened and checked.
//! Provides a basic block read and write operation on a device at a given offset.
//! The memory-mapped file is what the read and write functions operate on.
//!
//! No provisions have been made to properly lock the file backing the
//! device, so do not fiddle with it while a file system is running.

use super::error;
use super::error::ApiError;
use super::types::Block;
use memmap::MmapMut;
use std::{
    fs::{remove_file, OpenOptions},
    path::{Path, PathBuf},
};

/// Struct representing the state of a hard drive disk (HDD).
/// The implementation of this structure is the controller that allows us to
/// read disk blocks from the disk, and write disk blocks to the disk.
#[derive(Debug)]
pub struct Device {
    /// Size of the blocks that this disk reads and writes
    pub block_size: u64,
    /// Total number of blocks this disk consists of
    pub nblocks: u64,
    /// Path to the file on the host file system used to back this device
    path: PathBuf,
    /// Memory-mapped contents of the above file. Manipulated in the read and write functions.
    contents: MmapMut,
}

/// Small enum, used to specify whether we expect to open a new file system
/// or load an existing one.
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum DiskState {
    /// Creating a new disk image
    New,
    /// Loading an old disk image
    Load,
}

use self::DiskState::*;
impl DiskState {
    /// Convert a boolean to a `DiskState`
    pub fn new(ex: bool) -> DiskState {
        match ex {
            true => Load,
            false => New,
        }
    }
}

impl Drop for Device {
    /// Persists all writes before releasing ownership of the device, as long
    /// as the backing file still exists.
    fn drop(&mut self) {
        if self.path.exists() {
            self.contents.flush().unwrap();
        }
    }
}

impl Device {
    /// Core function handling both `new` and `load`, based on the value of
    /// the switch `ds`, representing whether to load or create a disk.
    pub fn create_device<P: AsRef<Path>>(
        path: P,
        block_size: u64,
        nblocks: u64,
        ds: DiskState,
    ) -> error::Result<Device> {
        let path_buf = path.as_ref().to_path_buf();
        let mmapf = mmap_path(path, block_size * nblocks, ds)?;
        Ok(Device {
            block_size,
            nblocks,
            path: path_buf,
            contents: mmapf,
        })
    }

    /// Create a *new* disk device, given a `path` to store its image, a
    /// `block_size`, and the total number of blocks. The new device has all
    /// bytes set to 0.
    ///
    /// If `block_size` is smaller than the size of the main on-disk types
    /// (the superblock, inodes), the file system will misbehave at runtime;
    /// this is not checked defensively here.
    /// Errors if the file represented by `path` already exists.
    pub fn new<P: AsRef<Path>>(path: P, block_size: u64, nblocks: u64) -> error::Result<Device> {
        Device::create_device(path, block_size, nblocks, New)
    }

    /// Load an *existing* disk device, given its `block_size` and number of blocks.
    /// Errors if the file represented by `path` does not yet exist.
    pub fn load<P: AsRef<Path>>(path: P, block_size: u64, nblocks: u64) -> error::Result<Device> {
        Device::create_device(path, block_size, nblocks, Load)
    }

    /// End the lifetime of this disk, and remove the file backing it.
    /// Assumes no other links to the backing file exist.
    /// Panics if removing the file fails.
    pub fn destruct(self) {
        remove_file(&self.path).unwrap();
    }

    /// Size of this device in bytes
    pub fn device_size(&self) -> u64 {
        self.block_size * self.nblocks
    }

    /// Path of the file backing this device
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    fn index_to_addr(&self, index: u64) -> u64 {
        self.block_size * index
    }

    /// Read `nb` bytes from the device starting at address `addr`.
    /// Errors if a read past the end of the device is attempted.
    fn read(&self, addr: u64, nb: u64) -> error::Result<Box<[u8]>> {
        if addr + nb > self.device_size() {
            return Err(ApiError::ControllerInput("read past the end of the device"));
        }
        let start = addr as usize;
        let end = (addr + nb) as usize;
        Ok(self.contents[start..end].into())
    }

    /// Read the block with index `index` from the device.
    /// Errors if the block index is too high.
    pub fn read_block(&self, index: u64) -> error::Result<Block> {
        let addr = self.index_to_addr(index);
        let block_data = self.read(addr, self.block_size)?;
        Ok(Block::new(index, block_data))
    }

    /// Write the given buffer into memory, if it does not cause a device overflow.
    /// Errors if a write past the end of the device is attempted.
    fn write(&mut self, addr: u64, b: &[u8]) -> error::Result<()> {
        if addr + b.len() as u64 > self.device_size() {
            return Err(ApiError::ControllerInput("write past the end of the device"));
        }
        let start = addr as usize;
        let end = (addr as usize) + b.len();
        self.contents[start..end].copy_from_slice(b);
        Ok(())
    }

    /// Write a given block `b` into the device at its own `block_no`.
    /// Errors if `b` is not exactly block-sized, or if its index is too high.
    pub fn write_block(&mut self, b: &Block) -> error::Result<()> {
        if b.len() != self.block_size {
            return Err(ApiError::ControllerInput(
                "trying to write a non-block-sized block",
            ));
        }
        let addr = self.index_to_addr(b.block_no);
        self.write(addr, b.contents_as_ref())
    }
}

/// Either open or create the specified file path, depending on `ex`.
/// If the path already exists, check that the device represented by it has the correct size.
fn mmap_path<P: AsRef<Path>>(path: P, dsize: u64, ex: DiskState) -> error::Result<MmapMut> {
    let exists = DiskState::new(path.as_ref().exists());
    if exists != ex {
        if ex == Load {
            return Err(ApiError::ControllerInput(
                "tried to load a non-existing file path",
            ));
        } else {
            return Err(ApiError::ControllerInput(
                "tried to create a pre-existing file path",
            ));
        }
    }

    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    if ex == Load {
        if f.metadata()?.len() != dsize {
            return Err(ApiError::ControllerInput(
                "device size does not match provided size",
            ));
        }
    } else {
        f.set_len(dsize)?;
    }

    let data = unsafe { memmap::MmapOptions::new().map_mut(&f)? };
    Ok(data)
}

// **IMPORTANT**: Rust runs tests in parallel by default, and this file
// system has not been designed to support concurrent access to the same
// backing file. Each test below uses its own disk image for that reason.
#[cfg(test)]
mod tests {

    use super::Device;
    use crate::types::Block;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::{Path, PathBuf};

    static BLOCK_SIZE: u64 = 10;
    static NBBLOCKS: u64 = 10;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-controller-".to_string() + name);
        path.push("img");

        if path.exists() {
            remove_file(&path).unwrap();
        }
        {
            let prefix = path.parent().unwrap();
            create_dir_all(prefix).unwrap();
        }

        path
    }

    fn disk_setup(path: &Path) -> Device {
        Device::new(path, BLOCK_SIZE, NBBLOCKS).unwrap()
    }

    fn disk_open(path: &Path) -> Device {
        Device::load(path, BLOCK_SIZE, NBBLOCKS).unwrap()
    }

    fn disk_destruct(dev: Device) {
        let path = dev.path.to_owned();
        dev.destruct();
        remove_dir(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn create_disk_test() {
        let path = disk_prep_path("create");
        let mut dev = disk_setup(&path);

        let i1 = 3;
        let i2 = 9;
        let zero_block = |i| Block::new_zero(i, 10);
        let br = dev.read_block(i1).unwrap();
        assert_eq!(br, zero_block(i1));
        let br = dev.read_block(i2).unwrap();
        assert_eq!(br, zero_block(i2));

        let ie = NBBLOCKS;
        assert!(dev.read_block(ie).is_err());
        assert!(dev.write_block(&zero_block(ie)).is_err());

        let sized_block = |s: u64| Block::new_zero(i1, s);
        assert!(dev.write_block(&sized_block(BLOCK_SIZE + 1)).is_err());
        assert!(dev.write_block(&sized_block(BLOCK_SIZE - 1)).is_err());

        let block_data = (0..10).collect();
        let bw = Block::new(i1, block_data);
        dev.write_block(&bw).unwrap();
        let br = dev.read_block(i1).unwrap();
        assert_eq!(br, bw);

        let raw_data = &vec![1, 2, 3, 4, 5];
        dev.write(78, raw_data).unwrap();
        let br = dev.read_block(7).unwrap();
        let mut block_data = vec![0; 8];
        block_data.append(&mut vec![1, 2]);
        let bw = Block::new(7, block_data.into_boxed_slice());
        assert_eq!(br, bw);
        let br = dev.read_block(8).unwrap();
        let mut block_data = vec![3, 4, 5];
        block_data.append(&mut vec![0; 7]);
        let bw = Block::new(8, block_data.into_boxed_slice());
        assert_eq!(br, bw);

        let raw_data = dev.read(35, 5).unwrap();
        assert_eq!(raw_data, vec!(5, 6, 7, 8, 9).into_boxed_slice());

        disk_destruct(dev);
        assert!(!path.exists());
    }

    #[test]
    fn load_existing_disk_test() {
        let path = disk_prep_path("load");
        let mut dev = disk_setup(&path);

        let i1 = 0;
        let i2 = 8;
        let block_data1 = (0..10).collect();
        let block_data2 = (0..10).rev().collect();
        let bw1 = Block::new(i1, block_data1);
        let bw2 = Block::new(i2, block_data2);
        dev.write_block(&bw1).unwrap();
        dev.write_block(&bw2).unwrap();

        drop(dev);

        let dev = disk_open(&path);
        let br1 = dev.read_block(i1).unwrap();
        let br2 = dev.read_block(i2).unwrap();
        assert_eq!(br1, bw1);
        assert_eq!(br2, bw2);

        disk_destruct(dev);
        assert!(!path.exists());
    }
}
