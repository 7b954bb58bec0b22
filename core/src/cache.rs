//! An inode layer fronted by a shared, mutable inode cache.
//!
//! [`InodeLayerFs`] hands out independent, owned [`Inode`] copies: two
//! `i_get` calls for the same inum return two values that can drift apart
//! until one is written back. [`CachedInodeFs`] instead keeps at most
//! `capacity` inodes in memory as [`InodeCached`] handles — clones of the
//! same handle share the same underlying inode, so a mutation made through
//! one clone is visible through all of them, and a repeated `i_get` for an
//! inode already in the cache never touches disk.
//!
//! [`InodeLayerFs`]: crate::inode_layer::InodeLayerFs
//! [`Inode`]: namei_api::types::Inode

use namei_api::controller::Device;
use namei_api::fs::{BlockSupport, FileSysSupport, InodeRWSupport, InodeSupport};
use namei_api::types::{Block, Buffer, FType, Inode, InodeLike, Mode, SuperBlock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use super::error::InodeLayerError;
use super::inode_layer::InodeLayerFs;

/// A shareable handle to a cached inode.
///
/// Cloning an `InodeCached` is cheap (an `Rc` bump) and yields a handle to
/// the *same* inode: mutating one clone through [`InodeRWSupport::i_write`]
/// is visible to every other clone, unlike a plain [`Inode`] returned from
/// [`InodeLayerFs`].
///
/// [`InodeLayerFs`]: crate::inode_layer::InodeLayerFs
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct InodeCached(Rc<RefCell<Inode>>);

impl InodeCached {
    fn new(inode: Inode) -> Self {
        InodeCached(Rc::new(RefCell::new(inode)))
    }

    /// How many live handles (including this one) refer to the same inode.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl InodeLike for InodeCached {
    fn new(inum: u64, ft: &FType, nlink: u64, size: u64, blocks: &[u64]) -> Option<Self> {
        Inode::new_like(inum, ft, nlink, size, blocks).map(InodeCached::new)
    }

    fn get_ft(&self) -> FType {
        self.0.borrow().get_ft()
    }

    fn get_nlink(&self) -> u64 {
        self.0.borrow().get_nlink()
    }

    fn get_size(&self) -> u64 {
        self.0.borrow().get_size()
    }

    fn get_block(&self, i: u64) -> u64 {
        self.0.borrow().get_block(i)
    }

    fn get_inum(&self) -> u64 {
        self.0.borrow().get_inum()
    }

    fn get_mode(&self) -> Mode {
        self.0.borrow().get_mode()
    }

    fn get_uid(&self) -> u16 {
        self.0.borrow().get_uid()
    }

    fn get_gid(&self) -> u16 {
        self.0.borrow().get_gid()
    }
}

/// Small helper so [`InodeCached::new`] can build a plain [`Inode`] through
/// the same constructor logic `InodeLike` provides for it, without requiring
/// callers to import both traits.
trait NewLike: Sized {
    fn new_like(inum: u64, ft: &FType, nlink: u64, size: u64, blocks: &[u64]) -> Option<Self>;
}

impl NewLike for Inode {
    fn new_like(inum: u64, ft: &FType, nlink: u64, size: u64, blocks: &[u64]) -> Option<Inode> {
        <Inode as InodeLike>::new(inum, ft, nlink, size, blocks)
    }
}

/// Filesystem with a shared, mutable inode cache in front of
/// [`InodeLayerFs`].
#[derive(Debug)]
pub struct CachedInodeFs {
    inode_fs: InodeLayerFs,
    cache: RefCell<HashMap<u64, InodeCached>>,
    capacity: usize,
}

impl CachedInodeFs {
    /// Wrap `inode_fs` with a cache holding at most `capacity` entries.
    ///
    /// A `capacity` of 0 disables caching (every lookup goes straight to
    /// disk), which is a legal, if pointless, configuration.
    pub fn with_capacity(inode_fs: InodeLayerFs, capacity: usize) -> Self {
        CachedInodeFs {
            inode_fs,
            cache: RefCell::new(HashMap::new()),
            capacity,
        }
    }

    /// Borrow the cached superblock.
    pub fn sup_as_ref(&self) -> &SuperBlock {
        self.inode_fs.sup_as_ref()
    }

    /// Number of inodes currently resident in the cache.
    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Insert `entry` into the cache, evicting an arbitrary entry first if
    /// the cache is already at capacity. A free inode never gets inserted:
    /// callers that fetched a free inode to free it must route around the
    /// cache entirely (see [`Self::i_free`]).
    fn cache_insert(&self, inum: u64, entry: InodeCached) {
        if self.capacity == 0 {
            return;
        }
        let mut cache = self.cache.borrow_mut();
        if !cache.contains_key(&inum) && cache.len() >= self.capacity {
            if let Some(&victim) = cache.keys().next() {
                cache.remove(&victim);
            }
        }
        cache.insert(inum, entry);
    }
}

impl FileSysSupport for CachedInodeFs {
    type Error = InodeLayerError;

    fn sb_valid(sb: &SuperBlock) -> bool {
        InodeLayerFs::sb_valid(sb)
    }

    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error> {
        Ok(CachedInodeFs::with_capacity(
            InodeLayerFs::mkfs(path, sb)?,
            16,
        ))
    }

    fn mountfs(dev: Device) -> Result<Self, Self::Error> {
        Ok(CachedInodeFs::with_capacity(
            InodeLayerFs::mountfs(dev)?,
            16,
        ))
    }

    fn unmountfs(self) -> Device {
        self.inode_fs.unmountfs()
    }
}

impl BlockSupport for CachedInodeFs {
    fn b_get(&self, i: u64) -> Result<Block, Self::Error> {
        self.inode_fs.b_get(i)
    }

    fn b_put(&mut self, b: &Block) -> Result<(), Self::Error> {
        self.inode_fs.b_put(b)
    }

    fn b_free(&mut self, i: u64) -> Result<(), Self::Error> {
        self.inode_fs.b_free(i)
    }

    fn b_zero(&mut self, i: u64) -> Result<(), Self::Error> {
        self.inode_fs.b_zero(i)
    }

    fn b_alloc(&mut self) -> Result<u64, Self::Error> {
        self.inode_fs.b_alloc()
    }

    fn sup_get(&self) -> Result<SuperBlock, Self::Error> {
        self.inode_fs.sup_get()
    }

    fn sup_put(&mut self, sup: &SuperBlock) -> Result<(), Self::Error> {
        self.inode_fs.sup_put(sup)
    }
}

impl InodeSupport for CachedInodeFs {
    type Inode = InodeCached;

    /// Looks the inode up in the cache first; on a miss, reads it from disk
    /// and inserts the fresh handle into the cache before returning it. The
    /// cache is behind a `RefCell`, so this needs no `&mut self`.
    fn i_get(&self, i: u64) -> Result<Self::Inode, Self::Error> {
        if let Some(entry) = self.cache.borrow().get(&i) {
            return Ok(entry.clone());
        }
        let disk_inode = self.inode_fs.i_get(i)?;
        let entry = InodeCached::new(disk_inode);
        self.cache_insert(i, entry.clone());
        Ok(entry)
    }

    fn i_put(&mut self, ino: &Self::Inode) -> Result<(), Self::Error> {
        self.inode_fs.i_put(&ino.0.borrow())
    }

    /// Frees `i` if its cached (or, failing that, on-disk) link count has
    /// dropped to 0 and no other handle still references it.
    fn i_free(&mut self, i: u64) -> Result<(), Self::Error> {
        // Inspected through a borrowed reference, never a clone: cloning the
        // `Rc` here would itself count as "another handle" and make the
        // still-referenced check below always fail.
        let snapshot = {
            let cache = self.cache.borrow();
            cache.get(&i).map(|entry| {
                let node = entry.0.borrow();
                (entry.strong_count(), node.get_ft(), node.get_nlink())
            })
        };
        if let Some((count, ft, nlink)) = snapshot {
            if count > 1 {
                return Err(InodeLayerError::InodeLayerOp(
                    "inode is still referenced elsewhere and cannot be freed",
                ));
            }
            if ft == FType::TFree {
                return Err(InodeLayerError::InodeLayerOp("trying to free a free inode"));
            }
            if nlink != 0 {
                return Ok(());
            }
            self.inode_fs.i_free(i)?;
            self.cache.borrow_mut().remove(&i);
            return Ok(());
        }
        // Not cached: free it directly through the uncached layer so a
        // lingering free entry never shadows the freshly-freed disk inode.
        self.inode_fs.i_free(i)
    }

    /// Allocates a fresh inode on disk and eagerly reads it into the cache,
    /// replacing any stale free entry that may still be cached under the
    /// same inum.
    fn i_alloc(&mut self, ft: FType) -> Result<u64, Self::Error> {
        let inum = self.inode_fs.i_alloc(ft)?;
        let disk_inode = self.inode_fs.i_get(inum)?;
        self.cache_insert(inum, InodeCached::new(disk_inode));
        Ok(inum)
    }

    fn i_trunc(&mut self, inode: &mut Self::Inode) -> Result<(), Self::Error> {
        let mut node = inode.0.borrow_mut();
        self.inode_fs.i_trunc(&mut node)
    }
}

impl InodeRWSupport for CachedInodeFs {
    fn i_read(
        &self,
        inode: &Self::Inode,
        buf: &mut Buffer,
        off: u64,
        n: u64,
    ) -> Result<u64, Self::Error> {
        self.inode_fs.i_read(&inode.0.borrow(), buf, off, n)
    }

    fn i_write(
        &mut self,
        inode: &mut Self::Inode,
        buf: &Buffer,
        off: u64,
        n: u64,
    ) -> Result<(), Self::Error> {
        let mut node = inode.0.borrow_mut();
        self.inode_fs.i_write(&mut node, buf, off, n)
    }
}
