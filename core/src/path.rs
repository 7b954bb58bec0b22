//! The namei engine: pathname resolution and the directory-structure
//! mutators built on top of [`DirLayerFs`].
//!
//! Everything here is a concrete method on [`PathFs`] rather than a trait,
//! since path resolution is specific to this one filesystem rather than a
//! shape another implementation would want to swap in. The lower traits
//! (`FileSysSupport` through `DirectorySupport`) still do all the disk I/O;
//! this module only adds the walking, symlink-following and multi-step
//! mutation logic on top.
//!
//! [`DirLayerFs`]: crate::dir_layer::DirLayerFs

use namei_api::controller::Device;
use namei_api::fs::{BlockSupport, DirectorySupport, FileSysSupport, InodeRWSupport, InodeSupport};
use namei_api::types::{
    Buffer, DirEntry, FType, Inode, InodeLike, Mode, SuperBlock, DIRENTRY_SIZE, DIRNAME_SIZE,
    ROOT_INUM,
};
use std::path::Path;
use std::sync::Mutex;

use super::dir_layer::DirLayerFs;
use super::error::PathLayerError;
use super::inode_layer::now;

/// Execute permission bit, as used by [`permission`].
pub const MASK_EXEC: u8 = 1;
/// Write permission bit, as used by [`permission`].
pub const MASK_WRITE: u8 = 2;
/// Read permission bit, as used by [`permission`].
pub const MASK_READ: u8 = 4;

/// Bound on the number of symbolic links followed while resolving a single
/// path, to turn a symlink cycle into an error instead of a livelock.
pub const MAX_SYMLINK_DEPTH: u32 = 8;

/// Per-task state the resolver consults: identity for permission checks plus
/// the task's notion of its root and working directory.
///
/// Stands in for the task-private state the original kernel keeps inline in
/// its process table (`current->root`, `current->pwd`, `current->euid`, …),
/// modeled here as a plain capability object passed into every resolver call
/// rather than implicit global state.
#[derive(Debug, Clone)]
pub struct Task {
    /// Effective user id.
    pub euid: u16,
    /// Effective group id.
    pub egid: u16,
    /// Supplementary group ids.
    pub gids: Vec<u16>,
    /// Creation mode mask: bits in `umask` are cleared from a new file's
    /// requested permission bits.
    pub umask: u16,
    /// Inode number of this task's root. `..` resolves to itself here,
    /// modeling a pseudo-root (e.g. a chroot) rather than always being the
    /// filesystem's true root.
    pub root: u64,
    /// Inode number of this task's current working directory.
    pub cwd: u64,
}

impl Task {
    /// A superuser task rooted and anchored at the filesystem root.
    pub fn root_task() -> Task {
        Task {
            euid: 0,
            egid: 0,
            gids: Vec::new(),
            umask: 0o022,
            root: ROOT_INUM,
            cwd: ROOT_INUM,
        }
    }

    fn in_group(&self, gid: u16) -> bool {
        self.egid == gid || self.gids.contains(&gid)
    }
}

/// Maps the inode that is this device's filesystem root onto the inode
/// (conceptually: on some other, already-mounted device) that it is
/// grafted onto, so that `..` crossing a mount point can rebind the walker
/// onto a different part of the tree instead of stopping at the true root.
///
/// This core manages a single device, so in practice there is at most one
/// entry: whether `ROOT_INUM` of this filesystem is itself mounted on some
/// inode and, if so, which one.
#[derive(Debug, Default)]
pub struct MountTable {
    mounted_on: Option<u64>,
}

impl MountTable {
    /// A fresh table recording that this filesystem is not mounted anywhere.
    pub fn new() -> MountTable {
        MountTable::default()
    }

    /// Record that this filesystem's root is mounted on `host_inum` (an
    /// inode of whatever filesystem hosts it).
    pub fn mount(&mut self, host_inum: u64) {
        self.mounted_on = Some(host_inum);
    }

    /// Clear the mount record, if any.
    pub fn unmount(&mut self) {
        self.mounted_on = None;
    }

    /// The inode `..` should cross to from this filesystem's root, if any.
    pub fn mount_point(&self) -> Option<u64> {
        self.mounted_on
    }
}

/// Access mode requested by [`PathFs::open_namei`]: `None` stat-like open,
/// or one of the 4/2/6 read/write/read-write permission masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// No data access requested (a stat-like open).
    None,
    /// Read access (permission mask 4).
    Read,
    /// Write access (permission mask 2).
    Write,
    /// Read and write access (permission mask 6).
    ReadWrite,
}

impl AccessMode {
    fn mask(self) -> u8 {
        match self {
            AccessMode::None => 0,
            AccessMode::Read => MASK_READ,
            AccessMode::Write => MASK_WRITE,
            AccessMode::ReadWrite => MASK_READ | MASK_WRITE,
        }
    }
}

/// Flags recognized by [`PathFs::open_namei`].
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    /// Requested access mode.
    pub access: AccessMode,
    /// Create the file if it does not exist.
    pub creat: bool,
    /// Fail if the file already exists (only meaningful with `creat`).
    pub excl: bool,
    /// Truncate an existing regular file to length 0.
    pub trunc: bool,
}

/// Permission check: does `task` have every bit of `mask` (exec=1, write=2,
/// read=4, or a combination) on `inode`?
///
/// An inode with `nlink == 0` denies access unconditionally, even to the
/// superuser: a deleted-but-open file cannot be re-opened by name.
pub fn permission(inode: &Inode, mask: u8, task: &Task) -> bool {
    if inode.get_nlink() == 0 {
        return false;
    }
    if task.euid == 0 {
        return true;
    }
    let is_owner = task.euid == inode.get_uid();
    let in_group = task.in_group(inode.get_gid());
    let triple = inode.get_mode().triple_for(is_owner, in_group);
    triple & mask == mask
}

/// Does `name` match directory entry `de`? An empty `name` matches `.`
/// (supporting paths with adjacent slashes); a name longer than
/// `DIRNAME_SIZE` can never match; a zero `inum` marks a free slot and never
/// matches anything.
pub fn names_match(name: &str, de: &DirEntry) -> bool {
    if de.inum == 0 {
        return false;
    }
    if name.is_empty() {
        return DirLayerFs::get_name_str(de) == ".";
    }
    if name.chars().count() > DIRNAME_SIZE {
        return false;
    }
    DirLayerFs::get_name_str(de) == name
}

fn split_path(pathname: &str) -> (&str, &str) {
    match pathname.rfind('/') {
        Some(0) => ("/", &pathname[1..]),
        Some(idx) => (&pathname[..idx], &pathname[idx + 1..]),
        None => ("", pathname),
    }
}

/// Namei-path-resolution core, layered on top of [`DirLayerFs`].
///
/// Owns the process-wide rename lock and the mount table, in addition to the
/// directory-level filesystem every resolver and mutator ultimately reads
/// and writes through.
#[derive(Debug)]
pub struct PathFs {
    dir_fs: DirLayerFs,
    mount_table: MountTable,
    rename_lock: Mutex<()>,
}

impl PathFs {
    /// Borrow the cached superblock.
    pub fn sup_as_ref(&self) -> &SuperBlock {
        self.dir_fs.sup_as_ref()
    }

    /// Borrow the mount table, to record or clear a mount.
    pub fn mount_table_mut(&mut self) -> &mut MountTable {
        &mut self.mount_table
    }

    fn read_slot(&self, inode: &Inode, slot: u64) -> Result<DirEntry, PathLayerError> {
        let mut buf = Buffer::new_zero(*DIRENTRY_SIZE);
        self.dir_fs
            .i_read(inode, &mut buf, slot * (*DIRENTRY_SIZE), *DIRENTRY_SIZE)?;
        Ok(buf.deserialize_from(0)?)
    }

    fn clear_entry(&mut self, dir: &mut Inode, off: u64) -> Result<(), PathLayerError> {
        let blank = DirEntry {
            inum: 0,
            name: ['\0'; DIRNAME_SIZE],
        };
        let mut buf = Buffer::new_zero(*DIRENTRY_SIZE);
        buf.serialize_into(&blank, 0)?;
        self.dir_fs.i_write(dir, &buf, off, *DIRENTRY_SIZE)?;
        Ok(())
    }

    fn rewrite_entry(&mut self, dir: &mut Inode, off: u64, inum: u64) -> Result<(), PathLayerError> {
        let mut de = self.read_slot(dir, off / (*DIRENTRY_SIZE))?;
        de.inum = inum;
        let mut buf = Buffer::new_zero(*DIRENTRY_SIZE);
        buf.serialize_into(&de, 0)?;
        self.dir_fs.i_write(dir, &buf, off, *DIRENTRY_SIZE)?;
        Ok(())
    }

    /// Resolve `..` specially (pseudo-root clamps to `.`, the device root
    /// crosses a recorded mount point); otherwise an ordinary directory
    /// lookup. Mirrors the mount-point rebinding `find_entry` performs in
    /// the original engine, but as an explicit pre-step here instead.
    fn lookup_component(&self, dir: &Inode, name: &str, task: &Task) -> Result<Inode, PathLayerError> {
        if name == ".." {
            // A chrooted task's pseudo-root folds `..` to `.`. Checked before
            // the true-device-root case below, since an ordinary task's root
            // equals `ROOT_INUM` and must still be eligible to cross a mount
            // point instead of always folding to itself.
            if dir.get_inum() == task.root && task.root != ROOT_INUM {
                return Ok(self.dir_fs.i_get(dir.get_inum())?);
            }
            if dir.get_inum() == ROOT_INUM {
                if let Some(mp) = self.mount_table.mount_point() {
                    return Ok(self.dir_fs.i_get(mp)?);
                }
                return Ok(self.dir_fs.i_get(ROOT_INUM)?);
            }
        }
        let (inode, _off) = self.dir_fs.dirlookup(dir, name)?;
        Ok(inode)
    }

    fn get_dir_inner(
        &mut self,
        pathname: &str,
        base: Option<Inode>,
        task: &Task,
        depth: &mut u32,
    ) -> Result<Inode, PathLayerError> {
        let mut cur = match base {
            Some(b) => b,
            None => self.dir_fs.i_get(task.cwd)?,
        };
        let mut rest = pathname;
        if let Some(stripped) = rest.strip_prefix('/') {
            cur = self.dir_fs.i_get(task.root)?;
            rest = stripped;
        }
        loop {
            if rest.is_empty() {
                return Ok(cur);
            }
            let (comp, remainder) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, ""),
            };
            if cur.get_ft() != FType::TDir {
                return Err(PathLayerError::NotDir(comp.to_string()));
            }
            if !permission(&cur, MASK_EXEC, task) {
                return Err(PathLayerError::Access(comp.to_string()));
            }
            let name = if comp.is_empty() { "." } else { comp };
            let next = self
                .lookup_component(&cur, name, task)
                .map_err(|_| PathLayerError::NoEntry(name.to_string()))?;
            cur = self.follow_link_inner(Some(cur), Some(next), task, depth)?;
            rest = remainder;
        }
    }

    fn dir_namei_inner(
        &mut self,
        pathname: &str,
        base: Option<Inode>,
        task: &Task,
        depth: &mut u32,
    ) -> Result<(Inode, String), PathLayerError> {
        let (dir_part, basename) = split_path(pathname);
        let parent = self.get_dir_inner(dir_part, base, task, depth)?;
        Ok((parent, basename.to_string()))
    }

    fn follow_link_inner(
        &mut self,
        parent: Option<Inode>,
        target: Option<Inode>,
        task: &Task,
        depth: &mut u32,
    ) -> Result<Inode, PathLayerError> {
        let target = target.ok_or_else(|| PathLayerError::NoEntry(String::new()))?;
        if target.get_ft() != FType::TLnk {
            return Ok(target);
        }
        *depth += 1;
        if *depth > MAX_SYMLINK_DEPTH {
            return Err(PathLayerError::SymlinkLoop(format!(
                "inode {}",
                target.get_inum()
            )));
        }
        let len = target.get_size();
        let mut buf = Buffer::new_zero(len);
        self.dir_fs.i_read(&target, &mut buf, 0, len)?;
        let link_target = String::from_utf8_lossy(buf.contents_as_ref())
            .trim_end_matches('\0')
            .to_string();
        let base = match parent {
            Some(p) => p,
            None => self.dir_fs.i_get(task.root)?,
        };
        // Unlike the original kernel's single-level `follow_link` ("does not
        // recurse into further symlinks"), this keeps following: `depth` is
        // shared across the whole chain, so a cycle still terminates via
        // `MAX_SYMLINK_DEPTH` instead of silently stopping one hop short.
        self._namei_inner(&link_target, Some(base), true, task, depth)
    }

    fn _namei_inner(
        &mut self,
        pathname: &str,
        base: Option<Inode>,
        follow: bool,
        task: &Task,
        depth: &mut u32,
    ) -> Result<Inode, PathLayerError> {
        let (parent, basename) = self.dir_namei_inner(pathname, base, task, depth)?;
        if basename.is_empty() {
            return Ok(parent);
        }
        let target = self
            .lookup_component(&parent, &basename, task)
            .map_err(|_| PathLayerError::NoEntry(basename.clone()))?;
        let mut resolved = if follow {
            self.follow_link_inner(Some(parent), Some(target), task, depth)?
        } else {
            target
        };
        resolved.disk_node.atime = now();
        self.dir_fs.i_put(&resolved)?;
        Ok(resolved)
    }

    /// Walk `pathname` to the directory it names, starting from `base` (or
    /// the task's working directory if absent). Leading `/` switches to the
    /// task's root. Every intermediate component is required to be a
    /// directory the task may execute-search, and any component that is
    /// itself a symlink is followed.
    pub fn get_dir(&mut self, pathname: &str, base: Option<Inode>, task: &Task) -> Result<Inode, PathLayerError> {
        let mut depth = 0;
        self.get_dir_inner(pathname, base, task, &mut depth)
    }

    /// `get_dir` over everything but the final component, returning the
    /// parent directory and the final component's name (empty if `pathname`
    /// ends in `/`).
    pub fn dir_namei(
        &mut self,
        pathname: &str,
        base: Option<Inode>,
        task: &Task,
    ) -> Result<(Inode, String), PathLayerError> {
        let mut depth = 0;
        self.dir_namei_inner(pathname, base, task, &mut depth)
    }

    /// Dereference one level of a symbolic link: if `target` is not a
    /// symlink, returns it unchanged (after verifying it is present). If it
    /// is a symlink, resolves its target relative to `parent` (or the
    /// task's root, if `parent` is absent).
    pub fn follow_link(
        &mut self,
        parent: Option<Inode>,
        target: Option<Inode>,
        task: &Task,
    ) -> Result<Inode, PathLayerError> {
        let mut depth = 0;
        self.follow_link_inner(parent, target, task, &mut depth)
    }

    /// Resolve `pathname` to its inode, following a symlink in the final
    /// component if there is one.
    pub fn namei(&mut self, pathname: &str, base: Option<Inode>, task: &Task) -> Result<Inode, PathLayerError> {
        let mut depth = 0;
        self._namei_inner(pathname, base, true, task, &mut depth)
    }

    /// Resolve `pathname` to its inode, without following a symlink named by
    /// the final component (though intermediate components are still
    /// followed, same as `namei`).
    pub fn lnamei(&mut self, pathname: &str, base: Option<Inode>, task: &Task) -> Result<Inode, PathLayerError> {
        let mut depth = 0;
        self._namei_inner(pathname, base, false, task, &mut depth)
    }

    /// Resolve or create `pathname` per `flags`, mirroring the classic
    /// `open()` semantics: `O_CREAT`/`O_EXCL`/`O_TRUNC` plus an access mode.
    pub fn open_namei(
        &mut self,
        pathname: &str,
        mut flags: OpenFlags,
        mode: Mode,
        task: &Task,
    ) -> Result<Inode, PathLayerError> {
        if flags.trunc && flags.access == AccessMode::None {
            flags.access = AccessMode::Write;
        }
        let create_mode = Mode::from_perm_bits(mode.bits() & 0o777 & !task.umask);

        let (mut parent, basename) = self.dir_namei(pathname, None, task)?;
        if basename.is_empty() {
            if flags.access == AccessMode::None && !flags.creat && !flags.trunc {
                return Ok(parent);
            }
            return Err(PathLayerError::IsDir(pathname.to_string()));
        }

        match self.lookup_component(&parent, &basename, task) {
            Err(_) => {
                if !flags.creat {
                    return Err(PathLayerError::NoEntry(basename));
                }
                if !permission(&parent, MASK_WRITE, task) {
                    return Err(PathLayerError::Access(basename));
                }
                let inum = self.dir_fs.i_alloc(FType::TFile)?;
                let mut new_inode = self.dir_fs.i_get(inum)?;
                new_inode.disk_node.mode = create_mode;
                new_inode.disk_node.uid = task.euid;
                new_inode.disk_node.gid = task.egid;
                new_inode.disk_node.atime = now();
                new_inode.disk_node.mtime = now();
                self.dir_fs.i_put(&new_inode)?;
                self.dir_fs.dirlink(&mut parent, &basename, inum)?;
                Ok(self.dir_fs.i_get(inum)?)
            }
            Ok(existing) => {
                if flags.excl {
                    return Err(PathLayerError::Exists(basename));
                }
                let mut target = self.follow_link(Some(parent), Some(existing), task)?;
                if target.get_ft() == FType::TDir && flags.access != AccessMode::None {
                    return Err(PathLayerError::IsDir(basename));
                }
                let mask = flags.access.mask();
                if mask != 0 && !permission(&target, mask, task) {
                    return Err(PathLayerError::Access(basename));
                }
                target.disk_node.atime = now();
                if flags.trunc {
                    self.dir_fs.i_trunc(&mut target)?;
                }
                self.dir_fs.i_put(&target)?;
                Ok(target)
            }
        }
    }

    fn resolve_parent_for_mutation(
        &mut self,
        pathname: &str,
        task: &Task,
    ) -> Result<(Inode, String), PathLayerError> {
        let (parent, basename) = self.dir_namei(pathname, None, task)?;
        if basename.is_empty() {
            return Err(PathLayerError::InvalidPath(
                "path has no final component".to_string(),
            ));
        }
        if !permission(&parent, MASK_WRITE, task) {
            return Err(PathLayerError::Access(basename));
        }
        Ok((parent, basename))
    }

    /// Create a device-special inode named by `pathname`. Superuser only.
    pub fn sys_mknod(
        &mut self,
        pathname: &str,
        ft: FType,
        mode: Mode,
        dev_id: u64,
        task: &Task,
    ) -> Result<Inode, PathLayerError> {
        if task.euid != 0 {
            return Err(PathLayerError::Permission(pathname.to_string()));
        }
        let (mut parent, basename) = self.resolve_parent_for_mutation(pathname, task)?;
        if self.lookup_component(&parent, &basename, task).is_ok() {
            return Err(PathLayerError::Exists(basename));
        }
        let inum = self.dir_fs.i_alloc(ft)?;
        let mut inode = self.dir_fs.i_get(inum)?;
        inode.disk_node.mode = mode;
        inode.disk_node.uid = task.euid;
        inode.disk_node.gid = task.egid;
        if ft.is_device() {
            inode.disk_node.direct_blocks[0] = dev_id;
        }
        inode.disk_node.atime = now();
        inode.disk_node.mtime = now();
        self.dir_fs.i_put(&inode)?;
        self.dir_fs.dirlink(&mut parent, &basename, inum)?;
        Ok(self.dir_fs.i_get(inum)?)
    }

    /// Create a directory named by `pathname`, with `.`/`..` entries already
    /// populated and `nlinks == 2`. Bumps the parent's `nlinks`.
    pub fn sys_mkdir(&mut self, pathname: &str, mode: Mode, task: &Task) -> Result<Inode, PathLayerError> {
        let (mut parent, basename) = self.resolve_parent_for_mutation(pathname, task)?;
        if self.lookup_component(&parent, &basename, task).is_ok() {
            return Err(PathLayerError::Exists(basename));
        }

        let inum = self.dir_fs.i_alloc(FType::TDir)?;
        let mut new_dir = self.dir_fs.i_get(inum)?;
        new_dir.disk_node.mode = mode;
        new_dir.disk_node.uid = task.euid;
        new_dir.disk_node.gid = task.egid;
        new_dir.disk_node.atime = now();
        new_dir.disk_node.mtime = now();
        self.dir_fs.i_put(&new_dir)?;

        self.dir_fs.dirlink(&mut new_dir, ".", inum)?;
        self.dir_fs.dirlink(&mut new_dir, "..", parent.get_inum())?;

        self.dir_fs.dirlink(&mut parent, &basename, inum)?;

        let mut new_dir = self.dir_fs.i_get(inum)?;
        new_dir.disk_node.nlink = 2;
        self.dir_fs.i_put(&new_dir)?;

        Ok(new_dir)
    }

    /// Remove the binding `pathname → inode`. Fails on directories. Obeys
    /// sticky-bit semantics: if the parent is sticky, only root, the file's
    /// owner or the parent's owner may unlink.
    pub fn sys_unlink(&mut self, pathname: &str, task: &Task) -> Result<(), PathLayerError> {
        let (mut parent, basename) = self.resolve_parent_for_mutation(pathname, task)?;
        let (mut target, off) = self
            .dir_fs
            .dirlookup(&parent, &basename)
            .map_err(|_| PathLayerError::NoEntry(basename.clone()))?;
        if target.get_ft() == FType::TDir {
            return Err(PathLayerError::IsDir(basename));
        }
        if parent.get_mode().contains(Mode::STICKY)
            && task.euid != 0
            && task.euid != target.get_uid()
            && task.euid != parent.get_uid()
        {
            return Err(PathLayerError::Permission(basename));
        }
        self.clear_entry(&mut parent, off)?;
        target.disk_node.nlink = target.disk_node.nlink.saturating_sub(1);
        target.disk_node.ctime = now();
        self.dir_fs.i_put(&target)?;
        if target.disk_node.nlink == 0 {
            self.dir_fs.i_free(target.get_inum())?;
        }
        Ok(())
    }

    /// Remove the empty directory named by `pathname`.
    pub fn sys_rmdir(&mut self, pathname: &str, task: &Task) -> Result<(), PathLayerError> {
        let (mut parent, basename) = self.resolve_parent_for_mutation(pathname, task)?;
        let (target, off) = self
            .dir_fs
            .dirlookup(&parent, &basename)
            .map_err(|_| PathLayerError::NoEntry(basename.clone()))?;
        if target.get_ft() != FType::TDir {
            return Err(PathLayerError::NotDir(basename));
        }
        if target.get_inum() == parent.get_inum() {
            // rmdir("."): the resolved target is the very directory it was
            // looked up in.
            return Err(PathLayerError::Permission(basename));
        }
        if !self.empty_dir(&target)? {
            return Err(PathLayerError::NotEmpty(basename));
        }
        self.clear_entry(&mut parent, off)?;
        let mut target = target;
        target.disk_node.nlink = 0;
        target.disk_node.ctime = now();
        self.dir_fs.i_put(&target)?;
        self.dir_fs.i_free(target.get_inum())?;

        parent.disk_node.nlink = parent.disk_node.nlink.saturating_sub(1);
        parent.disk_node.ctime = now();
        self.dir_fs.i_put(&parent)?;
        Ok(())
    }

    /// Create a symbolic link named by `pathname` whose target is
    /// `link_target` (at most 1023 bytes).
    pub fn sys_symlink(&mut self, pathname: &str, link_target: &str, task: &Task) -> Result<Inode, PathLayerError> {
        if link_target.len() > 1023 {
            return Err(PathLayerError::InvalidPath(
                "link target too long".to_string(),
            ));
        }
        let (mut parent, basename) = self.resolve_parent_for_mutation(pathname, task)?;
        if self.lookup_component(&parent, &basename, task).is_ok() {
            return Err(PathLayerError::Exists(basename));
        }

        let inum = self.dir_fs.i_alloc(FType::TLnk)?;
        let mut inode = self.dir_fs.i_get(inum)?;
        inode.disk_node.uid = task.euid;
        inode.disk_node.gid = task.egid;
        inode.disk_node.mode = Mode::from_perm_bits(0o777 & !task.umask);
        // The target block comes back zeroed from the allocator, so writing
        // exactly `link_target`'s bytes leaves a NUL terminator right after
        // them without counting it in `size`.
        let mut buf = Buffer::new_zero(link_target.len() as u64);
        buf.write_data(link_target.as_bytes(), 0)?;
        self.dir_fs.i_write(&mut inode, &buf, 0, buf.len())?;

        self.dir_fs.dirlink(&mut parent, &basename, inum)?;
        Ok(self.dir_fs.i_get(inum)?)
    }

    /// Create a new name `newpath` for the (non-directory) inode resolved
    /// from `oldpath`, with symlink following.
    pub fn sys_link(&mut self, oldpath: &str, newpath: &str, task: &Task) -> Result<(), PathLayerError> {
        let old_inode = self.namei(oldpath, None, task)?;
        if old_inode.get_ft() == FType::TDir {
            return Err(PathLayerError::Permission(oldpath.to_string()));
        }
        let (mut new_parent, basename) = self.resolve_parent_for_mutation(newpath, task)?;
        if self.lookup_component(&new_parent, &basename, task).is_ok() {
            return Err(PathLayerError::Exists(basename));
        }
        self.dir_fs.dirlink(&mut new_parent, &basename, old_inode.get_inum())?;
        Ok(())
    }

    /// Does `ancestor` inode number appear on the chain of `..` parents
    /// starting at `start`, before the device's own root is reached? Used
    /// by `sys_rename` to reject moving a directory into its own subtree.
    fn subdir(&mut self, start: &Inode, ancestor_inum: u64, task: &Task) -> Result<bool, PathLayerError> {
        let mut cur_inum = start.get_inum();
        loop {
            if cur_inum == ancestor_inum {
                return Ok(true);
            }
            let cur = self.dir_fs.i_get(cur_inum)?;
            if cur.get_inum() == task.root || cur.get_inum() == ROOT_INUM {
                return Ok(false);
            }
            let next = self.lookup_component(&cur, "..", task)?;
            if next.get_inum() == cur_inum {
                return Ok(false);
            }
            cur_inum = next.get_inum();
        }
    }

    /// Atomically rebind `(old_dir, old_name)` to name the inode currently
    /// bound at `oldpath`, under `newpath` instead, removing the old
    /// binding. The destination must not already exist; directory renames
    /// additionally fix up the moved directory's `..` and adjust both
    /// parents' `nlinks`. Serializes with other renames via a process-wide
    /// lock, mirroring the original's sleep/wake-up rename lock.
    pub fn sys_rename(&mut self, oldpath: &str, newpath: &str, task: &Task) -> Result<(), PathLayerError> {
        let _guard = self
            .rename_lock
            .lock()
            .map_err(|_| PathLayerError::RestartRequired)?;

        let (old_parent, old_name) = self.dir_namei(oldpath, None, task)?;
        let (mut new_parent, new_name) = self.dir_namei(newpath, None, task)?;
        if old_name.is_empty() || new_name.is_empty() || old_name == "." || old_name == ".."
            || new_name == "." || new_name == ".."
        {
            return Err(PathLayerError::InvalidPath(
                ". and .. cannot be renamed".to_string(),
            ));
        }
        if !permission(&old_parent, MASK_WRITE, task) || !permission(&new_parent, MASK_WRITE, task) {
            return Err(PathLayerError::Access(new_name));
        }
        if old_parent.get_ft() != FType::TDir || new_parent.get_ft() != FType::TDir {
            return Err(PathLayerError::NotDir(newpath.to_string()));
        }

        let (mut old_parent, old_off, moved_inum) = {
            let (de_off, de) = self.dir_fs.find_entry(&old_parent, &old_name)?;
            (old_parent, de_off * (*DIRENTRY_SIZE), de.inum)
        };
        let moved = self.dir_fs.i_get(moved_inum)?;

        if self.dir_fs.dirlookup(&new_parent, &new_name).is_ok() {
            return Err(PathLayerError::Exists(new_name));
        }

        if moved.get_ft() == FType::TDir && self.subdir(&new_parent, moved.get_inum(), task)? {
            return Err(PathLayerError::InvalidPath(
                "cannot move a directory into its own subtree".to_string(),
            ));
        }

        // Prepare: reserve a slot in the destination.
        let new_off = self.dir_fs.dirlink(&mut new_parent, &new_name, moved_inum)?;

        // Sanity recheck: both slots must still be exactly as expected.
        let (_, still_there) = self.dir_fs.find_entry(&old_parent, &old_name)?;
        if still_there.inum != moved_inum {
            return Err(PathLayerError::RestartRequired);
        }
        let check_new = self.read_slot(&new_parent, new_off / (*DIRENTRY_SIZE))?;
        if check_new.inum != moved_inum {
            return Err(PathLayerError::RestartRequired);
        }

        // Commit.
        self.clear_entry(&mut old_parent, old_off)?;

        // `dirlink` above bumped the moved inode's `nlink` as though this
        // were an additional link to it. It isn't: the old binding was just
        // cleared, so the entry count referring to this inode is unchanged.
        // Cancel the bump out, mirroring how the original's `add_entry`
        // leaves `i_nlinks` untouched during `do_rename`.
        let mut relinked = self.dir_fs.i_get(moved_inum)?;
        relinked.disk_node.nlink = relinked.disk_node.nlink.saturating_sub(1);
        self.dir_fs.i_put(&relinked)?;

        if moved.get_ft() == FType::TDir {
            let mut moved = moved;
            let (dotdot_slot, _) = self.dir_fs.find_entry(&moved, "..")?;
            self.rewrite_entry(&mut moved, dotdot_slot * (*DIRENTRY_SIZE), new_parent.get_inum())?;

            old_parent.disk_node.nlink = old_parent.disk_node.nlink.saturating_sub(1);
            old_parent.disk_node.ctime = now();
            self.dir_fs.i_put(&old_parent)?;

            new_parent.disk_node.nlink += 1;
            new_parent.disk_node.ctime = now();
            self.dir_fs.i_put(&new_parent)?;
        }

        Ok(())
    }

    /// Validate that `inode` is an empty directory: slot 0 is `.` pointing
    /// at itself, slot 1 is `..` with a non-zero inode, and every slot past
    /// that is free.
    pub fn empty_dir(&self, inode: &Inode) -> Result<bool, PathLayerError> {
        if inode.get_ft() != FType::TDir {
            return Err(PathLayerError::NotDir(format!("inode {}", inode.get_inum())));
        }
        let nslots = inode.get_size() / (*DIRENTRY_SIZE);
        if nslots < 2 {
            return Ok(false);
        }
        let dot = self.read_slot(inode, 0)?;
        let dotdot = self.read_slot(inode, 1)?;
        if dot.inum != inode.get_inum() || dotdot.inum == 0 {
            log::warn!(
                "directory {} is missing a valid . or .. entry",
                inode.get_inum()
            );
            return Ok(false);
        }
        for slot in 2..nslots {
            let de = self.read_slot(inode, slot)?;
            if de.inum != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl FileSysSupport for PathFs {
    type Error = PathLayerError;

    fn sb_valid(sb: &SuperBlock) -> bool {
        DirLayerFs::sb_valid(sb)
    }

    fn mkfs<P: AsRef<Path>>(path: P, sb: &SuperBlock) -> Result<Self, Self::Error> {
        let mut dir_fs = DirLayerFs::mkfs(path, sb)?;
        let mut root = dir_fs.i_get(ROOT_INUM)?;
        dir_fs.dirlink(&mut root, ".", ROOT_INUM)?;
        dir_fs.dirlink(&mut root, "..", ROOT_INUM)?;
        let mut root = dir_fs.i_get(ROOT_INUM)?;
        root.disk_node.mode = Mode::from_perm_bits(0o755);
        root.disk_node.nlink = 2;
        dir_fs.i_put(&root)?;
        Ok(PathFs {
            dir_fs,
            mount_table: MountTable::new(),
            rename_lock: Mutex::new(()),
        })
    }

    fn mountfs(dev: Device) -> Result<Self, Self::Error> {
        Ok(PathFs {
            dir_fs: DirLayerFs::mountfs(dev)?,
            mount_table: MountTable::new(),
            rename_lock: Mutex::new(()),
        })
    }

    fn unmountfs(self) -> Device {
        self.dir_fs.unmountfs()
    }
}

impl BlockSupport for PathFs {
    fn b_get(&self, i: u64) -> Result<namei_api::types::Block, Self::Error> {
        Ok(self.dir_fs.b_get(i)?)
    }

    fn b_put(&mut self, b: &namei_api::types::Block) -> Result<(), Self::Error> {
        Ok(self.dir_fs.b_put(b)?)
    }

    fn b_free(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.dir_fs.b_free(i)?)
    }

    fn b_zero(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.dir_fs.b_zero(i)?)
    }

    fn b_alloc(&mut self) -> Result<u64, Self::Error> {
        Ok(self.dir_fs.b_alloc()?)
    }

    fn sup_get(&self) -> Result<SuperBlock, Self::Error> {
        Ok(self.dir_fs.sup_get()?)
    }

    fn sup_put(&mut self, sup: &SuperBlock) -> Result<(), Self::Error> {
        Ok(self.dir_fs.sup_put(sup)?)
    }
}

impl InodeSupport for PathFs {
    type Inode = Inode;

    fn i_get(&self, i: u64) -> Result<Self::Inode, Self::Error> {
        Ok(self.dir_fs.i_get(i)?)
    }

    fn i_put(&mut self, ino: &Self::Inode) -> Result<(), Self::Error> {
        Ok(self.dir_fs.i_put(ino)?)
    }

    fn i_free(&mut self, i: u64) -> Result<(), Self::Error> {
        Ok(self.dir_fs.i_free(i)?)
    }

    fn i_alloc(&mut self, ft: FType) -> Result<u64, Self::Error> {
        Ok(self.dir_fs.i_alloc(ft)?)
    }

    fn i_trunc(&mut self, inode: &mut Self::Inode) -> Result<(), Self::Error> {
        Ok(self.dir_fs.i_trunc(inode)?)
    }
}

impl InodeRWSupport for PathFs {
    fn i_read(&self, inode: &Self::Inode, buf: &mut Buffer, off: u64, n: u64) -> Result<u64, Self::Error> {
        Ok(self.dir_fs.i_read(inode, buf, off, n)?)
    }

    fn i_write(&mut self, inode: &mut Self::Inode, buf: &Buffer, off: u64, n: u64) -> Result<(), Self::Error> {
        Ok(self.dir_fs.i_write(inode, buf, off, n)?)
    }
}

impl DirectorySupport for PathFs {
    fn new_de(inum: u64, name: &str) -> Option<DirEntry> {
        DirLayerFs::new_de(inum, name)
    }

    fn get_name_str(de: &DirEntry) -> String {
        DirLayerFs::get_name_str(de)
    }

    fn set_name_str(de: &mut DirEntry, name: &str) -> Option<()> {
        DirLayerFs::set_name_str(de, name)
    }

    fn dirlookup(&self, inode: &Self::Inode, name: &str) -> Result<(Self::Inode, u64), Self::Error> {
        Ok(self.dir_fs.dirlookup(inode, name)?)
    }

    fn dirlink(&mut self, inode: &mut Self::Inode, name: &str, inum: u64) -> Result<u64, Self::Error> {
        Ok(self.dir_fs.dirlink(inode, name, inum)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{disk_destruct, disk_prep_path};

    fn test_sb() -> SuperBlock {
        SuperBlock {
            block_size: 512,
            nblocks: 200,
            ninodes: 32,
            inodestart: 1,
            ndatablocks: 150,
            bmapstart: 9,
            datastart: 10,
        }
    }

    #[test]
    fn mkdir_sets_up_dot_and_dotdot() {
        let path = disk_prep_path("path", "mkdir_basic");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        fs.sys_mkdir("/a", Mode::from_perm_bits(0o755), &task).unwrap();
        fs.sys_mkdir("/a/b", Mode::from_perm_bits(0o755), &task).unwrap();

        let b = fs.namei("/a/b", None, &task).unwrap();
        let b_dot = fs.namei("/a/b/.", None, &task).unwrap();
        let b_dotdot = fs.namei("/a/b/..", None, &task).unwrap();
        let a = fs.namei("/a", None, &task).unwrap();

        assert_eq!(b.get_inum(), b_dot.get_inum());
        assert_eq!(a.get_inum(), b_dotdot.get_inum());
        assert_eq!(b.get_nlink(), 2);

        let a_reloaded = fs.namei("/a", None, &task).unwrap();
        assert_eq!(a_reloaded.get_nlink(), 3);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn mkdir_then_rmdir_restores_parent_nlink() {
        let path = disk_prep_path("path", "mkdir_rmdir");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        fs.sys_mkdir("/a", Mode::from_perm_bits(0o755), &task).unwrap();
        let root_before = fs.namei("/", None, &task).unwrap();
        assert_eq!(root_before.get_nlink(), 3);

        fs.sys_rmdir("/a", &task).unwrap();
        assert!(fs.namei("/a", None, &task).is_err());

        let root_after = fs.namei("/", None, &task).unwrap();
        assert_eq!(root_after.get_nlink(), 2);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn symlink_namei_vs_lnamei() {
        let path = disk_prep_path("path", "symlink");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        let target = fs
            .open_namei(
                "/etc_passwd",
                OpenFlags {
                    access: AccessMode::Write,
                    creat: true,
                    excl: false,
                    trunc: false,
                },
                Mode::from_perm_bits(0o644),
                &task,
            )
            .unwrap();

        fs.sys_symlink("/link", "/etc_passwd", &task).unwrap();

        let followed = fs.namei("/link", None, &task).unwrap();
        assert_eq!(followed.get_inum(), target.get_inum());
        assert_eq!(followed.get_ft(), FType::TFile);

        let unfollowed = fs.lnamei("/link", None, &task).unwrap();
        assert_eq!(unfollowed.get_ft(), FType::TLnk);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn open_creat_excl_then_trunc() {
        let path = disk_prep_path("path", "open_creat_excl");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        let flags = OpenFlags {
            access: AccessMode::Write,
            creat: true,
            excl: true,
            trunc: false,
        };
        let created = fs
            .open_namei("/nofile", flags, Mode::from_perm_bits(0o644), &task)
            .unwrap();
        assert_eq!(created.get_size(), 0);

        let second = fs.open_namei("/nofile", flags, Mode::from_perm_bits(0o644), &task);
        assert!(second.is_err());

        let trunc_flags = OpenFlags {
            access: AccessMode::Write,
            creat: true,
            excl: false,
            trunc: true,
        };
        let reopened = fs
            .open_namei("/nofile", trunc_flags, Mode::from_perm_bits(0o644), &task)
            .unwrap();
        assert_eq!(reopened.get_size(), 0);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn rename_requires_unlinking_existing_destination() {
        let path = disk_prep_path("path", "rename_exists");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        let creat = |access| OpenFlags {
            access,
            creat: true,
            excl: false,
            trunc: false,
        };
        fs.open_namei("/x", creat(AccessMode::Write), Mode::from_perm_bits(0o644), &task)
            .unwrap();
        fs.open_namei("/y", creat(AccessMode::Write), Mode::from_perm_bits(0o644), &task)
            .unwrap();

        assert!(fs.sys_rename("/x", "/y", &task).is_err());

        fs.sys_unlink("/y", &task).unwrap();
        fs.sys_rename("/x", "/y", &task).unwrap();

        assert!(fs.namei("/x", None, &task).is_err());
        assert!(fs.namei("/y", None, &task).is_ok());

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn rename_does_not_inflate_nlink_and_unlink_still_frees_the_inode() {
        let path = disk_prep_path("path", "rename_nlink");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        let created = fs
            .open_namei(
                "/x",
                OpenFlags {
                    access: AccessMode::Write,
                    creat: true,
                    excl: true,
                    trunc: false,
                },
                Mode::from_perm_bits(0o644),
                &task,
            )
            .unwrap();
        assert_eq!(created.get_nlink(), 1);
        let inum = created.get_inum();

        fs.sys_rename("/x", "/y", &task).unwrap();
        let moved = fs.namei("/y", None, &task).unwrap();
        assert_eq!(moved.get_inum(), inum);
        assert_eq!(moved.get_nlink(), 1);

        fs.sys_unlink("/y", &task).unwrap();
        assert!(fs.namei("/y", None, &task).is_err());

        // The inode must actually have been freed, not merely unnamed: its
        // slot is reused by the very next allocation.
        let reused_inum = fs.i_alloc(FType::TFile).unwrap();
        assert_eq!(reused_inum, inum);

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn rename_into_own_subdirectory_fails() {
        let path = disk_prep_path("path", "rename_subdir");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        fs.sys_mkdir("/a", Mode::from_perm_bits(0o755), &task).unwrap();
        fs.sys_mkdir("/a/b", Mode::from_perm_bits(0o755), &task).unwrap();

        let result = fs.sys_rename("/a", "/a/b", &task);
        assert!(result.is_err());

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn dotdot_on_mounted_root_crosses_mount_point() {
        let path = disk_prep_path("path", "mount_crossing");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let task = Task::root_task();

        fs.sys_mkdir("/hostdir", Mode::from_perm_bits(0o755), &task).unwrap();
        let hostdir = fs.namei("/hostdir", None, &task).unwrap();
        fs.mount_table_mut().mount(hostdir.get_inum());

        let crossed = fs.namei("/..", None, &task).unwrap();
        assert_eq!(crossed.get_inum(), hostdir.get_inum());

        disk_destruct(fs.unmountfs(), &path);
    }

    #[test]
    fn dotdot_on_pseudo_root_stays_put() {
        let path = disk_prep_path("path", "pseudo_root");
        let sb = test_sb();
        let mut fs = PathFs::mkfs(&path, &sb).unwrap();
        let mut task = Task::root_task();

        fs.sys_mkdir("/jail", Mode::from_perm_bits(0o755), &task).unwrap();
        let jail = fs.namei("/jail", None, &task).unwrap();
        task.root = jail.get_inum();
        task.cwd = jail.get_inum();

        let up = fs.namei("..", None, &task).unwrap();
        assert_eq!(up.get_inum(), jail.get_inum());

        disk_destruct(fs.unmountfs(), &path);
    }
}
