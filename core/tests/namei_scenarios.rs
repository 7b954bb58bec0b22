//! Integration tests exercising `PathFs` across multiple operations, the
//! way a caller actually uses it: a sequence of syscalls against one
//! mounted filesystem rather than a single isolated call.

use namei_api::fs::{FileSysSupport, InodeRWSupport, InodeSupport};
use namei_api::types::{Buffer, FType, InodeLike, Mode, SuperBlock};
use namei_core::error::PathLayerError;
use namei_core::path::{AccessMode, OpenFlags, PathFs, Task};
use std::fs::{create_dir_all, remove_dir, remove_file};
use std::path::PathBuf;

fn prep_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push(format!("fs-images-it-{}", name));
    path.push("img");
    if path.exists() {
        remove_file(&path).unwrap();
    }
    create_dir_all(path.parent().unwrap()).unwrap();
    path
}

fn teardown(fs: PathFs, path: &std::path::Path) {
    fs.unmountfs().destruct();
    let _ = remove_dir(path.parent().unwrap());
}

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

/// Build a directory tree, write a file, read it back, rename both the file
/// and one of the directories, then tear the whole tree down again.
#[test]
fn multi_step_workflow_survives_a_full_lifecycle() {
    let path = prep_path("lifecycle");
    let sb = test_sb();
    let mut fs = PathFs::mkfs(&path, &sb).unwrap();
    let task = Task::root_task();

    fs.sys_mkdir("/home", Mode::from_perm_bits(0o755), &task).unwrap();
    fs.sys_mkdir("/home/user", Mode::from_perm_bits(0o755), &task).unwrap();

    let mut file = fs
        .open_namei(
            "/home/user/notes.txt",
            OpenFlags {
                access: AccessMode::ReadWrite,
                creat: true,
                excl: true,
                trunc: false,
            },
            Mode::from_perm_bits(0o644),
            &task,
        )
        .unwrap();

    let payload = b"hello from namei";
    let wbuf = Buffer::new(payload.to_vec().into_boxed_slice());
    fs.i_write(&mut file, &wbuf, 0, payload.len() as u64).unwrap();

    let reopened = fs.namei("/home/user/notes.txt", None, &task).unwrap();
    let mut rbuf = Buffer::new_zero(payload.len() as u64);
    fs.i_read(&reopened, &mut rbuf, 0, payload.len() as u64).unwrap();
    assert_eq!(rbuf.contents_as_ref(), payload);

    // Rename the file within the same directory.
    fs.sys_rename("/home/user/notes.txt", "/home/user/journal.txt", &task)
        .unwrap();
    assert!(fs.namei("/home/user/notes.txt", None, &task).is_err());
    let renamed = fs.namei("/home/user/journal.txt", None, &task).unwrap();
    assert_eq!(renamed.get_inum(), reopened.get_inum());
    // A rename is not an additional link: the entry count referring to this
    // file is still exactly one.
    assert_eq!(renamed.get_nlink(), 1);

    // Rename the directory itself up a level and confirm `..` still works.
    fs.sys_rename("/home/user", "/user", &task).unwrap();
    let moved_dotdot = fs.namei("/user/..", None, &task).unwrap();
    let root = fs.namei("/", None, &task).unwrap();
    assert_eq!(moved_dotdot.get_inum(), root.get_inum());
    assert!(fs.namei("/user/journal.txt", None, &task).is_ok());

    let journal_inum = reopened.get_inum();
    fs.sys_unlink("/user/journal.txt", &task).unwrap();
    assert!(fs.namei("/user/journal.txt", None, &task).is_err());
    // The file was renamed once before this unlink; if that rename had
    // leaked an extra nlink, this inode would still show as in use here.
    assert_eq!(fs.i_get(journal_inum).unwrap().get_ft(), FType::TFree);

    teardown(fs, &path);
}

/// A non-owning, non-root task cannot write a file it does not have write
/// permission on, and cannot unlink out of a sticky-bit directory it does
/// not own.
#[test]
fn unprivileged_task_is_denied_by_permission_bits() {
    let path = prep_path("permissions");
    let sb = test_sb();
    let mut fs = PathFs::mkfs(&path, &sb).unwrap();
    let root = Task::root_task();

    fs.sys_mkdir("/shared", Mode::from_perm_bits(0o1777), &root)
        .unwrap();

    let owner = Task {
        euid: 1000,
        egid: 1000,
        gids: Vec::new(),
        umask: 0o022,
        root: root.root,
        cwd: root.cwd,
    };
    let intruder = Task {
        euid: 2000,
        egid: 2000,
        gids: Vec::new(),
        umask: 0o022,
        root: root.root,
        cwd: root.cwd,
    };

    fs.open_namei(
        "/shared/owned.txt",
        OpenFlags {
            access: AccessMode::Write,
            creat: true,
            excl: true,
            trunc: false,
        },
        Mode::from_perm_bits(0o644),
        &owner,
    )
    .unwrap();

    // The sticky bit on /shared means only root, the owner, or the
    // directory's owner may unlink `owned.txt` -- not an unrelated intruder.
    let result = fs.sys_unlink("/shared/owned.txt", &intruder);
    assert!(matches!(result, Err(PathLayerError::Permission(_))));

    // The owner can still remove their own file.
    fs.sys_unlink("/shared/owned.txt", &owner).unwrap();

    teardown(fs, &path);
}

/// `sys_mknod` is restricted to the superuser.
#[test]
fn mknod_rejects_non_root_callers() {
    let path = prep_path("mknod_perm");
    let sb = test_sb();
    let mut fs = PathFs::mkfs(&path, &sb).unwrap();
    let non_root = Task {
        euid: 1000,
        egid: 1000,
        gids: Vec::new(),
        umask: 0o022,
        root: namei_api::types::ROOT_INUM,
        cwd: namei_api::types::ROOT_INUM,
    };

    let result = fs.sys_mknod("/dev_null", FType::TChr, Mode::from_perm_bits(0o666), 3, &non_root);
    assert!(matches!(result, Err(PathLayerError::Permission(_))));

    let root = Task::root_task();
    fs.sys_mknod("/dev_null", FType::TChr, Mode::from_perm_bits(0o666), 3, &root)
        .unwrap();
    let dev = fs.namei("/dev_null", None, &root).unwrap();
    assert_eq!(dev.get_ft(), FType::TChr);

    teardown(fs, &path);
}

/// A symlink that targets itself is a loop: resolving it must fail with
/// `SymlinkLoop` rather than spinning forever.
#[test]
fn self_referential_symlink_is_a_loop_error() {
    let path = prep_path("symlink_loop");
    let sb = test_sb();
    let mut fs = PathFs::mkfs(&path, &sb).unwrap();
    let task = Task::root_task();

    fs.sys_symlink("/loop", "/loop", &task).unwrap();

    let result = fs.namei("/loop", None, &task);
    assert!(matches!(result, Err(PathLayerError::SymlinkLoop(_))));

    teardown(fs, &path);
}

/// Two directories linking to each other via symlinks also trips the depth
/// bound, not just a direct self-loop.
#[test]
fn mutual_symlink_loop_is_also_bounded() {
    let path = prep_path("symlink_mutual_loop");
    let sb = test_sb();
    let mut fs = PathFs::mkfs(&path, &sb).unwrap();
    let task = Task::root_task();

    fs.sys_symlink("/a", "/b", &task).unwrap();
    fs.sys_symlink("/b", "/a", &task).unwrap();

    let result = fs.namei("/a", None, &task);
    assert!(matches!(result, Err(PathLayerError::SymlinkLoop(_))));

    teardown(fs, &path);
}

/// Removing a nonempty directory fails; removing it after it is emptied
/// succeeds and restores the parent's link count.
#[test]
fn rmdir_refuses_nonempty_directories() {
    let path = prep_path("rmdir_nonempty");
    let sb = test_sb();
    let mut fs = PathFs::mkfs(&path, &sb).unwrap();
    let task = Task::root_task();

    fs.sys_mkdir("/a", Mode::from_perm_bits(0o755), &task).unwrap();
    fs.open_namei(
        "/a/f",
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

    assert!(fs.sys_rmdir("/a", &task).is_err());

    fs.sys_unlink("/a/f", &task).unwrap();
    fs.sys_rmdir("/a", &task).unwrap();
    assert!(fs.namei("/a", None, &task).is_err());

    teardown(fs, &path);
}
