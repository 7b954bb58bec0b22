//! Shared test helpers for setting up and tearing down throwaway disk images.
//!
//! Mirrors the pattern used throughout `namei_api`'s own controller tests:
//! each test gets its own uniquely named image directory under
//! `CARGO_MANIFEST_DIR`, removed again once the test finishes.

use namei_api::controller::Device;
use std::fs::{create_dir_all, remove_dir, remove_file};
use std::path::PathBuf;

/// Build (and clear) a fresh image path for a test. `category` should be the
/// module under test (e.g. `"block_layer"`), `name` a unique test name.
pub fn disk_prep_path(category: &str, name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push(format!("fs-images-{}-{}", category, name));
    path.push("img");

    if path.exists() {
        remove_file(&path).unwrap();
    }
    create_dir_all(path.parent().unwrap()).unwrap();
    path
}

/// Destroy the device's backing file and remove its parent image directory.
pub fn disk_destruct(dev: Device, path: &std::path::Path) {
    dev.destruct();
    let _ = remove_dir(path.parent().unwrap());
}
