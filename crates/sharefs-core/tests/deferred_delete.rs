// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests for deletion of files that are still open

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use sharefs_core::{AccessRights, ArbiterConfig, FsError, ShareArbiter, ShareRights};
use tempfile::TempDir;

fn create_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(format!("{name}.txt"));
    fs::write(&path, name).unwrap();
    path
}

#[test]
fn test_delete_hides_name_but_keeps_content() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "read_after_delete");
    let arbiter = ShareArbiter::default();

    let mut handle = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    let len = handle.length().unwrap() as usize;
    let mut buf = vec![0u8; len];
    assert_eq!(handle.read(&mut buf).unwrap(), len);
    handle.seek(0).unwrap();

    arbiter.delete(&path).unwrap();
    assert!(!arbiter.exists(&path));
    assert!(!path.exists());

    let mut buf = vec![0u8; len];
    assert_eq!(handle.read(&mut buf).unwrap(), len);
    assert_eq!(buf, b"read_after_delete");
    assert_eq!(handle.length().unwrap() as usize, len);

    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 1);
    assert_eq!(stats.reclaimed, 0);

    handle.close().unwrap();
    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.tracked_identities, 0);
    assert!(!dir.path().join(".sharefs-graveyard").exists());
}

#[test]
fn test_writes_through_pending_handle_still_work() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "write_after_delete");
    let arbiter = ShareArbiter::default();

    let mut handle = arbiter.open(&path, AccessRights::READ_WRITE, ShareRights::ALL).unwrap();
    arbiter.delete(&path).unwrap();
    handle.set_len(0).unwrap();
    handle.write_all(b"still here").unwrap();
    handle.seek(0).unwrap();
    let mut buf = Vec::new();
    handle.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"still here");
}

#[test]
fn test_pending_file_cannot_be_reopened() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "no_resurrection");
    let arbiter = ShareArbiter::default();

    let _handle = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&path).unwrap();

    assert!(matches!(
        arbiter.open(&path, AccessRights::READ, ShareRights::ALL),
        Err(FsError::NotFound)
    ));
    assert!(matches!(arbiter.delete(&path), Err(FsError::NotFound)));
}

#[test]
fn test_new_file_under_pending_name_is_independent() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "reused_name");
    let arbiter = ShareArbiter::default();

    let mut old = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&path).unwrap();

    arbiter.write_all(&path, b"fresh").unwrap();
    assert!(arbiter.exists(&path));
    assert_ne!(old.identity(), sharefs_core::identity::resolve(&path).unwrap());

    let mut buf = Vec::new();
    old.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"reused_name");

    old.close().unwrap();
    assert_eq!(arbiter.read_all(&path).unwrap(), b"fresh");
}

#[test]
fn test_storage_reclaimed_only_after_last_handle() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "last_close");
    let arbiter = ShareArbiter::default();

    let first = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    let mut second = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&path).unwrap();

    drop(first);
    assert_eq!(arbiter.stats().pending_deletions, 1);
    assert_eq!(arbiter.stats().reclaimed, 0);

    let mut buf = Vec::new();
    second.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"last_close");

    drop(second);
    assert_eq!(arbiter.stats().pending_deletions, 0);
    assert_eq!(arbiter.stats().reclaimed, 1);
}

#[test]
fn test_delete_without_handles_is_immediate() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "plain_delete");
    let arbiter = ShareArbiter::default();

    arbiter.delete(&path).unwrap();
    assert!(!path.exists());
    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(stats.reclaimed, 1);
    assert!(!dir.path().join(".sharefs-graveyard").exists());
}

#[test]
fn test_custom_graveyard_name() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "custom_grave");
    let config = ArbiterConfig {
        graveyard_dir_name: ".trash".to_string(),
        ..ArbiterConfig::default()
    };
    let arbiter = ShareArbiter::new(config).unwrap();

    let handle = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&path).unwrap();
    assert!(dir.path().join(".trash").is_dir());
    drop(handle);
    assert!(!dir.path().join(".trash").exists());
}

#[test]
fn test_concurrent_deletes_in_one_directory() {
    let dir = TempDir::new().unwrap();
    let arbiter = Arc::new(ShareArbiter::default());

    const THREADS: usize = 8;
    const ROUNDS: usize = 200;
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let arbiter = Arc::clone(&arbiter);
            let barrier = Arc::clone(&barrier);
            let root = dir.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    let path = root.join(format!("f_{t}_{round}.txt"));
                    fs::write(&path, b"pending").unwrap();
                    let mut handle =
                        arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
                    if let Err(err) = arbiter.delete(&path) {
                        panic!("delete of {} failed: {err}", path.display());
                    }
                    assert!(!arbiter.exists(&path));

                    let mut buf = Vec::new();
                    handle.read_to_end(&mut buf).unwrap();
                    assert_eq!(buf, b"pending");
                    handle.close().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(stats.open_handles, 0);
    assert_eq!(stats.reclaimed, (THREADS * ROUNDS) as u64);
    assert!(!dir.path().join(".sharefs-graveyard").exists());
}

#[cfg(unix)]
#[test]
fn test_deleting_symlink_leaves_target_alone() {
    let dir = TempDir::new().unwrap();
    let real = create_file(&dir, "real");
    let link = dir.path().join("link.txt");
    std::os::unix::fs::symlink(&real, &link).unwrap();
    let arbiter = ShareArbiter::default();

    let _held = arbiter.open(&real, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&link).unwrap();
    assert!(fs::symlink_metadata(&link).is_err());
    assert!(arbiter.exists(&real));

    let mut reopened = arbiter.open(&real, AccessRights::READ, ShareRights::ALL).unwrap();
    let mut buf = Vec::new();
    reopened.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"real");

    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(stats.reclaimed, 0);

    // A dangling link is still a name that can be removed
    let dangling = dir.path().join("dangling.txt");
    std::os::unix::fs::symlink(dir.path().join("nowhere"), &dangling).unwrap();
    arbiter.delete(&dangling).unwrap();
    assert!(fs::symlink_metadata(&dangling).is_err());
}

#[cfg(unix)]
#[test]
fn test_deleting_one_hard_link_keeps_file_live() {
    let dir = TempDir::new().unwrap();
    let real = create_file(&dir, "linked");
    let alias = dir.path().join("alias.txt");
    fs::hard_link(&real, &alias).unwrap();
    let arbiter = ShareArbiter::default();

    let mut held = arbiter.open(&real, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&alias).unwrap();
    assert!(!alias.exists());
    assert!(arbiter.exists(&real));
    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(stats.reclaimed, 0);

    // The surviving name still opens, then its own delete defers as usual
    let reopened = arbiter.open(&real, AccessRights::READ, ShareRights::ALL).unwrap();
    arbiter.delete(&real).unwrap();
    assert!(!arbiter.exists(&real));
    assert_eq!(arbiter.stats().pending_deletions, 1);

    let mut buf = Vec::new();
    held.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"linked");
    drop(held);
    drop(reopened);
    let stats = arbiter.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(stats.reclaimed, 1);
}

#[cfg(unix)]
#[test]
fn test_hard_link_removal_frees_nothing() {
    let dir = TempDir::new().unwrap();
    let real = create_file(&dir, "shared_storage");
    let alias = dir.path().join("alias.txt");
    fs::hard_link(&real, &alias).unwrap();
    let arbiter = ShareArbiter::default();

    arbiter.delete(&alias).unwrap();
    assert_eq!(arbiter.stats().reclaimed, 0);
    assert_eq!(arbiter.read_all(&real).unwrap(), b"shared_storage");

    arbiter.delete(&real).unwrap();
    assert_eq!(arbiter.stats().reclaimed, 1);
}
