// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests for what open readers see when others rewrite a file

use std::fs;
use std::path::PathBuf;

use sharefs_core::{AccessRights, ShareArbiter, ShareRights};
use tempfile::TempDir;

fn create_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(format!("{name}.txt"));
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_read_after_shorter_rewrite() {
    let dir = TempDir::new().unwrap();
    let name = "read_after_write_shorter";
    let path = create_file(&dir, name, name.as_bytes());
    let arbiter = ShareArbiter::default();

    let mut reader = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    let len = reader.length().unwrap() as usize;
    let mut buf = vec![0u8; len];
    assert_eq!(reader.read(&mut buf).unwrap(), len);
    assert_eq!(buf, name.as_bytes());
    reader.seek(0).unwrap();

    arbiter.write_all(&path, b"a").unwrap();

    let mut buf = vec![0u8; len];
    let n = reader.read(&mut buf).unwrap();
    assert_eq!(n, 1);
    assert_eq!(&buf[..n], b"a");
    assert_eq!(reader.length().unwrap(), 1);
}

#[test]
fn test_read_after_longer_rewrite() {
    let dir = TempDir::new().unwrap();
    let name = "read_after_write_longer";
    let path = create_file(&dir, name, name.as_bytes());
    let arbiter = ShareArbiter::default();

    let mut reader = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    let len = reader.length().unwrap() as usize;
    let mut buf = vec![0u8; len];
    assert_eq!(reader.read(&mut buf).unwrap(), len);
    reader.seek(0).unwrap();

    arbiter.write_all(&path, &vec![b'a'; len * 2]).unwrap();

    let mut buf = vec![0u8; len];
    assert_eq!(reader.read(&mut buf).unwrap(), len);
    assert_eq!(buf, vec![b'a'; len]);
    assert_eq!(reader.length().unwrap() as usize, len * 2);
}

#[test]
fn test_read_past_shrunk_end_is_empty() {
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "past_end", b"0123456789");
    let arbiter = ShareArbiter::default();

    let mut reader = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    reader.seek(8).unwrap();
    arbiter.write_all(&path, b"xy").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_read_large_file() {
    const SIZE: usize = 1_000_000;
    let dir = TempDir::new().unwrap();
    let path = create_file(&dir, "large", &vec![b'a'; SIZE]);
    let arbiter = ShareArbiter::default();

    let mut reader = arbiter.open(&path, AccessRights::READ, ShareRights::ALL).unwrap();
    let len = reader.length().unwrap() as usize;
    assert_eq!(len, SIZE);
    let mut buf = vec![0u8; len];
    assert_eq!(reader.read(&mut buf).unwrap(), len);
    assert!(buf.iter().all(|b| *b == b'a'));
}

#[test]
fn test_round_trip_sizes() {
    let dir = TempDir::new().unwrap();
    let arbiter = ShareArbiter::default();
    for size in [0usize, 1, 10, 4096, 4097, 1_000_010] {
        let path = dir.path().join(format!("round_trip_{size}.bin"));
        let payload: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        arbiter.write_all(&path, &payload).unwrap();
        assert_eq!(arbiter.read_all(&path).unwrap(), payload, "size {size}");
    }
}
