// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Canonical identity resolution: path or open descriptor to [`FileIdentity`]
//!
//! Two paths that reach the same storage object (hard links, `..` detours,
//! renames performed through the arbiter) resolve to the same identity. On
//! Unix the identity is `(st_dev, st_ino)`. Other hosts fall back to a digest
//! of the canonical path, which does not follow renames.

use std::fs::{self, File, Metadata};
use std::path::Path;

use crate::error::{FsError, FsResult};
use crate::FileIdentity;

/// Resolve `path` to the identity of the file it currently names.
///
/// Symlinks are followed. Fails with [`FsError::NotFound`] if nothing is
/// there and [`FsError::IsADirectory`] if it names a directory.
pub fn resolve(path: &Path) -> FsResult<FileIdentity> {
    let meta = fs::metadata(path).map_err(FsError::from_io)?;
    if meta.is_dir() {
        return Err(FsError::IsADirectory);
    }
    Ok(from_metadata(&meta, path))
}

/// Identity of an already opened descriptor. `path` is only consulted on
/// hosts without stable serial numbers.
pub(crate) fn of_file(file: &File, path: &Path) -> FsResult<FileIdentity> {
    let meta = file.metadata().map_err(FsError::from_io)?;
    if meta.is_dir() {
        return Err(FsError::IsADirectory);
    }
    Ok(from_metadata(&meta, path))
}

/// Does `path` still lead to `identity`? Used under the entry lock to
/// refuse opens that raced with an unlink or rename.
pub(crate) fn still_names(path: &Path, identity: FileIdentity) -> bool {
    matches!(resolve(path), Ok(current) if current == identity)
}

/// Identity of the entry `path` itself, without following a final symlink.
/// A symlink yields `None`: removing or replacing it never touches the
/// file it points at.
pub(crate) fn resolve_name(path: &Path) -> FsResult<Option<FileIdentity>> {
    let meta = fs::symlink_metadata(path).map_err(FsError::from_io)?;
    if meta.file_type().is_symlink() {
        return Ok(None);
    }
    if meta.is_dir() {
        return Err(FsError::IsADirectory);
    }
    Ok(Some(from_metadata(&meta, path)))
}

/// Link count of the file `path` itself names, if that file is `identity`.
/// Used under the entry lock before removing a name.
pub(crate) fn links_of_name(path: &Path, identity: FileIdentity) -> Option<u64> {
    let meta = fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() || meta.is_dir() {
        return None;
    }
    (from_metadata(&meta, path) == identity).then(|| link_count(&meta))
}

#[cfg(unix)]
fn link_count(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn link_count(_meta: &Metadata) -> u64 {
    1
}

#[cfg(unix)]
fn from_metadata(meta: &Metadata, _path: &Path) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity::new(meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn from_metadata(_meta: &Metadata, path: &Path) -> FileIdentity {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = DefaultHasher::new();
    canonical.to_string_lossy().to_lowercase().hash(&mut hasher);
    FileIdentity::new(0, hasher.finish())
}
