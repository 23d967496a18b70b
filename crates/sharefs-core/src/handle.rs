// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open file handles admitted by the arbiter

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::registry::Registry;
use crate::{AccessRights, FileIdentity, HandleId, ShareRights};

/// One admitted open of a file.
///
/// Dropping a handle releases it; call [`FileHandle::close`] to observe
/// release errors such as a failed reclamation.
pub struct FileHandle {
    registry: Arc<Registry>,
    identity: FileIdentity,
    id: HandleId,
    access: AccessRights,
    share: ShareRights,
    path: PathBuf,
    file: Option<File>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("identity", &self.identity)
            .field("id", &self.id)
            .field("access", &self.access)
            .field("share", &self.share)
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl FileHandle {
    pub(crate) fn new(
        registry: Arc<Registry>,
        identity: FileIdentity,
        id: HandleId,
        access: AccessRights,
        share: ShareRights,
        path: PathBuf,
        file: File,
    ) -> Self {
        Self {
            registry,
            identity,
            id,
            access,
            share,
            path,
            file: Some(file),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn access(&self) -> AccessRights {
        self.access
    }

    pub fn share(&self) -> ShareRights {
        self.share
    }

    /// Path the handle was opened through. It may no longer name the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&mut self) -> FsResult<&mut File> {
        self.file.as_mut().ok_or(FsError::BadFileDescriptor)
    }

    fn require(&self, wanted: AccessRights) -> FsResult<()> {
        if self.file.is_none() {
            return Err(FsError::BadFileDescriptor);
        }
        if (wanted.read && !self.access.read) || (wanted.write && !self.access.write) {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    /// Read at the current position. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        self.require(AccessRights::READ)?;
        self.file()?.read(buf).map_err(FsError::from_io)
    }

    /// Read from the current position to end of file.
    pub fn read_to_end(&mut self, buf: &mut Vec<u8>) -> FsResult<usize> {
        self.require(AccessRights::READ)?;
        self.file()?.read_to_end(buf).map_err(FsError::from_io)
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        self.require(AccessRights::WRITE)?;
        self.file()?.write(data).map_err(FsError::from_io)
    }

    pub fn write_all(&mut self, data: &[u8]) -> FsResult<()> {
        self.require(AccessRights::WRITE)?;
        self.file()?.write_all(data).map_err(FsError::from_io)
    }

    /// Move the position to `offset` bytes from the start.
    pub fn seek(&mut self, offset: u64) -> FsResult<u64> {
        self.file()?.seek(SeekFrom::Start(offset)).map_err(FsError::from_io)
    }

    pub fn position(&mut self) -> FsResult<u64> {
        self.file()?.stream_position().map_err(FsError::from_io)
    }

    /// Current length of the underlying file, queried from the host on every
    /// call so concurrent rewrites are observed.
    pub fn length(&mut self) -> FsResult<u64> {
        let meta = self.file()?.metadata().map_err(FsError::from_io)?;
        Ok(meta.len())
    }

    pub fn set_len(&mut self, len: u64) -> FsResult<()> {
        self.require(AccessRights::WRITE)?;
        self.file()?.set_len(len).map_err(FsError::from_io)
    }

    pub fn flush(&mut self) -> FsResult<()> {
        self.file()?.flush().map_err(FsError::from_io)
    }

    /// Release the handle. The host descriptor is closed before the registry
    /// drops the rights, so a reclaimed file is never still open here.
    pub fn close(&mut self) -> FsResult<()> {
        let file = self.file.take().ok_or(FsError::BadFileDescriptor)?;
        drop(file);
        self.registry.release(self.identity, self.id)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.close() {
                warn!(identity = %self.identity, handle = %self.id, error = %err, "release on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{ArbiterConfig, FsError, OpenOptions, ShareArbiter};
    use crate::{AccessRights, ShareRights};

    #[test]
    fn read_requires_read_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.txt");
        let arbiter = ShareArbiter::new(ArbiterConfig::default()).unwrap();
        let mut handle = arbiter
            .open_with(
                &path,
                OpenOptions::new(AccessRights::WRITE, ShareRights::NONE).create(true),
            )
            .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(handle.read(&mut buf), Err(FsError::PermissionDenied)));
        handle.write_all(b"abcd").unwrap();
        assert_eq!(handle.length().unwrap(), 4);
    }

    #[test]
    fn write_requires_write_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.txt");
        std::fs::write(&path, b"hello").unwrap();
        let arbiter = ShareArbiter::default();
        let mut handle = arbiter.open(&path, AccessRights::READ, ShareRights::READ).unwrap();
        assert!(matches!(handle.write(b"x"), Err(FsError::PermissionDenied)));
        assert!(matches!(handle.set_len(0), Err(FsError::PermissionDenied)));

        let mut buf = [0u8; 3];
        assert_eq!(handle.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(handle.position().unwrap(), 3);
        handle.seek(1).unwrap();
        let mut rest = Vec::new();
        handle.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ello");
    }

    #[test]
    fn close_twice_is_bad_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        std::fs::write(&path, b"1").unwrap();
        let arbiter = ShareArbiter::default();
        let mut handle = arbiter.open(&path, AccessRights::READ, ShareRights::NONE).unwrap();
        handle.close().unwrap();
        assert!(!handle.is_open());
        assert!(matches!(handle.close(), Err(FsError::BadFileDescriptor)));
        let mut buf = [0u8; 1];
        assert!(matches!(handle.read(&mut buf), Err(FsError::BadFileDescriptor)));

        // Exclusive hold is gone after close
        let again = arbiter.open(&path, AccessRights::READ, ShareRights::NONE);
        assert!(again.is_ok());
    }

    #[test]
    fn length_tracks_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("len.txt");
        std::fs::write(&path, b"12345").unwrap();
        let arbiter = ShareArbiter::default();
        let mut reader = arbiter.open(&path, AccessRights::READ, ShareRights::READ_WRITE).unwrap();
        assert_eq!(reader.length().unwrap(), 5);

        let mut writer = arbiter
            .open(&path, AccessRights::WRITE, ShareRights::READ_WRITE)
            .unwrap();
        writer.set_len(2).unwrap();
        assert_eq!(reader.length().unwrap(), 2);
    }
}
