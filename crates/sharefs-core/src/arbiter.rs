// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Public face of the arbitration layer: path-level operations

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{FsError, FsResult};
use crate::fault::FaultInjector;
use crate::handle::FileHandle;
use crate::identity;
use crate::registry::Registry;
use crate::removal;
use crate::{AccessRights, ArbiterConfig, ArbiterStats, OpenOptions, ShareRights};
#[cfg(feature = "events")]
use crate::{EventSink, SubscriptionId};

/// Mediates every open, delete and rename of host files so that share modes
/// are honored between handles and deletions of open files are deferred.
///
/// One arbiter must be shared (e.g. behind an `Arc`) by every party that
/// should observe each other's share modes.
pub struct ShareArbiter {
    config: ArbiterConfig,
    registry: Arc<Registry>,
}

impl Default for ShareArbiter {
    fn default() -> Self {
        let config = ArbiterConfig::default();
        let registry = Arc::new(Registry::new(&config));
        Self { config, registry }
    }
}

impl ShareArbiter {
    pub fn new(config: ArbiterConfig) -> FsResult<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new(&config));
        info!(
            graveyard = %config.graveyard_dir_name,
            chunk = config.io_chunk_size,
            max_open_handles = config.limits.max_open_handles,
            "share arbiter ready"
        );
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Open an existing file with `access`, tolerating `share` from others.
    pub fn open(
        &self,
        path: &Path,
        access: AccessRights,
        share: ShareRights,
    ) -> FsResult<FileHandle> {
        self.open_with(path, OpenOptions::new(access, share))
    }

    /// Open with full options. Creation happens before arbitration; truncation
    /// only after the handle is admitted, so a refused open never alters data.
    pub fn open_with(&self, path: &Path, opts: OpenOptions) -> FsResult<FileHandle> {
        if opts.truncate && !opts.access.write {
            return Err(FsError::InvalidArgument);
        }
        if fs::metadata(path).is_ok_and(|meta| meta.is_dir()) {
            return Err(FsError::IsADirectory);
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(opts.access.write || opts.create || opts.create_new)
            .create(opts.create)
            .create_new(opts.create_new)
            .open(path)
            .map_err(FsError::from_io)?;
        let identity = identity::of_file(&file, path)?;

        let mut handle = self
            .registry
            .try_open(identity, file, path, opts.access, opts.share)?;
        if opts.truncate {
            handle.set_len(0)?;
        }
        Ok(handle)
    }

    /// Remove the name `path`. If handles remain open the file disappears
    /// from lookups immediately and its storage is freed on last close.
    /// A symlink is removed as a name of its own, never its target.
    pub fn delete(&self, path: &Path) -> FsResult<()> {
        match identity::resolve_name(path)? {
            Some(identity) => self.registry.try_unlink(identity, path),
            None => self.registry.unlink_symlink(path),
        }
    }

    /// Whether `path` currently names a regular file.
    pub fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).is_ok_and(|meta| meta.is_file())
    }

    /// Rename `from` to `to`, replacing any file at `to`. Both the source and
    /// a replaced destination must permit deletion by their holders.
    pub fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let identity = identity::resolve(from)?;
        self.registry.try_rename(identity, from, to)
    }

    /// Read a whole file while tolerating concurrent readers only.
    pub fn read_all(&self, path: &Path) -> FsResult<Vec<u8>> {
        let mut handle = self.open(path, AccessRights::READ, ShareRights::READ)?;
        let mut data = Vec::new();
        handle.read_to_end(&mut data)?;
        handle.close()?;
        Ok(data)
    }

    /// Replace the contents of `path` with `data`, creating it if needed.
    /// The write happens in `io_chunk_size` pieces while readers may watch.
    pub fn write_all(&self, path: &Path, data: &[u8]) -> FsResult<()> {
        let mut handle = self.open_with(
            path,
            OpenOptions::new(AccessRights::WRITE, ShareRights::READ).create(true),
        )?;
        handle.set_len(0)?;
        for chunk in data.chunks(self.config.io_chunk_size) {
            handle.write_all(chunk)?;
        }
        handle.close()
    }

    /// Recursively remove `path`, retrying while files inside are held by
    /// handles that refuse deletion. Files held only by delete-sharing
    /// handles become pending deletions.
    pub fn remove_tree(&self, path: &Path) -> FsResult<()> {
        removal::remove_tree_with(
            path,
            &self.config.removal,
            Some(self.registry.faults()),
            |root| self.release_tree(root),
        )
    }

    // Every name is removed through `delete` under its entry lock, so opens
    // admitted during the walk are still arbitrated. Directories go last and
    // only once empty; graveyards hold names already deleted.
    fn release_tree(&self, root: &Path) -> FsResult<()> {
        let graveyard = self.config.graveyard_dir_name.as_str();

        // Refuse up front so a blocked tree is left whole
        for entry in names_in_tree(root, graveyard) {
            let Ok(Some(identity)) = identity::resolve_name(entry.path()) else {
                continue;
            };
            if !self.registry.inspect(identity, |state| state.allows_delete()) {
                debug!(%identity, path = %entry.path().display(), "tree removal blocked by open handle");
                return Err(FsError::Busy);
            }
        }

        for entry in names_in_tree(root, graveyard) {
            match self.delete(entry.path()) {
                Ok(()) | Err(FsError::NotFound) | Err(FsError::IsADirectory) => {}
                Err(FsError::SharingViolation) => {
                    debug!(path = %entry.path().display(), "tree removal blocked by open handle");
                    return Err(FsError::Busy);
                }
                Err(err) => return Err(err),
            }
        }

        for entry in WalkDir::new(root).contents_first(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() {
                continue;
            }
            let removed = if entry.file_name() == graveyard {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_dir(entry.path())
            };
            match removed.map_err(FsError::from_io) {
                Ok(()) | Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> ArbiterStats {
        self.registry.stats()
    }

    /// Synthetic failure controls for exercising error paths.
    pub fn faults(&self) -> &FaultInjector {
        self.registry.faults()
    }

    #[cfg(feature = "events")]
    pub fn subscribe_events(&self, cb: Arc<dyn EventSink>) -> FsResult<SubscriptionId> {
        self.registry.subscribe_events(cb)
    }

    #[cfg(feature = "events")]
    pub fn unsubscribe_events(&self, sub: SubscriptionId) -> FsResult<()> {
        self.registry.unsubscribe_events(sub)
    }
}

/// Every non-directory entry below `root`, skipping graveyard directories.
fn names_in_tree<'a>(
    root: &'a Path,
    graveyard: &'a str,
) -> impl Iterator<Item = walkdir::DirEntry> + 'a {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(move |entry| entry.file_name() != graveyard)
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
}
