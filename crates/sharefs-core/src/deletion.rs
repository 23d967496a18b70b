// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Deferred deletion: keeping unlinked-but-open files alive until last close
//!
//! Per identity the lifecycle is `Live -> PendingDeletion -> Reclaimed`, or
//! `Live -> Reclaimed` when nothing holds the file at unlink time. A pending
//! file has its name moved into a hidden graveyard directory next to it, so
//! path lookups stop seeing it while open descriptors keep working. The
//! graveyard copy is removed when the last handle is released. This does not
//! lean on the host's own unlink-while-open behavior.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::FileIdentity;

/// Per-identity deletion state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Live,
    PendingDeletion { graveyard: PathBuf },
    Reclaimed,
}

impl Lifecycle {
    pub fn is_live(&self) -> bool {
        matches!(self, Lifecycle::Live)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Lifecycle::PendingDeletion { .. })
    }

    /// `Live -> PendingDeletion`; the only way into the pending state.
    pub(crate) fn mark_pending(&mut self, graveyard: PathBuf) -> FsResult<()> {
        match self {
            Lifecycle::Live => {
                *self = Lifecycle::PendingDeletion { graveyard };
                Ok(())
            }
            _ => Err(FsError::NotFound),
        }
    }

    /// `Live -> Reclaimed` for an unlink with no open handles.
    pub(crate) fn mark_reclaimed(&mut self) {
        *self = Lifecycle::Reclaimed;
    }

    /// `PendingDeletion -> Reclaimed`, handing back the graveyard path to
    /// remove. Returns `None` in every other state, so reclamation can only
    /// be triggered once.
    pub(crate) fn take_reclaimable(&mut self) -> Option<PathBuf> {
        match std::mem::replace(self, Lifecycle::Reclaimed) {
            Lifecycle::PendingDeletion { graveyard } => Some(graveyard),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Where a pending-deletion name for `identity` is parked.
pub(crate) fn graveyard_path(path: &Path, identity: FileIdentity, dir_name: &str) -> PathBuf {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parent
        .join(dir_name)
        .join(format!("{:x}-{:x}.deleted", identity.dev, identity.ino))
}

// Reclaims of other identities may drop the shared graveyard directory
// between its creation and the rename into it
const DETACH_ATTEMPTS: u32 = 16;

/// Move `path` out of its directory listing without releasing storage.
pub(crate) fn detach(path: &Path, identity: FileIdentity, dir_name: &str) -> FsResult<PathBuf> {
    let target = graveyard_path(path, identity, dir_name);
    let mut attempt = 1;
    loop {
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(FsError::from_io)?;
        }
        match fs::rename(path, &target) {
            Ok(()) => break,
            Err(err)
                if err.kind() == io::ErrorKind::NotFound
                    && attempt < DETACH_ATTEMPTS
                    && fs::symlink_metadata(path).is_ok() =>
            {
                debug!(%identity, attempt, "graveyard directory vanished, retrying detach");
                attempt += 1;
            }
            Err(err) => return Err(FsError::from_io(err)),
        }
    }
    debug!(%identity, path = %path.display(), graveyard = %target.display(), "detached name");
    Ok(target)
}

/// Put a detached name back; used to roll back a half-done rename.
pub(crate) fn reattach(graveyard: &Path, path: &Path) -> FsResult<()> {
    fs::rename(graveyard, path).map_err(FsError::from_io)?;
    forget_graveyard_dir(graveyard);
    Ok(())
}

/// Ordinary unlink of a name nobody holds.
pub(crate) fn unlink_now(path: &Path) -> FsResult<()> {
    fs::remove_file(path).map_err(FsError::from_io)
}

/// Free the storage behind a graveyard name. A graveyard entry that is
/// already gone (e.g. swept by a recursive removal) counts as reclaimed.
pub(crate) fn reclaim(graveyard: &Path) -> FsResult<()> {
    match fs::remove_file(graveyard) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(graveyard = %graveyard.display(), "graveyard entry already gone");
        }
        Err(err) => {
            warn!(graveyard = %graveyard.display(), error = %err, "failed to reclaim storage");
            return Err(FsError::from_io(err));
        }
    }
    forget_graveyard_dir(graveyard);
    Ok(())
}

// Drop the graveyard directory once it holds nothing
fn forget_graveyard_dir(graveyard: &Path) {
    if let Some(dir) = graveyard.parent() {
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> FileIdentity {
        FileIdentity::new(1, 42)
    }

    #[test]
    fn pending_never_returns_to_live() {
        let mut state = Lifecycle::Live;
        state.mark_pending(PathBuf::from("/g/x")).unwrap();
        assert!(state.is_pending());
        assert!(state.mark_pending(PathBuf::from("/g/y")).is_err());

        assert_eq!(state.take_reclaimable(), Some(PathBuf::from("/g/x")));
        assert_eq!(state, Lifecycle::Reclaimed);
        assert_eq!(state.take_reclaimable(), None);
        assert!(!state.is_live());
    }

    #[test]
    fn live_state_has_nothing_to_reclaim() {
        let mut state = Lifecycle::Live;
        assert_eq!(state.take_reclaimable(), None);
        assert!(state.is_live());
    }

    #[test]
    fn detach_hides_name_and_reclaim_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim.txt");
        fs::write(&path, b"payload").unwrap();

        let graveyard = detach(&path, identity(), ".grave").unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read(&graveyard).unwrap(), b"payload");
        assert!(graveyard.starts_with(dir.path().join(".grave")));

        reclaim(&graveyard).unwrap();
        assert!(!graveyard.exists());
        assert!(!dir.path().join(".grave").exists());

        // Second reclaim of a vanished entry is tolerated
        reclaim(&graveyard).unwrap();
    }

    #[test]
    fn detach_recreates_graveyard_removed_by_a_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        fs::write(&first, b"1").unwrap();
        fs::write(&second, b"2").unwrap();

        let parked = detach(&first, identity(), ".grave").unwrap();
        reclaim(&parked).unwrap();
        assert!(!dir.path().join(".grave").exists());

        let parked = detach(&second, FileIdentity::new(1, 43), ".grave").unwrap();
        assert_eq!(fs::read(&parked).unwrap(), b"2");
        assert!(!second.exists());
    }

    #[test]
    fn detach_of_missing_name_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = detach(&dir.path().join("gone.txt"), identity(), ".grave").unwrap_err();
        assert!(matches!(err, FsError::NotFound));
    }

    #[test]
    fn reattach_restores_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("back.txt");
        fs::write(&path, b"1").unwrap();
        let graveyard = detach(&path, identity(), ".grave").unwrap();
        reattach(&graveyard, &path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join(".grave").exists());
    }
}
