// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Recursive removal with bounded retries
//!
//! Removing a tree can transiently fail while some other party still holds a
//! file inside it. Each attempt clears read-only bits, then removes
//! everything; transient failures are retried after a fixed delay until the
//! attempts in the [`RemovalPolicy`] run out. A path that is already gone
//! counts as removed.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::RemovalPolicy;
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp};

/// Remove `path` and everything beneath it, retrying per `policy`.
pub fn remove_tree(path: &Path, policy: &RemovalPolicy) -> FsResult<()> {
    remove_tree_with(path, policy, None, |_| Ok(()))
}

/// Retry loop shared with the arbiter. `prepare` runs in every attempt after
/// permissions are cleared and may remove the tree itself; a transient error
/// from it ends the attempt and schedules a retry.
pub(crate) fn remove_tree_with<F>(
    path: &Path,
    policy: &RemovalPolicy,
    faults: Option<&FaultInjector>,
    mut prepare: F,
) -> FsResult<()>
where
    F: FnMut(&Path) -> FsResult<()>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let result = attempt_removal(path, faults, &mut prepare);
        match result {
            Ok(()) | Err(FsError::NotFound) => {
                debug!(path = %path.display(), attempt, "tree removed");
                return Ok(());
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    path = %path.display(),
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "tree removal failed, retrying"
                );
                thread::sleep(policy.retry_delay());
            }
            Err(err) => {
                warn!(path = %path.display(), attempt, error = %err, "giving up on tree removal");
                return Err(err);
            }
        }
    }
    Err(FsError::Busy)
}

fn attempt_removal<F>(path: &Path, faults: Option<&FaultInjector>, prepare: &mut F) -> FsResult<()>
where
    F: FnMut(&Path) -> FsResult<()>,
{
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(FsError::from_io(err)),
    };
    if let Some(faults) = faults {
        faults.check(FaultOp::RemoveTree)?;
    }
    if meta.is_dir() {
        clear_readonly(path);
    }
    prepare(path)?;
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FsError::from_io(err)),
    }
}

// Best effort; anything left read-only surfaces as a removal error
fn clear_readonly(root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.path_is_symlink() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let mut perms = meta.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = perms.mode();
            let wanted = if meta.is_dir() { mode | 0o700 } else { mode | 0o200 };
            if wanted == mode {
                continue;
            }
            perms.set_mode(wanted);
        }
        #[cfg(not(unix))]
        {
            if !perms.readonly() {
                continue;
            }
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
        }
        let _ = fs::set_permissions(entry.path(), perms);
    }
}
