// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle registry: who holds what on which file
//!
//! The registry maps each [`FileIdentity`] to an individually locked
//! [`RegistryEntry`]. The outer map lock is only held long enough to find or
//! insert an entry; every admission, release and unlink decision for an
//! identity runs under that entry's own lock, so unrelated files never
//! contend. Entries are created on first use and retired once they hold no
//! handles and no pending deletion. Lock order is entry before map.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::deletion::{self, Lifecycle};
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp};
use crate::handle::FileHandle;
use crate::identity;
use crate::{AccessRights, ArbiterConfig, ArbiterStats, FileIdentity, HandleId, ShareRights};
#[cfg(feature = "events")]
use crate::{EventKind, EventSink, SubscriptionId};

/// Rights one live handle holds on its identity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleDescriptor {
    pub ordinal: HandleId,
    pub access: AccessRights,
    pub share: ShareRights,
}

/// Live handles and deletion state for one identity
#[derive(Debug)]
pub struct RegistryEntry {
    identity: FileIdentity,
    handles: Vec<HandleDescriptor>,
    lifecycle: Lifecycle,
    retired: bool,
}

impl RegistryEntry {
    fn new(identity: FileIdentity) -> Self {
        Self {
            identity,
            handles: Vec::new(),
            lifecycle: Lifecycle::Live,
            retired: false,
        }
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn handles(&self) -> &[HandleDescriptor] {
        &self.handles
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Union of the access every live handle holds
    pub fn held_access(&self) -> AccessRights {
        self.handles.iter().fold(AccessRights::NONE, |acc, h| acc.union(h.access))
    }

    /// Intersection of what every live handle tolerates from others
    pub fn granted_share(&self) -> ShareRights {
        self.handles.iter().fold(ShareRights::ALL, |acc, h| acc.intersect(h.share))
    }

    /// The admission rule: existing holders must tolerate the new access and
    /// the newcomer must tolerate everything already held.
    pub fn admits(&self, access: AccessRights, share: ShareRights) -> bool {
        self.granted_share().permits(access) && share.permits(self.held_access())
    }

    pub fn allows_delete(&self) -> bool {
        self.handles.iter().all(|h| h.share.delete)
    }

    fn is_idle(&self) -> bool {
        self.handles.is_empty() && !self.lifecycle.is_pending()
    }
}

/// What happened to a file displaced by a rename
#[cfg_attr(not(feature = "events"), allow(dead_code))]
enum Displaced {
    Reclaimed(FileIdentity),
    Pending(FileIdentity, PathBuf),
}

/// Result of removing a descriptor from its entry
struct Release {
    reclaim: Option<FsResult<()>>,
}

/// What removing a name did to the file behind it
enum Unlinked {
    Reclaimed,
    Pending(usize),
    // Other hard links keep the file alive
    NameOnly,
}

pub struct Registry {
    graveyard_dir_name: String,
    max_open_handles: usize,
    entries: Mutex<HashMap<FileIdentity, Arc<Mutex<RegistryEntry>>>>,
    next_ordinal: AtomicU64,
    open_handles: AtomicUsize,
    pending_deletions: AtomicUsize,
    reclaimed: AtomicU64,
    faults: FaultInjector,
    #[cfg_attr(not(feature = "events"), allow(dead_code))]
    track_events: bool,
    #[cfg(feature = "events")]
    next_subscription_id: AtomicU64,
    #[cfg(feature = "events")]
    event_subscriptions: Mutex<HashMap<SubscriptionId, Arc<dyn EventSink>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub fn new(config: &ArbiterConfig) -> Self {
        Self {
            graveyard_dir_name: config.graveyard_dir_name.clone(),
            max_open_handles: config.limits.max_open_handles as usize,
            entries: Mutex::new(HashMap::new()),
            next_ordinal: AtomicU64::new(1),
            open_handles: AtomicUsize::new(0),
            pending_deletions: AtomicUsize::new(0),
            reclaimed: AtomicU64::new(0),
            faults: FaultInjector::new(),
            track_events: config.track_events,
            #[cfg(feature = "events")]
            next_subscription_id: AtomicU64::new(1),
            #[cfg(feature = "events")]
            event_subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    fn entry_for(&self, identity: FileIdentity) -> Arc<Mutex<RegistryEntry>> {
        let mut entries = lock(&self.entries);
        Arc::clone(
            entries
                .entry(identity)
                .or_insert_with(|| Arc::new(Mutex::new(RegistryEntry::new(identity)))),
        )
    }

    fn forget(&self, identity: FileIdentity, entry: &Arc<Mutex<RegistryEntry>>) {
        let mut entries = lock(&self.entries);
        if entries.get(&identity).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            entries.remove(&identity);
        }
    }

    /// Run `f` with the identity's entry locked. An entry that was retired
    /// between lookup and locking is skipped and a fresh one is used.
    fn with_entry<R>(&self, identity: FileIdentity, f: impl FnOnce(&mut RegistryEntry) -> R) -> R {
        let entry = self.entry_for(identity);
        let mut guard = lock(&entry);
        if guard.retired {
            drop(guard);
            return self.with_entry(identity, f);
        }
        let result = f(&mut guard);
        if guard.is_idle() {
            guard.retired = true;
            self.forget(identity, &entry);
        }
        result
    }

    /// Inspect an identity's entry without changing it.
    pub fn inspect<R>(&self, identity: FileIdentity, f: impl FnOnce(&RegistryEntry) -> R) -> R {
        self.with_entry(identity, |entry| f(entry))
    }

    fn reserve_handle_slot(&self) -> FsResult<()> {
        let max = self.max_open_handles;
        self.open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| FsError::TooManyOpenFiles)
    }

    /// Admit a new handle on `identity` for the already opened `file`.
    ///
    /// `path` must still name `identity` at decision time; otherwise the
    /// open raced with an unlink or rename and is refused as not found.
    /// On refusal nothing is registered and `file` is dropped.
    pub fn try_open(
        self: &Arc<Self>,
        identity: FileIdentity,
        file: File,
        path: &Path,
        access: AccessRights,
        share: ShareRights,
    ) -> FsResult<FileHandle> {
        let ordinal = self.with_entry(identity, |entry| self.admit(entry, path, access, share))?;
        debug!(%identity, %ordinal, path = %path.display(), ?access, ?share, "handle admitted");
        #[cfg(feature = "events")]
        self.emit_event(EventKind::Opened {
            identity,
            handle: ordinal,
        });
        Ok(FileHandle::new(
            Arc::clone(self),
            identity,
            ordinal,
            access,
            share,
            path.to_path_buf(),
            file,
        ))
    }

    fn admit(
        &self,
        entry: &mut RegistryEntry,
        path: &Path,
        access: AccessRights,
        share: ShareRights,
    ) -> FsResult<HandleId> {
        if !entry.lifecycle.is_live() || !identity::still_names(path, entry.identity) {
            return Err(FsError::NotFound);
        }
        if !entry.admits(access, share) {
            debug!(
                identity = %entry.identity,
                held = ?entry.held_access(),
                granted = ?entry.granted_share(),
                ?access,
                ?share,
                "sharing violation on open"
            );
            return Err(FsError::SharingViolation);
        }
        self.reserve_handle_slot()?;
        if let Err(err) = self.faults.check(FaultOp::Open) {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        let ordinal = HandleId::new(self.next_ordinal.fetch_add(1, Ordering::Relaxed));
        entry.handles.push(HandleDescriptor {
            ordinal,
            access,
            share,
        });
        Ok(ordinal)
    }

    /// Drop the descriptor `ordinal` from `identity`. The last release of a
    /// pending-deletion file reclaims its storage.
    pub fn release(&self, identity: FileIdentity, ordinal: HandleId) -> FsResult<()> {
        let outcome = self.with_entry(identity, |entry| -> FsResult<Release> {
            let pos = entry
                .handles
                .iter()
                .position(|h| h.ordinal == ordinal)
                .ok_or(FsError::BadFileDescriptor)?;
            entry.handles.remove(pos);
            self.open_handles.fetch_sub(1, Ordering::SeqCst);

            if !entry.handles.is_empty() {
                return Ok(Release { reclaim: None });
            }
            let reclaim = entry.lifecycle.take_reclaimable().map(|graveyard| -> FsResult<()> {
                self.pending_deletions.fetch_sub(1, Ordering::SeqCst);
                self.faults.check(FaultOp::Reclaim)?;
                deletion::reclaim(&graveyard)?;
                self.reclaimed.fetch_add(1, Ordering::SeqCst);
                info!(%identity, graveyard = %graveyard.display(), "reclaimed storage after last close");
                Ok(())
            });
            Ok(Release { reclaim })
        })?;

        debug!(%identity, %ordinal, "handle released");
        #[cfg(feature = "events")]
        self.emit_event(EventKind::Released {
            identity,
            handle: ordinal,
        });
        match outcome.reclaim {
            Some(Ok(())) => {
                #[cfg(feature = "events")]
                self.emit_event(EventKind::Reclaimed { identity });
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove the name `path` of `identity`. Allowed when nothing holds the
    /// file or every holder shares Delete. With holders present the name is
    /// detached and storage lives on until the last release. When other hard
    /// links remain only the name goes and the file stays live.
    pub fn try_unlink(&self, identity: FileIdentity, path: &Path) -> FsResult<()> {
        let unlinked = self.with_entry(identity, |entry| -> FsResult<Unlinked> {
            let links = match identity::links_of_name(path, entry.identity) {
                Some(links) if entry.lifecycle.is_live() => links,
                _ => return Err(FsError::NotFound),
            };
            if !entry.allows_delete() {
                debug!(%identity, holders = entry.handles.len(), "sharing violation on delete");
                return Err(FsError::SharingViolation);
            }
            self.faults.check(FaultOp::Unlink)?;

            if links > 1 {
                deletion::unlink_now(path)?;
                return Ok(Unlinked::NameOnly);
            }
            if entry.handles.is_empty() {
                deletion::unlink_now(path)?;
                entry.lifecycle.mark_reclaimed();
                self.reclaimed.fetch_add(1, Ordering::SeqCst);
                return Ok(Unlinked::Reclaimed);
            }
            let graveyard = deletion::detach(path, identity, &self.graveyard_dir_name)?;
            entry.lifecycle.mark_pending(graveyard)?;
            self.pending_deletions.fetch_add(1, Ordering::SeqCst);
            Ok(Unlinked::Pending(entry.handles.len()))
        })?;

        match unlinked {
            Unlinked::NameOnly => {
                debug!(%identity, path = %path.display(), "unlinked one of several names");
            }
            Unlinked::Reclaimed => {
                debug!(%identity, path = %path.display(), "unlinked");
                #[cfg(feature = "events")]
                self.emit_event(EventKind::Reclaimed { identity });
            }
            Unlinked::Pending(remaining) => {
                debug!(%identity, path = %path.display(), remaining, "deletion pending on open handles");
                #[cfg(feature = "events")]
                self.emit_event(EventKind::DeletePending {
                    identity,
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    /// Remove a symlink. Only the link goes; the file it points at and any
    /// handles on that file are untouched.
    pub fn unlink_symlink(&self, path: &Path) -> FsResult<()> {
        let meta = fs::symlink_metadata(path).map_err(FsError::from_io)?;
        if !meta.file_type().is_symlink() {
            return Err(FsError::Busy);
        }
        self.faults.check(FaultOp::Unlink)?;
        deletion::unlink_now(path)?;
        debug!(path = %path.display(), "unlinked symlink");
        Ok(())
    }

    /// Whether `identity` currently has live handles.
    pub fn is_held(&self, identity: FileIdentity) -> bool {
        self.with_entry(identity, |entry| !entry.handles.is_empty())
    }

    /// Rename `from` (naming `identity`) to `to`. Renaming counts as deleting
    /// the source name, and replacing `to` counts as deleting the target.
    pub fn try_rename(&self, identity: FileIdentity, from: &Path, to: &Path) -> FsResult<()> {
        // A symlink at `to` is replaced as a plain name
        let target = match identity::resolve_name(to) {
            Ok(Some(target)) if target != identity => Some(target),
            Ok(_) | Err(FsError::NotFound) => None,
            Err(err) => return Err(err),
        };

        let displaced = match target {
            None => self.with_entry(identity, |src| self.rename_locked(src, None, from, to))?,
            Some(target) => {
                let (first, second) =
                    if identity < target { (identity, target) } else { (target, identity) };
                self.with_entry(first, |a| {
                    self.with_entry(second, |b| {
                        if a.identity == identity {
                            self.rename_locked(a, Some(b), from, to)
                        } else {
                            self.rename_locked(b, Some(a), from, to)
                        }
                    })
                })?
            }
        };

        debug!(%identity, from = %from.display(), to = %to.display(), "renamed");
        #[cfg(feature = "events")]
        {
            self.emit_event(EventKind::Renamed {
                identity,
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            });
            match displaced {
                Some(Displaced::Reclaimed(identity)) => {
                    self.emit_event(EventKind::Reclaimed { identity })
                }
                Some(Displaced::Pending(identity, path)) => {
                    self.emit_event(EventKind::DeletePending { identity, path })
                }
                None => {}
            }
        }
        #[cfg(not(feature = "events"))]
        let _ = displaced;
        Ok(())
    }

    fn rename_locked(
        &self,
        src: &mut RegistryEntry,
        dst: Option<&mut RegistryEntry>,
        from: &Path,
        to: &Path,
    ) -> FsResult<Option<Displaced>> {
        if !src.lifecycle.is_live() || !identity::still_names(from, src.identity) {
            return Err(FsError::NotFound);
        }
        if !src.allows_delete() {
            return Err(FsError::SharingViolation);
        }
        let Some(dst) = dst else {
            fs::rename(from, to).map_err(FsError::from_io)?;
            return Ok(None);
        };

        let links = match identity::links_of_name(to, dst.identity) {
            Some(links) if dst.lifecycle.is_live() => links,
            _ => return Err(FsError::Busy),
        };
        if !dst.allows_delete() {
            return Err(FsError::SharingViolation);
        }
        if links > 1 {
            fs::rename(from, to).map_err(FsError::from_io)?;
            return Ok(None);
        }
        if dst.handles.is_empty() {
            fs::rename(from, to).map_err(FsError::from_io)?;
            dst.lifecycle.mark_reclaimed();
            self.reclaimed.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(Displaced::Reclaimed(dst.identity)));
        }

        let graveyard = deletion::detach(to, dst.identity, &self.graveyard_dir_name)?;
        if let Err(err) = fs::rename(from, to).map_err(FsError::from_io) {
            if let Err(rollback) = deletion::reattach(&graveyard, to) {
                warn!(
                    identity = %dst.identity,
                    error = %rollback,
                    "failed to restore displaced rename target"
                );
            }
            return Err(err);
        }
        dst.lifecycle.mark_pending(graveyard)?;
        self.pending_deletions.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Displaced::Pending(dst.identity, to.to_path_buf())))
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            tracked_identities: lock(&self.entries).len(),
            open_handles: self.open_handles.load(Ordering::SeqCst),
            pending_deletions: self.pending_deletions.load(Ordering::SeqCst),
            reclaimed: self.reclaimed.load(Ordering::SeqCst),
        }
    }

    #[cfg(feature = "events")]
    pub fn subscribe_events(&self, cb: Arc<dyn EventSink>) -> FsResult<SubscriptionId> {
        let subscription_id =
            SubscriptionId::new(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.event_subscriptions).insert(subscription_id, cb);
        Ok(subscription_id)
    }

    #[cfg(feature = "events")]
    pub fn unsubscribe_events(&self, sub: SubscriptionId) -> FsResult<()> {
        if lock(&self.event_subscriptions).remove(&sub).is_none() {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    // Sinks run outside every registry lock so they may call back in
    #[cfg(feature = "events")]
    fn emit_event(&self, event: EventKind) {
        if !self.track_events {
            return;
        }
        let sinks: Vec<Arc<dyn EventSink>> =
            lock(&self.event_subscriptions).values().cloned().collect();
        for sink in sinks {
            sink.on_event(&event);
        }
    }
}
