// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for ShareFS

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Path-independent identity of a physical file (device + serial number)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}:{:x}", self.dev, self.ino)
    }
}

/// Opaque handle identifier, doubling as the monotonically increasing open ordinal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Access a handle requests for itself
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
}

/// Share mode for Windows compatibility
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareMode {
    Read,
    Write,
    Delete,
}

/// Set drawn from {Read, Write}; fixed for the life of a handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRights {
    pub read: bool,
    pub write: bool,
}

impl AccessRights {
    pub const NONE: AccessRights = AccessRights {
        read: false,
        write: false,
    };
    pub const READ: AccessRights = AccessRights {
        read: true,
        write: false,
    };
    pub const WRITE: AccessRights = AccessRights {
        read: false,
        write: true,
    };
    pub const READ_WRITE: AccessRights = AccessRights {
        read: true,
        write: true,
    };

    pub fn contains(self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
        }
    }

    pub fn union(self, other: AccessRights) -> AccessRights {
        AccessRights {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

impl From<&[AccessMode]> for AccessRights {
    fn from(modes: &[AccessMode]) -> Self {
        modes.iter().fold(AccessRights::NONE, |acc, mode| match mode {
            AccessMode::Read => acc.union(AccessRights::READ),
            AccessMode::Write => acc.union(AccessRights::WRITE),
        })
    }
}

/// Set drawn from {Read, Write, Delete}: what an opener lets *others* do concurrently
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareRights {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl ShareRights {
    pub const NONE: ShareRights = ShareRights {
        read: false,
        write: false,
        delete: false,
    };
    pub const READ: ShareRights = ShareRights {
        read: true,
        write: false,
        delete: false,
    };
    pub const READ_WRITE: ShareRights = ShareRights {
        read: true,
        write: true,
        delete: false,
    };
    pub const ALL: ShareRights = ShareRights {
        read: true,
        write: true,
        delete: true,
    };

    pub fn contains(self, mode: ShareMode) -> bool {
        match mode {
            ShareMode::Read => self.read,
            ShareMode::Write => self.write,
            ShareMode::Delete => self.delete,
        }
    }

    pub fn intersect(self, other: ShareRights) -> ShareRights {
        ShareRights {
            read: self.read && other.read,
            write: self.write && other.write,
            delete: self.delete && other.delete,
        }
    }

    /// True if every bit of `access` is tolerated by this share set
    pub fn permits(self, access: AccessRights) -> bool {
        (!access.read || self.read) && (!access.write || self.write)
    }

    pub fn with(self, mode: ShareMode) -> ShareRights {
        let mut out = self;
        match mode {
            ShareMode::Read => out.read = true,
            ShareMode::Write => out.write = true,
            ShareMode::Delete => out.delete = true,
        }
        out
    }
}

impl From<&[ShareMode]> for ShareRights {
    fn from(modes: &[ShareMode]) -> Self {
        modes.iter().fold(ShareRights::NONE, |acc, mode| acc.with(*mode))
    }
}

/// File open options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: AccessRights,
    pub share: ShareRights,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
}

impl OpenOptions {
    pub fn new(access: AccessRights, share: ShareRights) -> Self {
        Self {
            access,
            share,
            create: false,
            create_new: false,
            truncate: false,
        }
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

/// Event kinds for arbitration lifecycle notifications
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Opened {
        identity: FileIdentity,
        handle: HandleId,
    },
    Released {
        identity: FileIdentity,
        handle: HandleId,
    },
    /// Name detached while handles remain open
    DeletePending {
        identity: FileIdentity,
        path: PathBuf,
    },
    /// Backing storage freed; emitted at most once per identity
    Reclaimed {
        identity: FileIdentity,
    },
    Renamed {
        identity: FileIdentity,
        from: PathBuf,
        to: PathBuf,
    },
}

/// Event sink trait for receiving arbitration notifications
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn on_event(&self, evt: &EventKind);
}

/// Opaque event subscription identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Arbitration statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub tracked_identities: usize,
    pub open_handles: usize,
    pub pending_deletions: usize,
    pub reclaimed: u64,
}
