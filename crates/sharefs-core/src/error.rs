// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for ShareFS Core

use std::io;

/// Core arbitration error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("sharing violation")]
    SharingViolation,
    #[error("permission denied")]
    PermissionDenied,
    #[error("already exists")]
    AlreadyExists,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("busy")]
    Busy,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Classify a host I/O error into the arbitration taxonomy.
    ///
    /// Only the kinds callers are expected to branch on are lifted out of
    /// `Io`; everything else is propagated untouched.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            _ => match err.raw_os_error() {
                Some(code) if is_busy_errno(code) => FsError::Busy,
                _ => FsError::Io(err),
            },
        }
    }

    /// Whether a retry loop may reasonably expect this error to clear on its own.
    /// Sharing violations are the caller's call and never count.
    pub fn is_transient(&self) -> bool {
        match self {
            FsError::Busy => true,
            #[cfg(windows)]
            FsError::PermissionDenied => true,
            FsError::Io(err) => {
                matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
                    || err.raw_os_error().is_some_and(is_busy_errno)
            }
            _ => false,
        }
    }
}

#[cfg(unix)]
fn is_busy_errno(code: i32) -> bool {
    code == libc::EBUSY || code == libc::ETXTBSY || code == libc::ENOTEMPTY
}

// ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION, ERROR_DIR_NOT_EMPTY
#[cfg(not(unix))]
fn is_busy_errno(code: i32) -> bool {
    matches!(code, 32 | 33 | 145)
}

pub type FsResult<T> = Result<T, FsError>;
