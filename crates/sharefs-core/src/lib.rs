// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! ShareFS Core - share-mode arbitration for host files
//!
//! Provides Windows-style sharing semantics on top of an ordinary host
//! filesystem: every open declares what it does (access) and what it lets
//! others do concurrently (share), conflicting opens are refused, and
//! deleting a file that is still open hides its name at once while the data
//! stays readable through the open handles until the last one is closed.

pub mod arbiter;
pub mod config;
pub mod deletion;
pub mod error;
pub mod fault;
pub mod handle;
pub mod identity;
pub mod registry;
pub mod removal;
pub mod types;

pub use arbiter::ShareArbiter;
pub use config::{ArbiterConfig, ArbiterLimits, RemovalPolicy};
pub use deletion::Lifecycle;
pub use error::{FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule};
pub use handle::FileHandle;
pub use removal::remove_tree;
pub use types::*;
