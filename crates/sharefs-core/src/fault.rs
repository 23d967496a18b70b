// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + runtime controller for the arbiter

use crate::FsError;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Mutex, PoisonError};

/// Arbitration boundaries where synthetic failures can be injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    /// After the admission check passed, before the descriptor is registered
    Open,
    /// After the delete check passed, before the name is touched
    Unlink,
    /// Physical removal of a pending-deletion file
    Reclaim,
    /// One attempt of a recursive directory removal
    RemoveTree,
}

/// Supported errno values for synthetic failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Ebusy,
    Eacces,
}

impl FaultErrno {
    fn to_error(self) -> FsError {
        match self {
            FaultErrno::Eio => FsError::Io(io::Error::from_raw_os_error(libc::EIO)),
            FaultErrno::Ebusy => FsError::Busy,
            FaultErrno::Eacces => FsError::PermissionDenied,
        }
    }
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Optional number of leading invocations to skip before injecting faults.
    #[serde(default)]
    pub start_after: u64,
    /// Optional maximum number of injected failures for this rule.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

/// JSON-serializable fault policy.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Convenience: fail `op` with `errno` for the next `count` invocations.
    pub fn failing(op: FaultOp, errno: FaultErrno, count: u64) -> Self {
        Self {
            enabled: true,
            rules: vec![FaultRule {
                op,
                errno,
                start_after: 0,
                max_faults: Some(count),
            }],
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FaultState::default()),
        }
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Total faults injected so far for `op` under the current policy.
    pub fn hits(&self, op: FaultOp) -> u64 {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .policy
            .rules
            .iter()
            .zip(guard.counters.iter())
            .filter(|(rule, _)| rule.op == op)
            .map(|(_, counters)| counters.hits)
            .sum()
    }

    pub fn check(&self, op: FaultOp) -> Result<(), FsError> {
        match self.should_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn should_fault(&self, op: FaultOp) -> Option<FsError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *guard;
        counters.resize(policy.rules.len(), RuleCounters::default());
        for (rule, counters) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            tracing::debug!(?op, errno = ?rule.errno, "injecting fault");
            return Some(rule.errno.to_error());
        }
        None
    }
}
