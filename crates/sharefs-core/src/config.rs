// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for ShareFS Core

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FsError, FsResult};

/// System limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterLimits {
    pub max_open_handles: u32,
}

impl Default for ArbiterLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 10000,
        }
    }
}

/// Bounded retry policy for recursive directory removal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemovalPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl RemovalPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_delay_ms: 1000,
        }
    }
}

/// Main arbiter configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Hidden sibling directory that receives names detached by a pending deletion
    pub graveyard_dir_name: String,
    /// Write granularity of whole-file rewrites
    pub io_chunk_size: usize,
    pub limits: ArbiterLimits,
    pub removal: RemovalPolicy,
    pub track_events: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            graveyard_dir_name: ".sharefs-graveyard".to_string(),
            io_chunk_size: 4096,
            limits: ArbiterLimits::default(),
            removal: RemovalPolicy::default(),
            track_events: false,
        }
    }
}

impl ArbiterConfig {
    pub fn from_toml_str(text: &str) -> FsResult<Self> {
        let config: ArbiterConfig = toml::from_str(text).map_err(|err| {
            tracing::warn!(error = %err, "rejecting arbiter configuration");
            FsError::InvalidArgument
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        let name = self.graveyard_dir_name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(FsError::InvalidArgument);
        }
        if self.io_chunk_size == 0 || self.removal.max_attempts == 0 {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}
