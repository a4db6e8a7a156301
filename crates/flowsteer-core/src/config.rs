//! Steering configuration.
//!
//! Holds the device flow-table capabilities consulted at bring-up and the
//! policy applied when a teardown command fails. Configuration can be
//! built in code or loaded from YAML.

use crate::error::{FsError, FsResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Flow-table capabilities reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// NIC receive flow tables are supported.
    #[serde(default = "default_nic_flow_table")]
    pub nic_flow_table: bool,

    /// The root table must be selected explicitly with SET_FLOW_TABLE_ROOT.
    #[serde(default = "default_modify_root")]
    pub modify_root: bool,

    /// Deepest table level the device can chain to.
    #[serde(default = "default_max_ft_level")]
    pub max_ft_level: u32,
}

fn default_nic_flow_table() -> bool {
    true
}

fn default_modify_root() -> bool {
    true
}

fn default_max_ft_level() -> u32 {
    64
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            nic_flow_table: default_nic_flow_table(),
            modify_root: default_modify_root(),
            max_ft_level: default_max_ft_level(),
        }
    }
}

/// What to do when a device command fails during teardown.
///
/// The in-memory tree is always torn down; the policy only decides whether
/// the caller hears about the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Log the failure and report success.
    #[default]
    BestEffort,
    /// Finish the teardown, then return the first failure.
    Strict,
}

/// Complete steering configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteeringConfig {
    #[serde(default)]
    pub caps: DeviceCaps,

    #[serde(default)]
    pub teardown: TeardownPolicy,
}

impl SteeringConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_modify_root(mut self, modify_root: bool) -> Self {
        self.caps.modify_root = modify_root;
        self
    }

    pub fn with_max_ft_level(mut self, level: u32) -> Self {
        self.caps.max_ft_level = level;
        self
    }

    pub fn with_nic_flow_table(mut self, supported: bool) -> Self {
        self.caps.nic_flow_table = supported;
        self
    }

    pub fn with_teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown = policy;
        self
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> FsResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| FsError::config(format!("Failed to parse steering config: {}", e)))
    }

    /// Loads a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> FsResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FsError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }
}

/// Device failures collected while tearing down part of a tree.
#[derive(Debug, Default)]
pub(crate) struct TeardownLog {
    errors: Vec<FsError>,
}

impl TeardownLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Logs a failed teardown step and keeps it for the policy decision.
    pub(crate) fn record(&mut self, what: &str, err: impl Into<FsError>) {
        let err = err.into();
        warn!("flow steering can't {}: {}", what, err);
        self.errors.push(err);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Applies the teardown policy to the collected failures.
    pub(crate) fn finish(self, policy: TeardownPolicy) -> FsResult<()> {
        match (policy, self.errors.into_iter().next()) {
            (TeardownPolicy::Strict, Some(first)) => Err(first),
            _ => Ok(()),
        }
    }
}
