// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-wide environment policy, a singleton at `<root>/host/host.json`.

use crate::EnvValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HostEnv {
    /// Fill-only defaults applied at the lowest precedence.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, EnvValue>,

    #[serde(default, skip_serializing_if = "HostPaths::is_empty")]
    pub paths: HostPaths,

    #[serde(default)]
    pub overrides: HostOverridePolicy,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HostPaths {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_prepend: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_append: Vec<String>,
}

impl HostPaths {
    pub fn is_empty(&self) -> bool {
        self.library_prepend.is_empty() && self.library_append.is_empty()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HostOverridePolicy {
    #[serde(default = "default_true")]
    pub allow_env_overrides: bool,
}

impl Default for HostOverridePolicy {
    fn default() -> Self {
        Self {
            allow_env_overrides: true,
        }
    }
}

fn default_true() -> bool {
    true
}
