// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The NAK Install Record: one per installed runtime-kit version, owning the
//! kit's on-disk layout. All persisted paths are absolute and must resolve
//! under `paths.root`.

use crate::EnvValue;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Informational schema string written into new NAK records.
pub const NAK_RECORD_SCHEMA: &str = "nah.nak.install.v2";

/// Loader name used when a record carries the legacy singular `loader` form.
pub const DEFAULT_LOADER: &str = "default";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NakInstallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    pub nak: NakIdentity,

    pub paths: NakPaths,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, EnvValue>,

    /// Keyed by loader name. Absent (and no legacy `loader`) means a
    /// libs-only kit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loaders: BTreeMap<String, LoaderSpec>,

    /// Legacy singular form, read as loader name `"default"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<LoaderSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<NakExecution>,
}

impl NakInstallRecord {
    /// The loaders map with the legacy singular `loader` folded in under
    /// `"default"`. An explicit `loaders.default` wins over the legacy form.
    pub fn effective_loaders(&self) -> BTreeMap<String, &LoaderSpec> {
        let mut loaders: BTreeMap<String, &LoaderSpec> = self
            .loaders
            .iter()
            .map(|(name, spec)| (name.clone(), spec))
            .collect();
        if let Some(legacy) = &self.loader {
            loaders.entry(DEFAULT_LOADER.to_owned()).or_insert(legacy);
        }
        loaders
    }

    /// Resource root, defaulting to the kit root when absent.
    pub fn resource_root(&self) -> &Utf8Path {
        self.paths
            .resource_root
            .as_deref()
            .unwrap_or(&self.paths.root)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NakIdentity {
    pub id: String,
    /// Must be core `MAJOR.MINOR.PATCH`; loaders enforce this.
    pub version: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NakPaths {
    pub root: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_root: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lib_dirs: Vec<Utf8PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoaderSpec {
    pub exec_path: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args_template: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NakExecution {
    /// Placeholder-bearing working-directory template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}
