// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The App Install Record: host-owned bookkeeping for one installed app
//! instance. The manifest owns intent; this record owns the pin and
//! provenance. Created atomically at install time.

use crate::{EnvValue, KitVersionReq};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Informational schema string written into new app records.
pub const APP_RECORD_SCHEMA: &str = "nah.app.install.v2";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppInstallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    pub install: InstallSection,

    /// Audit snapshot of the manifest identity at install time. The manifest
    /// stays authoritative; a divergence surfaces as `invalid_configuration`.
    #[serde(default)]
    pub app: AppIdentitySnapshot,

    /// The pin written at install time. Absent for standalone apps and for
    /// installs that opted into an unresolved pin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nak: Option<NakPin>,

    pub paths: AppRecordPaths,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<OverridesSection>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstallSection {
    /// Required and immutable once written.
    pub instance_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AppIdentitySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nak_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nak_version_req: Option<KitVersionReq>,
}

/// The recorded choice of runtime kit for this instance. `record_ref` is a
/// filename inside the NAK registry directory and is write-once.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NakPin {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub record_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppRecordPaths {
    pub install_root: Utf8PathBuf,
}

/// The trust fields that drive warnings. `details` is opaque pass-through.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TrustSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OverridesSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, EnvValue>,

    #[serde(default, skip_serializing_if = "ArgumentOverrides::is_empty")]
    pub arguments: ArgumentOverrides,

    #[serde(default, skip_serializing_if = "PathOverrides::is_empty")]
    pub paths: PathOverrides,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ArgumentOverrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepend: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append: Vec<String>,
}

impl ArgumentOverrides {
    pub fn is_empty(&self) -> bool {
        self.prepend.is_empty() && self.append.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PathOverrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_prepend: Vec<String>,
}

impl PathOverrides {
    pub fn is_empty(&self) -> bool {
        self.library_prepend.is_empty()
    }
}
