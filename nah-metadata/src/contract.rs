// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Launch Contract and its envelope: the single stable output shape.
//!
//! All map-like fields are `BTreeMap` so key order is lexicographic and the
//! serialized envelope is byte-identical for identical inputs. Arrays keep
//! insertion order; warnings keep emission order.

use crate::{CriticalError, Warning};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema string carried by every envelope.
pub const ENVELOPE_SCHEMA: &str = "nah.launch.contract.v1";

/// The deterministic, auditable description of how to execute an installed
/// application. Output only; never persisted.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LaunchContract {
    pub app: AppView,

    /// Absent for standalone apps and unresolved pins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nak: Option<NakView>,

    pub execution: ExecutionView,

    pub environment: BTreeMap<String, String>,

    pub enforcement: Enforcement,

    pub trust: TrustView,

    pub exports: BTreeMap<String, ExportEntry>,

    pub capability_usage: CapabilityUsage,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppView {
    pub id: String,
    pub version: String,
    pub root: Utf8PathBuf,
    pub entrypoint: Utf8PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NakView {
    pub id: String,
    pub version: String,
    pub root: Utf8PathBuf,
    pub resource_root: Utf8PathBuf,
    pub record_ref: String,
    /// Name of the active loader, when one was selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionView {
    pub binary: Utf8PathBuf,
    pub arguments: Vec<String>,
    pub cwd: Utf8PathBuf,
    pub library_path_env_key: String,
    pub library_paths: Vec<Utf8PathBuf>,
}

/// Enforcement lists are always empty in v1; the shape is carried so
/// consumers need not special-case their absence.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Enforcement {
    pub filesystem: Vec<String>,
    pub network: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrustView {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExportEntry {
    pub path: Utf8PathBuf,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CapabilityUsage {
    pub present: bool,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub critical: Vec<String>,
}

/// Per-value provenance, emitted when tracing is requested. `precedence_rank`
/// mirrors the merge layers 1..7; standard variables rank 5.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TraceEntry {
    pub value: String,
    pub source_kind: String,
    pub source_path: String,
    pub precedence_rank: u8,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Trace {
    pub environment: BTreeMap<String, TraceEntry>,
}

/// The JSON output shape wrapping every result. On a critical error the
/// contract fields are omitted and `critical_error` names the failure.
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub schema: String,

    #[serde(flatten)]
    pub contract: Option<LaunchContract>,

    pub warnings: Vec<Warning>,

    pub critical_error: Option<CriticalError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
}

impl Envelope {
    pub fn success(contract: LaunchContract, warnings: Vec<Warning>, trace: Option<Trace>) -> Self {
        Self {
            schema: ENVELOPE_SCHEMA.to_owned(),
            contract: Some(contract),
            warnings,
            critical_error: None,
            trace,
        }
    }

    pub fn critical(error: CriticalError, warnings: Vec<Warning>) -> Self {
        Self {
            schema: ENVELOPE_SCHEMA.to_owned(),
            contract: None,
            warnings,
            critical_error: Some(error),
            trace: None,
        }
    }

    /// The exit code command-line collaborators report for this envelope.
    pub fn exit_code(&self) -> i32 {
        if self.critical_error.is_some() {
            1
        } else {
            0
        }
    }
}
