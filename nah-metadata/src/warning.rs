// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The closed warning taxonomy and the critical error set.
//!
//! Warnings never halt composition; critical errors are terminal and produce
//! no contract. Each warning serializes as `{"action":"warn","fields":{…},
//! "key":"<name>"}` with object keys alphabetized, so envelope output is
//! byte-stable for identical inputs.

use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::{collections::BTreeMap, error, fmt};

/// A non-fatal finding surfaced in the envelope. The variant fixes the `key`
/// and the field set; no free-form keys exist in v1.
#[derive(Clone, Debug, PartialEq)]
pub enum Warning {
    InvalidManifest {
        detail: String,
    },
    InvalidConfiguration {
        reason: String,
        detail: String,
    },
    HostEnvParseError {
        path: String,
        detail: String,
    },
    NakPinInvalid {
        reason: String,
    },
    /// Install-time only: no installed kit matches the required id.
    NakNotFound {
        nak_id: String,
        requirement: String,
    },
    NakVersionUnsupported {
        nak_id: String,
        pinned: String,
        requirement: String,
    },
    NakLoaderRequired {
        available: Vec<String>,
    },
    NakLoaderMissing {
        loader: String,
    },
    InvalidLibraryPath {
        path: String,
        source_kind: String,
    },
    CapabilityMalformed {
        domain: String,
        entry: String,
    },
    CapabilityUnknown {
        domain: String,
        op: String,
    },
    MissingEnvVar {
        missing: String,
        source_path: String,
    },
    InvalidTrustState {
        state: String,
    },
    TrustStateUnknown,
    TrustStateUnverified,
    TrustStateFailed,
    TrustStateStale {
        expires_at: String,
        now: String,
    },
    OverrideDenied {
        target: String,
        source_kind: String,
        source_ref: String,
    },
    OverrideInvalid {
        target: String,
        source_kind: String,
        reason: String,
    },
}

impl Warning {
    /// The canonical snake_case key for this warning.
    pub fn key(&self) -> &'static str {
        match self {
            Warning::InvalidManifest { .. } => "invalid_manifest",
            Warning::InvalidConfiguration { .. } => "invalid_configuration",
            Warning::HostEnvParseError { .. } => "host_env_parse_error",
            Warning::NakPinInvalid { .. } => "nak_pin_invalid",
            Warning::NakNotFound { .. } => "nak_not_found",
            Warning::NakVersionUnsupported { .. } => "nak_version_unsupported",
            Warning::NakLoaderRequired { .. } => "nak_loader_required",
            Warning::NakLoaderMissing { .. } => "nak_loader_missing",
            Warning::InvalidLibraryPath { .. } => "invalid_library_path",
            Warning::CapabilityMalformed { .. } => "capability_malformed",
            Warning::CapabilityUnknown { .. } => "capability_unknown",
            Warning::MissingEnvVar { .. } => "missing_env_var",
            Warning::InvalidTrustState { .. } => "invalid_trust_state",
            Warning::TrustStateUnknown => "trust_state_unknown",
            Warning::TrustStateUnverified => "trust_state_unverified",
            Warning::TrustStateFailed => "trust_state_failed",
            Warning::TrustStateStale { .. } => "trust_state_stale",
            Warning::OverrideDenied { .. } => "override_denied",
            Warning::OverrideInvalid { .. } => "override_invalid",
        }
    }

    /// The structured fields, keyed for sorted serialization.
    pub fn fields(&self) -> BTreeMap<&'static str, Value> {
        let mut fields = BTreeMap::new();
        let mut put = |key: &'static str, value: &str| {
            fields.insert(key, Value::String(value.to_owned()));
        };
        match self {
            Warning::InvalidManifest { detail } => put("detail", detail),
            Warning::InvalidConfiguration { reason, detail } => {
                put("detail", detail);
                put("reason", reason);
            }
            Warning::HostEnvParseError { path, detail } => {
                put("detail", detail);
                put("path", path);
            }
            Warning::NakPinInvalid { reason } => put("reason", reason),
            Warning::NakNotFound {
                nak_id,
                requirement,
            } => {
                put("nak_id", nak_id);
                put("requirement", requirement);
            }
            Warning::NakVersionUnsupported {
                nak_id,
                pinned,
                requirement,
            } => {
                put("nak_id", nak_id);
                put("pinned", pinned);
                put("requirement", requirement);
            }
            Warning::NakLoaderRequired { available } => {
                fields.insert(
                    "available",
                    Value::Array(
                        available
                            .iter()
                            .map(|name| Value::String(name.clone()))
                            .collect(),
                    ),
                );
            }
            Warning::NakLoaderMissing { loader } => put("loader", loader),
            Warning::InvalidLibraryPath { path, source_kind } => {
                put("path", path);
                put("source_kind", source_kind);
            }
            Warning::CapabilityMalformed { domain, entry } => {
                put("domain", domain);
                put("entry", entry);
            }
            Warning::CapabilityUnknown { domain, op } => {
                put("domain", domain);
                put("op", op);
            }
            Warning::MissingEnvVar {
                missing,
                source_path,
            } => {
                put("missing", missing);
                put("source_path", source_path);
            }
            Warning::InvalidTrustState { state } => put("state", state),
            Warning::TrustStateUnknown
            | Warning::TrustStateUnverified
            | Warning::TrustStateFailed => {}
            Warning::TrustStateStale { expires_at, now } => {
                put("expires_at", expires_at);
                put("now", now);
            }
            Warning::OverrideDenied {
                target,
                source_kind,
                source_ref,
            } => {
                put("source_kind", source_kind);
                put("source_ref", source_ref);
                put("target", target);
            }
            Warning::OverrideInvalid {
                target,
                source_kind,
                reason,
            } => {
                put("reason", reason);
                put("source_kind", source_kind);
                put("target", target);
            }
        }
        fields
    }
}

impl Serialize for Warning {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Field order is the alphabetized key order of the output object.
        let mut state = serializer.serialize_struct("Warning", 3)?;
        state.serialize_field("action", "warn")?;
        state.serialize_field("fields", &self.fields())?;
        state.serialize_field("key", self.key())?;
        state.end()
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())?;
        let fields = self.fields();
        if !fields.is_empty() {
            write!(f, " (")?;
            for (i, (key, value)) in fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match value {
                    Value::String(s) => write!(f, "{}={}", key, s)?,
                    other => write!(f, "{}={}", key, other)?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// An ordered warning collector. Composition and the install pipeline push
/// into one of these; emission order is preserved into the envelope.
#[derive(Clone, Debug, Default)]
pub struct WarningSink {
    warnings: Vec<Warning>,
}

impl WarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        self.warnings.extend(warnings);
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn as_slice(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn into_vec(self) -> Vec<Warning> {
        self.warnings
    }
}

/// Terminal failures: the envelope carries the name and no contract fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum CriticalError {
    ManifestMissing,
    EntrypointNotFound,
    PathTraversal,
    InstallRecordInvalid,
    NakLoaderInvalid,
}

impl CriticalError {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriticalError::ManifestMissing => "MANIFEST_MISSING",
            CriticalError::EntrypointNotFound => "ENTRYPOINT_NOT_FOUND",
            CriticalError::PathTraversal => "PATH_TRAVERSAL",
            CriticalError::InstallRecordInvalid => "INSTALL_RECORD_INVALID",
            CriticalError::NakLoaderInvalid => "NAK_LOADER_INVALID",
        }
    }
}

impl fmt::Display for CriticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl error::Error for CriticalError {}

impl Serialize for CriticalError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl TryFrom<String> for CriticalError {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "MANIFEST_MISSING" => Ok(CriticalError::ManifestMissing),
            "ENTRYPOINT_NOT_FOUND" => Ok(CriticalError::EntrypointNotFound),
            "PATH_TRAVERSAL" => Ok(CriticalError::PathTraversal),
            "INSTALL_RECORD_INVALID" => Ok(CriticalError::InstallRecordInvalid),
            "NAK_LOADER_INVALID" => Ok(CriticalError::NakLoaderInvalid),
            other => Err(format!("unknown critical error '{}'", other)),
        }
    }
}
