// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk loaders for host-owned JSON: the App Install Record, the NAK
//! Install Record, and the host environment file.
//!
//! The app record is load-bearing: any defect is the `INSTALL_RECORD_INVALID`
//! critical error. The NAK record and host file degrade to warnings instead,
//! because composition can proceed without them.

use crate::manifest::AppManifest;
use camino::Utf8Path;
use color_eyre::{eyre::WrapErr, Result};
use nah_metadata::{
    parse_core_version, AppInstallRecord, HostEnv, NakInstallRecord, NakPin, Warning, WarningSink,
    NAK_RECORD_SCHEMA,
};
use semver::Version;
use std::{error, fmt, fs, io};

/// Why an app install record failed to load. Callers map this to
/// `INSTALL_RECORD_INVALID`.
#[derive(Debug)]
pub enum RecordLoadError {
    Io { detail: String },
    Parse { detail: String },
    Invalid { detail: String },
}

impl fmt::Display for RecordLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, detail) = match self {
            RecordLoadError::Io { detail } => ("unreadable", detail),
            RecordLoadError::Parse { detail } => ("unparseable", detail),
            RecordLoadError::Invalid { detail } => ("invalid", detail),
        };
        write!(f, "install record {}: {}", kind, detail)
    }
}

impl error::Error for RecordLoadError {}

/// Loads and validates an App Install Record.
pub fn load_app_record(path: &Utf8Path) -> Result<AppInstallRecord, RecordLoadError> {
    let text = fs::read_to_string(path).map_err(|err| RecordLoadError::Io {
        detail: format!("{}: {}", path, err),
    })?;
    let record: AppInstallRecord =
        serde_json::from_str(&text).map_err(|err| RecordLoadError::Parse {
            detail: format!("{}: {}", path, err),
        })?;
    validate_app_record(&record)?;
    Ok(record)
}

/// Structural checks beyond what serde enforces.
pub fn validate_app_record(record: &AppInstallRecord) -> Result<(), RecordLoadError> {
    if record.install.instance_id.trim().is_empty() {
        return Err(RecordLoadError::Invalid {
            detail: "install.instance_id is empty".to_owned(),
        });
    }
    let install_root = &record.paths.install_root;
    if install_root.as_str().trim().is_empty() {
        return Err(RecordLoadError::Invalid {
            detail: "paths.install_root is empty".to_owned(),
        });
    }
    if !install_root.is_absolute() {
        return Err(RecordLoadError::Invalid {
            detail: format!("paths.install_root {} is not absolute", install_root),
        });
    }
    if !install_root.is_dir() {
        return Err(RecordLoadError::Invalid {
            detail: format!("paths.install_root {} does not exist", install_root),
        });
    }
    Ok(())
}

/// Loads the host environment file. A missing file yields defaults silently;
/// an unreadable or unparseable file yields defaults plus
/// `host_env_parse_error`.
pub fn load_host_env(path: &Utf8Path, sink: &mut WarningSink) -> HostEnv {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return HostEnv::default(),
        Err(err) => {
            sink.push(Warning::HostEnvParseError {
                path: path.to_string(),
                detail: err.to_string(),
            });
            return HostEnv::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(host) => host,
        Err(err) => {
            sink.push(Warning::HostEnvParseError {
                path: path.to_string(),
                detail: err.to_string(),
            });
            HostEnv::default()
        }
    }
}

/// Loads a NAK record for the install pipeline, where malformed input is a
/// hard error rather than an unresolved pin.
pub fn load_nak_record_strict(path: &Utf8Path) -> Result<NakInstallRecord> {
    let text =
        fs::read_to_string(path).wrap_err_with(|| format!("failed to read NAK record {}", path))?;
    let record: NakInstallRecord = serde_json::from_str(&text)
        .wrap_err_with(|| format!("failed to parse NAK record {}", path))?;
    Ok(record)
}

/// A pinned kit that resolved successfully.
#[derive(Clone, Debug)]
pub struct PinnedKit {
    pub record: NakInstallRecord,
    pub record_ref: String,
    pub version: Version,
    /// Per-app loader preference carried on the pin.
    pub loader_pin: Option<String>,
}

/// The seam between composition and kit storage: given the pin recorded at
/// install time and the decoded manifest, produce the kit record or report
/// why the pin is unresolved.
pub trait PinnedKitLoader {
    fn load(
        &self,
        pin: Option<&NakPin>,
        manifest: &AppManifest,
        sink: &mut WarningSink,
    ) -> Option<PinnedKit>;
}

/// Production loader: reads `<nak_registry_dir>/<record_ref>` and applies the
/// schema, identity, version-form, and range checks.
#[derive(Copy, Clone, Debug)]
pub struct RegistryKitLoader<'a> {
    nak_registry_dir: &'a Utf8Path,
}

impl<'a> RegistryKitLoader<'a> {
    pub fn new(nak_registry_dir: &'a Utf8Path) -> Self {
        Self { nak_registry_dir }
    }
}

impl<'a> PinnedKitLoader for RegistryKitLoader<'a> {
    fn load(
        &self,
        pin: Option<&NakPin>,
        manifest: &AppManifest,
        sink: &mut WarningSink,
    ) -> Option<PinnedKit> {
        let pin = match pin {
            Some(pin) => pin,
            None => {
                sink.push(Warning::NakPinInvalid {
                    reason: "record has no nak pin".to_owned(),
                });
                return None;
            }
        };
        if pin.id.is_empty() || pin.version.is_empty() || pin.record_ref.is_empty() {
            sink.push(Warning::NakPinInvalid {
                reason: "pin fields id, version, record_ref must be non-empty".to_owned(),
            });
            return None;
        }
        // record_ref is a file name inside the registry directory, never a path.
        if pin.record_ref.contains('/') || pin.record_ref.contains('\\') {
            sink.push(Warning::NakPinInvalid {
                reason: format!("record_ref '{}' is not a bare file name", pin.record_ref),
            });
            return None;
        }

        let path = self.nak_registry_dir.join(&pin.record_ref);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                sink.push(Warning::NakPinInvalid {
                    reason: format!("pinned record {} is unreadable: {}", path, err),
                });
                return None;
            }
        };
        let record: NakInstallRecord = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(err) => {
                sink.push(Warning::NakPinInvalid {
                    reason: format!("pinned record {} is unparseable: {}", path, err),
                });
                return None;
            }
        };

        if let Some(schema) = record.schema.as_deref() {
            if schema != NAK_RECORD_SCHEMA {
                sink.push(Warning::NakPinInvalid {
                    reason: format!("pinned record schema '{}' is not supported", schema),
                });
                return None;
            }
        }
        if record.nak.id.is_empty() || record.nak.version.is_empty() {
            sink.push(Warning::NakPinInvalid {
                reason: "pinned record is missing nak.id or nak.version".to_owned(),
            });
            return None;
        }
        if record.nak.id != pin.id || record.nak.version != pin.version {
            sink.push(Warning::NakPinInvalid {
                reason: format!(
                    "pin {}@{} does not match record {}@{}",
                    pin.id, pin.version, record.nak.id, record.nak.version
                ),
            });
            return None;
        }

        let version = match parse_core_version(&record.nak.version) {
            Ok(version) => version,
            Err(err) => {
                sink.push(Warning::NakPinInvalid {
                    reason: format!("nak.version is not core MAJOR.MINOR.PATCH: {}", err),
                });
                return None;
            }
        };

        // An unparseable requirement is surfaced as invalid_manifest by the
        // composer; only a requirement that parses can rule the pin out.
        if let Some(req) = &manifest.nak_version_req {
            if let Some(range) = req.as_range() {
                if !range.satisfies(&version) {
                    sink.push(Warning::NakVersionUnsupported {
                        nak_id: pin.id.clone(),
                        pinned: pin.version.clone(),
                        requirement: req.as_str().to_owned(),
                    });
                    return None;
                }
            }
        }

        Some(PinnedKit {
            record,
            record_ref: pin.record_ref.clone(),
            version,
            loader_pin: pin.loader.clone(),
        })
    }
}

/// Detects divergence between the record's audit snapshot and the manifest.
/// The manifest stays authoritative; the warning lists the differing fields.
pub fn audit_mismatch(record: &AppInstallRecord, manifest: &AppManifest) -> Option<Warning> {
    let mut differing = Vec::new();
    let pairs = [
        ("id", record.app.id.as_deref(), manifest.id.as_deref()),
        (
            "version",
            record.app.version.as_deref(),
            manifest.version.as_deref(),
        ),
        (
            "nak_id",
            record.app.nak_id.as_deref(),
            manifest.nak_id.as_deref(),
        ),
        (
            "nak_version_req",
            record.app.nak_version_req.as_ref().map(|r| r.as_str()),
            manifest.nak_version_req.as_ref().map(|r| r.as_str()),
        ),
    ];
    for (name, recorded, actual) in pairs {
        if let Some(recorded) = recorded {
            if Some(recorded) != actual {
                differing.push(name);
            }
        }
    }
    if differing.is_empty() {
        None
    } else {
        Some(Warning::InvalidConfiguration {
            reason: "app_record_mismatch".to_owned(),
            detail: differing.join(", "),
        })
    }
}
