// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The install pipeline: extract, validate, select a kit, swap the staged
//! tree in atomically, then write the record.
//!
//! Each step leaves a compensating action behind: the staging directory is a
//! tempdir that removes itself, and the installed tree is tracked by a guard
//! that removes it unless the pipeline finishes. A crash or error therefore
//! leaves no partial state, only an unused staging directory at worst.

use crate::{
    archive,
    manifest::{self, AppManifest, NoSectionReader, SectionReader},
    pathsafe, records,
    registry::{self, RecordEntry, UnlockedLock},
    state::NahState,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use color_eyre::{
    eyre::{bail, eyre, WrapErr},
    Result,
};
use nah_metadata::{
    parse_core_version, AppIdentitySnapshot, AppInstallRecord, AppRecordPaths, InstallSection,
    LoaderSpec, NakIdentity, NakInstallRecord, NakPaths, NakPin, Warning, WarningSink,
    APP_RECORD_SCHEMA, NAK_RECORD_SCHEMA,
};
use semver::Version;
use serde::Deserialize;
use std::{collections::BTreeMap, fs};
use tracing::{debug, info};

const INSTALL_LOCK: &str = "install";
const STAGING_PREFIX: &str = ".staging-";

/// Descriptor at the root of a `.nak` package: the layout with paths still
/// relative to the pack root.
#[derive(Clone, Debug, Deserialize)]
pub struct KitPackDescriptor {
    #[serde(default)]
    pub schema: Option<String>,
    pub nak: NakIdentity,
    #[serde(default)]
    pub paths: KitPackPaths,
    #[serde(default)]
    pub environment: BTreeMap<String, nah_metadata::EnvValue>,
    #[serde(default)]
    pub loaders: BTreeMap<String, LoaderSpec>,
    #[serde(default)]
    pub loader: Option<LoaderSpec>,
    #[serde(default)]
    pub execution: Option<nah_metadata::NakExecution>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct KitPackPaths {
    #[serde(default)]
    pub resource_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub lib_dirs: Vec<Utf8PathBuf>,
}

/// Descriptor file name inside a `.nak` package.
pub const KIT_DESCRIPTOR_NAME: &str = "nak.json";

#[derive(Clone, Debug, Default)]
pub struct InstallAppOpts {
    /// Replace an existing install of the same id/version.
    pub force: bool,
    /// Complete the install with an unresolved pin instead of failing when no
    /// kit matches.
    pub allow_unresolved: bool,
}

#[derive(Clone, Debug)]
pub struct InstallReport {
    pub id: String,
    pub version: String,
    pub install_root: Utf8PathBuf,
    pub record_path: Utf8PathBuf,
    pub pin: Option<NakPin>,
    pub warnings: Vec<Warning>,
}

/// Installs a `.nap` package into the root.
pub fn install_app(
    state: &NahState,
    package: &Utf8Path,
    opts: &InstallAppOpts,
) -> Result<InstallReport> {
    install_app_with_reader(state, package, opts, &NoSectionReader)
}

pub fn install_app_with_reader(
    state: &NahState,
    package: &Utf8Path,
    opts: &InstallAppOpts,
    reader: &dyn SectionReader,
) -> Result<InstallReport> {
    let _lock = UnlockedLock::new(state.locks_dir(), INSTALL_LOCK)?.lock_exclusive()?;
    let mut sink = WarningSink::new();

    let bytes =
        fs::read(package).wrap_err_with(|| format!("failed to read package {}", package))?;

    let staging = staging_dir(state.root())?;
    let staging_path = utf8_temp_path(&staging)?;
    archive::unpack(&bytes, &staging_path)
        .wrap_err_with(|| format!("failed to extract {}", package))?;

    let blob = manifest::locate(&staging_path, reader)?
        .ok_or_else(|| eyre!("package {} carries no manifest", package))?;
    let manifest = manifest::decode(&blob, &mut sink)
        .map_err(|err| eyre!("package manifest is unusable: {}", err))?;

    let id = required_field(manifest.id.as_deref(), "app id")?;
    let version = required_field(manifest.version.as_deref(), "app version")?;

    let pin = if manifest.requires_kit() {
        match select_kit(state, &manifest, &mut sink)? {
            Some(pin) => Some(pin),
            None if opts.allow_unresolved => {
                info!("installing {} {} with an unresolved kit pin", id, version);
                None
            }
            None => {
                bail!(
                    "no installed kit satisfies {} {}; pass --allow-unresolved to install anyway",
                    manifest.nak_id.as_deref().unwrap_or_default(),
                    manifest
                        .nak_version_req
                        .as_ref()
                        .map(|req| req.as_str())
                        .unwrap_or("(any)")
                )
            }
        }
    } else {
        None
    };

    let dest = state.app_tree(&id, &version);
    claim_destination(&dest, opts.force)?;

    // Past this point the tree exists at its final path; the guard removes it
    // if the record write fails.
    let staging_path = staging.into_path();
    fs::rename(&staging_path, &dest)
        .wrap_err_with(|| format!("failed to move staged tree to {}", dest))?;
    registry::fsync_dir(dest.parent().expect("app tree has a parent"))?;
    let mut guard = InstalledTreeGuard::new(dest.clone());

    let record = AppInstallRecord {
        schema: Some(APP_RECORD_SCHEMA.to_owned()),
        install: InstallSection {
            instance_id: new_instance_id(&id, &version),
            installed_at: Some(Utc::now()),
        },
        app: AppIdentitySnapshot {
            id: Some(id.clone()),
            version: Some(version.clone()),
            nak_id: manifest.nak_id.clone().filter(|nak_id| !nak_id.is_empty()),
            nak_version_req: manifest.nak_version_req.clone(),
        },
        nak: pin.clone(),
        paths: AppRecordPaths {
            install_root: dest.clone(),
        },
        provenance: None,
        trust: None,
        verification: None,
        overrides: None,
    };
    let record_path = state
        .app_registry_dir()
        .join(registry::record_file_name(&id, &version));
    registry::write_json_atomic(&record_path, &record)
        .wrap_err_with(|| format!("failed to write install record {}", record_path))?;

    guard.finish();
    info!("installed {} {} at {}", id, version, dest);
    Ok(InstallReport {
        id,
        version,
        install_root: dest,
        record_path,
        pin,
        warnings: sink.into_vec(),
    })
}

/// Install-time kit selection: the highest installed version of the required
/// kit that satisfies the manifest's range.
fn select_kit(
    state: &NahState,
    manifest: &AppManifest,
    sink: &mut WarningSink,
) -> Result<Option<NakPin>> {
    let nak_id = manifest.nak_id.as_deref().unwrap_or_default();

    let range = match &manifest.nak_version_req {
        Some(req) => match req.as_range() {
            Some(range) => Some(range.clone()),
            None => {
                sink.push(Warning::InvalidManifest {
                    detail: format!("nak version requirement '{}' does not parse", req.as_str()),
                });
                return Ok(None);
            }
        },
        None => None,
    };

    let mut candidates: Vec<(Version, RecordEntry)> = Vec::new();
    let mut any_with_id = false;
    for entry in registry::scan_records(state.nak_registry_dir())? {
        if entry.id != nak_id {
            continue;
        }
        any_with_id = true;
        if let Ok(version) = parse_core_version(&entry.version) {
            candidates.push((version, entry));
        }
    }

    if !any_with_id {
        sink.push(Warning::NakNotFound {
            nak_id: nak_id.to_owned(),
            requirement: manifest
                .nak_version_req
                .as_ref()
                .map(|req| req.as_str().to_owned())
                .unwrap_or_default(),
        });
        return Ok(None);
    }

    let highest_any = candidates
        .iter()
        .map(|(version, _)| version.clone())
        .max();
    let chosen = candidates
        .into_iter()
        .filter(|(version, _)| range.as_ref().map_or(true, |range| range.satisfies(version)))
        .max_by(|(a, _), (b, _)| a.cmp_precedence(b));

    match chosen {
        Some((version, entry)) => {
            debug!("selected kit {} {}", nak_id, version);
            Ok(Some(NakPin {
                id: nak_id.to_owned(),
                version: entry.version.clone(),
                record_ref: entry.file_name(),
                loader: None,
            }))
        }
        None => {
            sink.push(Warning::NakVersionUnsupported {
                nak_id: nak_id.to_owned(),
                pinned: highest_any.map(|v| v.to_string()).unwrap_or_default(),
                requirement: manifest
                    .nak_version_req
                    .as_ref()
                    .map(|req| req.as_str().to_owned())
                    .unwrap_or_default(),
            });
            Ok(None)
        }
    }
}

#[derive(Clone, Debug)]
pub struct KitInstallReport {
    pub id: String,
    pub version: String,
    pub root: Utf8PathBuf,
    pub record_path: Utf8PathBuf,
}

/// Installs a `.nak` package: the descriptor's relative layout becomes a NAK
/// record with absolute, contained paths. Malformed input is a hard error.
pub fn install_kit(state: &NahState, package: &Utf8Path, force: bool) -> Result<KitInstallReport> {
    let _lock = UnlockedLock::new(state.locks_dir(), INSTALL_LOCK)?.lock_exclusive()?;

    let bytes =
        fs::read(package).wrap_err_with(|| format!("failed to read package {}", package))?;

    let staging = staging_dir(state.root())?;
    let staging_path = utf8_temp_path(&staging)?;
    archive::unpack(&bytes, &staging_path)
        .wrap_err_with(|| format!("failed to extract {}", package))?;

    let descriptor_path = staging_path.join(KIT_DESCRIPTOR_NAME);
    let descriptor_text = fs::read_to_string(&descriptor_path)
        .wrap_err_with(|| format!("package {} carries no {}", package, KIT_DESCRIPTOR_NAME))?;
    let descriptor: KitPackDescriptor = serde_json::from_str(&descriptor_text)
        .wrap_err_with(|| format!("failed to parse {}", descriptor_path))?;

    if let Some(schema) = descriptor.schema.as_deref() {
        if schema != NAK_RECORD_SCHEMA {
            bail!("kit descriptor schema '{}' is not supported", schema);
        }
    }
    let id = required_field(Some(descriptor.nak.id.as_str()), "kit id")?;
    let version = parse_core_version(&descriptor.nak.version)
        .wrap_err("kit version must be core MAJOR.MINOR.PATCH")?
        .to_string();

    // Validate the relative layout against the staged tree before any rename,
    // so a hostile descriptor never lands.
    let rel_resource_root = descriptor
        .paths
        .resource_root
        .as_ref()
        .map(|rel| relative_in_tree(&staging_path, rel))
        .transpose()?;
    let rel_lib_dirs = descriptor
        .paths
        .lib_dirs
        .iter()
        .map(|rel| relative_in_tree(&staging_path, rel))
        .collect::<Result<Vec<_>>>()?;
    let mut rel_loaders: BTreeMap<String, (Utf8PathBuf, Vec<String>)> = BTreeMap::new();
    for (name, spec) in &descriptor.loaders {
        let rel = relative_in_tree(&staging_path, &spec.exec_path)?;
        rel_loaders.insert(name.clone(), (rel, spec.args_template.clone()));
    }
    if let Some(spec) = &descriptor.loader {
        let rel = relative_in_tree(&staging_path, &spec.exec_path)?;
        rel_loaders
            .entry(nah_metadata::DEFAULT_LOADER.to_owned())
            .or_insert((rel, spec.args_template.clone()));
    }

    let dest = state.nak_tree(&id, &version);
    claim_destination(&dest, force)?;
    fs::create_dir_all(dest.parent().expect("kit tree has a parent"))
        .wrap_err_with(|| format!("failed to create {}", dest))?;

    let staging_path = staging.into_path();
    fs::rename(&staging_path, &dest)
        .wrap_err_with(|| format!("failed to move staged tree to {}", dest))?;
    registry::fsync_dir(dest.parent().expect("kit tree has a parent"))?;
    let mut guard = InstalledTreeGuard::new(dest.clone());

    let record = NakInstallRecord {
        schema: Some(NAK_RECORD_SCHEMA.to_owned()),
        nak: NakIdentity {
            id: id.clone(),
            version: version.clone(),
        },
        paths: NakPaths {
            root: dest.clone(),
            resource_root: rel_resource_root.map(|rel| dest.join(rel)),
            lib_dirs: rel_lib_dirs.into_iter().map(|rel| dest.join(rel)).collect(),
        },
        environment: descriptor.environment.clone(),
        loaders: rel_loaders
            .into_iter()
            .map(|(name, (rel, args_template))| {
                (
                    name,
                    LoaderSpec {
                        exec_path: dest.join(rel),
                        args_template,
                    },
                )
            })
            .collect(),
        loader: None,
        execution: descriptor.execution.clone(),
    };
    let record_path = state
        .nak_registry_dir()
        .join(registry::record_file_name(&id, &version));
    registry::write_json_atomic(&record_path, &record)
        .wrap_err_with(|| format!("failed to write kit record {}", record_path))?;

    guard.finish();
    info!("installed kit {} {} at {}", id, version, dest);
    Ok(KitInstallReport {
        id,
        version,
        root: dest,
        record_path,
    })
}

/// Removes an installed app: the tree first, then the record.
pub fn uninstall_app(state: &NahState, id: &str, version: Option<&str>) -> Result<()> {
    let _lock = UnlockedLock::new(state.locks_dir(), INSTALL_LOCK)?.lock_exclusive()?;

    let entry = registry::select_single(state.app_registry_dir(), id, version)?;
    let record = records::load_app_record(&entry.path)
        .map_err(|err| eyre!("cannot uninstall {}: {}", id, err))?;

    // A tampered record must not delete trees outside the apps directory.
    let tree = pathsafe::contain_absolute(state.apps_dir(), &record.paths.install_root)
        .wrap_err_with(|| {
            format!(
                "record {} points outside the apps directory",
                entry.path
            )
        })?;
    if tree.is_dir() {
        fs::remove_dir_all(&tree).wrap_err_with(|| format!("failed to remove {}", tree))?;
    }
    fs::remove_file(&entry.path)
        .wrap_err_with(|| format!("failed to remove record {}", entry.path))?;
    registry::fsync_dir(state.app_registry_dir())?;
    info!("uninstalled {} {}", entry.id, entry.version);
    Ok(())
}

/// Removes an installed kit version, refusing while any app pins it.
pub fn uninstall_kit(state: &NahState, id: &str, version: Option<&str>) -> Result<()> {
    let _lock = UnlockedLock::new(state.locks_dir(), INSTALL_LOCK)?.lock_exclusive()?;

    let entry = registry::select_single(state.nak_registry_dir(), id, version)?;

    let mut pinned_by = Vec::new();
    for app_entry in registry::scan_records(state.app_registry_dir())? {
        if let Ok(record) = records::load_app_record(&app_entry.path) {
            if let Some(pin) = &record.nak {
                if pin.id == entry.id && pin.version == entry.version {
                    pinned_by.push(format!("{}@{}", app_entry.id, app_entry.version));
                }
            }
        }
    }
    if !pinned_by.is_empty() {
        bail!(
            "kit {}@{} is pinned by {}; uninstall those apps first",
            entry.id,
            entry.version,
            pinned_by.join(", ")
        );
    }

    let tree = state.nak_tree(&entry.id, &entry.version);
    if tree.is_dir() {
        fs::remove_dir_all(&tree).wrap_err_with(|| format!("failed to remove {}", tree))?;
    }
    // Prune the per-kit directory once its last version is gone.
    if let Some(parent) = tree.parent() {
        let _ = fs::remove_dir(parent);
    }
    fs::remove_file(&entry.path)
        .wrap_err_with(|| format!("failed to remove record {}", entry.path))?;
    registry::fsync_dir(state.nak_registry_dir())?;
    info!("uninstalled kit {} {}", entry.id, entry.version);
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub issues: Vec<String>,
    pub warnings: Vec<Warning>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Re-checks an installed app without mutating anything: the record parses,
/// the tree and a valid manifest exist, and the pinned kit record is present.
pub fn verify_app(state: &NahState, id: &str, version: Option<&str>) -> Result<VerifyReport> {
    let entry = registry::select_single(state.app_registry_dir(), id, version)?;
    let mut report = VerifyReport::default();

    let record = match records::load_app_record(&entry.path) {
        Ok(record) => record,
        Err(err) => {
            report.issues.push(err.to_string());
            return Ok(report);
        }
    };

    let install_root = &record.paths.install_root;
    if !install_root.is_dir() {
        report
            .issues
            .push(format!("install tree {} is missing", install_root));
        return Ok(report);
    }

    let mut sink = WarningSink::new();
    match manifest::locate(install_root, &NoSectionReader)? {
        Some(blob) => match manifest::decode(&blob, &mut sink) {
            Ok(_) => {}
            Err(err) => report.issues.push(format!("manifest is unusable: {}", err)),
        },
        None => report
            .issues
            .push(format!("no manifest found under {}", install_root)),
    }
    report.warnings = sink.into_vec();

    if let Some(pin) = &record.nak {
        let pin_path = state.nak_registry_dir().join(&pin.record_ref);
        if !pin_path.is_file() {
            report.issues.push(format!(
                "pinned kit record {} is missing",
                pin.record_ref
            ));
        } else if let Err(err) = records::load_nak_record_strict(&pin_path) {
            report
                .issues
                .push(format!("pinned kit record {} is invalid: {}", pin.record_ref, err));
        }
    }

    Ok(report)
}

// ---
// Helper functions
// ---

fn staging_dir(root: &Utf8Path) -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(root)
        .wrap_err_with(|| format!("failed to create staging directory in {}", root))
}

fn utf8_temp_path(staging: &tempfile::TempDir) -> Result<Utf8PathBuf> {
    Utf8Path::from_path(staging.path())
        .map(Utf8Path::to_path_buf)
        .ok_or_else(|| eyre!("staging directory is not UTF-8"))
}

fn required_field(value: Option<&str>, what: &str) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.to_owned()),
        _ => bail!("package manifest has no {}", what),
    }
}

fn claim_destination(dest: &Utf8Path, force: bool) -> Result<()> {
    if dest.exists() {
        if !force {
            bail!("{} already exists; pass --force to replace it", dest);
        }
        fs::remove_dir_all(dest).wrap_err_with(|| format!("failed to remove {}", dest))?;
    }
    Ok(())
}

/// Validates a descriptor path as relative-and-contained within the staged
/// tree, returning the normalized relative form.
fn relative_in_tree(tree: &Utf8Path, rel: &Utf8Path) -> Result<Utf8PathBuf> {
    let resolved = pathsafe::resolve_under(tree, rel.as_str())
        .map_err(|err| eyre!("kit descriptor path is unsafe: {}", err))?;
    Ok(resolved
        .strip_prefix(tree)
        .expect("resolved path is under the tree")
        .to_path_buf())
}

fn new_instance_id(id: &str, version: &str) -> String {
    format!(
        "{}@{}:{}.{}",
        id,
        version,
        Utc::now().timestamp_micros(),
        std::process::id()
    )
}

/// Removes the installed tree on drop unless the pipeline finished.
#[derive(Debug)]
#[must_use]
struct InstalledTreeGuard {
    tree: Option<Utf8PathBuf>,
}

impl InstalledTreeGuard {
    fn new(tree: Utf8PathBuf) -> Self {
        Self { tree: Some(tree) }
    }

    fn finish(&mut self) {
        self.tree = None;
    }
}

impl Drop for InstalledTreeGuard {
    fn drop(&mut self) {
        if let Some(tree) = self.tree.take() {
            let _ = fs::remove_dir_all(tree);
        }
    }
}
