// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Composition: the pure function from on-disk inputs to a Launch Contract.
//!
//! Everything here is deterministic for fixed inputs. The only filesystem
//! access is existence/symlink probing of paths the inputs declare; there is
//! no network, no dynamic loading, and no clock read beyond the `now`
//! parameter.

use crate::{
    expand::expand,
    manifest, pathsafe,
    records::{audit_mismatch, PinnedKit, PinnedKitLoader},
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use nah_metadata::{
    AppInstallRecord, AppView, CapabilityUsage, CriticalError, Enforcement, EnvValue, Envelope,
    ExecutionView, ExportEntry, HostEnv, LaunchContract, NakView, Trace, TraceEntry, TrustView,
    Warning, WarningSink,
};
use std::collections::BTreeMap;

/// The only process-environment override target.
pub const ENV_OVERRIDE_TARGET: &str = "NAH_OVERRIDE_ENVIRONMENT";
const OVERRIDE_PREFIX: &str = "NAH_OVERRIDE_";
const OVERRIDES_FILE_TARGET: &str = "OVERRIDES_FILE";

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        pub const LIBRARY_PATH_ENV_KEY: &str = "DYLD_LIBRARY_PATH";
    } else if #[cfg(windows)] {
        pub const LIBRARY_PATH_ENV_KEY: &str = "PATH";
    } else {
        pub const LIBRARY_PATH_ENV_KEY: &str = "LD_LIBRARY_PATH";
    }
}

#[derive(Clone, Debug)]
pub struct ComposeInputs<'a> {
    /// Raw TLV blob; `None` when no manifest could be located.
    pub manifest_bytes: Option<&'a [u8]>,
    pub record: &'a AppInstallRecord,
    pub host_env: &'a HostEnv,
    pub process_env: &'a BTreeMap<String, String>,
    /// Raw text of a caller-provided overrides document.
    pub overrides_file: Option<&'a str>,
    pub now: DateTime<FixedOffset>,
    pub with_trace: bool,
}

/// Composes a launch contract. Never panics on untrusted input; critical
/// failures surface in the returned envelope.
pub fn compose(inputs: &ComposeInputs<'_>, kit_loader: &dyn PinnedKitLoader) -> Envelope {
    let mut sink = WarningSink::new();
    match compose_inner(inputs, kit_loader, &mut sink) {
        Ok((contract, trace)) => Envelope::success(contract, sink.into_vec(), trace),
        Err(critical) => Envelope::critical(critical, sink.into_vec()),
    }
}

fn compose_inner(
    inputs: &ComposeInputs<'_>,
    kit_loader: &dyn PinnedKitLoader,
    sink: &mut WarningSink,
) -> Result<(LaunchContract, Option<Trace>), CriticalError> {
    // Step 1: the manifest. A CRC failure means the blob cannot be trusted,
    // so it is indistinguishable from a missing manifest.
    let bytes = inputs
        .manifest_bytes
        .ok_or(CriticalError::ManifestMissing)?;
    let manifest = manifest::decode(bytes, sink).map_err(|_| CriticalError::ManifestMissing)?;

    let record = inputs.record;

    // Step 3: audit the record's identity snapshot against the manifest.
    if let Some(warning) = audit_mismatch(record, &manifest) {
        sink.push(warning);
    }

    // Step 4: one-shot kit resolution. Standalone apps skip it silently.
    let kit = if manifest.requires_kit() {
        kit_loader.load(record.nak.as_ref(), &manifest, sink)
    } else {
        None
    };

    // Step 5: app fields and the entrypoint.
    let app_root = record.paths.install_root.clone();
    let app_id = manifest.id.clone().unwrap_or_default();
    let app_version = manifest.version.clone().unwrap_or_default();

    let entry_rel = match manifest.entrypoint.as_deref() {
        Some(entry) if !entry.is_empty() => entry,
        _ => {
            sink.push(Warning::InvalidManifest {
                detail: "entrypoint is missing".to_owned(),
            });
            return Err(CriticalError::EntrypointNotFound);
        }
    };
    let entrypoint = pathsafe::resolve_under(&app_root, entry_rel)
        .map_err(|_| CriticalError::PathTraversal)?;
    if !entrypoint.is_file() {
        return Err(CriticalError::EntrypointNotFound);
    }

    // Step 6: the requirement string itself must parse, resolved or not.
    if let Some(req) = &manifest.nak_version_req {
        if req.as_range().is_none() {
            sink.push(Warning::InvalidManifest {
                detail: format!("nak version requirement '{}' does not parse", req.as_str()),
            });
        }
    }

    // Step 7: kit-derived fields, with containment on every persisted path.
    let kit_paths = match &kit {
        Some(kit) => Some(validate_kit_paths(kit)?),
        None => None,
    };

    // Loader selection feeds both the NAK view and execution assembly.
    let chosen_loader = match &kit {
        Some(kit) => select_loader(kit, sink)?,
        None => None,
    };

    // Steps 8-10: the environment algebra.
    let mut merge = EnvMerge::new(inputs.with_trace);
    merge.apply_layer(&inputs.host_env.environment, true, 1, "host_env");
    if let Some(kit) = &kit {
        merge.apply_layer(&kit.record.environment, true, 2, "nak_record");
    }
    for (key, value) in &manifest.env_defaults {
        merge.apply(
            key,
            &EnvValue::Set(value.clone()),
            true,
            3,
            "manifest",
            format!("environment.{}", key),
        );
    }
    if let Some(overrides) = &record.overrides {
        merge.apply_layer(&overrides.environment, false, 4, "install_record");
    }

    let standard = standard_environment(
        &app_id,
        &app_version,
        &app_root,
        &entrypoint,
        kit.as_ref(),
        kit_paths.as_ref(),
    );
    for (key, value) in &standard {
        merge.apply(
            key,
            &EnvValue::Set(value.clone()),
            false,
            5,
            "standard",
            format!("environment.{}", key),
        );
    }

    apply_process_overrides(inputs, &mut merge, sink);
    apply_file_overrides(inputs, &mut merge, sink);

    // Step 11: single-pass expansion against a snapshot of the merged map.
    let snapshot = merge.values.clone();
    for (key, raw) in snapshot.iter() {
        let expanded = expand(raw, &snapshot, &format!("environment.{}", key), sink);
        merge.finalize_value(key, expanded);
    }
    let environment = merge.values;
    let trace = merge.trace.map(|environment| Trace { environment });

    // Step 12: capability derivation. Selectors stay opaque.
    let mut required = Vec::new();
    derive_capabilities(
        &manifest.permissions_filesystem,
        "filesystem",
        &["read", "write", "execute"],
        &mut required,
        sink,
    );
    derive_capabilities(
        &manifest.permissions_network,
        "network",
        &["connect", "listen", "bind"],
        &mut required,
        sink,
    );
    let capability_usage = CapabilityUsage {
        present: !required.is_empty(),
        required,
        optional: Vec::new(),
        critical: Vec::new(),
    };

    // Step 13: execution assembly.
    let mut arguments = Vec::new();
    if let Some((_, loader)) = &chosen_loader {
        for (i, template) in loader.args_template.iter().enumerate() {
            arguments.push(expand(
                template,
                &environment,
                &format!("nak.loader.args_template[{}]", i),
                sink,
            ));
        }
    }
    if let Some(overrides) = &record.overrides {
        for (i, arg) in overrides.arguments.prepend.iter().enumerate() {
            arguments.push(expand(
                arg,
                &environment,
                &format!("overrides.arguments.prepend[{}]", i),
                sink,
            ));
        }
    }
    for (i, arg) in manifest.entrypoint_args.iter().enumerate() {
        arguments.push(expand(
            arg,
            &environment,
            &format!("manifest.entrypoint_args[{}]", i),
            sink,
        ));
    }
    if let Some(overrides) = &record.overrides {
        for (i, arg) in overrides.arguments.append.iter().enumerate() {
            arguments.push(expand(
                arg,
                &environment,
                &format!("overrides.arguments.append[{}]", i),
                sink,
            ));
        }
    }

    let binary = match &chosen_loader {
        Some((_, loader)) => loader.exec_path.clone(),
        None => entrypoint.clone(),
    };

    let cwd = derive_cwd(kit.as_ref(), kit_paths.as_ref(), &app_root, &environment, sink)?;

    // Step 14: library path assembly.
    let mut library_paths = Vec::new();
    append_expanded_paths(
        &inputs.host_env.paths.library_prepend,
        "host_env",
        "host_env.paths.library_prepend",
        &environment,
        &mut library_paths,
        sink,
    );
    if let Some(overrides) = &record.overrides {
        append_expanded_paths(
            &overrides.paths.library_prepend,
            "install_record",
            "overrides.paths.library_prepend",
            &environment,
            &mut library_paths,
            sink,
        );
    }
    if let Some(paths) = &kit_paths {
        library_paths.extend(paths.lib_dirs.iter().cloned());
    }
    for dir in &manifest.lib_dirs {
        let resolved =
            pathsafe::resolve_under(&app_root, dir).map_err(|_| CriticalError::PathTraversal)?;
        library_paths.push(resolved);
    }
    append_expanded_paths(
        &inputs.host_env.paths.library_append,
        "host_env",
        "host_env.paths.library_append",
        &environment,
        &mut library_paths,
        sink,
    );

    // Step 15: asset exports, last id wins.
    let mut exports = BTreeMap::new();
    for export in &manifest.asset_exports {
        let resolved = pathsafe::resolve_under(&app_root, &export.relpath)
            .map_err(|_| CriticalError::PathTraversal)?;
        exports.insert(
            export.id.clone(),
            ExportEntry {
                path: resolved,
                kind: export.kind.clone(),
            },
        );
    }

    // Step 16: trust surfacing.
    let trust = surface_trust(record, &inputs.now, sink);

    let nak = match (&kit, &kit_paths) {
        (Some(kit), Some(paths)) => Some(NakView {
            id: kit.record.nak.id.clone(),
            version: kit.record.nak.version.clone(),
            root: paths.root.clone(),
            resource_root: paths.resource_root.clone(),
            record_ref: kit.record_ref.clone(),
            loader: chosen_loader.as_ref().map(|(name, _)| name.clone()),
        }),
        _ => None,
    };

    let contract = LaunchContract {
        app: AppView {
            id: app_id,
            version: app_version,
            root: app_root,
            entrypoint,
        },
        nak,
        execution: ExecutionView {
            binary,
            arguments,
            cwd,
            library_path_env_key: LIBRARY_PATH_ENV_KEY.to_owned(),
            library_paths,
        },
        environment,
        enforcement: Enforcement::default(),
        trust,
        exports,
        capability_usage,
    };
    Ok((contract, trace))
}

/// Kit paths after containment validation, lexically normalized.
struct KitPaths {
    root: Utf8PathBuf,
    resource_root: Utf8PathBuf,
    lib_dirs: Vec<Utf8PathBuf>,
}

fn validate_kit_paths(kit: &PinnedKit) -> Result<KitPaths, CriticalError> {
    let root = &kit.record.paths.root;
    if !root.is_absolute() {
        return Err(CriticalError::PathTraversal);
    }
    let resource_root = pathsafe::contain_absolute(root, kit.record.resource_root())
        .map_err(|_| CriticalError::PathTraversal)?;
    let mut lib_dirs = Vec::new();
    for dir in &kit.record.paths.lib_dirs {
        let contained =
            pathsafe::contain_absolute(root, dir).map_err(|_| CriticalError::PathTraversal)?;
        lib_dirs.push(contained);
    }
    for (_, loader) in kit.record.effective_loaders() {
        pathsafe::contain_absolute(root, &loader.exec_path)
            .map_err(|_| CriticalError::PathTraversal)?;
    }
    Ok(KitPaths {
        root: pathsafe::normalize(root),
        resource_root,
        lib_dirs,
    })
}

type ChosenLoader = (String, nah_metadata::LoaderSpec);

/// Picks the active loader: the per-app pin, then `"default"`, then a sole
/// loader. A pinned name absent from the map warns and falls back to the
/// entrypoint; a chosen loader whose binary is missing is fatal.
fn select_loader(
    kit: &PinnedKit,
    sink: &mut WarningSink,
) -> Result<Option<ChosenLoader>, CriticalError> {
    let loaders = kit.record.effective_loaders();
    let chosen: Option<(String, &nah_metadata::LoaderSpec)> = if let Some(name) = &kit.loader_pin {
        match loaders.get(name.as_str()) {
            Some(spec) => Some((name.clone(), *spec)),
            None => {
                sink.push(Warning::NakLoaderMissing {
                    loader: name.clone(),
                });
                None
            }
        }
    } else if let Some(spec) = loaders.get(nah_metadata::DEFAULT_LOADER) {
        Some((nah_metadata::DEFAULT_LOADER.to_owned(), *spec))
    } else if loaders.len() == 1 {
        let (name, spec) = loaders.iter().next().expect("one loader");
        Some((name.clone(), *spec))
    } else if loaders.len() > 1 {
        sink.push(Warning::NakLoaderRequired {
            available: loaders.keys().cloned().collect(),
        });
        None
    } else {
        None
    };

    match chosen {
        Some((name, spec)) => {
            if !spec.exec_path.is_file() {
                return Err(CriticalError::NakLoaderInvalid);
            }
            Ok(Some((name, spec.clone())))
        }
        None => Ok(None),
    }
}

fn standard_environment(
    app_id: &str,
    app_version: &str,
    app_root: &Utf8Path,
    entrypoint: &Utf8Path,
    kit: Option<&PinnedKit>,
    kit_paths: Option<&KitPaths>,
) -> BTreeMap<String, String> {
    let mut standard = BTreeMap::new();
    standard.insert("NAH_APP_ID".to_owned(), app_id.to_owned());
    standard.insert("NAH_APP_VERSION".to_owned(), app_version.to_owned());
    standard.insert("NAH_APP_ROOT".to_owned(), app_root.to_string());
    standard.insert("NAH_APP_ENTRY".to_owned(), entrypoint.to_string());
    if let (Some(kit), Some(paths)) = (kit, kit_paths) {
        standard.insert("NAH_NAK_ID".to_owned(), kit.record.nak.id.clone());
        standard.insert("NAH_NAK_ROOT".to_owned(), paths.root.to_string());
        standard.insert("NAH_NAK_VERSION".to_owned(), kit.record.nak.version.clone());
    }
    standard
}

fn apply_process_overrides(
    inputs: &ComposeInputs<'_>,
    merge: &mut EnvMerge,
    sink: &mut WarningSink,
) {
    // BTreeMap iteration gives the lexicographic processing order.
    for (key, value) in inputs
        .process_env
        .iter()
        .filter(|(key, _)| key.starts_with(OVERRIDE_PREFIX))
    {
        if key != ENV_OVERRIDE_TARGET {
            sink.push(Warning::OverrideDenied {
                target: key.clone(),
                source_kind: "process_env".to_owned(),
                source_ref: key.clone(),
            });
            continue;
        }
        if !inputs.host_env.overrides.allow_env_overrides {
            sink.push(Warning::OverrideDenied {
                target: key.clone(),
                source_kind: "process_env".to_owned(),
                source_ref: key.clone(),
            });
            continue;
        }
        match parse_override_object(value) {
            Ok(pairs) => {
                for (env_key, env_value) in pairs {
                    merge.apply(
                        &env_key,
                        &EnvValue::Set(env_value),
                        false,
                        6,
                        "process_env",
                        format!("{}.{}", ENV_OVERRIDE_TARGET, env_key),
                    );
                }
            }
            Err(reason) => {
                sink.push(Warning::OverrideInvalid {
                    target: key.clone(),
                    source_kind: "process_env".to_owned(),
                    reason,
                });
            }
        }
    }
}

fn apply_file_overrides(inputs: &ComposeInputs<'_>, merge: &mut EnvMerge, sink: &mut WarningSink) {
    let text = match inputs.overrides_file {
        Some(text) => text,
        None => return,
    };
    if !inputs.host_env.overrides.allow_env_overrides {
        // Policy denial wins over any shape problem: only override_denied.
        sink.push(Warning::OverrideDenied {
            target: OVERRIDES_FILE_TARGET.to_owned(),
            source_kind: "overrides_file".to_owned(),
            source_ref: OVERRIDES_FILE_TARGET.to_owned(),
        });
        return;
    }
    let document: serde_json::Value = match serde_json::from_str(text) {
        Ok(document) => document,
        Err(_) => {
            sink.push(Warning::OverrideInvalid {
                target: OVERRIDES_FILE_TARGET.to_owned(),
                source_kind: "overrides_file".to_owned(),
                reason: "parse_failure".to_owned(),
            });
            return;
        }
    };
    let environment = match document.as_object().map(|object| object.get("environment")) {
        Some(Some(environment)) => environment,
        Some(None) => return,
        None => {
            sink.push(Warning::OverrideInvalid {
                target: OVERRIDES_FILE_TARGET.to_owned(),
                source_kind: "overrides_file".to_owned(),
                reason: "invalid_shape".to_owned(),
            });
            return;
        }
    };
    match string_map(environment) {
        Some(pairs) => {
            for (env_key, env_value) in pairs {
                merge.apply(
                    &env_key,
                    &EnvValue::Set(env_value),
                    false,
                    7,
                    "overrides_file",
                    format!("environment.{}", env_key),
                );
            }
        }
        None => {
            sink.push(Warning::OverrideInvalid {
                target: OVERRIDES_FILE_TARGET.to_owned(),
                source_kind: "overrides_file".to_owned(),
                reason: "invalid_shape".to_owned(),
            });
        }
    }
}

/// Parses an override value as a `{string: string}` JSON object.
fn parse_override_object(text: &str) -> Result<BTreeMap<String, String>, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| "parse_failure".to_owned())?;
    string_map(&value).ok_or_else(|| "invalid_shape".to_owned())
}

fn string_map(value: &serde_json::Value) -> Option<BTreeMap<String, String>> {
    let object = value.as_object()?;
    let mut pairs = BTreeMap::new();
    for (key, entry) in object {
        pairs.insert(key.clone(), entry.as_str()?.to_owned());
    }
    Some(pairs)
}

fn derive_capabilities(
    entries: &[String],
    domain: &str,
    allowed_ops: &[&str],
    required: &mut Vec<String>,
    sink: &mut WarningSink,
) {
    for entry in entries {
        let (op, selector) = match entry.split_once(':') {
            Some(parts) => parts,
            None => {
                sink.push(Warning::CapabilityMalformed {
                    domain: domain.to_owned(),
                    entry: entry.clone(),
                });
                continue;
            }
        };
        if !allowed_ops.contains(&op) {
            sink.push(Warning::CapabilityUnknown {
                domain: domain.to_owned(),
                op: op.to_owned(),
            });
            continue;
        }
        required.push(format!("{}.{}:{}", domain, op, selector));
    }
}

fn derive_cwd(
    kit: Option<&PinnedKit>,
    kit_paths: Option<&KitPaths>,
    app_root: &Utf8Path,
    environment: &BTreeMap<String, String>,
    sink: &mut WarningSink,
) -> Result<Utf8PathBuf, CriticalError> {
    let template = kit
        .and_then(|kit| kit.record.execution.as_ref())
        .and_then(|execution| execution.cwd.as_deref());
    let (template, kit_paths) = match (template, kit_paths) {
        (Some(template), Some(paths)) => (template, paths),
        _ => return Ok(app_root.to_path_buf()),
    };

    let expanded = expand(template, environment, "nak.execution.cwd", sink);
    if expanded.is_empty() {
        return Ok(app_root.to_path_buf());
    }
    let path = Utf8Path::new(&expanded);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    pathsafe::resolve_under(&kit_paths.root, &expanded).map_err(|_| CriticalError::PathTraversal)
}

fn append_expanded_paths(
    raw_paths: &[String],
    source_kind: &str,
    source_path: &str,
    environment: &BTreeMap<String, String>,
    out: &mut Vec<Utf8PathBuf>,
    sink: &mut WarningSink,
) {
    for (i, raw) in raw_paths.iter().enumerate() {
        let expanded = expand(
            raw,
            environment,
            &format!("{}[{}]", source_path, i),
            sink,
        );
        if expanded.is_empty() || !Utf8Path::new(&expanded).is_absolute() {
            sink.push(Warning::InvalidLibraryPath {
                path: expanded,
                source_kind: source_kind.to_owned(),
            });
            continue;
        }
        out.push(Utf8PathBuf::from(expanded));
    }
}

const VALID_TRUST_STATES: [&str; 4] = ["unknown", "unverified", "verified", "failed"];

fn surface_trust(
    record: &AppInstallRecord,
    now: &DateTime<FixedOffset>,
    sink: &mut WarningSink,
) -> TrustView {
    let section = record.trust.clone().unwrap_or_default();
    let state = match section.state.as_deref() {
        None => {
            sink.push(Warning::TrustStateUnknown);
            "unknown".to_owned()
        }
        Some(state) if !VALID_TRUST_STATES.contains(&state) => {
            sink.push(Warning::InvalidTrustState {
                state: state.to_owned(),
            });
            sink.push(Warning::TrustStateUnknown);
            "unknown".to_owned()
        }
        Some("unknown") => {
            sink.push(Warning::TrustStateUnknown);
            "unknown".to_owned()
        }
        Some("unverified") => {
            sink.push(Warning::TrustStateUnverified);
            "unverified".to_owned()
        }
        Some("failed") => {
            sink.push(Warning::TrustStateFailed);
            "failed".to_owned()
        }
        Some(state) => state.to_owned(),
    };

    if let Some(expires_at) = section.expires_at.as_deref() {
        if let Ok(expiry) = DateTime::parse_from_rfc3339(expires_at) {
            if expiry < *now {
                sink.push(Warning::TrustStateStale {
                    expires_at: expires_at.to_owned(),
                    now: now.to_rfc3339(),
                });
            }
        }
    }

    TrustView {
        state,
        source: section.source,
        evaluated_at: section.evaluated_at,
        expires_at: section.expires_at,
        details: section.details,
    }
}

/// The precedence-ordered environment merge, with optional provenance.
struct EnvMerge {
    values: BTreeMap<String, String>,
    trace: Option<BTreeMap<String, TraceEntry>>,
}

impl EnvMerge {
    fn new(with_trace: bool) -> Self {
        Self {
            values: BTreeMap::new(),
            trace: with_trace.then(BTreeMap::new),
        }
    }

    fn apply_layer(
        &mut self,
        layer: &BTreeMap<String, EnvValue>,
        fill: bool,
        rank: u8,
        source_kind: &str,
    ) {
        for (key, op) in layer {
            self.apply(
                key,
                op,
                fill,
                rank,
                source_kind,
                format!("environment.{}", key),
            );
        }
    }

    fn apply(
        &mut self,
        key: &str,
        op: &EnvValue,
        fill: bool,
        rank: u8,
        source_kind: &str,
        source_path: String,
    ) {
        let current = self.values.get(key).map(String::as_str);
        let next = if fill {
            op.apply_fill(current)
        } else {
            op.apply(current)
        };
        match next {
            Some(value) => {
                let changed = current != Some(value.as_str());
                let claims = !fill || changed;
                if claims {
                    if let Some(trace) = &mut self.trace {
                        trace.insert(
                            key.to_owned(),
                            TraceEntry {
                                value: value.clone(),
                                source_kind: source_kind.to_owned(),
                                source_path,
                                precedence_rank: rank,
                            },
                        );
                    }
                }
                self.values.insert(key.to_owned(), value);
            }
            None => {
                self.values.remove(key);
                if let Some(trace) = &mut self.trace {
                    trace.remove(key);
                }
            }
        }
    }

    /// Replaces a value with its expanded form, keeping its provenance.
    fn finalize_value(&mut self, key: &str, expanded: String) {
        if let Some(trace) = &mut self.trace {
            if let Some(entry) = trace.get_mut(key) {
                entry.value = expanded.clone();
            }
        }
        self.values.insert(key.to_owned(), expanded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{encode_manifest, AppManifest, AssetExport};
    use crate::records::RegistryKitLoader;
    use nah_metadata::{
        AppRecordPaths, ArgumentOverrides, InstallSection, KitVersionReq, LoaderSpec, NakExecution,
        NakIdentity, NakInstallRecord, NakPaths, NakPin, OverridesSection, PathOverrides,
        TrustSection, NAK_RECORD_SCHEMA,
    };
    use std::fs;
    use tempfile::TempDir;

    const NOW: &str = "2026-02-01T00:00:00+00:00";

    struct Fixture {
        _dir: TempDir,
        app_root: Utf8PathBuf,
        nak_root: Utf8PathBuf,
        nak_registry: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().expect("tempdir");
            let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8");
            let app_root = root.join("apps/com.example.app-1.2.3");
            let nak_root = root.join("naks/com.example.nak/3.1.2");
            let nak_registry = root.join("registry/naks");

            fs::create_dir_all(app_root.join("bin")).expect("mkdir");
            fs::create_dir_all(app_root.join("lib")).expect("mkdir");
            fs::create_dir_all(app_root.join("share/icons")).expect("mkdir");
            fs::write(app_root.join("bin/app"), b"#!app").expect("write");
            fs::create_dir_all(nak_root.join("bin")).expect("mkdir");
            fs::create_dir_all(nak_root.join("lib")).expect("mkdir");
            fs::write(nak_root.join("bin/nah-runtime"), b"#!rt").expect("write");
            fs::create_dir_all(&nak_registry).expect("mkdir");

            let fixture = Self {
                _dir: dir,
                app_root,
                nak_root,
                nak_registry,
            };
            fixture.write_nak_record("3.1.2", fixture.default_nak_record("3.1.2"));
            fixture
        }

        fn default_nak_record(&self, version: &str) -> NakInstallRecord {
            NakInstallRecord {
                schema: Some(NAK_RECORD_SCHEMA.to_owned()),
                nak: NakIdentity {
                    id: "com.example.nak".to_owned(),
                    version: version.to_owned(),
                },
                paths: NakPaths {
                    root: self.nak_root.clone(),
                    resource_root: None,
                    lib_dirs: vec![self.nak_root.join("lib")],
                },
                environment: BTreeMap::new(),
                loaders: [(
                    "default".to_owned(),
                    LoaderSpec {
                        exec_path: self.nak_root.join("bin/nah-runtime"),
                        args_template: vec![
                            "--app".to_owned(),
                            "{NAH_APP_ENTRY}".to_owned(),
                            "--root".to_owned(),
                            "{NAH_APP_ROOT}".to_owned(),
                        ],
                    },
                )]
                .into_iter()
                .collect(),
                loader: None,
                execution: None,
            }
        }

        fn write_nak_record(&self, version: &str, record: NakInstallRecord) {
            let path = self
                .nak_registry
                .join(format!("com.example.nak@{}.json", version));
            fs::write(
                path,
                serde_json::to_string_pretty(&record).expect("serializes"),
            )
            .expect("write nak record");
        }

        fn manifest(&self) -> AppManifest {
            AppManifest {
                id: Some("com.example.app".to_owned()),
                version: Some("1.2.3".to_owned()),
                nak_id: Some("com.example.nak".to_owned()),
                nak_version_req: Some(KitVersionReq::new(">=3.1.0 <4.0.0")),
                entrypoint: Some("bin/app".to_owned()),
                lib_dirs: vec!["lib".to_owned()],
                env_defaults: vec![("LOG_LEVEL".to_owned(), "info".to_owned())],
                ..AppManifest::default()
            }
        }

        fn record(&self) -> AppInstallRecord {
            AppInstallRecord {
                schema: None,
                install: InstallSection {
                    instance_id: "inst-1".to_owned(),
                    installed_at: None,
                },
                app: Default::default(),
                nak: Some(NakPin {
                    id: "com.example.nak".to_owned(),
                    version: "3.1.2".to_owned(),
                    record_ref: "com.example.nak@3.1.2.json".to_owned(),
                    loader: None,
                }),
                paths: AppRecordPaths {
                    install_root: self.app_root.clone(),
                },
                provenance: None,
                trust: Some(TrustSection {
                    state: Some("verified".to_owned()),
                    ..TrustSection::default()
                }),
                verification: None,
                overrides: None,
            }
        }

        fn compose(
            &self,
            manifest: &AppManifest,
            record: &AppInstallRecord,
            host_env: &HostEnv,
            process_env: &BTreeMap<String, String>,
            overrides_file: Option<&str>,
            with_trace: bool,
        ) -> Envelope {
            let bytes = encode_manifest(manifest);
            let inputs = ComposeInputs {
                manifest_bytes: Some(&bytes),
                record,
                host_env,
                process_env,
                overrides_file,
                now: DateTime::parse_from_rfc3339(NOW).expect("now parses"),
                with_trace,
            };
            let loader = RegistryKitLoader::new(&self.nak_registry);
            compose(&inputs, &loader)
        }

        fn compose_default(&self) -> Envelope {
            self.compose(
                &self.manifest(),
                &self.record(),
                &HostEnv::default(),
                &BTreeMap::new(),
                None,
                false,
            )
        }
    }

    fn keys(envelope: &Envelope) -> Vec<&'static str> {
        envelope.warnings.iter().map(|w| w.key()).collect()
    }

    #[test]
    fn s1_happy_path_nak_backed_app() {
        let fixture = Fixture::new();
        let envelope = fixture.compose_default();

        assert_eq!(envelope.critical_error, None);
        assert!(envelope.warnings.is_empty(), "warnings: {:?}", envelope.warnings);
        let contract = envelope.contract.as_ref().expect("contract");

        assert_eq!(contract.app.id, "com.example.app");
        assert_eq!(
            contract.execution.binary,
            fixture.nak_root.join("bin/nah-runtime")
        );
        assert_eq!(
            contract.execution.arguments,
            vec![
                "--app".to_owned(),
                fixture.app_root.join("bin/app").to_string(),
                "--root".to_owned(),
                fixture.app_root.to_string(),
            ]
        );
        assert_eq!(
            contract.execution.library_paths.first(),
            Some(&fixture.nak_root.join("lib"))
        );
        assert_eq!(
            contract.execution.library_paths.last(),
            Some(&fixture.app_root.join("lib"))
        );

        assert_eq!(
            contract.environment.get("LOG_LEVEL").map(String::as_str),
            Some("info")
        );
        assert_eq!(
            contract.environment.get("NAH_APP_ID").map(String::as_str),
            Some("com.example.app")
        );
        assert_eq!(
            contract.environment.get("NAH_NAK_VERSION").map(String::as_str),
            Some("3.1.2")
        );

        let nak = contract.nak.as_ref().expect("nak view");
        assert_eq!(nak.record_ref, "com.example.nak@3.1.2.json");
        assert_eq!(nak.loader.as_deref(), Some("default"));
        assert_eq!(nak.resource_root, fixture.nak_root);
        assert_eq!(contract.execution.cwd, fixture.app_root);
        assert_eq!(envelope.exit_code(), 0);
    }

    #[test]
    fn s2_standalone_app() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.nak_id = None;
        manifest.nak_version_req = None;
        let mut record = fixture.record();
        record.nak = None;

        let envelope = fixture.compose(
            &manifest,
            &record,
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert!(envelope.warnings.is_empty(), "warnings: {:?}", envelope.warnings);
        let contract = envelope.contract.as_ref().expect("contract");
        assert!(contract.nak.is_none());
        assert_eq!(contract.execution.binary, fixture.app_root.join("bin/app"));
        assert_eq!(
            contract.execution.library_paths,
            vec![fixture.app_root.join("lib")]
        );
        assert!(!contract.environment.contains_key("NAH_NAK_ID"));
    }

    #[test]
    fn s3_traversal_attack_is_critical() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.entrypoint = Some("../../etc/passwd".to_owned());

        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(envelope.critical_error, Some(CriticalError::PathTraversal));
        assert!(envelope.contract.is_none());
        assert_eq!(envelope.exit_code(), 1);

        let json = serde_json::to_value(&envelope).expect("serializes");
        assert_eq!(json["critical_error"], "PATH_TRAVERSAL");
        assert!(json.get("app").is_none());
    }

    #[test]
    fn s4_crc_failure_is_manifest_missing() {
        let fixture = Fixture::new();
        let mut bytes = encode_manifest(&fixture.manifest());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let record = fixture.record();
        let inputs = ComposeInputs {
            manifest_bytes: Some(&bytes),
            record: &record,
            host_env: &HostEnv::default(),
            process_env: &BTreeMap::new(),
            overrides_file: None,
            now: DateTime::parse_from_rfc3339(NOW).expect("now parses"),
            with_trace: false,
        };
        let loader = RegistryKitLoader::new(&fixture.nak_registry);
        let envelope = compose(&inputs, &loader);
        assert_eq!(envelope.critical_error, Some(CriticalError::ManifestMissing));
        assert!(envelope.warnings.is_empty(), "no invalid_manifest on CRC failure");
        assert_eq!(envelope.exit_code(), 1);
    }

    #[test]
    fn absent_manifest_is_manifest_missing() {
        let fixture = Fixture::new();
        let record = fixture.record();
        let inputs = ComposeInputs {
            manifest_bytes: None,
            record: &record,
            host_env: &HostEnv::default(),
            process_env: &BTreeMap::new(),
            overrides_file: None,
            now: DateTime::parse_from_rfc3339(NOW).expect("now parses"),
            with_trace: false,
        };
        let loader = RegistryKitLoader::new(&fixture.nak_registry);
        let envelope = compose(&inputs, &loader);
        assert_eq!(envelope.critical_error, Some(CriticalError::ManifestMissing));
    }

    #[test]
    fn s5_unsupported_pinned_version_is_unresolved() {
        let fixture = Fixture::new();
        fixture.write_nak_record("3.0.5", fixture.default_nak_record("3.0.5"));
        let mut record = fixture.record();
        record.nak = Some(NakPin {
            id: "com.example.nak".to_owned(),
            version: "3.0.5".to_owned(),
            record_ref: "com.example.nak@3.0.5.json".to_owned(),
            loader: None,
        });

        let envelope = fixture.compose(
            &fixture.manifest(),
            &record,
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["nak_version_unsupported"]);
        let contract = envelope.contract.as_ref().expect("contract");
        assert!(contract.nak.is_none());
        assert!(!contract.environment.contains_key("NAH_NAK_ID"));
        assert_eq!(contract.execution.binary, fixture.app_root.join("bin/app"));
        assert_eq!(
            contract.execution.library_paths,
            vec![fixture.app_root.join("lib")]
        );
        assert_eq!(envelope.exit_code(), 0);
    }

    #[test]
    fn s6_override_denied_by_policy() {
        let fixture = Fixture::new();
        let host = HostEnv {
            overrides: nah_metadata::HostOverridePolicy {
                allow_env_overrides: false,
            },
            ..HostEnv::default()
        };
        let mut process = BTreeMap::new();
        process.insert(
            "NAH_OVERRIDE_ENVIRONMENT".to_owned(),
            r#"{"FOO":"bar"}"#.to_owned(),
        );

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &process,
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_denied"]);
        let warning = &envelope.warnings[0];
        let fields = warning.fields();
        assert_eq!(fields["target"], "NAH_OVERRIDE_ENVIRONMENT");
        assert_eq!(fields["source_kind"], "process_env");
        assert_eq!(fields["source_ref"], "NAH_OVERRIDE_ENVIRONMENT");

        let contract = envelope.contract.as_ref().expect("contract");
        assert!(!contract.environment.contains_key("FOO"));
    }

    #[test]
    fn override_applies_when_permitted() {
        let fixture = Fixture::new();
        let mut process = BTreeMap::new();
        process.insert(
            "NAH_OVERRIDE_ENVIRONMENT".to_owned(),
            r#"{"FOO":"bar","LOG_LEVEL":"trace"}"#.to_owned(),
        );

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &process,
            None,
            true,
        );
        assert!(envelope.warnings.is_empty(), "warnings: {:?}", envelope.warnings);
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.environment.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(
            contract.environment.get("LOG_LEVEL").map(String::as_str),
            Some("trace")
        );

        let trace = envelope.trace.as_ref().expect("trace");
        assert_eq!(trace.environment["FOO"].precedence_rank, 6);
        assert_eq!(trace.environment["FOO"].source_kind, "process_env");
        assert_eq!(trace.environment["LOG_LEVEL"].precedence_rank, 6);
    }

    #[test]
    fn unsupported_override_target_is_denied() {
        let fixture = Fixture::new();
        let mut process = BTreeMap::new();
        process.insert("NAH_OVERRIDE_PATHS".to_owned(), "/tmp".to_owned());

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &process,
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_denied"]);
        assert_eq!(
            envelope.warnings[0].fields()["target"],
            "NAH_OVERRIDE_PATHS"
        );
    }

    #[test]
    fn malformed_overrides_are_reported() {
        let fixture = Fixture::new();
        let mut process = BTreeMap::new();
        process.insert("NAH_OVERRIDE_ENVIRONMENT".to_owned(), "{not json".to_owned());
        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &process,
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_invalid"]);
        assert_eq!(envelope.warnings[0].fields()["reason"], "parse_failure");

        let mut process = BTreeMap::new();
        process.insert(
            "NAH_OVERRIDE_ENVIRONMENT".to_owned(),
            r#"{"FOO": 42}"#.to_owned(),
        );
        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &process,
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_invalid"]);
        assert_eq!(envelope.warnings[0].fields()["reason"], "invalid_shape");
    }

    #[test]
    fn file_overrides_apply_at_highest_precedence() {
        let fixture = Fixture::new();
        let mut process = BTreeMap::new();
        process.insert(
            "NAH_OVERRIDE_ENVIRONMENT".to_owned(),
            r#"{"FOO":"process"}"#.to_owned(),
        );
        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &process,
            Some(r#"{"environment": {"FOO": "file"}}"#),
            true,
        );
        assert!(envelope.warnings.is_empty());
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.environment.get("FOO").map(String::as_str), Some("file"));
        let trace = envelope.trace.as_ref().expect("trace");
        assert_eq!(trace.environment["FOO"].precedence_rank, 7);
        assert_eq!(trace.environment["FOO"].source_kind, "overrides_file");
    }

    #[test]
    fn file_override_failures_are_scoped_to_the_file() {
        let fixture = Fixture::new();
        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            Some("]["),
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_invalid"]);
        let fields = envelope.warnings[0].fields();
        assert_eq!(fields["target"], "OVERRIDES_FILE");
        assert_eq!(fields["source_kind"], "overrides_file");
        assert_eq!(fields["reason"], "parse_failure");

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            Some(r#"{"environment": {"FOO": []}}"#),
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_invalid"]);
        assert_eq!(envelope.warnings[0].fields()["reason"], "invalid_shape");

        // Policy denial wins: only override_denied, never override_invalid.
        let host = HostEnv {
            overrides: nah_metadata::HostOverridePolicy {
                allow_env_overrides: false,
            },
            ..HostEnv::default()
        };
        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &BTreeMap::new(),
            Some("]["),
            false,
        );
        assert_eq!(keys(&envelope), vec!["override_denied"]);
        assert_eq!(envelope.warnings[0].fields()["target"], "OVERRIDES_FILE");
    }

    #[test]
    fn env_precedence_and_operations() {
        let fixture = Fixture::new();
        let mut host = HostEnv::default();
        host.environment.insert(
            "LOG_LEVEL".to_owned(),
            EnvValue::Set("warn".to_owned()),
        );
        host.environment.insert(
            "SEARCH".to_owned(),
            EnvValue::Set("/host".to_owned()),
        );

        let mut nak_record = fixture.default_nak_record("3.1.2");
        nak_record.environment.insert(
            "SEARCH".to_owned(),
            EnvValue::Prepend {
                value: "/nak".to_owned(),
                separator: ":".to_owned(),
            },
        );
        nak_record.environment.insert(
            "DOOMED".to_owned(),
            EnvValue::Set("present".to_owned()),
        );
        fixture.write_nak_record("3.1.2", nak_record);

        let mut record = fixture.record();
        record.overrides = Some(OverridesSection {
            environment: [
                ("LOG_LEVEL".to_owned(), EnvValue::Set("debug".to_owned())),
                ("DOOMED".to_owned(), EnvValue::Unset),
            ]
            .into_iter()
            .collect(),
            arguments: ArgumentOverrides::default(),
            paths: PathOverrides::default(),
        });

        let envelope = fixture.compose(
            &fixture.manifest(),
            &record,
            &host,
            &BTreeMap::new(),
            None,
            true,
        );
        assert!(envelope.warnings.is_empty(), "warnings: {:?}", envelope.warnings);
        let contract = envelope.contract.as_ref().expect("contract");

        // Manifest default (fill-only) loses to the host default; the record
        // override (overwrite) wins over both.
        assert_eq!(
            contract.environment.get("LOG_LEVEL").map(String::as_str),
            Some("debug")
        );
        // The kit layer joins with the host value rather than clobbering it.
        assert_eq!(
            contract.environment.get("SEARCH").map(String::as_str),
            Some("/nak:/host")
        );
        assert!(!contract.environment.contains_key("DOOMED"));

        let trace = envelope.trace.as_ref().expect("trace");
        assert_eq!(trace.environment["LOG_LEVEL"].precedence_rank, 4);
        assert_eq!(trace.environment["SEARCH"].precedence_rank, 2);
        assert_eq!(trace.environment["NAH_APP_ID"].precedence_rank, 5);
        assert_eq!(trace.environment["NAH_APP_ID"].source_kind, "standard");
    }

    #[test]
    fn standard_variables_win_over_records() {
        let fixture = Fixture::new();
        let mut record = fixture.record();
        record.overrides = Some(OverridesSection {
            environment: [(
                "NAH_APP_ID".to_owned(),
                EnvValue::Set("spoofed".to_owned()),
            )]
            .into_iter()
            .collect(),
            arguments: ArgumentOverrides::default(),
            paths: PathOverrides::default(),
        });

        let envelope = fixture.compose(
            &fixture.manifest(),
            &record,
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(
            contract.environment.get("NAH_APP_ID").map(String::as_str),
            Some("com.example.app")
        );
    }

    #[test]
    fn permitted_override_can_rewrite_standard_variables() {
        let fixture = Fixture::new();
        let mut process = BTreeMap::new();
        process.insert(
            "NAH_OVERRIDE_ENVIRONMENT".to_owned(),
            r#"{"NAH_APP_ID":"rewritten"}"#.to_owned(),
        );
        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &HostEnv::default(),
            &process,
            None,
            false,
        );
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(
            contract.environment.get("NAH_APP_ID").map(String::as_str),
            Some("rewritten")
        );
    }

    #[test]
    fn env_values_expand_against_a_snapshot() {
        let fixture = Fixture::new();
        let mut host = HostEnv::default();
        host.environment.insert(
            "APP_DATA".to_owned(),
            EnvValue::Set("{NAH_APP_ROOT}/data".to_owned()),
        );
        host.environment.insert(
            "CHAIN".to_owned(),
            EnvValue::Set("{APP_DATA}".to_owned()),
        );

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &BTreeMap::new(),
            None,
            false,
        );
        assert!(envelope.warnings.is_empty(), "warnings: {:?}", envelope.warnings);
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(
            contract.environment.get("APP_DATA").map(String::as_str),
            Some(format!("{}/data", fixture.app_root).as_str())
        );
        // Single pass against the snapshot: CHAIN gets the raw APP_DATA value.
        assert_eq!(
            contract.environment.get("CHAIN").map(String::as_str),
            Some("{NAH_APP_ROOT}/data")
        );
    }

    #[test]
    fn missing_placeholder_warns_and_substitutes_empty() {
        let fixture = Fixture::new();
        let mut host = HostEnv::default();
        host.environment.insert(
            "BROKEN".to_owned(),
            EnvValue::Set("a{NOT_A_VAR}b".to_owned()),
        );

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["missing_env_var"]);
        let fields = envelope.warnings[0].fields();
        assert_eq!(fields["missing"], "NOT_A_VAR");
        assert_eq!(fields["source_path"], "environment.BROKEN");
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.environment.get("BROKEN").map(String::as_str), Some("ab"));
    }

    #[test]
    fn trust_states_surface_as_warnings() {
        let fixture = Fixture::new();
        let cases: [(Option<TrustSection>, &str, Vec<&str>); 5] = [
            (None, "unknown", vec!["trust_state_unknown"]),
            (
                Some(TrustSection {
                    state: Some("unverified".to_owned()),
                    ..TrustSection::default()
                }),
                "unverified",
                vec!["trust_state_unverified"],
            ),
            (
                Some(TrustSection {
                    state: Some("failed".to_owned()),
                    ..TrustSection::default()
                }),
                "failed",
                vec!["trust_state_failed"],
            ),
            (
                Some(TrustSection {
                    state: Some("certainly".to_owned()),
                    ..TrustSection::default()
                }),
                "unknown",
                vec!["invalid_trust_state", "trust_state_unknown"],
            ),
            (
                Some(TrustSection {
                    state: Some("verified".to_owned()),
                    expires_at: Some("2026-01-01T00:00:00+00:00".to_owned()),
                    ..TrustSection::default()
                }),
                "verified",
                vec!["trust_state_stale"],
            ),
        ];

        for (trust, expected_state, expected_keys) in cases {
            let mut record = fixture.record();
            record.trust = trust;
            let envelope = fixture.compose(
                &fixture.manifest(),
                &record,
                &HostEnv::default(),
                &BTreeMap::new(),
                None,
                false,
            );
            assert_eq!(keys(&envelope), expected_keys);
            let contract = envelope.contract.as_ref().expect("contract");
            assert_eq!(contract.trust.state, expected_state);
        }
    }

    #[test]
    fn capabilities_derive_in_declaration_order() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.permissions_filesystem = vec![
            "read:{NAH_APP_ROOT}/data".to_owned(),
            "noseparator".to_owned(),
            "chmod:/tmp".to_owned(),
        ];
        manifest.permissions_network = vec!["connect:tcp:443".to_owned()];

        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["capability_malformed", "capability_unknown"]);
        let contract = envelope.contract.as_ref().expect("contract");
        assert!(contract.capability_usage.present);
        // Selectors are opaque: no expansion, no containment checks.
        assert_eq!(
            contract.capability_usage.required,
            vec![
                "filesystem.read:{NAH_APP_ROOT}/data".to_owned(),
                "network.connect:tcp:443".to_owned(),
            ]
        );
        assert!(contract.capability_usage.optional.is_empty());
        assert!(contract.enforcement.filesystem.is_empty());
    }

    #[test]
    fn asset_exports_resolve_and_last_id_wins() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.asset_exports = vec![
            AssetExport {
                id: "icons".to_owned(),
                relpath: "share/old".to_owned(),
                kind: None,
            },
            AssetExport {
                id: "icons".to_owned(),
                relpath: "share/icons".to_owned(),
                kind: Some("dir".to_owned()),
            },
        ];

        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.exports.len(), 1);
        let entry = &contract.exports["icons"];
        assert_eq!(entry.path, fixture.app_root.join("share/icons"));
        assert_eq!(entry.kind.as_deref(), Some("dir"));
    }

    #[test]
    fn traversing_asset_export_is_critical() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.asset_exports = vec![AssetExport {
            id: "evil".to_owned(),
            relpath: "../outside".to_owned(),
            kind: None,
        }];
        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(envelope.critical_error, Some(CriticalError::PathTraversal));
    }

    #[test]
    fn non_absolute_library_paths_are_skipped() {
        let fixture = Fixture::new();
        let mut host = HostEnv::default();
        host.paths.library_prepend =
            vec!["relative/lib".to_owned(), "/abs/lib".to_owned()];

        let envelope = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["invalid_library_path"]);
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(
            contract.execution.library_paths.first().map(|p| p.as_str()),
            Some("/abs/lib")
        );
    }

    #[test]
    fn library_path_order_is_normative() {
        let fixture = Fixture::new();
        let mut host = HostEnv::default();
        host.paths.library_prepend = vec!["/host/prepend".to_owned()];
        host.paths.library_append = vec!["/host/append".to_owned()];
        let mut record = fixture.record();
        record.overrides = Some(OverridesSection {
            environment: BTreeMap::new(),
            arguments: ArgumentOverrides::default(),
            paths: PathOverrides {
                library_prepend: vec!["/override/prepend".to_owned()],
            },
        });

        let envelope = fixture.compose(
            &fixture.manifest(),
            &record,
            &host,
            &BTreeMap::new(),
            None,
            false,
        );
        let contract = envelope.contract.as_ref().expect("contract");
        let paths: Vec<&str> = contract
            .execution
            .library_paths
            .iter()
            .map(|p| p.as_str())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/host/prepend",
                "/override/prepend",
                fixture.nak_root.join("lib").as_str(),
                fixture.app_root.join("lib").as_str(),
                "/host/append",
            ]
        );
    }

    #[test]
    fn argument_order_is_normative() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.entrypoint_args = vec!["--serve".to_owned()];
        let mut record = fixture.record();
        record.overrides = Some(OverridesSection {
            environment: BTreeMap::new(),
            arguments: ArgumentOverrides {
                prepend: vec!["--pre".to_owned()],
                append: vec!["--post={NAH_APP_VERSION}".to_owned()],
            },
            paths: PathOverrides::default(),
        });

        let envelope = fixture.compose(
            &manifest,
            &record,
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(
            contract.execution.arguments,
            vec![
                "--app".to_owned(),
                fixture.app_root.join("bin/app").to_string(),
                "--root".to_owned(),
                fixture.app_root.to_string(),
                "--pre".to_owned(),
                "--serve".to_owned(),
                "--post=1.2.3".to_owned(),
            ]
        );
    }

    #[test]
    fn kit_cwd_template_is_expanded_and_contained() {
        let fixture = Fixture::new();

        let mut nak_record = fixture.default_nak_record("3.1.2");
        nak_record.execution = Some(NakExecution {
            cwd: Some("{NAH_APP_ROOT}".to_owned()),
        });
        fixture.write_nak_record("3.1.2", nak_record);
        let envelope = fixture.compose_default();
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.execution.cwd, fixture.app_root);

        let mut nak_record = fixture.default_nak_record("3.1.2");
        nak_record.execution = Some(NakExecution {
            cwd: Some("work".to_owned()),
        });
        fixture.write_nak_record("3.1.2", nak_record);
        let envelope = fixture.compose_default();
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.execution.cwd, fixture.nak_root.join("work"));

        let mut nak_record = fixture.default_nak_record("3.1.2");
        nak_record.execution = Some(NakExecution {
            cwd: Some("../escape".to_owned()),
        });
        fixture.write_nak_record("3.1.2", nak_record);
        let envelope = fixture.compose_default();
        assert_eq!(envelope.critical_error, Some(CriticalError::PathTraversal));
    }

    #[test]
    fn pinned_loader_name_missing_falls_back_to_entrypoint() {
        let fixture = Fixture::new();
        let mut record = fixture.record();
        record.nak.as_mut().expect("pin").loader = Some("ghost".to_owned());

        let envelope = fixture.compose(
            &fixture.manifest(),
            &record,
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["nak_loader_missing"]);
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.execution.binary, fixture.app_root.join("bin/app"));
        let nak = contract.nak.as_ref().expect("nak view");
        assert_eq!(nak.loader, None);
    }

    #[test]
    fn missing_loader_binary_is_critical() {
        let fixture = Fixture::new();
        let mut nak_record = fixture.default_nak_record("3.1.2");
        nak_record
            .loaders
            .get_mut("default")
            .expect("default loader")
            .exec_path = fixture.nak_root.join("bin/ghost");
        fixture.write_nak_record("3.1.2", nak_record);

        let envelope = fixture.compose_default();
        assert_eq!(envelope.critical_error, Some(CriticalError::NakLoaderInvalid));
    }

    #[test]
    fn multiple_loaders_without_default_require_a_pin() {
        let fixture = Fixture::new();
        let mut nak_record = fixture.default_nak_record("3.1.2");
        let spec = nak_record.loaders.remove("default").expect("spec");
        nak_record.loaders.insert("alpha".to_owned(), spec.clone());
        nak_record.loaders.insert("beta".to_owned(), spec);
        fixture.write_nak_record("3.1.2", nak_record);

        let envelope = fixture.compose_default();
        assert_eq!(keys(&envelope), vec!["nak_loader_required"]);
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.execution.binary, fixture.app_root.join("bin/app"));
    }

    #[test]
    fn escaping_kit_lib_dir_is_critical() {
        let fixture = Fixture::new();
        let mut nak_record = fixture.default_nak_record("3.1.2");
        nak_record.paths.lib_dirs = vec!["/usr/lib".into()];
        fixture.write_nak_record("3.1.2", nak_record);

        let envelope = fixture.compose_default();
        assert_eq!(envelope.critical_error, Some(CriticalError::PathTraversal));
    }

    #[test]
    fn audit_mismatch_warns_but_manifest_wins() {
        let fixture = Fixture::new();
        let mut record = fixture.record();
        record.app.id = Some("com.example.renamed".to_owned());
        record.app.version = Some("1.2.3".to_owned());

        let envelope = fixture.compose(
            &fixture.manifest(),
            &record,
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["invalid_configuration"]);
        let contract = envelope.contract.as_ref().expect("contract");
        assert_eq!(contract.app.id, "com.example.app");
    }

    #[test]
    fn unparseable_requirement_warns_but_composes() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.nak_version_req = Some(KitVersionReq::new("not-a-range"));

        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(keys(&envelope), vec!["invalid_manifest"]);
        let contract = envelope.contract.as_ref().expect("contract");
        // The pin itself still resolves; only the requirement is suspect.
        assert!(contract.nak.is_some());
    }

    #[test]
    fn missing_entrypoint_file_is_critical() {
        let fixture = Fixture::new();
        let mut manifest = fixture.manifest();
        manifest.entrypoint = Some("bin/ghost".to_owned());
        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(
            envelope.critical_error,
            Some(CriticalError::EntrypointNotFound)
        );

        let mut manifest = fixture.manifest();
        manifest.entrypoint = None;
        let envelope = fixture.compose(
            &manifest,
            &fixture.record(),
            &HostEnv::default(),
            &BTreeMap::new(),
            None,
            false,
        );
        assert_eq!(
            envelope.critical_error,
            Some(CriticalError::EntrypointNotFound)
        );
        assert_eq!(keys(&envelope), vec!["invalid_manifest"]);
    }

    #[test]
    fn composition_is_deterministic() {
        let fixture = Fixture::new();
        let mut host = HostEnv::default();
        host.environment
            .insert("ZED".to_owned(), EnvValue::Set("z".to_owned()));
        host.environment
            .insert("ALPHA".to_owned(), EnvValue::Set("a".to_owned()));

        let first = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &BTreeMap::new(),
            None,
            true,
        );
        let second = fixture.compose(
            &fixture.manifest(),
            &fixture.record(),
            &host,
            &BTreeMap::new(),
            None,
            true,
        );
        let first_json = serde_json::to_string(&first).expect("serializes");
        let second_json = serde_json::to_string(&second).expect("serializes");
        assert_eq!(first_json, second_json);
    }

    #[test]
    fn contract_paths_are_rooted_at_app_or_nak_root() {
        let fixture = Fixture::new();
        let envelope = fixture.compose_default();
        let contract = envelope.contract.as_ref().expect("contract");

        let rooted = |path: &Utf8PathBuf| {
            path.starts_with(&fixture.app_root) || path.starts_with(&fixture.nak_root)
        };
        assert!(rooted(&contract.app.entrypoint));
        assert!(rooted(&contract.execution.binary));
        assert!(rooted(&contract.execution.cwd));
        assert!(contract.execution.library_paths.iter().all(rooted));
        assert!(contract.exports.values().map(|e| &e.path).all(rooted));
    }
}
