// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The launch-query operation: gather the on-disk inputs for an installed
//! app and run composition. All I/O happens here; the composer itself only
//! probes paths its inputs declare.

use crate::{
    compose::{compose, ComposeInputs},
    helpers::split_spec,
    manifest::{self, NoSectionReader},
    records::{self, RegistryKitLoader},
    registry,
    state::NahState,
};
use camino::Utf8Path;
use chrono::Utc;
use color_eyre::{eyre::WrapErr, Result};
use nah_metadata::{CriticalError, Envelope, WarningSink};
use std::{collections::BTreeMap, env, fs};

#[derive(Clone, Debug, Default)]
pub struct LaunchQueryOpts {
    pub with_trace: bool,
}

/// Computes the launch contract for `spec` (`<id>` or `<id>@<version>`).
///
/// A missing install is a caller error; everything downstream of the record
/// surfaces inside the envelope.
pub fn launch_query(
    state: &NahState,
    spec: &str,
    overrides_file: Option<&Utf8Path>,
    opts: &LaunchQueryOpts,
) -> Result<Envelope> {
    let (id, version) = split_spec(spec);
    let entry = registry::select_single(state.app_registry_dir(), &id, version.as_deref())?;

    let overrides_text = overrides_file
        .map(|path| {
            fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read overrides file {}", path))
        })
        .transpose()?;

    let mut pre_sink = WarningSink::new();
    let host_env = records::load_host_env(state.host_file(), &mut pre_sink);

    let record = match records::load_app_record(&entry.path) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!("install record {} rejected: {}", entry.path, err);
            return Ok(Envelope::critical(
                CriticalError::InstallRecordInvalid,
                pre_sink.into_vec(),
            ));
        }
    };

    let manifest_bytes = manifest::locate(&record.paths.install_root, &NoSectionReader)?;

    let process_env: BTreeMap<String, String> = env::vars().collect();
    let now = Utc::now().fixed_offset();

    let inputs = ComposeInputs {
        manifest_bytes: manifest_bytes.as_deref(),
        record: &record,
        host_env: &host_env,
        process_env: &process_env,
        overrides_file: overrides_text.as_deref(),
        now,
        with_trace: opts.with_trace,
    };
    let kit_loader = RegistryKitLoader::new(state.nak_registry_dir());
    let mut envelope = compose(&inputs, &kit_loader);

    // Host-file findings come before anything the composer emitted.
    let mut warnings = pre_sink.into_vec();
    warnings.append(&mut envelope.warnings);
    envelope.warnings = warnings;
    Ok(envelope)
}
