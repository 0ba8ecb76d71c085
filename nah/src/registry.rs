// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Registry storage: durable JSON records, lazy scans, and the install lock.
//!
//! Every persisted JSON goes through [`write_json_atomic`]: readers observe
//! the rename boundary and therefore see either the old or the new record,
//! never a half-written one.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{bail, eyre, WrapErr},
    Result,
};
use fs2::FileExt;
use nah_metadata::AppInstallRecord;
use serde::Serialize;
use std::{fs, io::Write};

/// Writes `value` as pretty JSON to `path` atomically: tmp file, fsync,
/// rename, fsync of the parent directory.
pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .wrap_err_with(|| format!("failed to serialize record for {}", path))?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes)
}

pub fn write_bytes_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre!("{} has no parent directory", path))?;
    let tmp_path = Utf8PathBuf::from(format!("{}.tmp", path));

    let mut file = fs::File::create(&tmp_path)
        .wrap_err_with(|| format!("failed to create temporary file {}", tmp_path))?;
    file.write_all(bytes)
        .wrap_err_with(|| format!("failed to write {}", tmp_path))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to fsync {}", tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .wrap_err_with(|| format!("failed to rename {} to {}", tmp_path, path))?;
    fsync_dir(parent)?;
    Ok(())
}

/// Fsyncs a directory so a completed rename is durable.
pub fn fsync_dir(dir: &Utf8Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle =
            fs::File::open(dir).wrap_err_with(|| format!("failed to open directory {}", dir))?;
        handle
            .sync_all()
            .wrap_err_with(|| format!("failed to fsync directory {}", dir))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Registry file name for an id/version pair.
pub fn record_file_name(id: &str, version: &str) -> String {
    format!("{}@{}.json", id, version)
}

/// One registry entry, parsed from its file name. The record itself is only
/// read when a caller decides to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordEntry {
    pub id: String,
    pub version: String,
    pub path: Utf8PathBuf,
}

impl RecordEntry {
    pub fn file_name(&self) -> String {
        record_file_name(&self.id, &self.version)
    }
}

/// Lazily yields `(id, version, path)` for every record file in a registry
/// directory, in file-name order. Files that do not match
/// `<id>@<version>.json` are skipped.
pub fn scan_records(dir: &Utf8Path) -> Result<impl Iterator<Item = RecordEntry>> {
    let mut names = Vec::new();
    for entry in dir
        .read_dir_utf8()
        .wrap_err_with(|| format!("failed to list registry directory {}", dir))?
    {
        let entry = entry.wrap_err_with(|| format!("failed to list {}", dir))?;
        if entry.file_type().map_or(false, |t| t.is_file()) {
            names.push(entry.file_name().to_owned());
        }
    }
    names.sort();

    let dir = dir.to_path_buf();
    Ok(names.into_iter().filter_map(move |name| {
        let stem = name.strip_suffix(".json")?;
        let (id, version) = stem.rsplit_once('@')?;
        if id.is_empty() || version.is_empty() {
            return None;
        }
        Some(RecordEntry {
            id: id.to_owned(),
            version: version.to_owned(),
            path: dir.join(&name),
        })
    }))
}

/// Selects "the" record for an id: an explicit version must exist; without
/// one, exactly one installed version may match.
pub fn select_single(
    dir: &Utf8Path,
    id: &str,
    version: Option<&str>,
) -> Result<RecordEntry> {
    if let Some(version) = version {
        let path = dir.join(record_file_name(id, version));
        if !path.is_file() {
            bail!("{} {} is not installed (no record at {})", id, version, path);
        }
        return Ok(RecordEntry {
            id: id.to_owned(),
            version: version.to_owned(),
            path,
        });
    }

    let matches: Vec<_> = scan_records(dir)?
        .filter(|entry| entry.id == id)
        .collect();
    match matches.len() {
        0 => bail!("{} is not installed", id),
        1 => Ok(matches.into_iter().next().expect("one entry")),
        _ => {
            let versions: Vec<_> = matches.iter().map(|e| e.version.as_str()).collect();
            bail!(
                "{} has multiple installed versions ({}); specify one as {}@<version>",
                id,
                versions.join(", "),
                id
            )
        }
    }
}

/// Checks the append-only rules for an app-record update: the identity
/// snapshot and `install.instance_id` are immutable, and `nak.record_ref` is
/// write-once.
pub fn validate_record_update(old: &AppInstallRecord, new: &AppInstallRecord) -> Result<()> {
    if old.install.instance_id != new.install.instance_id {
        bail!(
            "install.instance_id is immutable ({} -> {})",
            old.install.instance_id,
            new.install.instance_id
        );
    }
    let identity_pairs = [
        ("app.id", &old.app.id, &new.app.id),
        ("app.version", &old.app.version, &new.app.version),
        ("app.nak_id", &old.app.nak_id, &new.app.nak_id),
    ];
    for (name, old_value, new_value) in identity_pairs {
        if old_value.is_some() && old_value != new_value {
            bail!("{} is immutable once written", name);
        }
    }
    if let (Some(old_req), Some(new_req)) = (&old.app.nak_version_req, &new.app.nak_version_req) {
        if old_req.as_str() != new_req.as_str() {
            bail!("app.nak_version_req is immutable once written");
        }
    }
    if let Some(old_pin) = &old.nak {
        if !old_pin.record_ref.is_empty() {
            let unchanged = new
                .nak
                .as_ref()
                .map_or(false, |new_pin| new_pin.record_ref == old_pin.record_ref);
            if !unchanged {
                bail!("nak.record_ref is write-once");
            }
        }
    }
    Ok(())
}

/// Applies an update to an app record under the append-only rules and writes
/// it back atomically.
pub fn update_app_record(
    path: &Utf8Path,
    mutate: impl FnOnce(&mut AppInstallRecord),
) -> Result<()> {
    let text =
        fs::read_to_string(path).wrap_err_with(|| format!("failed to read record {}", path))?;
    let old: AppInstallRecord = serde_json::from_str(&text)
        .wrap_err_with(|| format!("failed to parse record {}", path))?;
    let mut new = old.clone();
    mutate(&mut new);
    validate_record_update(&old, &new)?;
    write_json_atomic(path, &new)
}

const LOCKFILE_EXT: &str = "lock";

/// A lock file that has been opened but not yet acquired.
#[derive(Debug)]
pub struct UnlockedLock {
    file: fs::File,
    lock_path: Utf8PathBuf,
}

impl UnlockedLock {
    /// Opens (creating if needed) `<locks_dir>/<op>.lock`.
    pub fn new(locks_dir: &Utf8Path, op: &str) -> Result<Self> {
        let mut lock_path = locks_dir.join(op);
        lock_path.set_extension(LOCKFILE_EXT);
        let mut open_opts = fs::OpenOptions::new();
        let file = open_opts
            .write(true)
            .create(true)
            .open(&lock_path)
            .wrap_err_with(|| format!("failed to open lock at {}", lock_path))?;
        Ok(Self { file, lock_path })
    }

    /// Blocks until the exclusive, OS-enforced lock is held.
    pub fn lock_exclusive(self) -> Result<ExclusiveLock> {
        self.file
            .lock_exclusive()
            .wrap_err_with(|| format!("failed to obtain exclusive lock at {}", self.lock_path))?;
        Ok(ExclusiveLock {
            file: self.file,
            lock_path: self.lock_path,
        })
    }
}

/// Operations that mutate a NAH root run while one of these is alive. The
/// lock releases when the value drops, on all exit paths.
#[derive(Debug)]
#[must_use]
pub struct ExclusiveLock {
    file: fs::File,
    lock_path: Utf8PathBuf,
}

impl ExclusiveLock {
    #[inline]
    pub fn path(&self) -> &Utf8Path {
        &self.lock_path
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
