// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic `.nap`/`.nak` archives: gzip-compressed ustar with rigid
//! normalization, so identical trees produce byte-identical packages.
//!
//! Packing sorts entries by path, zeroes ownership and timestamps, and
//! normalizes modes. Unpacking refuses everything that is not a plain file
//! or directory inside the extraction root, and materializes nothing unless
//! the whole archive validates.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{bail, WrapErr},
    Result,
};
use flate2::{read::GzDecoder, Compression, GzBuilder};
use std::{fs, io::Read};
use tar::{EntryType, Header};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;

/// Packs a directory tree into deterministic tar.gz bytes.
pub fn pack(root: &Utf8Path) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    collect_entries(root, Utf8Path::new(""), &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let gz = GzBuilder::new().mtime(0).write(Vec::new(), Compression::new(6));
    let mut builder = tar::Builder::new(gz);

    for entry in &entries {
        let mut header = Header::new_ustar();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        match &entry.kind {
            PackKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(DIR_MODE);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{}/", entry.path), std::io::empty())
                    .wrap_err_with(|| format!("failed to add directory {}", entry.path))?;
            }
            PackKind::File { executable } => {
                let source = root.join(&entry.path);
                let data = fs::read(&source)
                    .wrap_err_with(|| format!("failed to read {}", source))?;
                header.set_entry_type(EntryType::Regular);
                header.set_mode(if *executable { EXEC_MODE } else { FILE_MODE });
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, entry.path.as_str(), data.as_slice())
                    .wrap_err_with(|| format!("failed to add file {}", entry.path))?;
            }
        }
    }

    let gz = builder.into_inner().wrap_err("failed to finalize archive")?;
    gz.finish().wrap_err("failed to finalize compression")
}

struct PackEntry {
    path: Utf8PathBuf,
    kind: PackKind,
}

enum PackKind {
    Directory,
    File { executable: bool },
}

fn collect_entries(
    root: &Utf8Path,
    prefix: &Utf8Path,
    entries: &mut Vec<PackEntry>,
) -> Result<()> {
    let dir = root.join(prefix);
    for child in dir
        .read_dir_utf8()
        .wrap_err_with(|| format!("failed to list {}", dir))?
    {
        let child = child.wrap_err_with(|| format!("failed to list {}", dir))?;
        let rel = if prefix.as_str().is_empty() {
            Utf8PathBuf::from(child.file_name())
        } else {
            prefix.join(child.file_name())
        };
        let metadata = fs::symlink_metadata(child.path())
            .wrap_err_with(|| format!("failed to stat {}", child.path()))?;
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            bail!("cannot pack {}: symlinks are not allowed", rel);
        } else if file_type.is_dir() {
            entries.push(PackEntry {
                path: rel.clone(),
                kind: PackKind::Directory,
            });
            collect_entries(root, &rel, entries)?;
        } else if file_type.is_file() {
            entries.push(PackEntry {
                kind: PackKind::File {
                    executable: is_executable(&metadata, &rel),
                },
                path: rel,
            });
        } else {
            bail!(
                "cannot pack {}: only regular files and directories are allowed",
                rel
            );
        }
    }
    Ok(())
}

fn is_executable(metadata: &fs::Metadata, rel: &Utf8Path) -> bool {
    if rel.starts_with("bin") {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        false
    }
}

/// Unpacks archive bytes into `dest`. The whole archive is validated before
/// anything touches the filesystem, so a rejected archive leaves no files.
pub fn unpack(bytes: &[u8], dest: &Utf8Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut staged: Vec<(Utf8PathBuf, UnpackKind)> = Vec::new();

    for entry in archive
        .entries()
        .wrap_err("failed to read archive entries")?
    {
        let mut entry = entry.wrap_err("failed to read archive entry")?;
        let raw_path = entry
            .path()
            .wrap_err("archive entry has an unreadable path")?
            .into_owned();
        let path = Utf8PathBuf::from_path_buf(raw_path)
            .map_err(|p| color_eyre::eyre::eyre!("archive path {} is not UTF-8", p.display()))?;
        let rel = validate_entry_path(&path)?;

        match entry.header().entry_type() {
            EntryType::Directory => staged.push((rel, UnpackKind::Directory)),
            EntryType::Regular => {
                let mode = entry.header().mode().unwrap_or(FILE_MODE);
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut data)
                    .wrap_err_with(|| format!("failed to read archive file {}", rel))?;
                staged.push((
                    rel,
                    UnpackKind::File {
                        data,
                        executable: mode & 0o111 != 0,
                    },
                ));
            }
            other => bail!(
                "archive entry {} has refused type {:?}",
                rel,
                other
            ),
        }
    }

    for (rel, kind) in staged {
        let target = dest.join(&rel);
        match kind {
            UnpackKind::Directory => {
                fs::create_dir_all(&target)
                    .wrap_err_with(|| format!("failed to create {}", target))?;
            }
            UnpackKind::File { data, executable } => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .wrap_err_with(|| format!("failed to create {}", parent))?;
                }
                fs::write(&target, &data)
                    .wrap_err_with(|| format!("failed to write {}", target))?;
                set_file_mode(&target, executable)?;
            }
        }
    }
    Ok(())
}

enum UnpackKind {
    Directory,
    File { data: Vec<u8>, executable: bool },
}

/// An archive path must stay inside the extraction root: relative, no `..`,
/// at least one real segment.
fn validate_entry_path(path: &Utf8Path) -> Result<Utf8PathBuf> {
    if path.as_str().contains('\0') {
        bail!("archive path {} contains a NUL byte", path);
    }
    let mut rel = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::Normal(name) => rel.push(name),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                bail!("archive path {} would escape the extraction root", path)
            }
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                bail!("archive path {} is absolute", path)
            }
        }
    }
    if rel.as_str().is_empty() {
        bail!("archive path {} has no segments", path);
    }
    Ok(rel)
}

fn set_file_mode(target: &Utf8Path, executable: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { EXEC_MODE } else { FILE_MODE };
        fs::set_permissions(target, fs::Permissions::from_mode(mode))
            .wrap_err_with(|| format!("failed to set permissions on {}", target))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (target, executable);
    }
    Ok(())
}
