// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symlink-refusing, containment-checked path resolution.
//!
//! Every path that reaches the composer from an untrusted input goes through
//! one of the two primitives here. Violations map to the `PATH_TRAVERSAL`
//! critical error; there is no permissive fallback.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::{error, fmt, fs, io};

/// Resolves `relative` under `root`, refusing NUL bytes, absolute inputs,
/// `..` escapes, and any symlink along the way.
///
/// Components that do not exist yet are fine; only components that exist and
/// are symlinks are refused.
pub fn resolve_under(root: &Utf8Path, relative: &str) -> Result<Utf8PathBuf, PathError> {
    if relative.contains('\0') {
        return Err(PathError::new(relative, PathErrorKind::NulByte));
    }
    let rel_path = Utf8Path::new(relative);
    if rel_path.is_absolute() {
        return Err(PathError::new(relative, PathErrorKind::AbsoluteInput));
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in rel_path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if depth == 0 {
                    return Err(PathError::new(relative, PathErrorKind::EscapesRoot));
                }
                resolved.pop();
                depth -= 1;
            }
            Utf8Component::Normal(name) => {
                resolved.push(name);
                depth += 1;
                refuse_symlink(&resolved, relative)?;
            }
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err(PathError::new(relative, PathErrorKind::AbsoluteInput));
            }
        }
    }
    if depth == 0 {
        return Err(PathError::new(relative, PathErrorKind::EmptyPath));
    }
    Ok(resolved)
}

/// Verifies that a persisted absolute path is a descendant of `root`:
/// lexically normalized, then symlink-checked on every component below the
/// root. Returns the normalized path.
pub fn contain_absolute(root: &Utf8Path, path: &Utf8Path) -> Result<Utf8PathBuf, PathError> {
    if path.as_str().contains('\0') {
        return Err(PathError::new(path.as_str(), PathErrorKind::NulByte));
    }
    if !path.is_absolute() {
        return Err(PathError::new(path.as_str(), PathErrorKind::RelativeInput));
    }

    let normalized = normalize(path);
    let root = normalize(root);
    let remainder = match normalized.strip_prefix(&root) {
        Ok(remainder) => remainder,
        Err(_) => return Err(PathError::new(path.as_str(), PathErrorKind::EscapesRoot)),
    };

    let mut probe = root;
    for component in remainder.components() {
        if let Utf8Component::Normal(name) = component {
            probe.push(name);
            refuse_symlink(&probe, path.as_str())?;
        }
    }
    Ok(normalized)
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem. `..` at the root stays at the root.
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if out
                    .components()
                    .last()
                    .map_or(false, |c| matches!(c, Utf8Component::Normal(_)))
                {
                    out.pop();
                }
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

fn refuse_symlink(candidate: &Utf8Path, original: &str) -> Result<(), PathError> {
    match fs::symlink_metadata(candidate) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            Err(PathError::new(original, PathErrorKind::SymlinkComponent))
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PathError {
            path: original.to_owned(),
            kind: PathErrorKind::Io(err.kind()),
        }),
    }
}

#[derive(Debug)]
pub struct PathError {
    path: String,
    kind: PathErrorKind,
}

#[derive(Debug)]
pub enum PathErrorKind {
    NulByte,
    AbsoluteInput,
    RelativeInput,
    EscapesRoot,
    EmptyPath,
    SymlinkComponent,
    Io(io::ErrorKind),
}

impl PathError {
    fn new(path: &str, kind: PathErrorKind) -> Self {
        Self {
            path: path.to_owned(),
            kind,
        }
    }

    pub fn kind(&self) -> &PathErrorKind {
        &self.kind
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match &self.kind {
            PathErrorKind::NulByte => "contains a NUL byte",
            PathErrorKind::AbsoluteInput => "must be relative",
            PathErrorKind::RelativeInput => "must be absolute",
            PathErrorKind::EscapesRoot => "escapes its containment root",
            PathErrorKind::EmptyPath => "has no path segments",
            PathErrorKind::SymlinkComponent => "crosses a symlink",
            PathErrorKind::Io(kind) => return write!(f, "could not check '{}': {:?}", self.path, kind),
        };
        write!(f, "path '{}' {}", self.path, reason)
    }
}

impl error::Error for PathError {}
