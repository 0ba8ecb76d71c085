// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{bail, WrapErr},
    Result,
};
use home::home_dir;
use std::{env, fs, path::PathBuf};

/// A NAH root and its well-known subdirectories.
#[derive(Clone, Debug)]
pub struct NahState {
    root: Utf8PathBuf,
    apps_dir: Utf8PathBuf,
    naks_dir: Utf8PathBuf,
    host_file: Utf8PathBuf,
    app_registry_dir: Utf8PathBuf,
    nak_registry_dir: Utf8PathBuf,
    locks_dir: Utf8PathBuf,
}

impl NahState {
    /// Opens (and bootstraps) the root named by `NAH_ROOT`, falling back to
    /// `~/.nah`.
    pub fn discover() -> Result<Self> {
        Self::load_or_init_at(nah_root()?)
    }

    pub fn load_or_init_at(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        let state = Self {
            apps_dir: root.join("apps"),
            naks_dir: root.join("naks"),
            host_file: root.join("host").join("host.json"),
            app_registry_dir: root.join("registry").join("apps"),
            nak_registry_dir: root.join("registry").join("naks"),
            locks_dir: root.join("registry").join("locks"),
            root,
        };
        for dir in [
            &state.apps_dir,
            &state.naks_dir,
            &state.app_registry_dir,
            &state.nak_registry_dir,
            &state.locks_dir,
        ] {
            fs::create_dir_all(dir).wrap_err_with(|| format!("failed to create {}", dir))?;
        }
        let host_dir = state
            .host_file
            .parent()
            .expect("host file path has a parent");
        fs::create_dir_all(host_dir).wrap_err_with(|| format!("failed to create {}", host_dir))?;
        Ok(state)
    }

    #[inline]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    #[inline]
    pub fn apps_dir(&self) -> &Utf8Path {
        &self.apps_dir
    }

    #[inline]
    pub fn naks_dir(&self) -> &Utf8Path {
        &self.naks_dir
    }

    #[inline]
    pub fn host_file(&self) -> &Utf8Path {
        &self.host_file
    }

    #[inline]
    pub fn app_registry_dir(&self) -> &Utf8Path {
        &self.app_registry_dir
    }

    #[inline]
    pub fn nak_registry_dir(&self) -> &Utf8Path {
        &self.nak_registry_dir
    }

    #[inline]
    pub fn locks_dir(&self) -> &Utf8Path {
        &self.locks_dir
    }

    /// Destination tree for an installed app.
    pub fn app_tree(&self, id: &str, version: &str) -> Utf8PathBuf {
        self.apps_dir.join(format!("{}-{}", id, version))
    }

    /// Destination tree for an installed kit version.
    pub fn nak_tree(&self, id: &str, version: &str) -> Utf8PathBuf {
        self.naks_dir.join(id).join(version)
    }
}

pub(crate) fn nah_root() -> Result<Utf8PathBuf> {
    match env::var_os("NAH_ROOT") {
        Some(nah_root) => {
            let nah_root: Utf8PathBuf = PathBuf::from(nah_root)
                .try_into()
                .wrap_err("NAH_ROOT env var is not valid UTF-8")?;
            if nah_root.is_relative() {
                bail!("NAH_ROOT {} must be absolute", nah_root);
            }
            Ok(nah_root)
        },
        None => match home_dir() {
            Some(dir) => dir
                .join(".nah")
                .try_into()
                .wrap_err("home dir is not valid UTF-8"),
            None => bail!("user home directory could not be determined (use NAH_ROOT to set an explicit root for nah)")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bootstrap_creates_layout() {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().join("nah-root")).expect("utf-8");
        let state = NahState::load_or_init_at(root.clone()).expect("bootstraps");

        assert!(state.apps_dir().is_dir());
        assert!(state.naks_dir().is_dir());
        assert!(state.app_registry_dir().is_dir());
        assert!(state.nak_registry_dir().is_dir());
        assert!(state.locks_dir().is_dir());
        assert_eq!(
            state.app_tree("com.example.app", "1.2.3"),
            root.join("apps/com.example.app-1.2.3")
        );
        assert_eq!(
            state.nak_tree("com.example.nak", "3.1.2"),
            root.join("naks/com.example.nak/3.1.2")
        );
    }
}
