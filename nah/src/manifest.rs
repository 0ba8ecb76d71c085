// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The binary app manifest: a TLV blob embedded in a binary section or stored
//! as `manifest.nah` at the install root.
//!
//! Decoding is permissive wherever it can be: a CRC failure (or a blob too
//! short to carry the header) is the only fatal outcome, because a blob that
//! fails its checksum cannot be trusted at all. Everything else degrades to
//! field-scoped `invalid_manifest` warnings and the affected entries are
//! dropped.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::WrapErr, Result};
use nah_metadata::{KitVersionReq, Warning, WarningSink};
use std::{error, fmt, fs, io};

pub const MANIFEST_MAGIC: [u8; 4] = *b"NAHM";
pub const MANIFEST_HEADER_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 16;
pub const MAX_MANIFEST_SIZE: usize = 64 * 1024;
pub const MAX_ENTRIES: usize = 512;
pub const MAX_STRING_LEN: usize = 4096;
pub const MAX_REPEATS: usize = 128;

/// Manifest file name looked up at an install root when no embedded section
/// is found.
pub const MANIFEST_FILE_NAME: &str = "manifest.nah";

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        /// Mach-O section holding the embedded manifest.
        pub const MANIFEST_SECTION: &str = "__NAH,__manifest";
    } else if #[cfg(windows)] {
        /// PE section holding the embedded manifest.
        pub const MANIFEST_SECTION: &str = ".nah";
    } else {
        /// ELF section holding the embedded manifest.
        pub const MANIFEST_SECTION: &str = ".nah_manifest";
    }
}

pub mod tag {
    pub const END: u16 = 0;
    pub const SCHEMA_VERSION: u16 = 1;
    pub const APP_ID: u16 = 2;
    pub const APP_VERSION: u16 = 3;
    pub const NAK_ID: u16 = 4;
    pub const NAK_VERSION_REQ: u16 = 5;
    pub const ENTRYPOINT_PATH: u16 = 6;
    pub const ENTRYPOINT_ARG: u16 = 7;
    pub const ENV_VAR: u16 = 8;
    pub const LIB_DIR: u16 = 9;
    pub const ASSET_DIR: u16 = 10;
    pub const ASSET_EXPORT: u16 = 11;
    pub const PERMISSION_FILESYSTEM: u16 = 12;
    pub const PERMISSION_NETWORK: u16 = 13;
    pub const DESCRIPTION: u16 = 14;
    pub const AUTHOR: u16 = 15;
    pub const LICENSE: u16 = 16;
    pub const HOMEPAGE: u16 = 17;
}

/// The decoded manifest. Identity fields stay `None` when the corresponding
/// entry was absent or invalid; composition decides what that means.
#[derive(Clone, Debug, Default)]
pub struct AppManifest {
    pub id: Option<String>,
    pub version: Option<String>,
    pub nak_id: Option<String>,
    pub nak_version_req: Option<KitVersionReq>,
    pub entrypoint: Option<String>,
    pub entrypoint_args: Vec<String>,
    pub env_defaults: Vec<(String, String)>,
    pub lib_dirs: Vec<String>,
    pub asset_dirs: Vec<String>,
    pub asset_exports: Vec<AssetExport>,
    pub permissions_filesystem: Vec<String>,
    pub permissions_network: Vec<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
}

impl AppManifest {
    /// True if the manifest names a runtime kit.
    pub fn requires_kit(&self) -> bool {
        self.nak_id.as_deref().map_or(false, |id| !id.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetExport {
    pub id: String,
    pub relpath: String,
    pub kind: Option<String>,
}

/// The blob cannot be trusted at all. Callers surface `MANIFEST_MISSING`.
#[derive(Debug)]
pub enum FatalManifestError {
    TooShort { len: usize },
    BadMagic,
    CrcMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for FatalManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalManifestError::TooShort { len } => {
                write!(f, "manifest blob is {} bytes, shorter than the header", len)
            }
            FatalManifestError::BadMagic => write!(f, "manifest magic mismatch"),
            FatalManifestError::CrcMismatch { expected, actual } => write!(
                f,
                "manifest CRC mismatch (header {:08x}, payload {:08x})",
                expected, actual
            ),
        }
    }
}

impl error::Error for FatalManifestError {}

/// Decodes a manifest blob, accumulating `invalid_manifest` warnings for
/// recoverable issues.
pub fn decode(bytes: &[u8], sink: &mut WarningSink) -> Result<AppManifest, FatalManifestError> {
    if bytes.len() < HEADER_LEN {
        return Err(FatalManifestError::TooShort { len: bytes.len() });
    }
    if bytes[0..4] != MANIFEST_MAGIC {
        return Err(FatalManifestError::BadMagic);
    }
    let header_version = u16::from_le_bytes([bytes[4], bytes[5]]);
    let total_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

    let actual_crc = crc32fast::hash(&bytes[HEADER_LEN..]);
    if actual_crc != expected_crc {
        return Err(FatalManifestError::CrcMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    if header_version != MANIFEST_HEADER_VERSION {
        sink.push(invalid(format!(
            "unsupported manifest header version {}",
            header_version
        )));
    }
    if total_size != bytes.len() {
        sink.push(invalid(format!(
            "manifest total size {} does not match blob size {}",
            total_size,
            bytes.len()
        )));
        return Ok(AppManifest::default());
    }
    if bytes.len() > MAX_MANIFEST_SIZE {
        sink.push(invalid(format!(
            "manifest is {} bytes, above the 64 KiB limit",
            bytes.len()
        )));
        return Ok(AppManifest::default());
    }

    let mut decoder = Decoder {
        manifest: AppManifest::default(),
        sink,
        prev_tag: None,
        repeat_counts: [0usize; REPEATABLE_TAGS.len()],
    };
    decoder.run(&bytes[HEADER_LEN..]);
    Ok(decoder.manifest)
}

const REPEATABLE_TAGS: [u16; 7] = [
    tag::ENTRYPOINT_ARG,
    tag::ENV_VAR,
    tag::LIB_DIR,
    tag::ASSET_DIR,
    tag::ASSET_EXPORT,
    tag::PERMISSION_FILESYSTEM,
    tag::PERMISSION_NETWORK,
];

fn invalid(detail: String) -> Warning {
    Warning::InvalidManifest { detail }
}

struct Decoder<'a> {
    manifest: AppManifest,
    sink: &'a mut WarningSink,
    prev_tag: Option<u16>,
    repeat_counts: [usize; REPEATABLE_TAGS.len()],
}

impl<'a> Decoder<'a> {
    fn run(&mut self, mut payload: &[u8]) {
        let mut accepted = 0usize;
        loop {
            if payload.is_empty() {
                return;
            }
            if payload.len() < 4 {
                self.warn("truncated entry header".to_owned());
                return;
            }
            let entry_tag = u16::from_le_bytes([payload[0], payload[1]]);
            let len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
            if payload.len() < 4 + len {
                self.warn(format!(
                    "entry with tag {} claims {} bytes but only {} remain",
                    entry_tag,
                    len,
                    payload.len() - 4
                ));
                return;
            }
            let value = &payload[4..4 + len];
            payload = &payload[4 + len..];

            // END is exempt from the ascending-order rule: it is the lowest
            // tag but must come last.
            if entry_tag == tag::END {
                if len != 0 {
                    self.warn(format!("END tag carries {} bytes", len));
                    continue;
                }
                if !payload.is_empty() {
                    self.warn("END tag is not the final entry".to_owned());
                    continue;
                }
                return;
            }

            if accepted >= MAX_ENTRIES {
                self.warn(format!("entry count exceeds {}", MAX_ENTRIES));
                return;
            }

            if let Some(prev) = self.prev_tag {
                if entry_tag < prev {
                    self.warn(format!("tag {} appears after tag {}", entry_tag, prev));
                    continue;
                }
            }

            if len > MAX_STRING_LEN {
                self.warn(format!(
                    "entry with tag {} is {} bytes, above the {}-byte limit",
                    entry_tag, len, MAX_STRING_LEN
                ));
                // Counts toward ordering so a follow-up duplicate still warns.
                self.prev_tag = Some(entry_tag);
                accepted += 1;
                continue;
            }

            self.accept(entry_tag, value);
            self.prev_tag = Some(entry_tag);
            accepted += 1;
        }
    }

    fn warn(&mut self, detail: String) {
        self.sink.push(invalid(detail));
    }

    fn accept(&mut self, entry_tag: u16, value: &[u8]) {
        if let Some(slot) = REPEATABLE_TAGS.iter().position(|&t| t == entry_tag) {
            if self.repeat_counts[slot] >= MAX_REPEATS {
                self.warn(format!(
                    "tag {} repeated more than {} times",
                    entry_tag, MAX_REPEATS
                ));
                return;
            }
            if self.accept_repeatable(entry_tag, value) {
                self.repeat_counts[slot] += 1;
            }
            return;
        }
        self.accept_singular(entry_tag, value);
    }

    /// Returns true if the entry was actually stored.
    fn accept_repeatable(&mut self, entry_tag: u16, value: &[u8]) -> bool {
        match entry_tag {
            tag::ENTRYPOINT_ARG => match self.string_value(entry_tag, value) {
                Some(arg) => {
                    self.manifest.entrypoint_args.push(arg);
                    true
                }
                None => false,
            },
            tag::ENV_VAR => match self.string_value(entry_tag, value) {
                Some(pair) => match pair.split_once('=') {
                    Some((key, val)) if !key.is_empty() => {
                        self.manifest
                            .env_defaults
                            .push((key.to_owned(), val.to_owned()));
                        true
                    }
                    _ => {
                        self.warn(format!("ENV_VAR entry '{}' is not KEY=VALUE", pair));
                        false
                    }
                },
                None => false,
            },
            tag::LIB_DIR => match self.relative_path_value(entry_tag, value, "LIB_DIR") {
                Some(dir) => {
                    self.manifest.lib_dirs.push(dir);
                    true
                }
                None => false,
            },
            tag::ASSET_DIR => match self.relative_path_value(entry_tag, value, "ASSET_DIR") {
                Some(dir) => {
                    self.manifest.asset_dirs.push(dir);
                    true
                }
                None => false,
            },
            tag::ASSET_EXPORT => match self.string_value(entry_tag, value) {
                Some(spec) => match parse_asset_export(&spec) {
                    Some(export) => {
                        self.manifest.asset_exports.push(export);
                        true
                    }
                    None => {
                        self.warn(format!(
                            "ASSET_EXPORT entry '{}' is not id:relpath[:type]",
                            spec
                        ));
                        false
                    }
                },
                None => false,
            },
            tag::PERMISSION_FILESYSTEM => match self.string_value(entry_tag, value) {
                Some(entry) => {
                    self.manifest.permissions_filesystem.push(entry);
                    true
                }
                None => false,
            },
            tag::PERMISSION_NETWORK => match self.string_value(entry_tag, value) {
                Some(entry) => {
                    self.manifest.permissions_network.push(entry);
                    true
                }
                None => false,
            },
            _ => unreachable!("tag {} is not repeatable", entry_tag),
        }
    }

    fn accept_singular(&mut self, entry_tag: u16, value: &[u8]) {
        match entry_tag {
            tag::SCHEMA_VERSION => {
                let ok = value.len() == 2
                    && u16::from_le_bytes([value[0], value[1]]) == MANIFEST_HEADER_VERSION;
                if !ok {
                    self.warn("SCHEMA_VERSION is not the supported value 1".to_owned());
                }
            }
            tag::APP_ID => self.set_singular(entry_tag, value, |m| &mut m.id),
            tag::APP_VERSION => self.set_singular(entry_tag, value, |m| &mut m.version),
            tag::NAK_ID => self.set_singular(entry_tag, value, |m| &mut m.nak_id),
            tag::NAK_VERSION_REQ => {
                if self.manifest.nak_version_req.is_some() {
                    self.warn(format!("tag {} appears more than once", entry_tag));
                    return;
                }
                if let Some(req) = self.string_value(entry_tag, value) {
                    self.manifest.nak_version_req = Some(KitVersionReq::new(req));
                }
            }
            tag::ENTRYPOINT_PATH => {
                if self.manifest.entrypoint.is_some() {
                    self.warn(format!("tag {} appears more than once", entry_tag));
                    return;
                }
                if let Some(path) = self.relative_path_value(entry_tag, value, "ENTRYPOINT_PATH") {
                    self.manifest.entrypoint = Some(path);
                }
            }
            tag::DESCRIPTION => self.set_singular(entry_tag, value, |m| &mut m.description),
            tag::AUTHOR => self.set_singular(entry_tag, value, |m| &mut m.author),
            tag::LICENSE => self.set_singular(entry_tag, value, |m| &mut m.license),
            tag::HOMEPAGE => self.set_singular(entry_tag, value, |m| &mut m.homepage),
            unknown => {
                // Unknown tags are skipped so newer manifests still load.
                self.warn(format!("unknown tag {}", unknown));
            }
        }
    }

    fn set_singular(
        &mut self,
        entry_tag: u16,
        value: &[u8],
        field: fn(&mut AppManifest) -> &mut Option<String>,
    ) {
        if field(&mut self.manifest).is_some() {
            self.warn(format!("tag {} appears more than once", entry_tag));
            return;
        }
        if let Some(string) = self.string_value(entry_tag, value) {
            *field(&mut self.manifest) = Some(string);
        }
    }

    fn string_value(&mut self, entry_tag: u16, value: &[u8]) -> Option<String> {
        match std::str::from_utf8(value) {
            Ok(s) if !s.contains('\0') => Some(s.to_owned()),
            Ok(_) => {
                self.warn(format!("entry with tag {} contains a NUL byte", entry_tag));
                None
            }
            Err(_) => {
                self.warn(format!("entry with tag {} is not valid UTF-8", entry_tag));
                None
            }
        }
    }

    fn relative_path_value(&mut self, entry_tag: u16, value: &[u8], name: &str) -> Option<String> {
        let path = self.string_value(entry_tag, value)?;
        if path.is_empty() {
            self.warn(format!("{} entry is empty", name));
            return None;
        }
        if Utf8Path::new(&path).is_absolute() {
            self.warn(format!("{} entry '{}' must be relative", name, path));
            return None;
        }
        Some(path)
    }
}

fn parse_asset_export(spec: &str) -> Option<AssetExport> {
    let mut parts = spec.splitn(3, ':');
    let id = parts.next()?.to_owned();
    let relpath = parts.next()?.to_owned();
    let kind = parts.next().map(str::to_owned);
    if id.is_empty() || relpath.is_empty() || Utf8Path::new(&relpath).is_absolute() {
        return None;
    }
    if kind.as_deref() == Some("") {
        return None;
    }
    Some(AssetExport { id, relpath, kind })
}

/// Reads the bytes of a named section out of a binary. The real readers
/// (ELF/Mach-O/PE) are external collaborators; the engine depends only on
/// this seam.
pub trait SectionReader {
    fn read_section(&self, binary: &Utf8Path, section: &str) -> Option<Vec<u8>>;
}

/// A reader that never finds a section, so lookup falls through to
/// `manifest.nah`.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoSectionReader;

impl SectionReader for NoSectionReader {
    fn read_section(&self, _binary: &Utf8Path, _section: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Locates the manifest blob for an app tree: an embedded section in any
/// binary under `bin/` (scanned in name order) wins over `manifest.nah` at
/// the root.
pub fn locate(root: &Utf8Path, reader: &dyn SectionReader) -> Result<Option<Vec<u8>>> {
    let bin_dir = root.join("bin");
    if bin_dir.is_dir() {
        let mut binaries = Vec::new();
        for entry in bin_dir
            .read_dir_utf8()
            .wrap_err_with(|| format!("failed to list {}", bin_dir))?
        {
            let entry = entry.wrap_err_with(|| format!("failed to list {}", bin_dir))?;
            if entry.file_type().map_or(false, |t| t.is_file()) {
                binaries.push(entry.path().to_path_buf());
            }
        }
        binaries.sort();
        for binary in &binaries {
            if let Some(blob) = reader.read_section(binary, MANIFEST_SECTION) {
                return Ok(Some(blob));
            }
        }
    }

    let manifest_path = root.join(MANIFEST_FILE_NAME);
    match fs::read(&manifest_path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).wrap_err_with(|| format!("failed to read manifest at {}", manifest_path))
        }
    }
}

/// Builds manifest blobs. The production authoring tool lives with the app
/// build; this encoder backs fixtures and kit tooling.
#[derive(Clone, Debug, Default)]
pub struct ManifestEncoder {
    entries: Vec<(u16, Vec<u8>)>,
}

impl ManifestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry_tag: u16, value: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push((entry_tag, value.into()));
        self
    }

    pub fn push_str(&mut self, entry_tag: u16, value: &str) -> &mut Self {
        self.push(entry_tag, value.as_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (entry_tag, value) in &self.entries {
            payload.extend_from_slice(&entry_tag.to_le_bytes());
            payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
            payload.extend_from_slice(value);
        }
        let total = (HEADER_LEN + payload.len()) as u32;
        let crc = crc32fast::hash(&payload);

        let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
        blob.extend_from_slice(&MANIFEST_MAGIC);
        blob.extend_from_slice(&MANIFEST_HEADER_VERSION.to_le_bytes());
        blob.extend_from_slice(&0u16.to_le_bytes());
        blob.extend_from_slice(&total.to_le_bytes());
        blob.extend_from_slice(&crc.to_le_bytes());
        blob.extend_from_slice(&payload);
        blob
    }
}

/// Convenience for fixtures: encodes the fields of a decoded manifest.
pub fn encode_manifest(manifest: &AppManifest) -> Vec<u8> {
    let mut encoder = ManifestEncoder::new();
    encoder.push(tag::SCHEMA_VERSION, 1u16.to_le_bytes().to_vec());
    if let Some(id) = &manifest.id {
        encoder.push_str(tag::APP_ID, id);
    }
    if let Some(version) = &manifest.version {
        encoder.push_str(tag::APP_VERSION, version);
    }
    if let Some(nak_id) = &manifest.nak_id {
        encoder.push_str(tag::NAK_ID, nak_id);
    }
    if let Some(req) = &manifest.nak_version_req {
        encoder.push_str(tag::NAK_VERSION_REQ, req.as_str());
    }
    if let Some(entrypoint) = &manifest.entrypoint {
        encoder.push_str(tag::ENTRYPOINT_PATH, entrypoint);
    }
    for arg in &manifest.entrypoint_args {
        encoder.push_str(tag::ENTRYPOINT_ARG, arg);
    }
    for (key, value) in &manifest.env_defaults {
        encoder.push_str(tag::ENV_VAR, &format!("{}={}", key, value));
    }
    for dir in &manifest.lib_dirs {
        encoder.push_str(tag::LIB_DIR, dir);
    }
    for dir in &manifest.asset_dirs {
        encoder.push_str(tag::ASSET_DIR, dir);
    }
    for export in &manifest.asset_exports {
        let spec = match &export.kind {
            Some(kind) => format!("{}:{}:{}", export.id, export.relpath, kind),
            None => format!("{}:{}", export.id, export.relpath),
        };
        encoder.push_str(tag::ASSET_EXPORT, &spec);
    }
    for entry in &manifest.permissions_filesystem {
        encoder.push_str(tag::PERMISSION_FILESYSTEM, entry);
    }
    for entry in &manifest.permissions_network {
        encoder.push_str(tag::PERMISSION_NETWORK, entry);
    }
    if let Some(description) = &manifest.description {
        encoder.push_str(tag::DESCRIPTION, description);
    }
    if let Some(author) = &manifest.author {
        encoder.push_str(tag::AUTHOR, author);
    }
    if let Some(license) = &manifest.license {
        encoder.push_str(tag::LICENSE, license);
    }
    if let Some(homepage) = &manifest.homepage {
        encoder.push_str(tag::HOMEPAGE, homepage);
    }
    encoder.push(tag::END, Vec::new());
    encoder.encode()
}

/// Writes a manifest blob to `<root>/manifest.nah`.
pub fn write_manifest_file(root: &Utf8Path, manifest: &AppManifest) -> Result<Utf8PathBuf> {
    let path = root.join(MANIFEST_FILE_NAME);
    fs::write(&path, encode_manifest(manifest))
        .wrap_err_with(|| format!("failed to write manifest at {}", path))?;
    Ok(path)
}
