// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-pass placeholder expansion.
//!
//! Placeholders are exact `{NAME}` tokens with `NAME` in `[A-Za-z0-9_]+`.
//! Expansion runs once against a snapshot: `{…}` substrings produced by a
//! substitution are not re-expanded. A missing key substitutes the empty
//! string and warns; the per-string limits (128 placeholders, 64 KiB output)
//! empty the whole string and warn.

use nah_metadata::{Warning, WarningSink};
use std::collections::BTreeMap;

pub const MAX_PLACEHOLDERS: usize = 128;
pub const MAX_EXPANDED_LEN: usize = 64 * 1024;

/// Expands `input` against `snapshot`. `source_path` names what is being
/// expanded in any warning this emits.
pub fn expand(
    input: &str,
    snapshot: &BTreeMap<String, String>,
    source_path: &str,
    sink: &mut WarningSink,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut placeholders = 0usize;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) if is_placeholder_name(&after_open[..close]) => {
                let name = &after_open[..close];
                placeholders += 1;
                if placeholders > MAX_PLACEHOLDERS {
                    sink.push(Warning::InvalidConfiguration {
                        reason: "placeholder_limit".to_owned(),
                        detail: source_path.to_owned(),
                    });
                    return String::new();
                }
                match snapshot.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        sink.push(Warning::MissingEnvVar {
                            missing: name.to_owned(),
                            source_path: source_path.to_owned(),
                        });
                    }
                }
                rest = &after_open[close + 1..];
            }
            _ => {
                // Not a placeholder: emit the brace literally and move on.
                out.push('{');
                rest = after_open;
            }
        }
        if out.len() > MAX_EXPANDED_LEN {
            sink.push(Warning::InvalidConfiguration {
                reason: "expansion_overflow".to_owned(),
                detail: source_path.to_owned(),
            });
            return String::new();
        }
    }
    out.push_str(rest);

    if out.len() > MAX_EXPANDED_LEN {
        sink.push(Warning::InvalidConfiguration {
            reason: "expansion_overflow".to_owned(),
            detail: source_path.to_owned(),
        });
        return String::new();
    }
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
