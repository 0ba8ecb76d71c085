// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Split a `<id>[@<version>]` specifier. The split is on the last `@` so ids
/// containing `@` still work with an explicit version.
pub(crate) fn split_spec(spec: &str) -> (String, Option<String>) {
    match spec.rsplit_once('@') {
        Some((id, version)) if !id.is_empty() && !version.is_empty() => {
            (id.to_owned(), Some(version.to_owned()))
        }
        _ => (spec.to_owned(), None),
    }
}
