// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Convenience formatters for nah data.

use colored::Colorize;
use std::fmt;

pub(crate) struct NameVersionDisplay<'a> {
    name: &'a str,
    version: &'a str,
}

impl<'a> NameVersionDisplay<'a> {
    pub(crate) fn new(name: &'a str, version: &'a str) -> Self {
        Self { name, version }
    }
}

impl<'a> fmt::Display for NameVersionDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name.magenta(), self.version)
    }
}
