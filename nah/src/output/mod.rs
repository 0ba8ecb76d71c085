// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI output: user-facing status lines vs. diagnostics.
//!
//! Operations report completion through [`status!`], which the subscriber
//! renders as an aligned, colored line. Plain `tracing` events are
//! diagnostics and only surface from `warning:` upward unless `-v` or
//! `NAH_LOG` asks for more.

mod formatters;
mod subscriber;

pub(crate) use formatters::*;

use structopt::StructOpt;

/// Emits a user-facing status line, e.g. `status!("Installed {}", display)`.
/// The first word becomes the aligned header.
macro_rules! status {
    ($($arg:tt)*) => {
        ::tracing::info!(target: "nah::output::status", $($arg)*)
    };
}
pub(crate) use status;

#[derive(Copy, Clone, Debug, StructOpt)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Suppress status output
    #[structopt(short, long, global = true, conflicts_with = "verbose")]
    pub(crate) quiet: bool,

    /// Print diagnostic output (repeat for more detail)
    #[structopt(short, long, global = true, parse(from_occurrences))]
    pub(crate) verbose: usize,

    /// When to color output
    #[structopt(
        long,
        global = true,
        default_value = "auto",
        possible_values = &["auto", "always", "never"],
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    pub(crate) fn init_logger(&self) {
        self.make_subscriber();
        match self.color {
            Color::Auto => colored::control::unset_override(),
            Color::Always => colored::control::set_override(true),
            Color::Never => colored::control::set_override(false),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Color {
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Color::Auto),
            "always" => Ok(Color::Always),
            "never" => Ok(Color::Never),
            other => Err(format!("unrecognized color setting '{}'", other)),
        }
    }
}
