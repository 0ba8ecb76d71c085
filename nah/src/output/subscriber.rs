// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tracing subscriber behind the CLI.
//!
//! nah distinguishes exactly two kinds of events: status lines emitted
//! through [`crate::output::status!`] (cargo-style, aligned, one per
//! completed operation) and diagnostics (everything else, shown from
//! `warning:` upward by default and in full under `-v`). `NAH_LOG` takes
//! over filtering entirely when set.

use colored::Colorize;
use std::fmt::{self, Write};
use tracing::{field::Field, level_filters::LevelFilter, Event, Level, Subscriber};
use tracing_subscriber::{
    field::Visit,
    filter::{FilterFn, Targets},
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    Layer, Registry,
};

use crate::output::OutputOpts;

static NAH_LOG_ENV: &str = "NAH_LOG";

/// Events tagged with this target are user-facing status lines.
pub(super) const STATUS_TARGET: &str = "nah::output::status";

impl OutputOpts {
    pub(super) fn make_subscriber(&self) {
        let registry = tracing_subscriber::registry();
        let quiet = self.quiet;

        let nah_log = std::env::var(NAH_LOG_ENV).ok().filter(|s| !s.is_empty());
        let layer: Box<dyn Layer<Registry> + Send + Sync> = if let Some(spec) = nah_log {
            let targets: Targets = spec.parse().expect("unable to parse NAH_LOG");
            Box::new(
                tracing_subscriber::fmt::layer()
                    .event_format(CliFormatter)
                    .with_writer(std::io::stderr)
                    .with_filter(targets),
            )
        } else if self.verbose >= 2 {
            // Full diagnostics for debugging nah itself.
            Box::new(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .pretty()
                    .with_filter(LevelFilter::DEBUG),
            )
        } else {
            let diagnostics = if quiet {
                LevelFilter::ERROR
            } else if self.verbose == 0 {
                LevelFilter::WARN
            } else {
                LevelFilter::DEBUG
            };
            let filter = FilterFn::new(move |metadata| {
                if !metadata.is_event() {
                    return false;
                }
                if metadata.target() == STATUS_TARGET {
                    return !quiet;
                }
                *metadata.level() <= diagnostics
            });
            Box::new(
                tracing_subscriber::fmt::layer()
                    .event_format(CliFormatter)
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
        };

        registry.with(layer).init();
    }
}

/// Renders status lines cargo-style and diagnostics with a level prefix.
struct CliFormatter;

impl<S, N> FormatEvent<S, N> for CliFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut f: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut message = String::new();
        event.record(&mut MessageBuffer {
            buffer: &mut message,
        });

        let level = *event.metadata().level();
        if event.metadata().target() == STATUS_TARGET && level == Level::INFO {
            // "Installed com.example.app v1.2.3": the leading verb is the
            // header, aligned the way Cargo aligns its own.
            let (header, rest) = message.split_once(' ').unwrap_or((message.as_str(), ""));
            writeln!(f, "{:>12} {}", header.bold().green(), rest)
        } else if level == Level::ERROR {
            writeln!(f, "{} {}", "error:".bold().red(), message)
        } else if level == Level::WARN {
            writeln!(f, "{} {}", "warning:".bold().yellow(), message)
        } else if level == Level::INFO {
            writeln!(f, "{} {}", "info:".bold().blue(), message)
        } else {
            writeln!(f, "{} {}", "debug:".bold(), message)
        }
    }
}

/// Collects the `message` field of an event into a plain string.
struct MessageBuffer<'a> {
    buffer: &'a mut String,
}

impl<'a> Visit for MessageBuffer<'a> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.buffer, "{:?}", value);
        }
    }
}
