// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! NAH, the Native Application Host: a launch-contract engine for native
//! applications.
//!
//! The workspace splits data from behavior: `nah-metadata` holds the record
//! and envelope shapes, this crate holds the TLV manifest decoder, path
//! safety, composition, the deterministic archive format, the registry, and
//! the install pipeline. The CLI here is a thin driver over those operations;
//! the single stable output contract is the launch-contract envelope.

use crate::{
    install::{InstallAppOpts, KitInstallReport},
    launch::LaunchQueryOpts,
    output::{status, NameVersionDisplay, OutputOpts},
    state::NahState,
};
use camino::Utf8PathBuf;
use color_eyre::{eyre::WrapErr, Result};
use structopt::StructOpt;
use tracing::warn;

pub mod archive;
pub mod compose;
pub mod expand;
mod helpers;
pub mod install;
pub mod launch;
pub mod manifest;
mod output;
pub mod pathsafe;
pub mod records;
pub mod registry;
pub mod state;

#[derive(Debug, StructOpt)]
pub struct App {
    #[structopt(flatten)]
    global_opts: GlobalOpts,

    #[structopt(subcommand)]
    command: Command,
}

impl App {
    pub fn exec(self) -> Result<i32> {
        self.global_opts.output.init_logger();
        self.command.exec(&self.global_opts)
    }
}

#[derive(Clone, Debug, StructOpt)]
struct GlobalOpts {
    /// NAH root to operate on (default: $NAH_ROOT, then ~/.nah)
    #[structopt(long, global = true)]
    root: Option<Utf8PathBuf>,

    #[structopt(flatten)]
    output: OutputOpts,
}

impl GlobalOpts {
    fn state(&self) -> Result<NahState> {
        match &self.root {
            Some(root) => NahState::load_or_init_at(root.clone()),
            None => NahState::discover(),
        }
    }
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Compute the launch contract for an installed app and print the
    /// envelope as JSON.
    LaunchQuery {
        /// App specifier: <id> or <id>@<version>
        app: String,
        /// JSON document whose environment section merges at the highest
        /// precedence, subject to host policy
        #[structopt(long)]
        overrides_file: Option<Utf8PathBuf>,
        /// Annotate every environment value with its source and precedence
        #[structopt(long)]
        trace: bool,
    },
    /// Install a .nap app package.
    InstallApp {
        package: Utf8PathBuf,
        /// Replace an existing install of the same id and version
        #[structopt(long)]
        force: bool,
        /// Complete the install even when no installed kit satisfies the
        /// manifest requirement
        #[structopt(long)]
        allow_unresolved: bool,
    },
    /// Install a .nak runtime-kit package.
    InstallKit {
        package: Utf8PathBuf,
        /// Replace an existing install of the same id and version
        #[structopt(long)]
        force: bool,
    },
    /// Remove an installed app and its record.
    UninstallApp {
        /// App specifier: <id> or <id>@<version>
        app: String,
    },
    /// Remove an installed kit version, unless an app still pins it.
    UninstallKit {
        /// Kit specifier: <id> or <id>@<version>
        kit: String,
    },
    /// Re-check an installed app without mutating anything.
    Verify {
        /// App specifier: <id> or <id>@<version>
        app: String,
    },
    /// Pack a directory tree into a deterministic package.
    Pack {
        dir: Utf8PathBuf,
        output: Utf8PathBuf,
    },
}

impl Command {
    fn exec(self, global_opts: &GlobalOpts) -> Result<i32> {
        match self {
            Command::LaunchQuery {
                app,
                overrides_file,
                trace,
            } => {
                let state = global_opts.state()?;
                let envelope = launch::launch_query(
                    &state,
                    &app,
                    overrides_file.as_deref(),
                    &LaunchQueryOpts { with_trace: trace },
                )?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&envelope)
                        .wrap_err("failed to serialize envelope")?
                );
                Ok(envelope.exit_code())
            }
            Command::InstallApp {
                package,
                force,
                allow_unresolved,
            } => {
                let state = global_opts.state()?;
                let report = install::install_app(
                    &state,
                    &package,
                    &InstallAppOpts {
                        force,
                        allow_unresolved,
                    },
                )?;
                for warning in &report.warnings {
                    warn!("{}", warning);
                }
                status!(
                    "Installed {}",
                    NameVersionDisplay::new(&report.id, &report.version)
                );
                Ok(0)
            }
            Command::InstallKit { package, force } => {
                let state = global_opts.state()?;
                let KitInstallReport { id, version, .. } =
                    install::install_kit(&state, &package, force)?;
                status!("Installed {}", NameVersionDisplay::new(&id, &version));
                Ok(0)
            }
            Command::UninstallApp { app } => {
                let state = global_opts.state()?;
                let (id, version) = helpers::split_spec(&app);
                install::uninstall_app(&state, &id, version.as_deref())?;
                Ok(0)
            }
            Command::UninstallKit { kit } => {
                let state = global_opts.state()?;
                let (id, version) = helpers::split_spec(&kit);
                install::uninstall_kit(&state, &id, version.as_deref())?;
                Ok(0)
            }
            Command::Verify { app } => {
                let state = global_opts.state()?;
                let (id, version) = helpers::split_spec(&app);
                let report = install::verify_app(&state, &id, version.as_deref())?;
                for warning in &report.warnings {
                    warn!("{}", warning);
                }
                for issue in &report.issues {
                    warn!("{}", issue);
                }
                if report.is_clean() {
                    status!("Verified {}", app);
                    Ok(0)
                } else {
                    Ok(1)
                }
            }
            Command::Pack { dir, output } => {
                let bytes = archive::pack(&dir)?;
                registry::write_bytes_atomic(&output, &bytes)?;
                status!("Packed {} into {}", dir, output);
                Ok(0)
            }
        }
    }
}
