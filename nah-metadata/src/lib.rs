// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data model for NAH, the Native Application Host.
//!
//! This crate holds the host-owned record shapes (app install records, NAK
//! install records, host environment policy), the launch-contract envelope,
//! the warning/critical-error taxonomy, the environment-operation value, and
//! the SemVer range engine. It performs no I/O: loading, validation against
//! the filesystem, and composition live in the `nah` crate.

mod contract;
mod env_op;
mod host;
mod kit;
mod record;
mod version;
mod warning;

pub use contract::{
    AppView, CapabilityUsage, Enforcement, Envelope, ExecutionView, ExportEntry, LaunchContract,
    NakView, Trace, TraceEntry, TrustView, ENVELOPE_SCHEMA,
};
pub use env_op::EnvValue;
pub use host::{HostEnv, HostOverridePolicy, HostPaths};
pub use kit::{
    LoaderSpec, NakExecution, NakIdentity, NakInstallRecord, NakPaths, DEFAULT_LOADER,
    NAK_RECORD_SCHEMA,
};
pub use record::{
    AppIdentitySnapshot, AppInstallRecord, AppRecordPaths, ArgumentOverrides, InstallSection,
    NakPin, OverridesSection, PathOverrides, TrustSection, APP_RECORD_SCHEMA,
};
pub use version::{parse_core_version, CompOp, Comparator, KitVersionReq, ParseRangeError, RangeSet};
pub use warning::{CriticalError, Warning, WarningSink};
