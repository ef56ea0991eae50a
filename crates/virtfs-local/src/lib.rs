// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Local filesystem backend for a guest/host shared-folder export.
//!
//! Maps filesystem operations issued on behalf of a guest onto a single
//! confined directory tree on the host, emulating guest-visible
//! ownership/mode/device metadata that the host process may be unable to set
//! directly (unprivileged hosting, or guests expecting uid/gid/rdev values the
//! host filesystem cannot store natively).
//!
//! Four security models decide where that metadata lives:
//!
//! - `passthrough`: host ownership/mode calls must succeed as-is.
//! - `mapped` (alias `mapped-xattr`): credentials are stored in reserved
//!   `user.virtfs.*` extended attributes and overlaid onto stat results.
//! - `mapped-file`: credentials are stored in per-directory
//!   `.virtfs_metadata` record files, for hosts without xattr support.
//! - `none`: best-effort; ownership failures are swallowed.
//!
//! All operations are synchronous and reentrant; the backend holds no mutable
//! shared state beyond the read-only export context. Concurrency and retry
//! policy belong to the caller.

#[cfg(not(target_os = "linux"))]
compile_error!("virtfs-local requires a Linux host");

pub mod error;
mod model;
mod resolve;
pub mod shadow;
pub mod types;
pub mod vfs;
pub mod xattr;

pub use error::{FsError, FsResult};
pub use types::{
    Credential, DirEntry, ExportConfig, FileStat, FsStatFs, SecurityModel, SetTimes, TimeSet,
};
pub use vfs::{LocalFs, OpenHandle};
