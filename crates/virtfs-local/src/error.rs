// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the local backend.
//!
//! Host-reported failures travel as `Io` and keep their errno. Policy
//! decisions (confinement violations, disallowed special files, operations a
//! security model rejects by design) are distinct variants so callers can
//! tell "the host rejected this" from "the backend rejects this".

use std::io;

/// Backend error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("path escapes export root")]
    PathEscape,
    #[error("special file disallowed")]
    SpecialFile,
    #[error("unsupported")]
    Unsupported,
    #[error("invalid security model: {0}")]
    InvalidSecurityModel(String),
}

pub type FsResult<T> = Result<T, FsError>;

/// Guest-visible errno values. Guests expect the Linux code space; hosts whose
/// native numbering differs must translate at this boundary. The names listed
/// here are the ones known to diverge across supported hosts.
pub mod wire {
    pub const ENAMETOOLONG: i32 = 36;
    pub const ENOTEMPTY: i32 = 39;
    pub const ELOOP: i32 = 40;
    /// `ENOATTR` on hosts that have it; Linux reports `ENODATA`.
    pub const ENODATA: i32 = 61;
    pub const EOPNOTSUPP: i32 = 95;
}

/// Translates a host errno into the guest's (Linux) errno space.
fn host_errno_to_wire(err: i32) -> i32 {
    match err {
        x if x == libc::ENAMETOOLONG => wire::ENAMETOOLONG,
        x if x == libc::ENOTEMPTY => wire::ENOTEMPTY,
        x if x == libc::ELOOP => wire::ELOOP,
        x if x == libc::ENODATA => wire::ENODATA,
        x if x == libc::EOPNOTSUPP => wire::EOPNOTSUPP,
        other => other,
    }
}

impl FsError {
    /// Captures `errno` left behind by a failed libc call.
    pub(crate) fn last_os() -> Self {
        FsError::Io(io::Error::last_os_error())
    }

    pub(crate) fn from_errno(code: i32) -> Self {
        FsError::Io(io::Error::from_raw_os_error(code))
    }

    /// Host errno carried by this error, if it came from the host.
    pub fn errno(&self) -> Option<i32> {
        match self {
            FsError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.errno() == Some(libc::ENOENT)
    }

    /// The errno a protocol frontend should report to the guest.
    pub fn wire_errno(&self) -> i32 {
        match self {
            FsError::Io(e) => host_errno_to_wire(e.raw_os_error().unwrap_or(libc::EIO)),
            FsError::PathEscape => libc::EACCES,
            FsError::SpecialFile => libc::ENXIO,
            FsError::Unsupported => wire::EOPNOTSUPP,
            FsError::InvalidSecurityModel(_) => libc::EINVAL,
        }
    }
}
