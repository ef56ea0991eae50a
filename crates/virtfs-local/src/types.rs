// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the local backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{FsError, FsResult};

/// Security model governing how emulated ownership metadata is stored.
///
/// Selected once at export initialization and fixed for the export's
/// lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityModel {
    /// Host ownership/mode calls must succeed; failures surface.
    Passthrough,
    /// Credentials stored in reserved `user.virtfs.*` extended attributes.
    #[serde(alias = "mapped-xattr")]
    Mapped,
    /// Credentials stored in per-directory `.virtfs_metadata` record files.
    MappedFile,
    /// Best-effort: ownership failures are swallowed, mode failures are not.
    None,
}

impl FromStr for SecurityModel {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passthrough" => Ok(SecurityModel::Passthrough),
            "mapped" | "mapped-xattr" => Ok(SecurityModel::Mapped),
            "mapped-file" => Ok(SecurityModel::MappedFile),
            "none" => Ok(SecurityModel::None),
            other => Err(FsError::InvalidSecurityModel(other.to_string())),
        }
    }
}

impl std::fmt::Display for SecurityModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityModel::Passthrough => "passthrough",
            SecurityModel::Mapped => "mapped",
            SecurityModel::MappedFile => "mapped-file",
            SecurityModel::None => "none",
        };
        f.write_str(s)
    }
}

/// Export configuration: the confined root tree and the active model.
///
/// Missing or unrecognized fields are a hard error before any host resource
/// is touched.
#[derive(Clone, Debug, Deserialize)]
pub struct ExportConfig {
    pub root: PathBuf,
    pub security_model: SecurityModel,
}

impl ExportConfig {
    pub fn new(root: impl Into<PathBuf>, security_model: SecurityModel) -> Self {
        Self {
            root: root.into(),
            security_model,
        }
    }

    pub(crate) fn validate(&self) -> FsResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(FsError::from_errno(libc::EINVAL));
        }
        Ok(())
    }
}

/// Emulated ownership/mode/device tuple a caller wants associated with an
/// object. Each field is independently present or absent; absence is
/// distinguishable from a legitimate value of 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credential {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub rdev: Option<u64>,
}

/// Typed snapshot of a host `stat` result, after any metadata overlay.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
}

impl FileStat {
    pub(crate) fn from_host(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            rdev: st.st_rdev as u64,
            size: st.st_size as i64,
            blksize: st.st_blksize as i64,
            blocks: st.st_blocks as i64,
            atime_sec: st.st_atime as i64,
            atime_nsec: st.st_atime_nsec as i64,
            mtime_sec: st.st_mtime as i64,
            mtime_nsec: st.st_mtime_nsec as i64,
            ctime_sec: st.st_ctime as i64,
            ctime_nsec: st.st_ctime_nsec as i64,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// Permission bits only (suid/sgid/sticky included).
    pub fn mode_bits(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Typed snapshot of a host `statfs` result.
#[derive(Clone, Copy, Debug)]
pub struct FsStatFs {
    pub bsize: i64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: i64,
}

impl FsStatFs {
    pub(crate) fn from_host(st: &libc::statfs) -> Self {
        Self {
            bsize: st.f_bsize as i64,
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            namelen: st.f_namelen as i64,
        }
    }
}

/// One directory-stream entry. `off` is the opaque stream position usable
/// with `seekdir`.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub off: i64,
}

/// One timestamp slot for `set_times`: explicitly absent, "now", or a
/// concrete time. Replaces the UTIME_OMIT/UTIME_NOW magic at the API
/// boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeSet {
    Omit,
    Now,
    At { sec: i64, nsec: i64 },
}

impl TimeSet {
    pub(crate) fn to_timespec(self) -> libc::timespec {
        match self {
            TimeSet::Omit => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            TimeSet::Now => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            TimeSet::At { sec, nsec } => libc::timespec {
                tv_sec: sec as libc::time_t,
                tv_nsec: nsec as libc::c_long,
            },
        }
    }
}

/// Access/modification times for `set_times`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetTimes {
    pub atime: TimeSet,
    pub mtime: TimeSet,
}
