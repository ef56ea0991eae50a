// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shadow-metadata store for the mapped-file security model.
//!
//! Each directory level carries one hidden `.virtfs_metadata` directory with
//! one record file per sibling object. Records are line-oriented
//! `virtfs.<field>=<value>` text; only fields that were ever set are written,
//! and unrecognized lines are tolerated on read. A missing record is not an
//! error: it just means the object was never given an emulated credential.
//!
//! Updates merge the existing record with the incoming fields and rewrite the
//! whole file. A crash between read and rewrite can lose a concurrent update
//! to the same record; this matches the store's accepted best-effort
//! semantics and is not hardened further.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::types::{Credential, FileStat};

/// Name of the hidden per-directory store. Never shown to the guest.
pub const HIDDEN_DIR: &str = ".virtfs_metadata";

const HIDDEN_DIR_C: &CStr = c".virtfs_metadata";

const KEY_UID: &str = "virtfs.uid";
const KEY_GID: &str = "virtfs.gid";
const KEY_MODE: &str = "virtfs.mode";
const KEY_RDEV: &str = "virtfs.rdev";

/// Persisted credential snapshot for exactly one filesystem object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowRecord {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub rdev: Option<u64>,
}

impl ShadowRecord {
    fn parse(text: &str) -> Self {
        let mut rec = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key {
                KEY_UID => rec.uid = value.parse().ok(),
                KEY_GID => rec.gid = value.parse().ok(),
                KEY_MODE => rec.mode = value.parse().ok(),
                KEY_RDEV => rec.rdev = value.parse().ok(),
                _ => {} // unrecognized lines are tolerated
            }
        }
        rec
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(uid) = self.uid {
            out.push_str(&format!("{}={}\n", KEY_UID, uid));
        }
        if let Some(gid) = self.gid {
            out.push_str(&format!("{}={}\n", KEY_GID, gid));
        }
        if let Some(mode) = self.mode {
            out.push_str(&format!("{}={}\n", KEY_MODE, mode));
        }
        if let Some(rdev) = self.rdev {
            out.push_str(&format!("{}={}\n", KEY_RDEV, rdev));
        }
        out
    }

    fn merge_from(&mut self, cred: &Credential) {
        if let Some(uid) = cred.uid {
            self.uid = Some(uid);
        }
        if let Some(gid) = cred.gid {
            self.gid = Some(gid);
        }
        if let Some(mode) = cred.mode {
            self.mode = Some(mode);
        }
        if let Some(rdev) = cred.rdev {
            self.rdev = Some(rdev);
        }
    }

    /// Overlays the stored fields onto a raw host stat, field by field.
    pub fn apply(&self, st: &mut FileStat) {
        if let Some(uid) = self.uid {
            st.uid = uid;
        }
        if let Some(gid) = self.gid {
            st.gid = gid;
        }
        if let Some(mode) = self.mode {
            st.mode = mode;
        }
        if let Some(rdev) = self.rdev {
            st.rdev = rdev;
        }
    }
}

fn openat_in(dirfd: RawFd, name: &CStr, flags: libc::c_int, mode: u32) -> FsResult<OwnedFd> {
    let fd = unsafe {
        libc::openat(
            dirfd,
            name.as_ptr(),
            flags | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(FsError::last_os());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens a directory's hidden store, optionally creating it. Creation is
/// idempotent: EEXIST is not an error.
fn open_hidden_dir(dirfd: RawFd, create: bool) -> FsResult<OwnedFd> {
    if create {
        let rc = unsafe { libc::mkdirat(dirfd, HIDDEN_DIR_C.as_ptr(), 0o700) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err.into());
            }
        }
    }
    openat_in(
        dirfd,
        HIDDEN_DIR_C,
        libc::O_DIRECTORY | libc::O_RDONLY | libc::O_NOFOLLOW,
        0,
    )
}

/// Reads the shadow record for `leaf` in the directory `dirfd`. Absence of
/// the hidden directory or of the record file is `Ok(None)`.
pub(crate) fn read(dirfd: RawFd, leaf: &CStr) -> FsResult<Option<ShadowRecord>> {
    let hidden = match open_hidden_dir(dirfd, false) {
        Ok(fd) => fd,
        Err(e) if matches!(e.errno(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };
    let fd = match openat_in(
        hidden.as_raw_fd(),
        leaf,
        libc::O_RDONLY | libc::O_NOFOLLOW,
        0,
    ) {
        Ok(fd) => fd,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut text = String::new();
    File::from(fd).read_to_string(&mut text)?;
    Ok(Some(ShadowRecord::parse(&text)))
}

/// Merges `cred` over any existing record for `leaf` and rewrites it,
/// creating the hidden directory on first write.
pub(crate) fn write(dirfd: RawFd, leaf: &CStr, cred: &Credential) -> FsResult<()> {
    let mut rec = read(dirfd, leaf)?.unwrap_or_default();
    rec.merge_from(cred);

    let hidden = open_hidden_dir(dirfd, true)?;
    let fd = openat_in(
        hidden.as_raw_fd(),
        leaf,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_NOFOLLOW,
        0o600,
    )?;
    File::from(fd).write_all(rec.render().as_bytes())?;
    Ok(())
}

/// Moves the shadow record alongside a rename of its object. A missing
/// source record is tolerated: not every object has one.
pub(crate) fn rename(
    old_dirfd: RawFd,
    old_leaf: &CStr,
    new_dirfd: RawFd,
    new_leaf: &CStr,
) -> FsResult<()> {
    let new_hidden = open_hidden_dir(new_dirfd, true)?;
    let old_hidden = match open_hidden_dir(old_dirfd, false) {
        Ok(fd) => fd,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let rc = unsafe {
        libc::renameat(
            old_hidden.as_raw_fd(),
            old_leaf.as_ptr(),
            new_hidden.as_raw_fd(),
            new_leaf.as_ptr(),
        )
    };
    if rc < 0 {
        let err = FsError::last_os();
        if err.is_not_found() {
            debug!(leaf = %old_leaf.to_string_lossy(), "no shadow record to rename");
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Hard-links the shadow record alongside a link of its object. A missing
/// source record is tolerated.
pub(crate) fn link(
    old_dirfd: RawFd,
    old_leaf: &CStr,
    new_dirfd: RawFd,
    new_leaf: &CStr,
) -> FsResult<()> {
    let new_hidden = open_hidden_dir(new_dirfd, true)?;
    let old_hidden = match open_hidden_dir(old_dirfd, false) {
        Ok(fd) => fd,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let rc = unsafe {
        libc::linkat(
            old_hidden.as_raw_fd(),
            old_leaf.as_ptr(),
            new_hidden.as_raw_fd(),
            new_leaf.as_ptr(),
            0,
        )
    };
    if rc < 0 {
        let err = FsError::last_os();
        if err.is_not_found() {
            debug!(leaf = %old_leaf.to_string_lossy(), "no shadow record to link");
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Drops shadow state ahead of removing `leaf` from `dirfd`: a directory
/// being removed loses its own hidden store first, then the record in the
/// parent's store goes. ENOENT is tolerated at each step (the object may
/// have been created outside mapped-file mode); any other failure
/// propagates. The object itself is removed by the caller afterwards.
pub(crate) fn remove(dirfd: RawFd, leaf: &CStr, removing_dir: bool) -> FsResult<()> {
    if removing_dir {
        let victim = openat_in(
            dirfd,
            leaf,
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW,
            0,
        )?;
        let rc = unsafe {
            libc::unlinkat(victim.as_raw_fd(), HIDDEN_DIR_C.as_ptr(), libc::AT_REMOVEDIR)
        };
        if rc < 0 {
            let err = FsError::last_os();
            if !err.is_not_found() {
                return Err(err);
            }
        }
    }

    let hidden = match open_hidden_dir(dirfd, false) {
        Ok(fd) => fd,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let rc = unsafe { libc::unlinkat(hidden.as_raw_fd(), leaf.as_ptr(), 0) };
    if rc < 0 {
        let err = FsError::last_os();
        if !err.is_not_found() {
            return Err(err);
        }
        debug!(leaf = %leaf.to_string_lossy(), "no shadow record to remove");
    }
    Ok(())
}
