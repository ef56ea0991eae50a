// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Security-model policy: where a created object's credential goes and how
//! stored credentials are overlaid back onto stat results.
//!
//! The mapped variants create host objects with fixed benign modes and stash
//! the caller's uid/gid/mode/rdev elsewhere (reserved xattrs or the shadow
//! store); passthrough and none apply them to the host object itself, with
//! none swallowing ownership failures for unprivileged hosting.

use std::ffi::CStr;
use std::os::fd::RawFd;

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::shadow;
use crate::types::{Credential, FileStat, SecurityModel};
use crate::xattr;

/// Host-side mode for regular objects created under the mapped variants.
pub(crate) const MAPPED_FILE_MODE: u32 = 0o600;
/// Host-side mode for directories created under the mapped variants.
pub(crate) const MAPPED_DIR_MODE: u32 = 0o700;

/// What kind of guest-visible object was just created. Decides which type
/// bits get folded into the persisted mode and whether the host object takes
/// a chmod. `Node` covers mknod, whose caller mode already carries its own
/// type bits (block/char/fifo/socket), so nothing is injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CreatedKind {
    Regular,
    Directory,
    Symlink,
    Node,
}

impl CreatedKind {
    fn type_bits(self) -> u32 {
        match self {
            CreatedKind::Regular => libc::S_IFREG as u32,
            CreatedKind::Directory => libc::S_IFDIR as u32,
            CreatedKind::Symlink => libc::S_IFLNK as u32,
            CreatedKind::Node => 0,
        }
    }
}

fn with_type_bits(cred: &Credential, kind: CreatedKind) -> Credential {
    Credential {
        mode: cred.mode.map(|m| m | kind.type_bits()),
        ..*cred
    }
}

/// Applies ownership and mode to the host object itself. Ownership uses the
/// no-follow variant so a symlink keeps its own credential. Under best-effort
/// hosting (model none) a chown failure is swallowed; mode failures always
/// surface.
fn post_create_host(
    dirfd: RawFd,
    leaf: &CStr,
    cred: &Credential,
    kind: CreatedKind,
    best_effort_chown: bool,
) -> FsResult<()> {
    let uid = cred.uid.unwrap_or(u32::MAX); // (uid_t)-1: leave unchanged
    let gid = cred.gid.unwrap_or(u32::MAX);
    let rc = unsafe {
        libc::fchownat(
            dirfd,
            leaf.as_ptr(),
            uid as libc::uid_t,
            gid as libc::gid_t,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc < 0 {
        let err = FsError::last_os();
        if !best_effort_chown {
            return Err(err);
        }
        debug!(errno = ?err.errno(), "ignoring chown failure under model none");
    }

    // symlinks have no mode of their own on the host
    if kind != CreatedKind::Symlink {
        if let Some(mode) = cred.mode {
            crate::resolve::chmod_nofollow(dirfd, leaf, mode & 0o7777)?;
        }
    }
    Ok(())
}

/// Phase two of object creation: persist the caller's full credential the way
/// the active model stores it. The caller rolls the host object back if this
/// fails.
pub(crate) fn persist_new_object(
    model: SecurityModel,
    dirfd: RawFd,
    leaf: &CStr,
    cred: &Credential,
    kind: CreatedKind,
) -> FsResult<()> {
    match model {
        SecurityModel::Mapped => xattr::set_credential(dirfd, leaf, &with_type_bits(cred, kind)),
        SecurityModel::MappedFile => shadow::write(dirfd, leaf, &with_type_bits(cred, kind)),
        SecurityModel::Passthrough => post_create_host(dirfd, leaf, cred, kind, false),
        SecurityModel::None => post_create_host(dirfd, leaf, cred, kind, true),
    }
}

fn apply_credential(cred: &Credential, st: &mut FileStat) {
    if let Some(uid) = cred.uid {
        st.uid = uid;
    }
    if let Some(gid) = cred.gid {
        st.gid = gid;
    }
    if let Some(mode) = cred.mode {
        st.mode = mode;
    }
    if let Some(rdev) = cred.rdev {
        st.rdev = rdev;
    }
}

/// Overlays emulated credentials onto an lstat result. Fields without stored
/// values keep the raw host metadata.
pub(crate) fn overlay_lstat(
    model: SecurityModel,
    dirfd: RawFd,
    leaf: &CStr,
    st: &mut FileStat,
) -> FsResult<()> {
    match model {
        SecurityModel::Passthrough | SecurityModel::None => Ok(()),
        SecurityModel::Mapped => {
            apply_credential(&xattr::read_credential(dirfd, leaf), st);
            Ok(())
        }
        SecurityModel::MappedFile => {
            if let Some(rec) = shadow::read(dirfd, leaf)? {
                rec.apply(st);
            }
            Ok(())
        }
    }
}

/// Overlays emulated credentials onto an fstat result. The shadow store is
/// keyed by path, so descriptor-only lookup is not supported under
/// mapped-file; that asymmetry is deliberate and reported as such.
pub(crate) fn overlay_fstat(model: SecurityModel, fd: RawFd, st: &mut FileStat) -> FsResult<()> {
    match model {
        SecurityModel::Passthrough | SecurityModel::None => Ok(()),
        SecurityModel::Mapped => {
            apply_credential(&xattr::read_credential_fd(fd), st);
            Ok(())
        }
        SecurityModel::MappedFile => Err(FsError::Unsupported),
    }
}
