// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Extended-attribute adapter.
//!
//! Guest-initiated attribute calls go through an [`XattrOps`] strategy bound
//! once at export init. The passthrough strategy reaches the host's xattr
//! facility through `/proc/self/fd/<dirfd>/<leaf>` with the `l*` family, so
//! the already-confined parent descriptor anchors the access and a symlink
//! leaf is never followed. The mapped-xattr model keeps its real xattr
//! namespace reserved for credential storage and exposes no guest attributes.

use std::ffi::{CStr, CString};
use std::os::fd::RawFd;

use crate::error::{FsError, FsResult};
use crate::types::{Credential, SecurityModel};

/// Reserved attribute names the mapped model stores credentials under.
pub const XATTR_UID: &str = "user.virtfs.uid";
pub const XATTR_GID: &str = "user.virtfs.gid";
pub const XATTR_MODE: &str = "user.virtfs.mode";
pub const XATTR_RDEV: &str = "user.virtfs.rdev";

/// Path through which xattr syscalls reach `leaf` without re-resolving the
/// guest path: the parent descriptor is already confined, and the `l*`
/// variants leave a symlink leaf alone.
fn proc_fd_path(dirfd: RawFd, leaf: &CStr) -> FsResult<CString> {
    let mut buf = format!("/proc/self/fd/{}/", dirfd).into_bytes();
    buf.extend_from_slice(leaf.to_bytes());
    CString::new(buf).map_err(|_| FsError::from_errno(libc::EINVAL))
}

fn getxattr_raw(dirfd: RawFd, leaf: &CStr, name: &str) -> FsResult<Vec<u8>> {
    let path = proc_fd_path(dirfd, leaf)?;
    let name = CString::new(name).map_err(|_| FsError::from_errno(libc::EINVAL))?;
    loop {
        let size = unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if size < 0 {
            return Err(FsError::last_os());
        }
        let mut value = vec![0u8; size as usize];
        let read = unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if read >= 0 {
            value.truncate(read as usize);
            return Ok(value);
        }
        let err = FsError::last_os();
        // the attribute grew between the size query and the read
        if err.errno() == Some(libc::ERANGE) {
            continue;
        }
        return Err(err);
    }
}

fn setxattr_raw(
    dirfd: RawFd,
    leaf: &CStr,
    name: &str,
    value: &[u8],
    flags: i32,
) -> FsResult<()> {
    let path = proc_fd_path(dirfd, leaf)?;
    let name = CString::new(name).map_err(|_| FsError::from_errno(libc::EINVAL))?;
    let rc = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if rc < 0 {
        return Err(FsError::last_os());
    }
    Ok(())
}

/// Per-model extended-attribute strategy, selected once at export init.
#[cfg_attr(test, mockall::automock)]
pub trait XattrOps: Send + Sync {
    fn get(&self, dirfd: RawFd, leaf: &CStr, name: &str) -> FsResult<Vec<u8>>;
    fn set(&self, dirfd: RawFd, leaf: &CStr, name: &str, value: &[u8], flags: i32) -> FsResult<()>;
    fn list(&self, dirfd: RawFd, leaf: &CStr) -> FsResult<Vec<String>>;
    fn remove(&self, dirfd: RawFd, leaf: &CStr, name: &str) -> FsResult<()>;
}

/// Passes calls straight to the host's native xattr facility.
pub struct PassthroughXattr;

impl XattrOps for PassthroughXattr {
    fn get(&self, dirfd: RawFd, leaf: &CStr, name: &str) -> FsResult<Vec<u8>> {
        getxattr_raw(dirfd, leaf, name)
    }

    fn set(&self, dirfd: RawFd, leaf: &CStr, name: &str, value: &[u8], flags: i32) -> FsResult<()> {
        setxattr_raw(dirfd, leaf, name, value, flags)
    }

    fn list(&self, dirfd: RawFd, leaf: &CStr) -> FsResult<Vec<String>> {
        let path = proc_fd_path(dirfd, leaf)?;
        loop {
            let size = unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
            if size < 0 {
                return Err(FsError::last_os());
            }
            let mut buf = vec![0u8; size as usize];
            let read = unsafe {
                libc::llistxattr(path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
            };
            if read >= 0 {
                buf.truncate(read as usize);
                let names = buf
                    .split(|&b| b == 0)
                    .filter(|s| !s.is_empty())
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect();
                return Ok(names);
            }
            let err = FsError::last_os();
            if err.errno() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err);
        }
    }

    fn remove(&self, dirfd: RawFd, leaf: &CStr, name: &str) -> FsResult<()> {
        let path = proc_fd_path(dirfd, leaf)?;
        let name = CString::new(name).map_err(|_| FsError::from_errno(libc::EINVAL))?;
        let rc = unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(())
    }
}

/// Refuses every guest attribute call.
pub struct UnsupportedXattr;

impl XattrOps for UnsupportedXattr {
    fn get(&self, _dirfd: RawFd, _leaf: &CStr, _name: &str) -> FsResult<Vec<u8>> {
        Err(FsError::Unsupported)
    }

    fn set(
        &self,
        _dirfd: RawFd,
        _leaf: &CStr,
        _name: &str,
        _value: &[u8],
        _flags: i32,
    ) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn list(&self, _dirfd: RawFd, _leaf: &CStr) -> FsResult<Vec<String>> {
        Err(FsError::Unsupported)
    }

    fn remove(&self, _dirfd: RawFd, _leaf: &CStr, _name: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }
}

/// Adapter selection is a pure function of the security model.
pub(crate) fn adapter_for(model: SecurityModel) -> Box<dyn XattrOps> {
    match model {
        // passthrough and none expose the host's attributes directly; the
        // mapped-file model still uses real xattrs for guest (non-credential)
        // attributes since its credentials live in the shadow store
        SecurityModel::Passthrough | SecurityModel::None | SecurityModel::MappedFile => {
            Box::new(PassthroughXattr)
        }
        SecurityModel::Mapped => Box::new(UnsupportedXattr),
    }
}

/// Persists the present credential fields under the reserved names
/// (mapped-xattr model). Values are fixed-width native-endian, matching what
/// the overlay reads expect.
pub(crate) fn set_credential(dirfd: RawFd, leaf: &CStr, cred: &Credential) -> FsResult<()> {
    if let Some(uid) = cred.uid {
        setxattr_raw(dirfd, leaf, XATTR_UID, &uid.to_ne_bytes(), 0)?;
    }
    if let Some(gid) = cred.gid {
        setxattr_raw(dirfd, leaf, XATTR_GID, &gid.to_ne_bytes(), 0)?;
    }
    if let Some(mode) = cred.mode {
        setxattr_raw(dirfd, leaf, XATTR_MODE, &mode.to_ne_bytes(), 0)?;
    }
    if let Some(rdev) = cred.rdev {
        setxattr_raw(dirfd, leaf, XATTR_RDEV, &rdev.to_ne_bytes(), 0)?;
    }
    Ok(())
}

fn parse_u32(value: Vec<u8>) -> Option<u32> {
    value.try_into().ok().map(u32::from_ne_bytes)
}

fn parse_u64(value: Vec<u8>) -> Option<u64> {
    value.try_into().ok().map(u64::from_ne_bytes)
}

/// Reads back whichever reserved attributes are present; anything absent or
/// unreadable simply stays absent, leaving the raw host metadata visible.
pub(crate) fn read_credential(dirfd: RawFd, leaf: &CStr) -> Credential {
    Credential {
        uid: getxattr_raw(dirfd, leaf, XATTR_UID).ok().and_then(parse_u32),
        gid: getxattr_raw(dirfd, leaf, XATTR_GID).ok().and_then(parse_u32),
        mode: getxattr_raw(dirfd, leaf, XATTR_MODE).ok().and_then(parse_u32),
        rdev: getxattr_raw(dirfd, leaf, XATTR_RDEV).ok().and_then(parse_u64),
    }
}

fn fgetxattr_raw(fd: RawFd, name: &str) -> FsResult<Vec<u8>> {
    let name = CString::new(name).map_err(|_| FsError::from_errno(libc::EINVAL))?;
    loop {
        let size = unsafe { libc::fgetxattr(fd, name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(FsError::last_os());
        }
        let mut value = vec![0u8; size as usize];
        let read = unsafe {
            libc::fgetxattr(
                fd,
                name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if read >= 0 {
            value.truncate(read as usize);
            return Ok(value);
        }
        let err = FsError::last_os();
        if err.errno() == Some(libc::ERANGE) {
            continue;
        }
        return Err(err);
    }
}

/// Descriptor-qualified variant of [`read_credential`], for `fstat`.
pub(crate) fn read_credential_fd(fd: RawFd) -> Credential {
    Credential {
        uid: fgetxattr_raw(fd, XATTR_UID).ok().and_then(parse_u32),
        gid: fgetxattr_raw(fd, XATTR_GID).ok().and_then(parse_u32),
        mode: fgetxattr_raw(fd, XATTR_MODE).ok().and_then(parse_u32),
        rdev: fgetxattr_raw(fd, XATTR_RDEV).ok().and_then(parse_u64),
    }
}
