// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Confinement-preserving path resolution.
//!
//! Guest paths are interpreted relative to the export root; leading slashes
//! are stripped (the root is the implicit "/"). Every traversal segment is
//! opened directory-only with `O_NOFOLLOW`, and every caller-named leaf is
//! opened `O_NOFOLLOW`, so a symlink can never redirect resolution outside
//! the root. Freshly opened leaves that are neither regular files nor
//! directories are closed and refused: a compromised or buggy client must not
//! reach device/fifo/socket nodes on the host.

use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tracing::warn;

use crate::error::{FsError, FsResult};

const DOT: &CStr = c".";

pub(crate) fn cstr(s: &str) -> FsResult<CString> {
    CString::new(s).map_err(|_| FsError::from_errno(libc::EINVAL))
}

/// Validates a single directory-entry name supplied by the guest.
pub(crate) fn leaf_name(name: &str) -> FsResult<CString> {
    if name.is_empty() || name == "." {
        return Err(FsError::from_errno(libc::EINVAL));
    }
    if name == ".." || name.contains('/') {
        return Err(FsError::PathEscape);
    }
    cstr(name)
}

/// Splits a guest path into components, rejecting anything that could climb
/// out of the export root. Leading slashes and `.` segments are dropped.
pub(crate) fn split_components(path: &str) -> FsResult<Vec<&str>> {
    let mut parts = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => continue,
            ".." => return Err(FsError::PathEscape),
            c => parts.push(c),
        }
    }
    Ok(parts)
}

fn openat_raw(dirfd: RawFd, name: &CStr, flags: libc::c_int, mode: u32) -> FsResult<OwnedFd> {
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

/// Changes the mode of `leaf` without ever following it. There is no
/// `AT_SYMLINK_NOFOLLOW` for fchmodat on Linux, so the leaf is pinned with an
/// `O_PATH` descriptor and chmod goes through its `/proc/self/fd` link; a
/// symlink leaf then fails instead of redirecting the chmod.
pub(crate) fn chmod_nofollow(dirfd: RawFd, leaf: &CStr, mode: u32) -> FsResult<()> {
    let fd = openat_raw(dirfd, leaf, libc::O_PATH | libc::O_NOFOLLOW, 0)?;
    let path = cstr(&format!("/proc/self/fd/{}", fd.as_raw_fd()))?;
    let rc = unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) };
    if rc < 0 {
        return Err(FsError::last_os());
    }
    Ok(())
}

pub(crate) fn fstat_fd(fd: RawFd) -> FsResult<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if rc < 0 {
        return Err(FsError::last_os());
    }
    Ok(unsafe { st.assume_init() })
}

pub(crate) fn fstatat_nofollow(dirfd: RawFd, name: &CStr) -> FsResult<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            dirfd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc < 0 {
        return Err(FsError::last_os());
    }
    Ok(unsafe { st.assume_init() })
}

/// Opens a caller-named leaf under an already-resolved directory.
///
/// The leaf is never followed if it is a symlink. After the open, the
/// descriptor is checked: anything that is neither a regular file nor a
/// directory is closed and refused (CVE-2023-2861 class of attacks). The
/// `O_NONBLOCK` used to make fifo opens non-hanging is dropped again before
/// the descriptor is handed out.
pub(crate) fn openat_leaf(
    dirfd: RawFd,
    name: &CStr,
    flags: libc::c_int,
    mode: u32,
) -> FsResult<OwnedFd> {
    let open_flags = flags | libc::O_NOFOLLOW | libc::O_NOCTTY | libc::O_NONBLOCK;
    let fd = openat_raw(dirfd, name, open_flags, mode)?;

    let st = fstat_fd(fd.as_raw_fd())?;
    let fmt = st.st_mode & libc::S_IFMT;
    if fmt != libc::S_IFREG && fmt != libc::S_IFDIR {
        warn!(
            name = %name.to_string_lossy(),
            "broken or compromised client attempted to open a special file"
        );
        return Err(FsError::SpecialFile);
    }

    // O_PATH descriptors ignore status flags; everything else gets the
    // caller's original flags back.
    if flags & libc::O_PATH == 0 {
        let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
    }
    Ok(fd)
}

fn walk_dirs(root: BorrowedFd<'_>, dirs: &[&str]) -> FsResult<OwnedFd> {
    let mut cur = openat_raw(
        root.as_raw_fd(),
        DOT,
        libc::O_DIRECTORY | libc::O_RDONLY,
        0,
    )?;
    for dir in dirs {
        cur = openat_raw(
            cur.as_raw_fd(),
            &cstr(dir)?,
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        )?;
    }
    Ok(cur)
}

/// Resolves `path` against the export root and opens the leaf with `flags`.
pub(crate) fn open_nofollow(
    root: BorrowedFd<'_>,
    path: &str,
    flags: libc::c_int,
    mode: u32,
) -> FsResult<OwnedFd> {
    let comps = split_components(path)?;
    match comps.split_last() {
        None => openat_raw(
            root.as_raw_fd(),
            DOT,
            libc::O_DIRECTORY | libc::O_RDONLY,
            0,
        ),
        Some((leaf, dirs)) => {
            let dirfd = walk_dirs(root, dirs)?;
            openat_leaf(dirfd.as_raw_fd(), &cstr(leaf)?, flags, mode)
        }
    }
}

/// Directory-only confined open, for enumeration and `*at` anchoring.
pub(crate) fn open_dir_nofollow(root: BorrowedFd<'_>, path: &str) -> FsResult<OwnedFd> {
    let comps = split_components(path)?;
    walk_dirs(root, &comps)
}

/// Resolves the parent directory of `path` and returns its descriptor plus
/// the leaf name for `*at` syscalls. The export root itself resolves to the
/// root descriptor and `"."`.
pub(crate) fn open_parent(root: BorrowedFd<'_>, path: &str) -> FsResult<(OwnedFd, CString)> {
    let comps = split_components(path)?;
    match comps.split_last() {
        None => {
            let fd = openat_raw(
                root.as_raw_fd(),
                DOT,
                libc::O_DIRECTORY | libc::O_RDONLY,
                0,
            )?;
            Ok((fd, DOT.to_owned()))
        }
        Some((leaf, dirs)) => {
            let dirfd = walk_dirs(root, dirs)?;
            let leaf = cstr(leaf)?;
            Ok((dirfd, leaf))
        }
    }
}
