// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem operation surface.
//!
//! [`LocalFs`] binds one export root and one security model for its entire
//! lifetime. Every operation re-resolves its guest path under the root with
//! no-follow semantics, performs the host syscall through `*at` anchoring,
//! and applies the model's metadata policy. Operations are synchronous and
//! reentrant; the struct holds no mutable state, so a caller may share it
//! across threads freely.
//!
//! Object creation is two-phase: the host object first, the credential
//! persistence second. When persistence fails the freshly created object is
//! removed again and the persistence error is reported; a cleanup failure is
//! logged but never replaces it.

use std::ffi::CStr;
use std::fs::File;
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::model::{self, CreatedKind, MAPPED_DIR_MODE, MAPPED_FILE_MODE};
use crate::resolve;
use crate::shadow;
use crate::types::{
    Credential, DirEntry, ExportConfig, FileStat, FsStatFs, SecurityModel, SetTimes,
};
use crate::xattr::{self, XattrOps};

// Filesystems whose files carry an i_generation counter reachable through
// FS_IOC_GETVERSION.
const EXT2_SUPER_MAGIC: u64 = 0xEF53;
const BTRFS_SUPER_MAGIC: u64 = 0x9123_683E;
const XFS_SUPER_MAGIC: u64 = 0x5846_5342;
const REISERFS_SUPER_MAGIC: u64 = 0x5265_4973;

// _IOR('v', 1, long)
const FS_IOC_GETVERSION: libc::c_ulong = (2 as libc::c_ulong) << 30
    | (std::mem::size_of::<libc::c_long>() as libc::c_ulong) << 16
    | (b'v' as libc::c_ulong) << 8
    | 1;

/// An open object handed back to the caller. Files and directory streams
/// close themselves exactly once on drop.
pub enum OpenHandle {
    File(File),
    Dir(DirStream),
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenHandle::File(file) => f.debug_tuple("File").field(file).finish(),
            OpenHandle::Dir(dir) => f.debug_tuple("Dir").field(dir).finish(),
        }
    }
}

impl OpenHandle {
    fn raw_fd(&self) -> RawFd {
        match self {
            OpenHandle::File(f) => f.as_raw_fd(),
            OpenHandle::Dir(d) => d.raw_fd(),
        }
    }

    fn file(&self) -> FsResult<&File> {
        match self {
            OpenHandle::File(f) => Ok(f),
            OpenHandle::Dir(_) => Err(FsError::from_errno(libc::EBADF)),
        }
    }

    fn dir_mut(&mut self) -> FsResult<&mut DirStream> {
        match self {
            OpenHandle::Dir(d) => Ok(d),
            OpenHandle::File(_) => Err(FsError::from_errno(libc::EBADF)),
        }
    }
}

/// Owned `DIR*` stream. The descriptor passed to `fdopendir` belongs to the
/// stream afterwards; `closedir` on drop releases both.
pub struct DirStream {
    dir: *mut libc::DIR,
}

// The raw DIR* is only ever touched through &mut self, so moving the stream
// to another thread is sound even though libc's type is not.
unsafe impl Send for DirStream {}

impl std::fmt::Debug for DirStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirStream").field("fd", &self.raw_fd()).finish()
    }
}

impl DirStream {
    fn from_fd(fd: OwnedFd) -> FsResult<Self> {
        let raw = fd.into_raw_fd();
        let dir = unsafe { libc::fdopendir(raw) };
        if dir.is_null() {
            let err = FsError::last_os();
            unsafe { libc::close(raw) };
            return Err(err);
        }
        Ok(Self { dir })
    }

    fn raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir) }
    }

    /// readdir returns null both at end-of-stream and on error; only a
    /// changed errno distinguishes them.
    fn next(&mut self) -> FsResult<Option<DirEntry>> {
        unsafe {
            *libc::__errno_location() = 0;
            let ent = libc::readdir(self.dir);
            if ent.is_null() {
                let errno = *libc::__errno_location();
                if errno != 0 {
                    return Err(FsError::from_errno(errno));
                }
                return Ok(None);
            }
            let name = CStr::from_ptr((*ent).d_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            let off = libc::telldir(self.dir);
            Ok(Some(DirEntry {
                name,
                ino: (*ent).d_ino as u64,
                off: off as i64,
            }))
        }
    }

    fn rewind(&mut self) {
        unsafe { libc::rewinddir(self.dir) }
    }

    fn seek(&mut self, off: i64) {
        unsafe { libc::seekdir(self.dir, off as libc::c_long) }
    }

    fn tell(&mut self) -> FsResult<i64> {
        let off = unsafe { libc::telldir(self.dir) };
        if off < 0 {
            return Err(FsError::last_os());
        }
        Ok(off as i64)
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dir);
        }
    }
}

/// One confined export. See the crate docs for the model semantics.
pub struct LocalFs {
    root: OwnedFd,
    model: SecurityModel,
    xattr: Box<dyn XattrOps>,
    has_generation: bool,
}

impl std::fmt::Debug for LocalFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFs")
            .field("root", &self.root)
            .field("model", &self.model)
            .field("has_generation", &self.has_generation)
            .finish_non_exhaustive()
    }
}

impl LocalFs {
    /// Opens the export root once and fixes the security model for the
    /// export's lifetime. The root must name an existing directory.
    pub fn new(config: ExportConfig) -> FsResult<Self> {
        config.validate()?;
        let root_c = resolve::cstr(
            config
                .root
                .to_str()
                .ok_or_else(|| FsError::from_errno(libc::EINVAL))?,
        )?;
        let fd = unsafe {
            libc::open(
                root_c.as_ptr(),
                libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(FsError::last_os());
        }
        let root = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut sfs = MaybeUninit::<libc::statfs>::zeroed();
        let rc = unsafe { libc::fstatfs(root.as_raw_fd(), sfs.as_mut_ptr()) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        let magic = unsafe { sfs.assume_init() }.f_type as u64;
        let has_generation = matches!(
            magic,
            EXT2_SUPER_MAGIC | BTRFS_SUPER_MAGIC | XFS_SUPER_MAGIC | REISERFS_SUPER_MAGIC
        );

        debug!(
            root = %config.root.display(),
            model = %config.security_model,
            has_generation,
            "export initialized"
        );
        Ok(Self {
            root,
            model: config.security_model,
            xattr: xattr::adapter_for(config.security_model),
            has_generation,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_adapter(config: ExportConfig, adapter: Box<dyn XattrOps>) -> FsResult<Self> {
        let mut fs = Self::new(config)?;
        fs.xattr = adapter;
        Ok(fs)
    }

    pub fn security_model(&self) -> SecurityModel {
        self.model
    }

    /// Composes a child path from its parent's path, without touching the
    /// host. The export root is the empty path.
    pub fn name_to_path(dir_path: Option<&str>, name: &str) -> String {
        match dir_path {
            Some(dir) if !dir.is_empty() && dir != "/" => {
                format!("{}/{}", dir.trim_end_matches('/'), name)
            }
            _ => name.to_string(),
        }
    }

    // ---- metadata ----

    pub fn lstat(&self, path: &str) -> FsResult<FileStat> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        let st = resolve::fstatat_nofollow(dirfd.as_raw_fd(), &leaf)?;
        let mut out = FileStat::from_host(&st);
        model::overlay_lstat(self.model, dirfd.as_raw_fd(), &leaf, &mut out)?;
        Ok(out)
    }

    /// Stat through an open handle. Not available under mapped-file, whose
    /// metadata store is keyed by path.
    pub fn fstat(&self, handle: &OpenHandle) -> FsResult<FileStat> {
        let fd = handle.raw_fd();
        let st = resolve::fstat_fd(fd)?;
        let mut out = FileStat::from_host(&st);
        model::overlay_fstat(self.model, fd, &mut out)?;
        Ok(out)
    }

    pub fn statfs(&self, path: &str) -> FsResult<FsStatFs> {
        let fd = resolve::open_nofollow(self.root.as_fd(), path, libc::O_RDONLY, 0)?;
        let mut sfs = MaybeUninit::<libc::statfs>::zeroed();
        let rc = unsafe { libc::fstatfs(fd.as_raw_fd(), sfs.as_mut_ptr()) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(FsStatFs::from_host(&unsafe { sfs.assume_init() }))
    }

    /// Host inode generation counter, when the backing filesystem keeps one.
    /// `Ok(None)` means the mount has no counter; asking about anything but a
    /// regular file or directory is refused.
    pub fn generation(&self, path: &str) -> FsResult<Option<u64>> {
        if !self.has_generation {
            return Ok(None);
        }
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        let st = resolve::fstatat_nofollow(dirfd.as_raw_fd(), &leaf)?;
        let fmt = st.st_mode & libc::S_IFMT;
        if fmt != libc::S_IFREG && fmt != libc::S_IFDIR {
            return Err(FsError::Unsupported);
        }
        let fd = resolve::openat_leaf(dirfd.as_raw_fd(), &leaf, libc::O_RDONLY, 0)?;
        let mut gen: libc::c_long = 0;
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), FS_IOC_GETVERSION as _, &mut gen) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(Some(gen as u64))
    }

    // ---- open / io ----

    pub fn open(&self, path: &str, flags: i32) -> FsResult<OpenHandle> {
        let fd = resolve::open_nofollow(self.root.as_fd(), path, flags, 0)?;
        Ok(OpenHandle::File(File::from(fd)))
    }

    pub fn opendir(&self, path: &str) -> FsResult<OpenHandle> {
        let fd = resolve::open_dir_nofollow(self.root.as_fd(), path)?;
        Ok(OpenHandle::Dir(DirStream::from_fd(fd)?))
    }

    /// Next directory entry, or `None` at end of stream. The metadata store's
    /// hidden directory never appears in listings.
    pub fn readdir(&self, handle: &mut OpenHandle) -> FsResult<Option<DirEntry>> {
        let stream = handle.dir_mut()?;
        loop {
            match stream.next()? {
                Some(ent)
                    if self.model == SecurityModel::MappedFile
                        && ent.name == shadow::HIDDEN_DIR =>
                {
                    continue
                }
                other => return Ok(other),
            }
        }
    }

    pub fn rewinddir(&self, handle: &mut OpenHandle) -> FsResult<()> {
        handle.dir_mut()?.rewind();
        Ok(())
    }

    pub fn seekdir(&self, handle: &mut OpenHandle, off: i64) -> FsResult<()> {
        handle.dir_mut()?.seek(off);
        Ok(())
    }

    pub fn telldir(&self, handle: &mut OpenHandle) -> FsResult<i64> {
        handle.dir_mut()?.tell()
    }

    pub fn pread_vectored(
        &self,
        handle: &OpenHandle,
        bufs: &mut [IoSliceMut<'_>],
        offset: i64,
    ) -> FsResult<usize> {
        let fd = handle.file()?.as_raw_fd();
        loop {
            // IoSliceMut is ABI-compatible with iovec
            let n = unsafe {
                libc::preadv(
                    fd,
                    bufs.as_mut_ptr() as *mut libc::iovec,
                    bufs.len() as libc::c_int,
                    offset as libc::off_t,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = FsError::last_os();
            if err.errno() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    pub fn pwrite_vectored(
        &self,
        handle: &OpenHandle,
        bufs: &[IoSlice<'_>],
        offset: i64,
    ) -> FsResult<usize> {
        let fd = handle.file()?.as_raw_fd();
        loop {
            let n = unsafe {
                libc::pwritev(
                    fd,
                    bufs.as_ptr() as *const libc::iovec,
                    bufs.len() as libc::c_int,
                    offset as libc::off_t,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = FsError::last_os();
            if err.errno() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    pub fn fsync(&self, handle: &OpenHandle, datasync: bool) -> FsResult<()> {
        let fd = handle.raw_fd();
        let rc = unsafe {
            if datasync {
                libc::fdatasync(fd)
            } else {
                libc::fsync(fd)
            }
        };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: i64) -> FsResult<()> {
        let fd = resolve::open_nofollow(self.root.as_fd(), path, libc::O_WRONLY, 0)?;
        let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(())
    }

    // ---- creation ----

    /// Removes the half-created object after a failed second phase. The
    /// original error always wins; a cleanup failure is only logged.
    fn rollback_create(dirfd: RawFd, leaf: &CStr, is_dir: bool, err: FsError) -> FsError {
        let flags = if is_dir { libc::AT_REMOVEDIR } else { 0 };
        let rc = unsafe { libc::unlinkat(dirfd, leaf.as_ptr(), flags) };
        if rc < 0 {
            warn!(
                leaf = %leaf.to_string_lossy(),
                "could not remove partially created object"
            );
        }
        err
    }

    /// Creates a device/fifo/socket node as the guest sees it. `cred.mode`
    /// carries the full mode including its type bits. The mapped variants
    /// never place a real special file on the host; they create a plain
    /// 0600 file and store the type in the emulated metadata.
    pub fn mknod(&self, dir_path: &str, name: &str, cred: &Credential) -> FsResult<()> {
        let dirfd = resolve::open_dir_nofollow(self.root.as_fd(), dir_path)?;
        let leaf = resolve::leaf_name(name)?;
        let (host_mode, host_rdev) = match self.model {
            SecurityModel::Mapped | SecurityModel::MappedFile => {
                (libc::S_IFREG as u32 | MAPPED_FILE_MODE, 0)
            }
            SecurityModel::Passthrough | SecurityModel::None => (
                cred.mode.unwrap_or(libc::S_IFREG as u32 | 0o600),
                cred.rdev.unwrap_or(0),
            ),
        };
        let rc = unsafe {
            libc::mknodat(
                dirfd.as_raw_fd(),
                leaf.as_ptr(),
                host_mode as libc::mode_t,
                host_rdev as libc::dev_t,
            )
        };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        model::persist_new_object(self.model, dirfd.as_raw_fd(), &leaf, cred, CreatedKind::Node)
            .map_err(|e| Self::rollback_create(dirfd.as_raw_fd(), &leaf, false, e))
    }

    pub fn mkdir(&self, dir_path: &str, name: &str, cred: &Credential) -> FsResult<()> {
        let dirfd = resolve::open_dir_nofollow(self.root.as_fd(), dir_path)?;
        let leaf = resolve::leaf_name(name)?;
        let host_mode = match self.model {
            SecurityModel::Mapped | SecurityModel::MappedFile => MAPPED_DIR_MODE,
            SecurityModel::Passthrough | SecurityModel::None => {
                cred.mode.unwrap_or(0o777) & 0o7777
            }
        };
        let rc = unsafe {
            libc::mkdirat(dirfd.as_raw_fd(), leaf.as_ptr(), host_mode as libc::mode_t)
        };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        model::persist_new_object(
            self.model,
            dirfd.as_raw_fd(),
            &leaf,
            cred,
            CreatedKind::Directory,
        )
        .map_err(|e| Self::rollback_create(dirfd.as_raw_fd(), &leaf, true, e))
    }

    /// Creates and opens a regular file. On a failed second phase the fresh
    /// descriptor is closed, the file unlinked, and the persistence error
    /// reported.
    pub fn open2(
        &self,
        dir_path: &str,
        name: &str,
        flags: i32,
        cred: &Credential,
    ) -> FsResult<OpenHandle> {
        let dirfd = resolve::open_dir_nofollow(self.root.as_fd(), dir_path)?;
        let leaf = resolve::leaf_name(name)?;
        let host_mode = match self.model {
            SecurityModel::Mapped | SecurityModel::MappedFile => MAPPED_FILE_MODE,
            SecurityModel::Passthrough | SecurityModel::None => {
                cred.mode.unwrap_or(0o600) & 0o7777
            }
        };
        let fd = resolve::openat_leaf(
            dirfd.as_raw_fd(),
            &leaf,
            flags | libc::O_CREAT | libc::O_EXCL,
            host_mode,
        )?;
        match model::persist_new_object(
            self.model,
            dirfd.as_raw_fd(),
            &leaf,
            cred,
            CreatedKind::Regular,
        ) {
            Ok(()) => Ok(OpenHandle::File(File::from(fd))),
            Err(e) => {
                drop(fd);
                Err(Self::rollback_create(dirfd.as_raw_fd(), &leaf, false, e))
            }
        }
    }

    /// Creates a symlink as the guest sees it. Under the mapped variants the
    /// target is stored as the content of a plain file; a real host symlink
    /// would carry host ownership, not the emulated one.
    pub fn symlink(
        &self,
        target: &str,
        dir_path: &str,
        name: &str,
        cred: &Credential,
    ) -> FsResult<()> {
        let dirfd = resolve::open_dir_nofollow(self.root.as_fd(), dir_path)?;
        let leaf = resolve::leaf_name(name)?;
        match self.model {
            SecurityModel::Mapped | SecurityModel::MappedFile => {
                let fd = resolve::openat_leaf(
                    dirfd.as_raw_fd(),
                    &leaf,
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    MAPPED_FILE_MODE,
                )?;
                if let Err(e) = File::from(fd).write_all(target.as_bytes()) {
                    return Err(Self::rollback_create(
                        dirfd.as_raw_fd(),
                        &leaf,
                        false,
                        e.into(),
                    ));
                }
            }
            SecurityModel::Passthrough | SecurityModel::None => {
                let target_c = resolve::cstr(target)?;
                let rc = unsafe {
                    libc::symlinkat(target_c.as_ptr(), dirfd.as_raw_fd(), leaf.as_ptr())
                };
                if rc < 0 {
                    return Err(FsError::last_os());
                }
            }
        }
        model::persist_new_object(
            self.model,
            dirfd.as_raw_fd(),
            &leaf,
            cred,
            CreatedKind::Symlink,
        )
        .map_err(|e| Self::rollback_create(dirfd.as_raw_fd(), &leaf, false, e))
    }

    /// Reads a symlink target: the real link under passthrough/none, the
    /// stored file content under the mapped variants.
    pub fn readlink(&self, path: &str) -> FsResult<String> {
        match self.model {
            SecurityModel::Mapped | SecurityModel::MappedFile => {
                let fd = resolve::open_nofollow(self.root.as_fd(), path, libc::O_RDONLY, 0)?;
                let mut out = String::new();
                File::from(fd).read_to_string(&mut out)?;
                Ok(out)
            }
            SecurityModel::Passthrough | SecurityModel::None => {
                let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
                let mut buf = vec![0u8; libc::PATH_MAX as usize];
                let n = unsafe {
                    libc::readlinkat(
                        dirfd.as_raw_fd(),
                        leaf.as_ptr(),
                        buf.as_mut_ptr() as *mut libc::c_char,
                        buf.len(),
                    )
                };
                if n < 0 {
                    return Err(FsError::last_os());
                }
                buf.truncate(n as usize);
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
        }
    }

    // ---- namespace ----

    /// Hard link. Under mapped-file the shadow record is linked alongside;
    /// if that fails the new name is removed again.
    pub fn link(&self, old_path: &str, new_dir: &str, new_name: &str) -> FsResult<()> {
        let (old_dirfd, old_leaf) = resolve::open_parent(self.root.as_fd(), old_path)?;
        let new_dirfd = resolve::open_dir_nofollow(self.root.as_fd(), new_dir)?;
        let new_leaf = resolve::leaf_name(new_name)?;
        let rc = unsafe {
            libc::linkat(
                old_dirfd.as_raw_fd(),
                old_leaf.as_ptr(),
                new_dirfd.as_raw_fd(),
                new_leaf.as_ptr(),
                0,
            )
        };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        if self.model == SecurityModel::MappedFile {
            shadow::link(
                old_dirfd.as_raw_fd(),
                &old_leaf,
                new_dirfd.as_raw_fd(),
                &new_leaf,
            )
            .map_err(|e| Self::rollback_create(new_dirfd.as_raw_fd(), &new_leaf, false, e))?;
        }
        Ok(())
    }

    /// Rename between two already-resolved directories. Under mapped-file
    /// the shadow record moves in lockstep; if the record move fails the
    /// object rename is undone.
    pub fn rename_at(
        &self,
        old_dir: &str,
        old_name: &str,
        new_dir: &str,
        new_name: &str,
    ) -> FsResult<()> {
        let old_dirfd = resolve::open_dir_nofollow(self.root.as_fd(), old_dir)?;
        let old_leaf = resolve::leaf_name(old_name)?;
        let new_dirfd = resolve::open_dir_nofollow(self.root.as_fd(), new_dir)?;
        let new_leaf = resolve::leaf_name(new_name)?;
        self.rename_leaves(
            old_dirfd.as_raw_fd(),
            &old_leaf,
            new_dirfd.as_raw_fd(),
            &new_leaf,
        )
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (old_dirfd, old_leaf) = resolve::open_parent(self.root.as_fd(), old_path)?;
        let (new_dirfd, new_leaf) = resolve::open_parent(self.root.as_fd(), new_path)?;
        self.rename_leaves(
            old_dirfd.as_raw_fd(),
            &old_leaf,
            new_dirfd.as_raw_fd(),
            &new_leaf,
        )
    }

    fn rename_leaves(
        &self,
        old_dirfd: RawFd,
        old_leaf: &CStr,
        new_dirfd: RawFd,
        new_leaf: &CStr,
    ) -> FsResult<()> {
        let rc = unsafe {
            libc::renameat(old_dirfd, old_leaf.as_ptr(), new_dirfd, new_leaf.as_ptr())
        };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        if self.model == SecurityModel::MappedFile {
            if let Err(e) = shadow::rename(old_dirfd, old_leaf, new_dirfd, new_leaf) {
                let rc = unsafe {
                    libc::renameat(new_dirfd, new_leaf.as_ptr(), old_dirfd, old_leaf.as_ptr())
                };
                if rc < 0 {
                    warn!(
                        leaf = %new_leaf.to_string_lossy(),
                        "could not undo rename after record move failure"
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes one entry; `remove_dir` selects rmdir semantics. Under
    /// mapped-file the shadow state goes first, so a failure there leaves
    /// the object untouched.
    pub fn unlink_at(&self, dir_path: &str, name: &str, remove_dir: bool) -> FsResult<()> {
        let dirfd = resolve::open_dir_nofollow(self.root.as_fd(), dir_path)?;
        let leaf = resolve::leaf_name(name)?;
        self.unlink_leaf(dirfd.as_raw_fd(), &leaf, remove_dir)
    }

    /// Path-addressed removal; stats the leaf to pick file or directory
    /// semantics.
    pub fn remove(&self, path: &str) -> FsResult<()> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        let st = resolve::fstatat_nofollow(dirfd.as_raw_fd(), &leaf)?;
        let is_dir = st.st_mode & libc::S_IFMT == libc::S_IFDIR;
        self.unlink_leaf(dirfd.as_raw_fd(), &leaf, is_dir)
    }

    fn unlink_leaf(&self, dirfd: RawFd, leaf: &CStr, remove_dir: bool) -> FsResult<()> {
        if self.model == SecurityModel::MappedFile {
            shadow::remove(dirfd, leaf, remove_dir)?;
        }
        let flags = if remove_dir { libc::AT_REMOVEDIR } else { 0 };
        let rc = unsafe { libc::unlinkat(dirfd, leaf.as_ptr(), flags) };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(())
    }

    // ---- ownership / mode / times ----

    /// Changes the guest-visible mode. The mapped variants only update the
    /// stored metadata; the host object keeps its fixed benign mode. An
    /// absent mode is a no-op and touches nothing.
    pub fn chmod(&self, path: &str, cred: &Credential) -> FsResult<()> {
        let Some(mode) = cred.mode else {
            return Ok(());
        };
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        match self.model {
            SecurityModel::Passthrough | SecurityModel::None => {
                resolve::chmod_nofollow(dirfd.as_raw_fd(), &leaf, mode & 0o7777)
            }
            SecurityModel::Mapped => xattr::set_credential(
                dirfd.as_raw_fd(),
                &leaf,
                &Credential {
                    mode: Some(mode),
                    ..Default::default()
                },
            ),
            SecurityModel::MappedFile => shadow::write(
                dirfd.as_raw_fd(),
                &leaf,
                &Credential {
                    mode: Some(mode),
                    ..Default::default()
                },
            ),
        }
    }

    /// Changes the guest-visible ownership. With both ids absent this is a
    /// host no-op chown that still validates the path exists.
    pub fn chown(&self, path: &str, cred: &Credential) -> FsResult<()> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        let both_absent = cred.uid.is_none() && cred.gid.is_none();
        match self.model {
            SecurityModel::Passthrough | SecurityModel::None => {
                Self::host_chown(dirfd.as_raw_fd(), &leaf, cred)
            }
            _ if both_absent => Self::host_chown(dirfd.as_raw_fd(), &leaf, cred),
            SecurityModel::Mapped => xattr::set_credential(
                dirfd.as_raw_fd(),
                &leaf,
                &Credential {
                    uid: cred.uid,
                    gid: cred.gid,
                    ..Default::default()
                },
            ),
            SecurityModel::MappedFile => shadow::write(
                dirfd.as_raw_fd(),
                &leaf,
                &Credential {
                    uid: cred.uid,
                    gid: cred.gid,
                    ..Default::default()
                },
            ),
        }
    }

    fn host_chown(dirfd: RawFd, leaf: &CStr, cred: &Credential) -> FsResult<()> {
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
            return Err(FsError::last_os());
        }
        Ok(())
    }

    pub fn set_times(&self, path: &str, times: &SetTimes) -> FsResult<()> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        let ts = [times.atime.to_timespec(), times.mtime.to_timespec()];
        let rc = unsafe {
            libc::utimensat(
                dirfd.as_raw_fd(),
                leaf.as_ptr(),
                ts.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc < 0 {
            return Err(FsError::last_os());
        }
        Ok(())
    }

    // ---- extended attributes ----

    pub fn get_xattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        self.xattr.get(dirfd.as_raw_fd(), &leaf, name)
    }

    pub fn list_xattr(&self, path: &str) -> FsResult<Vec<String>> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        self.xattr.list(dirfd.as_raw_fd(), &leaf)
    }

    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> FsResult<()> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        self.xattr.set(dirfd.as_raw_fd(), &leaf, name, value, flags)
    }

    pub fn remove_xattr(&self, path: &str, name: &str) -> FsResult<()> {
        let (dirfd, leaf) = resolve::open_parent(self.root.as_fd(), path)?;
        self.xattr.remove(dirfd.as_raw_fd(), &leaf, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xattr::MockXattrOps;

    fn export(dir: &std::path::Path, model: SecurityModel) -> LocalFs {
        LocalFs::new(ExportConfig::new(dir, model)).unwrap()
    }

    #[test]
    fn test_new_rejects_missing_root() {
        let err = LocalFs::new(ExportConfig::new(
            "/nonexistent/virtfs/root",
            SecurityModel::Passthrough,
        ))
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_name_to_path_composition() {
        assert_eq!(LocalFs::name_to_path(None, "f"), "f");
        assert_eq!(LocalFs::name_to_path(Some(""), "f"), "f");
        assert_eq!(LocalFs::name_to_path(Some("/"), "f"), "f");
        assert_eq!(LocalFs::name_to_path(Some("a/b"), "c"), "a/b/c");
        assert_eq!(LocalFs::name_to_path(Some("a/"), "c"), "a/c");
    }

    #[test]
    fn test_readdir_filters_hidden_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(shadow::HIDDEN_DIR)).unwrap();
        std::fs::write(tmp.path().join("visible"), b"x").unwrap();

        let fs = export(tmp.path(), SecurityModel::MappedFile);
        let mut dir = fs.opendir("").unwrap();
        let mut names = Vec::new();
        while let Some(ent) = fs.readdir(&mut dir).unwrap() {
            names.push(ent.name);
        }
        assert!(names.contains(&"visible".to_string()));
        assert!(!names.iter().any(|n| n == shadow::HIDDEN_DIR));

        // passthrough shows the host tree as-is
        let fs = export(tmp.path(), SecurityModel::Passthrough);
        let mut dir = fs.opendir("").unwrap();
        let mut names = Vec::new();
        while let Some(ent) = fs.readdir(&mut dir).unwrap() {
            names.push(ent.name);
        }
        assert!(names.iter().any(|n| n == shadow::HIDDEN_DIR));
    }

    #[test]
    fn test_export_and_handles_are_debug_printable() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        let fs = export(tmp.path(), SecurityModel::Passthrough);

        assert!(format!("{:?}", fs).contains("LocalFs"));
        let file = fs.open("f", libc::O_RDONLY).unwrap();
        assert!(format!("{:?}", file).starts_with("File"));
        let dir = fs.opendir("").unwrap();
        assert!(format!("{:?}", dir).starts_with("Dir"));
    }

    #[test]
    fn test_seekdir_resumes_stream() {
        let tmp = tempfile::TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        let fs = export(tmp.path(), SecurityModel::Passthrough);
        let mut dir = fs.opendir("").unwrap();

        let first = fs.readdir(&mut dir).unwrap().unwrap();
        let second = fs.readdir(&mut dir).unwrap().unwrap();
        fs.seekdir(&mut dir, first.off).unwrap();
        let again = fs.readdir(&mut dir).unwrap().unwrap();
        assert_eq!(again.name, second.name);

        fs.rewinddir(&mut dir).unwrap();
        let restart = fs.readdir(&mut dir).unwrap().unwrap();
        assert_eq!(restart.name, first.name);
    }

    #[test]
    fn test_guest_xattr_goes_through_bound_adapter() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), b"x").unwrap();

        let mut mock = MockXattrOps::new();
        mock.expect_get()
            .withf(|_, _, name| name == "user.color")
            .times(1)
            .returning(|_, _, _| Ok(b"blue".to_vec()));
        let fs = LocalFs::with_adapter(
            ExportConfig::new(tmp.path(), SecurityModel::Passthrough),
            Box::new(mock),
        )
        .unwrap();

        assert_eq!(fs.get_xattr("f", "user.color").unwrap(), b"blue");
    }

    #[test]
    fn test_vectored_io_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fs = export(tmp.path(), SecurityModel::Passthrough);
        let handle = fs
            .open2("", "data", libc::O_RDWR, &Credential::default())
            .unwrap();

        let written = fs
            .pwrite_vectored(
                &handle,
                &[IoSlice::new(b"hello "), IoSlice::new(b"world")],
                0,
            )
            .unwrap();
        assert_eq!(written, 11);

        let mut a = [0u8; 6];
        let mut b = [0u8; 5];
        let read = fs
            .pread_vectored(
                &handle,
                &mut [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)],
                0,
            )
            .unwrap();
        assert_eq!(read, 11);
        assert_eq!(&a, b"hello ");
        assert_eq!(&b, b"world");
    }
}
