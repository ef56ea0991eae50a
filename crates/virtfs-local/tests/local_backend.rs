// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end behavior of the local backend across the security models,
//! exercised against real temp directories.

use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;

use virtfs_local::shadow;
use virtfs_local::{
    Credential, ExportConfig, FsError, LocalFs, SecurityModel, SetTimes, TimeSet,
};

fn export(dir: &std::path::Path, model: SecurityModel) -> LocalFs {
    LocalFs::new(ExportConfig::new(dir, model)).unwrap()
}

fn cred(uid: u32, gid: u32, mode: u32) -> Credential {
    Credential {
        uid: Some(uid),
        gid: Some(gid),
        mode: Some(mode),
        rdev: None,
    }
}

fn host_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Temp dirs may sit on tmpfs without user xattr support; mapped-xattr tests
/// bail out instead of failing there.
fn xattr_unsupported(err: &FsError) -> bool {
    err.errno() == Some(libc::EOPNOTSUPP)
}

fn list_names(fs: &LocalFs, path: &str) -> Vec<String> {
    let mut dir = fs.opendir(path).unwrap();
    let mut names = Vec::new();
    while let Some(ent) = fs.readdir(&mut dir).unwrap() {
        if ent.name != "." && ent.name != ".." {
            names.push(ent.name);
        }
    }
    names.sort();
    names
}

#[test]
fn test_escape_attempts_are_rejected() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::Passthrough);

    assert!(matches!(fs.lstat("../x"), Err(FsError::PathEscape)));
    assert!(matches!(
        fs.open("a/../../b", libc::O_RDONLY),
        Err(FsError::PathEscape)
    ));
    assert!(matches!(
        fs.unlink_at("", "..", true),
        Err(FsError::PathEscape)
    ));
    assert!(matches!(
        fs.rename_at("", "a", "", "b/c"),
        Err(FsError::PathEscape)
    ));

    // absolute guest paths are relative to the root, never to the host
    assert!(fs.lstat("/etc/passwd").unwrap_err().is_not_found());
}

#[test]
fn test_symlink_cannot_redirect_resolution() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::os::unix::fs::symlink("/", tmp.path().join("out")).unwrap();
    let fs = export(tmp.path(), SecurityModel::Passthrough);

    let err = fs.open("out/etc", libc::O_RDONLY).unwrap_err();
    assert!(matches!(
        err.errno(),
        Some(libc::ELOOP) | Some(libc::ENOTDIR)
    ));
    let err = fs.open("out", libc::O_RDONLY).unwrap_err();
    assert_eq!(err.errno(), Some(libc::ELOOP));
}

#[test]
fn test_special_file_open_is_refused() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = std::ffi::CString::new(tmp.path().join("pipe").to_str().unwrap()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(path.as_ptr(), 0o600) }, 0);
    let fs = export(tmp.path(), SecurityModel::Passthrough);

    let err = fs.open("pipe", libc::O_RDONLY).unwrap_err();
    assert!(matches!(err, FsError::SpecialFile));
    assert_eq!(err.wire_errno(), libc::ENXIO);
    // the node itself is still visible to stat
    assert!(fs.lstat("pipe").is_ok());
}

#[test]
fn test_passthrough_create_applies_host_metadata() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::Passthrough);

    let handle = fs
        .open2("", "f", libc::O_RDWR, &cred(host_uid(), unsafe { libc::getegid() }, 0o640))
        .unwrap();
    drop(handle);

    let meta = std::fs::metadata(tmp.path().join("f")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
    let st = fs.lstat("f").unwrap();
    assert!(st.is_regular());
    assert_eq!(st.mode_bits(), 0o640);
    assert_eq!(st.uid, host_uid());
}

#[test]
fn test_truncate_and_set_times() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::Passthrough);
    std::fs::write(tmp.path().join("f"), b"hello world").unwrap();

    fs.truncate("f", 5).unwrap();
    assert_eq!(fs.lstat("f").unwrap().size, 5);

    fs.set_times(
        "f",
        &SetTimes {
            atime: TimeSet::Omit,
            mtime: TimeSet::At {
                sec: 1_234_567,
                nsec: 0,
            },
        },
    )
    .unwrap();
    assert_eq!(fs.lstat("f").unwrap().mtime_sec, 1_234_567);
}

#[test]
fn test_statfs_and_generation_answer() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::Passthrough);
    std::fs::write(tmp.path().join("f"), b"x").unwrap();

    let sfs = fs.statfs("").unwrap();
    assert!(sfs.bsize > 0);

    // Some(counter) on filesystems that keep one, None elsewhere; never an
    // error for a regular file.
    assert!(fs.generation("f").is_ok());
}

#[test]
fn test_mapped_file_credential_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);

    let handle = fs.open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap();
    drop(handle);

    let st = fs.lstat("f").unwrap();
    assert_eq!(st.uid, 1000);
    assert_eq!(st.gid, 100);
    assert_eq!(st.mode_bits(), 0o640);
    assert!(st.is_regular());

    // the host object keeps the fixed benign mode
    let meta = std::fs::metadata(tmp.path().join("f")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
    assert_eq!(meta.uid(), host_uid());
}

#[test]
fn test_mapped_file_chmod_chown_update_store_only() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);
    drop(fs.open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap());

    fs.chmod(
        "f",
        &Credential {
            mode: Some(0o600),
            ..Default::default()
        },
    )
    .unwrap();
    fs.chown(
        "f",
        &Credential {
            uid: Some(0),
            ..Default::default()
        },
    )
    .unwrap();

    let st = fs.lstat("f").unwrap();
    assert_eq!(st.mode_bits(), 0o600);
    assert_eq!(st.uid, 0);
    assert_eq!(st.gid, 100);
    assert_eq!(
        std::fs::metadata(tmp.path().join("f")).unwrap().uid(),
        host_uid()
    );
}

#[test]
fn test_empty_metadata_calls_leave_no_store_behind() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("f"), b"x").unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);

    fs.chmod("f", &Credential::default()).unwrap();
    fs.chown("f", &Credential::default()).unwrap();

    assert!(!tmp.path().join(shadow::HIDDEN_DIR).exists());
    let st = fs.lstat("f").unwrap();
    assert_eq!(st.uid, host_uid());
}

#[test]
fn test_mapped_file_fstat_is_unsupported() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);
    let handle = fs.open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap();

    let err = fs.fstat(&handle).unwrap_err();
    assert!(matches!(err, FsError::Unsupported));
    assert_eq!(err.wire_errno(), 95);
}

#[test]
fn test_mapped_file_symlink_is_backed_by_regular_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);

    fs.symlink("some/target", "", "lnk", &cred(1000, 100, 0o777))
        .unwrap();

    let st = fs.lstat("lnk").unwrap();
    assert!(st.is_symlink());
    assert_eq!(st.uid, 1000);
    assert_eq!(fs.readlink("lnk").unwrap(), "some/target");

    // host-side it is an ordinary file holding the target text
    let meta = std::fs::symlink_metadata(tmp.path().join("lnk")).unwrap();
    assert!(meta.file_type().is_file());
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("lnk")).unwrap(),
        "some/target"
    );
}

#[test]
fn test_mapped_file_mknod_emulates_device_node() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);

    let node = Credential {
        uid: Some(0),
        gid: Some(0),
        mode: Some(libc::S_IFBLK as u32 | 0o660),
        rdev: Some(0x0801),
    };
    fs.mknod("", "disk", &node).unwrap();

    let st = fs.lstat("disk").unwrap();
    assert_eq!(st.mode & libc::S_IFMT as u32, libc::S_IFBLK as u32);
    assert_eq!(st.rdev, 0x0801);
    // no real device node reaches the host
    let meta = std::fs::symlink_metadata(tmp.path().join("disk")).unwrap();
    assert!(meta.file_type().is_file());
}

#[test]
fn test_rename_moves_shadow_record_with_object() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);
    fs.mkdir("", "a", &cred(1000, 100, 0o750)).unwrap();
    drop(fs.open2("a", "b", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap());

    fs.rename("a/b", "a/c").unwrap();

    assert_eq!(list_names(&fs, "a"), vec!["c".to_string()]);
    let st = fs.lstat("a/c").unwrap();
    assert_eq!(st.uid, 1000);
    assert_eq!(st.mode_bits(), 0o640);
    assert!(fs.lstat("a/b").unwrap_err().is_not_found());
}

#[test]
fn test_link_carries_shadow_record() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);
    drop(fs.open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap());

    fs.link("f", "", "g").unwrap();

    let st = fs.lstat("g").unwrap();
    assert_eq!(st.uid, 1000);
    assert_eq!(fs.lstat("g").unwrap().nlink, 2);
}

#[test]
fn test_unlink_drops_shadow_record() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);
    drop(fs.open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap());

    fs.unlink_at("", "f", false).unwrap();
    assert!(!tmp.path().join("f").exists());
    assert!(!tmp.path().join(shadow::HIDDEN_DIR).join("f").exists());

    // a later object with the same name starts with a clean slate
    std::fs::write(tmp.path().join("f"), b"new").unwrap();
    assert_eq!(fs.lstat("f").unwrap().uid, host_uid());
}

#[test]
fn test_remove_directory_tears_down_its_store() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);
    fs.mkdir("", "d", &cred(1000, 100, 0o750)).unwrap();
    drop(fs.open2("d", "x", libc::O_RDWR, &cred(1000, 100, 0o640)).unwrap());
    fs.unlink_at("d", "x", false).unwrap();

    fs.remove("d").unwrap();
    assert!(!tmp.path().join("d").exists());
}

#[test]
fn test_create_rolls_back_when_persistence_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    // a plain file squatting on the hidden store name makes every record
    // write fail after the object was already created
    std::fs::write(tmp.path().join(shadow::HIDDEN_DIR), b"squat").unwrap();
    let fs = export(tmp.path(), SecurityModel::MappedFile);

    let err = fs
        .open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640))
        .unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOTDIR));
    assert!(!tmp.path().join("f").exists());

    let err = fs.mkdir("", "d", &cred(1000, 100, 0o750)).unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOTDIR));
    assert!(!tmp.path().join("d").exists());
}

#[test]
fn test_mapped_xattr_credential_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let fs = export(tmp.path(), SecurityModel::Mapped);

    let handle = match fs.open2("", "f", libc::O_RDWR, &cred(1000, 100, 0o640)) {
        Err(e) if xattr_unsupported(&e) => return, // backing fs has no user xattrs
        r => r.unwrap(),
    };

    let st = fs.lstat("f").unwrap();
    assert_eq!(st.uid, 1000);
    assert_eq!(st.gid, 100);
    assert_eq!(st.mode_bits(), 0o640);

    // descriptor-based stat works in this model
    let st = fs.fstat(&handle).unwrap();
    assert_eq!(st.uid, 1000);

    // the reserved namespace is not reachable as a guest attribute
    assert!(matches!(
        fs.set_xattr("f", "user.color", b"blue", 0),
        Err(FsError::Unsupported)
    ));
    assert!(matches!(fs.list_xattr("f"), Err(FsError::Unsupported)));
}

#[test]
fn test_mapped_without_stored_attrs_shows_host_metadata() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("plain"), b"x").unwrap();
    let fs = export(tmp.path(), SecurityModel::Mapped);

    let st = fs.lstat("plain").unwrap();
    assert_eq!(st.uid, host_uid());
    assert!(st.is_regular());
}

#[test]
fn test_none_model_tolerates_chown_failure_on_create() {
    if host_uid() == 0 {
        return; // root can chown to anyone; nothing to observe
    }
    let tmp = tempfile::TempDir::new().unwrap();

    // passthrough surfaces the failure and rolls the object back
    let fs = export(tmp.path(), SecurityModel::Passthrough);
    let err = fs.open2("", "f", libc::O_RDWR, &cred(0, 0, 0o640)).unwrap_err();
    assert_eq!(err.errno(), Some(libc::EPERM));
    assert!(!tmp.path().join("f").exists());

    // none swallows it and keeps the object
    let fs = export(tmp.path(), SecurityModel::None);
    drop(fs.open2("", "f", libc::O_RDWR, &cred(0, 0, 0o640)).unwrap());
    let st = fs.lstat("f").unwrap();
    assert_eq!(st.uid, host_uid());
    assert_eq!(st.mode_bits(), 0o640);
}

#[test]
fn test_passthrough_guest_xattrs_reach_host() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("f"), b"x").unwrap();
    let fs = export(tmp.path(), SecurityModel::Passthrough);

    match fs.set_xattr("f", "user.color", b"blue", 0) {
        Err(e) if xattr_unsupported(&e) => return,
        r => r.unwrap(),
    }
    assert_eq!(fs.get_xattr("f", "user.color").unwrap(), b"blue");
    assert!(fs
        .list_xattr("f")
        .unwrap()
        .contains(&"user.color".to_string()));
    fs.remove_xattr("f", "user.color").unwrap();
    assert!(fs.get_xattr("f", "user.color").is_err());
}
