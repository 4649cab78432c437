//! Permission checks against an identity other than our own.
//!
//! `start` has to know whether the service identity will be able to run the
//! command (and whether we can write pidfile and logfile) before it forks away
//! from the terminal, because afterwards nobody would see the error. `access(2)`
//! only answers for the real uid, so the owner/group/other bits are evaluated by
//! hand here. An `Err` carries the reason (`EACCES`, `EISDIR`, `ENOTDIR` or the
//! error of the failed `stat`).
use nix::unistd::{
    Gid,
    Uid,
};
use std::{
    fs::{
        self,
        Metadata,
    },
    io,
    os::unix::fs::MetadataExt,
    path::Path,
};


const MODE_EXEC: u32 = 0o1;
const MODE_WRITE: u32 = 0o2;
const MODE_READ: u32 = 0o4;

/// POSIX class selection: the owner bits decide if the uid matches, otherwise the
/// group bits if the gid matches, otherwise the other bits.
fn permits(meta: &Metadata, uid: Uid, gid: Gid, bits: u32) -> bool {
    let mode = meta.mode();
    let class = if meta.uid() == uid.as_raw() {
        mode >> 6
    } else if meta.gid() == gid.as_raw() {
        mode >> 3
    } else {
        mode
    };
    class & bits == bits
}

fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// `path` exists, is not a directory and is executable by `uid`/`gid`.
///
/// root is deliberately not special-cased: a file without any execute bit can't be
/// executed by root either.
pub fn can_execute(path: &Path, uid: Uid, gid: Gid) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        return Err(os_error(libc::EISDIR));
    }
    if permits(&meta, uid, gid, MODE_EXEC) {
        Ok(())
    } else {
        Err(os_error(libc::EACCES))
    }
}

/// `path` is a directory that `uid`/`gid` may traverse (needed for chroot and chdir).
pub fn can_list(path: &Path, uid: Uid, gid: Gid) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(os_error(libc::ENOTDIR));
    }
    if permits(&meta, uid, gid, MODE_EXEC) {
        Ok(())
    } else {
        Err(os_error(libc::EACCES))
    }
}

/// `path` is a file `uid`/`gid` can read and write, or it doesn't exist yet and its
/// parent directory is writable so it can be created. uid 0 always passes.
pub fn can_read_write(path: &Path, uid: Uid, gid: Gid) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                return Err(os_error(libc::EISDIR));
            }
            if uid.is_root() || permits(&meta, uid, gid, MODE_READ | MODE_WRITE) {
                Ok(())
            } else {
                Err(os_error(libc::EACCES))
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if uid.is_root() {
                return Ok(());
            }
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let meta = fs::metadata(parent)?;
            if !meta.is_dir() {
                return Err(os_error(libc::ENOTDIR));
            }
            if permits(&meta, uid, gid, MODE_WRITE) {
                Ok(())
            } else {
                Err(os_error(libc::EACCES))
            }
        }
        Err(e) => Err(e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    // ids that are guaranteed not to own the temporary files
    const STRANGER_UID: u32 = 4_000_017;
    const STRANGER_GID: u32 = 4_000_019;

    fn stranger() -> (Uid, Gid) {
        (Uid::from_raw(STRANGER_UID), Gid::from_raw(STRANGER_GID))
    }

    fn file_with_mode(dir: &Path, name: &str, mode: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn owner_of(path: &Path) -> (Uid, Gid) {
        let meta = fs::metadata(path).unwrap();
        (Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid()))
    }

    #[test]
    fn execute_uses_other_bits_for_strangers() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = stranger();
        let open = file_with_mode(dir.path(), "open", 0o701);
        let closed = file_with_mode(dir.path(), "closed", 0o770);
        assert!(can_execute(&open, uid, gid).is_ok());
        let err = can_execute(&closed, uid, gid).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn execute_owner_class_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_with_mode(dir.path(), "others-only", 0o011);
        let (uid, gid) = owner_of(&path);
        assert!(can_execute(&path, uid, gid).is_err());
        let (stranger_uid, stranger_gid) = stranger();
        assert!(can_execute(&path, stranger_uid, stranger_gid).is_ok());
    }

    #[test]
    fn execute_group_class_applies_to_non_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_with_mode(dir.path(), "group", 0o010);
        let (_, gid) = owner_of(&path);
        assert!(can_execute(&path, Uid::from_raw(STRANGER_UID), gid).is_ok());
    }

    #[test]
    fn directories_are_not_executables() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = stranger();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        let err = can_execute(dir.path(), uid, gid).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
        assert!(can_list(dir.path(), uid, gid).is_ok());
    }

    #[test]
    fn list_requires_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = stranger();
        let file = file_with_mode(dir.path(), "plain", 0o755);
        let err = can_list(&file, uid, gid).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    }

    #[test]
    fn missing_file_is_checked_against_parent() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = stranger();
        let target = dir.path().join("service.pid");

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o757)).unwrap();
        assert!(can_read_write(&target, uid, gid).is_ok());

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        assert!(can_read_write(&target, uid, gid).is_err());
        assert!(can_read_write(&target, Uid::from_raw(0), gid).is_ok());
    }

    #[test]
    fn existing_file_needs_read_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = stranger();
        let rw = file_with_mode(dir.path(), "rw", 0o606);
        let ro = file_with_mode(dir.path(), "ro", 0o604);
        assert!(can_read_write(&rw, uid, gid).is_ok());
        assert_eq!(can_read_write(&ro, uid, gid).unwrap_err().raw_os_error(), Some(libc::EACCES));
        assert!(can_read_write(&ro, Uid::from_raw(0), gid).is_ok());
        assert_eq!(can_read_write(dir.path(), uid, gid).unwrap_err().raw_os_error(), Some(libc::EISDIR));
    }
}
