//! Resolution of user/group names and of the paths handed to `start`.
//!
//! Nothing in here keeps state. The only side effects are reads of the user/group
//! database and of the filesystem (for [abspath], which resolves symlinks of the
//! part of a path that already exists).
use nix::unistd::{
    Gid,
    Group,
    Uid,
    User,
};
use precisej_printable_errno::{
    ErrnoResult,
    PrintableErrno,
    printable_error,
};
use std::{
    env,
    fs,
    io,
    path::{
        Component,
        Path,
        PathBuf,
    },
};

use crate::PROGRAM_NAME;


/// Make `path` absolute.
///
/// Existing paths are canonicalized. For paths that don't exist (yet) the longest
/// existing prefix is canonicalized and the remainder appended verbatim, so a logfile
/// in a symlinked directory still resolves to the real directory.
pub fn abspath(path: &Path) -> io::Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(resolved) => return Ok(resolved),
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        Err(_) => {}
    }

    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        match fs::canonicalize(ancestor) {
            Ok(base) => {
                // strip_prefix can't fail: ancestor is a prefix of path by construction
                let rest = path.strip_prefix(ancestor).unwrap_or(path);
                return Ok(base.join(rest));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(env::current_dir()?.join(path))
}

/// Lexically normalize `path`: collapse `.`, `..` and repeated separators.
///
/// A `..` never climbs above the first component, so the result of normalizing a
/// path that is later joined below a chroot stays inside the chroot. Normalizing an
/// already normalized path returns it unchanged.
pub fn normpath_no_escape(path: &Path) -> PathBuf {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    let mut normalized = if path.has_root() {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for part in parts {
        normalized.push(part);
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// Append `tail` below `base`. Unlike [Path::join] an absolute `tail` does not
/// replace `base`: `join_path("/srv/jail", "/bin/sh")` is `/srv/jail/bin/sh`.
pub fn join_path(base: &Path, tail: &Path) -> PathBuf {
    let mut joined = base.to_path_buf();
    for component in tail.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {}
            other => joined.push(other.as_os_str()),
        }
    }
    joined
}

/// Look up a user by name or by numeric uid. A numeric uid must exist in the
/// user database.
pub fn user(spec: &str) -> Result<User, PrintableErrno<String>> {
    if spec.is_empty() {
        return Err(printable_error(PROGRAM_NAME, "user name cannot be empty".to_string()));
    }

    let found = match spec.parse::<u32>() {
        Ok(uid) => User::from_uid(Uid::from_raw(uid)),
        Err(_) => User::from_name(spec),
    }.printable(PROGRAM_NAME, format!("unable to look up user {}", spec))?;

    found.ok_or_else(|| printable_error(PROGRAM_NAME, format!("no such user: {}", spec)))
}

/// Look up a group by name or by numeric gid. A numeric gid must exist in the
/// group database.
pub fn group(spec: &str) -> Result<Gid, PrintableErrno<String>> {
    if spec.is_empty() {
        return Err(printable_error(PROGRAM_NAME, "group name cannot be empty".to_string()));
    }

    let found = match spec.parse::<u32>() {
        Ok(gid) => Group::from_gid(Gid::from_raw(gid)),
        Err(_) => Group::from_name(spec),
    }.printable(PROGRAM_NAME, format!("unable to look up group {}", spec))?;

    found
        .map(|group| group.gid)
        .ok_or_else(|| printable_error(PROGRAM_NAME, format!("no such group: {}", spec)))
}
