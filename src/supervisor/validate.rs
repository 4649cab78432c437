//! Turning the `start` arguments into a [ServiceSpec].
//!
//! Everything that can be checked before forking away from the terminal is checked
//! here: names, paths, identities and whether the involved files and directories are
//! accessible to whoever will use them.
use chrono::Local;
use nix::unistd::{
    Gid,
    Uid,
    getegid,
    geteuid,
};
use precisej_printable_errno::{
    PrintableErrno,
    printable_error,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

use crate::{
    IoResultExt,
    PROGRAM_NAME,
    access::{
        can_execute,
        can_list,
        can_read_write,
    },
    cli::StartArgs,
    logging::logfile::LogPattern,
    pidfile::Pidfiles,
    resolve::{
        self,
        abspath,
        join_path,
        normpath_no_escape,
    },
    service::{
        ExecPlan,
        ServiceSpec,
    },
};


/// Where the service runs and what it executes, as seen from inside its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub chroot: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
    pub command: PathBuf,
}

/// Resolve user and group. With only a user, its primary group is used.
fn identity(user: Option<&str>, group: Option<&str>) -> Result<(Option<Uid>, Option<Gid>), PrintableErrno<String>> {
    let user = user.map(resolve::user).transpose()?;
    let group = match group {
        Some(group) => Some(resolve::group(group)?),
        None => user.as_ref().map(|user| user.gid),
    };
    Ok((user.map(|user| user.uid), group))
}

/// Resolve chroot, working directory and command for the identity `uid`/`gid` and
/// check that it can get there and run the command.
pub fn placement(command: &Path, chroot: Option<&Path>, chdir: Option<&Path>, uid: Uid, gid: Gid) -> Result<Placement, PrintableErrno<String>> {
    match chroot {
        Some(chroot) => {
            let root = abspath(chroot)
                .printable_io(format!("unable to get absolute path of --chroot={}", chroot.display()))?;
            can_list(&root, uid, gid)
                .printable_io(format!("illegal chroot directory {}", root.display()))?;

            let chdir = chdir.map(|dir| normpath_no_escape(&join_path(Path::new("/"), dir)));
            if let Some(dir) = &chdir {
                let outside = join_path(&root, dir);
                can_list(&outside, uid, gid)
                    .printable_io(format!("illegal chdir directory {}", outside.display()))?;
            }

            let command = if command.is_absolute() {
                normpath_no_escape(command)
            } else {
                let base = chdir.as_deref().unwrap_or_else(|| Path::new("/"));
                normpath_no_escape(&join_path(base, command))
            };
            let outside = join_path(&root, &command);
            can_execute(&outside, uid, gid)
                .printable_io(format!("illegal service executable {}", outside.display()))?;

            Ok(Placement {
                chroot: Some(root),
                chdir,
                command,
            })
        }
        None => {
            let chdir = match chdir {
                Some(dir) => {
                    let dir = abspath(dir)
                        .printable_io(format!("unable to get absolute path of --chdir={}", dir.display()))?;
                    can_list(&dir, uid, gid)
                        .printable_io(format!("illegal chdir directory {}", dir.display()))?;
                    Some(dir)
                }
                None => None,
            };

            let command = match (&chdir, command.is_absolute()) {
                (_, true) => command.to_path_buf(),
                (Some(dir), false) => dir.join(command),
                (None, false) => abspath(command)
                    .printable_io(format!("unable to get absolute path of {}", command.display()))?,
            };
            can_execute(&command, uid, gid)
                .printable_io(format!("illegal service executable {}", command.display()))?;

            Ok(Placement {
                chroot: None,
                chdir,
                command,
            })
        }
    }
}

/// Resolve the logfile pattern to an absolute one. Only the directory part that
/// exists is canonicalized, so placeholders survive.
fn logfile_pattern(pattern: &str) -> Result<LogPattern, PrintableErrno<String>> {
    let absolute = abspath(Path::new(pattern))
        .printable_io(format!("unable to get absolute path of logfile {}", pattern))?;
    let absolute = absolute.to_str()
        .ok_or_else(|| printable_error(PROGRAM_NAME, format!("logfile path is not valid UTF-8: {}", absolute.display())))?;
    LogPattern::new(absolute)
        .map_err(|e| printable_error(PROGRAM_NAME, e.to_string()))
}

pub fn service_spec(args: StartArgs) -> Result<ServiceSpec, PrintableErrno<String>> {
    let (own_uid, own_gid) = (geteuid(), getegid());
    let (user, group) = identity(args.user.as_deref(), args.group.as_deref())?;
    let (uid, gid) = (user.unwrap_or(own_uid), group.unwrap_or(own_gid));

    // clap guarantees at least one element
    let argv0 = args.command.first()
        .ok_or_else(|| printable_error(PROGRAM_NAME, "missing service command".to_string()))?;
    let placement = placement(Path::new(argv0), args.chroot.as_deref(), args.chdir.as_deref(), uid, gid)?;

    let crash_report = match &args.crash_report {
        Some(command) => {
            let command = abspath(command)
                .printable_io(format!("unable to get absolute path of --crash-report={}", command.display()))?;
            can_execute(&command, own_uid, own_gid)
                .printable_io(format!("illegal crash report command {}", command.display()))?;
            Some(command)
        }
        None => None,
    };

    let name = args.target.name.clone();
    let pidfile = args.target.pidfile();
    let pidfile = abspath(&pidfile)
        .printable_io(format!("unable to get absolute path of pidfile {}", pidfile.display()))?;
    let pidfiles = Pidfiles::new(pidfile);
    for path in [pidfiles.service(), pidfiles.runner()].iter() {
        can_read_write(path, own_uid, own_gid)
            .printable_io(format!("cannot read and write pidfile {}", path.display()))?;
    }

    let logfile = logfile_pattern(&args.logfile.clone().unwrap_or_else(|| name.default_logfile()))?;
    let current = logfile.expand(&Local::now());
    can_read_write(&current, own_uid, own_gid)
        .printable_io(format!("cannot read and write logfile {}", current.display()))?;

    if let Err(e) = args.log_format.template().validate() {
        return Err(printable_error(PROGRAM_NAME, format!("illegal --log-format: {}", e)));
    }

    let exec = ExecPlan::new(placement.command, &args.command)
        .map_err(|e| printable_error(PROGRAM_NAME, format!("illegal service command: {}", e)))?;

    Ok(ServiceSpec {
        name,
        exec,
        pidfiles,
        logfile,
        log_format: args.log_format,
        chown_logfile: args.chown_logfile,
        user,
        group,
        chroot: placement.chroot,
        chdir: placement.chdir,
        umask: args.umask,
        rlimits: args.rlimit,
        priority: args.priority,
        restart: args.restart,
        restart_sleep: Duration::from_secs(u64::from(args.restart_sleep)),
        crash_report,
        foreground: args.foreground,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::{
        fs,
        os::unix::fs::PermissionsExt,
    };

    use crate::cli::{
        Cli,
        Command,
    };

    fn me() -> (Uid, Gid) {
        (geteuid(), getegid())
    }

    fn executable(path: &Path) {
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn start_args(args: &[&str]) -> StartArgs {
        let mut argv = vec!["service-runner", "start"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Start(args) => args,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn relative_command_below_chroot() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("app/bin")).unwrap();
        executable(&root.join("app/bin/server"));
        let (uid, gid) = me();

        let placed = placement(Path::new("bin/server"), Some(&root), Some(Path::new("app/../app")), uid, gid).unwrap();
        assert_eq!(placed.chroot.as_deref(), Some(root.as_path()));
        assert_eq!(placed.chdir.as_deref(), Some(Path::new("/app")));
        assert_eq!(placed.command, PathBuf::from("/app/bin/server"));
    }

    #[test]
    fn chroot_paths_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("bin")).unwrap();
        executable(&root.join("bin/server"));
        let (uid, gid) = me();

        let placed = placement(Path::new("../../../bin/server"), Some(&root), None, uid, gid).unwrap();
        assert_eq!(placed.command, PathBuf::from("/bin/server"));
        assert_eq!(placed.chdir, None);
    }

    #[test]
    fn relative_command_against_chdir() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        executable(&base.join("run.sh"));
        let (uid, gid) = me();

        let placed = placement(Path::new("run.sh"), None, Some(&base), uid, gid).unwrap();
        assert_eq!(placed.command, base.join("run.sh"));
        assert_eq!(placed.chdir, Some(base));
    }

    #[test]
    fn not_executable_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("plain");
        fs::write(&script, "data").unwrap();
        let (uid, gid) = me();

        assert!(placement(&script, None, None, uid, gid).is_err());
        assert!(placement(dir.path(), None, None, uid, gid).is_err());
        assert!(placement(&dir.path().join("missing"), None, None, uid, gid).is_err());
    }

    #[test]
    fn spec_from_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let pidfile = base.join("web.pid");
        let logfile = base.join("web-%Y.log");
        let args = start_args(&[
            "web",
            "-p", pidfile.to_str().unwrap(),
            "-l", logfile.to_str().unwrap(),
            "--restart-sleep", "5",
            "--log-format", "json",
            "/bin/sh", "-c", "exit 0",
        ]);

        let spec = service_spec(args).unwrap();
        assert_eq!(spec.name.as_str(), "web");
        assert_eq!(spec.pidfiles.service(), pidfile.as_path());
        assert_eq!(spec.logfile.as_str(), logfile.to_str().unwrap());
        assert!(spec.captures_output());
        assert_eq!(spec.restart_sleep, Duration::from_secs(5));
        assert_eq!(spec.exec.path(), Path::new("/bin/sh"));
        assert_eq!(spec.exec.argv().len(), 3);
        assert_eq!(spec.user, None);
    }

    #[test]
    fn directory_as_pidfile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = start_args(&[
            "web",
            "-p", dir.path().to_str().unwrap(),
            "-l", dir.path().join("web.log").to_str().unwrap(),
            "/bin/sh",
        ]);
        assert!(service_spec(args).is_err());
    }

    #[test]
    fn user_implies_primary_group() {
        let (uid, gid) = identity(Some("0"), None).unwrap();
        assert_eq!(uid, Some(Uid::from_raw(0)));
        assert_eq!(gid, Some(Gid::from_raw(0)));
        assert_eq!(identity(None, None).unwrap(), (None, None));
    }
}
