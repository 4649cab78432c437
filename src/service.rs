//! The immutable description of the supervised service.
use clap::ValueEnum;
use nix::{
    sys::stat::Mode,
    unistd::{
        Gid,
        Uid,
        execv,
        getegid,
        geteuid,
    },
};
use std::{
    convert::Infallible,
    ffi::{
        CString,
        NulError,
        OsStr,
        OsString,
    },
    fmt,
    os::unix::ffi::OsStrExt,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

use crate::{
    logging::{
        LogFormat,
        logfile::LogPattern,
    },
    pidfile::Pidfiles,
    rlimit::{
        Resource,
        ResourceLimit,
    },
};


#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("service name cannot be empty")]
    Empty,
    #[error("illegal service name {0:?}: only letters, digits, '_', '-' and '+' are allowed")]
    Illegal(String),
}

/// A service name. It ends up in default file names, so it is restricted to
/// `[A-Za-z0-9_+-]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `/var/run/<name>.pid`
    pub fn default_pidfile(&self) -> PathBuf {
        PathBuf::from(format!("/var/run/{}.pid", self.0))
    }

    /// `/var/log/<name>-%Y-%m-%d.log`, rotated daily.
    pub fn default_logfile(&self) -> String {
        format!("/var/log/{}-%Y-%m-%d.log", self.0)
    }
}

impl FromStr for ServiceName {
    type Err = NameError;

    fn from_str(name: &str) -> Result<ServiceName, NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        let legal = name.chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '+');
        if legal {
            Ok(ServiceName(name.to_string()))
        } else {
            Err(NameError::Illegal(name.to_string()))
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// When the service is started again after it terminated on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestartPolicy {
    /// Never restart.
    Never,
    /// Restart unless stopped on purpose.
    Always,
    /// Restart after a crash.
    Failure,
}

impl Default for RestartPolicy {
    fn default() -> RestartPolicy {
        RestartPolicy::Failure
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartPolicy::Never => "NEVER",
            RestartPolicy::Always => "ALWAYS",
            RestartPolicy::Failure => "FAILURE",
        })
    }
}

fn os_cstring(value: &OsStr) -> Result<CString, NulError> {
    CString::new(value.as_bytes())
}

/// The executable and argument vector handed to `execv`, converted ahead of the fork
/// so the child doesn't need to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    path: PathBuf,
    c_path: CString,
    c_argv: Vec<CString>,
}

impl ExecPlan {
    /// `path` is the resolved executable; `argv[0]` stays the command as given.
    pub fn new(path: PathBuf, argv: &[OsString]) -> Result<ExecPlan, NulError> {
        let c_path = os_cstring(path.as_os_str())?;
        let c_argv = argv.iter()
            .map(|arg| os_cstring(arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ExecPlan {
            path,
            c_path,
            c_argv,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn argv(&self) -> &[CString] {
        &self.c_argv
    }

    pub fn exec(&self) -> nix::Result<Infallible> {
        execv(&self.c_path, &self.c_argv)
    }
}

/// Everything `start` was told, resolved and checked. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: ServiceName,
    pub exec: ExecPlan,
    pub pidfiles: Pidfiles,
    pub logfile: LogPattern,
    pub log_format: LogFormat,
    pub chown_logfile: bool,
    pub user: Option<Uid>,
    pub group: Option<Gid>,
    pub chroot: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
    pub umask: Option<Mode>,
    pub rlimits: Vec<ResourceLimit>,
    pub priority: Option<i32>,
    pub restart: RestartPolicy,
    pub restart_sleep: Duration,
    pub crash_report: Option<PathBuf>,
    pub foreground: bool,
}

impl ServiceSpec {
    /// Service output goes through a pipe (instead of straight into the logfile) when
    /// the supervisor has to see it: to rotate the log, or because an FSIZE limit on
    /// the service must not apply to the logfile.
    pub fn captures_output(&self) -> bool {
        self.logfile.is_rotating()
            || self.rlimits.iter().any(|limit| limit.resource == Resource::Fsize)
    }

    /// The uid/gid the service will run as.
    pub fn target_identity(&self) -> (Uid, Gid) {
        (self.user.unwrap_or_else(geteuid), self.group.unwrap_or_else(getegid))
    }

    /// Owner for new logfiles, if `--chown-logfile` was given.
    pub fn logfile_owner(&self) -> Option<(Uid, Gid)> {
        if self.chown_logfile {
            Some(self.target_identity())
        } else {
            None
        }
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A spec for `/bin/true` with everything else defaulted.
    pub(crate) fn spec_for(name: &str, logfile: &str) -> ServiceSpec {
        let name: ServiceName = name.parse().unwrap();
        ServiceSpec {
            pidfiles: Pidfiles::new(name.default_pidfile()),
            name,
            exec: ExecPlan::new(PathBuf::from("/bin/true"), &[OsString::from("true")]).unwrap(),
            logfile: LogPattern::new(logfile).unwrap(),
            log_format: LogFormat::Text,
            chown_logfile: false,
            user: None,
            group: None,
            chroot: None,
            chdir: None,
            umask: None,
            rlimits: Vec::new(),
            priority: None,
            restart: RestartPolicy::Failure,
            restart_sleep: Duration::from_secs(1),
            crash_report: None,
            foreground: false,
        }
    }

    #[test]
    fn names_are_restricted() {
        assert!("web-1_a+b".parse::<ServiceName>().is_ok());
        assert_eq!("".parse::<ServiceName>(), Err(NameError::Empty));
        assert!("../etc".parse::<ServiceName>().is_err());
        assert!("a b".parse::<ServiceName>().is_err());
        assert!("dienst-ä".parse::<ServiceName>().is_err());
    }

    #[test]
    fn default_paths() {
        let name: ServiceName = "web".parse().unwrap();
        assert_eq!(name.default_pidfile(), PathBuf::from("/var/run/web.pid"));
        assert_eq!(name.default_logfile(), "/var/log/web-%Y-%m-%d.log");
    }

    #[test]
    fn exec_plan_keeps_argv0() {
        let plan = ExecPlan::new(
            PathBuf::from("/usr/bin/python3"),
            &[OsString::from("python"), OsString::from("-m"), OsString::from("http.server")],
        ).unwrap();
        assert_eq!(plan.path(), Path::new("/usr/bin/python3"));
        assert_eq!(plan.argv()[0].to_str().unwrap(), "python");
        assert_eq!(plan.argv().len(), 3);
        assert!(ExecPlan::new(PathBuf::from("/bin/sh"), &[OsString::from("a\0b")]).is_err());
    }

    #[test]
    fn output_capture() {
        let fixed = spec_for("svc", "/tmp/svc.log");
        assert!(!fixed.captures_output());

        let rotating = spec_for("svc", "/tmp/svc-%Y.log");
        assert!(rotating.captures_output());

        let mut limited = spec_for("svc", "/tmp/svc.log");
        limited.rlimits.push("NOFILE:64:64".parse().unwrap());
        assert!(!limited.captures_output());
        limited.rlimits.push("FSIZE:1024:1024".parse().unwrap());
        assert!(limited.captures_output());
    }

    #[test]
    fn identity_defaults_to_our_own() {
        let mut spec = spec_for("svc", "/tmp/svc.log");
        assert_eq!(spec.target_identity(), (geteuid(), getegid()));
        assert_eq!(spec.logfile_owner(), None);
        spec.user = Some(Uid::from_raw(4242));
        spec.chown_logfile = true;
        assert_eq!(spec.logfile_owner(), Some((Uid::from_raw(4242), getegid())));
    }
}
