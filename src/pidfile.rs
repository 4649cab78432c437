//! The pidfile pair shared between the supervisor and the client commands.
//!
//! `<pidfile>` holds the pid of the service process and is written by the service
//! child itself right after the fork. `<pidfile>.runner` holds the pid of the
//! supervisor. Both contain a decimal pid followed by a newline. Only the supervisor
//! (and `start`, when cleaning up after a dead supervisor) ever removes them, with the
//! exception of `stop` escalating to SIGKILL.
use nix::unistd::Pid;
use std::{
    ffi::OsString,
    fs,
    io,
    path::{
        Path,
        PathBuf,
    },
};

use crate::platforms;


const RUNNER_SUFFIX: &str = ".runner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pidfiles {
    service: PathBuf,
    runner: PathBuf,
}

impl Pidfiles {
    /// `service` is the service pidfile; the runner pidfile lives next to it.
    pub fn new(service: PathBuf) -> Pidfiles {
        let mut runner = OsString::from(service.as_os_str());
        runner.push(RUNNER_SUFFIX);
        Pidfiles {
            service,
            runner: PathBuf::from(runner),
        }
    }

    pub fn service(&self) -> &Path {
        &self.service
    }

    pub fn runner(&self) -> &Path {
        &self.runner
    }

    /// Remove both files; missing files are fine.
    pub fn remove_all(&self) -> io::Result<()> {
        let service = remove(&self.service);
        let runner = remove(&self.runner);
        service.and(runner)
    }
}

pub fn write(path: &Path, pid: Pid) -> io::Result<()> {
    fs::write(path, format!("{}\n", pid))
}

/// `Ok(None)` if there is no pidfile. A pidfile that doesn't start with a positive pid
/// is an `InvalidData` error.
pub fn read(path: &Path) -> io::Result<Option<Pid>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(Pid::from_raw(pid))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} does not contain a pid", path.display()),
        )),
    }
}

pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove `path` if it still records `pid`. Returns whether it was removed.
pub fn remove_if_matches(path: &Path, pid: Pid) -> io::Result<bool> {
    match read(path) {
        Ok(Some(recorded)) if recorded == pid => {
            remove(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Missing,
    Stale(Pid),
    Alive(Pid),
}

impl Liveness {
    #[cfg(test)]
    pub fn alive(self) -> Option<Pid> {
        match self {
            Liveness::Alive(pid) => Some(pid),
            _ => None,
        }
    }
}

/// Read `path` and check whether the recorded process exists.
///
/// The process may exit (and its pid be reused) right after the check; callers
/// signalling it afterwards accept that race.
pub fn probe(path: &Path) -> io::Result<Liveness> {
    let pid = match read(path)? {
        Some(pid) => pid,
        None => return Ok(Liveness::Missing),
    };
    if platforms::process_alive(pid)? {
        Ok(Liveness::Alive(pid))
    } else {
        Ok(Liveness::Stale(pid))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    // far above the default pid_max, so never a live process
    const DEAD_PID: i32 = 0x3fff_fff0;

    #[test]
    fn runner_file_is_suffixed() {
        let files = Pidfiles::new(PathBuf::from("/var/run/web.pid"));
        assert_eq!(files.service(), Path::new("/var/run/web.pid"));
        assert_eq!(files.runner(), Path::new("/var/run/web.pid.runner"));
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.pid");
        write(&path, Pid::from_raw(4321)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "4321\n");
        assert_eq!(read(&path).unwrap(), Some(Pid::from_raw(4321)));
    }

    #[test]
    fn missing_and_garbage_pidfiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.pid");
        assert_eq!(read(&path).unwrap(), None);
        fs::write(&path, "not a pid\n").unwrap();
        assert_eq!(read(&path).unwrap_err().kind(), io::ErrorKind::InvalidData);
        fs::write(&path, "0\n").unwrap();
        assert!(read(&path).is_err());
    }

    #[test]
    fn remove_if_matches_only_removes_the_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.pid");
        write(&path, Pid::from_raw(100)).unwrap();
        assert!(!remove_if_matches(&path, Pid::from_raw(101)).unwrap());
        assert!(path.exists());
        assert!(remove_if_matches(&path, Pid::from_raw(100)).unwrap());
        assert!(!path.exists());
        assert!(!remove_if_matches(&path, Pid::from_raw(100)).unwrap());
    }

    #[test]
    fn probe_distinguishes_live_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.pid");
        assert_eq!(probe(&path).unwrap(), Liveness::Missing);

        write(&path, getpid()).unwrap();
        assert_eq!(probe(&path).unwrap(), Liveness::Alive(getpid()));

        write(&path, Pid::from_raw(DEAD_PID)).unwrap();
        assert_eq!(probe(&path).unwrap(), Liveness::Stale(Pid::from_raw(DEAD_PID)));
    }

    #[test]
    fn remove_all_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = Pidfiles::new(dir.path().join("svc.pid"));
        write(files.runner(), getpid()).unwrap();
        files.remove_all().unwrap();
        assert!(!files.runner().exists());
    }
}
