//! `stop`: terminate the supervisor, wait for it, and kill everything if it takes too
//! long.
use nix::{
    errno::Errno,
    sys::signal::{
        Signal,
        kill,
    },
    unistd::Pid,
};
use precisej_printable_errno::{
    ErrnoResult,
    ExitError,
    PrintableResult,
    printable_error,
};
use std::{
    path::Path,
    time::Duration,
};

use crate::{
    PROGRAM_NAME,
    cli::StopArgs,
    client::{
        pidfiles,
        read_pid,
    },
    pidfile,
    platforms::PidHandle,
};


/// `None` waits forever.
pub fn shutdown_timeout(seconds: i64) -> Option<Duration> {
    if seconds < 0 {
        None
    } else {
        Some(Duration::from_secs(seconds as u64))
    }
}

/// SIGKILL `pid` and remove `path` if it still names it.
fn kill_and_forget(what: &str, pid: Pid, path: &Path) {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => printable_error(PROGRAM_NAME, format!("unable to send SIGKILL to {} (pid {}): {}", what, pid, e)).eprint(),
    }
    if let Err(e) = pidfile::remove_if_matches(path, pid) {
        printable_error(PROGRAM_NAME, format!("unable to remove {}: {}", path.display(), e)).eprint();
    }
}

pub fn stop(args: StopArgs) -> Result<i32, ExitError<String>> {
    let target = &args.target;
    let files = pidfiles(target);
    let runner = read_pid(files.runner()).bail(1)?;
    let service = read_pid(files.service()).bail(1)?;

    // without a supervisor there is nobody to forward the signal, so go straight to
    // the service
    let (what, pid) = match (runner, service) {
        (Some(pid), _) => ("supervisor", pid),
        (None, Some(pid)) => ("service", pid),
        (None, None) => {
            eprintln!("{} is not running", target.name);
            return Ok(0);
        }
    };

    let handle = PidHandle::open(pid)
        .printable(PROGRAM_NAME, format!("unable to open {} of {} (pid {})", what, target.name, pid))
        .bail(1)?;
    handle.signal(Signal::SIGTERM)
        .printable(PROGRAM_NAME, format!("unable to send SIGTERM to {} of {} (pid {})", what, target.name, pid))
        .bail(1)?;
    eprintln!("sent SIGTERM to {} of {} (pid {})", what, target.name, pid);

    let stopped = handle.wait_exit(shutdown_timeout(args.shutdown_timeout))
        .printable(PROGRAM_NAME, format!("unable to wait for pid {}", pid))
        .bail(1)?;
    if stopped {
        return Ok(0);
    }

    printable_error(PROGRAM_NAME, format!("timeout waiting for {} to shut down, sending SIGKILL", target.name)).eprint();
    if let Some(pid) = service {
        kill_and_forget("service", pid, files.service());
    }
    if let Some(pid) = runner {
        kill_and_forget("supervisor", pid, files.runner());
    }
    Ok(1)
}
