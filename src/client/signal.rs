//! `restart` and `logrotate`: one signal to the supervisor.
use nix::sys::signal::{
    Signal,
    kill,
};
use precisej_printable_errno::{
    ErrnoResult,
    ExitError,
    PrintableErrno,
    PrintableResult,
    printable_error,
};

use crate::{
    IoResultExt,
    PROGRAM_NAME,
    cli::TargetArgs,
    client::pidfiles,
    pidfile::{
        self,
        Liveness,
    },
};


fn signal_supervisor(target: &TargetArgs, signal: Signal) -> Result<(), PrintableErrno<String>> {
    let files = pidfiles(target);
    let runner = pidfile::probe(files.runner())
        .printable_io(format!("unable to read pidfile {}", files.runner().display()))?;
    match runner {
        Liveness::Alive(pid) => kill(pid, signal)
            .printable(PROGRAM_NAME, format!("unable to send {} to supervisor of {} (pid {})", signal.as_str(), target.name, pid)),
        Liveness::Stale(pid) => Err(printable_error(
            PROGRAM_NAME,
            format!("{} is not running: supervisor pid {} from {} does not exist", target.name, pid, files.runner().display()),
        )),
        Liveness::Missing => Err(printable_error(PROGRAM_NAME, format!("{} is not running", target.name))),
    }
}

/// Make the supervisor terminate the service and start it again.
pub fn restart(target: TargetArgs) -> Result<i32, ExitError<String>> {
    signal_supervisor(&target, Signal::SIGUSR1).bail(1)?;
    Ok(0)
}

/// Make the supervisor reopen its logfile.
pub fn logrotate(target: TargetArgs) -> Result<i32, ExitError<String>> {
    signal_supervisor(&target, Signal::SIGHUP).bail(1)?;
    Ok(0)
}
