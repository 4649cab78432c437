//! `status`: what the pidfiles say, with LSB-like exit codes.
use precisej_printable_errno::{
    ExitError,
    PrintableResult,
};

use crate::{
    IoResultExt,
    cli::TargetArgs,
    client::pidfiles,
    pidfile::{
        self,
        Liveness,
    },
};


pub const RUNNING: i32 = 0;
pub const SERVICE_STALE: i32 = 1;
pub const RUNNER_STALE: i32 = 2;
pub const NOT_RUNNING: i32 = 3;
pub const SERVICE_DOWN: i32 = 4;
pub const RUNNER_DOWN: i32 = 5;
pub const FAILED: i32 = 150;

/// The exit code for the state of the supervisor and the service pidfile.
pub fn classify(runner: Liveness, service: Liveness) -> i32 {
    match (runner, service) {
        (Liveness::Alive(_), Liveness::Alive(_)) => RUNNING,
        (Liveness::Alive(_), _) => SERVICE_DOWN,
        (_, Liveness::Alive(_)) => RUNNER_DOWN,
        (Liveness::Stale(_), _) => RUNNER_STALE,
        (Liveness::Missing, Liveness::Stale(_)) => SERVICE_STALE,
        (Liveness::Missing, Liveness::Missing) => NOT_RUNNING,
    }
}

pub fn status(target: TargetArgs) -> Result<i32, ExitError<String>> {
    let files = pidfiles(&target);
    let runner = pidfile::probe(files.runner())
        .printable_io(format!("unable to read pidfile {}", files.runner().display()))
        .bail(FAILED)?;
    let service = pidfile::probe(files.service())
        .printable_io(format!("unable to read pidfile {}", files.service().display()))
        .bail(FAILED)?;

    if let Liveness::Stale(pid) = runner {
        eprintln!("{}: supervisor pidfile {} exists, but pid {} does not", target.name, files.runner().display(), pid);
    }
    if let Liveness::Stale(pid) = service {
        eprintln!("{}: service pidfile {} exists, but pid {} does not", target.name, files.service().display(), pid);
    }

    let code = classify(runner, service);
    match code {
        RUNNING => println!("{} is running", target.name),
        SERVICE_DOWN => eprintln!("{} is not running, but its supervisor is; it is probably (re)starting", target.name),
        RUNNER_DOWN => eprintln!("{} is running, but its supervisor is not", target.name),
        _ => eprintln!("{} is not running", target.name),
    }
    Ok(code)
}
