//! The commands that talk to a running supervisor. They share no state with it: all
//! they have are the pidfiles and signals.
pub mod logs;
pub mod signal;
pub mod status;
pub mod stop;

use nix::unistd::Pid;
use precisej_printable_errno::PrintableErrno;
use std::path::Path;

use crate::{
    IoResultExt,
    cli::TargetArgs,
    pidfile::{
        self,
        Pidfiles,
    },
};

pub use self::{
    logs::logs,
    signal::{
        logrotate,
        restart,
    },
    status::status,
    stop::stop,
};


fn pidfiles(target: &TargetArgs) -> Pidfiles {
    Pidfiles::new(target.pidfile())
}

fn read_pid(path: &Path) -> Result<Option<Pid>, PrintableErrno<String>> {
    pidfile::read(path).printable_io(format!("unable to read pidfile {}", path.display()))
}
