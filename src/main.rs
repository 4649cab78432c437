//! Run a single command as a supervised service. **CURRENTLY IN DEVELOPMENT**
//!
//! # What?
//! service-runner starts a command in the background, keeps it running according to
//! a restart policy and writes everything it prints to a logfile that can be rotated
//! by date. It is meant for systems (or containers) where a full service manager is
//! not available or not wanted, and for services that just need to be kept alive.
//!
//! Every invocation of service-runner is either the supervisor of exactly one service
//! (`start`), or a short-lived client talking to such a supervisor (`stop`,
//! `restart`, `status`, `logrotate` and `logs`). Clients and supervisor only share
//! two pidfiles and a handful of signals:
//!
//! | file                | content                       |
//! |---------------------|-------------------------------|
//! | `<pidfile>`         | pid of the service            |
//! | `<pidfile>.runner`  | pid of the supervisor         |
//!
//! | signal to the supervisor | meaning                                        |
//! |--------------------------|------------------------------------------------|
//! | SIGTERM, SIGINT, SIGQUIT | forward to the service, then stop supervising  |
//! | SIGUSR1                  | terminate the service and start it again       |
//! | SIGHUP                   | reopen the logfile                             |
//!
//! # How?
//! `start` checks everything it can while it still has a terminal to complain to
//! (see [supervisor::validate]), forks into the background and then loops: fork the
//! service child, restrict it (see [sandbox]), exec the command, wait for it while
//! moving its output into the logfile, decide whether to start it again (see
//! [supervisor::policy]).
//!
//! The supervisor is a single thread without signal handlers. Signals are read from a
//! signalfd and the service is watched through a pidfd, so the main loop is one
//! `poll`. The platform specific pieces live in [platforms].
//!
//! # Where?
//! So far service-runner only supports Linux.
//!
//! service-runner is licensed under the MITNFA license.
#![crate_name = "service_runner"]
#![deny(unused)]
#![deny(unstable_features)]
#![warn(missing_docs)]
#![allow(rustdoc::private_intra_doc_links)]

/// Platform specific process, signal and file descriptor plumbing, behind a platform
/// independent facade.
mod platforms;

mod access;
mod cli;
mod client;
mod logging;
mod pidfile;
mod resolve;
mod rlimit;
mod sandbox;
mod service;
mod supervisor;

use clap::Parser;
use nix::errno::Errno;
use precisej_printable_errno::{
    ErrnoResult,
    ExitError,
    PrintableErrno,
    printable_error,
};
use std::io;

use crate::cli::{
    Cli,
    Command,
};


/// The program is called `service-runner`. The str referring to the program name is
/// saved in this constant. Useful for [precisej_printable_errno::PrintableResult].
const PROGRAM_NAME: &'static str = "service-runner";

/// [ErrnoResult] for `std::io` results.
///
/// Errors that carry an OS error code keep it; the others (like a pidfile that doesn't
/// contain a pid) are turned into a plain message.
trait IoResultExt<T> {
    fn printable_io(self, message: String) -> Result<T, PrintableErrno<String>>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn printable_io(self, message: String) -> Result<T, PrintableErrno<String>> {
        match self {
            Ok(value) => Ok(value),
            Err(e) => match e.raw_os_error() {
                Some(errno) => Err(Errno::from_i32(errno)).printable(PROGRAM_NAME, message),
                None => Err(printable_error(PROGRAM_NAME, format!("{}: {}", message, e))),
            },
        }
    }
}

/// The entry point of the program. This function is in charge of exiting with an error
/// code when [run] returns an [ExitError], or with the status [run] asks for.
fn main() {
    match run() {
        Ok(0) => {}
        Ok(status) => std::process::exit(status),
        Err(e) => e.eprint_and_exit(),
    }
}

/// Dispatch to the command. `start` only returns in the supervisor once it has stopped
/// (or in the invoking process right after forking it off); everything else is a
/// short-lived client.
fn run() -> Result<i32, ExitError<String>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => supervisor::start(args),
        Command::Stop(args) => client::stop(args),
        Command::Restart(target) => client::restart(target),
        Command::Status(target) => client::status(target),
        Command::Logrotate(target) => client::logrotate(target),
        Command::Logs(args) => client::logs(args),
        Command::Version => {
            println!("{} {}", PROGRAM_NAME, env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}
