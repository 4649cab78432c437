use cfg_if::cfg_if;
use nix::{
    sys::signal::Signal,
    unistd::Pid,
};
use precisej_printable_errno::PrintableErrno;
use std::{
    convert::Infallible,
    os::unix::io::RawFd,
    path::Path,
    time::Duration,
};

use crate::supervisor::policy::ExitCause;

#[cfg(target_os = "linux")]
mod linux;


pub mod process {
    use cfg_if::cfg_if;
    use nix::unistd::Pid;
    use precisej_printable_errno::PrintableErrno;

    #[cfg(target_os = "linux")]
    use crate::platforms::linux;

    /// Whether a process with this pid exists. A process we aren't allowed to signal
    /// still counts as alive.
    pub fn alive(pid: Pid) -> nix::Result<bool> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::process_alive(pid)
            } else {
                unimplemented!()
            }
        }
    }

    /// Fork the supervisor into the background, in a new session. Returns `true` in
    /// the child and `false` in the parent.
    pub fn detach() -> Result<bool, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::detach()
            } else {
                unimplemented!()
            }
        }
    }

    pub fn stdin_from_null() -> Result<(), PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::stdin_from_null()
            } else {
                unimplemented!()
            }
        }
    }

    /// A path that resolves to whatever the process' stdout currently is.
    pub fn stdout_path(pid: Pid) -> std::path::PathBuf {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::stdout_path(pid)
            } else {
                unimplemented!()
            }
        }
    }

    /// Scheduling priority of the calling process, inherited by the service.
    pub fn set_priority(priority: i32) -> Result<(), PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::set_priority(priority)
            } else {
                unimplemented!()
            }
        }
    }
}

pub mod io {
    use cfg_if::cfg_if;
    use std::{
        os::unix::io::RawFd,
        time::Duration,
    };

    #[cfg(target_os = "linux")]
    use crate::platforms::linux;

    /// Non-blocking read end and blocking write end of a fresh close-on-exec pipe.
    pub fn output_pipe() -> nix::Result<(RawFd, RawFd)> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::output_pipe()
            } else {
                unimplemented!()
            }
        }
    }

    /// Move everything currently readable from `from` to `to` without blocking.
    ///
    /// Uses splice while `zero_copy` is set and clears it the first time the kernel
    /// refuses, falling back to a plain read/write copy.
    pub fn transfer(from: RawFd, to: RawFd, zero_copy: &mut bool) -> nix::Result<usize> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::transfer(from, to, zero_copy)
            } else {
                unimplemented!()
            }
        }
    }

    /// Wait for any of `fds` to become readable (or hung up). `None` waits forever.
    /// An interrupted wait reports nothing ready.
    pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> nix::Result<Vec<bool>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                linux::poll_readable(fds, timeout)
            } else {
                unimplemented!()
            }
        }
    }
}

/// Notification about data appended to a file.
pub struct FileWatch {
    #[cfg(target_os = "linux")]
    opaque: linux::OpaqueFileWatch,
}
impl FileWatch {
    pub fn new() -> nix::Result<FileWatch> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(FileWatch {
                    opaque: linux::OpaqueFileWatch::new()?
                })
            } else {
                unimplemented!()
            }
        }
    }

    /// Watch `path` instead of the previous file.
    pub fn watch(&mut self, path: &Path) -> nix::Result<()> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.watch(path)
            } else {
                unimplemented!()
            }
        }
    }

    /// Wait up to `timeout` for the file to change. `Ok(false)` if nothing happened.
    pub fn wait(&mut self, timeout: Option<Duration>) -> nix::Result<bool> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.wait(timeout)
            } else {
                unimplemented!()
            }
        }
    }
}

pub use self::{
    io::transfer,
    process::alive as process_alive,
};


/// What a signal delivered to the supervisor asks it to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcSignal {
    /// SIGTERM, SIGINT or SIGQUIT: forward it to the service and don't restart.
    Stop(Signal),
    /// SIGUSR1: terminate the service and start it again.
    Restart,
    /// SIGHUP: reopen the logfile.
    Reopen,
    /// SIGCHLD
    ChildExited,
}

impl ProcSignal {
    fn from_signal(signal: Signal) -> Option<ProcSignal> {
        match signal {
            Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT => Some(ProcSignal::Stop(signal)),
            Signal::SIGUSR1 => Some(ProcSignal::Restart),
            Signal::SIGHUP => Some(ProcSignal::Reopen),
            Signal::SIGCHLD => Some(ProcSignal::ChildExited),
            _ => None,
        }
    }
}

pub struct ProcSignalInterceptor {
    #[cfg(target_os = "linux")]
    opaque: linux::OpaqueSignalFd,
}
impl ProcSignalInterceptor {
    /// Block the control signals and start receiving them through a descriptor.
    pub fn intercept_control() -> Result<ProcSignalInterceptor, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(ProcSignalInterceptor {
                    opaque: linux::OpaqueSignalFd::control()?
                })
            } else {
                unimplemented!()
            }
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.as_raw_fd()
            } else {
                unimplemented!()
            }
        }
    }

    /// Undo the blocking in a forked child before it execs.
    pub fn release(&self) -> Result<(), PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.unblock()
            } else {
                unimplemented!()
            }
        }
    }

    /// The next pending signal, if any, without waiting.
    pub fn next_pending(&mut self) -> Result<Option<ProcSignal>, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                loop {
                    match self.opaque.read_next()? {
                        Some(signal) => match ProcSignal::from_signal(signal) {
                            Some(sig) => break Ok(Some(sig)),
                            None => continue,
                        },
                        None => break Ok(None),
                    }
                }
            } else {
                unimplemented!()
            }
        }
    }

    /// Wait up to `timeout` for the next signal. `Ok(None)` means the time ran out.
    pub fn wait_for_next(&mut self, timeout: Option<Duration>) -> Result<Option<ProcSignal>, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                match self.opaque.wait_for_next(timeout)? {
                    Some(signal) => match ProcSignal::from_signal(signal) {
                        Some(sig) => Ok(Some(sig)),
                        None => self.next_pending(),
                    },
                    None => Ok(None),
                }
            } else {
                unimplemented!()
            }
        }
    }
}

/// A handle on a process, pinned with a pidfd when the kernel has them.
pub struct PidHandle {
    #[cfg(target_os = "linux")]
    opaque: linux::OpaquePidHandle,
}
impl PidHandle {
    pub fn open(pid: Pid) -> nix::Result<PidHandle> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(PidHandle {
                    opaque: linux::OpaquePidHandle::open(pid)?
                })
            } else {
                unimplemented!()
            }
        }
    }

    /// Fork a child that runs `setup`. See [linux::spawn_child] for what happens when
    /// `setup` fails. Once the fork succeeded this can't fail anymore, so the child is
    /// never left without a handle.
    pub fn spawn<F>(runner: Pid, setup: F) -> Result<PidHandle, PrintableErrno<String>>
    where
        F: FnOnce() -> Result<Infallible, PrintableErrno<String>>,
    {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                let child = linux::spawn_child(runner, setup)?;
                Ok(PidHandle {
                    opaque: linux::OpaquePidHandle::adopt(child)
                })
            } else {
                unimplemented!()
            }
        }
    }

    pub fn pid(&self) -> Pid {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.pid()
            } else {
                unimplemented!()
            }
        }
    }

    /// A descriptor that turns readable when the process exits, if there is one.
    /// Without it the caller has to rely on SIGCHLD.
    pub fn exit_fd(&self) -> Option<RawFd> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.pidfd()
            } else {
                unimplemented!()
            }
        }
    }

    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.send(signal)
            } else {
                unimplemented!()
            }
        }
    }

    /// Wait for the process to disappear. Returns `false` if `timeout` ran out first.
    pub fn wait_exit(&self, timeout: Option<Duration>) -> nix::Result<bool> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.wait_exit(timeout)
            } else {
                unimplemented!()
            }
        }
    }

    /// Collect the exit status of a child without blocking.
    pub fn try_reap(&self) -> nix::Result<Option<ExitCause>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.try_reap()
            } else {
                unimplemented!()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;
    use std::{
        fs,
        io::Write,
        os::unix::io::AsRawFd,
        process::Command,
    };

    #[test]
    fn signal_mapping() {
        assert_eq!(ProcSignal::from_signal(Signal::SIGTERM), Some(ProcSignal::Stop(Signal::SIGTERM)));
        assert_eq!(ProcSignal::from_signal(Signal::SIGQUIT), Some(ProcSignal::Stop(Signal::SIGQUIT)));
        assert_eq!(ProcSignal::from_signal(Signal::SIGUSR1), Some(ProcSignal::Restart));
        assert_eq!(ProcSignal::from_signal(Signal::SIGHUP), Some(ProcSignal::Reopen));
        assert_eq!(ProcSignal::from_signal(Signal::SIGCHLD), Some(ProcSignal::ChildExited));
        assert_eq!(ProcSignal::from_signal(Signal::SIGUSR2), None);
    }

    #[test]
    fn we_are_alive() {
        assert!(process_alive(getpid()).unwrap());
    }

    #[test]
    fn handle_waits_for_exit() {
        let mut child = Command::new("/bin/sleep").arg("0.2").spawn().unwrap();
        let handle = PidHandle::open(Pid::from_raw(child.id() as i32)).unwrap();
        assert!(!handle.wait_exit(Some(Duration::from_millis(10))).unwrap());
        // exited but unreaped still counts as gone for a pidfd; reap to be sure
        // the kill(0) fallback agrees
        child.wait().unwrap();
        assert!(handle.wait_exit(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn handle_reaps_signalled_child() {
        let child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let handle = PidHandle::open(Pid::from_raw(child.id() as i32)).unwrap();
        assert_eq!(handle.try_reap().unwrap(), None);
        handle.signal(Signal::SIGKILL).unwrap();
        let mut cause = None;
        for _ in 0..500 {
            cause = handle.try_reap().unwrap();
            if cause.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cause, Some(ExitCause::Killed(Signal::SIGKILL)));
    }

    #[test]
    fn adopted_child_without_pidfd_is_still_handled() {
        let child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let handle = PidHandle {
            opaque: linux::OpaquePidHandle::adopt_opened(pid, Err(nix::errno::Errno::EMFILE)),
        };
        assert_eq!(handle.pid(), pid);
        assert_eq!(handle.exit_fd(), None);
        assert_eq!(handle.try_reap().unwrap(), None);

        handle.signal(Signal::SIGTERM).unwrap();
        let mut cause = None;
        for _ in 0..500 {
            cause = handle.try_reap().unwrap();
            if cause.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cause, Some(ExitCause::Killed(Signal::SIGTERM)));
    }

    #[test]
    fn transfer_drains_pipe_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let file = fs::OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let (read_end, write_end) = io::output_pipe().unwrap();
        let mut writer = unsafe { <fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(write_end) };
        writer.write_all(b"hello\nworld\n").unwrap();

        let mut zero_copy = true;
        assert_eq!(transfer(read_end, file.as_raw_fd(), &mut zero_copy).unwrap(), 12);
        // nothing left, and the empty non-blocking pipe doesn't block
        assert_eq!(transfer(read_end, file.as_raw_fd(), &mut zero_copy).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\nworld\n");
        nix::unistd::close(read_end).unwrap();
    }
}
