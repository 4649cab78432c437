use cstr::cstr;
use nix::{
    errno::Errno,
    fcntl::{
        FcntlArg,
        OFlag,
        SpliceFFlags,
        fcntl,
        open,
        splice,
    },
    poll::{
        PollFd,
        PollFlags,
        poll,
    },
    sys::{
        inotify::{
            AddWatchFlags,
            InitFlags,
            Inotify,
            WatchDescriptor,
        },
        signal::{
            SigHandler,
            SigSet,
            SigmaskHow::{
                SIG_BLOCK,
                SIG_UNBLOCK,
            },
            Signal,
            kill,
            sigprocmask,
        },
        signalfd::{
            SfdFlags,
            SignalFd,
        },
        stat::Mode,
        wait::{
            WaitPidFlag,
            WaitStatus,
            waitpid,
        },
    },
    unistd::{
        ForkResult,
        Pid,
        close,
        dup2,
        fork,
        pipe2,
        read,
        setsid,
        write,
    },
};
use precisej_printable_errno::{
    ErrnoResult,
    PrintableErrno,
};
use std::{
    convert::{
        Infallible,
        TryFrom,
    },
    os::unix::prelude::{
        AsRawFd,
        RawFd,
    },
    path::{
        Path,
        PathBuf,
    },
    ptr,
    thread,
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    PROGRAM_NAME,
    supervisor::policy::ExitCause,
};


/// Signals the supervisor handles itself. They stay blocked for its whole life and
/// are read from a signalfd instead.
const CONTROL_SIGNALS: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGCHLD,
];

const TRANSFER_CHUNK: usize = 64 * 1024;
const COPY_BUFFER: usize = 8 * 1024;
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_PREMATURE: i32 = 127;


fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            // round up, a zero timeout would turn waiting into busy polling
            let millis = (timeout.as_nanos() + 999_999) / 1_000_000;
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

pub(crate) fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> nix::Result<Vec<bool>> {
    let mut pollfds: Vec<PollFd> = fds.iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    match poll(&mut pollfds, poll_timeout(timeout)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(e),
    }
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
    Ok(pollfds.iter()
        .map(|pollfd| pollfd.revents().map_or(false, |revents| revents.intersects(ready)))
        .collect())
}


pub(crate) struct OpaqueSignalFd {
    set: SigSet,
    fd: SignalFd,
}
impl OpaqueSignalFd {
    pub(crate) fn control() -> Result<OpaqueSignalFd, PrintableErrno<String>> {
        let mut set = SigSet::empty();
        for signal in CONTROL_SIGNALS.iter() {
            set.add(*signal);
        }
        sigprocmask(SIG_BLOCK, Some(&set), None)
            .printable(PROGRAM_NAME, "unable to block control signals".to_string())?;
        let fd = SignalFd::with_flags(&set, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .printable(PROGRAM_NAME, "unable to create signalfd".to_string())?;
        Ok(OpaqueSignalFd {
            set,
            fd,
        })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Signal masks survive `exec`, so the service child has to unblock them. The
    /// same goes for ignored signals: the Rust runtime ignores SIGPIPE, the service
    /// gets the default back.
    pub(crate) fn unblock(&self) -> Result<(), PrintableErrno<String>> {
        // SAFETY: SigDfl installs no handler.
        unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }
            .printable(PROGRAM_NAME, "unable to restore SIGPIPE in child".to_string())?;
        sigprocmask(SIG_UNBLOCK, Some(&self.set), None)
            .printable(PROGRAM_NAME, "unable to unblock signals in child".to_string())
    }

    pub(crate) fn read_next(&mut self) -> Result<Option<Signal>, PrintableErrno<String>> {
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => match Signal::try_from(info.ssi_signo as libc::c_int) {
                    Ok(signal) => return Ok(Some(signal)),
                    Err(_) => continue,
                },
                Ok(None) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).printable(PROGRAM_NAME, "unable to read from signalfd".to_string()),
            }
        }
    }

    pub(crate) fn wait_for_next(&mut self, timeout: Option<Duration>) -> Result<Option<Signal>, PrintableErrno<String>> {
        if let Some(signal) = self.read_next()? {
            return Ok(Some(signal));
        }
        poll_readable(&[self.as_raw_fd()], timeout)
            .printable(PROGRAM_NAME, "unable to wait for signals".to_string())?;
        self.read_next()
    }
}


fn pidfd_open(pid: Pid) -> nix::Result<RawFd> {
    // SAFETY: plain syscall without pointer arguments.
    let res = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    Errno::result(res).map(|fd| fd as RawFd)
}

fn pidfd_send_signal(pidfd: RawFd, signal: Signal) -> nix::Result<()> {
    // SAFETY: a null siginfo is allowed and makes the kernel fill in SI_USER.
    let res = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd,
            signal as libc::c_int,
            ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    Errno::result(res).map(drop)
}

pub(crate) fn process_alive(pid: Pid) -> nix::Result<bool> {
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

/// A pid plus, where the kernel supports it, a pidfd for it. Signals sent through
/// the pidfd can't hit a recycled pid.
pub(crate) struct OpaquePidHandle {
    pid: Pid,
    pidfd: Option<RawFd>,
}
impl OpaquePidHandle {
    pub(crate) fn open(pid: Pid) -> nix::Result<OpaquePidHandle> {
        let pidfd = match pidfd_open(pid) {
            Ok(fd) => Some(fd),
            Err(Errno::ENOSYS) => None,
            Err(e) => return Err(e),
        };
        Ok(OpaquePidHandle {
            pid,
            pidfd,
        })
    }

    /// A handle on our own, just forked `child`. It is never refused: without a
    /// pidfd the child is still ours to signal and reap, and its exit is noticed
    /// through SIGCHLD.
    pub(crate) fn adopt(child: Pid) -> OpaquePidHandle {
        OpaquePidHandle::adopt_opened(child, pidfd_open(child))
    }

    pub(crate) fn adopt_opened(child: Pid, opened: nix::Result<RawFd>) -> OpaquePidHandle {
        let pidfd = match opened {
            Ok(fd) => Some(fd),
            Err(Errno::ENOSYS) => None,
            Err(e) => {
                tracing::error!("unable to open pidfd for service {}, watching the pid instead: {}", child, e);
                None
            }
        };
        OpaquePidHandle {
            pid: child,
            pidfd,
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn pidfd(&self) -> Option<RawFd> {
        self.pidfd
    }

    pub(crate) fn send(&self, signal: Signal) -> nix::Result<()> {
        if let Some(pidfd) = self.pidfd {
            match pidfd_send_signal(pidfd, signal) {
                Err(Errno::ENOSYS) => {}
                other => return other,
            }
        }
        kill(self.pid, signal)
    }

    /// Wait until the process is gone. `None` waits forever. Returns false on timeout.
    pub(crate) fn wait_exit(&self, timeout: Option<Duration>) -> nix::Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let remaining = || deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match self.pidfd {
            Some(pidfd) => loop {
                let left = remaining();
                if poll_readable(&[pidfd], left)?[0] {
                    return Ok(true);
                }
                if left.map_or(false, |left| left.as_nanos() == 0) {
                    return Ok(false);
                }
            },
            None => loop {
                if !process_alive(self.pid)? {
                    return Ok(true);
                }
                match remaining() {
                    Some(left) if left.as_nanos() == 0 => return Ok(false),
                    Some(left) => thread::sleep(left.min(LIVENESS_POLL_INTERVAL)),
                    None => thread::sleep(LIVENESS_POLL_INTERVAL),
                }
            },
        }
    }

    pub(crate) fn try_reap(&self) -> nix::Result<Option<ExitCause>> {
        loop {
            return match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitCause::Exited(code))),
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => Ok(Some(ExitCause::signaled(signal, core_dumped))),
                // StillAlive, or stopped/continued which we don't ask for
                Ok(_) => Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => Err(e),
            };
        }
    }
}
impl Drop for OpaquePidHandle {
    fn drop(&mut self) {
        if let Some(pidfd) = self.pidfd.take() {
            let _ = close(pidfd);
        }
    }
}

/// Fork a child running `setup`. `setup` only returns on failure; the child then
/// logs the error, asks `runner` to terminate (so a command that can never start
/// doesn't get respawned forever) and exits with 127.
pub(crate) fn spawn_child<F>(runner: Pid, setup: F) -> Result<Pid, PrintableErrno<String>>
where
    F: FnOnce() -> Result<Infallible, PrintableErrno<String>>,
{
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            // SAFETY: the supervisor is single threaded, so everything is still
            // consistent after fork.
            let Err(e) = setup();
            tracing::error!("{}", e);
            let _ = kill(runner, Signal::SIGTERM);
            unsafe { libc::_exit(EXIT_PREMATURE) }
        }
        Err(errno) => Err(errno).printable(PROGRAM_NAME, "unable to fork service process".to_string()),
    }
}

/// Fork into the background. Only the child returns `true`; it also becomes the
/// leader of a new session.
pub(crate) fn detach() -> Result<bool, PrintableErrno<String>> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => Ok(false),
        Ok(ForkResult::Child) => {
            setsid().printable(PROGRAM_NAME, "unable to create new session".to_string())?;
            Ok(true)
        }
        Err(errno) => Err(errno).printable(PROGRAM_NAME, "unable to fork supervisor".to_string()),
    }
}

pub(crate) fn stdin_from_null() -> Result<(), PrintableErrno<String>> {
    let fd = open(cstr!("/dev/null"), OFlag::O_RDONLY, Mode::empty())
        .printable(PROGRAM_NAME, "unable to open /dev/null".to_string())?;
    if fd != libc::STDIN_FILENO {
        dup2(fd, libc::STDIN_FILENO)
            .printable(PROGRAM_NAME, "unable to redirect stdin".to_string())?;
        close(fd).printable(PROGRAM_NAME, "unable to close /dev/null".to_string())?;
    }
    Ok(())
}

pub(crate) fn set_priority(priority: i32) -> Result<(), PrintableErrno<String>> {
    // SAFETY: plain syscall without pointer arguments.
    let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    Errno::result(res)
        .map(drop)
        .printable(PROGRAM_NAME, format!("unable to set process priority to {}", priority))
}

/// A pipe whose read end doesn't block. Both ends are close-on-exec; the child's
/// dup2 onto stdout/stderr clears the flag for the copies.
pub(crate) fn output_pipe() -> nix::Result<(RawFd, RawFd)> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
    if let Err(e) = fcntl(read_end, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
        let _ = close(read_end);
        let _ = close(write_end);
        return Err(e);
    }
    Ok((read_end, write_end))
}

fn copy_chunk(from: RawFd, to: RawFd) -> nix::Result<usize> {
    let mut buf = [0u8; COPY_BUFFER];
    let count = read(from, &mut buf)?;
    let mut offset = 0;
    while offset < count {
        match write(to, &buf[offset..count]) {
            Ok(written) => offset += written,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}

pub(crate) fn transfer(from: RawFd, to: RawFd, zero_copy: &mut bool) -> nix::Result<usize> {
    let mut total = 0;
    loop {
        let moved = if *zero_copy {
            match splice(from, None, to, None, TRANSFER_CHUNK, SpliceFFlags::SPLICE_F_NONBLOCK) {
                // some filesystems and O_APPEND targets don't do splice
                Err(Errno::EINVAL) => {
                    *zero_copy = false;
                    continue;
                }
                other => other,
            }
        } else {
            copy_chunk(from, to)
        };
        match moved {
            Ok(0) => return Ok(total),
            Ok(count) => total += count,
            Err(Errno::EAGAIN) => return Ok(total),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Where the process' stdout points to. Readable by anyone allowed to inspect it.
pub(crate) fn stdout_path(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{}/fd/1", pid))
}

/// An inotify instance watching a single file for appended data.
pub(crate) struct OpaqueFileWatch {
    inotify: Inotify,
    watch: Option<WatchDescriptor>,
}
impl OpaqueFileWatch {
    pub(crate) fn new() -> nix::Result<OpaqueFileWatch> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
        Ok(OpaqueFileWatch {
            inotify,
            watch: None,
        })
    }

    /// Replace the watched file. Symlinks (like the ones in /proc) are followed.
    pub(crate) fn watch(&mut self, path: &Path) -> nix::Result<()> {
        if let Some(watch) = self.watch.take() {
            // the watch is already gone if the file was deleted
            let _ = self.inotify.rm_watch(watch);
        }
        let flags = AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CLOSE_WRITE;
        self.watch = Some(self.inotify.add_watch(path, flags)?);
        Ok(())
    }

    /// Wait up to `timeout` for a change. Returns whether something happened.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> nix::Result<bool> {
        if !poll_readable(&[self.inotify.as_raw_fd()], timeout)?[0] {
            return Ok(false);
        }
        match self.inotify.read_events() {
            Ok(events) => Ok(!events.is_empty()),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
impl Drop for OpaqueFileWatch {
    fn drop(&mut self) {
        let _ = close(self.inotify.as_raw_fd());
    }
}
