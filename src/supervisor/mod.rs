//! The supervisor: validates the service, detaches from the terminal and then keeps
//! the service running until it is told to stop or the restart policy gives up.
//!
//! All state lives in one [Supervisor] owned by a single thread. Signals are not
//! handled asynchronously; they are blocked and read from a descriptor that is polled
//! together with the service's pidfd and its output pipe, so every state change
//! happens in the loop itself.
pub mod policy;
pub mod validate;

use chrono::Local;
use nix::{
    sys::signal::Signal,
    unistd::{
        Pid,
        close,
        getpid,
    },
};
use precisej_printable_errno::{
    ErrnoResult,
    ExitError,
    PrintableErrno,
    PrintableResult,
    printable_error,
};
use std::{
    os::unix::io::RawFd,
    process::Command,
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    IoResultExt,
    PROGRAM_NAME,
    cli::StartArgs,
    logging::{
        self,
        logfile::LogFile,
    },
    pidfile::{
        self,
        Liveness,
    },
    platforms::{
        PidHandle,
        ProcSignal,
        ProcSignalInterceptor,
        io,
        process,
    },
    sandbox::SandboxPlan,
    service::ServiceSpec,
    supervisor::policy::{
        ExitCause,
        decide,
    },
};


/// The pipe carrying the service's stdout and stderr. The write end is only needed
/// until the child has it.
struct OutputPipe {
    read: RawFd,
    write: Option<RawFd>,
    open: bool,
}

impl OutputPipe {
    fn new() -> Result<OutputPipe, PrintableErrno<String>> {
        let (read, write) = io::output_pipe()
            .printable(PROGRAM_NAME, "unable to create output pipe".to_string())?;
        Ok(OutputPipe {
            read,
            write: Some(write),
            open: true,
        })
    }

    fn close_write(&mut self) {
        if let Some(fd) = self.write.take() {
            let _ = close(fd);
        }
    }
}

impl Drop for OutputPipe {
    fn drop(&mut self) {
        self.close_write();
        let _ = close(self.read);
    }
}

/// Check for a previous supervisor. Returns `false` if one is still running.
///
/// The pidfiles of a supervisor that died without cleaning up are removed, unless its
/// service outlived it.
fn preflight(spec: &ServiceSpec) -> Result<bool, PrintableErrno<String>> {
    let pidfiles = &spec.pidfiles;
    let runner = pidfile::probe(pidfiles.runner())
        .printable_io(format!("unable to check {}", pidfiles.runner().display()))?;
    if let Liveness::Alive(pid) = runner {
        printable_error(PROGRAM_NAME, format!("{} is already running (pid {})", spec.name, pid)).eprint();
        return Ok(false);
    }

    let service = pidfile::probe(pidfiles.service())
        .printable_io(format!("unable to check {}", pidfiles.service().display()))?;
    if let Liveness::Alive(pid) = service {
        return Err(printable_error(
            PROGRAM_NAME,
            format!("{} is still running as pid {} without a supervisor", spec.name, pid),
        ));
    }

    if runner != Liveness::Missing || service != Liveness::Missing {
        pidfiles.remove_all()
            .printable_io(format!("unable to remove stale pidfiles of {}", spec.name))?;
    }
    Ok(true)
}

/// Bring up the supervisor for the arguments of `start`.
///
/// Returns in the invoking process as soon as the supervisor is detached, and in the
/// supervisor itself once it stopped. Errors before detaching are reported to the
/// terminal, later errors go to the logfile.
pub fn start(args: StartArgs) -> Result<i32, ExitError<String>> {
    let spec = validate::service_spec(args).bail(1)?;
    if !preflight(&spec).bail(1)? {
        return Ok(0);
    }

    let logfile = LogFile::open(spec.logfile.clone(), &Local::now(), spec.logfile_owner()).bail(1)?;
    if let Some(priority) = spec.priority {
        process::set_priority(priority).bail(1)?;
    }
    if !spec.foreground && !process::detach().bail(1)? {
        return Ok(0);
    }

    let signals = ProcSignalInterceptor::intercept_control().bail(1)?;
    let mut supervisor = Supervisor {
        spec,
        logfile,
        signals,
        running: true,
        restart_issued: false,
    };
    if let Err(e) = supervisor.bring_up() {
        tracing::error!("{}", e);
        supervisor.tear_down();
        return Ok(1);
    }

    let status = match supervisor.supervise() {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    };
    supervisor.tear_down();
    Ok(status)
}

struct Supervisor {
    spec: ServiceSpec,
    logfile: LogFile,
    signals: ProcSignalInterceptor,
    running: bool,
    restart_issued: bool,
}

impl Supervisor {
    /// The logger comes first: until stdout is redirected its lines still reach the
    /// invoking terminal.
    fn bring_up(&mut self) -> Result<(), PrintableErrno<String>> {
        logging::init(&self.spec.log_format);
        self.logfile.redirect_stdio()?;
        process::stdin_from_null()?;
        pidfile::write(self.spec.pidfiles.runner(), getpid())
            .printable_io(format!("unable to write {}", self.spec.pidfiles.runner().display()))
    }

    fn tear_down(&self) {
        if let Err(e) = self.spec.pidfiles.remove_all() {
            tracing::error!("unable to remove pidfiles of {}: {}", self.spec.name, e);
        }
        tracing::info!("{} stopped", self.spec.name);
    }

    fn reopen_log(&mut self) {
        match self.logfile.reopen(&Local::now()) {
            Ok(()) => tracing::info!("reopened logfile {}", self.logfile.path().display()),
            Err(e) => tracing::error!("{}", e),
        }
    }

    /// Rotate if the pattern expands to a new name, then move the available output.
    /// Returns `false` once the pipe reached end of file.
    fn forward_output(&mut self, pipe: RawFd) -> bool {
        match self.logfile.rotate(&Local::now()) {
            Ok(true) => tracing::info!("switched to logfile {}", self.logfile.path().display()),
            Ok(false) => {}
            Err(e) => tracing::error!("{}", e),
        }
        match self.logfile.drain_from(pipe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => {
                tracing::error!("{}", e);
                true
            }
        }
    }

    /// Handle stop requests and reopen requests that arrived while no service was
    /// running. Restart requests have nothing to act on.
    fn consume_pending(&mut self) -> Result<(), PrintableErrno<String>> {
        while let Some(signal) = self.signals.next_pending()? {
            match signal {
                ProcSignal::Stop(signal) => {
                    tracing::info!("received signal {}, stopping", signal as i32);
                    self.running = false;
                }
                ProcSignal::Reopen => self.reopen_log(),
                ProcSignal::Restart | ProcSignal::ChildExited => {}
            }
        }
        Ok(())
    }

    fn handle_signal(&mut self, signal: ProcSignal, service: &PidHandle) {
        match signal {
            ProcSignal::Stop(signal) => {
                tracing::info!("received signal {}, forwarding to {}", signal as i32, service.pid());
                self.running = false;
                if let Err(e) = service.signal(signal) {
                    tracing::error!("unable to send signal {} to {}: {}", signal as i32, service.pid(), e);
                }
            }
            ProcSignal::Restart => {
                tracing::info!("restart requested, terminating {}", service.pid());
                self.restart_issued = true;
                if let Err(e) = service.signal(Signal::SIGTERM) {
                    tracing::error!("unable to send signal {} to {}: {}", Signal::SIGTERM as i32, service.pid(), e);
                }
            }
            ProcSignal::Reopen => self.reopen_log(),
            // reaped at the top of the wait loop
            ProcSignal::ChildExited => {}
        }
    }

    fn spawn(&self, plan: &SandboxPlan, output: Option<RawFd>, runner: Pid) -> Result<PidHandle, PrintableErrno<String>> {
        let spec = &self.spec;
        let signals = &self.signals;
        PidHandle::spawn(runner, || {
            pidfile::write(spec.pidfiles.service(), getpid())
                .printable_io(format!("(child) unable to write {}", spec.pidfiles.service().display()))?;
            plan.apply(output)?;
            signals.release()?;
            spec.exec.exec()
                .printable(PROGRAM_NAME, format!("(child) execv({:?})", spec.exec.path()))
        })
    }

    /// Wait until the service exits, forwarding its output and handling signals in
    /// the meantime.
    fn watch(&mut self, service: &PidHandle, mut output: Option<&mut OutputPipe>) -> Result<ExitCause, PrintableErrno<String>> {
        loop {
            if let Some(cause) = service.try_reap()
                .printable(PROGRAM_NAME, format!("unable to wait for {}", service.pid()))?
            {
                return Ok(cause);
            }

            // readiness is recomputed on every pass
            let mut fds = vec![self.signals.as_raw_fd()];
            if let Some(fd) = service.exit_fd() {
                fds.push(fd);
            }
            let pipe = match output.as_deref() {
                Some(pipe) if pipe.open => {
                    fds.push(pipe.read);
                    Some((fds.len() - 1, pipe.read))
                }
                _ => None,
            };

            let ready = io::poll_readable(&fds, None)
                .printable(PROGRAM_NAME, "unable to wait for service events".to_string())?;

            if let Some((index, fd)) = pipe {
                if ready[index] && !self.forward_output(fd) {
                    if let Some(pipe) = output.as_deref_mut() {
                        pipe.open = false;
                    }
                }
            }
            if ready[0] {
                while let Some(signal) = self.signals.next_pending()? {
                    self.handle_signal(signal, service);
                }
            }
        }
    }

    fn report_crash(&self, cause: ExitCause) -> Duration {
        let started = Instant::now();
        if let Some(command) = &self.spec.crash_report {
            let result = Command::new(command)
                .arg(self.spec.name.as_str())
                .arg(cause.code())
                .arg(cause.status().to_string())
                .arg(self.logfile.path())
                .status();
            match result {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::error!("crash report {} failed: {}", command.display(), status),
                Err(e) => tracing::error!("unable to run crash report {}: {}", command.display(), e),
            }
        }
        started.elapsed()
    }

    /// Sleep for `delay` unless a signal cuts it short. A stop request ends
    /// supervision, a restart request ends the wait.
    fn backoff(&mut self, delay: Duration) -> Result<(), PrintableErrno<String>> {
        let deadline = Instant::now() + delay;
        while self.running {
            let left = deadline.saturating_duration_since(Instant::now());
            if left == Duration::from_secs(0) {
                break;
            }
            match self.signals.wait_for_next(Some(left))? {
                Some(ProcSignal::Stop(signal)) => {
                    tracing::info!("received signal {}, not restarting {}", signal as i32, self.spec.name);
                    self.running = false;
                }
                Some(ProcSignal::Reopen) => self.reopen_log(),
                Some(ProcSignal::Restart) => break,
                Some(ProcSignal::ChildExited) | None => {}
            }
        }
        Ok(())
    }

    fn supervise(&mut self) -> Result<(), PrintableErrno<String>> {
        let runner = getpid();
        let plan = SandboxPlan::for_service(&self.spec);
        tracing::info!("supervising {} as pid {}", self.spec.name, runner);

        loop {
            self.consume_pending()?;
            if !self.running {
                break;
            }

            let mut output = if self.spec.captures_output() {
                Some(OutputPipe::new()?)
            } else {
                None
            };
            let service = self.spawn(&plan, output.as_ref().and_then(|pipe| pipe.write), runner)?;
            if let Some(pipe) = output.as_mut() {
                pipe.close_write();
            }
            tracing::info!("started {} (pid {}): {}", self.spec.name, service.pid(), self.spec.exec.path().display());

            let cause = match self.watch(&service, output.as_mut()) {
                Ok(cause) => cause,
                Err(e) => {
                    let _ = service.signal(Signal::SIGTERM);
                    return Err(e);
                }
            };
            if let Some(pipe) = output.take() {
                if pipe.open {
                    self.forward_output(pipe.read);
                }
            }

            let restart_issued = std::mem::replace(&mut self.restart_issued, false);
            tracing::info!("{} {}", self.spec.name, cause);
            let verdict = decide(self.spec.restart, cause, self.running, restart_issued);
            if self.running && cause.is_intentional_stop(restart_issued) {
                tracing::info!("service stopped via signal {} -> don't restart", cause.status());
            }
            self.running = verdict.restart;

            if verdict.crash {
                let spent = self.report_crash(cause);
                if self.running {
                    self.backoff(self.spec.restart_sleep.saturating_sub(spent))?;
                }
            }
            if self.running {
                tracing::info!("restarting {}...", self.spec.name);
            }
        }
        Ok(())
    }
}
