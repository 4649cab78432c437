//! Classification of service terminations and the restart decision.
use nix::sys::signal::Signal;
use std::fmt;

use crate::service::RestartPolicy;


/// How the service process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Exited(i32),
    Killed(Signal),
    Dumped(Signal),
}

impl ExitCause {
    /// From the parts of a `WaitStatus::Signaled`.
    pub fn signaled(signal: Signal, core_dumped: bool) -> ExitCause {
        if core_dumped {
            ExitCause::Dumped(signal)
        } else {
            ExitCause::Killed(signal)
        }
    }

    /// `EXITED`, `KILLED` or `DUMPED`, as passed to the crash reporter.
    pub fn code(self) -> &'static str {
        match self {
            ExitCause::Exited(_) => "EXITED",
            ExitCause::Killed(_) => "KILLED",
            ExitCause::Dumped(_) => "DUMPED",
        }
    }

    /// Exit code or signal number, as passed to the crash reporter.
    pub fn status(self) -> i32 {
        match self {
            ExitCause::Exited(code) => code,
            ExitCause::Killed(signal) | ExitCause::Dumped(signal) => signal as i32,
        }
    }

    /// Terminated by one of the signals used to stop a service on purpose.
    ///
    /// SIGTERM is what a restart request sends, so with `restart_issued` it is not a
    /// stop.
    pub fn is_intentional_stop(self, restart_issued: bool) -> bool {
        match self {
            ExitCause::Killed(Signal::SIGTERM) => !restart_issued,
            ExitCause::Killed(Signal::SIGQUIT)
            | ExitCause::Killed(Signal::SIGINT)
            | ExitCause::Killed(Signal::SIGKILL) => true,
            _ => false,
        }
    }

    pub fn is_crash(self) -> bool {
        match self {
            ExitCause::Exited(code) => code != 0,
            ExitCause::Dumped(_) => true,
            ExitCause::Killed(signal) => !matches!(
                signal,
                Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGINT | Signal::SIGKILL
            ),
        }
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Exited(0) => f.write_str("exited normally"),
            ExitCause::Exited(code) => write!(f, "exited with error status {}", code),
            ExitCause::Killed(signal) => write!(f, "was killed by signal {} ({})", *signal as i32, signal.as_str()),
            ExitCause::Dumped(signal) => write!(
                f,
                "was killed by signal {} ({}) and dumped core",
                *signal as i32,
                signal.as_str(),
            ),
        }
    }
}

/// What the supervisor does after the service terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub crash: bool,
    pub restart: bool,
}

/// The restart decision. `running` is false once a stop signal reached the
/// supervisor; `restart_issued` is set by a restart request.
pub fn decide(policy: RestartPolicy, cause: ExitCause, running: bool, restart_issued: bool) -> Verdict {
    let crash = cause.is_crash();
    let restart = if !running || cause.is_intentional_stop(restart_issued) {
        false
    } else if restart_issued {
        true
    } else {
        match policy {
            RestartPolicy::Always => true,
            RestartPolicy::Never => false,
            RestartPolicy::Failure => crash,
        }
    };
    Verdict {
        crash,
        restart,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const POLICIES: [RestartPolicy; 3] = [RestartPolicy::Never, RestartPolicy::Always, RestartPolicy::Failure];

    #[test]
    fn exit_codes_crash_iff_nonzero() {
        for code in 0..=255 {
            let cause = ExitCause::Exited(code);
            assert_eq!(cause.is_crash(), code != 0, "code {}", code);
        }
    }

    #[test]
    fn classification_of_signals() {
        assert_eq!(ExitCause::signaled(Signal::SIGSEGV, true), ExitCause::Dumped(Signal::SIGSEGV));
        assert_eq!(ExitCause::signaled(Signal::SIGTERM, false), ExitCause::Killed(Signal::SIGTERM));

        assert!(ExitCause::Dumped(Signal::SIGQUIT).is_crash());
        assert!(ExitCause::Killed(Signal::SIGSEGV).is_crash());
        assert!(ExitCause::Killed(Signal::SIGHUP).is_crash());
        for signal in [Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGINT, Signal::SIGKILL].iter() {
            assert!(!ExitCause::Killed(*signal).is_crash());
            assert!(ExitCause::Killed(*signal).is_intentional_stop(false));
        }
        assert!(!ExitCause::Killed(Signal::SIGTERM).is_intentional_stop(true));
        assert!(ExitCause::Killed(Signal::SIGKILL).is_intentional_stop(true));
    }

    #[test]
    fn crash_reporter_arguments() {
        assert_eq!(ExitCause::Exited(3).code(), "EXITED");
        assert_eq!(ExitCause::Exited(3).status(), 3);
        assert_eq!(ExitCause::Killed(Signal::SIGSEGV).code(), "KILLED");
        assert_eq!(ExitCause::Dumped(Signal::SIGABRT).code(), "DUMPED");
        assert_eq!(ExitCause::Dumped(Signal::SIGABRT).status(), libc::SIGABRT);
    }

    #[test]
    fn never_stops_on_crash() {
        let verdict = decide(RestartPolicy::Never, ExitCause::Exited(1), true, false);
        assert_eq!(verdict, Verdict { crash: true, restart: false });
    }

    #[test]
    fn always_restarts_clean_exits() {
        let verdict = decide(RestartPolicy::Always, ExitCause::Exited(0), true, false);
        assert_eq!(verdict, Verdict { crash: false, restart: true });
    }

    #[test]
    fn failure_restarts_only_crashes() {
        assert!(decide(RestartPolicy::Failure, ExitCause::Exited(2), true, false).restart);
        assert!(decide(RestartPolicy::Failure, ExitCause::Dumped(Signal::SIGSEGV), true, false).restart);
        assert!(!decide(RestartPolicy::Failure, ExitCause::Exited(0), true, false).restart);
    }

    #[test]
    fn stop_signal_to_supervisor_wins() {
        for policy in POLICIES.iter() {
            for cause in [ExitCause::Exited(0), ExitCause::Exited(1), ExitCause::Killed(Signal::SIGTERM)].iter() {
                for restart_issued in [false, true].iter() {
                    assert!(!decide(*policy, *cause, false, *restart_issued).restart);
                }
            }
        }
    }

    #[test]
    fn intentional_stops_are_final_for_every_policy() {
        for policy in POLICIES.iter() {
            for signal in [Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGINT, Signal::SIGKILL].iter() {
                let verdict = decide(*policy, ExitCause::Killed(*signal), true, false);
                assert_eq!(verdict, Verdict { crash: false, restart: false }, "{:?} {:?}", policy, signal);
            }
        }
    }

    #[test]
    fn restart_request_restarts_for_every_policy() {
        for policy in POLICIES.iter() {
            let verdict = decide(*policy, ExitCause::Killed(Signal::SIGTERM), true, true);
            assert_eq!(verdict, Verdict { crash: false, restart: true });
            assert!(decide(*policy, ExitCause::Exited(0), true, true).restart);
            // killed harder than the restart asked for
            assert!(!decide(*policy, ExitCause::Killed(Signal::SIGKILL), true, true).restart);
        }
    }
}
