//! The command line surface. Parsing only; every command lives in its own module.
use clap::{
    Args,
    Parser,
    Subcommand,
};
use nix::sys::stat::Mode;
use std::{
    ffi::OsString,
    path::PathBuf,
};

use crate::{
    logging::LogFormat,
    rlimit::ResourceLimit,
    service::{
        RestartPolicy,
        ServiceName,
    },
};


#[derive(Debug, Parser)]
#[command(name = "service-runner", version, about = "Run a single command as a supervised, restarting service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a service in the background.
    Start(StartArgs),
    /// Stop a running service.
    Stop(StopArgs),
    /// Terminate the service and start it again, keeping the supervisor.
    Restart(TargetArgs),
    /// Report whether a service is running.
    Status(TargetArgs),
    /// Make the supervisor reopen its logfile.
    Logrotate(TargetArgs),
    /// Print the current logfile of a service.
    Logs(LogsArgs),
    /// Print the version.
    Version,
}

/// Selects a service, through its pidfile.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Name of the service.
    pub name: ServiceName,

    /// Service pidfile; the supervisor pidfile is this with ".runner" appended.
    /// [default: /var/run/<NAME>.pid]
    #[arg(short, long, value_name = "FILE")]
    pub pidfile: Option<PathBuf>,
}

impl TargetArgs {
    pub fn pidfile(&self) -> PathBuf {
        self.pidfile.clone().unwrap_or_else(|| self.name.default_pidfile())
    }
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Logfile, may contain strftime placeholders; the file is switched whenever
    /// the expansion changes. [default: /var/log/<NAME>-%Y-%m-%d.log]
    #[arg(short, long, value_name = "FILE")]
    pub logfile: Option<String>,

    /// Give the logfile to the user/group the service runs as.
    #[arg(long)]
    pub chown_logfile: bool,

    /// text, json, xml, sql, csv or template:<TEMPLATE>.
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Run the service as this user (name or uid).
    #[arg(short, long)]
    pub user: Option<String>,

    /// Run the service as this group (name or gid). Defaults to the primary group
    /// of --user.
    #[arg(short, long)]
    pub group: Option<String>,

    /// Scheduling priority of the supervisor and the service.
    #[arg(
        short = 'N',
        long,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i32).range(-20..=19),
    )]
    pub priority: Option<i32>,

    /// Resource limit as RESOURCE:SOFT[:HARD], may be repeated.
    #[arg(short, long, value_name = "RESOURCE:SOFT[:HARD]")]
    pub rlimit: Vec<ResourceLimit>,

    /// File mode creation mask of the service, in octal.
    #[arg(short = 'k', long, value_parser = parse_umask)]
    pub umask: Option<Mode>,

    /// Change root to this directory before starting the service.
    #[arg(long, value_name = "DIR")]
    pub chroot: Option<PathBuf>,

    /// Working directory of the service (inside the chroot, if any).
    #[arg(short = 'C', long, value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// When to start the service again after it terminated.
    #[arg(long, value_enum, ignore_case = true, default_value_t = RestartPolicy::Failure)]
    pub restart: RestartPolicy,

    /// Seconds to wait before restarting a crashed service.
    #[arg(long, value_name = "SECONDS", default_value_t = 1)]
    pub restart_sleep: u32,

    /// Run COMMAND NAME CODE STATUS LOGFILE whenever the service crashes.
    #[arg(long, value_name = "COMMAND")]
    pub crash_report: Option<PathBuf>,

    /// Don't fork into the background.
    #[arg(short, long)]
    pub foreground: bool,

    /// The service command and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<OsString>,
}

#[derive(Debug, Clone, Args)]
pub struct StopArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Seconds to wait for the service to exit before killing it; negative waits
    /// forever.
    #[arg(long, value_name = "SECONDS", allow_negative_numbers = true, default_value_t = -1)]
    pub shutdown_timeout: i64,
}

#[derive(Debug, Clone, Args)]
pub struct LogsArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Keep printing new output until the service stops.
    #[arg(short, long)]
    pub follow: bool,
}

fn parse_umask(value: &str) -> Result<Mode, String> {
    match u32::from_str_radix(value, 8) {
        Ok(bits) if bits <= 0o777 => Ok(Mode::from_bits_truncate(bits as libc::mode_t)),
        _ => Err(format!("illegal umask {:?}: expected an octal value up to 0777", value)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_with_options() {
        let cli = parse(&[
            "service-runner", "start", "web", "-p", "/tmp/web.pid", "-u", "www", "-N", "-5",
            "-r", "NOFILE:64", "-r", "CORE:0:0", "-k", "027", "--restart", "always",
            "--restart-sleep", "3", "--", "/usr/bin/server", "--port", "80",
        ]);
        let args = match cli.command {
            Command::Start(args) => args,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(args.target.name.as_str(), "web");
        assert_eq!(args.target.pidfile(), PathBuf::from("/tmp/web.pid"));
        assert_eq!(args.user.as_deref(), Some("www"));
        assert_eq!(args.priority, Some(-5));
        assert_eq!(args.rlimit.len(), 2);
        assert_eq!(args.umask, Some(Mode::from_bits_truncate(0o027)));
        assert_eq!(args.restart, RestartPolicy::Always);
        assert_eq!(args.restart_sleep, 3);
        assert_eq!(args.command, vec![
            OsString::from("/usr/bin/server"),
            OsString::from("--port"),
            OsString::from("80"),
        ]);
    }

    #[test]
    fn start_defaults() {
        let cli = parse(&["service-runner", "start", "web", "sleep", "10"]);
        let args = match cli.command {
            Command::Start(args) => args,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(args.target.pidfile(), PathBuf::from("/var/run/web.pid"));
        assert_eq!(args.restart, RestartPolicy::Failure);
        assert_eq!(args.restart_sleep, 1);
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(!args.foreground);
    }

    #[test]
    fn start_rejects_bad_values() {
        assert!(Cli::try_parse_from(&["service-runner", "start", "we/b", "true"]).is_err());
        assert!(Cli::try_parse_from(&["service-runner", "start", "web", "-k", "999", "true"]).is_err());
        assert!(Cli::try_parse_from(&["service-runner", "start", "web", "-N", "40", "true"]).is_err());
        assert!(Cli::try_parse_from(&["service-runner", "start", "web", "-r", "BOGUS:1", "true"]).is_err());
        assert!(Cli::try_parse_from(&["service-runner", "start", "web"]).is_err());
    }

    #[test]
    fn stop_timeout() {
        let cli = parse(&["service-runner", "stop", "web"]);
        match cli.command {
            Command::Stop(args) => assert_eq!(args.shutdown_timeout, -1),
            other => panic!("unexpected {:?}", other),
        }
        let cli = parse(&["service-runner", "stop", "web", "--shutdown-timeout", "2"]);
        match cli.command {
            Command::Stop(args) => assert_eq!(args.shutdown_timeout, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn umask_parsing() {
        assert_eq!(parse_umask("22"), Ok(Mode::from_bits_truncate(0o022)));
        assert_eq!(parse_umask("0777"), Ok(Mode::from_bits_truncate(0o777)));
        assert!(parse_umask("1000").is_err());
        assert!(parse_umask("8").is_err());
    }
}
