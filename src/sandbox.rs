//! Restrictions applied to the service child between `fork` and `exec`.
//!
//! [SandboxPlan::for_service] decides *what* to do and in which order, without
//! touching the process; [SandboxPlan::apply] carries the steps out and must only be
//! called in the forked child. The order is fixed: resource limits and umask first,
//! then the output redirection, then the privilege drop (supplementary groups, gid,
//! uid), then chroot and finally chdir.
use nix::{
    sys::stat::{
        Mode,
        umask,
    },
    unistd::{
        Gid,
        Uid,
        chdir,
        chroot,
        dup2,
        setgid,
        setgroups,
        setuid,
    },
};
use precisej_printable_errno::{
    ErrnoResult,
    PrintableErrno,
};
use std::{
    fmt,
    os::unix::io::RawFd,
    path::PathBuf,
};

use crate::{
    PROGRAM_NAME,
    rlimit::ResourceLimit,
    service::ServiceSpec,
};


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    Rlimit(ResourceLimit),
    Umask(Mode),
    /// Point stdout and stderr at the write end of the output pipe.
    CaptureOutput,
    DropSupplementaryGroups,
    SetGid(Gid),
    SetUid(Uid),
    Chroot(PathBuf),
    Chdir(PathBuf),
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStep::Rlimit(limit) => write!(f, "setrlimit({})", limit),
            SetupStep::Umask(mode) => write!(f, "umask({:03o})", mode.bits()),
            SetupStep::CaptureOutput => f.write_str("redirect output to pipe"),
            SetupStep::DropSupplementaryGroups => f.write_str("setgroups([])"),
            SetupStep::SetGid(gid) => write!(f, "setgid({})", gid),
            SetupStep::SetUid(uid) => write!(f, "setuid({})", uid),
            SetupStep::Chroot(path) => write!(f, "chroot({:?})", path),
            SetupStep::Chdir(path) => write!(f, "chdir({:?})", path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPlan {
    steps: Vec<SetupStep>,
}

impl SandboxPlan {
    pub fn for_service(spec: &ServiceSpec) -> SandboxPlan {
        let mut steps: Vec<SetupStep> = spec.rlimits.iter()
            .cloned()
            .map(SetupStep::Rlimit)
            .collect();

        if let Some(mode) = spec.umask {
            steps.push(SetupStep::Umask(mode));
        }
        if spec.captures_output() {
            steps.push(SetupStep::CaptureOutput);
        }
        if let Some(gid) = spec.group {
            steps.push(SetupStep::DropSupplementaryGroups);
            steps.push(SetupStep::SetGid(gid));
        }
        if let Some(uid) = spec.user {
            steps.push(SetupStep::SetUid(uid));
        }
        if let Some(root) = &spec.chroot {
            steps.push(SetupStep::Chroot(root.clone()));
        }
        match (&spec.chroot, &spec.chdir) {
            (_, Some(dir)) => steps.push(SetupStep::Chdir(dir.clone())),
            (Some(_), None) => steps.push(SetupStep::Chdir(PathBuf::from("/"))),
            (None, None) => {}
        }

        SandboxPlan {
            steps,
        }
    }

    #[cfg(test)]
    pub fn steps(&self) -> &[SetupStep] {
        &self.steps
    }

    /// Carry out every step in order, stopping at the first failure. `output` is the
    /// write end of the output pipe, required when the plan captures output.
    pub fn apply(&self, output: Option<RawFd>) -> Result<(), PrintableErrno<String>> {
        for step in &self.steps {
            apply_step(step, output)
                .printable(PROGRAM_NAME, format!("(child) {}", step))?;
        }
        Ok(())
    }
}

fn apply_step(step: &SetupStep, output: Option<RawFd>) -> nix::Result<()> {
    match step {
        SetupStep::Rlimit(limit) => limit.apply(),
        SetupStep::Umask(mode) => {
            umask(*mode);
            Ok(())
        }
        SetupStep::CaptureOutput => {
            let pipe = output.ok_or(nix::errno::Errno::EBADF)?;
            dup2(pipe, libc::STDOUT_FILENO)?;
            dup2(pipe, libc::STDERR_FILENO)?;
            Ok(())
        }
        SetupStep::DropSupplementaryGroups => setgroups(&[]),
        SetupStep::SetGid(gid) => setgid(*gid),
        SetupStep::SetUid(uid) => setuid(*uid),
        SetupStep::Chroot(root) => chroot(root.as_path()),
        SetupStep::Chdir(dir) => chdir(dir.as_path()),
    }
}
