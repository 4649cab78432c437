//! The supervisor's logfile: a strftime pattern, the file it currently expands
//! to and the machinery to switch files without losing output.
use chrono::{
    DateTime,
    TimeZone,
    format::{
        Item,
        StrftimeItems,
    },
};
use nix::{
    fcntl::{
        OFlag,
        open,
    },
    sys::stat::Mode,
    unistd::{
        Gid,
        Uid,
        chown,
        dup2,
    },
};
use precisej_printable_errno::{
    ErrnoResult,
    PrintableErrno,
};
use std::{
    fmt::{
        self,
        Write as _,
    },
    fs::File,
    io::{
        self,
        Write as _,
    },
    os::unix::io::{
        AsRawFd,
        FromRawFd,
        RawFd,
    },
    path::{
        Path,
        PathBuf,
    },
};
use thiserror::Error;

use crate::{
    PROGRAM_NAME,
    platforms,
};


#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("logfile pattern cannot be empty")]
    Empty,
    #[error("invalid strftime sequence in logfile pattern {0:?}")]
    Invalid(String),
}

/// A logfile name, possibly containing strftime sequences. Whenever the expansion of
/// the pattern changes the log is rotated into the newly named file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPattern {
    pattern: String,
}

impl LogPattern {
    pub fn new(pattern: &str) -> Result<LogPattern, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
            return Err(PatternError::Invalid(pattern.to_string()));
        }
        Ok(LogPattern {
            pattern: pattern.to_string(),
        })
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_rotating(&self) -> bool {
        self.pattern.contains('%')
    }

    pub fn expand<Tz>(&self, now: &DateTime<Tz>) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        if !self.is_rotating() {
            return PathBuf::from(&self.pattern);
        }
        let mut expanded = String::with_capacity(self.pattern.len() + 16);
        // the pattern was checked for bad items in new(), so formatting can't fail
        let _ = write!(expanded, "{}", now.format(&self.pattern));
        PathBuf::from(expanded)
    }
}

impl fmt::Display for LogPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn open_append(path: &Path, owner: Option<(Uid, Gid)>) -> Result<File, PrintableErrno<String>> {
    let fd = open(
        path,
        OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CREAT | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
    ).printable(PROGRAM_NAME, format!("unable to open logfile {}", path.display()))?;
    // SAFETY: fd was just opened and nothing else owns it.
    let file = unsafe { File::from_raw_fd(fd) };

    if let Some((uid, gid)) = owner {
        chown(path, Some(uid), Some(gid))
            .printable(PROGRAM_NAME, format!("unable to change owner of logfile {}", path.display()))?;
    }
    Ok(file)
}

/// The open logfile.
///
/// Once [LogFile::redirect_stdio] was called, every later switch of the file is also
/// applied to the process' stdout and stderr, which is where the supervisor's own log
/// lines go.
pub struct LogFile {
    pattern: LogPattern,
    path: PathBuf,
    file: File,
    owner: Option<(Uid, Gid)>,
    stdio: bool,
    zero_copy: bool,
}

impl LogFile {
    /// Open (creating with mode 0644 if needed) the file `pattern` expands to at `now`.
    /// With `owner` the file is chowned to the service identity.
    pub fn open<Tz>(pattern: LogPattern, now: &DateTime<Tz>, owner: Option<(Uid, Gid)>) -> Result<LogFile, PrintableErrno<String>>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let path = pattern.expand(now);
        let file = open_append(&path, owner)?;
        Ok(LogFile {
            pattern,
            path,
            file,
            owner,
            stdio: false,
            zero_copy: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point stdout and stderr at the logfile, now and after every rotation.
    pub fn redirect_stdio(&mut self) -> Result<(), PrintableErrno<String>> {
        self.stdio = true;
        self.dup_onto_stdio()
    }

    fn dup_onto_stdio(&self) -> Result<(), PrintableErrno<String>> {
        // anything still buffered belongs to the previous file
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        let fd = self.file.as_raw_fd();
        dup2(fd, libc::STDOUT_FILENO)
            .printable(PROGRAM_NAME, "unable to redirect stdout to logfile".to_string())?;
        dup2(fd, libc::STDERR_FILENO)
            .printable(PROGRAM_NAME, "unable to redirect stderr to logfile".to_string())?;
        Ok(())
    }

    fn switch_to(&mut self, path: PathBuf) -> Result<(), PrintableErrno<String>> {
        let file = open_append(&path, self.owner)?;
        let previous = std::mem::replace(&mut self.file, file);
        if self.stdio {
            if let Err(e) = self.dup_onto_stdio() {
                self.file = previous;
                return Err(e);
            }
        }
        self.path = path;
        Ok(())
    }

    /// Switch to the file the pattern expands to at `now`, if that is a different
    /// file. Returns whether a switch happened. On error the current file is kept.
    pub fn rotate<Tz>(&mut self, now: &DateTime<Tz>) -> Result<bool, PrintableErrno<String>>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let path = self.pattern.expand(now);
        if path == self.path {
            return Ok(false);
        }
        self.switch_to(path)?;
        Ok(true)
    }

    /// Open the expansion of the pattern again even if the name didn't change, so that
    /// a logfile moved away by an external tool is recreated.
    pub fn reopen<Tz>(&mut self, now: &DateTime<Tz>) -> Result<(), PrintableErrno<String>>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let path = self.pattern.expand(now);
        self.switch_to(path)
    }

    /// Move everything that can be read from `pipe` without blocking into the logfile.
    pub fn drain_from(&mut self, pipe: RawFd) -> Result<usize, PrintableErrno<String>> {
        platforms::transfer(pipe, self.file.as_raw_fd(), &mut self.zero_copy)
            .printable(PROGRAM_NAME, format!("unable to write service output to {}", self.path.display()))
    }
}
