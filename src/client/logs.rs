//! `logs`: print the file the supervisor currently logs to, optionally following it
//! across rotations until the supervisor exits.
use precisej_printable_errno::{
    ErrnoResult,
    ExitError,
    PrintableErrno,
    PrintableResult,
    printable_error,
};
use std::{
    fs::{
        self,
        File,
    },
    io::{
        self,
        Write,
    },
    os::unix::fs::MetadataExt,
    path::Path,
    time::Duration,
};

use crate::{
    IoResultExt,
    PROGRAM_NAME,
    cli::LogsArgs,
    client::{
        pidfiles,
        read_pid,
    },
    platforms::{
        FileWatch,
        process,
    },
};


/// How often to look for rotations and a dead supervisor when the file is quiet.
const RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Device and inode, to notice that a path now names a different file.
fn identity(meta: &fs::Metadata) -> (u64, u64) {
    (meta.dev(), meta.ino())
}

/// Copy everything from the current position of `file` to the end.
fn pump<W: Write>(file: &mut File, out: &mut W) -> io::Result<u64> {
    let count = io::copy(file, out)?;
    out.flush()?;
    Ok(count)
}

struct Follower {
    source: std::path::PathBuf,
    file: File,
    identity: (u64, u64),
}

impl Follower {
    fn open(source: &Path) -> Result<Follower, PrintableErrno<String>> {
        let file = File::open(source)
            .printable_io(format!("unable to open supervisor output {}", source.display()))?;
        let meta = file.metadata()
            .printable_io(format!("unable to inspect supervisor output {}", source.display()))?;
        Ok(Follower {
            source: source.to_path_buf(),
            file,
            identity: identity(&meta),
        })
    }

    fn pump<W: Write>(&mut self, out: &mut W) -> Result<u64, PrintableErrno<String>> {
        pump(&mut self.file, out).printable_io("unable to copy log output".to_string())
    }

    /// Whether the supervisor's stdout is now a different file. A vanished source
    /// (the supervisor exited) is not a rotation.
    fn rotated(&self) -> bool {
        match fs::metadata(&self.source) {
            Ok(meta) => identity(&meta) != self.identity,
            Err(_) => false,
        }
    }
}

pub fn logs(args: LogsArgs) -> Result<i32, ExitError<String>> {
    let files = pidfiles(&args.target);
    let runner = read_pid(files.runner()).bail(1)?
        .ok_or_else(|| printable_error(PROGRAM_NAME, format!("{} is not running", args.target.name)))
        .bail(1)?;

    let source = process::stdout_path(runner);
    let mut follower = Follower::open(&source).bail(1)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    follower.pump(&mut out).bail(1)?;
    if !args.follow {
        return Ok(0);
    }

    let mut watch = FileWatch::new()
        .printable(PROGRAM_NAME, "unable to create inotify instance".to_string())
        .bail(1)?;
    watch.watch(&source)
        .printable(PROGRAM_NAME, format!("unable to watch {}", source.display()))
        .bail(1)?;

    loop {
        watch.wait(Some(RECHECK_INTERVAL))
            .printable(PROGRAM_NAME, "unable to wait for log output".to_string())
            .bail(1)?;
        follower.pump(&mut out).bail(1)?;

        let alive = process::alive(runner)
            .printable(PROGRAM_NAME, format!("unable to check supervisor pid {}", runner))
            .bail(1)?;
        if !alive {
            return Ok(0);
        }

        if follower.rotated() {
            // the rest of the old file was written before the switch
            follower.pump(&mut out).bail(1)?;
            follower = Follower::open(&source).bail(1)?;
            watch.watch(&source)
                .printable(PROGRAM_NAME, format!("unable to watch {}", source.display()))
                .bail(1)?;
            follower.pump(&mut out).bail(1)?;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_continues_where_it_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "one\n").unwrap();
        let mut follower = Follower::open(&path).unwrap();
        let mut out = Vec::new();
        assert_eq!(follower.pump(&mut out).unwrap(), 4);

        let mut append = fs::OpenOptions::new().append(true).open(&path).unwrap();
        append.write_all(b"two\n").unwrap();
        assert_eq!(follower.pump(&mut out).unwrap(), 4);
        assert_eq!(out, b"one\ntwo\n");
        assert!(!follower.rotated());
    }

    #[test]
    fn replaced_file_counts_as_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "old\n").unwrap();
        let follower = Follower::open(&path).unwrap();

        fs::rename(&path, dir.path().join("log.1")).unwrap();
        assert!(!follower.rotated());
        fs::write(&path, "new\n").unwrap();
        assert!(follower.rotated());
    }

    #[test]
    fn file_watch_sees_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "").unwrap();
        let mut watch = FileWatch::new().unwrap();
        watch.watch(&path).unwrap();
        assert!(!watch.wait(Some(Duration::from_millis(10))).unwrap());

        let mut append = fs::OpenOptions::new().append(true).open(&path).unwrap();
        append.write_all(b"line\n").unwrap();
        assert!(watch.wait(Some(Duration::from_secs(5))).unwrap());
    }
}
