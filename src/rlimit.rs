//! Resource limits for the service process (`--rlimit RESOURCE:SOFT[:HARD]`).
use nix::errno::Errno;
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;


/// A resource known to `setrlimit(2)`, or a raw resource number for anything this
/// list doesn't name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Rttime,
    Sigpending,
    Stack,
    Other(i32),
}

const NAMED_RESOURCES: [(&str, Resource); 16] = [
    ("AS", Resource::As),
    ("CORE", Resource::Core),
    ("CPU", Resource::Cpu),
    ("DATA", Resource::Data),
    ("FSIZE", Resource::Fsize),
    ("LOCKS", Resource::Locks),
    ("MEMLOCK", Resource::Memlock),
    ("MSGQUEUE", Resource::Msgqueue),
    ("NICE", Resource::Nice),
    ("NOFILE", Resource::Nofile),
    ("NPROC", Resource::Nproc),
    ("RSS", Resource::Rss),
    ("RTPRIO", Resource::Rtprio),
    ("RTTIME", Resource::Rttime),
    ("SIGPENDING", Resource::Sigpending),
    ("STACK", Resource::Stack),
];

impl Resource {
    pub fn from_name(name: &str) -> Option<Resource> {
        NAMED_RESOURCES.iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, resource)| *resource)
    }

    /// Map a raw resource number back onto its name where there is one, so that
    /// `1:1024` and `FSIZE:1024` are the same limit.
    pub fn from_raw(raw: i32) -> Resource {
        NAMED_RESOURCES.iter()
            .map(|(_, resource)| *resource)
            .find(|resource| resource.raw() == raw)
            .unwrap_or(Resource::Other(raw))
    }

    pub fn raw(self) -> i32 {
        (match self {
            Resource::As => libc::RLIMIT_AS,
            Resource::Core => libc::RLIMIT_CORE,
            Resource::Cpu => libc::RLIMIT_CPU,
            Resource::Data => libc::RLIMIT_DATA,
            Resource::Fsize => libc::RLIMIT_FSIZE,
            Resource::Locks => libc::RLIMIT_LOCKS,
            Resource::Memlock => libc::RLIMIT_MEMLOCK,
            Resource::Msgqueue => libc::RLIMIT_MSGQUEUE,
            Resource::Nice => libc::RLIMIT_NICE,
            Resource::Nofile => libc::RLIMIT_NOFILE,
            Resource::Nproc => libc::RLIMIT_NPROC,
            Resource::Rss => libc::RLIMIT_RSS,
            Resource::Rtprio => libc::RLIMIT_RTPRIO,
            Resource::Rttime => libc::RLIMIT_RTTIME,
            Resource::Sigpending => libc::RLIMIT_SIGPENDING,
            Resource::Stack => libc::RLIMIT_STACK,
            Resource::Other(raw) => return raw,
        }) as i32
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Other(raw) => write!(f, "{}", raw),
            named => {
                let name = NAMED_RESOURCES.iter()
                    .find(|(_, resource)| resource == named)
                    .map(|(name, _)| *name)
                    .unwrap_or("?");
                f.write_str(name)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitValue {
    Finite(u64),
    Infinity,
}

impl LimitValue {
    fn to_raw(self) -> libc::rlim_t {
        match self {
            LimitValue::Finite(value) => value as libc::rlim_t,
            LimitValue::Infinity => libc::RLIM_INFINITY,
        }
    }

    fn from_raw(raw: libc::rlim_t) -> LimitValue {
        if raw == libc::RLIM_INFINITY {
            LimitValue::Infinity
        } else {
            LimitValue::Finite(raw as u64)
        }
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Finite(value) => write!(f, "{}", value),
            LimitValue::Infinity => f.write_str("infinity"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RlimitError {
    #[error("expected RESOURCE:SOFT[:HARD], got {0:?}")]
    Syntax(String),
    #[error("unknown resource {0:?}")]
    UnknownResource(String),
    #[error("illegal limit value {0:?}")]
    Value(String),
    #[error("cannot query current limit of {0}: {1}")]
    Query(Resource, Errno),
}

/// One `setrlimit(2)` call. A list of these may name the same resource several
/// times; applied in order, the last one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub resource: Resource,
    pub soft: LimitValue,
    pub hard: LimitValue,
}

fn parse_resource(text: &str) -> Result<Resource, RlimitError> {
    if let Some(resource) = Resource::from_name(text) {
        return Ok(resource);
    }
    match text.parse::<u32>() {
        Ok(raw) if raw <= i32::MAX as u32 => Ok(Resource::from_raw(raw as i32)),
        _ => Err(RlimitError::UnknownResource(text.to_string())),
    }
}

/// Integers, or "infinity" in any case and abbreviated down to "inf".
fn parse_value(text: &str) -> Result<LimitValue, RlimitError> {
    if text.len() >= 3 && "infinity".starts_with(&text.to_ascii_lowercase()) {
        return Ok(LimitValue::Infinity);
    }
    text.parse::<u64>()
        .map(LimitValue::Finite)
        .map_err(|_| RlimitError::Value(text.to_string()))
}

fn current_hard_limit(resource: Resource) -> Result<LimitValue, RlimitError> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: limit is a valid, writable rlimit struct.
    let res = unsafe { libc::getrlimit(resource.raw() as _, &mut limit) };
    Errno::result(res).map_err(|errno| RlimitError::Query(resource, errno))?;
    Ok(LimitValue::from_raw(limit.rlim_max))
}

impl ResourceLimit {
    /// Parse `RESOURCE:SOFT[:HARD]`. When HARD is omitted `current_hard` supplies it.
    pub fn parse_with<F>(arg: &str, current_hard: F) -> Result<ResourceLimit, RlimitError>
    where
        F: FnOnce(Resource) -> Result<LimitValue, RlimitError>,
    {
        let mut parts = arg.splitn(3, ':');
        let resource = parts.next().unwrap_or_default();
        let soft = parts.next().ok_or_else(|| RlimitError::Syntax(arg.to_string()))?;
        let hard = parts.next();

        let resource = parse_resource(resource)?;
        let soft = parse_value(soft)?;
        let hard = match hard {
            Some(hard) => parse_value(hard)?,
            None => current_hard(resource)?,
        };

        Ok(ResourceLimit {
            resource,
            soft,
            hard,
        })
    }

    /// Only ever called in the forked service child: the limits must not constrain
    /// the supervisor, which keeps writing the logfile.
    pub fn apply(&self) -> nix::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: self.soft.to_raw(),
            rlim_max: self.hard.to_raw(),
        };
        // SAFETY: limit is a valid rlimit struct that outlives the call.
        let res = unsafe { libc::setrlimit(self.resource.raw() as _, &limit) };
        Errno::result(res).map(drop)
    }
}

impl FromStr for ResourceLimit {
    type Err = RlimitError;

    fn from_str(arg: &str) -> Result<ResourceLimit, RlimitError> {
        ResourceLimit::parse_with(arg, current_hard_limit)
    }
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.soft, self.hard)
    }
}
