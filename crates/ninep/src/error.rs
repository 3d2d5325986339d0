//! 9P error representations.
//!
//! In 9P2000 errors travel as strings in `Rerror`. Backends can still return a
//! system errno (`Error::No`), which is rendered with its description.

use std::error as stderror;
use std::{fmt, io};

use crate::fcall::MsgType;

/// Re-export of the errno constants used by backends.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// Conventional Plan 9 error strings.
pub mod string {
    pub const EBADFID: &str = "fid unknown or out of range";
    pub const EDUPFID: &str = "fid already in use";
    pub const EBADOFFSET: &str = "bad offset in directory read";
    pub const ENOTFOUND: &str = "file does not exist";
    pub const EPERM: &str = "permission denied";
    pub const EEXIST: &str = "file already exists";
    pub const ENOTDIR: &str = "not a directory";
    pub const EISDIR: &str = "file is a directory";
    pub const ENOTOPEN: &str = "file not open";
    pub const ETOOMANYWNAMES: &str = "too many wnames in walk";
    pub const ENOAUTH: &str = "authentication not required";
    pub const EBOTCH: &str = "9P protocol botch";
}

/// The error type of this crate.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno
    No(nix::errno::Errno),
    /// I/O error, including malformed frames on the wire
    Io(io::Error),
    /// Error string, as carried by `Rerror`
    Str(String),
    /// Version negotiation was refused; carries the reason
    Version(String),
    /// A request other than `Tversion` was attempted before negotiation
    NotVersioned,
    /// The backend does not implement this operation
    Unsupported(MsgType),
    /// The client connection is closed or broken
    Dead,
}

impl Error {
    /// Text to put in the `ename` field of an `Rerror` reply.
    pub fn ename(&self) -> String {
        match *self {
            Error::No(ref e) => e.desc().to_owned(),
            Error::Io(ref e) => e.to_string(),
            Error::Str(ref s) | Error::Version(ref s) => s.clone(),
            Error::NotVersioned => "version must be negotiated first".to_owned(),
            Error::Unsupported(ref t) => format!("Dispatch: {} not supported", t),
            Error::Dead => "client is dead".to_owned(),
        }
    }

    /// True if this error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::Io(_) | Error::Dead)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(ref e) => write!(f, "System error: {}", e.desc()),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::Version(_) => write!(f, "Version negotiation failed: {}", self.ename()),
            _ => write!(f, "{}", self.ename()),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::No(ref e) => Some(e),
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(s: &'a str) -> Self {
        Error::Str(s.to_owned())
    }
}
