use std::fmt;
use std::io;

/// Errors returned by the girder runtime.
#[derive(Debug)]
pub enum Error {
    /// Underlying I/O operation failed.
    Io(io::Error),
    /// Address failed to parse or validate (IPv4 `a.b.c.d:port`, port 1..=65535).
    InvalidAddress(String),
    /// Configuration file failed to load or validate.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
            Error::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
