//! Stable error identifiers surfaced by this crate.
use std::{fmt, io, error};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A stable error identifier.
///
/// Every fallible operation in this crate returns one of these. `Io` is the
/// odd one out: it isn't one of the spec's named identifiers, but wraps the
/// underlying OS error whenever `mmap`/`munmap`/`open` fails so the original
/// cause isn't lost.
#[derive(Debug)]
pub enum Error {
    /// A precondition was violated that only a buggy caller (or this library)
    /// could trigger.
    Internal(&'static str),
    /// Malformed user input: a bad path, an oversized `UserAsid`, a
    /// zero-sized section.
    Invalid(&'static str),
    /// Allocation failure.
    NoMem,
    /// No section (and no callback) could answer a read.
    NoMap,
    /// `remove` could not find the requested entry.
    BadImage,
    /// `UserAsid::size` named a struct layout this crate doesn't understand.
    BadAsid,
    /// Truncated read: fewer bytes were available than requested.
    Eos,
    /// A section was read, unmapped, or cloned while not currently mapped.
    NotMapped,
    /// An underlying OS call (`mmap`, `munmap`, `open`, ...) failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(ctx) => write!(f, "internal precondition violated: {ctx}"),
            Self::Invalid(ctx) => write!(f, "invalid input: {ctx}"),
            Self::NoMem => write!(f, "allocation failed"),
            Self::NoMap => write!(f, "no section or callback covers this address"),
            Self::BadImage => write!(f, "no matching entry in image"),
            Self::BadAsid => write!(f, "malformed address-space identifier"),
            Self::Eos => write!(f, "end of section reached"),
            Self::NotMapped => write!(f, "section is not currently mapped"),
            Self::Io(e) => write!(f, "OS call failed: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(from: io::Error) -> Self {
        Self::Io(from)
    }
}
