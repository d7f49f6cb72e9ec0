//! Archive failure surface.
//!
//! Every fallible archive operation threads one result type. The two error
//! arms differ in blast radius:
//!
//! - [`ArchiveError::Skip`]: this artifact cannot be stored or revived
//!   (a symbol did not resolve, an object kind is not archivable). The
//!   archive stays usable; the caller falls back to compiling.
//! - [`ArchiveError::Failed`]: the archive itself is broken (I/O error,
//!   bounds violation, capacity overrun). The archive is poisoned and all
//!   later operations short-circuit.

use std::fmt;
use std::io;

/// Result of an archive operation.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Why the current artifact was abandoned without poisoning the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A symbol did not probe in the symbol table.
    SymbolProbeFailed(String),
    /// A class did not resolve under any permitted loader.
    KlassLookupFailed(String),
    /// A method did not resolve in its holder.
    MethodLookupFailed(String),
    /// The compiler captured an object the archive cannot express.
    UnsupportedObjectKind(&'static str),
    /// An embedded handle had no live object behind it.
    UnknownHandle(u64),
    /// A repacked relocation payload needed more room than the original.
    RelocPayloadOverflow { needed: usize, have: usize },
    /// A revived section would not fit the caller's buffer.
    SectionOverflow { size: usize, capacity: usize },
    /// The address table is missing a phase the artifact needs.
    TableIncomplete,
}

/// Why the archive as a whole is no longer trustworthy.
#[derive(Debug)]
pub enum FailureKind {
    Io(io::Error),
    /// A read landed outside the archive buffer.
    OutOfBounds {
        offset: usize,
        len: usize,
        bound: usize,
    },
    /// The staging reservation is exhausted.
    CapacityExceeded { needed: usize, reserved: usize },
    VersionMismatch { found: u32, expected: u32 },
    MalformedEntry(&'static str),
    /// A stored artifact name does not match the requested one.
    NameMismatch { expected: String, found: String },
}

/// An archive operation error.
#[derive(Debug)]
pub enum ArchiveError {
    Skip(SkipReason),
    Failed(FailureKind),
}

impl ArchiveError {
    /// Shorthand for an out-of-bounds read failure.
    pub fn oob(offset: usize, len: usize, bound: usize) -> ArchiveError {
        ArchiveError::Failed(FailureKind::OutOfBounds { offset, len, bound })
    }

    /// Whether this error poisons the archive.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArchiveError::Failed(_))
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::SymbolProbeFailed(s) => write!(f, "symbol probe failed for '{}'", s),
            SkipReason::KlassLookupFailed(s) => write!(f, "class lookup failed for '{}'", s),
            SkipReason::MethodLookupFailed(s) => write!(f, "method lookup failed for '{}'", s),
            SkipReason::UnsupportedObjectKind(k) => {
                write!(f, "object kind '{}' is not archivable", k)
            }
            SkipReason::UnknownHandle(h) => write!(f, "no live object for handle {:#x}", h),
            SkipReason::RelocPayloadOverflow { needed, have } => write!(
                f,
                "repacked relocation payload needs {} words, record holds {}",
                needed, have
            ),
            SkipReason::SectionOverflow { size, capacity } => write!(
                f,
                "archived section of {} bytes exceeds buffer capacity {}",
                size, capacity
            ),
            SkipReason::TableIncomplete => write!(f, "address table initialization incomplete"),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Io(e) => write!(f, "archive i/o error: {}", e),
            FailureKind::OutOfBounds { offset, len, bound } => write!(
                f,
                "read of {} bytes at offset {} exceeds archive size {}",
                len, offset, bound
            ),
            FailureKind::CapacityExceeded { needed, reserved } => write!(
                f,
                "store of {} bytes exceeds reserved buffer of {} bytes",
                needed, reserved
            ),
            FailureKind::VersionMismatch { found, expected } => write!(
                f,
                "archive version {:#x} does not match runtime version {:#x}",
                found, expected
            ),
            FailureKind::MalformedEntry(what) => write!(f, "malformed archive entry: {}", what),
            FailureKind::NameMismatch { expected, found } => write!(
                f,
                "stored name '{}' does not match requested '{}'",
                found, expected
            ),
        }
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Skip(r) => write!(f, "artifact skipped: {}", r),
            ArchiveError::Failed(k) => write!(f, "archive failed: {}", k),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<io::Error> for ArchiveError {
    fn from(e: io::Error) -> Self {
        ArchiveError::Failed(FailureKind::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(!ArchiveError::Skip(SkipReason::TableIncomplete).is_fatal());
        assert!(ArchiveError::oob(10, 4, 12).is_fatal());
    }
}
