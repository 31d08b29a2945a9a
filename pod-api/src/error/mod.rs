//! Error handling module for the translation layer

use core::fmt;

use crate::core::types::{Gfn, PageOrder};

/// Reason an address space was crashed
///
/// Fatal conditions terminate the owning VM, never the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// No frame was available while materializing a page
    OutOfMemory,
    /// A translation entry or counter broke one of its invariants
    InvariantViolation(&'static str),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::OutOfMemory => write!(f, "out of memory while populating"),
            FatalReason::InvariantViolation(what) => write!(f, "invariant violated: {}", what),
        }
    }
}

/// Common error type used throughout the translation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Frame lies outside the VM's declared physical-address limit
    OutOfRange(Gfn),
    /// Frame is not aligned to the requested mapping order
    Misaligned {
        /// Offending frame
        gfn: Gfn,
        /// Requested order
        order: PageOrder,
    },
    /// Invalid argument
    InvalidArgument(&'static str),
    /// No mapping exists for the frame
    NotMapped(Gfn),
    /// Access kind not permitted by the entry
    AccessDenied(Gfn),
    /// The VM is being torn down or has crashed
    Dying,
    /// Mutation of an address space frozen as a template
    TemplateReadOnly,
    /// Resource busy
    Busy(&'static str),
    /// Out of memory on a non-fatal path
    OutOfMemory,
    /// The owning VM was crashed
    Fatal(FatalReason),
}

impl Error {
    /// Returns true if the error terminated the owning VM.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfRange(gfn) => write!(f, "Out of range: {}", gfn),
            Error::Misaligned { gfn, order } => {
                write!(f, "Misaligned: {} for order {}", gfn, order.shift())
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotMapped(gfn) => write!(f, "Not mapped: {}", gfn),
            Error::AccessDenied(gfn) => write!(f, "Access denied: {}", gfn),
            Error::Dying => write!(f, "Address space is dying"),
            Error::TemplateReadOnly => write!(f, "Template address space is read-only"),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::Fatal(reason) => write!(f, "Fatal: {}", reason),
        }
    }
}

impl From<FatalReason> for Error {
    fn from(reason: FatalReason) -> Self {
        Error::Fatal(reason)
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;
