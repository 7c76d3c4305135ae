//! Error types for probe registration and removal.

use axerrno::AxError;

/// Errors returned by the probe registry.
///
/// Protocol violations seen on the trap path (double arm, recursive fault,
/// unmatched step completion) are never surfaced here: they are logged and
/// recovered from inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No valid translation exists for the address.
    TranslationNotFound(usize),
    /// A registered probe already overlaps the requested range.
    DuplicateRange {
        /// Start of the probe that was already registered.
        addr: usize,
        /// Length of the probe that was already registered.
        len: usize,
    },
    /// No free fault-page slot for the page at this address.
    AllocationFailure(usize),
    /// The page is mapped at a granularity the engine cannot arm.
    UnsupportedLevel(usize),
    /// The probe is not registered.
    NotFound,
    /// Empty or wrapping address range.
    InvalidArgument,
    /// Configuration rejected by [`Tracer::new`](crate::Tracer::new).
    InvalidConfig(&'static str),
    /// Execution unit index out of range or already claimed.
    UnitUnavailable(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TranslationNotFound(addr) => write!(f, "no translation for {:#x}", addr),
            Self::DuplicateRange { addr, len } => {
                write!(f, "range overlaps probe at {:#x} (len {:#x})", addr, len)
            }
            Self::AllocationFailure(addr) => write!(f, "no fault-page slot for {:#x}", addr),
            Self::UnsupportedLevel(addr) => write!(f, "unsupported page level at {:#x}", addr),
            Self::NotFound => write!(f, "probe not registered"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            Self::UnitUnavailable(unit) => write!(f, "execution unit {} unavailable", unit),
        }
    }
}

impl core::error::Error for Error {}

impl From<Error> for AxError {
    fn from(e: Error) -> Self {
        match e {
            Error::TranslationNotFound(_) => axerrno::ax_err_type!(BadAddress, "kmmio: no translation"),
            Error::DuplicateRange { .. } => axerrno::ax_err_type!(AlreadyExists, "kmmio: overlapping probe"),
            Error::AllocationFailure(_) => axerrno::ax_err_type!(NoMemory, "kmmio: fault pages exhausted"),
            Error::UnsupportedLevel(_) => axerrno::ax_err_type!(Unsupported, "kmmio: unsupported page level"),
            Error::NotFound => axerrno::ax_err_type!(NotFound, "kmmio: probe not registered"),
            Error::InvalidArgument | Error::InvalidConfig(_) => {
                axerrno::ax_err_type!(InvalidInput, "kmmio: invalid argument")
            }
            Error::UnitUnavailable(_) => axerrno::ax_err_type!(ResourceBusy, "kmmio: unit unavailable"),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
