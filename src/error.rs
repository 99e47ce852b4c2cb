//! Canonical error taxonomy for the transport, message-passing, and
//! state-machine layers.
//!
//! Every error that crosses a transport method boundary is normalized into a
//! [`BmiErrorKind`] before the message-passing shim or state-machine engine
//! ever sees it. The `bmi_origin` bit distinguishes errors synthesized inside
//! this crate's own bookkeeping (cancellation, address resolution, context
//! mismatch) from errors a transport method passed through from the
//! underlying OS or peer.

use thiserror::Error;

/// The canonical set of error conditions a transport method, the
/// message-passing shim, or the state-machine engine can report.
///
/// This mirrors the error code space a BMI-style transport layer needs to
/// represent, independent of which OS errno or peer protocol produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BmiErrorKind {
    Perm,
    NoEnt,
    Intr,
    Io,
    NoMem,
    Inval,
    NameTooLong,
    NoSys,
    MessageSize,
    ProtoType,
    ProtoNoSupport,
    OpNotSupp,
    AddrInUse,
    AddrNotAvail,
    NetDown,
    NetUnreach,
    NetReset,
    NoBufs,
    TimedOut,
    ConnRefused,
    HostDown,
    HostUnreach,
    Already,
    Canceled,
    Proto,
    Access,
    ConnReset,
}

impl BmiErrorKind {
    /// Best-effort mapping from a raw `std::io::ErrorKind`, used when a
    /// transport method's underlying socket operation fails.
    pub fn from_io_error_kind(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as K;
        match kind {
            K::NotFound => BmiErrorKind::NoEnt,
            K::PermissionDenied => BmiErrorKind::Perm,
            K::ConnectionRefused => BmiErrorKind::ConnRefused,
            K::ConnectionReset => BmiErrorKind::ConnReset,
            K::NotConnected => BmiErrorKind::NetUnreach,
            K::AddrInUse => BmiErrorKind::AddrInUse,
            K::AddrNotAvailable => BmiErrorKind::AddrNotAvail,
            K::TimedOut => BmiErrorKind::TimedOut,
            K::Interrupted => BmiErrorKind::Intr,
            K::InvalidInput | K::InvalidData => BmiErrorKind::Inval,
            K::OutOfMemory => BmiErrorKind::NoMem,
            K::Unsupported => BmiErrorKind::OpNotSupp,
            _ => BmiErrorKind::Io,
        }
    }
}

/// A library-level error. Carries the canonical [`BmiErrorKind`], a
/// `bmi_origin` bit noting whether the error was synthesized by this crate's
/// own bookkeeping rather than passed through from a transport, and enough
/// context (operation id, address) for `tracing` output and the caller to
/// act on.
#[derive(Debug, Error)]
pub struct BmiError {
    pub kind: BmiErrorKind,
    pub bmi_origin: bool,
    pub message: String,
    #[source]
    pub source: Option<std::io::Error>,
}

impl std::fmt::Display for BmiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let origin = if self.bmi_origin { " (bmi)" } else { "" };
        write!(f, "{:?}{}: {}", self.kind, origin, self.message)
    }
}

impl BmiError {
    pub fn new(kind: BmiErrorKind, message: impl Into<String>) -> Self {
        BmiError {
            kind,
            bmi_origin: true,
            message: message.into(),
            source: None,
        }
    }

    /// Construct an error attributed to a transport method rather than this
    /// crate's own bookkeeping.
    pub fn from_transport(kind: BmiErrorKind, message: impl Into<String>) -> Self {
        BmiError {
            kind,
            bmi_origin: false,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_io(err: std::io::Error, message: impl Into<String>) -> Self {
        let kind = BmiErrorKind::from_io_error_kind(err.kind());
        BmiError {
            kind,
            bmi_origin: false,
            message: message.into(),
            source: Some(err),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        BmiError::new(BmiErrorKind::Canceled, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        BmiError::new(BmiErrorKind::Inval, message)
    }
}

pub type BmiResult<T> = std::result::Result<T, BmiError>;

/// Abort the process after logging, for internal inconsistencies that
/// cannot be safely recovered from (e.g. a completion surfacing for an
/// unregistered operation id). Matches the "can't recover from this"
/// behavior of the method this crate is modeled on, where such states are
/// logged at the highest severity and the process is torn down rather than
/// continuing with corrupted bookkeeping.
pub fn fatal_inconsistency(context: &str) -> ! {
    tracing::error!(%context, "fatal internal inconsistency, aborting");
    std::process::abort();
}
