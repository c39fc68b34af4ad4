//! The enforcer error taxonomy.

use std::fmt;

//----------- Error ------------------------------------------------------------

/// An error surfaced by the enforcer core.
///
/// The variant decides how callers react:
///
/// - [`Error::Transient`]: retry within the same tick, a bounded number of
///   times (stale revisions, engine busy).
/// - [`Error::Policy`]: the zone is degraded but the process is fine; the
///   tick returns a back-off wakeup (no key available, no safe transition).
/// - [`Error::Configuration`]: fatal for the affected entity (unknown enum
///   token on read, broken invariant on read).
/// - [`Error::External`]: fatal for the process tick (store or HSM gone).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A conflict that a retry with fresh reads can resolve.
    Transient(String),

    /// The configured policy cannot currently be satisfied for a zone.
    Policy(String),

    /// Stored or configured data is invalid.
    Configuration(String),

    /// An external collaborator (store engine, HSM) failed.
    External(String),
}

impl Error {
    /// Whether a retry within the same tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transient(msg) => write!(f, "transient: {msg}"),
            Error::Policy(msg) => write!(f, "policy violation: {msg}"),
            Error::Configuration(msg) => write!(f, "configuration: {msg}"),
            Error::External(msg) => write!(f, "external: {msg}"),
        }
    }
}

//--- Conversion

impl From<warden_store::Error> for Error {
    fn from(err: warden_store::Error) -> Self {
        use warden_store::Error::*;

        match err {
            StaleRevision { .. } => Error::Transient(err.to_string()),
            NotFound { .. } | Ambiguous { .. } | UnknownTable(_) => {
                Error::Configuration(err.to_string())
            }
            Corrupt(_) | Version { .. } => Error::Configuration(err.to_string()),
            Io(_) => Error::External(err.to_string()),
        }
    }
}
