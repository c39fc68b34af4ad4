//! The HSM binding.
//!
//! The enforcer never speaks PKCS#11 itself; it goes through this narrow
//! interface.  Key material stays inside the HSM and is referred to by an
//! opaque locator.

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

pub mod soft;

//----------- Hsm --------------------------------------------------------------

/// A hardware security module, as the enforcer sees it.
pub trait Hsm: Send + Sync {
    /// The repositories this HSM serves.
    fn repositories(&self) -> Vec<String>;

    /// Generate a key; returns its locator.
    ///
    /// May block for a long time (entropy, token latency); callers must not
    /// hold locks across this call.
    fn generate_key(
        &self,
        repository: &str,
        algorithm: u32,
        bits: u32,
    ) -> Result<GeneratedKey, HsmError>;

    /// Whether a key with the given locator exists.
    fn find_key(&self, repository: &str, locator: &str) -> Result<bool, HsmError>;

    /// Destroy a key.
    fn delete_key(&self, repository: &str, locator: &str) -> Result<(), HsmError>;
}

//----------- GeneratedKey -----------------------------------------------------

/// A freshly generated key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedKey {
    /// The HSM's opaque identifier for the key material.
    pub locator: String,

    /// The cryptographic family of the key (e.g. "RSA", "EC").
    pub key_type: String,
}

/// The cryptographic family a DNSSEC algorithm number belongs to.
pub fn key_type_for_algorithm(algorithm: u32) -> &'static str {
    match algorithm {
        5 | 7 | 8 | 10 => "RSA",
        13 | 14 => "EC",
        15 | 16 => "ED",
        _ => "UNKNOWN",
    }
}

/// Derive the 16-bit key tag for a locator.
///
/// The real tag is a function of the DNSKEY RDATA, which only the signer
/// assembles; the enforcer needs a stable per-key handle for operators and
/// derives one from the locator.
pub fn keytag_for_locator(locator: &str) -> u16 {
    let mut hasher = foldhash::fast::FixedState::default().build_hasher();
    locator.hash(&mut hasher);
    (hasher.finish() & 0xffff) as u16
}

//----------- HsmError ---------------------------------------------------------

/// An error from the HSM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HsmError {
    /// The named repository is not configured on this HSM.
    UnknownRepository(String),

    /// The HSM is temporarily unable to serve the request.
    Busy,

    /// The HSM rejected the request.
    Failed(String),

    /// The HSM is gone.
    Disconnected(String),
}

impl std::error::Error for HsmError {}

impl fmt::Display for HsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HsmError::UnknownRepository(name) => {
                write!(f, "unknown repository '{name}'")
            }
            HsmError::Busy => f.write_str("the HSM is busy"),
            HsmError::Failed(msg) => write!(f, "the HSM rejected the request: {msg}"),
            HsmError::Disconnected(msg) => write!(f, "the HSM is unreachable: {msg}"),
        }
    }
}

impl From<HsmError> for crate::error::Error {
    fn from(err: HsmError) -> Self {
        match err {
            HsmError::Busy => crate::error::Error::Transient(err.to_string()),
            HsmError::UnknownRepository(_) => {
                crate::error::Error::Configuration(err.to_string())
            }
            HsmError::Failed(_) => crate::error::Error::Policy(err.to_string()),
            HsmError::Disconnected(_) => crate::error::Error::External(err.to_string()),
        }
    }
}
