//! The hardware key capability collaborator. Private keys never enter this
//! crate: signing is delegated by alias, and "the key is locked behind user
//! presence" is a normal outcome, not an error.

use coset::iana;

/// Result of a signing request against a hardware-backed key.
#[derive(Debug, Clone)]
pub enum SignOutcome {
    /// Raw signature bytes (r || s for ECDSA).
    Signature(Vec<u8>),
    /// The key requires user authentication and is currently locked; the
    /// request may be retried after the user authenticates.
    KeyLocked,
    /// The key store failed outright.
    Failure(String),
}

pub trait KeyCapability: Send {
    /// Sign `payload` with the key identified by `alias`.
    fn sign(&self, alias: &str, algorithm: iana::Algorithm, payload: &[u8]) -> SignOutcome;
}
