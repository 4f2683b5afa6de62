pub mod crl;
pub mod trust_anchor;
pub mod validation;
pub mod x5chain;

pub use trust_anchor::TrustAnchorRegistry;
pub use validation::{ReaderAuthOutcome, ValidationOutcome};
pub use x5chain::X5Chain;
