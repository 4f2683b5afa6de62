pub mod apdu;
pub mod hce;
mod util;

pub use apdu::{Apdu, FileId, Response, StatusWord};
pub use hce::{ConsentDecider, HceConfig, HceDriver};
pub use util::KnownOrRaw;
