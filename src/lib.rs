//! Device (holder) side of the ISO/IEC 18013-5 mobile document proximity
//! presentation protocol.
//!
//! The crate covers engagement generation and handover negotiation (QR and
//! NFC, static and negotiated), the NFC Host-Card-Emulation APDU state
//! machine with command chaining and chunked response retrieval,
//! session-transcript construction with authenticated session encryption,
//! selective-disclosure request parsing and response assembly, and reader
//! certificate trust-path validation.
//!
//! Platform facilities stay outside: byte transports ([transport]), document
//! storage ([storage]) and hardware-backed keys ([keys]) are collaborator
//! traits the embedding application implements, and session progress is
//! reported through an [events::EventListener] handed in at construction.

pub mod cbor;
pub mod cose;
pub mod definitions;
pub mod engagement;
pub mod events;
pub mod keys;
pub mod nfc;
pub mod presentation;
pub mod storage;
pub mod transport;

pub use definitions::device_engagement::DeviceEngagement;
pub use definitions::session::{SessionData, SessionEstablishment, SessionTranscript};
pub use events::{EventListener, SessionEvent};
pub use nfc::{HceConfig, HceDriver};
pub use presentation::holder::{ParsedRequest, PermittedItems};
