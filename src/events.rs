//! Session events surfaced to the application layer. The listener is handed
//! to the NFC state machine at construction and lives only as long as the
//! session; there is no process-wide bus.

use crate::definitions::session::SessionTranscriptBytes;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport setup has started.
    Connecting,
    /// A transport reported itself connected.
    Connected,
    /// A request was decrypted and parsed; the JSON summary is what the UI
    /// shows the holder before anything leaves the device.
    RequestReceived {
        summary: serde_json::Value,
        session_transcript: SessionTranscriptBytes,
    },
    /// The reader disconnected or the NFC field was lost.
    Disconnected,
    /// The full response left the device.
    DocumentSent,
    /// The reader selected an application this device does not serve.
    NotSupported,
    Error(String),
}

pub trait EventListener: Send {
    fn on_event(&self, event: SessionEvent);
}
