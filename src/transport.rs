//! The opaque byte-transport collaborator. BLE GATT/L2CAP plumbing lives
//! outside this crate; the protocol core only sees connect/send/close plus
//! events delivered on an arbitrary thread.

use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Events reported by a transport. Callbacks run on an application-supplied
/// executor, i.e. on a different thread than the NFC command path.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    MessageReceived(Vec<u8>),
    Disconnected,
    Error(String),
}

pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn send(&mut self, message: &[u8]) -> Result<(), TransportError>;
    fn close(&mut self);
}

/// The set of transports opened for one session.
///
/// Only one transport may be live at a time: the first to report
/// `Connected` wins and every other listening transport is closed
/// immediately. Shared between the NFC command thread and transport
/// callbacks, hence the lock.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    transports: Vec<Box<dyn Transport>>,
    live: Option<usize>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing transports with a fresh set, closing the old
    /// ones first. Repeated NFC taps re-run engagement setup, so duplicates
    /// must not accumulate.
    pub fn replace(&self, transports: Vec<Box<dyn Transport>>) {
        let mut state = self.inner.lock().unwrap();
        for transport in state.transports.iter_mut() {
            transport.close();
        }
        state.transports = transports;
        state.live = None;
    }

    pub fn connect_all(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap();
        for transport in state.transports.iter_mut() {
            transport.connect()?;
        }
        Ok(())
    }

    /// Mark the transport at `index` as the live one and close the rest.
    pub fn promote(&self, index: usize) {
        let mut state = self.inner.lock().unwrap();
        if state.live == Some(index) {
            return;
        }
        for (i, transport) in state.transports.iter_mut().enumerate() {
            if i != index {
                transport.close();
            }
        }
        state.live = Some(index);
    }

    pub fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap();
        let live = state.live.ok_or(TransportError::NotConnected)?;
        let transport = state
            .transports
            .get_mut(live)
            .ok_or(TransportError::NotConnected)?;
        transport.send(message)
    }

    /// Close and drop every transport. Safe to call repeatedly.
    pub fn close_all(&self) {
        let mut state = self.inner.lock().unwrap();
        for transport in state.transports.iter_mut() {
            transport.close();
        }
        state.transports.clear();
        state.live = None;
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().transports.len()
    }
}
