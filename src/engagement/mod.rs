//! Engagement generation and handover negotiation.
//!
//! One coordinator serves both QR engagement (a `mdoc:` URI, no handover)
//! and the NFC Type-4-Tag flows: static handover, where the NDEF file simply
//! presents a Handover Select message, and negotiated handover, where a
//! two-round TNEP exchange picks the connection method before any transport
//! exists.

pub mod ndef;

use crate::definitions::device_engagement::{
    BleOptions, DeviceEngagement, DeviceRetrievalMethod, Security,
};
use crate::definitions::device_key::CoseKey;
use crate::definitions::helpers::{ByteStr, NonEmptyVec, Tag24};
use crate::definitions::session::Handover;
use crate::transport::{Transport, TransportRegistry};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the coordinator has not been configured")]
    NotConfigured,
    #[error("the coordinator was already configured")]
    AlreadyConfigured,
    #[error("no connection methods were provided")]
    NoConnectionMethods,
    #[error("handover is not complete")]
    HandoverIncomplete,
    #[error("NDEF write outside of negotiated handover")]
    UnexpectedNdefWrite,
    #[error("handover failed: {0}")]
    Ndef(#[from] ndef::Error),
    #[error("unable to encode engagement: {0}")]
    Encoding(String),
    #[error("transport setup failed: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// Where a negotiated handover currently stands. Static handover never
/// leaves [NegotiatedHandoverState::NotStarted].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiatedHandoverState {
    #[default]
    NotStarted,
    ExpectServiceSelect,
    ExpectHandoverRequest,
    ExpectHandoverSelect,
}

/// Creates byte transports for advertised connection methods.
pub trait TransportFactory: Send {
    fn create(&self, method: &DeviceRetrievalMethod) -> Box<dyn Transport>;
}

struct Configured {
    device_engagement: Tag24<DeviceEngagement>,
    methods: Vec<DeviceRetrievalMethod>,
    negotiated: bool,
    factory: Box<dyn TransportFactory>,
    transports: TransportRegistry,
    handover_state: NegotiatedHandoverState,
    handover_select: Option<Vec<u8>>,
    handover_request: Option<Vec<u8>>,
    qr_used: bool,
}

/// Produces the engagement artifacts for one session.
///
/// [EngagementCoordinator::configure] must be called exactly once before any
/// engagement string or file content is requested. [EngagementCoordinator::close]
/// releases all transports and is idempotent.
#[derive(Default)]
pub struct EngagementCoordinator {
    state: Option<Configured>,
}

impl EngagementCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(
        &mut self,
        e_device_key: CoseKey,
        connection_methods: Vec<DeviceRetrievalMethod>,
        negotiated: bool,
        factory: Box<dyn TransportFactory>,
    ) -> Result<(), Error> {
        if self.state.is_some() {
            return Err(Error::AlreadyConfigured);
        }
        let methods = DeviceRetrievalMethod::disambiguate(connection_methods);
        if methods.is_empty() {
            return Err(Error::NoConnectionMethods);
        }

        let security = Security(
            1,
            Tag24::new(e_device_key).map_err(|e| Error::Encoding(e.to_string()))?,
        );
        let device_engagement = DeviceEngagement {
            version: "1.0".into(),
            security,
            device_retrieval_methods: NonEmptyVec::maybe_new(methods.clone()),
            protocol_info: None,
        };
        let device_engagement =
            Tag24::new(device_engagement).map_err(|e| Error::Encoding(e.to_string()))?;

        self.state = Some(Configured {
            device_engagement,
            methods,
            negotiated,
            factory,
            transports: TransportRegistry::new(),
            handover_state: NegotiatedHandoverState::default(),
            handover_select: None,
            handover_request: None,
            qr_used: false,
        });
        Ok(())
    }

    fn configured(&self) -> Result<&Configured, Error> {
        self.state.as_ref().ok_or(Error::NotConfigured)
    }

    fn configured_mut(&mut self) -> Result<&mut Configured, Error> {
        self.state.as_mut().ok_or(Error::NotConfigured)
    }

    pub fn device_engagement(&self) -> Result<&Tag24<DeviceEngagement>, Error> {
        Ok(&self.configured()?.device_engagement)
    }

    /// QR engagement: the `mdoc:` URI. The handover side is out of band, so
    /// transports are set up immediately.
    pub fn qr_engagement(&mut self) -> Result<String, Error> {
        let uri = {
            let state = self.configured_mut()?;
            state.qr_used = true;
            state.device_engagement.to_qr_code_uri()
        };
        self.setup_transports()?;
        Ok(uri)
    }

    /// The NDEF file content served to the reader, length-prefixed per the
    /// Type-4-Tag spec. Producing it is what triggers transport setup for
    /// static handover.
    pub fn ndef_file_content(&mut self) -> Result<Vec<u8>, Error> {
        let negotiated = self.configured()?.negotiated;
        let message = if negotiated {
            let state = self.configured_mut()?;
            state.handover_state = NegotiatedHandoverState::ExpectServiceSelect;
            ndef::service_parameter_message()
        } else {
            self.static_handover_select()?
        };
        Ok(length_prefixed(message))
    }

    fn static_handover_select(&mut self) -> Result<Vec<u8>, Error> {
        // New taps replace any transports from a previous tap.
        self.setup_transports()?;
        let state = self.configured_mut()?;
        let ble_options = state
            .methods
            .iter()
            .find_map(|method| match method {
                DeviceRetrievalMethod::Ble(options) => Some(options.clone()),
                _ => None,
            })
            .unwrap_or(BleOptions {
                peripheral_server_mode: None,
                central_client_mode: None,
            });
        let message =
            ndef::handover_select_message(&ble_options, &state.device_engagement.inner_bytes);
        state.handover_select = Some(message.clone());
        Ok(message)
    }

    /// Drive one round of the negotiated-handover NDEF exchange with a
    /// message written by the reader. Returns the next NDEF file content,
    /// length-prefixed.
    pub fn process_ndef_write(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let state = self.configured()?;
        if !state.negotiated {
            return Err(Error::UnexpectedNdefWrite);
        }
        match state.handover_state {
            NegotiatedHandoverState::ExpectServiceSelect => {
                let records = ndef::parse_records(message)?;
                let reply = ndef::tnep_status_message(&records)?;
                let state = self.configured_mut()?;
                state.handover_state = NegotiatedHandoverState::ExpectHandoverRequest;
                Ok(length_prefixed(reply))
            }
            NegotiatedHandoverState::ExpectHandoverRequest => {
                let records = ndef::parse_records(message)?;
                let carrier = ndef::parse_handover_request(&records)?;
                let reply = {
                    let state = self.configured_mut()?;
                    state.handover_request = Some(message.to_vec());
                    let reply = ndef::handover_select_message(
                        &carrier.to_ble_options(),
                        &state.device_engagement.inner_bytes,
                    );
                    state.handover_select = Some(reply.clone());
                    state.handover_state = NegotiatedHandoverState::ExpectHandoverSelect;
                    reply
                };
                // The connection method is agreed; only now do transports
                // come up.
                self.setup_transports()?;
                Ok(length_prefixed(reply))
            }
            NegotiatedHandoverState::NotStarted
            | NegotiatedHandoverState::ExpectHandoverSelect => Err(Error::UnexpectedNdefWrite),
        }
    }

    pub fn handover_state(&self) -> NegotiatedHandoverState {
        self.state
            .as_ref()
            .map(|state| state.handover_state)
            .unwrap_or_default()
    }

    /// The handover for the session transcript: QR engagement encodes as
    /// null, NFC as the (select, request) pair; static handover has no
    /// request side.
    pub fn handover(&self) -> Result<Handover, Error> {
        let state = self.configured()?;
        if state.qr_used {
            return Ok(Handover::Qr);
        }
        let select = state
            .handover_select
            .as_ref()
            .ok_or(Error::HandoverIncomplete)?;
        Ok(Handover::Nfc(
            ByteStr::from(select.clone()),
            state.handover_request.clone().map(ByteStr::from),
        ))
    }

    fn setup_transports(&mut self) -> Result<(), Error> {
        let state = self.configured_mut()?;
        let transports: Vec<Box<dyn Transport>> = state
            .methods
            .iter()
            .map(|method| state.factory.create(method))
            .collect();
        state.transports.replace(transports);
        state.transports.connect_all()?;
        Ok(())
    }

    pub fn transports(&self) -> Option<TransportRegistry> {
        self.state.as_ref().map(|state| state.transports.clone())
    }

    pub fn open_transport_count(&self) -> usize {
        self.state
            .as_ref()
            .map(|state| state.transports.open_count())
            .unwrap_or(0)
    }

    /// Close every transport. Idempotent; the coordinator stays configured.
    pub fn close(&mut self) {
        if let Some(state) = &self.state {
            state.transports.close_all();
        }
    }
}

fn length_prefixed(message: Vec<u8>) -> Vec<u8> {
    [&(message.len() as u16).to_be_bytes() as &[u8], &message].concat()
}
