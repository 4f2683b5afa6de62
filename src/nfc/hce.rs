//! The Host-Card-Emulation APDU state machine.
//!
//! [HceDriver::process_command] runs synchronously on the platform's NFC
//! callback thread and must answer within the reader's timeout window, so
//! nothing in this path blocks on user interaction: consent is a bounded
//! synchronous callback between request parsing and response assembly, and
//! the BLE-visibility delay is a bounded sleep.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::cbor;
use crate::definitions::device_engagement::DeviceRetrievalMethod;
use crate::definitions::helpers::{ByteStr, Tag24};
use crate::definitions::session::{
    self, SessionData, SessionEstablishment, SessionTranscript, Status as SessionStatus,
};
use crate::definitions::x509::crl::CrlFetcher;
use crate::definitions::x509::validation::ValidationOptions;
use crate::definitions::x509::TrustAnchorRegistry;
use crate::engagement::{EngagementCoordinator, TransportFactory};
use crate::events::{EventListener, SessionEvent};
use crate::keys::KeyCapability;
use crate::nfc::apdu::{
    self, Apdu, FileId, Response, StatusWord, AID_MDOC_DATA_TRANSFER, AID_NDEF_APPLICATION,
};
use crate::nfc::util::KnownOrRaw;
use crate::presentation::holder::{
    build_response, parse_device_request, ParsedRequest, PermittedItems, ResponseOutcome,
};
use crate::storage::DocumentStore;
use crate::transport::TransportEvent;

#[derive(Debug, Clone)]
pub struct HceConfig {
    pub negotiated_handover: bool,
    /// Maximum response data bytes per APDU; larger responses are buffered
    /// and drained through GET RESPONSE.
    pub max_response_apdu_length: usize,
    /// Bounded pause before serving the final NDEF chunk, giving the BLE
    /// radio time to become visible after transport setup.
    pub ble_visibility_delay: Duration,
}

impl Default for HceConfig {
    fn default() -> Self {
        Self {
            negotiated_handover: false,
            max_response_apdu_length: 255,
            ble_visibility_delay: Duration::from_millis(100),
        }
    }
}

/// Decides which requested elements the holder releases. Invoked between
/// request parsing and response assembly; implementations must return
/// promptly (pre-arm approval, never wait for a dialog here).
pub trait ConsentDecider: Send {
    fn decide(&self, request: &ParsedRequest) -> PermittedItems;
}

impl<F: Fn(&ParsedRequest) -> PermittedItems + Send> ConsentDecider for F {
    fn decide(&self, request: &ParsedRequest) -> PermittedItems {
        self(request)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("engagement error: {0}")]
    Engagement(#[from] crate::engagement::Error),
    #[error("session error: {0}")]
    Session(#[from] session::Error),
}

/// Mutable state for one tag presence, created on field detection and
/// destroyed on deactivation.
#[derive(Default)]
struct ApduSessionState {
    selected_file: Option<KnownOrRaw<u16, FileId>>,
    file_content: Vec<u8>,
    envelope_buffer: Vec<u8>,
    pending_response: Option<PendingResponse>,
    extended_length: bool,
    ndef_write: NdefWriteBuffer,
    ble_delay_pending: bool,
}

struct PendingResponse {
    bytes: Vec<u8>,
    offset: usize,
}

/// Established session-encryption state. Dropped on teardown, zeroizing the
/// symmetric keys.
struct SessionCrypto {
    transcript: SessionTranscript,
    transcript_bytes: Tag24<SessionTranscript>,
    sk_device: Zeroizing<[u8; 32]>,
    sk_reader: Zeroizing<[u8; 32]>,
    device_counter: u32,
    reader_counter: u32,
}

enum SessionReply {
    Data(Vec<u8>),
    /// Reply, then tear the session down.
    DataThenTerminate(Vec<u8>),
    Terminated,
}

enum ProcessError {
    /// Decode failure before any encrypted exchange: the session stays
    /// usable for a retry.
    Decode(String),
    /// Anything after the encrypted exchange has started is fatal.
    Fatal(String),
}

pub struct HceDriver<S, K, C> {
    engagement: EngagementCoordinator,
    store: S,
    keys: K,
    crl_fetcher: C,
    trust_anchors: TrustAnchorRegistry,
    validation_options: ValidationOptions,
    listener: Box<dyn EventListener>,
    consent: Box<dyn ConsentDecider>,
    config: HceConfig,
    e_device_key: Option<p256::SecretKey>,
    session: Option<ApduSessionState>,
    crypto: Option<SessionCrypto>,
}

impl<S, K, C> HceDriver<S, K, C>
where
    S: DocumentStore,
    K: KeyCapability,
    C: CrlFetcher,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: S,
        keys: K,
        crl_fetcher: C,
        trust_anchors: TrustAnchorRegistry,
        connection_methods: Vec<DeviceRetrievalMethod>,
        transport_factory: Box<dyn TransportFactory>,
        listener: Box<dyn EventListener>,
        consent: Box<dyn ConsentDecider>,
        config: HceConfig,
    ) -> Result<Self, Error> {
        let (e_device_key, e_device_key_public) = session::create_p256_ephemeral_keys()?;
        let mut engagement = EngagementCoordinator::new();
        engagement.configure(
            e_device_key_public,
            connection_methods,
            config.negotiated_handover,
            transport_factory,
        )?;
        Ok(Self {
            engagement,
            store,
            keys,
            crl_fetcher,
            trust_anchors,
            validation_options: ValidationOptions::default(),
            listener,
            consent,
            config,
            e_device_key: Some(e_device_key),
            session: None,
            crypto: None,
        })
    }

    /// QR engagement through the same driver: the URI to render, with
    /// transports brought up immediately.
    pub fn qr_engagement(&mut self) -> Result<String, Error> {
        self.listener.on_event(SessionEvent::Connecting);
        Ok(self.engagement.qr_engagement()?)
    }

    /// An NFC field was detected.
    pub fn on_activated(&mut self) {
        self.session = Some(ApduSessionState::default());
    }

    /// The NFC link was lost or the application was deselected.
    pub fn on_deactivated(&mut self) {
        self.terminate_session();
        self.session = None;
        self.listener.on_event(SessionEvent::Disconnected);
    }

    /// Idempotent full teardown; afterwards zero transports remain open.
    pub fn close(&mut self) {
        self.terminate_session();
        self.session = None;
    }

    pub fn open_transport_count(&self) -> usize {
        self.engagement.open_transport_count()
    }

    fn terminate_session(&mut self) {
        self.engagement.close();
        self.crypto = None;
        // Dropping the secret key zeroizes it.
        self.e_device_key = None;
    }

    /// Process one command APDU and produce the response APDU. Never
    /// panics or returns an error to the platform: every failure maps to a
    /// status word.
    pub fn process_command(&mut self, command: &[u8]) -> Vec<u8> {
        if self.session.is_none() {
            // Tolerate platforms that do not signal field detection
            // separately from the first command.
            self.on_activated();
        }
        let response = match self.process_command_inner(command) {
            Ok(response) => response,
            Err(response) => response,
        };
        response.into()
    }

    fn process_command_inner(&mut self, command: &[u8]) -> Result<Response, Response> {
        let command = Apdu::parse(command)?;
        match command {
            Apdu::SelectAid { aid } => self.select_aid(aid),
            Apdu::SelectFile { file_id } => self.select_file(file_id),
            Apdu::ReadBinary { offset, length } => self.read_binary(offset, length),
            Apdu::UpdateBinary { offset, data } => {
                let data = data.to_vec();
                self.update_binary(offset, &data)
            }
            Apdu::Envelope {
                more_data,
                data,
                extended_length,
            } => {
                let data = data.to_vec();
                self.envelope(more_data, &data, extended_length)
            }
            Apdu::GetResponse {
                length,
                extended_length,
            } => self.get_response(length, extended_length),
        }
    }

    fn select_aid(&mut self, aid: &[u8]) -> Result<Response, Response> {
        match aid {
            AID_MDOC_DATA_TRANSFER | AID_NDEF_APPLICATION => Ok(StatusWord::Ok.into()),
            _ => {
                self.listener.on_event(SessionEvent::NotSupported);
                Err(StatusWord::FileOrApplicationNotFound.into())
            }
        }
    }

    fn select_file(&mut self, file_id: KnownOrRaw<u16, FileId>) -> Result<Response, Response> {
        match file_id {
            KnownOrRaw::Known(FileId::CapabilityContainer) => {
                let session = self.session.as_mut().expect("session exists");
                session.file_content = capability_container(&self.config);
                session.selected_file = Some(file_id);
                Ok(StatusWord::Ok.into())
            }
            KnownOrRaw::Known(FileId::NdefFile) => {
                let session = self.session.as_ref().expect("session exists");
                // Re-selecting the NDEF file must not refresh its content.
                if session.selected_file == Some(file_id) {
                    return Ok(StatusWord::Ok.into());
                }
                self.listener.on_event(SessionEvent::Connecting);
                let content = self.engagement.ndef_file_content().map_err(|e| {
                    self.listener
                        .on_event(SessionEvent::Error(format!("engagement failed: {e}")));
                    Response::from(StatusWord::Unspecified)
                })?;
                let session = self.session.as_mut().expect("session exists");
                session.file_content = content;
                session.selected_file = Some(file_id);
                // Static handover just brought transports up; stall the
                // final read below so the radio is discoverable.
                session.ble_delay_pending = !self.config.negotiated_handover;
                Ok(StatusWord::Ok.into())
            }
            KnownOrRaw::Unknown(_) => Err(StatusWord::FileOrApplicationNotFound.into()),
        }
    }

    fn read_binary(&mut self, offset: usize, length: usize) -> Result<Response, Response> {
        let delay = self.config.ble_visibility_delay;
        let session = self.session.as_mut().expect("session exists");
        if session.selected_file.is_none() {
            return Err(StatusWord::ConditionsNotSatisfied.into());
        }
        let file = &session.file_content;
        if offset > file.len() {
            return Err(StatusWord::WrongParameters.into());
        }
        let end = file.len().min(offset + length);
        let payload = file[offset..end].to_vec();

        if session.ble_delay_pending && end >= file.len() && !delay.is_zero() {
            session.ble_delay_pending = false;
            std::thread::sleep(delay);
        }

        Ok(Response {
            status: StatusWord::Ok,
            payload,
        })
    }

    fn update_binary(&mut self, offset: usize, data: &[u8]) -> Result<Response, Response> {
        if !self.config.negotiated_handover {
            return Err(StatusWord::ConditionsNotSatisfied.into());
        }
        let session = self.session.as_mut().expect("session exists");
        match session.ndef_write.handle(offset, data) {
            Ok(Some(message)) => {
                let content = self.engagement.process_ndef_write(&message).map_err(|e| {
                    self.listener
                        .on_event(SessionEvent::Error(format!("handover failed: {e}")));
                    Response::from(StatusWord::Unspecified)
                })?;
                let handover_complete = matches!(
                    self.engagement.handover_state(),
                    crate::engagement::NegotiatedHandoverState::ExpectHandoverSelect
                );
                if handover_complete {
                    self.listener.on_event(SessionEvent::Connecting);
                }
                let session = self.session.as_mut().expect("session exists");
                session.file_content = content;
                session.selected_file = Some(KnownOrRaw::Known(FileId::NdefFile));
                session.ble_delay_pending = handover_complete;
                Ok(StatusWord::Ok.into())
            }
            Ok(None) => Ok(StatusWord::Ok.into()),
            Err(status) => Err(status.into()),
        }
    }

    fn envelope(
        &mut self,
        more_data: bool,
        data: &[u8],
        extended_length: bool,
    ) -> Result<Response, Response> {
        {
            let session = self.session.as_mut().expect("session exists");
            session.extended_length |= extended_length;
            session.envelope_buffer.extend_from_slice(data);
            if more_data {
                return Ok(StatusWord::Ok.into());
            }
        }
        let chained = {
            let session = self.session.as_mut().expect("session exists");
            std::mem::take(&mut session.envelope_buffer)
        };

        let message = apdu::unwrap_do53(&chained).map_err(|e| {
            self.listener
                .on_event(SessionEvent::Error(format!("malformed envelope: {e}")));
            Response::from(StatusWord::WrongParameters)
        })?;

        let reply = match self.handle_session_message(message) {
            Ok(SessionReply::Data(reply)) => reply,
            Ok(SessionReply::DataThenTerminate(reply)) => {
                self.terminate_session();
                reply
            }
            Ok(SessionReply::Terminated) => {
                self.terminate_session();
                return Ok(StatusWord::Ok.into());
            }
            Err(ProcessError::Decode(e)) => {
                self.listener.on_event(SessionEvent::Error(e));
                return Err(StatusWord::FileOrApplicationNotFound.into());
            }
            Err(ProcessError::Fatal(e)) => {
                self.listener.on_event(SessionEvent::Error(e));
                self.terminate_session();
                return Err(StatusWord::FileOrApplicationNotFound.into());
            }
        };

        let wrapped = apdu::wrap_do53(&reply);
        let session = self.session.as_mut().expect("session exists");
        if wrapped.len() <= self.config.max_response_apdu_length {
            return Ok(Response {
                status: StatusWord::Ok,
                payload: wrapped,
            });
        }
        session.pending_response = Some(PendingResponse {
            bytes: wrapped,
            offset: 0,
        });
        Ok(Response::from(StatusWord::MoreDataAvailable(0)))
    }

    fn get_response(&mut self, length: usize, extended_length: bool) -> Result<Response, Response> {
        let max_chunk = self.config.max_response_apdu_length;
        let session = self.session.as_mut().expect("session exists");
        let Some(pending) = session.pending_response.as_mut() else {
            return Err(StatusWord::ConditionsNotSatisfied.into());
        };

        let remaining = pending.bytes.len() - pending.offset;
        // Le of zero with extended length requests everything remaining.
        let requested = if length == 0 && (extended_length || session.extended_length) {
            remaining
        } else {
            length
        };
        let chunk_len = remaining.min(requested).min(max_chunk);
        let chunk = pending.bytes[pending.offset..pending.offset + chunk_len].to_vec();
        pending.offset += chunk_len;
        let left = pending.bytes.len() - pending.offset;

        if left == 0 {
            session.pending_response = None;
            self.listener.on_event(SessionEvent::DocumentSent);
            Ok(Response {
                status: StatusWord::Ok,
                payload: chunk,
            })
        } else {
            let indicator = if left > 255 { 0 } else { left as u8 };
            Ok(Response {
                status: StatusWord::MoreDataAvailable(indicator),
                payload: chunk,
            })
        }
    }

    /// An event from one of the session's transports. Runs on the transport
    /// executor's thread, not the NFC callback thread.
    pub fn handle_transport_event(&mut self, index: usize, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if let Some(transports) = self.engagement.transports() {
                    transports.promote(index);
                }
                self.listener.on_event(SessionEvent::Connected);
            }
            TransportEvent::MessageReceived(message) => {
                let reply = match self.handle_session_message(&message) {
                    Ok(SessionReply::Data(reply)) => Some(reply),
                    Ok(SessionReply::DataThenTerminate(reply)) => {
                        // Send, then drop the session.
                        if let Some(transports) = self.engagement.transports() {
                            if let Err(e) = transports.send(&reply) {
                                self.listener
                                    .on_event(SessionEvent::Error(format!("send failed: {e}")));
                            } else {
                                self.listener.on_event(SessionEvent::DocumentSent);
                            }
                        }
                        self.terminate_session();
                        None
                    }
                    Ok(SessionReply::Terminated) => {
                        self.terminate_session();
                        None
                    }
                    Err(ProcessError::Decode(e)) | Err(ProcessError::Fatal(e)) => {
                        self.listener.on_event(SessionEvent::Error(e));
                        self.terminate_session();
                        None
                    }
                };
                if let Some(reply) = reply {
                    if let Some(transports) = self.engagement.transports() {
                        match transports.send(&reply) {
                            Ok(()) => self.listener.on_event(SessionEvent::DocumentSent),
                            Err(e) => self
                                .listener
                                .on_event(SessionEvent::Error(format!("send failed: {e}"))),
                        }
                    }
                }
            }
            TransportEvent::Disconnected => {
                self.terminate_session();
                self.listener.on_event(SessionEvent::Disconnected);
            }
            TransportEvent::Error(e) => {
                self.listener
                    .on_event(SessionEvent::Error(format!("transport error: {e}")));
            }
        }
    }

    fn handle_session_message(&mut self, message: &[u8]) -> Result<SessionReply, ProcessError> {
        if self.crypto.is_none() {
            let establishment: SessionEstablishment = cbor::from_slice(message)
                .map_err(|e| ProcessError::Decode(format!("bad session establishment: {e}")))?;
            self.establish_session(establishment)
        } else {
            let session_data: SessionData = cbor::from_slice(message)
                .map_err(|e| ProcessError::Fatal(format!("bad session data: {e}")))?;
            if session_data.status == Some(SessionStatus::SessionTermination) {
                return Ok(SessionReply::Terminated);
            }
            let Some(data) = session_data.data else {
                return Err(ProcessError::Fatal(
                    "session data carried neither payload nor termination".to_string(),
                ));
            };
            let crypto = self.crypto.as_mut().expect("crypto exists");
            let plaintext = session::decrypt_reader_data(
                &crypto.sk_reader,
                data.as_ref(),
                &mut crypto.reader_counter,
            )
            .map_err(|e| ProcessError::Fatal(format!("unable to decrypt request: {e}")))?;
            self.process_request(&plaintext)
        }
    }

    fn establish_session(
        &mut self,
        establishment: SessionEstablishment,
    ) -> Result<SessionReply, ProcessError> {
        let e_device_key = self
            .e_device_key
            .as_ref()
            .ok_or_else(|| ProcessError::Fatal("session already terminated".to_string()))?;
        let device_engagement = self
            .engagement
            .device_engagement()
            .map_err(|e| ProcessError::Decode(e.to_string()))?
            .clone();
        let handover = self
            .engagement
            .handover()
            .map_err(|e| ProcessError::Decode(format!("handover not available: {e}")))?;

        let e_reader_key = establishment.e_reader_key;
        let transcript =
            SessionTranscript(device_engagement, e_reader_key.clone(), handover);
        let transcript_bytes = Tag24::new(transcript.clone())
            .map_err(|e| ProcessError::Decode(format!("unable to encode transcript: {e}")))?;

        let shared_secret = session::get_shared_secret(
            e_reader_key.into_inner(),
            &e_device_key.to_nonzero_scalar(),
        )
        .map_err(|e| ProcessError::Decode(format!("key agreement failed: {e}")))?;

        let sk_reader = session::derive_session_key(&shared_secret, &transcript_bytes, true)
            .map_err(|e| ProcessError::Fatal(e.to_string()))?;
        let sk_device = session::derive_session_key(&shared_secret, &transcript_bytes, false)
            .map_err(|e| ProcessError::Fatal(e.to_string()))?;

        self.crypto = Some(SessionCrypto {
            transcript,
            transcript_bytes,
            sk_device: Zeroizing::new(sk_device),
            sk_reader: Zeroizing::new(sk_reader),
            device_counter: 0,
            reader_counter: 0,
        });

        let crypto = self.crypto.as_mut().expect("crypto exists");
        let plaintext = session::decrypt_reader_data(
            &crypto.sk_reader,
            establishment.data.as_ref(),
            &mut crypto.reader_counter,
        )
        .map_err(|e| ProcessError::Fatal(format!("unable to decrypt request: {e}")))?;

        self.process_request(&plaintext)
    }

    fn process_request(&mut self, request_bytes: &[u8]) -> Result<SessionReply, ProcessError> {
        let crypto = self.crypto.as_ref().expect("crypto exists");
        let transcript = crypto.transcript.clone();
        let transcript_bytes = crypto.transcript_bytes.clone();

        let parsed = match parse_device_request(
            request_bytes,
            &transcript,
            &self.trust_anchors,
            &self.crl_fetcher,
            &self.validation_options,
        ) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.listener
                    .on_event(SessionEvent::Error(format!("bad request: {e}")));
                let reply = SessionData {
                    data: None,
                    status: Some(SessionStatus::CborDecodingError),
                };
                let encoded = cbor::to_vec(&reply)
                    .map_err(|e| ProcessError::Fatal(e.to_string()))?;
                return Ok(SessionReply::DataThenTerminate(encoded));
            }
        };

        self.listener.on_event(SessionEvent::RequestReceived {
            summary: parsed.to_json(),
            session_transcript: transcript_bytes,
        });

        let permitted = self.consent.decide(&parsed);

        let outcome = build_response(&self.store, &self.keys, &transcript, &parsed, permitted)
            .map_err(|e| ProcessError::Fatal(format!("unable to build response: {e}")))?;

        let reply = match outcome {
            ResponseOutcome::Ready(response_bytes) => {
                let crypto = self.crypto.as_mut().expect("crypto exists");
                match session::encrypt_device_data(
                    &crypto.sk_device,
                    &response_bytes,
                    &mut crypto.device_counter,
                ) {
                    Ok(encrypted) => {
                        // The session stays up: the reader may follow with
                        // further requests or terminate it.
                        let reply = SessionData {
                            data: Some(ByteStr::from(encrypted)),
                            status: None,
                        };
                        let encoded = cbor::to_vec(&reply)
                            .map_err(|e| ProcessError::Fatal(e.to_string()))?;
                        return Ok(SessionReply::Data(encoded));
                    }
                    Err(e) => {
                        self.listener
                            .on_event(SessionEvent::Error(format!("encryption failed: {e}")));
                        SessionData {
                            data: None,
                            status: Some(SessionStatus::SessionEncryptionError),
                        }
                    }
                }
            }
            ResponseOutcome::NoDocumentFound => {
                self.listener.on_event(SessionEvent::Error(
                    "no matching document in store".to_string(),
                ));
                SessionData {
                    data: None,
                    status: Some(SessionStatus::SessionTermination),
                }
            }
            ResponseOutcome::UserAuthRequired(_) => {
                // The key cannot be unlocked within the reader's timeout
                // window; terminate and let the holder retry after
                // authenticating.
                self.listener.on_event(SessionEvent::Error(
                    "signing key requires user authentication".to_string(),
                ));
                SessionData {
                    data: None,
                    status: Some(SessionStatus::SessionTermination),
                }
            }
        };

        let encoded = cbor::to_vec(&reply).map_err(|e| ProcessError::Fatal(e.to_string()))?;
        Ok(SessionReply::DataThenTerminate(encoded))
    }
}

/// Type-4-Tag capability container, advertising the negotiated maximum APDU
/// sizes and the NDEF file.
fn capability_container(config: &HceConfig) -> Vec<u8> {
    let max_response = (config.max_response_apdu_length as u16).to_be_bytes();
    let max_command = 255u16.to_be_bytes();
    let max_ndef = crate::engagement::ndef::NFC_MAX_PAYLOAD_SIZE as u16;
    let max_ndef = max_ndef.to_be_bytes();
    vec![
        0x00, 0x0F, // CC length
        0x20, // mapping version 2.0
        max_response[0],
        max_response[1],
        max_command[0],
        max_command[1],
        0x04, // NDEF file control TLV
        0x06, // TLV length
        0xE1, 0x04, // NDEF file id
        max_ndef[0],
        max_ndef[1],
        0x00, // read access
        // Write access: open during negotiated handover, locked for static.
        if config.negotiated_handover { 0x00 } else { 0xFF },
    ]
}

/// Buffer for the Type-4-Tag NDEF write procedure used during negotiated
/// handover: offset 0 with a zero length resets, offset 0 with a non-zero
/// length is a single-shot write, offsets >= 2 append to the growing file.
#[derive(Debug, Default)]
struct NdefWriteBuffer {
    bytes: Vec<u8>,
}

impl NdefWriteBuffer {
    fn reset(&mut self) {
        self.bytes.clear();
    }

    fn handle(&mut self, offset: usize, data: &[u8]) -> Result<Option<Vec<u8>>, StatusWord> {
        if offset == 1 {
            // The file length must be written in one piece.
            return Err(StatusWord::Unspecified);
        }
        let (file_length, data) = if offset == 0 && data.len() >= 2 {
            (
                Some(u16::from_be_bytes([data[0], data[1]]) as usize),
                &data[2..],
            )
        } else {
            (None, data)
        };
        match (offset, file_length, data.len()) {
            // Zero-length write: reset the file state.
            (0, Some(0), 0) => {
                self.reset();
                Ok(None)
            }
            (0, Some(file_length), 0) => {
                // Length write finalizing a previous append sequence.
                if self.bytes.len() == file_length {
                    Ok(Some(std::mem::take(&mut self.bytes)))
                } else {
                    self.reset();
                    Err(StatusWord::ConditionsNotSatisfied)
                }
            }
            (0, Some(file_length), _) => {
                self.reset();
                self.bytes.extend_from_slice(data);
                if file_length == data.len() {
                    // Single-shot write of the whole file.
                    Ok(Some(std::mem::take(&mut self.bytes)))
                } else {
                    Ok(None)
                }
            }
            (0, None, _) => {
                self.reset();
                Err(StatusWord::Unspecified)
            }
            (offset_plus_two, _, _) => {
                // The wire offset counts the 2-byte length prefix.
                let offset = offset_plus_two - 2;
                if offset != self.bytes.len() {
                    // Non-contiguous writes are not supported.
                    self.reset();
                    Err(StatusWord::ConditionsNotSatisfied)
                } else {
                    self.bytes.extend_from_slice(data);
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ndef_write_single_shot() {
        let mut buffer = NdefWriteBuffer::default();
        let payload = [0x00, 0x03, 0xAA, 0xBB, 0xCC];
        let message = buffer.handle(0, &payload).unwrap();
        assert_eq!(message, Some(vec![0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn ndef_write_reset_append_finalize() {
        let mut buffer = NdefWriteBuffer::default();
        // Reset: zero length.
        assert_eq!(buffer.handle(0, &[0x00, 0x00]).unwrap(), None);
        // Append at offset 2 and 5 (file offsets 0 and 3).
        assert_eq!(buffer.handle(2, &[1, 2, 3]).unwrap(), None);
        assert_eq!(buffer.handle(5, &[4, 5]).unwrap(), None);
        // Finalize with the length.
        let message = buffer.handle(0, &[0x00, 0x05]).unwrap();
        assert_eq!(message, Some(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn ndef_write_noncontiguous_fails() {
        let mut buffer = NdefWriteBuffer::default();
        assert_eq!(buffer.handle(0, &[0x00, 0x00]).unwrap(), None);
        assert_eq!(buffer.handle(2, &[1, 2]).unwrap(), None);
        assert!(buffer.handle(7, &[3]).is_err());
    }

    #[test]
    fn ndef_write_length_mismatch_fails() {
        let mut buffer = NdefWriteBuffer::default();
        assert_eq!(buffer.handle(0, &[0x00, 0x00]).unwrap(), None);
        assert_eq!(buffer.handle(2, &[1, 2]).unwrap(), None);
        assert!(buffer.handle(0, &[0x00, 0x05]).is_err());
    }

    #[test]
    fn capability_container_reflects_mode() {
        let static_cc = capability_container(&HceConfig::default());
        assert_eq!(*static_cc.last().unwrap(), 0xFF);
        let negotiated_cc = capability_container(&HceConfig {
            negotiated_handover: true,
            ..Default::default()
        });
        assert_eq!(*negotiated_cc.last().unwrap(), 0x00);
    }
}
