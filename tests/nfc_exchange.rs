//! End-to-end exchanges over the APDU surface: engagement through the NDEF
//! file, session establishment and request transfer through chained
//! ENVELOPEs, and chunked response retrieval through GET RESPONSE.

mod common;

use std::collections::HashMap;

use common::{
    mdl_with_portrait_of, EventLog, MemoryStore, NullTransportFactory, SimulatedReader, SoftKeys,
    MDL_DOC_TYPE, MDL_NAMESPACE,
};

use mdoc_holder::cbor;
use mdoc_holder::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod,
};
use mdoc_holder::definitions::device_response::DeviceResponse;
use mdoc_holder::definitions::helpers::{ByteStr, Tag24};
use mdoc_holder::definitions::session::{Handover, SessionData, Status as SessionStatus};
use mdoc_holder::definitions::x509::TrustAnchorRegistry;
use mdoc_holder::definitions::DeviceEngagement;
use mdoc_holder::engagement::ndef;
use mdoc_holder::presentation::holder::{permit_all, ParsedRequest};
use mdoc_holder::storage::DocumentStore;
use mdoc_holder::{HceConfig, HceDriver, SessionEvent};

struct PortraitStore {
    inner: HashMap<String, Vec<u8>>,
}

impl PortraitStore {
    fn new(portrait_len: usize) -> Self {
        let mut inner = HashMap::new();
        inner.insert(MDL_DOC_TYPE.to_string(), mdl_with_portrait_of(portrait_len));
        Self { inner }
    }
}

impl DocumentStore for PortraitStore {
    fn issuer_signed_bytes(
        &self,
        doc_type: &str,
    ) -> Result<Vec<u8>, mdoc_holder::storage::StoreError> {
        self.inner
            .get(doc_type)
            .cloned()
            .ok_or_else(|| mdoc_holder::storage::StoreError::NotFound(doc_type.to_string()))
    }

    fn key_alias(&self, _doc_type: &str) -> Result<String, mdoc_holder::storage::StoreError> {
        Ok("credential-key-1".to_string())
    }
}

fn ble_method() -> DeviceRetrievalMethod {
    DeviceRetrievalMethod::Ble(BleOptions {
        peripheral_server_mode: None,
        central_client_mode: Some(CentralClientMode {
            uuid: uuid::Uuid::from_bytes([0x0B; 16]),
        }),
    })
}

fn permissive_consent() -> Box<dyn mdoc_holder::nfc::ConsentDecider> {
    Box::new(|request: &ParsedRequest| permit_all(request))
}

fn driver_with<S: DocumentStore>(
    store: S,
    config: HceConfig,
    events: EventLog,
) -> HceDriver<S, SoftKeys, ()> {
    HceDriver::new(
        store,
        SoftKeys::new(),
        (),
        TrustAnchorRegistry::default(),
        vec![ble_method()],
        Box::new(NullTransportFactory),
        Box::new(events),
        permissive_consent(),
        config,
    )
    .unwrap()
}

const SELECT_NDEF_APP: &[u8] = &[
    0x00, 0xA4, 0x04, 0x00, 0x07, 0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01, 0x00,
];
const SELECT_CC: &[u8] = &[0x00, 0xA4, 0x00, 0x0C, 0x02, 0xE1, 0x03];
const SELECT_NDEF_FILE: &[u8] = &[0x00, 0xA4, 0x00, 0x0C, 0x02, 0xE1, 0x04];

fn status(response: &[u8]) -> [u8; 2] {
    [
        response[response.len() - 2],
        response[response.len() - 1],
    ]
}

fn payload(response: &[u8]) -> &[u8] {
    &response[..response.len() - 2]
}

fn read_binary(offset: u16, length: u8) -> Vec<u8> {
    let offset = offset.to_be_bytes();
    vec![0x00, 0xB0, offset[0], offset[1], length]
}

/// Read the full NDEF file through the 2-byte length prefix.
fn read_ndef_file<S: DocumentStore>(driver: &mut HceDriver<S, SoftKeys, ()>) -> Vec<u8> {
    let response = driver.process_command(&read_binary(0, 2));
    assert_eq!(status(&response), [0x90, 0x00]);
    let total = u16::from_be_bytes([response[0], response[1]]) as usize;

    let mut content = vec![];
    let mut offset = 2usize;
    while content.len() < total {
        let chunk = (total - content.len()).min(0xF0) as u8;
        let response = driver.process_command(&read_binary(offset as u16, chunk));
        assert_eq!(status(&response), [0x90, 0x00]);
        content.extend_from_slice(payload(&response));
        offset += chunk as usize;
    }
    content
}

fn engagement_from_handover_select(message: &[u8]) -> Tag24<DeviceEngagement> {
    let records = ndef::parse_records(message).unwrap();
    let engagement = records
        .iter()
        .find(|record| record.type_bytes == b"iso.org:18013:deviceengagement")
        .expect("handover select carries the device engagement");
    Tag24::from_bytes(engagement.payload.to_vec()).unwrap()
}

/// Wrap a session message in DO'53' and deliver it through command-chained
/// ENVELOPEs of the given chunk size.
fn send_enveloped<S: DocumentStore>(
    driver: &mut HceDriver<S, SoftKeys, ()>,
    message: &[u8],
    chunk_size: usize,
) -> Vec<u8> {
    let wrapped = mdoc_holder::nfc::apdu::wrap_do53(message);
    let chunks: Vec<&[u8]> = wrapped.chunks(chunk_size).collect();
    let mut last_response = vec![];
    for (i, chunk) in chunks.iter().enumerate() {
        let terminal = i == chunks.len() - 1;
        let cla = if terminal { 0x00 } else { 0x10 };
        let mut command = vec![cla, 0xC3, 0x00, 0x00];
        // Extended Lc so responses may exceed 256 bytes.
        command.push(0x00);
        command.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        command.extend_from_slice(chunk);
        command.extend_from_slice(&[0x00, 0x00]);
        last_response = driver.process_command(&command);
        if !terminal {
            assert_eq!(status(&last_response), [0x90, 0x00]);
        }
    }
    last_response
}

/// Drain a buffered response through GET RESPONSE, asserting the chaining
/// status words along the way.
fn drain_get_response<S: DocumentStore>(
    driver: &mut HceDriver<S, SoftKeys, ()>,
    first_response: &[u8],
) -> Vec<u8> {
    let mut collected = payload(first_response).to_vec();
    let mut sw = status(first_response);
    while sw[0] == 0x61 {
        let response = driver.process_command(&[0x00, 0xC0, 0x00, 0x00, 0x00]);
        sw = status(&response);
        collected.extend_from_slice(payload(&response));
        assert!(sw[0] == 0x61 || sw == [0x90, 0x00]);
    }
    assert_eq!(sw, [0x90, 0x00], "final chunk must carry 9000");
    collected
}

fn run_static_exchange(
    portrait_len: usize,
    max_response_apdu_length: usize,
) -> (DeviceResponse, EventLog) {
    let events = EventLog::default();
    let mut driver = driver_with(
        PortraitStore::new(portrait_len),
        HceConfig {
            max_response_apdu_length,
            ble_visibility_delay: std::time::Duration::ZERO,
            ..Default::default()
        },
        events.clone(),
    );

    driver.on_activated();
    assert_eq!(status(&driver.process_command(SELECT_NDEF_APP)), [0x90, 0x00]);
    assert_eq!(status(&driver.process_command(SELECT_CC)), [0x90, 0x00]);
    let cc = driver.process_command(&read_binary(0, 0x0F));
    assert_eq!(status(&cc), [0x90, 0x00]);
    assert_eq!(payload(&cc).len(), 15);

    assert_eq!(
        status(&driver.process_command(SELECT_NDEF_FILE)),
        [0x90, 0x00]
    );
    let handover_select = read_ndef_file(&mut driver);
    let device_engagement = engagement_from_handover_select(&handover_select);
    let handover = Handover::Nfc(ByteStr::from(handover_select), None);

    let request = common::device_request_bytes(
        MDL_DOC_TYPE,
        &[("given_name", false), ("portrait", false)],
    );
    let (mut reader, establishment) =
        SimulatedReader::establish(device_engagement, handover, &request);

    let response = send_enveloped(&mut driver, &establishment, 200);
    let collected = if status(&response)[0] == 0x61 {
        drain_get_response(&mut driver, &response)
    } else {
        assert_eq!(status(&response), [0x90, 0x00]);
        payload(&response).to_vec()
    };

    let message = mdoc_holder::nfc::apdu::unwrap_do53(&collected).unwrap();
    let session_data = reader.decrypt_response(message);
    let plaintext = reader.decrypt_payload(session_data.data.as_ref().unwrap());
    let device_response: DeviceResponse = cbor::from_slice(&plaintext).unwrap();
    (device_response, events)
}

#[test]
fn static_handover_end_to_end() {
    let (response, events) = run_static_exchange(64, 255);
    let documents = response.documents.unwrap().into_inner();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].doc_type, MDL_DOC_TYPE);
    let namespaces = documents[0].issuer_signed.namespaces.clone().unwrap();
    let elements: Vec<String> = namespaces[MDL_NAMESPACE]
        .iter()
        .map(|item| item.as_ref().element_identifier.clone())
        .collect();
    assert!(elements.contains(&"given_name".to_string()));
    assert!(elements.contains(&"portrait".to_string()));

    assert!(events.contains(|e| matches!(e, SessionEvent::Connecting)));
    assert!(events.contains(|e| matches!(e, SessionEvent::RequestReceived { .. })));
}

/// Responses straddling the negotiated APDU size: one portrait byte moves
/// the encrypted response by one byte, so sweeping sizes spaced across
/// several multiples of the 128-byte chunk limit exercises chunk counts on
/// both sides of each boundary, and a large case needs many chunks.
#[rstest::rstest]
#[case::size_40(40)]
#[case::size_100(100)]
#[case::size_160(160)]
#[case::size_220(220)]
#[case::size_283(283)]
#[case::many_chunks(600)]
fn chunked_response_reassembles(#[case] portrait_len: usize) {
    let (response, events) = run_static_exchange(portrait_len, 128);
    let documents = response.documents.unwrap().into_inner();
    let namespaces = documents[0].issuer_signed.namespaces.clone().unwrap();
    let portrait = namespaces[MDL_NAMESPACE]
        .iter()
        .find(|item| item.as_ref().element_identifier == "portrait")
        .unwrap();
    let ciborium::Value::Bytes(bytes) = &portrait.as_ref().element_value else {
        panic!("portrait must be bytes");
    };
    // AEAD decryption succeeding proves the chunks reassembled exactly.
    assert_eq!(bytes.len(), portrait_len);
    assert!(events.contains(|e| matches!(e, SessionEvent::DocumentSent)));
}

#[test]
fn unsupported_aid_is_rejected_with_event() {
    let events = EventLog::default();
    let mut driver = driver_with(MemoryStore::with_mdl(), HceConfig::default(), events.clone());
    driver.on_activated();
    let response = driver.process_command(&[
        0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01, 0x00,
    ]);
    assert_eq!(status(&response), [0x6A, 0x82]);
    assert!(events.contains(|e| matches!(e, SessionEvent::NotSupported)));
}

#[test]
fn malformed_do53_is_wrong_parameters() {
    let events = EventLog::default();
    let mut driver = driver_with(MemoryStore::with_mdl(), HceConfig::default(), events.clone());
    driver.on_activated();
    let mut command = vec![0x00, 0xC3, 0x00, 0x00, 0x03];
    command.extend_from_slice(&[0x54, 0x01, 0xAA]);
    let response = driver.process_command(&command);
    assert_eq!(status(&response), [0x6A, 0x86]);
    assert!(events.contains(|e| matches!(e, SessionEvent::Error(_))));
}

#[test]
fn close_is_idempotent_with_zero_transports() {
    let mut driver = driver_with(
        MemoryStore::with_mdl(),
        HceConfig {
            ble_visibility_delay: std::time::Duration::ZERO,
            ..Default::default()
        },
        EventLog::default(),
    );
    driver.on_activated();
    assert_eq!(
        status(&driver.process_command(SELECT_NDEF_FILE)),
        [0x90, 0x00]
    );
    driver.close();
    driver.close();
    assert_eq!(driver.open_transport_count(), 0);
}

#[test]
fn reader_termination_tears_down_the_session() {
    let events = EventLog::default();
    let mut driver = driver_with(
        PortraitStore::new(32),
        HceConfig {
            max_response_apdu_length: 65536,
            ble_visibility_delay: std::time::Duration::ZERO,
            ..Default::default()
        },
        events.clone(),
    );

    driver.on_activated();
    driver.process_command(SELECT_NDEF_APP);
    driver.process_command(SELECT_NDEF_FILE);
    let handover_select = read_ndef_file(&mut driver);
    let device_engagement = engagement_from_handover_select(&handover_select);
    let handover = Handover::Nfc(ByteStr::from(handover_select), None);

    let request = common::device_request_bytes(MDL_DOC_TYPE, &[("given_name", false)]);
    let (mut reader, establishment) =
        SimulatedReader::establish(device_engagement, handover, &request);

    let response = send_enveloped(&mut driver, &establishment, 200);
    assert_eq!(status(&response), [0x90, 0x00]);
    let message = mdoc_holder::nfc::apdu::unwrap_do53(payload(&response)).unwrap();
    let session_data = reader.decrypt_response(message);
    assert!(session_data.data.is_some());

    // Termination message: the device answers cleanly and drops transports.
    let termination = cbor::to_vec(&SessionData {
        data: None,
        status: Some(SessionStatus::SessionTermination),
    })
    .unwrap();
    let response = send_enveloped(&mut driver, &termination, 200);
    assert_eq!(status(&response), [0x90, 0x00]);
    assert_eq!(driver.open_transport_count(), 0);
}

#[test]
fn absent_doc_type_signals_termination_status_not_decode_error() {
    let events = EventLog::default();
    let mut driver = driver_with(
        MemoryStore::with_mdl(),
        HceConfig {
            max_response_apdu_length: 65536,
            ble_visibility_delay: std::time::Duration::ZERO,
            ..Default::default()
        },
        events.clone(),
    );

    driver.on_activated();
    driver.process_command(SELECT_NDEF_APP);
    driver.process_command(SELECT_NDEF_FILE);
    let handover_select = read_ndef_file(&mut driver);
    let device_engagement = engagement_from_handover_select(&handover_select);
    let handover = Handover::Nfc(ByteStr::from(handover_select), None);

    let request =
        common::device_request_bytes("org.iso.18013.5.1.vehicle", &[("given_name", false)]);
    let (mut reader, establishment) =
        SimulatedReader::establish(device_engagement, handover, &request);

    let response = send_enveloped(&mut driver, &establishment, 200);
    assert_eq!(status(&response), [0x90, 0x00]);
    let message = mdoc_holder::nfc::apdu::unwrap_do53(payload(&response)).unwrap();
    let session_data = reader.decrypt_response(message);
    assert_eq!(session_data.status, Some(SessionStatus::SessionTermination));
    assert!(session_data.data.is_none());
}

#[test]
fn negotiated_handover_end_to_end() {
    let events = EventLog::default();
    let mut driver = driver_with(
        PortraitStore::new(32),
        HceConfig {
            negotiated_handover: true,
            max_response_apdu_length: 65536,
            ble_visibility_delay: std::time::Duration::ZERO,
        },
        events.clone(),
    );

    driver.on_activated();
    assert_eq!(status(&driver.process_command(SELECT_NDEF_APP)), [0x90, 0x00]);
    assert_eq!(
        status(&driver.process_command(SELECT_NDEF_FILE)),
        [0x90, 0x00]
    );

    // Initial content: TNEP service parameter.
    let service_parameter = read_ndef_file(&mut driver);
    let records = ndef::parse_records(&service_parameter).unwrap();
    assert_eq!(records[0].type_bytes, b"Tp");

    // Round 1: the reader writes Service Select in a single shot.
    let service_select = ndef::encode_message(&[ndef::OwnedNdefRecord {
        tnf: ndef::Tnf::WellKnown,
        type_bytes: b"Ts".to_vec(),
        id: None,
        payload: [
            &[ndef::NFC_NEGOTIATED_HANDOVER_SERVICE.len() as u8],
            ndef::NFC_NEGOTIATED_HANDOVER_SERVICE,
        ]
        .concat(),
    }]);
    let response = driver.process_command(&update_binary_single_shot(&service_select));
    assert_eq!(status(&response), [0x90, 0x00]);
    let tnep_status = read_ndef_file_after_write(&mut driver);
    let records = ndef::parse_records(&tnep_status).unwrap();
    assert_eq!(records[0].type_bytes, b"Te");

    // Round 2: the reader writes its Handover Request.
    let uuid = uuid::Uuid::from_bytes([0x44; 16]);
    let oob = ble_oob_for(uuid);
    let carrier = ndef::OwnedNdefRecord {
        tnf: ndef::Tnf::Media,
        type_bytes: b"application/vnd.bluetooth.le.oob".to_vec(),
        id: Some(b"0".to_vec()),
        payload: oob,
    };
    let embedded = ndef::encode_message(std::slice::from_ref(&carrier));
    let handover_request = ndef::encode_message(&[
        ndef::OwnedNdefRecord {
            tnf: ndef::Tnf::WellKnown,
            type_bytes: b"Hr".to_vec(),
            id: None,
            payload: [&[0x15u8], embedded.as_slice()].concat(),
        },
        carrier,
    ]);
    let response = driver.process_command(&update_binary_single_shot(&handover_request));
    assert_eq!(status(&response), [0x90, 0x00]);
    let handover_select = read_ndef_file_after_write(&mut driver);
    let records = ndef::parse_records(&handover_select).unwrap();
    assert_eq!(records[0].type_bytes, b"Hs");

    // Both halves feed the transcript; the exchange then proceeds as usual.
    let device_engagement = engagement_from_handover_select(&handover_select);
    let handover = Handover::Nfc(
        ByteStr::from(handover_select),
        Some(ByteStr::from(handover_request)),
    );

    let request = common::device_request_bytes(MDL_DOC_TYPE, &[("given_name", false)]);
    let (mut reader, establishment) =
        SimulatedReader::establish(device_engagement, handover, &request);
    let response = send_enveloped(&mut driver, &establishment, 200);
    assert_eq!(status(&response), [0x90, 0x00]);
    let message = mdoc_holder::nfc::apdu::unwrap_do53(payload(&response)).unwrap();
    let session_data = reader.decrypt_response(message);
    let plaintext = reader.decrypt_payload(session_data.data.as_ref().unwrap());
    let device_response: DeviceResponse = cbor::from_slice(&plaintext).unwrap();
    assert!(device_response.documents.is_some());
}

fn update_binary_single_shot(message: &[u8]) -> Vec<u8> {
    let mut command = vec![0x00, 0xD6, 0x00, 0x00];
    let mut data = (message.len() as u16).to_be_bytes().to_vec();
    data.extend_from_slice(message);
    command.push(data.len() as u8);
    command.extend_from_slice(&data);
    command
}

/// After an UPDATE BINARY the reply replaces the file; re-read it without
/// re-selecting (re-selecting would refresh the negotiated state).
fn read_ndef_file_after_write<S: DocumentStore>(
    driver: &mut HceDriver<S, SoftKeys, ()>,
) -> Vec<u8> {
    read_ndef_file(driver)
}

fn ble_oob_for(uuid: uuid::Uuid) -> Vec<u8> {
    let mut oob = vec![0x02, 0x1C, 0x01];
    let mut bytes = *uuid.as_bytes();
    bytes.reverse();
    oob.push(17);
    oob.push(0x07);
    oob.extend_from_slice(&bytes);
    oob
}

#[test]
fn multiple_request_cycles_share_one_session() {
    let mut driver = driver_with(
        PortraitStore::new(16),
        HceConfig {
            max_response_apdu_length: 65536,
            ble_visibility_delay: std::time::Duration::ZERO,
            ..Default::default()
        },
        EventLog::default(),
    );

    driver.on_activated();
    driver.process_command(SELECT_NDEF_APP);
    driver.process_command(SELECT_NDEF_FILE);
    let handover_select = read_ndef_file(&mut driver);
    let device_engagement = engagement_from_handover_select(&handover_select);
    let handover = Handover::Nfc(ByteStr::from(handover_select), None);

    let request = common::device_request_bytes(MDL_DOC_TYPE, &[("given_name", false)]);
    let (mut reader, establishment) =
        SimulatedReader::establish(device_engagement, handover, &request);

    let response = send_enveloped(&mut driver, &establishment, 200);
    let message = mdoc_holder::nfc::apdu::unwrap_do53(payload(&response)).unwrap();
    let session_data = reader.decrypt_response(message);
    reader.decrypt_payload(session_data.data.as_ref().unwrap());

    // Second request on the same session keys.
    let request = common::device_request_bytes(MDL_DOC_TYPE, &[("portrait", false)]);
    let followup = reader.encrypt_followup(&request);
    let response = send_enveloped(&mut driver, &followup, 200);
    assert_eq!(status(&response), [0x90, 0x00]);
    let message = mdoc_holder::nfc::apdu::unwrap_do53(payload(&response)).unwrap();
    let session_data = reader.decrypt_response(message);
    let plaintext = reader.decrypt_payload(session_data.data.as_ref().unwrap());
    let device_response: DeviceResponse = cbor::from_slice(&plaintext).unwrap();
    assert!(device_response.documents.is_some());
}
