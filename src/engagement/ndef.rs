//! Minimal NDEF support for the Type-4-Tag / Connection-Handover exchange:
//! record parsing, message building, the TNEP negotiated-handover records and
//! the Bluetooth LE OOB carrier payloads.

use strum::IntoEnumIterator;
use thiserror::Error;
use uuid::Uuid;

use crate::definitions::device_engagement::{BleOptions, CentralClientMode, PeripheralServerMode};

/// NDEF 3.2.6 type name formats.
#[derive(Debug, Clone, Copy, strum_macros::FromRepr, PartialEq, Eq)]
#[repr(u8)]
pub enum Tnf {
    Empty = 0x00,
    WellKnown = 0x01,
    Media = 0x02,
    AbsoluteUri = 0x03,
    External = 0x04,
    Unknown = 0x05,
    Unchanged = 0x06,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("NDEF record truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown or invalid TNF: {0:#x}")]
    InvalidTnf(u8),
    #[error("failed to find NDEF record '{0}'")]
    RecordNotFound(&'static str),
    #[error("unexpected service select payload")]
    UnexpectedServiceSelect,
    #[error("invalid handover request payload")]
    InvalidHandoverRequest,
    #[error("no usable alternative carrier in handover request")]
    NoUsableCarrier,
}

/// A parsed NDEF record borrowing from the message buffer.
#[derive(Debug, Clone)]
pub struct NdefRecord<'a> {
    pub tnf: Tnf,
    pub type_bytes: &'a [u8],
    pub id: Option<&'a [u8]>,
    pub payload: &'a [u8],
}

/// Parse every record of an NDEF message.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<NdefRecord>, Error> {
    let mut records = vec![];
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let header = bytes[cursor];
        let sr = header & 0x10 != 0;
        let il = header & 0x08 != 0;
        let tnf = Tnf::from_repr(header & 0x07).ok_or(Error::InvalidTnf(header & 0x07))?;
        cursor += 1;

        let type_len = *bytes.get(cursor).ok_or(Error::Truncated(cursor))? as usize;
        cursor += 1;

        let payload_len = if sr {
            let len = *bytes.get(cursor).ok_or(Error::Truncated(cursor))? as usize;
            cursor += 1;
            len
        } else {
            let end = cursor.checked_add(4).ok_or(Error::Truncated(cursor))?;
            let slice = bytes.get(cursor..end).ok_or(Error::Truncated(cursor))?;
            cursor = end;
            u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]) as usize
        };

        let id_len = if il {
            let len = *bytes.get(cursor).ok_or(Error::Truncated(cursor))? as usize;
            cursor += 1;
            len
        } else {
            0
        };

        let type_bytes = bytes
            .get(cursor..cursor + type_len)
            .ok_or(Error::Truncated(cursor))?;
        cursor += type_len;

        let id = if il {
            let id = bytes
                .get(cursor..cursor + id_len)
                .ok_or(Error::Truncated(cursor))?;
            cursor += id_len;
            Some(id)
        } else {
            None
        };

        let payload = bytes
            .get(cursor..cursor + payload_len)
            .ok_or(Error::Truncated(cursor))?;
        cursor += payload_len;

        records.push(NdefRecord {
            tnf,
            type_bytes,
            id,
            payload,
        });
    }
    Ok(records)
}

/// An owned record for message building.
#[derive(Debug, Clone)]
pub struct OwnedNdefRecord {
    pub tnf: Tnf,
    pub type_bytes: Vec<u8>,
    pub id: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl OwnedNdefRecord {
    fn encode(&self, first: bool, last: bool) -> Vec<u8> {
        let sr = self.payload.len() < 256;
        let mut header = self.tnf as u8;
        if first {
            header |= 0x80;
        }
        if last {
            header |= 0x40;
        }
        if sr {
            header |= 0x10;
        }
        if self.id.is_some() {
            header |= 0x08;
        }

        let mut out = vec![header, self.type_bytes.len() as u8];
        if sr {
            out.push(self.payload.len() as u8);
        } else {
            out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        }
        if let Some(id) = &self.id {
            out.push(id.len() as u8);
        }
        out.extend_from_slice(&self.type_bytes);
        if let Some(id) = &self.id {
            out.extend_from_slice(id);
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Encode records into one NDEF message, setting the begin/end flags.
pub fn encode_message(records: &[OwnedNdefRecord]) -> Vec<u8> {
    let last = records.len().saturating_sub(1);
    records
        .iter()
        .enumerate()
        .flat_map(|(i, record)| record.encode(i == 0, i == last))
        .collect()
}

/// Well-known record types used by the handover exchange.
#[derive(Debug, Clone, Copy, strum_macros::EnumIter)]
pub enum RecordType {
    /// From device: TNEP service parameter.
    TnepServiceParameter,
    /// From reader: TNEP service select.
    TnepServiceSelect,
    /// From device: TNEP status.
    TnepStatus,
    /// From reader.
    HandoverRequest,
    /// From device.
    HandoverSelect,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::TnepServiceParameter => "Tp",
            RecordType::TnepServiceSelect => "Ts",
            RecordType::TnepStatus => "Te",
            RecordType::HandoverRequest => "Hr",
            RecordType::HandoverSelect => "Hs",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        RecordType::iter().find(|record_type| record_type.as_bytes() == bytes)
    }
}

fn find_record<'a, 'b>(
    records: &'a [NdefRecord<'b>],
    record_type: RecordType,
) -> Result<&'a NdefRecord<'b>, Error> {
    records
        .iter()
        .find(|r| r.type_bytes == record_type.as_bytes())
        .ok_or(Error::RecordNotFound(record_type.as_str()))
}

/// Service URN for negotiated handover.
pub const NFC_NEGOTIATED_HANDOVER_SERVICE: &[u8] = b"urn:nfc:sn:handover";

/// Connection handover version 1.5.
const CONNECTION_HANDOVER_VERSION: u8 = 0x15;

/// External type carrying the device engagement inside Handover Select.
const DEVICE_ENGAGEMENT_TYPE: &[u8] = b"iso.org:18013:deviceengagement";
const DEVICE_ENGAGEMENT_ID: &[u8] = b"mdoc";

const BLE_OOB_MEDIA_TYPE: &[u8] = b"application/vnd.bluetooth.le.oob";
const BLE_CARRIER_ID: &[u8] = b"0";

/// Maximum NDEF payload servable through the Type-4-Tag file, leaving room
/// for the 2-byte length prefix.
pub const NFC_MAX_PAYLOAD_SIZE: usize = 255 - 2;
const NFC_MAX_PAYLOAD_SIZE_BYTES: [u8; 2] = (NFC_MAX_PAYLOAD_SIZE as u16).to_be_bytes();

/// The initial NDEF file content for negotiated handover: a single TNEP
/// service parameter record announcing the handover service.
///
/// See 18013-5 8.2.2.1 and TNEP 1.0 4.1.2.
pub fn service_parameter_message() -> Vec<u8> {
    let tp_payload = [
        &[
            0x10, // TNEP version 1.0
            NFC_NEGOTIATED_HANDOVER_SERVICE.len() as u8,
        ],
        NFC_NEGOTIATED_HANDOVER_SERVICE,
        &[
            0x00, // Communication mode: single response
            0x10, // Minimum wait time, TNEP 1.0 4.1.6
            0x0F, // Maximum number of wait time extensions
            NFC_MAX_PAYLOAD_SIZE_BYTES[0],
            NFC_MAX_PAYLOAD_SIZE_BYTES[1],
        ],
    ]
    .concat();
    encode_message(&[OwnedNdefRecord {
        tnf: Tnf::WellKnown,
        type_bytes: RecordType::TnepServiceParameter.as_bytes().to_vec(),
        id: None,
        payload: tp_payload,
    }])
}

/// Validate the reader's Service Select message and produce the TNEP status
/// reply.
pub fn tnep_status_message(ndef_from_reader: &[NdefRecord]) -> Result<Vec<u8>, Error> {
    let service_select = find_record(ndef_from_reader, RecordType::TnepServiceSelect)?;
    // Payload: service name length followed by the service URN.
    let expected = [
        &[NFC_NEGOTIATED_HANDOVER_SERVICE.len() as u8],
        NFC_NEGOTIATED_HANDOVER_SERVICE,
    ]
    .concat();
    if service_select.payload != expected {
        return Err(Error::UnexpectedServiceSelect);
    }
    Ok(encode_message(&[OwnedNdefRecord {
        tnf: Tnf::WellKnown,
        type_bytes: RecordType::TnepStatus.as_bytes().to_vec(),
        id: None,
        payload: vec![0x00], // Success
    }]))
}

/// A connection method offered by the reader, extracted from its Handover
/// Request alternative carriers.
#[derive(Debug, Clone)]
pub struct CarrierInfo {
    pub uuid: Uuid,
    pub psm: Option<u32>,
    pub mac_address: Option<[u8; 6]>,
}

impl CarrierInfo {
    /// The BLE options the device should connect with.
    pub fn to_ble_options(&self) -> BleOptions {
        BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode { uuid: self.uuid }),
        }
    }
}

/// Bluetooth LE advertising-data structure types used in OOB payloads.
mod ad_type {
    pub const COMPLETE_LIST_128_BIT_UUIDS: u8 = 0x07;
    pub const MAC_ADDRESS: u8 = 0x1B;
    pub const LE_ROLE: u8 = 0x1C;
    /// L2CAP PSM, from the mdoc BLE profile.
    pub const PSM: u8 = 0x77;
}

fn parse_ble_oob(oob: &[u8]) -> CarrierInfo {
    let mut info = CarrierInfo {
        uuid: Uuid::nil(),
        psm: None,
        mac_address: None,
    };
    let mut cursor = 0usize;
    while cursor < oob.len() {
        let len = oob[cursor] as usize;
        if len == 0 || cursor + 1 + len > oob.len() {
            break;
        }
        let kind = oob[cursor + 1];
        let data = &oob[cursor + 2..cursor + 1 + len];
        match kind {
            ad_type::COMPLETE_LIST_128_BIT_UUIDS => {
                if let Some(chunk) = data.chunks_exact(16).next() {
                    // OOB UUIDs are little-endian on the wire.
                    let mut bytes: [u8; 16] = chunk.try_into().unwrap();
                    bytes.reverse();
                    info.uuid = Uuid::from_bytes(bytes);
                }
            }
            ad_type::MAC_ADDRESS => {
                if data.len() >= 6 {
                    info.mac_address = data[..6].try_into().ok();
                }
            }
            ad_type::PSM => {
                if let Ok(bytes) = <[u8; 4]>::try_from(data) {
                    info.psm = Some(u32::from_le_bytes(bytes));
                }
            }
            ad_type::LE_ROLE => {
                tracing::debug!("LE role: {data:?}");
            }
            _ => {}
        }
        cursor += 1 + len;
    }
    info
}

fn ble_oob_payload(options: &BleOptions) -> Vec<u8> {
    let mut out = vec![];
    // LE role: peripheral preferred when the device runs the GATT server.
    let role = if options.peripheral_server_mode.is_some() {
        0x00
    } else {
        0x01
    };
    out.extend_from_slice(&[0x02, ad_type::LE_ROLE, role]);
    let uuid = match (&options.peripheral_server_mode, &options.central_client_mode) {
        (Some(PeripheralServerMode { uuid, .. }), _) => Some(uuid),
        (_, Some(CentralClientMode { uuid })) => Some(uuid),
        _ => None,
    };
    if let Some(uuid) = uuid {
        let mut bytes = *uuid.as_bytes();
        bytes.reverse();
        out.push(17);
        out.push(ad_type::COMPLETE_LIST_128_BIT_UUIDS);
        out.extend_from_slice(&bytes);
    }
    out
}

/// Parse the reader's Handover Request, disambiguate the offered carriers
/// and select the first usable BLE one.
pub fn parse_handover_request(ndef_from_reader: &[NdefRecord]) -> Result<CarrierInfo, Error> {
    let handover_request = find_record(ndef_from_reader, RecordType::HandoverRequest)?;
    let payload = handover_request.payload;
    if payload.len() < 2 {
        return Err(Error::InvalidHandoverRequest);
    }
    // Version byte, then an embedded NDEF message of ac + carrier records.
    let embedded = parse_records(&payload[1..]).map_err(|_| Error::InvalidHandoverRequest)?;

    let mut carriers: Vec<CarrierInfo> = embedded
        .iter()
        .filter(|record| record.tnf == Tnf::Media && record.type_bytes == BLE_OOB_MEDIA_TYPE)
        .map(|record| parse_ble_oob(record.payload))
        .filter(|carrier| !carrier.uuid.is_nil())
        .collect();

    if carriers.is_empty() {
        return Err(Error::NoUsableCarrier);
    }
    // Disambiguation: identical carriers collapse, first method wins.
    carriers.dedup_by_key(|carrier| carrier.uuid);
    Ok(carriers.remove(0))
}

/// Build the Handover Select message.
///
/// For static handover `device_engagement_bytes` carries the Tag24-wrapped
/// engagement and the carrier records describe the device's own connection
/// methods; for negotiated handover they echo the selected reader carrier.
pub fn handover_select_message(
    ble_options: &BleOptions,
    device_engagement_bytes: &[u8],
) -> Vec<u8> {
    // Alternative carrier: CPS active (1), one-byte reference to carrier "0".
    let ac_payload = vec![0x01, BLE_CARRIER_ID.len() as u8, BLE_CARRIER_ID[0], 0x00];
    let ac_record = OwnedNdefRecord {
        tnf: Tnf::WellKnown,
        type_bytes: b"ac".to_vec(),
        id: None,
        payload: ac_payload,
    };
    let embedded = encode_message(&[ac_record]);

    let hs_payload = [&[CONNECTION_HANDOVER_VERSION], embedded.as_slice()].concat();

    let records = vec![
        OwnedNdefRecord {
            tnf: Tnf::WellKnown,
            type_bytes: RecordType::HandoverSelect.as_bytes().to_vec(),
            id: None,
            payload: hs_payload,
        },
        OwnedNdefRecord {
            tnf: Tnf::Media,
            type_bytes: BLE_OOB_MEDIA_TYPE.to_vec(),
            id: Some(BLE_CARRIER_ID.to_vec()),
            payload: ble_oob_payload(ble_options),
        },
        OwnedNdefRecord {
            tnf: Tnf::External,
            type_bytes: DEVICE_ENGAGEMENT_TYPE.to_vec(),
            id: Some(DEVICE_ENGAGEMENT_ID.to_vec()),
            payload: device_engagement_bytes.to_vec(),
        },
    ];
    encode_message(&records)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let records = vec![
            OwnedNdefRecord {
                tnf: Tnf::WellKnown,
                type_bytes: b"Hs".to_vec(),
                id: None,
                payload: vec![0x15, 0xAA, 0xBB],
            },
            OwnedNdefRecord {
                tnf: Tnf::Media,
                type_bytes: BLE_OOB_MEDIA_TYPE.to_vec(),
                id: Some(b"0".to_vec()),
                payload: vec![0u8; 300],
            },
        ];
        let message = encode_message(&records);
        let parsed = parse_records(&message).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].tnf, Tnf::WellKnown);
        assert_eq!(parsed[0].type_bytes, b"Hs");
        assert_eq!(parsed[0].payload, &[0x15, 0xAA, 0xBB]);
        assert_eq!(parsed[1].id, Some(b"0".as_slice()));
        assert_eq!(parsed[1].payload.len(), 300);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let records = vec![OwnedNdefRecord {
            tnf: Tnf::WellKnown,
            type_bytes: b"Tp".to_vec(),
            id: None,
            payload: vec![1, 2, 3, 4],
        }];
        let mut message = encode_message(&records);
        message.truncate(message.len() - 1);
        assert!(parse_records(&message).is_err());
    }

    #[test]
    fn service_select_validation() {
        let ts_payload = [
            &[NFC_NEGOTIATED_HANDOVER_SERVICE.len() as u8],
            NFC_NEGOTIATED_HANDOVER_SERVICE,
        ]
        .concat();
        let message = encode_message(&[OwnedNdefRecord {
            tnf: Tnf::WellKnown,
            type_bytes: b"Ts".to_vec(),
            id: None,
            payload: ts_payload,
        }]);
        let records = parse_records(&message).unwrap();
        let status = tnep_status_message(&records).unwrap();
        let status_records = parse_records(&status).unwrap();
        assert_eq!(status_records[0].type_bytes, b"Te");
        assert_eq!(status_records[0].payload, &[0x00]);

        let bad = encode_message(&[OwnedNdefRecord {
            tnf: Tnf::WellKnown,
            type_bytes: b"Ts".to_vec(),
            id: None,
            payload: b"urn:nfc:sn:other".to_vec(),
        }]);
        let bad_records = parse_records(&bad).unwrap();
        assert!(tnep_status_message(&bad_records).is_err());
    }

    #[test]
    fn handover_request_carrier_selection() {
        let uuid = Uuid::from_bytes([9; 16]);
        let options = BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode { uuid }),
        };
        let oob = ble_oob_payload(&options);
        let carrier_record = OwnedNdefRecord {
            tnf: Tnf::Media,
            type_bytes: BLE_OOB_MEDIA_TYPE.to_vec(),
            id: Some(b"0".to_vec()),
            payload: oob,
        };
        let embedded = encode_message(&[carrier_record.clone()]);
        let hr_payload = [&[CONNECTION_HANDOVER_VERSION], embedded.as_slice()].concat();
        let message = encode_message(&[
            OwnedNdefRecord {
                tnf: Tnf::WellKnown,
                type_bytes: b"Hr".to_vec(),
                id: None,
                payload: hr_payload,
            },
            carrier_record,
        ]);

        let records = parse_records(&message).unwrap();
        let carrier = parse_handover_request(&records).unwrap();
        assert_eq!(carrier.uuid, uuid);
    }
}
