//! The [DeviceEngagement] structure advertised to the reader, either inside a
//! `mdoc:` QR URI or embedded in the NFC handover NDEF exchange. It carries
//! the session's ephemeral public key and the connection methods the device
//! is willing to serve.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cbor::{self, CborError};
use crate::definitions::device_key::CoseKey;
use crate::definitions::helpers::{ByteStr, NonEmptyVec, Tag24};

pub type EDeviceKeyBytes = Tag24<CoseKey>;
pub type DeviceRetrievalMethods = NonEmptyVec<DeviceRetrievalMethod>;
pub type ProtocolInfo = ciborium::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "ciborium::Value", into = "ciborium::Value")]
pub struct DeviceEngagement {
    pub version: String,
    pub security: Security,
    pub device_retrieval_methods: Option<DeviceRetrievalMethods>,
    pub protocol_info: Option<ProtocolInfo>,
}

impl PartialEq for DeviceEngagement {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.security == other.security
            && self.device_retrieval_methods == other.device_retrieval_methods
            && self.protocol_info == other.protocol_info
    }
}

impl Eq for DeviceEngagement {}

/// Cipher suite identifier (always 1) and the device's ephemeral public key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Security(pub u64, pub EDeviceKeyBytes);

/// A transport descriptor the reader can use to reach the device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ciborium::Value", into = "ciborium::Value")]
pub enum DeviceRetrievalMethod {
    Ble(BleOptions),
    Nfc(NfcOptions),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ciborium::Value", into = "ciborium::Value")]
pub struct BleOptions {
    pub peripheral_server_mode: Option<PeripheralServerMode>,
    pub central_client_mode: Option<CentralClientMode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralServerMode {
    pub uuid: Uuid,
    pub ble_device_address: Option<ByteStr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CentralClientMode {
    pub uuid: Uuid,
}

/// Maximum command/response data field lengths for NFC retrieval, per the
/// limits in ISO 18013-5 8.3.3.1.2.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ciborium::Value", into = "ciborium::Value")]
pub struct NfcOptions {
    pub max_len_command_data_field: u16,
    pub max_len_response_data_field: u32,
}

impl Default for NfcOptions {
    fn default() -> Self {
        Self {
            max_len_command_data_field: 255,
            max_len_response_data_field: 256,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unimplemented or unsupported version")]
    UnsupportedVersion,
    #[error("unsupported device retrieval method")]
    UnsupportedDrm,
    #[error("malformed object")]
    Malformed,
    #[error("invalid ble options")]
    InvalidBleOptions,
    #[error("invalid nfc options")]
    InvalidNfcOptions,
    #[error("CBOR error")]
    CborError,
}

impl From<CborError> for Error {
    fn from(_: CborError) -> Self {
        Error::CborError
    }
}

impl From<crate::definitions::helpers::tag24::Error> for Error {
    fn from(_: crate::definitions::helpers::tag24::Error) -> Self {
        Error::Malformed
    }
}

impl From<DeviceEngagement> for ciborium::Value {
    fn from(device_engagement: DeviceEngagement) -> ciborium::Value {
        let mut map = vec![];
        map.push((
            ciborium::Value::Integer(0.into()),
            ciborium::Value::Text(device_engagement.version),
        ));
        map.push((
            ciborium::Value::Integer(1.into()),
            ciborium::Value::Array(vec![
                cbor::into_value(device_engagement.security.0).unwrap(),
                cbor::into_value(device_engagement.security.1).unwrap(),
            ]),
        ));
        if let Some(methods) = device_engagement.device_retrieval_methods {
            let methods = Vec::from(methods)
                .into_iter()
                .map(cbor::into_value)
                .collect::<Result<Vec<ciborium::Value>, CborError>>()
                .unwrap();
            map.push((
                ciborium::Value::Integer(2.into()),
                ciborium::Value::Array(methods),
            ));
        }
        // protocol_info is RFU and intentionally not emitted.

        ciborium::Value::Map(map)
    }
}

impl TryFrom<ciborium::Value> for DeviceEngagement {
    type Error = Error;

    fn try_from(v: ciborium::Value) -> Result<Self, Error> {
        let ciborium::Value::Map(map) = v else {
            return Err(Error::Malformed);
        };
        let mut map: BTreeMap<i128, ciborium::Value> = map
            .into_iter()
            .map(|(k, v)| Ok((k.into_integer().map_err(|_| Error::CborError)?.into(), v)))
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        match map.remove(&0) {
            Some(ciborium::Value::Text(v)) if v == "1.0" => {}
            Some(ciborium::Value::Text(_)) => return Err(Error::UnsupportedVersion),
            _ => return Err(Error::Malformed),
        }

        let security = map.remove(&1).ok_or(Error::Malformed)?;
        let security: Security = cbor::from_value(security).map_err(|_| Error::Malformed)?;

        let device_retrieval_methods = map
            .remove(&2)
            .map(cbor::from_value)
            .transpose()
            .map_err(|_| Error::Malformed)?;

        let protocol_info = map.remove(&4);
        if protocol_info.is_some() {
            tracing::warn!("protocol_info is RFU and has been ignored in deserialization");
        }

        Ok(DeviceEngagement {
            version: "1.0".into(),
            security,
            device_retrieval_methods,
            protocol_info,
        })
    }
}

impl Tag24<DeviceEngagement> {
    const BASE64_CONFIG: base64::Config = base64::Config::new(base64::CharacterSet::UrlSafe, false);

    pub fn to_qr_code_uri(&self) -> String {
        let mut qr_code_uri = String::from("mdoc:");
        base64::encode_config_buf(&self.inner_bytes, Self::BASE64_CONFIG, &mut qr_code_uri);
        qr_code_uri
    }

    pub fn from_qr_code_uri(qr_code_uri: &str) -> anyhow::Result<Self> {
        let encoded_de = qr_code_uri
            .strip_prefix("mdoc:")
            .ok_or_else(|| anyhow::anyhow!("qr code has invalid prefix"))?;
        let decoded_de = base64::decode_config(encoded_de, Self::BASE64_CONFIG)?;
        Tag24::<DeviceEngagement>::from_bytes(decoded_de).map_err(Into::into)
    }
}

impl DeviceRetrievalMethod {
    pub fn version(&self) -> u64 {
        1
    }

    pub fn transport_type(&self) -> u64 {
        match self {
            Self::Nfc(_) => 1,
            Self::Ble(_) => 2,
        }
    }

    /// Collapse duplicate methods, merging BLE modes advertised separately
    /// into one entry, so the engagement does not advertise the same
    /// transport twice.
    pub fn disambiguate(methods: Vec<DeviceRetrievalMethod>) -> Vec<DeviceRetrievalMethod> {
        let mut ble: Option<BleOptions> = None;
        let mut nfc: Option<NfcOptions> = None;
        for method in methods {
            match method {
                DeviceRetrievalMethod::Ble(options) => match &mut ble {
                    Some(merged) => {
                        if merged.peripheral_server_mode.is_none() {
                            merged.peripheral_server_mode = options.peripheral_server_mode;
                        }
                        if merged.central_client_mode.is_none() {
                            merged.central_client_mode = options.central_client_mode;
                        }
                    }
                    None => ble = Some(options),
                },
                DeviceRetrievalMethod::Nfc(options) => {
                    if nfc.is_none() {
                        nfc = Some(options);
                    }
                }
            }
        }
        ble.map(DeviceRetrievalMethod::Ble)
            .into_iter()
            .chain(nfc.map(DeviceRetrievalMethod::Nfc))
            .collect()
    }
}

impl TryFrom<ciborium::Value> for DeviceRetrievalMethod {
    type Error = Error;

    fn try_from(value: ciborium::Value) -> Result<Self, Self::Error> {
        let ciborium::Value::Array(list) = value else {
            return Err(Error::Malformed);
        };
        match list.as_slice() {
            [ciborium::Value::Integer(t), ciborium::Value::Integer(v), methods]
                if <ciborium::value::Integer as Into<i128>>::into(*t) == 1
                    && <ciborium::value::Integer as Into<i128>>::into(*v) == 1 =>
            {
                let nfc_options = NfcOptions::try_from(methods.clone())?;
                Ok(DeviceRetrievalMethod::Nfc(nfc_options))
            }
            [ciborium::Value::Integer(t), ciborium::Value::Integer(v), methods]
                if <ciborium::value::Integer as Into<i128>>::into(*t) == 2
                    && <ciborium::value::Integer as Into<i128>>::into(*v) == 1 =>
            {
                let ble_options = BleOptions::try_from(methods.clone())?;
                Ok(DeviceRetrievalMethod::Ble(ble_options))
            }
            [ciborium::Value::Integer(_), _, _] => Err(Error::UnsupportedDrm),
            _ => Err(Error::Malformed),
        }
    }
}

impl From<DeviceRetrievalMethod> for ciborium::Value {
    fn from(drm: DeviceRetrievalMethod) -> Self {
        let transport_type = drm.transport_type().into();
        let version = drm.version().into();
        let retrieval_method = match drm {
            DeviceRetrievalMethod::Nfc(opts) => cbor::into_value(opts).unwrap(),
            DeviceRetrievalMethod::Ble(opts) => cbor::into_value(opts).unwrap(),
        };
        ciborium::Value::Array(vec![
            ciborium::Value::Integer(transport_type),
            ciborium::Value::Integer(version),
            retrieval_method,
        ])
    }
}

impl TryFrom<ciborium::Value> for BleOptions {
    type Error = Error;

    fn try_from(v: ciborium::Value) -> Result<Self, Error> {
        let ciborium::Value::Map(map) = v else {
            return Err(Error::InvalidBleOptions);
        };
        let mut map: BTreeMap<i128, ciborium::Value> = map
            .into_iter()
            .map(|(k, v)| {
                let k = k.into_integer().map_err(|_| Error::CborError)?.into();
                Ok((k, v))
            })
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        let central_client_mode = match (map.remove(&1), map.remove(&11)) {
            (Some(ciborium::Value::Bool(true)), Some(ciborium::Value::Bytes(uuid))) => {
                let uuid_bytes: [u8; 16] =
                    uuid.try_into().map_err(|_| Error::InvalidBleOptions)?;
                Some(CentralClientMode {
                    uuid: Uuid::from_bytes(uuid_bytes),
                })
            }
            (Some(ciborium::Value::Bool(false)), _) => None,
            _ => return Err(Error::InvalidBleOptions),
        };

        let peripheral_server_mode = match (map.remove(&0), map.remove(&10)) {
            (Some(ciborium::Value::Bool(true)), Some(ciborium::Value::Bytes(uuid))) => {
                let uuid_bytes: [u8; 16] =
                    uuid.try_into().map_err(|_| Error::InvalidBleOptions)?;
                let ble_device_address = match map.remove(&20) {
                    Some(value) => Some(
                        crate::cbor::Value(value)
                            .try_into()
                            .map_err(|_| Error::InvalidBleOptions)?,
                    ),
                    None => None,
                };
                Some(PeripheralServerMode {
                    uuid: Uuid::from_bytes(uuid_bytes),
                    ble_device_address,
                })
            }
            (Some(ciborium::Value::Bool(false)), _) => None,
            _ => return Err(Error::InvalidBleOptions),
        };

        Ok(BleOptions {
            central_client_mode,
            peripheral_server_mode,
        })
    }
}

impl From<BleOptions> for ciborium::Value {
    fn from(o: BleOptions) -> ciborium::Value {
        let mut map = vec![];

        match o.central_client_mode {
            Some(CentralClientMode { uuid }) => {
                map.push((
                    ciborium::Value::Integer(1.into()),
                    ciborium::Value::Bool(true),
                ));
                map.push((
                    ciborium::Value::Integer(11.into()),
                    ciborium::Value::Bytes(uuid.as_bytes().to_vec()),
                ));
            }
            None => {
                map.push((
                    ciborium::Value::Integer(1.into()),
                    ciborium::Value::Bool(false),
                ));
            }
        }

        match o.peripheral_server_mode {
            Some(PeripheralServerMode {
                uuid,
                ble_device_address,
            }) => {
                map.push((
                    ciborium::Value::Integer(0.into()),
                    ciborium::Value::Bool(true),
                ));
                map.push((
                    ciborium::Value::Integer(10.into()),
                    ciborium::Value::Bytes(uuid.as_bytes().to_vec()),
                ));
                if let Some(address) = ble_device_address {
                    map.push((
                        ciborium::Value::Integer(20.into()),
                        ciborium::Value::Bytes(address.into()),
                    ));
                }
            }
            None => {
                map.push((
                    ciborium::Value::Integer(0.into()),
                    ciborium::Value::Bool(false),
                ));
            }
        }

        ciborium::Value::Map(map)
    }
}

impl TryFrom<ciborium::Value> for NfcOptions {
    type Error = Error;

    fn try_from(v: ciborium::Value) -> Result<Self, Error> {
        let ciborium::Value::Map(map) = v else {
            return Err(Error::InvalidNfcOptions);
        };
        let map: BTreeMap<i128, ciborium::Value> = map
            .into_iter()
            .map(|(k, v)| {
                let k = k.into_integer().map_err(|_| Error::CborError)?.into();
                Ok((k, v))
            })
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        let command = map
            .get(&0)
            .and_then(|v| v.as_integer())
            .and_then(|i| u16::try_from(i).ok())
            .ok_or(Error::InvalidNfcOptions)?;
        let response = map
            .get(&1)
            .and_then(|v| v.as_integer())
            .and_then(|i| u32::try_from(i).ok())
            .ok_or(Error::InvalidNfcOptions)?;
        if command < 255 || response < 256 {
            return Err(Error::InvalidNfcOptions);
        }
        Ok(NfcOptions {
            max_len_command_data_field: command,
            max_len_response_data_field: response,
        })
    }
}

impl From<NfcOptions> for ciborium::Value {
    fn from(o: NfcOptions) -> ciborium::Value {
        ciborium::Value::Map(vec![
            (
                ciborium::Value::Integer(0.into()),
                ciborium::Value::Integer(o.max_len_command_data_field.into()),
            ),
            (
                ciborium::Value::Integer(1.into()),
                ciborium::Value::Integer(o.max_len_response_data_field.into()),
            ),
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::session::create_p256_ephemeral_keys;

    fn test_engagement(methods: Option<DeviceRetrievalMethods>) -> DeviceEngagement {
        let key_pair = create_p256_ephemeral_keys().unwrap();
        let public_key = Tag24::new(key_pair.1).unwrap();
        DeviceEngagement {
            version: "1.0".into(),
            security: Security(1, public_key),
            device_retrieval_methods: methods,
            protocol_info: None,
        }
    }

    #[test]
    fn device_engagement_cbor_roundtrip() {
        let uuid = Uuid::from_bytes([1; 16]);
        let ble_option = BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode { uuid }),
        };
        let device_engagement = test_engagement(Some(NonEmptyVec::new(
            DeviceRetrievalMethod::Ble(ble_option),
        )));

        let bytes = crate::cbor::to_vec(&device_engagement).unwrap();
        let roundtripped = crate::cbor::from_slice(&bytes).unwrap();
        assert_eq!(device_engagement, roundtripped)
    }

    #[test]
    fn device_engagement_qr_code_roundtrip() {
        const EXAMPLE_QR_CODE: &str = "mdoc:owBjMS4wAYIB2BhYS6QBAiABIVgglyWXuAyJ6iRNc8OlYXenvkJt23rJPdtIhlawXqr-yf0iWCC1GQSH8tIwTYVwha_ZoPL20_saYXrGIbrCm133H0ki-QKBgwIBowD1AfQKUH2RiuAEbUVzrsrOiUnSPDw";
        let de = Tag24::<DeviceEngagement>::from_qr_code_uri(EXAMPLE_QR_CODE).unwrap();
        let roundtripped = de.to_qr_code_uri();
        assert_eq!(EXAMPLE_QR_CODE, roundtripped);
    }

    #[test]
    fn disambiguate_merges_ble_modes() {
        let uuid = Uuid::from_bytes([2; 16]);
        let methods = vec![
            DeviceRetrievalMethod::Ble(BleOptions {
                peripheral_server_mode: Some(PeripheralServerMode {
                    uuid,
                    ble_device_address: None,
                }),
                central_client_mode: None,
            }),
            DeviceRetrievalMethod::Ble(BleOptions {
                peripheral_server_mode: None,
                central_client_mode: Some(CentralClientMode { uuid }),
            }),
            DeviceRetrievalMethod::Nfc(NfcOptions::default()),
        ];
        let merged = DeviceRetrievalMethod::disambiguate(methods);
        assert_eq!(merged.len(), 2);
        let DeviceRetrievalMethod::Ble(options) = &merged[0] else {
            panic!("expected merged BLE options first");
        };
        assert!(options.peripheral_server_mode.is_some());
        assert!(options.central_client_mode.is_some());
    }

    #[test]
    fn unknown_retrieval_method_is_rejected() {
        let wifi = ciborium::Value::Array(vec![
            ciborium::Value::Integer(3.into()),
            ciborium::Value::Integer(1.into()),
            ciborium::Value::Map(vec![]),
        ]);
        assert!(matches!(
            DeviceRetrievalMethod::try_from(wifi),
            Err(Error::UnsupportedDrm)
        ));
    }
}
