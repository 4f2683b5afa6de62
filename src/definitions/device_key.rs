use std::collections::BTreeMap;

use coset::iana::Algorithm;
use p256::EncodedPoint;
use serde::{Deserialize, Serialize};

use crate::cbor::Value as CborValue;

/// An implementation of RFC-8152 [COSE_Key](https://datatracker.ietf.org/doc/html/rfc8152#section-13)
/// restricted to the requirements of ISO/IEC 18013-5:2021.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "CborValue", into = "CborValue")]
pub enum CoseKey {
    EC2 { crv: EC2Curve, x: Vec<u8>, y: EC2Y },
}

/// The sign bit or value of the y-coordinate for the EC point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EC2Y {
    Value(Vec<u8>),
    SignBit(bool),
}

/// The RFC-8152 identifier of the curve, for EC2 key type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EC2Curve {
    P256,
    P384,
    P521,
}

/// Errors that can occur when deserialising a COSE_Key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("COSE_Key of kty 'EC2' missing y coordinate")]
    EC2MissingY,
    #[error("Expected to parse a CBOR map, received: '{0:?}'")]
    NotAMap(CborValue),
    #[error("This implementation of COSE_Key only supports P-256, P-384 and P-521 elliptic curves")]
    UnsupportedCurve,
    #[error("This implementation of COSE_Key only supports EC2 keys")]
    UnsupportedKeyType,
    #[error("Could not reconstruct coordinates from the provided COSE_Key")]
    InvalidCoseKey,
}

impl CoseKey {
    pub fn signature_algorithm(&self) -> Option<Algorithm> {
        match self {
            CoseKey::EC2 {
                crv: EC2Curve::P256,
                ..
            } => Some(Algorithm::ES256),
            CoseKey::EC2 {
                crv: EC2Curve::P384,
                ..
            } => Some(Algorithm::ES384),
            CoseKey::EC2 {
                crv: EC2Curve::P521,
                ..
            } => Some(Algorithm::ES512),
        }
    }
}

impl From<CoseKey> for CborValue {
    fn from(key: CoseKey) -> CborValue {
        let mut map = BTreeMap::new();
        match key {
            CoseKey::EC2 { crv, x, y } => {
                // kty: 1, EC2: 2
                map.insert(
                    CborValue(ciborium::Value::Integer(1.into())),
                    CborValue(ciborium::Value::Integer(2.into())),
                );
                // crv: -1
                map.insert(
                    CborValue(ciborium::Value::Integer((-1).into())),
                    match crv {
                        EC2Curve::P256 => CborValue(ciborium::Value::Integer(1.into())),
                        EC2Curve::P384 => CborValue(ciborium::Value::Integer(2.into())),
                        EC2Curve::P521 => CborValue(ciborium::Value::Integer(3.into())),
                    },
                );
                // x: -2
                map.insert(
                    CborValue(ciborium::Value::Integer((-2).into())),
                    CborValue(ciborium::Value::Bytes(x)),
                );
                // y: -3
                map.insert(
                    CborValue(ciborium::Value::Integer((-3).into())),
                    match y {
                        EC2Y::Value(v) => CborValue(ciborium::Value::Bytes(v)),
                        EC2Y::SignBit(b) => CborValue(ciborium::Value::Bool(b)),
                    },
                );
            }
        }
        CborValue(ciborium::Value::Map(
            map.into_iter().map(|(k, v)| (k.0, v.0)).collect(),
        ))
    }
}

impl TryFrom<CborValue> for CoseKey {
    type Error = Error;

    fn try_from(v: CborValue) -> Result<Self, Error> {
        if let ciborium::Value::Map(entries) = v.0 {
            let mut map: BTreeMap<i128, ciborium::Value> = entries
                .into_iter()
                .filter_map(|(k, v)| k.as_integer().map(|k| (k.into(), v)))
                .collect();
            match (map.remove(&1), map.remove(&-1), map.remove(&-2)) {
                (
                    Some(ciborium::Value::Integer(kty)),
                    Some(ciborium::Value::Integer(crv_id)),
                    Some(ciborium::Value::Bytes(x)),
                ) if <ciborium::value::Integer as Into<i128>>::into(kty) == 2 => {
                    let crv = match crv_id.into() {
                        1i128 => EC2Curve::P256,
                        2i128 => EC2Curve::P384,
                        3i128 => EC2Curve::P521,
                        _ => return Err(Error::UnsupportedCurve),
                    };
                    let y = match map.remove(&-3).ok_or(Error::EC2MissingY)? {
                        ciborium::Value::Bytes(v) => EC2Y::Value(v),
                        ciborium::Value::Bool(b) => EC2Y::SignBit(b),
                        _ => return Err(Error::InvalidCoseKey),
                    };
                    Ok(Self::EC2 { crv, x, y })
                }
                _ => Err(Error::UnsupportedKeyType),
            }
        } else {
            Err(Error::NotAMap(v))
        }
    }
}

impl TryFrom<CoseKey> for EncodedPoint {
    type Error = Error;

    fn try_from(value: CoseKey) -> Result<EncodedPoint, Self::Error> {
        match value {
            CoseKey::EC2 {
                crv: EC2Curve::P256,
                x,
                y,
            } => {
                let x_generic_array = p256::FieldBytes::from_slice(x.as_ref());
                match y {
                    EC2Y::Value(y) => {
                        let y_generic_array = p256::FieldBytes::from_slice(y.as_ref());
                        Ok(EncodedPoint::from_affine_coordinates(
                            x_generic_array,
                            y_generic_array,
                            false,
                        ))
                    }
                    EC2Y::SignBit(y) => {
                        let mut bytes = x.clone();
                        if y {
                            bytes.insert(0, 3)
                        } else {
                            bytes.insert(0, 2)
                        }
                        EncodedPoint::from_bytes(bytes).map_err(|_| Error::InvalidCoseKey)
                    }
                }
            }
            _ => Err(Error::UnsupportedCurve),
        }
    }
}

impl From<p256::PublicKey> for CoseKey {
    fn from(pk: p256::PublicKey) -> CoseKey {
        use elliptic_curve::sec1::ToEncodedPoint;
        let encoded = pk.to_encoded_point(false);
        CoseKey::EC2 {
            crv: EC2Curve::P256,
            x: encoded.x().map(|x| x.to_vec()).unwrap_or_default(),
            y: EC2Y::Value(encoded.y().map(|y| y.to_vec()).unwrap_or_default()),
        }
    }
}
