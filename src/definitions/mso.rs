//! Mobile security object: the issuer-authenticated digest manifest carried
//! in `issuerAuth`. Only read here, never produced; issuance is out of scope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime,
    PrimitiveDateTime,
};

use crate::cbor::Value as CborValue;
use crate::definitions::device_key::CoseKey;
use crate::definitions::helpers::ByteStr;
use crate::definitions::issuer_signed::DigestId;

pub type DigestIds = BTreeMap<DigestId, ByteStr>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mso {
    pub version: String,
    pub digest_algorithm: DigestAlgorithm,
    pub value_digests: BTreeMap<String, DigestIds>,
    pub device_key_info: DeviceKeyInfo,
    pub doc_type: String,
    pub validity_info: ValidityInfo,
}

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    SHA256,
    #[serde(rename = "SHA-384")]
    SHA384,
    #[serde(rename = "SHA-512")]
    SHA512,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyInfo {
    pub device_key: CoseKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_authorizations: Option<ciborium::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_info: Option<ciborium::Value>,
}

/// `signed`/`validFrom`/`validUntil` timestamps, carried as tdate
/// (tag 0, RFC 3339 text).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "CborValue", into = "CborValue")]
pub struct ValidityInfo {
    pub signed: OffsetDateTime,
    pub valid_from: OffsetDateTime,
    pub valid_until: OffsetDateTime,
    pub expected_update: Option<OffsetDateTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected a CBOR map for ValidityInfo, received: '{0:?}'")]
    NotAMap(CborValue),
    #[error("missing required field: '{0}'")]
    MissingField(&'static str),
    #[error("expected a tdate (tag 0 text), received: '{0:?}'")]
    NotATdate(ciborium::Value),
    #[error("unable to parse date: {0}")]
    DateParse(#[from] time::error::Parse),
}

fn tdate_to_value(date: &OffsetDateTime) -> ciborium::Value {
    let text = date
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"));
    ciborium::Value::Tag(0, Box::new(ciborium::Value::Text(text)))
}

fn value_to_tdate(value: ciborium::Value) -> Result<OffsetDateTime, Error> {
    let text = match value {
        ciborium::Value::Tag(0, inner) => match *inner {
            ciborium::Value::Text(text) => text,
            other => return Err(Error::NotATdate(other)),
        },
        ciborium::Value::Text(text) => text,
        other => return Err(Error::NotATdate(other)),
    };
    OffsetDateTime::parse(&text, &Rfc3339)
        .or_else(|_| {
            // Some issuers omit the offset; treat these as UTC.
            let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
            PrimitiveDateTime::parse(&text, format).map(PrimitiveDateTime::assume_utc)
        })
        .map_err(Error::from)
}

impl From<ValidityInfo> for CborValue {
    fn from(v: ValidityInfo) -> CborValue {
        let mut map = vec![
            (
                ciborium::Value::Text("signed".to_string()),
                tdate_to_value(&v.signed),
            ),
            (
                ciborium::Value::Text("validFrom".to_string()),
                tdate_to_value(&v.valid_from),
            ),
            (
                ciborium::Value::Text("validUntil".to_string()),
                tdate_to_value(&v.valid_until),
            ),
        ];
        if let Some(expected_update) = &v.expected_update {
            map.push((
                ciborium::Value::Text("expectedUpdate".to_string()),
                tdate_to_value(expected_update),
            ));
        }
        CborValue(ciborium::Value::Map(map))
    }
}

impl TryFrom<CborValue> for ValidityInfo {
    type Error = Error;

    fn try_from(v: CborValue) -> Result<Self, Error> {
        let ciborium::Value::Map(map) = v.0 else {
            return Err(Error::NotAMap(v));
        };
        let mut fields: BTreeMap<String, ciborium::Value> = map
            .into_iter()
            .filter_map(|(k, v)| k.into_text().ok().map(|k| (k, v)))
            .collect();
        let mut take = |name: &'static str| -> Result<OffsetDateTime, Error> {
            fields
                .remove(name)
                .ok_or(Error::MissingField(name))
                .and_then(value_to_tdate)
        };
        Ok(Self {
            signed: take("signed")?,
            valid_from: take("validFrom")?,
            valid_until: take("validUntil")?,
            expected_update: fields
                .remove("expectedUpdate")
                .map(value_to_tdate)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;
    use time::macros::datetime;

    #[test]
    fn validity_info_roundtrip() {
        let info = ValidityInfo {
            signed: datetime!(2023-06-01 10:00:00 UTC),
            valid_from: datetime!(2023-06-01 10:00:00 UTC),
            valid_until: datetime!(2028-06-01 10:00:00 UTC),
            expected_update: None,
        };
        let bytes = cbor::to_vec(&info).unwrap();
        let parsed: ValidityInfo = cbor::from_slice(&bytes).unwrap();
        assert_eq!(info, parsed);
    }
}
