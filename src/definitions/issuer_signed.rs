//! Issuer-signed portion of an mdoc: the name-space items released to a
//! reader together with the issuer authentication (`issuerAuth` COSE_Sign1
//! over the mobile security object).

use serde::{Deserialize, Serialize};

use crate::cose::MaybeTagged;
use crate::definitions::helpers::{ByteStr, NonEmptyMap, NonEmptyVec, Tag24};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSigned {
    #[serde(skip_serializing_if = "Option::is_none", rename = "nameSpaces")]
    pub namespaces: Option<IssuerNamespaces>,
    pub issuer_auth: MaybeTagged<coset::CoseSign1>,
}

pub type IssuerNamespaces = NonEmptyMap<String, NonEmptyVec<IssuerSignedItemBytes>>;
pub type IssuerSignedItemBytes = Tag24<IssuerSignedItem>;

pub type DigestId = u64;

/// A single data element as signed by the issuer. The item is always carried
/// inside its original Tag24 byte image so the issuer's digests stay valid.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSignedItem {
    #[serde(rename = "digestID")]
    pub digest_id: DigestId,
    pub random: ByteStr,
    pub element_identifier: String,
    pub element_value: ciborium::Value,
}
