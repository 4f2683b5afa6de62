//! Device-signed portion of a released document, binding the response to the
//! session transcript through the `DeviceAuthentication` structure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cose::MaybeTagged;
use crate::definitions::helpers::Tag24;
use crate::definitions::session::SessionTranscript;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSigned {
    #[serde(rename = "nameSpaces")]
    pub namespaces: DeviceNamespacesBytes,
    pub device_auth: DeviceAuth,
}

pub type DeviceNamespacesBytes = Tag24<DeviceNamespaces>;
pub type DeviceNamespaces = BTreeMap<String, BTreeMap<String, ciborium::Value>>;

/// Device authentication over the response. Only the signature form is
/// produced by this crate; the ECDH MAC alternative is not part of the
/// supported profile.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAuth {
    DeviceSignature(MaybeTagged<coset::CoseSign1>),
}

pub type DeviceAuthenticationBytes = Tag24<DeviceAuthentication>;

/// `["DeviceAuthentication", SessionTranscript, DocType, DeviceNameSpacesBytes]`
///
/// Never sent on the wire; reconstructed by both sides and signed detached.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeviceAuthentication(String, SessionTranscript, String, DeviceNamespacesBytes);

impl DeviceAuthentication {
    pub fn new(
        transcript: SessionTranscript,
        doc_type: String,
        namespaces_bytes: DeviceNamespacesBytes,
    ) -> Self {
        Self(
            "DeviceAuthentication".to_string(),
            transcript,
            doc_type,
            namespaces_bytes,
        )
    }
}
