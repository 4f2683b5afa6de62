//! Request translation and response assembly for the holder.
//!
//! Decrypted `DeviceRequest` CBOR is flattened into one [DisclosureRequest]
//! per requested docType, with reader authentication classified per
//! doc-request. On consent, the stored issuer-signed items are filtered down
//! to the permitted elements and the response is signed document by document
//! through the external key capability.

use std::collections::BTreeMap;

use coset::iana;
use der::Encode;
use serde::Serialize;

use crate::cbor;
use crate::cose::{self, MaybeTagged, PreparedCoseSign1, VerificationKey};
use crate::definitions::device_request::{DeviceRequest, DocRequest, ReaderAuthentication};
use crate::definitions::device_response::{
    DeviceResponse, Document, DocumentError, DocumentErrorCode, Errors, Status as ResponseStatus,
};
use crate::definitions::device_signed::{
    DeviceAuth, DeviceAuthentication, DeviceNamespaces, DeviceSigned,
};
use crate::definitions::helpers::{NonEmptyMap, NonEmptyVec, Tag24};
use crate::definitions::issuer_signed::{IssuerSigned, IssuerSignedItemBytes};
use crate::definitions::mso::Mso;
use crate::definitions::session::SessionTranscript;
use crate::definitions::x509::crl::CrlFetcher;
use crate::definitions::x509::validation::{
    reader_auth_outcome, ReaderAuthOutcome, ValidationOptions,
};
use crate::definitions::x509::x5chain::X5CHAIN_COSE_HEADER_LABEL;
use crate::definitions::x509::{TrustAnchorRegistry, X5Chain};
use crate::keys::{KeyCapability, SignOutcome};
use crate::storage::{DocumentStore, StoreError};

pub type DocType = String;
pub type Namespace = String;
pub type ElementIdentifier = String;

/// The elements the holder has approved for release, grouped by document
/// type and namespace.
pub type PermittedItems = BTreeMap<DocType, BTreeMap<Namespace, Vec<ElementIdentifier>>>;

/// Per-element flags flattened out of the reader's `ItemsRequest`. Elements
/// the reader did not name are simply absent, i.e. not requested.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementRequest {
    pub requested: bool,
    pub intent_to_retain: bool,
}

/// One docType's worth of request, with its reader-auth classification.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisclosureRequest {
    pub doc_type: DocType,
    #[serde(rename = "nameSpaces")]
    pub namespaces: BTreeMap<Namespace, BTreeMap<ElementIdentifier, ElementRequest>>,
    pub reader_auth: ReaderAuthOutcome,
}

/// Everything parsed out of one decrypted `DeviceRequest`.
#[derive(Clone, Debug)]
pub struct ParsedRequest {
    pub requests: Vec<DisclosureRequest>,
    /// True only if every sub-request carried a reader signature that
    /// validated, chain included.
    pub is_authenticated: bool,
}

impl ParsedRequest {
    /// JSON summary keyed by docType, shown to the holder before any data
    /// leaves the device.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "isAuthenticated".to_string(),
            serde_json::Value::Bool(self.is_authenticated),
        );
        for request in &self.requests {
            map.insert(
                request.doc_type.clone(),
                serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("unable to decode DeviceRequest bytes as cbor: {0}")]
    Decode(cbor::CborError),
    #[error("unsupported DeviceRequest version: {0} ({supported} is supported)", supported = DeviceRequest::VERSION)]
    UnsupportedVersion(String),
}

impl RequestError {
    /// The response status the reader sees for this failure.
    pub fn response_status(&self) -> ResponseStatus {
        match self {
            RequestError::Decode(_) => ResponseStatus::CborDecodingError,
            RequestError::UnsupportedVersion(_) => ResponseStatus::GeneralError,
        }
    }
}

/// Parse a decrypted `DeviceRequest` and classify reader authentication per
/// doc-request.
pub fn parse_device_request<C: CrlFetcher>(
    request_bytes: &[u8],
    session_transcript: &SessionTranscript,
    trust_anchors: &TrustAnchorRegistry,
    crl_fetcher: &C,
    options: &ValidationOptions,
) -> Result<ParsedRequest, RequestError> {
    let device_request: DeviceRequest =
        cbor::from_slice(request_bytes).map_err(RequestError::Decode)?;

    if device_request.version != DeviceRequest::VERSION {
        return Err(RequestError::UnsupportedVersion(device_request.version));
    }

    let mut requests = vec![];
    for doc_request in device_request.doc_requests.into_inner() {
        requests.push(flatten_doc_request(
            doc_request,
            session_transcript,
            trust_anchors,
            crl_fetcher,
            options,
        ));
    }

    let is_authenticated = requests
        .iter()
        .all(|request| request.reader_auth.is_success());

    Ok(ParsedRequest {
        requests,
        is_authenticated,
    })
}

fn flatten_doc_request<C: CrlFetcher>(
    doc_request: DocRequest,
    session_transcript: &SessionTranscript,
    trust_anchors: &TrustAnchorRegistry,
    crl_fetcher: &C,
    options: &ValidationOptions,
) -> DisclosureRequest {
    let items_request = doc_request.items_request;

    let mut namespaces: BTreeMap<Namespace, BTreeMap<ElementIdentifier, ElementRequest>> =
        BTreeMap::new();
    for (namespace, elements) in items_request.as_ref().namespaces.iter() {
        let flattened = elements
            .iter()
            .map(|(element, intent_to_retain)| {
                (
                    element.clone(),
                    ElementRequest {
                        requested: true,
                        intent_to_retain: *intent_to_retain,
                    },
                )
            })
            .collect();
        namespaces.insert(namespace.clone(), flattened);
    }

    let reader_auth = classify_reader_auth(
        doc_request.reader_auth.as_ref(),
        &items_request,
        session_transcript,
        trust_anchors,
        crl_fetcher,
        options,
    );

    DisclosureRequest {
        doc_type: items_request.as_ref().doc_type.clone(),
        namespaces,
        reader_auth,
    }
}

fn classify_reader_auth<C: CrlFetcher>(
    reader_auth: Option<&MaybeTagged<coset::CoseSign1>>,
    items_request: &Tag24<crate::definitions::device_request::ItemsRequest>,
    session_transcript: &SessionTranscript,
    trust_anchors: &TrustAnchorRegistry,
    crl_fetcher: &C,
    options: &ValidationOptions,
) -> ReaderAuthOutcome {
    let Some(reader_auth) = reader_auth else {
        return ReaderAuthOutcome {
            errors: vec!["reader authentication not present".to_string()],
            ..Default::default()
        };
    };

    let x5chain = reader_auth
        .inner
        .unprotected
        .rest
        .iter()
        .find(|(label, _)| *label == coset::Label::Int(X5CHAIN_COSE_HEADER_LABEL))
        .map(|(_, value)| value.clone())
        .map(X5Chain::from_cbor);

    let x5chain = match x5chain {
        Some(Ok(x5chain)) => Some(x5chain),
        Some(Err(e)) => {
            return ReaderAuthOutcome {
                errors: vec![format!("unable to parse reader x5chain: {e}")],
                ..Default::default()
            }
        }
        None => None,
    };

    let signature_valid = match (&x5chain, reader_authentication_payload(
        session_transcript,
        items_request,
    )) {
        (Some(x5chain), Ok(payload)) => {
            let key = x5chain
                .end_entity_certificate()
                .tbs_certificate
                .subject_public_key_info
                .to_der()
                .map(VerificationKey::Der);
            match key {
                Ok(key) => cose::sign1::verify(&reader_auth.inner, &key, Some(&payload)),
                Err(e) => {
                    tracing::error!("unable to encode reader public key: {e}");
                    false
                }
            }
        }
        _ => false,
    };

    reader_auth_outcome(x5chain, signature_valid, trust_anchors, crl_fetcher, options)
}

/// The detached payload covered by the reader's signature:
/// `ReaderAuthenticationBytes = #6.24(["ReaderAuthentication", transcript, itemsRequestBytes])`.
fn reader_authentication_payload(
    session_transcript: &SessionTranscript,
    items_request: &Tag24<crate::definitions::device_request::ItemsRequest>,
) -> Result<Vec<u8>, cbor::CborError> {
    let reader_authentication =
        ReaderAuthentication::new(session_transcript.clone(), items_request.clone());
    let tagged = Tag24::new(reader_authentication)
        .map_err(|_| cbor::CborError::EncodeFailed)?;
    cbor::to_vec(&tagged)
}

/// The assembled-but-unsigned response: a re-tryable crypto handle. Signing
/// may park on `UserAuthRequired` when a key is locked; calling
/// [PreparedDeviceResponse::sign] again after the user authenticates resumes
/// exactly where it stopped.
#[derive(Debug)]
pub struct PreparedDeviceResponse {
    prepared_documents: Vec<PreparedDocument>,
    signed_documents: Vec<Document>,
    document_errors: Vec<DocumentError>,
    status: ResponseStatus,
}

#[derive(Debug)]
struct PreparedDocument {
    doc_type: DocType,
    key_alias: String,
    algorithm: iana::Algorithm,
    issuer_signed: IssuerSigned,
    device_namespaces: Tag24<DeviceNamespaces>,
    prepared_cose_sign1: PreparedCoseSign1,
    errors: Option<Errors>,
}

/// Outcome of assembling and signing a response.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// Plaintext `DeviceResponse` CBOR, ready for session encryption.
    Ready(Vec<u8>),
    /// A signing key is locked behind user presence; retry with the carried
    /// handle once the user has authenticated.
    UserAuthRequired(PreparedDeviceResponse),
    /// None of the requested document types exist in the store. Maps to the
    /// dedicated session-termination status so the reader can tell this
    /// apart from a decode failure.
    NoDocumentFound,
}

#[derive(Debug, thiserror::Error)]
pub enum RespondError {
    #[error("stored document is malformed: {0}")]
    MalformedDocument(cbor::CborError),
    #[error("unable to encode response structure: {0}")]
    Encode(cbor::CborError),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("storage failure: {0}")]
    Storage(StoreError),
}

/// Build the response for the permitted items and sign it.
///
/// `permitted` is the consent decision: only elements both requested and
/// permitted are released.
pub fn build_response<S: DocumentStore, K: KeyCapability + ?Sized>(
    store: &S,
    keys: &K,
    session_transcript: &SessionTranscript,
    parsed: &ParsedRequest,
    permitted: PermittedItems,
) -> Result<ResponseOutcome, RespondError> {
    let prepared = match prepare_response(store, session_transcript, parsed, permitted)? {
        Some(prepared) => prepared,
        None => return Ok(ResponseOutcome::NoDocumentFound),
    };
    prepared.sign(keys)
}

fn prepare_response<S: DocumentStore>(
    store: &S,
    session_transcript: &SessionTranscript,
    parsed: &ParsedRequest,
    permitted: PermittedItems,
) -> Result<Option<PreparedDeviceResponse>, RespondError> {
    let mut prepared_documents = vec![];
    let mut document_errors: Vec<DocumentError> = vec![];
    let mut any_document_found = false;

    for request in &parsed.requests {
        let doc_type = &request.doc_type;
        let issuer_signed_bytes = match store.issuer_signed_bytes(doc_type) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                document_errors.push(
                    [(doc_type.clone(), DocumentErrorCode::DataNotReturned)]
                        .into_iter()
                        .collect(),
                );
                continue;
            }
            Err(e) => return Err(RespondError::Storage(e)),
        };
        any_document_found = true;

        let permitted_for_doc = permitted.get(doc_type).cloned().unwrap_or_default();
        let prepared = prepare_document(
            store,
            session_transcript,
            request,
            &issuer_signed_bytes,
            permitted_for_doc,
        )?;
        prepared_documents.push(prepared);
    }

    if !any_document_found {
        return Ok(None);
    }

    Ok(Some(PreparedDeviceResponse {
        prepared_documents,
        signed_documents: vec![],
        document_errors,
        status: ResponseStatus::OK,
    }))
}

fn prepare_document<S: DocumentStore>(
    store: &S,
    session_transcript: &SessionTranscript,
    request: &DisclosureRequest,
    issuer_signed_bytes: &[u8],
    permitted: BTreeMap<Namespace, Vec<ElementIdentifier>>,
) -> Result<PreparedDocument, RespondError> {
    let doc_type = request.doc_type.clone();
    let issuer_signed: IssuerSigned =
        cbor::from_slice(issuer_signed_bytes).map_err(RespondError::MalformedDocument)?;

    // The device key's algorithm rides in the MSO; default to ES256 if the
    // issuerAuth payload is absent or unreadable.
    let algorithm = issuer_signed
        .issuer_auth
        .inner
        .payload
        .as_deref()
        .and_then(|payload| cbor::from_slice::<Tag24<Mso>>(payload).ok())
        .and_then(|mso| mso.as_ref().device_key_info.device_key.signature_algorithm())
        .unwrap_or(iana::Algorithm::ES256);

    let key_alias = store
        .key_alias(&doc_type)
        .map_err(RespondError::Storage)?;

    let stored_namespaces = issuer_signed.namespaces.clone();
    let mut released: BTreeMap<String, Vec<IssuerSignedItemBytes>> = BTreeMap::new();
    let mut errors: BTreeMap<String, NonEmptyMap<String, DocumentErrorCode>> = BTreeMap::new();

    for (namespace, elements) in request.namespaces.iter() {
        let permitted_elements = permitted.get(namespace);
        for (element, flags) in elements {
            if !flags.requested {
                continue;
            }
            if !permitted_elements.is_some_and(|p| p.contains(element)) {
                // Requested but not approved by the holder: silently absent.
                continue;
            }
            let stored_item = stored_namespaces
                .as_ref()
                .and_then(|namespaces| namespaces.get(namespace))
                .and_then(|items| {
                    items
                        .iter()
                        .find(|item| item.as_ref().element_identifier == *element)
                });
            match stored_item {
                Some(item) => released
                    .entry(namespace.clone())
                    .or_default()
                    .push(item.clone()),
                None => {
                    if let Some(namespace_errors) = errors.get_mut(namespace) {
                        namespace_errors
                            .insert(element.clone(), DocumentErrorCode::DataNotReturned);
                    } else {
                        errors.insert(
                            namespace.clone(),
                            NonEmptyMap::new(
                                element.clone(),
                                DocumentErrorCode::DataNotReturned,
                            ),
                        );
                    }
                }
            }
        }
    }

    let released: BTreeMap<String, NonEmptyVec<IssuerSignedItemBytes>> = released
        .into_iter()
        .filter_map(|(namespace, items)| {
            NonEmptyVec::maybe_new(items).map(|items| (namespace, items))
        })
        .collect();

    let device_namespaces =
        Tag24::new(DeviceNamespaces::default()).map_err(|_| {
            RespondError::Encode(cbor::CborError::EncodeFailed)
        })?;
    let device_auth = DeviceAuthentication::new(
        session_transcript.clone(),
        doc_type.clone(),
        device_namespaces.clone(),
    );
    let device_auth_bytes = cbor::to_vec(
        &Tag24::new(device_auth).map_err(|_| RespondError::Encode(cbor::CborError::EncodeFailed))?,
    )
    .map_err(RespondError::Encode)?;

    let prepared_cose_sign1 = PreparedCoseSign1::builder()
        .detached()
        .payload(device_auth_bytes)
        .signature_algorithm(algorithm)
        .prepare()
        .map_err(|e| RespondError::Signing(e.to_string()))?;

    Ok(PreparedDocument {
        doc_type,
        key_alias,
        algorithm,
        issuer_signed: IssuerSigned {
            namespaces: NonEmptyMap::maybe_new(released),
            issuer_auth: issuer_signed.issuer_auth,
        },
        device_namespaces,
        prepared_cose_sign1,
        errors: NonEmptyMap::maybe_new(errors),
    })
}

impl PreparedDeviceResponse {
    /// Sign the remaining prepared documents. Stops on the first locked key
    /// and returns itself inside [ResponseOutcome::UserAuthRequired] so the
    /// caller can retry after the user authenticates; no work is repeated.
    pub fn sign<K: KeyCapability + ?Sized>(
        mut self,
        keys: &K,
    ) -> Result<ResponseOutcome, RespondError> {
        while let Some(document) = self.prepared_documents.pop() {
            match keys.sign(
                &document.key_alias,
                document.algorithm,
                document.prepared_cose_sign1.signature_payload(),
            ) {
                SignOutcome::Signature(signature) => {
                    let signed = document.finalize(signature);
                    self.signed_documents.push(signed);
                }
                SignOutcome::KeyLocked => {
                    self.prepared_documents.push(document);
                    return Ok(ResponseOutcome::UserAuthRequired(self));
                }
                SignOutcome::Failure(reason) => return Err(RespondError::Signing(reason)),
            }
        }

        let response = DeviceResponse {
            version: DeviceResponse::VERSION.into(),
            documents: NonEmptyVec::maybe_new(self.signed_documents),
            document_errors: NonEmptyVec::maybe_new(self.document_errors),
            status: self.status,
        };
        let bytes = cbor::to_vec(&response).map_err(RespondError::Encode)?;
        Ok(ResponseOutcome::Ready(bytes))
    }
}

impl PreparedDocument {
    fn finalize(self, signature: Vec<u8>) -> Document {
        let Self {
            doc_type,
            issuer_signed,
            device_namespaces,
            prepared_cose_sign1,
            errors,
            ..
        } = self;
        let cose_sign1 = prepared_cose_sign1.finalize(signature);
        let device_signed = DeviceSigned {
            namespaces: device_namespaces,
            device_auth: DeviceAuth::DeviceSignature(cose_sign1),
        };
        Document {
            doc_type,
            issuer_signed,
            device_signed,
            errors,
        }
    }
}

/// Convert a [ParsedRequest] into "everything requested is permitted", for
/// flows where the holder approved the request wholesale.
pub fn permit_all(parsed: &ParsedRequest) -> PermittedItems {
    parsed
        .requests
        .iter()
        .map(|request| {
            (
                request.doc_type.clone(),
                request
                    .namespaces
                    .iter()
                    .map(|(namespace, elements)| {
                        (
                            namespace.clone(),
                            elements
                                .iter()
                                .filter(|(_, flags)| flags.requested)
                                .map(|(element, _)| element.clone())
                                .collect(),
                        )
                    })
                    .collect(),
            )
        })
        .collect()
}
