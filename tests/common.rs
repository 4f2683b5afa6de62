//! Shared fixtures: programmatically built reader certificates, an in-memory
//! document store and key capability, and a minimal simulated reader for
//! driving the session encryption from the other side.
#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use der::asn1::{BitString, Ia5String, OctetString, UtcTime};
use der::{Decode, Encode};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, IssuerAltName, KeyUsage,
    KeyUsages, SubjectKeyIdentifier,
};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use const_oid::AssociatedOid;
use mdoc_holder::cbor;
use mdoc_holder::cose::MaybeTagged;
use mdoc_holder::definitions::device_engagement::DeviceEngagement;
use mdoc_holder::definitions::device_key::CoseKey;
use mdoc_holder::definitions::device_request::{DeviceRequest, DocRequest, ItemsRequest};
use mdoc_holder::definitions::helpers::{ByteStr, NonEmptyMap, NonEmptyVec, Tag24};
use mdoc_holder::definitions::issuer_signed::{IssuerSigned, IssuerSignedItem};
use mdoc_holder::definitions::session::{
    self, Handover, SessionEstablishment, SessionTranscript,
};
use mdoc_holder::definitions::x509::x5chain::CertificateWithDer;
use mdoc_holder::keys::{KeyCapability, SignOutcome};
use mdoc_holder::storage::{DocumentStore, StoreError};

pub const MDL_DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
pub const MDL_NAMESPACE: &str = "org.iso.18013.5.1";

const ECDSA_WITH_SHA256: const_oid::ObjectIdentifier =
    const_oid::ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const READER_AUTH_OID: const_oid::ObjectIdentifier =
    const_oid::ObjectIdentifier::new_unwrap("1.0.18013.5.1.6");

/// 2023-01-01T00:00:00Z
const NOT_BEFORE_UNIX: u64 = 1_672_531_200;

/// Knobs for building a reader certificate, each one targeting a single
/// profile check.
#[derive(Clone)]
pub struct CertOptions {
    pub common_name: &'static str,
    pub validity_days: u64,
    pub serial: Vec<u8>,
    pub include_ski: bool,
    pub include_aki: bool,
    pub include_key_usage: bool,
    pub key_usage_digital_signature: bool,
    pub include_eku: bool,
    pub include_ian: bool,
    pub ca: bool,
}

impl Default for CertOptions {
    fn default() -> Self {
        Self {
            common_name: "Test mdoc Reader",
            validity_days: 365,
            serial: vec![0x4A; 16],
            include_ski: true,
            include_aki: true,
            include_key_usage: true,
            key_usage_digital_signature: true,
            include_eku: true,
            include_ian: true,
            ca: false,
        }
    }
}

pub struct TestCert {
    pub signing_key: SigningKey,
    pub certificate: CertificateWithDer,
}

fn extension<T: Encode + AssociatedOid>(value: &T, critical: bool) -> Extension {
    Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(value.to_der().unwrap()).unwrap(),
    }
}

fn build_certificate(
    subject_key: &SigningKey,
    issuer_key: &SigningKey,
    issuer_name: &str,
    options: &CertOptions,
) -> CertificateWithDer {
    let spki_der = subject_key
        .verifying_key()
        .to_public_key_der()
        .unwrap();
    let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).unwrap();

    let mut extensions = vec![];
    let key_id = OctetString::new(&options.serial[..8.min(options.serial.len())]).unwrap();
    if options.include_ski {
        extensions.push(extension(&SubjectKeyIdentifier(key_id.clone()), false));
    }
    if options.include_aki {
        extensions.push(extension(
            &AuthorityKeyIdentifier {
                key_identifier: Some(key_id),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            },
            false,
        ));
    }
    if options.include_key_usage {
        let usages = if options.ca {
            KeyUsages::DigitalSignature | KeyUsages::KeyCertSign | KeyUsages::CRLSign
        } else if options.key_usage_digital_signature {
            KeyUsages::DigitalSignature.into()
        } else {
            KeyUsages::KeyEncipherment.into()
        };
        extensions.push(extension(&KeyUsage(usages), true));
    }
    if options.include_eku {
        extensions.push(extension(&ExtendedKeyUsage(vec![READER_AUTH_OID]), true));
    }
    if options.include_ian {
        extensions.push(extension(
            &IssuerAltName(vec![GeneralName::UniformResourceIdentifier(
                Ia5String::new("https://ca.reader.example.com").unwrap(),
            )]),
            false,
        ));
    }
    if options.ca {
        extensions.push(extension(
            &BasicConstraints {
                ca: true,
                path_len_constraint: None,
            },
            true,
        ));
    }

    let algorithm = AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA256,
        parameters: None,
    };
    let not_before = StdDuration::from_secs(NOT_BEFORE_UNIX);
    let not_after =
        StdDuration::from_secs(NOT_BEFORE_UNIX + options.validity_days * 24 * 60 * 60);
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&options.serial).unwrap(),
        signature: algorithm.clone(),
        issuer: Name::from_str(&format!("CN={issuer_name}")).unwrap(),
        validity: Validity {
            not_before: Time::UtcTime(UtcTime::from_unix_duration(not_before).unwrap()),
            not_after: Time::UtcTime(UtcTime::from_unix_duration(not_after).unwrap()),
        },
        subject: Name::from_str(&format!("CN={}", options.common_name)).unwrap(),
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };

    let tbs_der = tbs_certificate.to_der().unwrap();
    let signature: Signature = issuer_key.sign(&tbs_der);
    let signature_der = signature.to_der();

    let certificate = Certificate {
        tbs_certificate,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(signature_der.as_bytes()).unwrap(),
    };
    CertificateWithDer::from_der(&certificate.to_der().unwrap()).unwrap()
}

/// A self-signed reader CA root.
pub fn reader_ca(common_name: &'static str) -> TestCert {
    let signing_key = SigningKey::from_slice(&[0x11; 32]).unwrap();
    let options = CertOptions {
        common_name,
        ca: true,
        ..Default::default()
    };
    let certificate = build_certificate(&signing_key, &signing_key, common_name, &options);
    TestCert {
        signing_key,
        certificate,
    }
}

/// A reader certificate signed by `issuer`.
pub fn reader_cert(issuer: &TestCert, key_seed: u8, options: CertOptions) -> TestCert {
    let signing_key = SigningKey::from_slice(&[key_seed; 32]).unwrap();
    let issuer_name = issuer
        .certificate
        .inner
        .tbs_certificate
        .subject
        .to_string();
    let issuer_cn = issuer_name.trim_start_matches("CN=");
    let certificate = build_certificate(&signing_key, &issuer.signing_key, issuer_cn, &options);
    TestCert {
        signing_key,
        certificate,
    }
}

// --- document store and key capability fixtures ---

#[derive(Default)]
pub struct MemoryStore {
    documents: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn with_mdl() -> Self {
        let mut documents = HashMap::new();
        documents.insert(MDL_DOC_TYPE.to_string(), mdl_issuer_signed_bytes());
        Self { documents }
    }
}

impl DocumentStore for MemoryStore {
    fn issuer_signed_bytes(&self, doc_type: &str) -> Result<Vec<u8>, StoreError> {
        self.documents
            .get(doc_type)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_type.to_string()))
    }

    fn key_alias(&self, _doc_type: &str) -> Result<String, StoreError> {
        Ok("credential-key-1".to_string())
    }
}

/// Key capability backed by in-memory P-256 keys; returns raw r || s
/// signatures like a hardware keystore would.
pub struct SoftKeys {
    keys: HashMap<String, SigningKey>,
    pub locked: bool,
}

impl SoftKeys {
    pub fn new() -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            "credential-key-1".to_string(),
            SigningKey::from_slice(&[0x42; 32]).unwrap(),
        );
        Self {
            keys,
            locked: false,
        }
    }
}

impl KeyCapability for SoftKeys {
    fn sign(&self, alias: &str, _algorithm: coset::iana::Algorithm, payload: &[u8]) -> SignOutcome {
        if self.locked {
            return SignOutcome::KeyLocked;
        }
        match self.keys.get(alias) {
            Some(key) => {
                let signature: Signature = key.sign(payload);
                SignOutcome::Signature(signature.to_vec())
            }
            None => SignOutcome::Failure(format!("no key with alias '{alias}'")),
        }
    }
}

fn issuer_signed_item(digest_id: u64, identifier: &str, value: ciborium::Value) -> Tag24<IssuerSignedItem> {
    Tag24::new(IssuerSignedItem {
        digest_id,
        random: ByteStr::from(vec![digest_id as u8; 16]),
        element_identifier: identifier.to_string(),
        element_value: value,
    })
    .unwrap()
}

/// A stored mDL with a handful of elements; the issuerAuth carries no MSO
/// payload, which the holder tolerates by falling back to ES256.
pub fn mdl_issuer_signed_bytes() -> Vec<u8> {
    let items = vec![
        issuer_signed_item(1, "family_name", ciborium::Value::Text("Mustermann".into())),
        issuer_signed_item(2, "given_name", ciborium::Value::Text("Erika".into())),
        issuer_signed_item(3, "portrait", ciborium::Value::Bytes(vec![0xFF; 64])),
    ];
    let namespaces = NonEmptyMap::new(
        MDL_NAMESPACE.to_string(),
        NonEmptyVec::try_from(items).unwrap(),
    );
    let issuer_signed = IssuerSigned {
        namespaces: Some(namespaces),
        issuer_auth: MaybeTagged::new(
            true,
            coset::CoseSign1 {
                protected: coset::ProtectedHeader::default(),
                unprotected: coset::Header::default(),
                payload: None,
                signature: vec![0xAA; 64],
            },
        ),
    };
    cbor::to_vec(&issuer_signed).unwrap()
}

/// A stored mDL whose elements are `total_len` bytes of portrait data, for
/// exercising chunked response retrieval.
pub fn mdl_with_portrait_of(total_len: usize) -> Vec<u8> {
    let items = vec![
        issuer_signed_item(1, "given_name", ciborium::Value::Text("Erika".into())),
        issuer_signed_item(2, "portrait", ciborium::Value::Bytes(vec![0x7E; total_len])),
    ];
    let namespaces = NonEmptyMap::new(
        MDL_NAMESPACE.to_string(),
        NonEmptyVec::try_from(items).unwrap(),
    );
    let issuer_signed = IssuerSigned {
        namespaces: Some(namespaces),
        issuer_auth: MaybeTagged::new(
            true,
            coset::CoseSign1 {
                protected: coset::ProtectedHeader::default(),
                unprotected: coset::Header::default(),
                payload: None,
                signature: vec![0xAA; 64],
            },
        ),
    };
    cbor::to_vec(&issuer_signed).unwrap()
}

/// Build a `DeviceRequest` asking for the given elements (value is
/// intentToRetain), without reader authentication.
pub fn device_request_bytes(doc_type: &str, elements: &[(&str, bool)]) -> Vec<u8> {
    device_request(doc_type, elements, None)
}

pub fn device_request(
    doc_type: &str,
    elements: &[(&str, bool)],
    reader_auth: Option<MaybeTagged<coset::CoseSign1>>,
) -> Vec<u8> {
    let mut data_elements: std::collections::BTreeMap<String, bool> = Default::default();
    for (element, intent_to_retain) in elements {
        data_elements.insert(element.to_string(), *intent_to_retain);
    }
    let namespaces = NonEmptyMap::new(
        MDL_NAMESPACE.to_string(),
        NonEmptyMap::try_from(data_elements).unwrap(),
    );
    let items_request = ItemsRequest {
        doc_type: doc_type.to_string(),
        namespaces,
        request_info: None,
    };
    let request = DeviceRequest {
        version: DeviceRequest::VERSION.to_string(),
        doc_requests: NonEmptyVec::new(DocRequest {
            items_request: Tag24::new(items_request).unwrap(),
            reader_auth,
        }),
    };
    cbor::to_vec(&request).unwrap()
}

// --- transport and event fixtures ---

#[derive(Default)]
pub struct NullTransport;

impl mdoc_holder::transport::Transport for NullTransport {
    fn connect(&mut self) -> Result<(), mdoc_holder::transport::TransportError> {
        Ok(())
    }
    fn send(&mut self, _message: &[u8]) -> Result<(), mdoc_holder::transport::TransportError> {
        Ok(())
    }
    fn close(&mut self) {}
}

pub struct NullTransportFactory;

impl mdoc_holder::engagement::TransportFactory for NullTransportFactory {
    fn create(
        &self,
        _method: &mdoc_holder::definitions::DeviceRetrievalMethod,
    ) -> Box<dyn mdoc_holder::transport::Transport> {
        Box::new(NullTransport)
    }
}

/// Collects emitted session events for assertions.
#[derive(Clone, Default)]
pub struct EventLog(pub std::sync::Arc<std::sync::Mutex<Vec<mdoc_holder::SessionEvent>>>);

impl mdoc_holder::EventListener for EventLog {
    fn on_event(&self, event: mdoc_holder::SessionEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl EventLog {
    pub fn contains(&self, predicate: impl Fn(&mdoc_holder::SessionEvent) -> bool) -> bool {
        self.0.lock().unwrap().iter().any(predicate)
    }
}

/// The reader half of the session encryption, enough to establish a session
/// against the holder and read its responses.
pub struct SimulatedReader {
    pub transcript: SessionTranscript,
    sk_reader: [u8; 32],
    sk_device: [u8; 32],
    send_counter: u32,
    recv_counter: u32,
}

impl SimulatedReader {
    pub fn establish(
        device_engagement: Tag24<DeviceEngagement>,
        handover: Handover,
        request_plaintext: &[u8],
    ) -> (Self, Vec<u8>) {
        let (reader_secret, reader_cose_key) = session::create_p256_ephemeral_keys().unwrap();
        let e_reader_key = Tag24::new(reader_cose_key).unwrap();

        let device_cose_key: CoseKey = device_engagement
            .as_ref()
            .security
            .1
            .as_ref()
            .clone();

        let transcript =
            SessionTranscript(device_engagement, e_reader_key.clone(), handover);
        let transcript_bytes = Tag24::new(transcript.clone()).unwrap();

        let shared_secret =
            session::get_shared_secret(device_cose_key, &reader_secret.to_nonzero_scalar())
                .unwrap();
        let sk_reader =
            session::derive_session_key(&shared_secret, &transcript_bytes, true).unwrap();
        let sk_device =
            session::derive_session_key(&shared_secret, &transcript_bytes, false).unwrap();

        let mut reader = Self {
            transcript,
            sk_reader,
            sk_device,
            send_counter: 0,
            recv_counter: 0,
        };
        let encrypted =
            session::encrypt_reader_data(&reader.sk_reader, request_plaintext, &mut reader.send_counter)
                .unwrap();
        let establishment = SessionEstablishment {
            e_reader_key,
            data: ByteStr::from(encrypted),
        };
        let message = cbor::to_vec(&establishment).unwrap();
        (reader, message)
    }

    pub fn encrypt_followup(&mut self, request_plaintext: &[u8]) -> Vec<u8> {
        let encrypted =
            session::encrypt_reader_data(&self.sk_reader, request_plaintext, &mut self.send_counter)
                .unwrap();
        cbor::to_vec(&session::SessionData {
            data: Some(ByteStr::from(encrypted)),
            status: None,
        })
        .unwrap()
    }

    pub fn decrypt_response(&mut self, session_data_bytes: &[u8]) -> session::SessionData {
        cbor::from_slice(session_data_bytes).unwrap()
    }

    pub fn decrypt_payload(&mut self, data: &ByteStr) -> Vec<u8> {
        session::decrypt_device_data(&self.sk_device, data.as_ref(), &mut self.recv_counter)
            .unwrap()
    }
}
