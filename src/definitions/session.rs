//! Session establishment and encryption for the proximity data exchange.
//!
//! The session transcript binds every signature and every encrypted message
//! to one engagement: it is computed exactly once per session and the same
//! byte image is reused everywhere, otherwise verification fails on either
//! side by design.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use elliptic_curve::ecdh::SharedSecret;
use p256::{NistP256, NonZeroScalar, PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cbor;
use crate::definitions::device_engagement::DeviceEngagement;
use crate::definitions::device_key::CoseKey;
use crate::definitions::helpers::{ByteStr, Tag24};

pub type EReaderKeyBytes = Tag24<CoseKey>;
pub type EDeviceKeyBytes = Tag24<CoseKey>;
pub type DeviceEngagementBytes = Tag24<DeviceEngagement>;
pub type SessionTranscriptBytes = Tag24<SessionTranscript>;

/// `[DeviceEngagementBytes, EReaderKeyBytes, Handover]`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTranscript(
    pub DeviceEngagementBytes,
    pub EReaderKeyBytes,
    pub Handover,
);

/// QR engagement needs no handover (the engagement travelled out of band);
/// NFC carries the Handover Select message and, for negotiated handover, the
/// reader's Handover Request as well.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handover {
    Qr,
    Nfc(ByteStr, Option<ByteStr>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEstablishment {
    #[serde(rename = "eReaderKey")]
    pub e_reader_key: EReaderKeyBytes,
    pub data: ByteStr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// Status codes carried in [SessionData].
///
/// Termination (20) doubles as the distinguished "no matching document"
/// signal, keeping it apart from decode failure (11) so the reader can tell
/// the two causes apart.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u64", into = "u64")]
pub enum Status {
    SessionEncryptionError,
    CborDecodingError,
    SessionTermination,
}

impl From<Status> for u64 {
    fn from(s: Status) -> u64 {
        match s {
            Status::SessionEncryptionError => 10,
            Status::CborDecodingError => 11,
            Status::SessionTermination => 20,
        }
    }
}

impl TryFrom<u64> for Status {
    type Error = Error;

    fn try_from(n: u64) -> Result<Status, Error> {
        match n {
            10 => Ok(Status::SessionEncryptionError),
            11 => Ok(Status::CborDecodingError),
            20 => Ok(Status::SessionTermination),
            _ => Err(Error::UnknownStatus(n)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("curve not supported for DH exchange")]
    UnsupportedCurve,
    #[error("not a valid public key: {0}")]
    InvalidPublicKey(#[from] elliptic_curve::Error),
    #[error("unknown session status code: {0}")]
    UnknownStatus(u64),
    #[error("CBOR error: {0}")]
    Cbor(#[from] cbor::CborError),
    #[error("session key could not be derived")]
    KeyDerivation,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed: authentication tag or message counter mismatch")]
    Decryption,
}

impl Serialize for Handover {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Handover::Qr => ciborium::Value::Null.serialize(serializer),
            Handover::Nfc(select, request) => {
                let request = match request {
                    Some(bytes) => ciborium::Value::Bytes(bytes.as_ref().to_vec()),
                    None => ciborium::Value::Null,
                };
                ciborium::Value::Array(vec![
                    ciborium::Value::Bytes(select.as_ref().to_vec()),
                    request,
                ])
                .serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Handover {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        match ciborium::Value::deserialize(deserializer)? {
            ciborium::Value::Null => Ok(Handover::Qr),
            ciborium::Value::Array(mut items) if items.len() == 2 => {
                let request = match items.pop().unwrap() {
                    ciborium::Value::Null => None,
                    ciborium::Value::Bytes(bytes) => Some(ByteStr::from(bytes)),
                    other => {
                        return Err(D::Error::custom(format!(
                            "invalid handover request element: {other:?}"
                        )))
                    }
                };
                let select = match items.pop().unwrap() {
                    ciborium::Value::Bytes(bytes) => ByteStr::from(bytes),
                    other => {
                        return Err(D::Error::custom(format!(
                            "invalid handover select element: {other:?}"
                        )))
                    }
                };
                Ok(Handover::Nfc(select, request))
            }
            other => Err(D::Error::custom(format!("invalid handover: {other:?}"))),
        }
    }
}

/// Generate the device's per-session P-256 key pair. The secret half zeroizes
/// itself on drop.
pub fn create_p256_ephemeral_keys() -> Result<(SecretKey, CoseKey), Error> {
    let e_device_key = SecretKey::random(&mut OsRng);
    let cose_key = e_device_key.public_key().into();
    Ok((e_device_key, cose_key))
}

/// ECDH between the device's ephemeral secret and the reader's ephemeral
/// public key.
pub fn get_shared_secret(
    reader_key: CoseKey,
    e_device_key_priv: &NonZeroScalar,
) -> Result<SharedSecret<NistP256>, Error> {
    let encoded_point: p256::EncodedPoint = reader_key
        .try_into()
        .map_err(|_| Error::UnsupportedCurve)?;
    let public_key = PublicKey::from_sec1_bytes(encoded_point.as_ref())?;
    let shared_secret = elliptic_curve::ecdh::diffie_hellman(e_device_key_priv, public_key.as_affine());
    Ok(shared_secret)
}

/// Derive one direction's AES-256-GCM session key.
///
/// Salt is SHA-256 over the tag-24-wrapped session transcript bytes; the info
/// string selects the direction.
pub fn derive_session_key(
    shared_secret: &SharedSecret<NistP256>,
    session_transcript: &SessionTranscriptBytes,
    reader: bool,
) -> Result<[u8; 32], Error> {
    let salt = Sha256::digest(cbor::to_vec(session_transcript)?);
    let hkdf = shared_secret.extract::<Sha256>(Some(salt.as_ref()));
    let mut okm = [0u8; 32];
    let info = if reader { "SKReader" } else { "SKDevice" };
    hkdf.expand(info.as_bytes(), &mut okm)
        .map_err(|_| Error::KeyDerivation)?;
    Ok(okm)
}

/// IV = 8-byte direction identifier || 4-byte big-endian message counter.
fn initialization_vector(message_count: u32, reader: bool) -> [u8; 12] {
    let mut iv = [0u8; 12];
    if !reader {
        iv[7] = 1;
    }
    iv[8..].copy_from_slice(&message_count.to_be_bytes());
    iv
}

pub fn encrypt_device_data(
    sk_device: &[u8; 32],
    plaintext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    encrypt(sk_device, plaintext, message_count, false)
}

pub fn encrypt_reader_data(
    sk_reader: &[u8; 32],
    plaintext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    encrypt(sk_reader, plaintext, message_count, true)
}

pub fn decrypt_reader_data(
    sk_reader: &[u8; 32],
    ciphertext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    decrypt(sk_reader, ciphertext, message_count, true)
}

pub fn decrypt_device_data(
    sk_device: &[u8; 32],
    ciphertext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    decrypt(sk_device, ciphertext, message_count, false)
}

fn encrypt(
    session_key: &[u8; 32],
    plaintext: &[u8],
    message_count: &mut u32,
    reader: bool,
) -> Result<Vec<u8>, Error> {
    *message_count += 1;
    let iv = initialization_vector(*message_count, reader);
    let nonce = Nonce::from(iv);
    Aes256Gcm::new(session_key.into())
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::Encryption)
}

fn decrypt(
    session_key: &[u8; 32],
    ciphertext: &[u8],
    message_count: &mut u32,
    reader: bool,
) -> Result<Vec<u8>, Error> {
    *message_count += 1;
    let iv = initialization_vector(*message_count, reader);
    let nonce = Nonce::from(iv);
    Aes256Gcm::new(session_key.into())
        .decrypt(&nonce, ciphertext)
        .map_err(|_| Error::Decryption)
}
