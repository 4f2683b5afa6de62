pub mod device_engagement;
pub mod device_key;
pub mod device_request;
pub mod device_response;
pub mod device_signed;
pub mod helpers;
pub mod issuer_signed;
pub mod mso;
pub mod session;
pub mod x509;

pub use device_engagement::{
    BleOptions, DeviceEngagement, DeviceRetrievalMethod, NfcOptions, Security,
};
pub use device_key::{CoseKey, EC2Curve, EC2Y};
pub use device_request::{DeviceRequest, DocRequest, ItemsRequest};
pub use device_response::{DeviceResponse, Document};
pub use device_signed::{DeviceAuth, DeviceAuthentication, DeviceSigned};
pub use issuer_signed::{IssuerSigned, IssuerSignedItem};
pub use mso::{DigestAlgorithm, Mso};
pub use session::{Handover, SessionData, SessionEstablishment, SessionTranscript};
