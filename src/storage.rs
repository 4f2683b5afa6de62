//! The document-store collaborator. Encrypted at-rest storage is out of
//! scope; this subsystem only performs synchronous, read-only lookups of the
//! stored issuer-signed document bytes.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no document of type '{0}' is stored")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Failed(String),
}

pub trait DocumentStore {
    /// CBOR-encoded `IssuerSigned` bytes for the document of the given type.
    fn issuer_signed_bytes(&self, doc_type: &str) -> Result<Vec<u8>, StoreError>;

    /// The key-capability alias of the credential key bound to the document.
    fn key_alias(&self, doc_type: &str) -> Result<String, StoreError>;
}
