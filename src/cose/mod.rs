pub mod sign1;

use std::ops::{Deref, DerefMut};

use coset::AsCborValue;
use serde::{Deserialize, Serialize};

pub use sign1::{Builder, PreparedCoseSign1, VerificationKey};

/// Wrapper for COSE structures that may arrive with or without their CBOR tag
/// (readers in the wild emit both forms). The tagging observed on decode is
/// preserved on encode.
#[derive(Debug, Clone, PartialEq)]
pub struct MaybeTagged<T> {
    pub tagged: bool,
    pub inner: T,
}

impl<T> MaybeTagged<T> {
    pub fn new(tagged: bool, inner: T) -> Self {
        Self { tagged, inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Deref for MaybeTagged<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MaybeTagged<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// COSE_Sign1 carries tag 18 when tagged.
const COSE_SIGN1_TAG: u64 = 18;

impl<T: Clone + AsCborValue> Serialize for MaybeTagged<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let value = self
            .inner
            .clone()
            .to_cbor_value()
            .map_err(serde::ser::Error::custom)?;
        if self.tagged {
            ciborium::Value::Tag(COSE_SIGN1_TAG, Box::new(value)).serialize(serializer)
        } else {
            value.serialize(serializer)
        }
    }
}

impl<'de, T: AsCborValue> Deserialize<'de> for MaybeTagged<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = ciborium::Value::deserialize(deserializer)?;
        let (tagged, value) = match value {
            ciborium::Value::Tag(COSE_SIGN1_TAG, inner) => (true, *inner),
            other => (false, other),
        };
        let inner = T::from_cbor_value(value).map_err(serde::de::Error::custom)?;
        Ok(MaybeTagged { tagged, inner })
    }
}
