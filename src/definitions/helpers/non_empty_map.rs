use std::{collections::BTreeMap, ops::Deref};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<K, V>", into = "BTreeMap<K, V>")]
pub struct NonEmptyMap<K: Ord + Clone, V: Clone>(BTreeMap<K, V>);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot construct a non-empty map from an empty map")]
    Empty,
}

impl<K: Ord + Clone, V: Clone> NonEmptyMap<K, V> {
    pub fn new(k: K, v: V) -> Self {
        let mut inner = BTreeMap::new();
        inner.insert(k, v);
        Self(inner)
    }

    pub fn maybe_new(m: BTreeMap<K, V>) -> Option<Self> {
        Self::try_from(m).ok()
    }

    pub fn insert(&mut self, k: K, v: V) -> Option<V> {
        self.0.insert(k, v)
    }

    pub fn into_inner(self) -> BTreeMap<K, V> {
        self.0
    }
}

impl<K: Ord + Clone, V: Clone> TryFrom<BTreeMap<K, V>> for NonEmptyMap<K, V> {
    type Error = Error;

    fn try_from(m: BTreeMap<K, V>) -> Result<NonEmptyMap<K, V>, Error> {
        if m.is_empty() {
            return Err(Error::Empty);
        }
        Ok(NonEmptyMap(m))
    }
}

impl<K: Ord + Clone, V: Clone> From<NonEmptyMap<K, V>> for BTreeMap<K, V> {
    fn from(NonEmptyMap(m): NonEmptyMap<K, V>) -> BTreeMap<K, V> {
        m
    }
}

impl<K: Ord + Clone, V: Clone> AsRef<BTreeMap<K, V>> for NonEmptyMap<K, V> {
    fn as_ref(&self) -> &BTreeMap<K, V> {
        &self.0
    }
}

impl<K: Ord + Clone, V: Clone> Deref for NonEmptyMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &BTreeMap<K, V> {
        &self.0
    }
}

impl<K: Ord + Clone, V: Clone> FromIterator<(K, V)> for NonEmptyMap<K, V> {
    /// # Panics
    ///
    /// Panics if the iterator is empty; reserved for callers that can
    /// guarantee at least one element.
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let m: BTreeMap<K, V> = iter.into_iter().collect();
        Self::maybe_new(m).expect("cannot collect an empty iterator into a NonEmptyMap")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_map_is_rejected() {
        let m: BTreeMap<String, u8> = BTreeMap::new();
        assert!(NonEmptyMap::maybe_new(m).is_none());
    }

    #[test]
    fn insert_and_lookup() {
        let mut m = NonEmptyMap::new("a".to_string(), 1);
        m.insert("b".to_string(), 2);
        assert_eq!(m.get("b"), Some(&2));
    }
}
