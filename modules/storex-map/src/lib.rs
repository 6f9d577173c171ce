//! Persistent, structurally shared hash map.
//!
//! A hash array mapped trie: every `insert`/`remove` returns a new map that
//! shares all untouched subtrees with the old one. Published maps are never
//! mutated, so a snapshot handed to another holder stays valid forever and
//! cloning a map is a single `Arc` bump.
//!
//! Domain-agnostic. The state container in `storex` keys it by feature name.

mod iter;
mod node;

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

pub use iter::{Iter, Keys, Values};
use node::{Entry, Node};

/// Immutable map with O(log32 n) updates.
pub struct PersistentMap<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

pub(crate) fn hash_key<Q: Hash + ?Sized>(key: &Q) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<K, V> PersistentMap<K, V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when both maps are the same published version (same root node).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self.root.as_deref(), self.len)
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(self.iter())
    }

    pub fn values(&self) -> Values<'_, K, V> {
        Values::new(self.iter())
    }
}

impl<K, V> PersistentMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let root = self.root.as_deref()?;
        root.get(0, hash_key(key), key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Returns a new map with `key` set to `value`. `self` is untouched.
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = hash_key(&key);
        match self.root.as_deref() {
            None => Self {
                root: Some(Arc::new(Node::single(hash, key, value))),
                len: 1,
            },
            Some(root) => {
                let (node, added) = root.insert(0, hash, key, value);
                Self {
                    root: Some(Arc::new(node)),
                    len: if added { self.len + 1 } else { self.len },
                }
            }
        }
    }

    /// Returns a new map without `key`. When the key is absent the result
    /// shares the same root as `self`.
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(root) = self.root.as_deref() else {
            return self.clone();
        };
        match root.remove(0, hash_key(key), key) {
            None => self.clone(),
            Some(None) => Self::new(),
            Some(Some(Entry::Node(node))) => Self {
                root: Some(node),
                len: self.len - 1,
            },
            Some(Some(Entry::Leaf { hash, key, value })) => Self {
                root: Some(Arc::new(Node::single(hash, key, value))),
                len: self.len - 1,
            },
        }
    }

    /// Apply `f` to the current value (if any) and store the result.
    /// Returns `self` unchanged when `f` yields `None`.
    pub fn update<F>(&self, key: K, f: F) -> Self
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        match f(self.get(&key)) {
            Some(value) => self.insert(key, value),
            None => self.clone(),
        }
    }
}

impl<K, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PersistentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PartialEq for PersistentMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.len == other.len && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K, V> Eq for PersistentMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + Eq,
{
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for PersistentMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (k, v)| map.insert(k, v))
    }
}

impl<'a, K, V> IntoIterator for &'a PersistentMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Serialize, V: Serialize> Serialize for PersistentMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_leaves_previous_version_untouched() {
        let a: PersistentMap<String, i32> = PersistentMap::new().insert("x".into(), 1);
        let b = a.insert("x".into(), 2);
        assert_eq!(a.get("x"), Some(&1));
        assert_eq!(b.get("x"), Some(&2));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn remove_missing_key_keeps_root() {
        let a: PersistentMap<String, i32> = PersistentMap::new().insert("x".into(), 1);
        let b = a.remove("y");
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn remove_last_key_yields_empty() {
        let a: PersistentMap<String, i32> = PersistentMap::new().insert("x".into(), 1);
        let b = a.remove("x");
        assert!(b.is_empty());
        assert_eq!(b.get("x"), None);
        assert_eq!(a.get("x"), Some(&1));
    }

    #[test]
    fn many_keys_survive_insert_and_remove() {
        let mut map: PersistentMap<u32, u32> = PersistentMap::new();
        for i in 0..5_000 {
            map = map.insert(i, i * 2);
        }
        assert_eq!(map.len(), 5_000);
        for i in (0..5_000).step_by(2) {
            map = map.remove(&i);
        }
        assert_eq!(map.len(), 2_500);
        for i in 0..5_000 {
            let expected = (i % 2 == 1).then_some(i * 2);
            assert_eq!(map.get(&i).copied(), expected, "key {i}");
        }
        assert_eq!(map.iter().count(), 2_500);
    }

    #[test]
    fn equality_is_by_content() {
        let a: PersistentMap<u32, &str> = [(1, "a"), (2, "b")].into_iter().collect();
        let b: PersistentMap<u32, &str> = [(2, "b"), (1, "a")].into_iter().collect();
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        assert_ne!(a, b.insert(3, "c"));
    }

    #[test]
    fn update_with_none_is_noop() {
        let a: PersistentMap<u32, u32> = PersistentMap::new().insert(1, 1);
        let b = a.update(1, |_| None);
        assert!(a.ptr_eq(&b));
        let c = a.update(1, |v| v.map(|n| n + 10));
        assert_eq!(c.get(&1), Some(&11));
    }
}
