//! The root state snapshot: a persistent map from feature key to sub-state.
//!
//! Snapshots are immutable. Every update yields a new [`State`] sharing all
//! untouched sub-states with its predecessor, so anyone holding an older
//! snapshot keeps seeing exactly what was published.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use storex_map::PersistentMap;

use crate::error::{StoreError, StoreResult};

/// Type-erased feature sub-state.
pub type SubState = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct State {
    features: PersistentMap<Arc<str>, SubState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed sub-state under `key`, if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.features.get(key)?.clone().downcast::<T>().ok()
    }

    /// Like [`State::get`] but distinguishes a missing key from a type mismatch.
    pub fn feature<T: Any + Send + Sync>(&self, key: &str) -> StoreResult<Arc<T>> {
        let raw = self
            .features
            .get(key)
            .ok_or_else(|| StoreError::UnknownFeature(key.to_string()))?;
        raw.clone()
            .downcast::<T>()
            .map_err(|_| StoreError::FeatureType {
                feature: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn raw(&self, key: &str) -> Option<&SubState> {
        self.features.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.features.contains_key(key)
    }

    /// New snapshot with `key` set. `self` is untouched.
    pub fn with(&self, key: impl Into<Arc<str>>, value: SubState) -> State {
        State {
            features: self.features.insert(key.into(), value),
        }
    }

    /// New snapshot without `key`. Shares the root when the key is absent.
    pub fn without(&self, key: &str) -> State {
        State {
            features: self.features.remove(key),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(|k| &**k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SubState)> {
        self.features.iter().map(|(k, v)| (&**k, v))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Same published snapshot.
    pub fn ptr_eq(&self, other: &State) -> bool {
        self.features.ptr_eq(&other.features)
    }

    /// Same keys, each holding the same sub-state allocation.
    pub fn shallow_eq(&self, other: &State) -> bool {
        self.ptr_eq(other)
            || (self.len() == other.len()
                && self.iter().all(|(key, value)| {
                    other
                        .raw(key)
                        .is_some_and(|theirs| Arc::ptr_eq(value, theirs))
                }))
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("State").field("features", &keys).finish()
    }
}
