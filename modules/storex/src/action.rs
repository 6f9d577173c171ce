//! Actions, the per-store action pool, and action creators.
//!
//! An [`Action`] is an immutable `(type, payload)` record compared by value.
//! The [`ActionPool`] hands out one canonical instance per type for
//! payload-less actions and per `(type, payload)` for scalar payloads, so hot
//! paths reuse allocations. Structured payloads bypass the pool.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Dispatched once when the root reducers are registered.
pub const INIT_STORE: &str = "[Root] Init Store";
/// Dispatched whenever a feature reducer is added or removed at runtime.
pub const UPDATE_REDUCER: &str = "[Root] Update Reducer";
/// Carries an [`ErrorReport`](crate::error::ErrorReport) as payload.
pub const GLOBAL_ERROR: &str = "[Error] GlobalError";
/// Carries a list of actions buffered by the batch middleware.
pub const BATCH_ACTION: &str = "[Batch] BatchAction";

/// Action types the runtime dispatches itself.
pub fn is_internal(action_type: &str) -> bool {
    matches!(
        action_type,
        INIT_STORE | UPDATE_REDUCER | GLOBAL_ERROR | BATCH_ACTION
    )
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

struct ActionInner {
    action_type: Arc<str>,
    payload: Option<Value>,
}

/// An immutable event record. Cloning is a refcount bump.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "ActionRepr", from = "ActionRepr")]
pub struct Action {
    inner: Arc<ActionInner>,
}

#[derive(Serialize, Deserialize)]
struct ActionRepr {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl From<Action> for ActionRepr {
    fn from(action: Action) -> Self {
        Self {
            action_type: action.action_type().to_string(),
            payload: action.payload().cloned(),
        }
    }
}

impl From<ActionRepr> for Action {
    fn from(repr: ActionRepr) -> Self {
        Action::new(&repr.action_type, repr.payload)
    }
}

impl Action {
    /// Allocate a fresh action. Prefer an [`ActionCreator`] on hot paths.
    pub fn new(action_type: &str, payload: Option<Value>) -> Self {
        Self {
            inner: Arc::new(ActionInner {
                action_type: Arc::from(action_type),
                payload,
            }),
        }
    }

    fn from_parts(action_type: Arc<str>, payload: Option<Value>) -> Self {
        Self {
            inner: Arc::new(ActionInner {
                action_type,
                payload,
            }),
        }
    }

    pub fn action_type(&self) -> &str {
        &self.inner.action_type
    }

    pub fn payload(&self) -> Option<&Value> {
        self.inner.payload.as_ref()
    }

    /// Deserialize the payload into `T`. A missing payload is read as `null`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        let value = self.payload().cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| StoreError::Action {
            action_type: self.action_type().to_string(),
            reason: format!("payload does not match expected shape: {e}"),
        })
    }

    pub fn is(&self, action_type: &str) -> bool {
        self.action_type() == action_type
    }

    /// Same allocation. Only meaningful for pool diagnostics.
    pub fn ptr_eq(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Combine actions into one `[Batch] BatchAction`.
    pub fn batch(actions: &[Action]) -> Action {
        let items = actions
            .iter()
            .filter_map(|a| serde_json::to_value(a).ok())
            .collect();
        Action::new(BATCH_ACTION, Some(Value::Array(items)))
    }

    /// The actions inside a batch action, or `None` for any other action.
    pub fn batch_items(&self) -> Option<Vec<Action>> {
        if self.action_type() != BATCH_ACTION {
            return None;
        }
        let Some(Value::Array(items)) = self.payload() else {
            return Some(Vec::new());
        };
        Some(
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
        )
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.inner.action_type == other.inner.action_type
                && self.inner.payload == other.inner.payload)
    }
}

impl Eq for Action {}

impl Hash for Action {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.action_type.hash(state);
        match &self.inner.payload {
            None => 0u8.hash(state),
            Some(value) => {
                1u8.hash(state);
                hash_value(value, state);
            }
        }
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            if let Some(i) = n.as_i64() {
                i.hash(state);
            } else if let Some(u) = n.as_u64() {
                u.hash(state);
            } else if let Some(f) = n.as_f64() {
                float_bits(f).hash(state);
            }
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        // Object key order is not part of equality, so only the size is hashed.
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
        }
    }
}

/// Bit pattern with `-0.0` folded into `0.0`, which compare equal.
fn float_bits(f: f64) -> u64 {
    if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Action");
        s.field("type", &self.action_type());
        if let Some(payload) = self.payload() {
            s.field("payload", payload);
        }
        s.finish()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_type())
    }
}

// ---------------------------------------------------------------------------
// ActionPool
// ---------------------------------------------------------------------------

/// Scalar payloads that can key the second pool tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PayloadKey {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(u64),
    Str(String),
}

impl PayloadKey {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_u64().map(Self::UInt))
                .or_else(|| n.as_f64().map(|f| Self::Float(float_bits(f)))),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

/// Canonical action instances for one store (or any owner that shares it).
///
/// Safe under concurrent producers: insertion happens under the write lock
/// with `entry().or_insert_with`, so two racing callers always receive the
/// same instance for a given key.
#[derive(Default)]
pub struct ActionPool {
    bare: RwLock<HashMap<Arc<str>, Action>>,
    keyed: RwLock<HashMap<Arc<str>, HashMap<PayloadKey, Action>>>,
}

impl ActionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or insert the canonical action for `(action_type, payload)`.
    /// Structured payloads are never pooled and always allocate.
    pub fn get(&self, action_type: &str, payload: Option<Value>) -> Action {
        match payload {
            None => self.get_bare(action_type),
            Some(value) => match PayloadKey::of(&value) {
                Some(key) => self.get_keyed(action_type, key, value),
                None => Action::new(action_type, Some(value)),
            },
        }
    }

    fn get_bare(&self, action_type: &str) -> Action {
        if let Some(action) = self.bare.read().get(action_type) {
            return action.clone();
        }
        let mut bare = self.bare.write();
        let type_key: Arc<str> = Arc::from(action_type);
        bare.entry(type_key.clone())
            .or_insert_with(|| Action::from_parts(type_key, None))
            .clone()
    }

    fn get_keyed(&self, action_type: &str, key: PayloadKey, value: Value) -> Action {
        if let Some(action) = self
            .keyed
            .read()
            .get(action_type)
            .and_then(|by_payload| by_payload.get(&key))
        {
            return action.clone();
        }
        let mut keyed = self.keyed.write();
        let type_key: Arc<str> = Arc::from(action_type);
        keyed
            .entry(type_key.clone())
            .or_default()
            .entry(key)
            .or_insert_with(|| Action::from_parts(type_key, Some(value)))
            .clone()
    }

    /// Number of pooled instances across both tiers.
    pub fn len(&self) -> usize {
        let keyed: usize = self.keyed.read().values().map(HashMap::len).sum();
        self.bare.read().len() + keyed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.bare.write().clear();
        self.keyed.write().clear();
    }
}

impl fmt::Debug for ActionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionPool")
            .field("pooled", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Action creators
// ---------------------------------------------------------------------------

type Prepare = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Factory for actions of one type, served from a pool.
#[derive(Clone)]
pub struct ActionCreator {
    action_type: Arc<str>,
    prepare: Option<Prepare>,
    pool: Arc<ActionPool>,
}

/// Creator for `action_type` whose payload is passed through as given.
pub fn create_action(pool: &Arc<ActionPool>, action_type: &str) -> ActionCreator {
    ActionCreator {
        action_type: Arc::from(action_type),
        prepare: None,
        pool: pool.clone(),
    }
}

/// Creator whose payload is computed by `prepare` from the call argument.
pub fn create_action_with<F>(pool: &Arc<ActionPool>, action_type: &str, prepare: F) -> ActionCreator
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    ActionCreator {
        action_type: Arc::from(action_type),
        prepare: Some(Arc::new(prepare)),
        pool: pool.clone(),
    }
}

impl ActionCreator {
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Action without an argument. With a prepare function, it is given
    /// `null` and a `null` result means no payload.
    pub fn create(&self) -> Action {
        let payload = self
            .prepare
            .as_ref()
            .map(|prepare| prepare(Value::Null))
            .filter(|value| !value.is_null());
        self.pool.get(&self.action_type, payload)
    }

    pub fn call(&self, argument: Value) -> Action {
        let payload = match &self.prepare {
            Some(prepare) => prepare(argument),
            None => argument,
        };
        self.pool.get(&self.action_type, Some(payload))
    }

    /// Serialize `payload` and build the action.
    pub fn with<T: Serialize>(&self, payload: &T) -> StoreResult<Action> {
        let value = serde_json::to_value(payload).map_err(|e| StoreError::Action {
            action_type: self.action_type.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.call(value))
    }

    pub fn matches(&self, action: &Action) -> bool {
        action.action_type() == &*self.action_type
    }
}

impl fmt::Debug for ActionCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCreator")
            .field("type", &self.action_type)
            .field("prepare", &self.prepare.is_some())
            .finish()
    }
}

/// Anything that names an action type: a string, a creator or an action.
pub trait AsActionType {
    fn as_action_type(&self) -> &str;
}

impl AsActionType for str {
    fn as_action_type(&self) -> &str {
        self
    }
}

impl AsActionType for String {
    fn as_action_type(&self) -> &str {
        self
    }
}

impl AsActionType for ActionCreator {
    fn as_action_type(&self) -> &str {
        self.action_type()
    }
}

impl AsActionType for Action {
    fn as_action_type(&self) -> &str {
        self.action_type()
    }
}
