//! Normalized collections: ordered ids plus a persistent id → entity map.
//!
//! Every [`EntityAdapter`] operation returns a new [`EntityState`] and
//! records what it touched in [`EntityState::changes`]. The reducer built
//! by [`entity_reducer`] returns the previous state untouched when an
//! operation changed nothing.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use storex_map::PersistentMap;

use crate::action::{create_action, Action, ActionCreator, ActionPool};
use crate::error::{StoreError, StoreResult};
use crate::reducer::{create_reducer, FeatureReducer};

pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> String;
}

/// Ids touched by the last operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Partial update for one entity: `changes` is merged over its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: String,
    pub changes: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityState<T> {
    ids: Vec<String>,
    entities: PersistentMap<String, Arc<T>>,
    changes: ChangeSet,
}

impl<T> Default for EntityState<T> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            entities: PersistentMap::new(),
            changes: ChangeSet::default(),
        }
    }
}

impl<T: Entity> EntityState<T> {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn get(&self, id: &str) -> Option<&Arc<T>> {
        self.entities.get(id)
    }

    /// Entities in id order.
    pub fn all(&self) -> Vec<Arc<T>> {
        self.ids
            .iter()
            .filter_map(|id| self.entities.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    fn begin(&self) -> Self {
        Self {
            ids: self.ids.clone(),
            entities: self.entities.clone(),
            changes: ChangeSet::default(),
        }
    }

    fn insert_new(&mut self, entity: T) {
        let id = entity.id();
        if self.entities.contains_key(&id) {
            return;
        }
        self.ids.push(id.clone());
        self.entities = self.entities.insert(id.clone(), Arc::new(entity));
        self.changes.created.push(id);
    }

    fn replace(&mut self, entity: T) {
        let id = entity.id();
        match self.entities.get(&id) {
            Some(old) if **old == entity => return,
            Some(_) => self.changes.updated.push(id.clone()),
            None => {
                self.ids.push(id.clone());
                self.changes.created.push(id.clone());
            }
        }
        self.entities = self.entities.insert(id, Arc::new(entity));
    }

    fn delete(&mut self, id: &str) {
        if !self.entities.contains_key(id) {
            return;
        }
        self.entities = self.entities.remove(id);
        self.ids.retain(|existing| existing != id);
        self.changes.deleted.push(id.to_string());
    }

    fn merge(&mut self, update: &EntityUpdate) -> StoreResult<()> {
        let Some(old) = self.entities.get(&update.id).cloned() else {
            return Ok(());
        };
        let Value::Object(changes) = &update.changes else {
            return Err(StoreError::Validation(format!(
                "changes for entity `{}` must be a JSON object",
                update.id
            )));
        };
        let mut fields = match serde_json::to_value(&*old) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                return Err(StoreError::Validation(format!(
                    "entity `{}` does not serialize to an object",
                    update.id
                )))
            }
        };
        for (key, value) in changes {
            fields.insert(key.clone(), value.clone());
        }
        let merged: T = serde_json::from_value(Value::Object(fields))
            .map_err(|e| StoreError::Validation(format!("entity `{}`: {e}", update.id)))?;
        if merged.id() != update.id {
            return Err(StoreError::Validation(format!(
                "update may not change the id of entity `{}`",
                update.id
            )));
        }
        if merged == *old {
            return Ok(());
        }
        self.entities = self.entities.insert(update.id.clone(), Arc::new(merged));
        self.changes.updated.push(update.id.clone());
        Ok(())
    }
}

impl<T: Serialize> Serialize for EntityState<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Entities<'a, T>(&'a EntityState<T>);

        impl<T: Serialize> Serialize for Entities<'_, T> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.ids.len()))?;
                for id in &self.0.ids {
                    if let Some(entity) = self.0.entities.get(id) {
                        map.serialize_entry(id, &**entity)?;
                    }
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("ids", &self.ids)?;
        map.serialize_entry("entities", &Entities(self))?;
        map.end()
    }
}

/// Last occurrence of each id wins; order follows first occurrence.
fn unique_by_id<T: Entity>(entities: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, T> = HashMap::new();
    for entity in entities {
        let id = entity.id();
        if latest.insert(id.clone(), entity).is_none() {
            order.push(id);
        }
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct EntityAdapter<T> {
    _entity: PhantomData<fn() -> T>,
}

pub fn create_entity_adapter<T: Entity>() -> EntityAdapter<T> {
    EntityAdapter {
        _entity: PhantomData,
    }
}

impl<T> Clone for EntityAdapter<T> {
    fn clone(&self) -> Self {
        Self {
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> EntityAdapter<T> {
    pub fn initial_state(&self) -> EntityState<T> {
        EntityState::default()
    }

    /// Insert unless the id already exists.
    pub fn add_one(&self, state: &EntityState<T>, entity: T) -> EntityState<T> {
        let mut next = state.begin();
        next.insert_new(entity);
        next
    }

    pub fn add_many(
        &self,
        state: &EntityState<T>,
        entities: impl IntoIterator<Item = T>,
    ) -> EntityState<T> {
        let mut next = state.begin();
        for entity in unique_by_id(entities) {
            next.insert_new(entity);
        }
        next
    }

    /// Insert or replace wholesale.
    pub fn set_one(&self, state: &EntityState<T>, entity: T) -> EntityState<T> {
        let mut next = state.begin();
        next.replace(entity);
        next
    }

    pub fn set_many(
        &self,
        state: &EntityState<T>,
        entities: impl IntoIterator<Item = T>,
    ) -> EntityState<T> {
        let mut next = state.begin();
        for entity in unique_by_id(entities) {
            next.replace(entity);
        }
        next
    }

    /// Replace the whole collection.
    pub fn set_all(
        &self,
        state: &EntityState<T>,
        entities: impl IntoIterator<Item = T>,
    ) -> EntityState<T> {
        let mut next = state.begin();
        for id in state.ids.iter() {
            next.delete(id);
        }
        for entity in unique_by_id(entities) {
            next.insert_new(entity);
        }
        next
    }

    pub fn remove_one(&self, state: &EntityState<T>, id: &str) -> EntityState<T> {
        let mut next = state.begin();
        next.delete(id);
        next
    }

    pub fn remove_many<I, S>(&self, state: &EntityState<T>, ids: I) -> EntityState<T>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = state.begin();
        for id in ids {
            next.delete(id.as_ref());
        }
        next
    }

    pub fn remove_all(&self, state: &EntityState<T>) -> EntityState<T> {
        self.set_all(state, Vec::new())
    }

    /// Shallow-merge `update.changes` into an existing entity. Unknown ids
    /// are ignored.
    pub fn update_one(
        &self,
        state: &EntityState<T>,
        update: &EntityUpdate,
    ) -> StoreResult<EntityState<T>> {
        let mut next = state.begin();
        next.merge(update)?;
        Ok(next)
    }

    pub fn update_many(
        &self,
        state: &EntityState<T>,
        updates: &[EntityUpdate],
    ) -> StoreResult<EntityState<T>> {
        let mut next = state.begin();
        for update in updates {
            next.merge(update)?;
        }
        Ok(next)
    }

    /// Merge into an existing entity, or insert it.
    pub fn upsert_one(&self, state: &EntityState<T>, entity: T) -> StoreResult<EntityState<T>> {
        let mut next = state.begin();
        next.upsert(entity)?;
        Ok(next)
    }

    pub fn upsert_many(
        &self,
        state: &EntityState<T>,
        entities: impl IntoIterator<Item = T>,
    ) -> StoreResult<EntityState<T>> {
        let mut next = state.begin();
        for entity in unique_by_id(entities) {
            next.upsert(entity)?;
        }
        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Selectors
    // -----------------------------------------------------------------------

    pub fn select_ids(&self, state: &EntityState<T>) -> Vec<String> {
        state.ids.clone()
    }

    pub fn select_all(&self, state: &EntityState<T>) -> Vec<Arc<T>> {
        state.all()
    }

    pub fn select_total(&self, state: &EntityState<T>) -> usize {
        state.len()
    }

    pub fn select_by_id(&self, state: &EntityState<T>, id: &str) -> Option<Arc<T>> {
        state.get(id).cloned()
    }
}

impl<T: Entity> EntityState<T> {
    fn upsert(&mut self, entity: T) -> StoreResult<()> {
        let id = entity.id();
        if !self.entities.contains_key(&id) {
            self.insert_new(entity);
            return Ok(());
        }
        let changes = serde_json::to_value(&entity)
            .map_err(|e| StoreError::Validation(format!("entity `{id}`: {e}")))?;
        self.merge(&EntityUpdate { id, changes })
    }
}

// ---------------------------------------------------------------------------
// Actions and reducer
// ---------------------------------------------------------------------------

/// Action creators for one entity feature. Types read
/// `"[Entity] <feature> <Operation>"`.
#[derive(Debug, Clone)]
pub struct EntityActions {
    pub add_one: ActionCreator,
    pub add_many: ActionCreator,
    pub set_one: ActionCreator,
    pub set_many: ActionCreator,
    pub set_all: ActionCreator,
    pub remove_one: ActionCreator,
    pub remove_many: ActionCreator,
    pub remove_all: ActionCreator,
    pub update_one: ActionCreator,
    pub update_many: ActionCreator,
    pub upsert_one: ActionCreator,
    pub upsert_many: ActionCreator,
}

pub fn entity_actions(pool: &Arc<ActionPool>, feature: &str) -> EntityActions {
    let creator = |operation: &str| create_action(pool, &format!("[Entity] {feature} {operation}"));
    EntityActions {
        add_one: creator("Add One"),
        add_many: creator("Add Many"),
        set_one: creator("Set One"),
        set_many: creator("Set Many"),
        set_all: creator("Set All"),
        remove_one: creator("Remove One"),
        remove_many: creator("Remove Many"),
        remove_all: creator("Remove All"),
        update_one: creator("Update One"),
        update_many: creator("Update Many"),
        upsert_one: creator("Upsert One"),
        upsert_many: creator("Upsert Many"),
    }
}

/// Keep the previous `Arc` when an operation touched nothing.
fn settle<T: Entity>(previous: &Arc<EntityState<T>>, next: EntityState<T>) -> Arc<EntityState<T>> {
    if next.changes.is_empty() {
        previous.clone()
    } else {
        Arc::new(next)
    }
}

/// Reducer wiring every [`EntityActions`] creator to the adapter.
pub fn entity_reducer<T: Entity>(actions: &EntityActions) -> FeatureReducer<EntityState<T>> {
    let adapter = create_entity_adapter::<T>();

    macro_rules! handle {
        (
            $reducer:expr,
            $creator:expr,
            |$adapter:ident, $state:ident, $action:ident| $body:expr
        ) => {{
            let $adapter = adapter.clone();
            $reducer.try_on_arc(&$creator, move |$state: &Arc<EntityState<T>>, $action: &Action| {
                let next: EntityState<T> = $body;
                Ok(settle($state, next))
            })
        }};
    }

    let reducer = create_reducer(EntityState::<T>::default());
    let reducer = handle!(reducer, actions.add_one, |a, s, action| {
        a.add_one(s, action.payload_as::<T>()?)
    });
    let reducer = handle!(reducer, actions.add_many, |a, s, action| {
        a.add_many(s, action.payload_as::<Vec<T>>()?)
    });
    let reducer = handle!(reducer, actions.set_one, |a, s, action| {
        a.set_one(s, action.payload_as::<T>()?)
    });
    let reducer = handle!(reducer, actions.set_many, |a, s, action| {
        a.set_many(s, action.payload_as::<Vec<T>>()?)
    });
    let reducer = handle!(reducer, actions.set_all, |a, s, action| {
        a.set_all(s, action.payload_as::<Vec<T>>()?)
    });
    let reducer = handle!(reducer, actions.remove_one, |a, s, action| {
        a.remove_one(s, &action.payload_as::<String>()?)
    });
    let reducer = handle!(reducer, actions.remove_many, |a, s, action| {
        a.remove_many(s, action.payload_as::<Vec<String>>()?)
    });
    let reducer = handle!(reducer, actions.remove_all, |a, s, _action| a.remove_all(s));
    let reducer = handle!(reducer, actions.update_one, |a, s, action| {
        a.update_one(s, &action.payload_as::<EntityUpdate>()?)?
    });
    let reducer = handle!(reducer, actions.update_many, |a, s, action| {
        a.update_many(s, &action.payload_as::<Vec<EntityUpdate>>()?)?
    });
    let reducer = handle!(reducer, actions.upsert_one, |a, s, action| {
        a.upsert_one(s, action.payload_as::<T>()?)?
    });
    handle!(reducer, actions.upsert_many, |a, s, action| {
        a.upsert_many(s, action.payload_as::<Vec<T>>()?)?
    })
}
