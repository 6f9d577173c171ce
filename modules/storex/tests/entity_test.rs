//! Entity collections driven through a store, read with memoized selectors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use storex::{
    create_selector, entity_actions, entity_reducer, Entity, EntityActions, EntityState,
    EntityUpdate, ErrorKind, Selector, State, Store, StoreConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Todo {
    id: String,
    title: String,
    done: bool,
}

impl Entity for Todo {
    fn id(&self) -> String {
        self.id.clone()
    }
}

fn todo(id: &str, title: &str) -> Todo {
    Todo {
        id: id.to_string(),
        title: title.to_string(),
        done: false,
    }
}

fn todo_store() -> (Store, EntityActions) {
    let store = Store::new(StoreConfig::default()).unwrap();
    let actions = entity_actions(store.pool(), "todos");
    store
        .register_root([("todos", entity_reducer::<Todo>(&actions).build())])
        .unwrap();
    (store, actions)
}

fn todos(state: &State) -> Arc<EntityState<Todo>> {
    state.get::<EntityState<Todo>>("todos").unwrap()
}

#[tokio::test]
async fn collection_operations_flow_through_dispatch() {
    let (store, actions) = todo_store();

    store
        .dispatch(actions.add_many.with(&vec![todo("1", "write"), todo("2", "test")]).unwrap())
        .unwrap();
    store
        .dispatch(
            actions
                .update_one
                .with(&EntityUpdate {
                    id: "1".to_string(),
                    changes: json!({"done": true}),
                })
                .unwrap(),
        )
        .unwrap();
    store
        .dispatch(actions.remove_one.with(&"2").unwrap())
        .unwrap();

    let state = todos(&store.state());
    assert_eq!(state.ids(), ["1".to_string()]);
    assert!(state.get("1").unwrap().done);
    assert_eq!(
        store.snapshot(None),
        json!({
            "todos": {
                "ids": ["1"],
                "entities": {"1": {"id": "1", "title": "write", "done": true}}
            }
        })
    );
}

#[tokio::test]
async fn no_op_operations_publish_nothing() {
    let (store, actions) = todo_store();
    store
        .dispatch(actions.add_one.with(&todo("1", "write")).unwrap())
        .unwrap();
    let mut changes = store.subscribe();

    store
        .dispatch(actions.add_one.with(&todo("1", "ignored")).unwrap())
        .unwrap();
    store
        .dispatch(actions.remove_one.with(&"missing").unwrap())
        .unwrap();

    assert!(changes.try_recv().is_err());
    assert_eq!(todos(&store.state()).get("1").unwrap().title, "write");
}

#[tokio::test]
async fn malformed_update_is_a_reducer_error() {
    let (store, actions) = todo_store();
    store
        .dispatch(actions.add_one.with(&todo("1", "write")).unwrap())
        .unwrap();
    let mut errors = store.errors();

    let bad = actions.update_one.call(json!({"id": "1", "changes": "done"}));
    assert!(store.dispatch(bad).is_err());
    assert_eq!(errors.try_recv().unwrap().kind, ErrorKind::Reducer);
    assert!(!todos(&store.state()).get("1").unwrap().done);
}

#[tokio::test]
async fn memoized_selector_tracks_the_collection() {
    let (store, actions) = todo_store();
    let open_titles = create_selector(
        (|s: &State| s.get::<EntityState<Todo>>("todos"),),
        |(todos,): (Option<Arc<EntityState<Todo>>>,)| {
            todos.map_or_else(Vec::new, |todos| {
                todos
                    .all()
                    .iter()
                    .filter(|t| !t.done)
                    .map(|t| t.title.clone())
                    .collect::<Vec<_>>()
            })
        },
    );

    store
        .dispatch(actions.upsert_one.with(&todo("1", "write")).unwrap())
        .unwrap();
    assert_eq!(store.select_current(&open_titles), vec!["write".to_string()]);
    assert_eq!(store.select_current(&open_titles), vec!["write".to_string()]);
    assert_eq!(open_titles.recomputations(), 1);

    let finished = Todo {
        done: true,
        ..todo("1", "write")
    };
    store
        .dispatch(actions.upsert_one.with(&finished).unwrap())
        .unwrap();
    assert!(store.select_current(&open_titles).is_empty());
    assert_eq!(open_titles.recomputations(), 2);
}
