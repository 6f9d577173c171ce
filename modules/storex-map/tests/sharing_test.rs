//! Structural sharing and collision handling through the public API.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use storex_map::PersistentMap;

// ---------------------------------------------------------------------------
// Keys that always hash the same, forcing collision buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Colliding(u32);

impl Hash for Colliding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        0u8.hash(state);
    }
}

#[test]
fn colliding_keys_are_kept_apart() {
    let map: PersistentMap<Colliding, u32> =
        (0..10).map(|i| (Colliding(i), i * 100)).collect();

    assert_eq!(map.len(), 10);
    for i in 0..10 {
        assert_eq!(map.get(&Colliding(i)), Some(&(i * 100)));
    }

    let trimmed = (0..9).fold(map.clone(), |m, i| m.remove(&Colliding(i)));
    assert_eq!(trimmed.len(), 1);
    assert_eq!(trimmed.get(&Colliding(9)), Some(&900));
    assert_eq!(map.len(), 10, "original version must not change");
}

#[test]
fn overwrite_in_collision_bucket_keeps_len() {
    let map: PersistentMap<Colliding, &str> = PersistentMap::new()
        .insert(Colliding(1), "a")
        .insert(Colliding(2), "b");
    let map = map.insert(Colliding(1), "z");
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&Colliding(1)), Some(&"z"));
}

// ---------------------------------------------------------------------------
// Sharing
// ---------------------------------------------------------------------------

#[test]
fn untouched_values_are_shared_by_reference() {
    let a: PersistentMap<String, Arc<Vec<u8>>> = PersistentMap::new()
        .insert("counter".into(), Arc::new(vec![1]))
        .insert("todos".into(), Arc::new(vec![2]));

    let b = a.insert("counter".into(), Arc::new(vec![3]));

    assert!(Arc::ptr_eq(
        a.get("todos").unwrap(),
        b.get("todos").unwrap()
    ));
    assert!(!Arc::ptr_eq(
        a.get("counter").unwrap(),
        b.get("counter").unwrap()
    ));
    assert_eq!(**a.get("counter").unwrap(), vec![1]);
}

#[test]
fn keys_and_values_cover_every_entry() {
    let map: PersistentMap<u32, u32> = (0..100).map(|i| (i, i + 1)).collect();
    let mut keys: Vec<u32> = map.keys().copied().collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..100).collect::<Vec<_>>());
    assert_eq!(map.values().map(|v| *v as u64).sum::<u64>(), (1..=100).sum::<u64>());
}

#[test]
fn serializes_as_json_object() {
    let map: PersistentMap<String, i32> = PersistentMap::new().insert("count".into(), 3);
    let json = serde_json::to_value(&map).unwrap();
    assert_eq!(json, serde_json::json!({ "count": 3 }));
}
