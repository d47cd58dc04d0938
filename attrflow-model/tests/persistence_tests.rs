use attrflow_model::{
    ALL, Emitter, Entity, EntityKind, Error, MemoryStore, Mirror, PersistencePort, Result,
    SetOptions,
};
use pretty_assertions::assert_eq;
use serde_json::{Value as Json, json};
use std::cell::Cell;
use std::rc::Rc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn stored(store: &MemoryStore, key: &str) -> Option<Json> {
    store
        .get(key)
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

/// Port that counts writes and can be switched to fail.
#[derive(Default)]
struct FlakyPort {
    inner: MemoryStore,
    writes: Cell<usize>,
    failing: Cell<bool>,
}

impl PersistencePort for FlakyPort {
    fn load(&self, key: &str) -> Option<String> {
        self.inner.load(key)
    }

    fn store(&self, key: &str, data: &str) -> Result<()> {
        if self.failing.get() {
            return Err(Error::Persistence("disk full".into()));
        }
        self.writes.set(self.writes.get() + 1);
        self.inner.store(key, data)
    }
}

// ── Restore ──────────────────────────────────────────────────────

#[test]
fn open_restores_stored_snapshot() {
    let store = MemoryStore::new();
    store.insert("prefs", r#"{"theme":"dark","size":12}"#);
    let entity = Entity::plain(json!({"theme": "light"}));

    let mirror = Mirror::open(&entity, Rc::new(store.clone()), "prefs");

    assert_eq!(entity.to_json(), json!({"theme": "dark", "size": 12}));
    assert!(!mirror.is_dirty());
    assert_eq!(mirror.key(), "prefs");
}

#[test]
fn open_without_snapshot_leaves_entity_alone() {
    let store = MemoryStore::new();
    let entity = Entity::plain(json!({"theme": "light"}));
    let mirror = Mirror::open(&entity, Rc::new(store.clone()), "prefs");
    assert_eq!(entity.to_json(), json!({"theme": "light"}));
    assert!(!mirror.flush().unwrap());
    assert!(store.is_empty());
}

#[test]
fn malformed_snapshot_is_ignored() {
    init_tracing();
    let store = MemoryStore::new();
    store.insert("prefs", "{not json");
    let entity = Entity::plain(json!({"theme": "light"}));
    let _mirror = Mirror::open(&entity, Rc::new(store), "prefs");
    assert_eq!(entity.to_json(), json!({"theme": "light"}));
}

// ── Flush ────────────────────────────────────────────────────────

#[test]
fn burst_of_changes_stores_once() {
    let port = Rc::new(FlakyPort::default());
    let entity = Entity::plain(json!({}));
    let mirror = Mirror::open(&entity, Rc::clone(&port) as Rc<dyn PersistencePort>, "doc");

    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();
    entity.set(json!({"b": 2}), &SetOptions::default()).unwrap();
    assert!(mirror.is_dirty());

    assert!(mirror.flush().unwrap());
    assert!(!mirror.flush().unwrap());
    assert_eq!(port.writes.get(), 1);
    assert_eq!(stored(&port.inner, "doc"), Some(json!({"a": 1, "b": 2})));
}

#[test]
fn silent_changes_do_not_dirty() {
    let store = MemoryStore::new();
    let entity = Entity::plain(json!({}));
    let mirror = Mirror::open(&entity, Rc::new(store), "doc");
    entity.set(json!({"a": 1}), &SetOptions::silent()).unwrap();
    assert!(!mirror.is_dirty());
}

#[test]
fn failed_store_keeps_mirror_dirty() {
    init_tracing();
    let port = Rc::new(FlakyPort::default());
    port.failing.set(true);
    let entity = Entity::plain(json!({}));
    let mirror = Mirror::open(&entity, Rc::clone(&port) as Rc<dyn PersistencePort>, "doc");
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();

    assert!(matches!(mirror.flush(), Err(Error::Persistence(_))));
    assert!(mirror.is_dirty());

    port.failing.set(false);
    assert!(mirror.flush().unwrap());
    assert_eq!(stored(&port.inner, "doc"), Some(json!({"a": 1})));
}

// ── Close ────────────────────────────────────────────────────────

#[test]
fn close_flushes_and_stops_tracking() {
    let port = Rc::new(FlakyPort::default());
    let entity = Entity::plain(json!({}));
    let mirror = Mirror::open(&entity, Rc::clone(&port) as Rc<dyn PersistencePort>, "doc");
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();

    mirror.close().unwrap();
    assert_eq!(port.writes.get(), 1);

    entity.set(json!({"a": 2}), &SetOptions::default()).unwrap();
    assert_eq!(stored(&port.inner, "doc"), Some(json!({"a": 1})));
}

#[test]
fn nested_changes_dirty_the_root_mirror() {
    let child = EntityKind::builder("child").build().unwrap();
    let kind = EntityKind::builder("doc").has_one("meta", child).build().unwrap();
    let entity = Entity::new(kind, json!({"meta": {"rev": 1}}), &SetOptions::default());
    let store = MemoryStore::new();
    let mirror = Mirror::open(&entity, Rc::new(store.clone()), "doc");

    let meta = entity
        .get("meta")
        .and_then(|value| value.as_entity().cloned())
        .unwrap();
    meta.set(json!({"rev": 2}), &SetOptions::default()).unwrap();

    assert!(mirror.flush().unwrap());
    assert_eq!(stored(&store, "doc"), Some(json!({"meta": {"rev": 2}})));
}

#[test]
fn dropping_a_mirror_unbinds_its_listener() {
    let store = MemoryStore::new();
    let entity = Entity::plain(json!({}));
    let before = entity.listener_count(ALL);

    let mirror = Mirror::open(&entity, Rc::new(store.clone()), "doc");
    assert_eq!(entity.listener_count(ALL), before + 1);
    drop(mirror);

    assert_eq!(entity.listener_count(ALL), before);
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();
    assert!(store.is_empty());
}
