use attrflow_model::{
    ALL, Attributes, Emitter, Entity, EntityKind, Error, ModelEvent, Payload, SetOptions,
    ValidationError, Value, callback,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

fn record(target: &impl Emitter<Payload>) -> Log {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    target.on(
        ALL,
        callback(move |event: &ModelEvent| sink.borrow_mut().push(event.name().to_owned())),
    );
    log
}

fn counter_kind() -> Rc<EntityKind> {
    EntityKind::builder("counter")
        .defaults(json!({"a": 0}))
        .build()
        .unwrap()
}

fn person_kind() -> Rc<EntityKind> {
    EntityKind::builder("person")
        .validate(|attrs: &Attributes, _: &SetOptions| {
            match attrs.get("age").and_then(Value::as_i64) {
                Some(age) if age < 0 => Err(ValidationError::new("age must be positive").on("age")),
                _ => Ok(()),
            }
        })
        .build()
        .unwrap()
}

// ── Construction ─────────────────────────────────────────────────

#[test]
fn new_applies_defaults_then_attributes() {
    let entity = Entity::new(counter_kind(), json!({"b": 2}), &SetOptions::default());
    assert_eq!(entity.to_json(), json!({"a": 0, "b": 2}));
    assert!(!entity.has_changed(None));
}

#[test]
fn defaults_are_copied_per_entity() {
    let kind = EntityKind::builder("list")
        .defaults(json!({"tags": []}))
        .build()
        .unwrap();
    let first = Entity::new(Rc::clone(&kind), json!({}), &SetOptions::default());
    let second = Entity::new(kind, json!({}), &SetOptions::default());
    first.set(json!({"tags": ["x"]}), &SetOptions::default()).unwrap();
    assert_eq!(second.get_json("tags"), Some(json!([])));
}

#[test]
fn cids_are_unique_and_prefixed() {
    let kind = EntityKind::builder("note").cid_prefix("n").build().unwrap();
    let a = Entity::new(Rc::clone(&kind), json!({}), &SetOptions::default());
    let b = Entity::new(kind, json!({}), &SetOptions::default());
    assert_ne!(a.cid(), b.cid());
    assert!(a.cid().as_str().starts_with('n'));
}

#[test]
fn id_follows_identity_attribute() {
    let kind = EntityKind::builder("doc").id_attribute("_id").build().unwrap();
    let entity = Entity::new(kind, json!({"id": 1}), &SetOptions::default());
    assert!(entity.is_new());
    entity.set(json!({"_id": "d-1"}), &SetOptions::default()).unwrap();
    assert_eq!(entity.id(), Some(json!("d-1")));
    assert!(!entity.is_new());
}

// ── set / change events ──────────────────────────────────────────

#[test]
fn set_records_changes_and_fires_attribute_events_before_change() {
    let entity = Entity::new(counter_kind(), json!({}), &SetOptions::default());
    let log = record(&entity);
    entity.set(json!({"a": 1, "b": 2}), &SetOptions::default()).unwrap();

    assert_eq!(*log.borrow(), vec!["change:a", "change:b", "change"]);
    let changed = entity.changed();
    assert_eq!(changed.len(), 2);
    assert_eq!(changed["a"], Some(Value::from(1)));
    assert_eq!(changed["b"], Some(Value::from(2)));
}

#[test]
fn attribute_event_carries_new_value() {
    let entity = Entity::plain(json!({}));
    let seen = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen);
    entity.on(
        "change:title",
        callback(move |event| *sink.borrow_mut() = event.payload().value().cloned()),
    );
    entity.set(json!({"title": "draft"}), &SetOptions::default()).unwrap();
    assert_eq!(*seen.borrow(), Some(Value::from("draft")));
}

#[test]
fn unchanged_set_fires_nothing() {
    let entity = Entity::new(counter_kind(), json!({}), &SetOptions::default());
    let log = record(&entity);
    entity.set(json!({"a": 0}), &SetOptions::default()).unwrap();
    assert!(log.borrow().is_empty());
    assert!(!entity.has_changed(None));
}

#[test]
fn silent_set_updates_state_without_events() {
    let entity = Entity::new(counter_kind(), json!({}), &SetOptions::default());
    let log = record(&entity);
    entity.set(json!({"a": 5}), &SetOptions::silent()).unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(entity.get_json("a"), Some(json!(5)));
    assert!(entity.has_changed(Some("a")));
}

#[test]
fn previous_reports_values_before_last_transaction() {
    let entity = Entity::new(counter_kind(), json!({}), &SetOptions::default());
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();
    assert_eq!(entity.previous("a"), Some(Value::from(0)));
    assert_eq!(entity.previous_attributes().len(), 1);
}

#[test]
fn changed_attributes_diffs_against_current_state() {
    let entity = Entity::plain(json!({"a": 1, "b": 2}));
    let diff = json!({"a": 1, "b": 3}).as_object().cloned().unwrap();
    let diff: Attributes = diff.into_iter().map(|(k, v)| (k, Value::Json(v))).collect();
    let changes = entity.changed_attributes(Some(&diff)).unwrap();
    assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["b"]);
    assert!(entity.changed_attributes(None).is_none());
}

#[test]
fn listener_set_during_attribute_event_coalesces_into_one_change() {
    let entity = Entity::plain(json!({}));
    let log = record(&entity);
    let handle = entity.clone();
    entity.on(
        "change:a",
        callback(move |_| {
            handle.set(json!({"b": 1}), &SetOptions::default()).unwrap();
        }),
    );
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();

    let changes = log.borrow().iter().filter(|name| *name == "change").count();
    assert_eq!(changes, 1);
    assert!(entity.has_changed(Some("a")));
    assert!(entity.has_changed(Some("b")));
}

#[test]
fn listener_set_during_change_fires_another_change() {
    let entity = Entity::plain(json!({}));
    let external = Rc::new(Cell::new(0));
    let observed = Rc::clone(&external);
    entity.on("change", callback(move |_| observed.set(observed.get() + 1)));
    let count = Rc::new(Cell::new(0));
    let handle = entity.clone();
    let seen = Rc::clone(&count);
    entity.on(
        "change",
        callback(move |_| {
            seen.set(seen.get() + 1);
            if seen.get() == 1 {
                handle.set(json!({"b": 1}), &SetOptions::default()).unwrap();
            }
        }),
    );
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();
    assert_eq!(count.get(), 2);
    // One `change` round per pending batch; earlier listeners see both.
    assert_eq!(external.get(), 2);
    assert_eq!(entity.get_json("b"), Some(json!(1)));
}

// ── unset / clear ────────────────────────────────────────────────

#[test]
fn unset_deletes_and_reports_no_value() {
    let entity = Entity::plain(json!({"a": 1}));
    let log = record(&entity);
    entity.unset("a", &SetOptions::default()).unwrap();
    assert_eq!(*log.borrow(), vec!["change:a", "change"]);
    assert!(entity.get("a").is_none());
    assert_eq!(entity.changed().get("a"), Some(&None));
}

#[test]
fn unset_missing_attribute_is_noop() {
    let entity = Entity::plain(json!({}));
    let log = record(&entity);
    entity.unset("ghost", &SetOptions::default()).unwrap();
    assert!(log.borrow().is_empty());
}

#[test]
fn clear_removes_every_attribute() {
    let entity = Entity::plain(json!({"a": 1, "b": "x"}));
    entity.clear(&SetOptions::default()).unwrap();
    assert_eq!(entity.to_json(), json!({}));
    assert!(entity.keys().is_empty());
}

// ── Paths ────────────────────────────────────────────────────────

#[test]
fn get_walks_json_objects_and_arrays() {
    let entity = Entity::plain(json!({"meta": {"author": {"name": "Ann"}}, "tags": ["a", "b"]}));
    assert_eq!(entity.get_json("meta.author.name"), Some(json!("Ann")));
    assert_eq!(entity.get_json("tags#1"), Some(json!("b")));
    assert_eq!(entity.get_json("tags.0"), Some(json!("a")));
    assert!(entity.get("meta.missing.deeper").is_none());
    assert!(entity.get("").is_none());
}

#[test]
fn set_key_expands_dotted_keys() {
    let entity = Entity::plain(json!({}));
    let log = record(&entity);
    entity
        .set_key("meta.author", "Ann", &SetOptions::default())
        .unwrap();
    assert_eq!(entity.to_json(), json!({"meta": {"author": "Ann"}}));
    assert_eq!(*log.borrow(), vec!["change:meta", "change"]);
}

#[test]
fn has_treats_null_as_absent() {
    let entity = Entity::plain(json!({"a": null, "b": false}));
    assert!(!entity.has("a"));
    assert!(entity.has("b"));
    assert!(!entity.has("c"));
}

#[test]
fn matches_compares_paths() {
    let entity = Entity::plain(json!({"kind": "task", "meta": {"done": true}}));
    let mut wanted = Attributes::new();
    wanted.insert("kind".into(), Value::from("task"));
    wanted.insert("meta.done".into(), Value::from(true));
    assert!(entity.matches(&wanted));
    wanted.insert("kind".into(), Value::from("note"));
    assert!(!entity.matches(&wanted));
}

// ── Validation ───────────────────────────────────────────────────

#[test]
fn validation_runs_only_when_requested() {
    let entity = Entity::new(person_kind(), json!({}), &SetOptions::default());
    entity.set(json!({"age": -1}), &SetOptions::default()).unwrap();
    assert_eq!(entity.get_json("age"), Some(json!(-1)));
    assert!(!entity.is_valid());
}

#[test]
fn failed_validation_writes_nothing_and_fires_invalid() {
    let entity = Entity::new(person_kind(), json!({"age": 30}), &SetOptions::default());
    let log = record(&entity);
    let result = entity.set(json!({"age": -4}), &SetOptions::validated());

    assert!(matches!(result, Err(Error::Invalid(ref e)) if e.attribute.as_deref() == Some("age")));
    assert_eq!(entity.get_json("age"), Some(json!(30)));
    assert_eq!(*log.borrow(), vec!["invalid"]);
    assert_eq!(
        entity.validation_error().map(|e| e.message),
        Some("age must be positive".to_owned())
    );
}

#[test]
fn passing_validation_clears_previous_error() {
    let entity = Entity::new(person_kind(), json!({}), &SetOptions::default());
    let _ = entity.set(json!({"age": -1}), &SetOptions::validated());
    entity.set(json!({"age": 1}), &SetOptions::validated()).unwrap();
    assert!(entity.validation_error().is_none());
}

#[test]
fn invalid_initial_attributes_leave_entity_empty() {
    let entity = Entity::new(person_kind(), json!({"age": -2}), &SetOptions::validated());
    assert!(entity.get("age").is_none());
    assert!(entity.validation_error().is_some());
}

// ── Snapshots ────────────────────────────────────────────────────

#[test]
fn to_json_skips_opaque_values() {
    let entity = Entity::plain(json!({"a": 1}));
    entity
        .set([("handle", Value::opaque(42_u8))], &SetOptions::default())
        .unwrap();
    assert_eq!(entity.to_json(), json!({"a": 1}));
    assert_eq!(entity.get("handle").unwrap().downcast_ref::<u8>(), Some(&42));
}

#[test]
fn compact_json_omits_defaults() {
    let entity = Entity::new(counter_kind(), json!({"b": 1}), &SetOptions::default());
    assert_eq!(entity.to_compact_json(), json!({"b": 1}));
    entity.set(json!({"a": 3}), &SetOptions::default()).unwrap();
    assert_eq!(entity.to_compact_json(), json!({"a": 3, "b": 1}));
}

#[test]
fn duplicate_is_independent() {
    let entity = Entity::new(counter_kind(), json!({"a": 1}), &SetOptions::default());
    let copy = entity.duplicate();
    copy.set(json!({"a": 2}), &SetOptions::default()).unwrap();
    assert_eq!(entity.get_json("a"), Some(json!(1)));
    assert!(!copy.ptr_eq(&entity));
    assert_ne!(copy.cid(), entity.cid());
}

// ── Extras ───────────────────────────────────────────────────────

#[test]
fn subscribe_fires_for_watched_keys_only() {
    let entity = Entity::plain(json!({}));
    let hits = Rc::new(Cell::new(0));
    let seen = Rc::clone(&hits);
    let listener = entity.subscribe("a b", move |_| seen.set(seen.get() + 1));

    entity.set(json!({"c": 1}), &SetOptions::default()).unwrap();
    entity.set(json!({"b": 1}), &SetOptions::default()).unwrap();
    assert_eq!(hits.get(), 1);

    entity.off(Some("change"), Some(&listener), None);
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn destroy_fires_destroy_with_entity() {
    let entity = Entity::plain(json!({"id": 1}));
    let destroyed = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&destroyed);
    entity.on(
        "destroy",
        callback(move |event| *sink.borrow_mut() = event.payload().entity()),
    );
    entity.destroy();
    assert!(destroyed.borrow().as_ref().is_some_and(|e| e.ptr_eq(&entity)));
}

#[test]
fn root_of_detached_entity_is_itself() {
    let entity = Entity::plain(json!({}));
    assert!(entity.parent().is_none());
    assert!(entity.root().as_entity().is_some_and(|e| e.ptr_eq(&entity)));
}

#[test]
fn accessor_reads_and_writes() {
    let entity = Entity::plain(json!({"title": "a"}));
    let view = entity.accessor();
    assert_eq!(view.get("title"), Some(Value::from("a")));
    view.set("meta.pages", 3).unwrap();
    assert_eq!(entity.get_json("meta.pages"), Some(json!(3)));
    assert!(view.has("meta"));
    view.delete("title").unwrap();
    assert!(!view.has("title"));
    assert_eq!(view.keys(), vec!["meta".to_owned()]);
}

#[test]
fn accessor_treats_null_as_absent() {
    let entity = Entity::plain(json!({"note": null, "title": "a"}));
    let view = entity.accessor();
    assert!(!view.has("note"));
    assert_eq!(view.has("note"), entity.has("note"));
    assert!(view.has("title"));
}
