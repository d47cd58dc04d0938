use attrflow_model::{
    ALL, Attributes, Compute, Emitter, Entity, EntityKind, Error, ModelEvent, Payload, SetOptions,
    Value, callback,
};
use pretty_assertions::assert_eq;
use serde_json::{Value as Json, json};
use std::cell::RefCell;
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

fn full_name() -> Compute {
    Compute::from_json(["first", "last"], |args: &[Json]| {
        let parts: Vec<&str> = args.iter().filter_map(Json::as_str).collect();
        Json::from(parts.join(" "))
    })
}

fn writable_full_name() -> Compute {
    full_name().with_setter(|value: &Value| {
        let text = value.as_str()?;
        let (first, last) = text.split_once(' ')?;
        let mut attrs = Attributes::new();
        attrs.insert("first".into(), Value::from(first));
        attrs.insert("last".into(), Value::from(last));
        Some(attrs)
    })
}

fn person(compute: Compute) -> Entity {
    let kind = EntityKind::builder("person")
        .compute("fullName", compute)
        .build()
        .unwrap();
    Entity::new(kind, json!({"first": "Ada", "last": "Lovelace"}), &SetOptions::default())
}

// ── Reads ────────────────────────────────────────────────────────

#[test]
fn compute_is_derived_on_read() {
    let entity = person(full_name());
    assert_eq!(entity.get_json("fullName"), Some(json!("Ada Lovelace")));
    entity.set(json!({"first": "Augusta"}), &SetOptions::default()).unwrap();
    assert_eq!(entity.get_json("fullName"), Some(json!("Augusta Lovelace")));
}

#[test]
fn compute_is_not_stored() {
    let entity = person(full_name());
    assert_eq!(entity.to_json(), json!({"first": "Ada", "last": "Lovelace"}));
    assert!(!entity.keys().contains(&"fullName".to_owned()));
}

// ── Change events ────────────────────────────────────────────────

#[test]
fn compute_change_fires_once_per_set() {
    let entity = person(full_name());
    let log = record(&entity);
    entity
        .set(json!({"first": "Grace", "last": "Hopper"}), &SetOptions::default())
        .unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["change:first", "change:last", "change:fullName", "change"]
    );
    assert_eq!(
        entity.changed().get("fullName"),
        Some(&Some(Value::from("Grace Hopper")))
    );
}

#[test]
fn unrelated_write_does_not_announce_compute() {
    let entity = person(full_name());
    let log = record(&entity);
    entity.set(json!({"age": 36}), &SetOptions::default()).unwrap();
    assert_eq!(*log.borrow(), vec!["change:age", "change"]);
}

#[test]
fn silent_write_does_not_announce_compute() {
    let entity = person(full_name());
    let log = record(&entity);
    entity.set(json!({"first": "X"}), &SetOptions::silent()).unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(entity.get_json("fullName"), Some(json!("X Lovelace")));
}

// ── Writes ───────────────────────────────────────────────────────

#[test]
fn writable_compute_routes_to_dependencies() {
    let entity = person(writable_full_name());
    let log = record(&entity);
    entity
        .set(json!({"fullName": "Alan Turing"}), &SetOptions::default())
        .unwrap();
    assert_eq!(entity.to_json(), json!({"first": "Alan", "last": "Turing"}));
    assert_eq!(
        *log.borrow(),
        vec!["change:first", "change:last", "change:fullName", "change"]
    );
}

#[test]
fn setter_returning_none_skips_write() {
    let entity = person(writable_full_name());
    entity
        .set(json!({"fullName": "Plato"}), &SetOptions::default())
        .unwrap();
    assert_eq!(entity.get_json("fullName"), Some(json!("Ada Lovelace")));
}

#[test]
fn read_only_compute_write_is_ignored() {
    let entity = person(full_name());
    let log = record(&entity);
    entity
        .set(json!({"fullName": "Someone Else"}), &SetOptions::default())
        .unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(entity.get_json("fullName"), Some(json!("Ada Lovelace")));
}

// ── Declaration checks ───────────────────────────────────────────

#[test]
fn compute_conflicting_with_default_is_rejected() {
    let result = EntityKind::builder("person")
        .default("fullName", "x")
        .compute("fullName", full_name())
        .build();
    assert!(matches!(result, Err(Error::ComputeConflict(ref name)) if name == "fullName"));
}

#[test]
fn compute_cycle_is_rejected() {
    let result = EntityKind::builder("loop")
        .compute("a", Compute::from_json(["b"], |args: &[Json]| args[0].clone()))
        .compute("b", Compute::from_json(["a.inner"], |args: &[Json]| args[0].clone()))
        .build();
    assert!(matches!(result, Err(Error::ComputeCycle(_))));
}

#[test]
fn computes_may_build_on_each_other() {
    let kind = EntityKind::builder("person")
        .compute("fullName", full_name())
        .compute(
            "greeting",
            Compute::from_json(["fullName"], |args: &[Json]| {
                Json::from(format!("Hello, {}", args[0].as_str().unwrap_or("?")))
            }),
        )
        .build()
        .unwrap();
    let entity = Entity::new(kind, json!({"first": "Ada", "last": "L"}), &SetOptions::default());
    assert_eq!(entity.get_json("greeting"), Some(json!("Hello, Ada L")));
}

// ── Nested dependencies ──────────────────────────────────────────

fn with_child(compute_name: &str, compute: Compute) -> (Entity, Entity) {
    let child = EntityKind::builder("child").build().unwrap();
    let kind = EntityKind::builder("root")
        .has_one("child", child)
        .compute(compute_name, compute)
        .build()
        .unwrap();
    let root = Entity::new(kind, json!({"child": {"x": 1}}), &SetOptions::default());
    let child = root
        .get("child")
        .and_then(|value| value.as_entity().cloned())
        .unwrap();
    (root, child)
}

#[test]
fn compute_over_nested_path_follows_child_changes() {
    let (root, child) = with_child(
        "childX",
        Compute::new(["child.x"], |args: &[Option<Value>]| args[0].clone()),
    );
    let log = record(&root);
    child.set(json!({"x": 3}), &SetOptions::default()).unwrap();
    assert_eq!(root.get_json("childX"), Some(json!(3)));
    assert_eq!(
        *log.borrow(),
        vec!["change:child.x", "change:child", "change:childX", "change"]
    );
}

#[test]
fn compute_over_nested_entity_fans_out_subkeys() {
    let (root, child) = with_child(
        "summary",
        Compute::new(["child"], |args: &[Option<Value>]| {
            let child = args[0].as_ref()?.as_entity()?;
            child.get("x")
        }),
    );
    let log = record(&root);
    child.set(json!({"x": 4}), &SetOptions::default()).unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            "change:child.x",
            "change:child",
            "change:summary.x",
            "change:summary",
            "change"
        ]
    );
    let changed = root.changed();
    assert_eq!(changed.get("summary.x"), Some(&Some(Value::from(4))));
    assert_eq!(changed.get("summary"), Some(&None));
}

#[test]
fn dependency_event_outside_transaction_announces_immediately() {
    let entity = person(full_name());
    let log = record(&entity);
    entity.trigger("change:first", Payload::Custom(json!(null)));
    // Named listeners run before the wildcard recorder, so the compute's
    // events land first.
    assert_eq!(
        *log.borrow(),
        vec!["change:fullName", "change", "change:first"]
    );
}
