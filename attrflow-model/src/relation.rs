//! Relation reconciliation.
//!
//! Writing to a relation attribute never swaps the nested handle once it
//! exists: the incoming data is merged into the existing entity or
//! collection so listeners bound to it stay attached. Only the first write
//! instantiates the declared kind.

use crate::kind::Relation;
use crate::value::{Attributes, Value, attributes_from_json};
use crate::{Collection, Entity, SetOptions};
use serde_json::Value as Json;
use std::rc::Rc;
use tracing::debug;

/// Returns the value to store for `attr`.
///
/// Non-relation attributes pass through unchanged.
pub(crate) fn reconcile(owner: &Entity, attr: &str, value: Value, options: &SetOptions) -> Value {
    let Some(relation) = owner.kind().relation(attr).cloned() else {
        return value;
    };
    match owner.raw(attr) {
        Some(Value::Collection(existing)) => {
            if !matches!(&value, Value::Collection(incoming) if incoming.ptr_eq(&existing)) {
                merge_into_collection(&existing, value, options);
            }
            Value::Collection(existing)
        }
        Some(Value::Entity(existing)) => {
            if !matches!(&value, Value::Entity(incoming) if incoming.ptr_eq(&existing)) {
                if let Err(error) = existing.set(incoming_attributes(value), options) {
                    debug!(cid = %existing.cid(), attribute = attr, %error, "nested entity rejected merge");
                }
            }
            Value::Entity(existing)
        }
        _ => instantiate(owner, attr, &relation, value, options),
    }
}

/// Drops the parent link of a relation value about to be unset.
pub(crate) fn detach(owner: &Entity, attr: &str) {
    if owner.kind().relation(attr).is_none() {
        return;
    }
    match owner.raw(attr) {
        Some(Value::Entity(child)) => child.detach_parent(),
        Some(Value::Collection(collection)) => collection.detach_parent(),
        _ => {}
    }
}

fn instantiate(
    owner: &Entity,
    attr: &str,
    relation: &Relation,
    value: Value,
    options: &SetOptions,
) -> Value {
    let child_options = SetOptions::default().with_validate(options.validate);
    match relation {
        Relation::One(kind) => Value::Entity(Entity::with_parent(
            Rc::clone(kind),
            incoming_attributes(value),
            &child_options,
            owner,
            attr,
        )),
        Relation::Many(kind) => {
            let (models, _) = incoming_models(value);
            Value::Collection(Collection::with_parent(
                Rc::clone(kind),
                models,
                &child_options,
                owner,
                attr,
            ))
        }
    }
}

/// Identity-matches incoming models against the members.
///
/// A list merges matched members, removes unmatched members (including
/// those without an id) and adds unmatched candidates. A single object
/// keeps at most one member: the one sharing its id, which it merges into;
/// when nothing matches it is added as the only member.
fn merge_into_collection(existing: &Collection, value: Value, options: &SetOptions) {
    let id_attribute = existing.kind().model().id_attribute().to_owned();
    let (mut incoming, singular) = incoming_models(value);
    let identity = |attrs: &Attributes| -> Option<Json> {
        attrs
            .get(&id_attribute)
            .and_then(Value::as_json)
            .filter(|json| !json.is_null())
            .cloned()
    };

    if singular {
        let attrs = incoming.pop().unwrap_or_default();
        let wanted = identity(&attrs);
        let mut survivor = None;
        let mut doomed = Vec::new();
        for member in existing.models() {
            if survivor.is_none() && wanted.is_some() && member.id() == wanted {
                survivor = Some(member);
            } else {
                doomed.push(member);
            }
        }
        if !doomed.is_empty() {
            existing.remove(doomed, options);
        }
        match survivor {
            Some(member) => {
                if let Err(error) = member.set(attrs, options) {
                    debug!(cid = %member.cid(), %error, "collection member rejected merge");
                }
            }
            None => {
                existing.add(vec![attrs], options);
            }
        }
        return;
    }

    let mut doomed = Vec::new();
    for member in existing.models() {
        let position = member.id().and_then(|id| {
            incoming
                .iter()
                .position(|attrs| identity(attrs).as_ref() == Some(&id))
        });
        match position {
            Some(position) => {
                let attrs = incoming.remove(position);
                if let Err(error) = member.set(attrs, options) {
                    debug!(cid = %member.cid(), %error, "collection member rejected merge");
                }
            }
            None => doomed.push(member),
        }
    }
    if !doomed.is_empty() {
        existing.remove(doomed, options);
    }
    if !incoming.is_empty() {
        existing.add(incoming, options);
    }
}

fn incoming_attributes(value: Value) -> Attributes {
    match value {
        Value::Json(json) => attributes_from_json(json),
        Value::Entity(entity) => entity.attributes(),
        _ => Attributes::new(),
    }
}

/// Normalizes a collection relation write into attribute maps. The flag is
/// true for a single object.
fn incoming_models(value: Value) -> (Vec<Attributes>, bool) {
    match value {
        Value::Json(Json::Array(items)) => (
            items
                .into_iter()
                .filter(Json::is_object)
                .map(attributes_from_json)
                .collect(),
            false,
        ),
        Value::Json(json @ Json::Object(_)) => (vec![attributes_from_json(json)], true),
        Value::Entity(entity) => (vec![entity.attributes()], true),
        Value::Collection(collection) => (
            collection.models().iter().map(Entity::attributes).collect(),
            false,
        ),
        _ => (Vec::new(), false),
    }
}
