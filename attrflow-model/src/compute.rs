//! Computed attributes.
//!
//! A [`Compute`] derives a value from an ordered list of dependency paths.
//! It is never stored in an entity's attributes: reads evaluate the getter
//! against the current dependency values, writes go through the optional
//! setter which returns the dependency attributes to store instead.
//!
//! At construction every entity subscribes each compute to
//! `change:<dependency>` on itself. Inside a change transaction the
//! notifications are queued and announced once, after the per-attribute
//! events of the outer `set`; outside a transaction they are announced
//! immediately, followed by an aggregate `change`.

use crate::event::callback;
use crate::value::{Attributes, Value};
use crate::Entity;
use attrflow_events::Emitter;
use serde_json::Value as Json;
use std::fmt;
use std::rc::Rc;

/// Derives a compute's value from its dependency values (in declaration
/// order; `None` for dependencies that do not resolve).
pub type ComputeGetter = Rc<dyn Fn(&[Option<Value>]) -> Option<Value>>;

/// Turns a value written to a compute into dependency attributes. `None`
/// skips the write.
pub type ComputeSetter = Rc<dyn Fn(&Value) -> Option<Attributes>>;

/// A declarative, dependency-tracked derived attribute.
#[derive(Clone)]
pub struct Compute {
    dependencies: Vec<String>,
    get: ComputeGetter,
    set: Option<ComputeSetter>,
}

impl Compute {
    /// Creates a read-only compute.
    pub fn new<I, S, F>(dependencies: I, get: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[Option<Value>]) -> Option<Value> + 'static,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            get: Rc::new(get),
            set: None,
        }
    }

    /// Creates a compute over plain JSON dependencies. Missing or non-JSON
    /// dependencies are passed as `null`.
    pub fn from_json<I, S, F>(dependencies: I, get: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[Json]) -> Json + 'static,
    {
        Self::new(dependencies, move |args: &[Option<Value>]| {
            let json: Vec<Json> = args
                .iter()
                .map(|arg| arg.as_ref().and_then(Value::as_json).cloned().unwrap_or(Json::Null))
                .collect();
            Some(Value::Json(get(&json)))
        })
    }

    /// Makes the compute writable.
    #[must_use]
    pub fn with_setter<F>(mut self, set: F) -> Self
    where
        F: Fn(&Value) -> Option<Attributes> + 'static,
    {
        self.set = Some(Rc::new(set));
        self
    }

    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }

    pub(crate) fn evaluate(&self, args: &[Option<Value>]) -> Option<Value> {
        (self.get)(args)
    }

    pub(crate) fn apply_set(&self, value: &Value) -> Option<Attributes> {
        self.set.as_ref().and_then(|set| set(value))
    }
}

impl fmt::Debug for Compute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compute")
            .field("dependencies", &self.dependencies)
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Subscribes every compute of the entity's kind to its dependencies.
pub(crate) fn bind(entity: &Entity) {
    let kind = Rc::clone(entity.kind());
    for (name, compute) in kind.computes() {
        for dependency in compute.dependencies() {
            let weak = entity.downgrade();
            let name = name.clone();
            let dependency_name = dependency.clone();
            entity.bus().on(
                &format!("change:{dependency}"),
                callback(move |_| {
                    let Some(entity) = weak.upgrade() else {
                        return;
                    };
                    if entity.is_changing() {
                        entity.queue_compute(&name, &dependency_name);
                    } else {
                        announce(&entity, &name, std::slice::from_ref(&dependency_name));
                        entity.trigger_change();
                    }
                }),
            );
        }
    }
}

/// Publishes a compute change.
///
/// Nested entity dependencies among `fired` fan out one
/// `change:<compute>.<subkey>` per changed subkey and leave the compute's
/// own entry in `changed` without a value; otherwise the entry holds the
/// freshly derived value. `change:<compute>` fires last.
pub(crate) fn announce(entity: &Entity, name: &str, fired: &[String]) {
    if entity.kind().compute(name).is_none() {
        return;
    }
    let mut nested = false;
    for dependency in fired {
        match entity.get(dependency) {
            Some(Value::Entity(child)) => {
                nested = true;
                for (subkey, value) in child.changed() {
                    let compound = format!("{name}.{subkey}");
                    entity.record_change(&compound, value.clone());
                    entity.trigger_attribute(&compound, value);
                }
            }
            Some(Value::Collection(_)) => nested = true,
            _ => {}
        }
    }
    let value = entity.get(name);
    entity.record_change(name, if nested { None } else { value.clone() });
    entity.trigger_attribute(name, value);
}
