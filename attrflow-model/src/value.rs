//! Attribute values.
//!
//! An attribute holds plain JSON, a nested [`Entity`], a nested
//! [`Collection`], or an opaque host value. JSON compares by deep equality;
//! the other variants compare by identity.

use crate::{Collection, Entity};
use serde_json::{Map, Value as Json};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Attribute name → value.
pub type Attributes = BTreeMap<String, Value>;

/// Attribute name → value recorded by change tracking. `None` marks an
/// attribute that changed to "no value" (unset, or a nested compute).
pub type Changes = BTreeMap<String, Option<Value>>;

/// A single attribute value.
#[derive(Clone)]
pub enum Value {
    /// Scalars, plain objects and arrays.
    Json(Json),
    /// A nested entity.
    Entity(Entity),
    /// A nested collection.
    Collection(Collection),
    /// A host value with no JSON form. Dropped from snapshots.
    Opaque(Rc<dyn Any>),
}

impl Value {
    /// JSON `null`.
    #[must_use]
    pub fn null() -> Self {
        Self::Json(Json::Null)
    }

    /// Wraps an arbitrary host value.
    pub fn opaque<T: Any>(value: T) -> Self {
        Self::Opaque(Rc::new(value))
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Self::Json(json) => Some(json),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Json::as_str)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(Json::as_i64)
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(Json::as_f64)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(Json::as_bool)
    }

    #[must_use]
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Self::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// Downcasts an opaque value.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(any) => any.downcast_ref(),
            _ => None,
        }
    }

    /// True for JSON `null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Json(Json::Null))
    }

    /// True for nested entities and collections.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        matches!(self, Self::Entity(_) | Self::Collection(_))
    }

    /// Structural snapshot. Nested entities and collections serialize
    /// recursively; opaque values have no snapshot.
    #[must_use]
    pub fn to_json(&self) -> Option<Json> {
        match self {
            Self::Json(json) => Some(json.clone()),
            Self::Entity(entity) => Some(entity.to_json()),
            Self::Collection(collection) => Some(collection.to_json()),
            Self::Opaque(_) => None,
        }
    }

    /// Like [`to_json`](Self::to_json), compacting nested entities.
    #[must_use]
    pub fn to_compact_json(&self) -> Option<Json> {
        match self {
            Self::Entity(entity) => Some(entity.to_compact_json()),
            Self::Collection(collection) => Some(collection.to_compact_json()),
            other => other.to_json(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => a.ptr_eq(b),
            (Self::Collection(a), Self::Collection(b)) => a.ptr_eq(b),
            (Self::Opaque(a), Self::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq<Json> for Value {
    fn eq(&self, other: &Json) -> bool {
        self.as_json() == Some(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(json) => write!(f, "{json}"),
            Self::Entity(entity) => fmt::Debug::fmt(entity, f),
            Self::Collection(collection) => fmt::Debug::fmt(collection, f),
            Self::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Self::Json(json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Json(Json::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Json(Json::from(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Json(Json::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Json(Json::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Json(Json::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Json(Json::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Json(Json::from(b))
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl From<Collection> for Value {
    fn from(collection: Collection) -> Self {
        Self::Collection(collection)
    }
}

/// Anything that can be normalized into a flat attribute map.
pub trait IntoAttributes {
    fn into_attributes(self) -> Attributes;
}

impl IntoAttributes for Attributes {
    fn into_attributes(self) -> Attributes {
        self
    }
}

/// JSON objects map key by key; any other JSON value yields no attributes.
impl IntoAttributes for Json {
    fn into_attributes(self) -> Attributes {
        attributes_from_json(self)
    }
}

impl IntoAttributes for Map<String, Json> {
    fn into_attributes(self) -> Attributes {
        self.into_iter().map(|(k, v)| (k, Value::Json(v))).collect()
    }
}

impl IntoAttributes for Vec<(String, Value)> {
    fn into_attributes(self) -> Attributes {
        self.into_iter().collect()
    }
}

impl<const N: usize> IntoAttributes for [(&str, Value); N] {
    fn into_attributes(self) -> Attributes {
        self.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }
}

/// Converts a JSON object into attributes (empty for non-objects).
#[must_use]
pub fn attributes_from_json(json: Json) -> Attributes {
    match json {
        Json::Object(map) => map.into_attributes(),
        _ => Attributes::new(),
    }
}

/// Snapshot of an attribute map, skipping values without a JSON form.
#[must_use]
pub fn attributes_to_json(attrs: &Attributes) -> Json {
    let map: Map<String, Json> = attrs
        .iter()
        .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
        .collect();
    Json::Object(map)
}

/// Index key for an identity value. `null` has no identity.
pub(crate) fn identity_key(json: &Json) -> Option<String> {
    match json {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Sort-key ordering used by attribute and key-extractor comparators.
///
/// Numbers compare numerically, strings lexically, booleans false-first;
/// mixed JSON types order by type rank; missing and non-JSON keys sort last.
#[must_use]
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(Value::as_json), b.and_then(Value::as_json)) {
        (Some(a), Some(b)) => compare_json(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_json(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(json: &Json) -> u8 {
    match json {
        Json::Null => 0,
        Json::Bool(_) => 1,
        Json::Number(_) => 2,
        Json::String(_) => 3,
        Json::Array(_) => 4,
        Json::Object(_) => 5,
    }
}
