//! Type descriptors for entities and collections.
//!
//! An [`EntityKind`] bundles everything an entity type declares up front:
//! defaults, relations, computes, the identity attribute and an optional
//! validator. Kinds are immutable once built and shared through `Rc`, so
//! every entity of a kind reads the same declarations.

use crate::compute::Compute;
use crate::ids::DEFAULT_CID_PREFIX;
use crate::value::{Attributes, Value};
use crate::{Entity, Error, Result, SetOptions, ValidationError};
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

/// Validates the merged (current + incoming) attributes of a `set`.
pub type Validator =
    Rc<dyn Fn(&Attributes, &SetOptions) -> std::result::Result<(), ValidationError>>;

/// The type that wraps a relation attribute's value.
#[derive(Debug, Clone)]
pub enum Relation {
    /// A nested entity.
    One(Rc<EntityKind>),
    /// A nested collection.
    Many(Rc<CollectionKind>),
}

/// Declarations shared by every entity of one type.
pub struct EntityKind {
    name: String,
    id_attribute: String,
    cid_prefix: String,
    defaults: Map<String, Json>,
    relations: BTreeMap<String, Relation>,
    computes: BTreeMap<String, Compute>,
    validator: Option<Validator>,
}

impl EntityKind {
    pub fn builder(name: impl Into<String>) -> EntityKindBuilder {
        EntityKindBuilder {
            kind: EntityKind {
                name: name.into(),
                id_attribute: "id".to_owned(),
                cid_prefix: DEFAULT_CID_PREFIX.to_owned(),
                defaults: Map::new(),
                relations: BTreeMap::new(),
                computes: BTreeMap::new(),
                validator: None,
            },
        }
    }

    /// A kind with no declarations and `id` as identity attribute.
    #[must_use]
    pub fn plain() -> Rc<Self> {
        Rc::new(Self::builder("entity").kind)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    #[must_use]
    pub fn cid_prefix(&self) -> &str {
        &self.cid_prefix
    }

    #[must_use]
    pub fn defaults(&self) -> &Map<String, Json> {
        &self.defaults
    }

    #[must_use]
    pub fn default_for(&self, attribute: &str) -> Option<&Json> {
        self.defaults.get(attribute)
    }

    #[must_use]
    pub fn relation(&self, attribute: &str) -> Option<&Relation> {
        self.relations.get(attribute)
    }

    #[must_use]
    pub fn relations(&self) -> &BTreeMap<String, Relation> {
        &self.relations
    }

    #[must_use]
    pub fn compute(&self, attribute: &str) -> Option<&Compute> {
        self.computes.get(attribute)
    }

    #[must_use]
    pub fn computes(&self) -> &BTreeMap<String, Compute> {
        &self.computes
    }

    #[must_use]
    pub fn validator(&self) -> Option<&Validator> {
        self.validator.as_ref()
    }
}

impl fmt::Debug for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityKind")
            .field("name", &self.name)
            .field("id_attribute", &self.id_attribute)
            .field("defaults", &self.defaults)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .field("computes", &self.computes)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

/// Builder for [`EntityKind`].
pub struct EntityKindBuilder {
    kind: EntityKind,
}

impl EntityKindBuilder {
    /// Attribute that carries the entity's identity (default `"id"`).
    #[must_use]
    pub fn id_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.kind.id_attribute = attribute.into();
        self
    }

    /// Prefix for generated client ids (default `"c"`).
    #[must_use]
    pub fn cid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kind.cid_prefix = prefix.into();
        self
    }

    /// Merges a JSON object of defaults. Non-object values are ignored.
    #[must_use]
    pub fn defaults(mut self, defaults: Json) -> Self {
        if let Json::Object(map) = defaults {
            self.kind.defaults.extend(map);
        }
        self
    }

    #[must_use]
    pub fn default(mut self, attribute: impl Into<String>, value: impl Into<Json>) -> Self {
        self.kind.defaults.insert(attribute.into(), value.into());
        self
    }

    #[must_use]
    pub fn relation(mut self, attribute: impl Into<String>, relation: Relation) -> Self {
        self.kind.relations.insert(attribute.into(), relation);
        self
    }

    /// Declares a nested entity relation.
    #[must_use]
    pub fn has_one(self, attribute: impl Into<String>, kind: Rc<EntityKind>) -> Self {
        self.relation(attribute, Relation::One(kind))
    }

    /// Declares a nested collection relation.
    #[must_use]
    pub fn has_many(self, attribute: impl Into<String>, kind: Rc<CollectionKind>) -> Self {
        self.relation(attribute, Relation::Many(kind))
    }

    #[must_use]
    pub fn compute(mut self, attribute: impl Into<String>, compute: Compute) -> Self {
        self.kind.computes.insert(attribute.into(), compute);
        self
    }

    #[must_use]
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Attributes, &SetOptions) -> std::result::Result<(), ValidationError> + 'static,
    {
        self.kind.validator = Some(Rc::new(validator));
        self
    }

    /// Finishes the kind.
    ///
    /// Fails when a compute name is also a default or relation, or when
    /// computes depend on each other in a cycle.
    pub fn build(self) -> Result<Rc<EntityKind>> {
        let kind = self.kind;
        for name in kind.computes.keys() {
            if kind.defaults.contains_key(name) || kind.relations.contains_key(name) {
                return Err(Error::ComputeConflict(name.clone()));
            }
        }
        check_compute_cycles(&kind.computes)?;
        Ok(Rc::new(kind))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Active,
    Done,
}

fn check_compute_cycles(computes: &BTreeMap<String, Compute>) -> Result<()> {
    fn visit<'a>(
        name: &'a str,
        computes: &'a BTreeMap<String, Compute>,
        marks: &mut HashMap<&'a str, Visit>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::Active) => return Err(Error::ComputeCycle(name.to_owned())),
            None => {}
        }
        let Some(compute) = computes.get(name) else {
            return Ok(());
        };
        marks.insert(name, Visit::Active);
        for dependency in compute.dependencies() {
            let root = dependency_root(dependency);
            if let Some((key, _)) = computes.get_key_value(root) {
                visit(key, computes, marks)?;
            }
        }
        marks.insert(name, Visit::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for name in computes.keys() {
        visit(name, computes, &mut marks)?;
    }
    Ok(())
}

/// First attribute name of a dependency path (`"a.b#2"` → `"a"`).
fn dependency_root(path: &str) -> &str {
    path.split(['.', '#']).next().unwrap_or(path)
}

/// Key extractor for [`Comparator::Key`].
pub type SortKey = Rc<dyn Fn(&Entity) -> Option<Value>>;

/// Two-argument ordering for [`Comparator::Order`].
pub type SortOrder = Rc<dyn Fn(&Entity, &Entity) -> Ordering>;

/// How a collection orders its members.
#[derive(Clone)]
pub enum Comparator {
    /// Stable sort by an attribute's value.
    Attribute(String),
    /// Stable sort by an extracted key.
    Key(SortKey),
    /// Direct two-argument ordering.
    Order(SortOrder),
}

impl Comparator {
    pub fn attribute(name: impl Into<String>) -> Self {
        Self::Attribute(name.into())
    }

    pub fn key<F>(extract: F) -> Self
    where
        F: Fn(&Entity) -> Option<Value> + 'static,
    {
        Self::Key(Rc::new(extract))
    }

    pub fn order<F>(order: F) -> Self
    where
        F: Fn(&Entity, &Entity) -> Ordering + 'static,
    {
        Self::Order(Rc::new(order))
    }

    /// The attribute whose change forces a re-sort after a merge; `None`
    /// means any change does.
    #[must_use]
    pub fn sort_attribute(&self) -> Option<&str> {
        match self {
            Self::Attribute(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(name) => f.debug_tuple("Attribute").field(name).finish(),
            Self::Key(_) => f.write_str("Key(..)"),
            Self::Order(_) => f.write_str("Order(..)"),
        }
    }
}

/// Declarations shared by every collection of one type.
#[derive(Debug)]
pub struct CollectionKind {
    name: String,
    model: Rc<EntityKind>,
    comparator: Option<Comparator>,
}

impl CollectionKind {
    pub fn builder(name: impl Into<String>, model: Rc<EntityKind>) -> CollectionKindBuilder {
        CollectionKindBuilder {
            kind: CollectionKind {
                name: name.into(),
                model,
                comparator: None,
            },
        }
    }

    /// An unsorted collection of `model` entities.
    #[must_use]
    pub fn of(model: Rc<EntityKind>) -> Rc<Self> {
        let name = format!("{}s", model.name());
        Self::builder(name, model).build()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind used to instantiate raw attribute maps.
    #[must_use]
    pub fn model(&self) -> &Rc<EntityKind> {
        &self.model
    }

    #[must_use]
    pub fn comparator(&self) -> Option<&Comparator> {
        self.comparator.as_ref()
    }
}

/// Builder for [`CollectionKind`].
pub struct CollectionKindBuilder {
    kind: CollectionKind,
}

impl CollectionKindBuilder {
    #[must_use]
    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.kind.comparator = Some(comparator);
        self
    }

    #[must_use]
    pub fn build(self) -> Rc<CollectionKind> {
        Rc::new(self.kind)
    }
}
