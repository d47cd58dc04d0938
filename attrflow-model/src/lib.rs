//! Observable entities and collections for attrflow.
//!
//! This crate layers change tracking on top of a plain attribute store:
//! - [`Entity`]: an attribute record with per-attribute and aggregate
//!   change events, validation, relations and computed attributes
//! - [`Collection`]: an ordered, identity-indexed set of entities with a
//!   merge/add/remove reconciliation primitive
//! - [`EntityKind`] / [`CollectionKind`]: immutable type declarations
//! - [`Compute`]: a dependency-tracked derived attribute
//! - [`Mirror`]: keeps an entity's snapshot in a [`PersistencePort`]
//!
//! Changes to nested entities climb to their parents: writing `x` on the
//! entity held in `root.child` fires `change:child.x`, `change:child` and
//! `change` on `root`.
//!
//! Everything is single-threaded (`Rc`/`RefCell`); listeners run
//! synchronously and may re-enter any operation.

mod accessor;
mod collection;
mod compute;
mod entity;
mod error;
mod event;
mod ids;
mod kind;
mod options;
mod path;
mod persistence;
mod propagate;
mod relation;
mod value;

pub use accessor::Accessor;
pub use attrflow_events::{ALL, ContextId, Emitter};
pub use collection::{Collection, IntoModels, Lookup, ModelInput};
pub use compute::{Compute, ComputeGetter, ComputeSetter};
pub use entity::{Entity, WeakEntity};
pub use error::{Error, Result, ValidationError};
pub use event::{Bus, Callback, ModelEvent, Payload, Target, UpdateChanges, callback};
pub use ids::{ClientId, DEFAULT_CID_PREFIX};
pub use kind::{
    CollectionKind, CollectionKindBuilder, Comparator, EntityKind, EntityKindBuilder, Relation,
    SortKey, SortOrder, Validator,
};
pub use options::SetOptions;
pub use persistence::{MemoryStore, Mirror, PersistencePort};
pub use value::{
    Attributes, Changes, IntoAttributes, Value, attributes_from_json, attributes_to_json,
    compare_values,
};
