//! Payloads carried by entity and collection events.
//!
//! Event names follow one vocabulary across the crate:
//!
//! | name              | payload                 | emitted by             |
//! |-------------------|-------------------------|------------------------|
//! | `change:<attr>`   | [`Payload::Attribute`]  | entity                 |
//! | `change`          | [`Payload::Change`]     | entity (relayed)       |
//! | `add` / `remove`  | `Add` / `Remove`        | member (relayed)       |
//! | `update`          | [`Payload::Update`]     | collection             |
//! | `sort` / `reset`  | `Sort` / `Reset`        | collection             |
//! | `invalid`         | [`Payload::Invalid`]    | entity or collection   |
//! | `destroy`         | [`Payload::Destroy`]    | entity (relayed)       |
//!
//! Collections re-trigger every member event on themselves, so a collection
//! listener sees member `change` events with the member as target.

use crate::{Collection, Entity, ValidationError, Value};
use attrflow_events::{Event, EventBus};

/// The emitter an event is about.
#[derive(Debug, Clone)]
pub enum Target {
    Entity(Entity),
    Collection(Collection),
}

impl Target {
    #[must_use]
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            Self::Collection(_) => None,
        }
    }

    #[must_use]
    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Self::Collection(collection) => Some(collection),
            Self::Entity(_) => None,
        }
    }
}

impl From<Entity> for Target {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl From<Collection> for Target {
    fn from(collection: Collection) -> Self {
        Self::Collection(collection)
    }
}

/// Summary attached to a collection `update` event.
#[derive(Debug, Clone, Default)]
pub struct UpdateChanges {
    pub added: Vec<Entity>,
    pub removed: Vec<Entity>,
    pub merged: Vec<Entity>,
}

impl UpdateChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.merged.is_empty()
    }
}

/// Event payload.
#[derive(Debug, Clone)]
pub enum Payload {
    /// `change:<attr>`: the attribute's new value (`None` once unset).
    Attribute { target: Target, value: Option<Value> },
    /// Aggregate `change`.
    Change { target: Target },
    Add {
        entity: Entity,
        collection: Collection,
        /// Insertion index when an explicit position was requested.
        index: Option<usize>,
    },
    Remove {
        entity: Entity,
        collection: Collection,
        /// Index the member occupied before removal.
        index: usize,
    },
    Update {
        collection: Collection,
        changes: UpdateChanges,
    },
    Sort { collection: Collection },
    Reset {
        collection: Collection,
        previous: Vec<Entity>,
    },
    Invalid {
        target: Target,
        error: ValidationError,
    },
    Destroy {
        entity: Entity,
        collection: Option<Collection>,
    },
    /// Application-defined events.
    Custom(serde_json::Value),
}

impl Payload {
    /// The emitter the event is about.
    #[must_use]
    pub fn target(&self) -> Option<Target> {
        match self {
            Self::Attribute { target, .. }
            | Self::Change { target }
            | Self::Invalid { target, .. } => Some(target.clone()),
            Self::Add { entity, .. } | Self::Remove { entity, .. } | Self::Destroy { entity, .. } => {
                Some(Target::Entity(entity.clone()))
            }
            Self::Update { collection, .. }
            | Self::Sort { collection }
            | Self::Reset { collection, .. } => Some(Target::Collection(collection.clone())),
            Self::Custom(_) => None,
        }
    }

    /// The entity the event is about, if any.
    #[must_use]
    pub fn entity(&self) -> Option<Entity> {
        self.target().and_then(|t| t.as_entity().cloned())
    }

    /// The new value of a `change:<attr>` event.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Attribute { value, .. } => value.as_ref(),
            _ => None,
        }
    }

    /// The collection of an `add`/`remove`/`update`/`sort`/`reset` event.
    #[must_use]
    pub fn collection(&self) -> Option<&Collection> {
        match self {
            Self::Add { collection, .. }
            | Self::Remove { collection, .. }
            | Self::Update { collection, .. }
            | Self::Sort { collection }
            | Self::Reset { collection, .. } => Some(collection),
            Self::Destroy { collection, .. } => collection.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn changes(&self) -> Option<&UpdateChanges> {
        match self {
            Self::Update { changes, .. } => Some(changes),
            _ => None,
        }
    }

    /// Position carried by `add` (explicit inserts only) and `remove`.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Add { index, .. } => *index,
            Self::Remove { index, .. } => Some(*index),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            Self::Invalid { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// An event delivered by an entity or collection.
pub type ModelEvent = Event<Payload>;

/// Listener callback for entity and collection events.
pub type Callback = attrflow_events::Callback<Payload>;

/// The bus type shared by entities and collections.
pub type Bus = EventBus<Payload>;

/// Wraps a closure into a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&ModelEvent) + 'static,
{
    attrflow_events::callback(f)
}
