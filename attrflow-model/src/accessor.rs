//! Map-like access to an entity.

use crate::value::Value;
use crate::{Entity, Result, SetOptions};

/// A key/value view over an [`Entity`].
///
/// Reads resolve paths and computes like [`Entity::get`]; writes go through
/// [`Entity::set_key`] with default options, so they emit the usual events.
#[derive(Debug, Clone)]
pub struct Accessor {
    entity: Entity,
}

impl Accessor {
    #[must_use]
    pub fn new(entity: Entity) -> Self {
        Self { entity }
    }

    #[must_use]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entity.get(key)
    }

    /// Accessor over the nested entity at `key`.
    #[must_use]
    pub fn nested(&self, key: &str) -> Option<Accessor> {
        match self.entity.get(key)? {
            Value::Entity(child) => Some(Self::new(child)),
            _ => None,
        }
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.entity.set_key(key, value, &SetOptions::default())
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entity.has(key)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.entity.unset(key, &SetOptions::default())
    }

    /// Stored attribute names followed by compute names.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.entity.keys();
        keys.extend(self.entity.kind().computes().keys().cloned());
        keys
    }
}
