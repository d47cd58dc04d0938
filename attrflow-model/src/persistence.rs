//! Mirroring an entity into a key/value store.
//!
//! The mirror depends on an `Rc<dyn PersistencePort>` and never knows where
//! snapshots end up. Hosts plug in their storage; tests use [`MemoryStore`].
//! Writes are coalesced: every event marks the mirror dirty, and
//! [`Mirror::flush`] stores at most one snapshot per burst.

use crate::event::{Callback, callback};
use crate::{Entity, Result, SetOptions};
use attrflow_events::{ALL, Emitter};
use serde_json::Value as Json;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Storage behind a [`Mirror`].
pub trait PersistencePort {
    /// The stored snapshot for `key`, if any.
    fn load(&self, key: &str) -> Option<String>;

    /// Replaces the snapshot for `key`.
    fn store(&self, key: &str, data: &str) -> Result<()>;
}

/// In-memory port. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<HashMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<String>) {
        self.entries.borrow_mut().insert(key.into(), data.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl PersistencePort for MemoryStore {
    fn load(&self, key: &str) -> Option<String> {
        self.get(key)
    }

    fn store(&self, key: &str, data: &str) -> Result<()> {
        self.insert(key, data);
        Ok(())
    }
}

/// Keeps a store entry in sync with an entity's snapshot.
///
/// The mirror listens to the entity for as long as it lives.
pub struct Mirror {
    entity: Entity,
    port: Rc<dyn PersistencePort>,
    key: String,
    dirty: Rc<Cell<bool>>,
    listener: Callback,
}

impl Mirror {
    /// Restores the entity from the stored snapshot (best effort), then
    /// starts tracking its events.
    pub fn open(entity: &Entity, port: Rc<dyn PersistencePort>, key: impl Into<String>) -> Self {
        let key = key.into();
        restore(entity, port.as_ref(), &key);
        let dirty = Rc::new(Cell::new(false));
        let flag = Rc::clone(&dirty);
        let listener = callback(move |_| flag.set(true));
        entity.bus().on(ALL, Rc::clone(&listener));
        Self {
            entity: entity.clone(),
            port,
            key,
            dirty,
            listener,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True when events arrived since the last flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Stores the snapshot if dirty. Returns whether a write happened.
    pub fn flush(&self) -> Result<bool> {
        if !self.dirty.get() {
            return Ok(false);
        }
        let data = serde_json::to_string(&self.entity.to_json())?;
        self.port.store(&self.key, &data)?;
        self.dirty.set(false);
        debug!(key = %self.key, bytes = data.len(), "entity snapshot stored");
        Ok(true)
    }

    /// Flushes, then stops tracking. Dropping a mirror also stops tracking
    /// but discards unflushed changes.
    pub fn close(self) -> Result<()> {
        self.flush().map(|_| ())
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        self.entity
            .bus()
            .off(Some(ALL), Some(&self.listener), None);
    }
}

fn restore(entity: &Entity, port: &dyn PersistencePort, key: &str) {
    let Some(raw) = port.load(key) else {
        return;
    };
    match serde_json::from_str::<Json>(&raw) {
        Ok(snapshot) => {
            if let Err(error) = entity.set(snapshot, &SetOptions::default()) {
                warn!(key, %error, "stored snapshot rejected");
            }
        }
        Err(error) => warn!(key, %error, "unable to parse stored snapshot"),
    }
}
