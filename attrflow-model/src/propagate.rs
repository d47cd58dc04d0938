//! Upward change propagation.
//!
//! After an entity's aggregate `change`, its parent hears about it: the
//! parent records `<key>.<subkey>` for every changed subkey and `<key>`
//! itself, fires the matching `change:` events, runs its computes, fires its
//! own `change`, and climbs further. Collections are transparent: a member's
//! change reaches the entity that owns the collection, and structural
//! collection events (`update`, `reset`, `sort`) count as a change of the
//! owning attribute.
//!
//! A parent that is mid-transaction (the change came out of its own
//! relation reconciliation) only records the entries and is marked pending;
//! its own `set` finishes the walk.

use crate::value::{Changes, Value};
use crate::{ClientId, Collection, Entity, Error, Result};
use std::iter;
use tracing::{trace, warn};

struct Hop {
    parent: Entity,
    key: String,
    related: Value,
}

/// Fires `change` on `entity` for as long as work is pending, climbing to
/// the parent after each round, then closes the transaction.
///
/// `trail` holds the entities already visited by this walk.
pub(crate) fn finish(entity: &Entity, trail: &mut Vec<ClientId>) -> Result<()> {
    let mark = trail.len();
    let mut outcome = Ok(());
    while entity.take_pending() {
        entity.trigger_change();
        let climbed = climb(entity, trail);
        trail.truncate(mark);
        if let Err(error) = climbed {
            outcome = Err(error);
            break;
        }
    }
    entity.end_transaction();
    outcome
}

/// Announces a structural change of `collection` to its owning entity.
pub(crate) fn collection_changed(collection: &Collection) -> Result<()> {
    let Some((parent, key)) = collection.parent_link() else {
        return Ok(());
    };
    announce(
        &parent,
        &key,
        Changes::new(),
        Value::Collection(collection.clone()),
        &mut Vec::new(),
    )
}

fn climb(entity: &Entity, trail: &mut Vec<ClientId>) -> Result<()> {
    trail.push(entity.cid().clone());
    let Some(hop) = upward(entity) else {
        return Ok(());
    };
    announce(&hop.parent, &hop.key, entity.changed(), hop.related, trail)
}

fn upward(entity: &Entity) -> Option<Hop> {
    if let Some(collection) = entity.collection() {
        let (parent, key) = collection.parent_link()?;
        return Some(Hop {
            parent,
            key,
            related: Value::Collection(collection),
        });
    }
    let (parent, key) = entity.parent_link()?;
    Some(Hop {
        parent,
        key,
        related: Value::Entity(entity.clone()),
    })
}

fn announce(
    parent: &Entity,
    key: &str,
    nested: Changes,
    related: Value,
    trail: &mut Vec<ClientId>,
) -> Result<()> {
    if trail.contains(parent.cid()) {
        warn!(cid = %parent.cid(), key, "change propagation revisited an entity");
        return Err(Error::PropagationCycle(parent.cid().clone()));
    }
    trace!(cid = %parent.cid(), key, entries = nested.len(), "propagating change to parent");

    let running = parent.is_changing();
    if !running {
        parent.begin_nested();
    }
    for (subkey, value) in deepest_first(nested) {
        let compound = format!("{key}.{subkey}");
        parent.record_change(&compound, value.clone());
        parent.trigger_attribute(&compound, value);
    }
    parent.record_change(key, Some(related.clone()));
    parent.trigger_attribute(key, Some(related));
    parent.flush_computes();
    parent.mark_pending();

    if running {
        return Ok(());
    }
    finish(parent, trail)
}

/// Orders entries so `leaf.n` precedes `leaf`: a key's own nested entries
/// are announced before the key itself.
fn deepest_first(nested: Changes) -> Vec<(String, Option<Value>)> {
    let mut entries: Vec<(String, Option<Value>)> = nested.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| {
        let a = a.bytes().chain(iter::once(u8::MAX));
        let b = b.bytes().chain(iter::once(u8::MAX));
        a.cmp(b)
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::deepest_first;
    use crate::value::Changes;

    #[test]
    fn nested_keys_precede_their_prefix() {
        let mut changes = Changes::new();
        for key in ["leaf", "leaf.n", "leaf.n.deep", "alpha"] {
            changes.insert(key.to_owned(), None);
        }
        let order: Vec<String> = deepest_first(changes).into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["alpha", "leaf.n.deep", "leaf.n", "leaf"]);
    }
}
