//! Observable entities.
//!
//! An [`Entity`] is a cheap, clonable handle to one attribute record. Every
//! write goes through [`Entity::set`], which runs one change transaction:
//!
//! 1. validate (only when `options.validate` is set),
//! 2. snapshot the previous attributes unless a transaction is already open,
//! 3. route each incoming attribute: computes through their setter,
//!    relations through reconciliation, everything else straight to storage,
//! 4. fire `change:<attr>` per changed attribute, then the queued compute
//!    announcements,
//! 5. in the outermost call only, fire `change` until no re-entrant `set`
//!    left work pending, climbing to the parent after each round.
//!
//! No `RefCell` borrow is held while listeners run, so listeners may read
//! and write the entity freely.

use crate::accessor::Accessor;
use crate::collection::CollectionInner;
use crate::compute;
use crate::event::{Bus, Callback, Payload, Target, callback};
use crate::kind::EntityKind;
use crate::path;
use crate::propagate;
use crate::relation;
use crate::value::{Attributes, Changes, IntoAttributes, Value, attributes_to_json};
use crate::{ClientId, Collection, Error, Result, SetOptions, ValidationError};
use attrflow_events::Emitter;
use serde_json::{Map, Value as Json};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// Back-reference from a nested value to the entity attribute holding it.
pub(crate) struct ParentLink {
    pub(crate) entity: Weak<EntityInner>,
    pub(crate) key: String,
}

impl ParentLink {
    pub(crate) fn new(parent: &Entity, key: &str) -> Self {
        Self {
            entity: Rc::downgrade(&parent.inner),
            key: key.to_owned(),
        }
    }

    pub(crate) fn resolve(&self) -> Option<(Entity, String)> {
        let inner = self.entity.upgrade()?;
        Some((Entity { inner }, self.key.clone()))
    }
}

#[derive(Default)]
struct EntityState {
    attributes: Attributes,
    previous: Attributes,
    changed: Changes,
    id: Option<Json>,
    changing: bool,
    pending: bool,
    /// Compute name → dependencies that fired during this transaction.
    pending_computes: Vec<(String, Vec<String>)>,
    collection: Option<Weak<CollectionInner>>,
    parent: Option<ParentLink>,
    validation_error: Option<ValidationError>,
}

pub(crate) struct EntityInner {
    kind: Rc<EntityKind>,
    cid: ClientId,
    bus: Bus,
    state: RefCell<EntityState>,
}

/// Handle to an observable attribute record.
///
/// Clones share the same record; equality of handles is identity
/// ([`ptr_eq`](Self::ptr_eq)).
#[derive(Clone)]
pub struct Entity {
    inner: Rc<EntityInner>,
}

/// Non-owning handle, used by listeners that must not keep an entity alive.
#[derive(Clone)]
pub struct WeakEntity(Weak<EntityInner>);

impl WeakEntity {
    #[must_use]
    pub fn upgrade(&self) -> Option<Entity> {
        self.0.upgrade().map(|inner| Entity { inner })
    }
}

impl Entity {
    /// Creates an entity of `kind`.
    ///
    /// Defaults are deep-copied and overlaid with `attrs`. The initial
    /// write runs with `options`; a validation failure leaves the entity
    /// empty and records the error in
    /// [`validation_error`](Self::validation_error). `changed` is empty
    /// afterwards.
    pub fn new(kind: Rc<EntityKind>, attrs: impl IntoAttributes, options: &SetOptions) -> Self {
        let entity = Self::blank(kind);
        let mut initial: Attributes = entity.kind().defaults().clone().into_attributes();
        initial.extend(attrs.into_attributes());
        if let Err(error) = entity.set(initial, options) {
            debug!(cid = %entity.cid(), %error, "initial attributes rejected");
        }
        entity.inner.state.borrow_mut().changed.clear();
        entity
    }

    /// Creates an entity with no declarations.
    pub fn plain(attrs: impl IntoAttributes) -> Self {
        Self::new(EntityKind::plain(), attrs, &SetOptions::default())
    }

    fn blank(kind: Rc<EntityKind>) -> Self {
        let cid = ClientId::next(kind.cid_prefix());
        let entity = Self {
            inner: Rc::new(EntityInner {
                kind,
                cid,
                bus: Bus::new(),
                state: RefCell::new(EntityState::default()),
            }),
        };
        compute::bind(&entity);
        trace!(cid = %entity.cid(), kind = entity.kind().name(), "entity created");
        entity
    }

    /// Creates a relation child. The parent link is attached after the
    /// initial population, so construction never propagates.
    pub(crate) fn with_parent(
        kind: Rc<EntityKind>,
        attrs: Attributes,
        options: &SetOptions,
        parent: &Entity,
        key: &str,
    ) -> Self {
        let entity = Self::new(kind, attrs, options);
        entity.inner.state.borrow_mut().parent = Some(ParentLink::new(parent, key));
        entity
    }

    // ── Identity ────────────────────────────────────────────────────

    #[must_use]
    pub fn kind(&self) -> &Rc<EntityKind> {
        &self.inner.kind
    }

    #[must_use]
    pub fn cid(&self) -> &ClientId {
        &self.inner.cid
    }

    /// Value of the identity attribute; `None` while unset or `null`.
    #[must_use]
    pub fn id(&self) -> Option<Json> {
        self.inner.state.borrow().id.clone()
    }

    /// True when both handles point at the same entity.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity(Rc::downgrade(&self.inner))
    }

    /// True while the identity attribute has no value.
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.has(self.kind().id_attribute())
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Reads an attribute or compute by path: `a.b` walks nested values,
    /// `list#2` indexes a collection or array, `list#<id>` looks a member up
    /// by identity. Missing steps yield `None`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = path::parse(path);
        let (first, rest) = segments.split_first()?;
        let mut current = path::step(&Value::Entity(self.clone()), first)?;
        for segment in rest {
            current = path::step(&current, segment)?;
        }
        Some(current)
    }

    /// [`get`](Self::get) followed by a JSON snapshot of the result.
    #[must_use]
    pub fn get_json(&self, path: &str) -> Option<Json> {
        self.get(path).and_then(|value| value.to_json())
    }

    /// True when `path` resolves to something other than `null`.
    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some_and(|value| !value.is_null())
    }

    /// Copy of the stored attributes. Computes are not included.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.inner.state.borrow().attributes.clone()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.borrow().attributes.keys().cloned().collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.inner.state.borrow().attributes.values().cloned().collect()
    }

    /// True when every entry of `attrs` equals the value at that path.
    #[must_use]
    pub fn matches(&self, attrs: &Attributes) -> bool {
        attrs
            .iter()
            .all(|(path, expected)| self.get(path).as_ref() == Some(expected))
    }

    /// One path step: a compute is evaluated, anything else read from
    /// storage.
    pub(crate) fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(compute) = self.kind().compute(name) {
            let args: Vec<Option<Value>> = compute
                .dependencies()
                .iter()
                .map(|dependency| self.get(dependency))
                .collect();
            return compute.evaluate(&args);
        }
        self.raw(name)
    }

    pub(crate) fn raw(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow().attributes.get(name).cloned()
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Writes attributes in one change transaction.
    ///
    /// Returns [`Error::Invalid`] without writing anything when validation
    /// rejects the merged attributes, and [`Error::PropagationCycle`] when
    /// climbing to the parent revisits an entity (the local write stands).
    pub fn set(&self, attrs: impl IntoAttributes, options: &SetOptions) -> Result<()> {
        let attrs = attrs.into_attributes();
        self.run_validation(&attrs, options)?;

        let nested = self.begin_transaction();
        let mut changes: Vec<String> = Vec::new();
        let mut queue: VecDeque<(String, Value)> = attrs.into_iter().collect();
        let mut expanded: HashSet<String> = HashSet::new();

        while let Some((attr, value)) = queue.pop_front() {
            if let Some(compute) = self.kind().compute(&attr) {
                if !expanded.insert(attr.clone()) {
                    debug!(cid = %self.cid(), attribute = %attr, "compute already expanded in this set");
                    continue;
                }
                match compute.apply_set(&value) {
                    Some(derived) => queue.extend(derived),
                    None => {
                        debug!(cid = %self.cid(), attribute = %attr, "write to read-only compute skipped");
                    }
                }
                continue;
            }
            let next = if options.unset {
                relation::detach(self, &attr);
                None
            } else {
                Some(relation::reconcile(self, &attr, value, options))
            };
            if self.store(&attr, next) && !changes.contains(&attr) {
                changes.push(attr);
            }
        }

        if !options.silent {
            if !changes.is_empty() {
                self.mark_pending();
            }
            for attr in &changes {
                let value = self.raw(attr);
                self.trigger_attribute(attr, value);
            }
            self.flush_computes();
        }

        if nested {
            return Ok(());
        }
        if options.silent {
            self.end_transaction();
            return Ok(());
        }
        propagate::finish(self, &mut Vec::new())
    }

    /// Writes one attribute. Dotted keys with JSON values expand into nested
    /// objects (`"meta.author"` writes `{meta: {author: ..}}`).
    pub fn set_key(&self, key: &str, value: impl Into<Value>, options: &SetOptions) -> Result<()> {
        self.set(path::nest(key, value.into()), options)
    }

    /// Deletes one attribute.
    pub fn unset(&self, attr: &str, options: &SetOptions) -> Result<()> {
        self.set([(attr, Value::null())], &options.clone().with_unset(true))
    }

    /// Clears nested entities and collections in place, then deletes every
    /// other attribute.
    pub fn clear(&self, options: &SetOptions) -> Result<()> {
        let mut doomed = Attributes::new();
        for (key, value) in self.attributes() {
            match value {
                Value::Entity(child) => child.clear(options)?,
                Value::Collection(collection) => {
                    for member in collection.models() {
                        member.clear(options)?;
                    }
                    collection.reset(Vec::<Entity>::new(), options);
                }
                other => {
                    doomed.insert(key, other);
                }
            }
        }
        self.set(doomed, &options.clone().with_unset(true))
    }

    fn run_validation(&self, attrs: &Attributes, options: &SetOptions) -> Result<()> {
        if !options.validate {
            return Ok(());
        }
        let Some(validator) = self.kind().validator() else {
            return Ok(());
        };
        let mut merged = self.attributes();
        merged.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        match validator(&merged, options) {
            Ok(()) => {
                self.inner.state.borrow_mut().validation_error = None;
                Ok(())
            }
            Err(error) => {
                debug!(cid = %self.cid(), %error, "validation rejected set");
                self.inner.state.borrow_mut().validation_error = Some(error.clone());
                self.inner.bus.trigger(
                    "invalid",
                    Payload::Invalid {
                        target: Target::Entity(self.clone()),
                        error: error.clone(),
                    },
                );
                Err(Error::Invalid(error))
            }
        }
    }

    /// Opens a transaction. Returns true when one was already open.
    fn begin_transaction(&self) -> bool {
        let mut state = self.inner.state.borrow_mut();
        let nested = state.changing;
        state.changing = true;
        if !nested {
            state.previous = state.attributes.clone();
            state.changed.clear();
        }
        nested
    }

    /// Stores (or deletes) one attribute and updates `changed` against the
    /// transaction snapshot. Returns true when the current value differed.
    fn store(&self, attr: &str, next: Option<Value>) -> bool {
        let is_id = attr == self.kind().id_attribute();
        let mut state = self.inner.state.borrow_mut();
        if is_id {
            state.id = next
                .as_ref()
                .and_then(Value::as_json)
                .filter(|json| !json.is_null())
                .cloned();
        }
        let differs = state.attributes.get(attr) != next.as_ref();
        if state.previous.get(attr) != next.as_ref() {
            state.changed.insert(attr.to_owned(), next.clone());
        } else if differs {
            // Reverted to the snapshot. A no-op write keeps entries recorded
            // by children during this transaction.
            state.changed.remove(attr);
        }
        match next {
            Some(value) => {
                state.attributes.insert(attr.to_owned(), value);
            }
            None => {
                state.attributes.remove(attr);
            }
        }
        differs
    }

    // ── Transaction plumbing ────────────────────────────────────────

    pub(crate) fn is_changing(&self) -> bool {
        self.inner.state.borrow().changing
    }

    /// Opens a transaction for events arriving from a child, without
    /// touching the previous snapshot.
    pub(crate) fn begin_nested(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.changing = true;
        state.changed.clear();
    }

    pub(crate) fn end_transaction(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.changing = false;
        state.pending = false;
    }

    pub(crate) fn mark_pending(&self) {
        self.inner.state.borrow_mut().pending = true;
    }

    /// Clears and returns the pending flag.
    pub(crate) fn take_pending(&self) -> bool {
        std::mem::take(&mut self.inner.state.borrow_mut().pending)
    }

    pub(crate) fn record_change(&self, key: &str, value: Option<Value>) {
        self.inner
            .state
            .borrow_mut()
            .changed
            .insert(key.to_owned(), value);
    }

    pub(crate) fn trigger_attribute(&self, attr: &str, value: Option<Value>) {
        self.inner.bus.trigger(
            &format!("change:{attr}"),
            Payload::Attribute {
                target: Target::Entity(self.clone()),
                value,
            },
        );
    }

    pub(crate) fn trigger_change(&self) {
        self.inner.bus.trigger(
            "change",
            Payload::Change {
                target: Target::Entity(self.clone()),
            },
        );
    }

    pub(crate) fn queue_compute(&self, name: &str, dependency: &str) {
        let mut state = self.inner.state.borrow_mut();
        match state.pending_computes.iter_mut().find(|(queued, _)| queued == name) {
            Some((_, fired)) => {
                if !fired.iter().any(|d| d == dependency) {
                    fired.push(dependency.to_owned());
                }
            }
            None => state
                .pending_computes
                .push((name.to_owned(), vec![dependency.to_owned()])),
        }
    }

    /// Announces every queued compute, in queue order.
    pub(crate) fn flush_computes(&self) {
        loop {
            let next = {
                let mut state = self.inner.state.borrow_mut();
                if state.pending_computes.is_empty() {
                    None
                } else {
                    Some(state.pending_computes.remove(0))
                }
            };
            let Some((name, fired)) = next else {
                break;
            };
            compute::announce(self, &name, &fired);
        }
    }

    // ── Change queries ──────────────────────────────────────────────

    /// Whether the last transaction changed `attr` (any attribute for
    /// `None`).
    #[must_use]
    pub fn has_changed(&self, attr: Option<&str>) -> bool {
        let state = self.inner.state.borrow();
        match attr {
            Some(attr) => state.changed.contains_key(attr),
            None => !state.changed.is_empty(),
        }
    }

    /// What the last transaction changed, including compound
    /// `<relation>.<key>` entries from children and compute entries.
    #[must_use]
    pub fn changed(&self) -> Changes {
        self.inner.state.borrow().changed.clone()
    }

    /// Without `diff`: the last transaction's changes, or `None` when
    /// nothing changed. With `diff`: the entries of `diff` that differ from
    /// the snapshot (previous attributes while a transaction is open,
    /// current ones otherwise).
    #[must_use]
    pub fn changed_attributes(&self, diff: Option<&Attributes>) -> Option<Changes> {
        let state = self.inner.state.borrow();
        let Some(diff) = diff else {
            return (!state.changed.is_empty()).then(|| state.changed.clone());
        };
        let baseline = if state.changing {
            &state.previous
        } else {
            &state.attributes
        };
        let changes: Changes = diff
            .iter()
            .filter(|(key, value)| baseline.get(key.as_str()) != Some(*value))
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        (!changes.is_empty()).then_some(changes)
    }

    /// Value of `attr` before the last transaction.
    #[must_use]
    pub fn previous(&self, attr: &str) -> Option<Value> {
        self.inner.state.borrow().previous.get(attr).cloned()
    }

    #[must_use]
    pub fn previous_attributes(&self) -> Attributes {
        self.inner.state.borrow().previous.clone()
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Runs the validator against the current attributes.
    pub fn is_valid(&self) -> bool {
        self.run_validation(&Attributes::new(), &SetOptions::validated())
            .is_ok()
    }

    /// The last validation failure, cleared by the next passing validation.
    #[must_use]
    pub fn validation_error(&self) -> Option<ValidationError> {
        self.inner.state.borrow().validation_error.clone()
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// Structural snapshot of the attributes. Nested values serialize
    /// recursively, computes and opaque values are left out.
    #[must_use]
    pub fn to_json(&self) -> Json {
        attributes_to_json(&self.attributes())
    }

    /// Like [`to_json`](Self::to_json) but omits attributes equal to their
    /// declared default.
    #[must_use]
    pub fn to_compact_json(&self) -> Json {
        let mut out = Map::new();
        for (key, value) in self.attributes() {
            let Some(json) = value.to_compact_json() else {
                continue;
            };
            if self.kind().default_for(&key) == Some(&json) {
                continue;
            }
            out.insert(key, json);
        }
        Json::Object(out)
    }

    /// A new entity of the same kind built from this one's snapshot.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::new(Rc::clone(self.kind()), self.to_json(), &SetOptions::default())
    }

    // ── Topology ────────────────────────────────────────────────────

    /// The collection holding this entity, or the entity whose relation
    /// attribute holds it.
    #[must_use]
    pub fn parent(&self) -> Option<Target> {
        if let Some(collection) = self.collection() {
            return Some(Target::Collection(collection));
        }
        self.parent_link()
            .map(|(parent, _)| Target::Entity(parent))
    }

    /// The topmost ancestor; the entity itself when it has no parent.
    #[must_use]
    pub fn root(&self) -> Target {
        let mut current = Target::Entity(self.clone());
        let mut seen: HashSet<ClientId> = HashSet::new();
        loop {
            let next = match &current {
                Target::Entity(entity) => {
                    if !seen.insert(entity.cid().clone()) {
                        break;
                    }
                    entity.parent()
                }
                Target::Collection(collection) => collection.parent().map(Target::Entity),
            };
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// The owning collection, if any.
    #[must_use]
    pub fn collection(&self) -> Option<Collection> {
        let state = self.inner.state.borrow();
        let inner = state.collection.as_ref()?.upgrade()?;
        Some(Collection::from_inner(inner))
    }

    pub(crate) fn parent_link(&self) -> Option<(Entity, String)> {
        self.inner.state.borrow().parent.as_ref()?.resolve()
    }

    pub(crate) fn detach_parent(&self) {
        self.inner.state.borrow_mut().parent = None;
    }

    /// Records `collection` as owner unless another collection owns it.
    pub(crate) fn attach_collection(&self, collection: &Collection) {
        let mut state = self.inner.state.borrow_mut();
        let owned = state
            .collection
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0);
        if !owned {
            state.collection = Some(collection.downgrade_inner());
        }
    }

    /// Clears the owner when it is `collection`.
    pub(crate) fn detach_collection(&self, collection: &Collection) {
        let mut state = self.inner.state.borrow_mut();
        let is_owner = state
            .collection
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|inner| Collection::from_inner(inner).ptr_eq(collection));
        if is_owner {
            state.collection = None;
        }
    }

    // ── Extras ──────────────────────────────────────────────────────

    /// Calls `handler` after each `change` whose `changed` set touches one of
    /// the whitespace-separated `keys`. The returned callback unsubscribes
    /// via [`Emitter::off`].
    pub fn subscribe<F>(&self, keys: &str, handler: F) -> Callback
    where
        F: Fn(&Entity) + 'static,
    {
        let keys: Vec<String> = keys.split_whitespace().map(str::to_owned).collect();
        let weak = self.downgrade();
        let listener = callback(move |_| {
            let Some(entity) = weak.upgrade() else {
                return;
            };
            let touched = {
                let state = entity.inner.state.borrow();
                keys.iter().any(|key| state.changed.contains_key(key))
            };
            if touched {
                handler(&entity);
            }
        });
        self.inner.bus.on("change", Rc::clone(&listener));
        listener
    }

    /// Announces destruction. The owning collection drops the entity; this
    /// entity stops listening to everything it listened to.
    pub fn destroy(&self) {
        let collection = self.collection();
        self.inner.bus.stop_listening(None, None, None);
        debug!(cid = %self.cid(), "entity destroyed");
        self.inner.bus.trigger(
            "destroy",
            Payload::Destroy {
                entity: self.clone(),
                collection,
            },
        );
    }

    /// Map-like view over this entity.
    #[must_use]
    pub fn accessor(&self) -> Accessor {
        Accessor::new(self.clone())
    }
}

impl Emitter<Payload> for Entity {
    fn bus(&self) -> &Bus {
        &self.inner.bus
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Entity");
        out.field("cid", &self.inner.cid)
            .field("kind", &self.inner.kind.name());
        match self.inner.state.try_borrow() {
            Ok(state) => out.field("id", &state.id),
            Err(_) => out.field("id", &"<borrowed>"),
        };
        out.finish()
    }
}
