//! Ordered, identity-indexed sets of entities.
//!
//! A [`Collection`] keeps its members in order plus two indexes (`by_id`,
//! `by_cid`). [`Collection::set`] is the reconciliation primitive that
//! `add`, `remove`, `reset` and the positional helpers build on. Member
//! events are relayed onto the collection, so one listener on a collection
//! sees every member's `change`.

use crate::entity::ParentLink;
use crate::event::{Bus, Callback, ModelEvent, Payload, Target, UpdateChanges, callback};
use crate::kind::{CollectionKind, Comparator, EntityKind};
use crate::propagate;
use crate::value::{Attributes, IntoAttributes, Value, attributes_from_json, compare_values, identity_key};
use crate::{ClientId, Entity, Error, Result, SetOptions};
use attrflow_events::{ALL, Emitter};
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// One candidate passed to [`Collection::set`].
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// An existing entity handle.
    Entity(Entity),
    /// Raw attributes, instantiated with the collection's model kind.
    Attributes(Attributes),
}

impl ModelInput {
    fn into_attributes(self) -> Attributes {
        match self {
            Self::Entity(entity) => entity.attributes(),
            Self::Attributes(attrs) => attrs,
        }
    }
}

impl From<Entity> for ModelInput {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl From<Attributes> for ModelInput {
    fn from(attrs: Attributes) -> Self {
        Self::Attributes(attrs)
    }
}

impl From<Json> for ModelInput {
    fn from(json: Json) -> Self {
        Self::Attributes(attributes_from_json(json))
    }
}

/// Anything [`Collection::set`] accepts: one candidate or a list.
pub trait IntoModels {
    fn into_models(self) -> Vec<ModelInput>;
}

impl IntoModels for Vec<ModelInput> {
    fn into_models(self) -> Vec<ModelInput> {
        self
    }
}

impl IntoModels for ModelInput {
    fn into_models(self) -> Vec<ModelInput> {
        vec![self]
    }
}

impl IntoModels for Entity {
    fn into_models(self) -> Vec<ModelInput> {
        vec![ModelInput::Entity(self)]
    }
}

impl IntoModels for Vec<Entity> {
    fn into_models(self) -> Vec<ModelInput> {
        self.into_iter().map(ModelInput::Entity).collect()
    }
}

impl IntoModels for &[Entity] {
    fn into_models(self) -> Vec<ModelInput> {
        self.iter().cloned().map(ModelInput::Entity).collect()
    }
}

impl IntoModels for Attributes {
    fn into_models(self) -> Vec<ModelInput> {
        vec![ModelInput::Attributes(self)]
    }
}

impl IntoModels for Vec<Attributes> {
    fn into_models(self) -> Vec<ModelInput> {
        self.into_iter().map(ModelInput::Attributes).collect()
    }
}

/// A JSON array yields one candidate per object, a JSON object one
/// candidate, anything else none.
impl IntoModels for Json {
    fn into_models(self) -> Vec<ModelInput> {
        match self {
            Json::Array(items) => items
                .into_iter()
                .filter(Json::is_object)
                .map(ModelInput::from)
                .collect(),
            json @ Json::Object(_) => vec![ModelInput::from(json)],
            _ => Vec::new(),
        }
    }
}

/// Identity lookup key for [`Collection::get`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// An id (as its index key) or a cid string.
    Key(String),
    /// An id value.
    Id(Json),
    Cid(ClientId),
    /// A handle; matched by cid, then by id.
    Entity(Entity),
}

impl From<&str> for Lookup {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

impl From<String> for Lookup {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<i64> for Lookup {
    fn from(id: i64) -> Self {
        Self::Id(Json::from(id))
    }
}

impl From<i32> for Lookup {
    fn from(id: i32) -> Self {
        Self::Id(Json::from(id))
    }
}

impl From<u64> for Lookup {
    fn from(id: u64) -> Self {
        Self::Id(Json::from(id))
    }
}

impl From<Json> for Lookup {
    fn from(id: Json) -> Self {
        Self::Id(id)
    }
}

impl From<ClientId> for Lookup {
    fn from(cid: ClientId) -> Self {
        Self::Cid(cid)
    }
}

impl From<&ClientId> for Lookup {
    fn from(cid: &ClientId) -> Self {
        Self::Cid(cid.clone())
    }
}

impl From<&Entity> for Lookup {
    fn from(entity: &Entity) -> Self {
        Self::Entity(entity.clone())
    }
}

struct CollectionState {
    models: Vec<Entity>,
    by_id: HashMap<String, Entity>,
    by_cid: HashMap<ClientId, Entity>,
    parent: Option<ParentLink>,
    comparator: Option<Comparator>,
}

pub(crate) struct CollectionInner {
    kind: Rc<CollectionKind>,
    bus: Bus,
    state: RefCell<CollectionState>,
}

/// Handle to an ordered set of entities.
#[derive(Clone)]
pub struct Collection {
    inner: Rc<CollectionInner>,
}

impl Collection {
    /// Creates a collection and populates it silently.
    pub fn new(kind: Rc<CollectionKind>, models: impl IntoModels, options: &SetOptions) -> Self {
        let collection = Self::blank(kind);
        collection.reset(models, &options.clone().with_silent(true));
        collection
    }

    /// An empty, unsorted collection of `model` entities.
    #[must_use]
    pub fn of(model: Rc<EntityKind>) -> Self {
        Self::new(
            CollectionKind::of(model),
            Vec::<ModelInput>::new(),
            &SetOptions::default(),
        )
    }

    pub(crate) fn with_parent(
        kind: Rc<CollectionKind>,
        models: Vec<Attributes>,
        options: &SetOptions,
        parent: &Entity,
        key: &str,
    ) -> Self {
        let collection = Self::new(kind, models, options);
        collection.inner.state.borrow_mut().parent = Some(ParentLink::new(parent, key));
        collection
    }

    fn blank(kind: Rc<CollectionKind>) -> Self {
        let comparator = kind.comparator().cloned();
        let collection = Self {
            inner: Rc::new(CollectionInner {
                kind,
                bus: Bus::new(),
                state: RefCell::new(CollectionState {
                    models: Vec::new(),
                    by_id: HashMap::new(),
                    by_cid: HashMap::new(),
                    parent: None,
                    comparator,
                }),
            }),
        };
        let weak = Rc::downgrade(&collection.inner);
        collection.inner.bus.on(
            "update reset sort",
            callback(move |_| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let collection = Collection { inner };
                if let Err(error) = propagate::collection_changed(&collection) {
                    warn!(collection = collection.kind().name(), %error, "structural change did not reach the owner");
                }
            }),
        );
        collection
    }

    pub(crate) fn from_inner(inner: Rc<CollectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<CollectionInner> {
        Rc::downgrade(&self.inner)
    }

    #[must_use]
    pub fn kind(&self) -> &Rc<CollectionKind> {
        &self.inner.kind
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Reconciles the members against `models` and returns the resolved
    /// entities in input order. Duplicate candidates collapse onto the first.
    ///
    /// Matches are merged when `merge` is set, unknown candidates added when
    /// `add` is set, and unmatched members removed when `remove` is set.
    /// Without a comparator, adding and removing at once adopts the
    /// incoming order.
    pub fn set(&self, models: impl IntoModels, options: &SetOptions) -> Vec<Entity> {
        let candidates = models.into_models();
        let at = options.at.map(|at| clamp_at(at, self.len()));
        let comparator = self.comparator();
        let sortable = comparator.is_some() && at.is_none() && options.sort;
        let sort_attribute = comparator
            .as_ref()
            .and_then(Comparator::sort_attribute)
            .map(str::to_owned);

        let mut resolved = Vec::new();
        let mut kept: Vec<Entity> = Vec::new();
        let mut kept_cids: HashSet<ClientId> = HashSet::new();
        let mut added: Vec<Entity> = Vec::new();
        let mut merged: Vec<Entity> = Vec::new();
        let mut needs_sort = false;

        for candidate in candidates {
            if let Some(existing) = self.find_existing(&candidate) {
                let same_handle =
                    matches!(&candidate, ModelInput::Entity(entity) if entity.ptr_eq(&existing));
                if options.merge && !same_handle {
                    if let Err(error) = existing.set(candidate.into_attributes(), options) {
                        debug!(cid = %existing.cid(), %error, "collection member rejected merge");
                    }
                    if !merged.iter().any(|m| m.ptr_eq(&existing)) {
                        merged.push(existing.clone());
                    }
                    if sortable && !needs_sort {
                        // Key and order comparators re-sort on any change.
                        needs_sort = existing.has_changed(sort_attribute.as_deref());
                    }
                }
                if kept_cids.insert(existing.cid().clone()) {
                    kept.push(existing.clone());
                }
                resolved.push(existing);
            } else if options.add {
                let Some(model) = self.prepare(candidate, options) else {
                    continue;
                };
                self.add_reference(&model);
                kept_cids.insert(model.cid().clone());
                kept.push(model.clone());
                added.push(model.clone());
                resolved.push(model);
            }
        }

        let removed = if options.remove {
            let doomed: Vec<Entity> = self
                .models()
                .into_iter()
                .filter(|member| !kept_cids.contains(member.cid()))
                .collect();
            self.remove_models(&doomed, options)
        } else {
            Vec::new()
        };

        let replace = !sortable && options.add && options.remove && at.is_none();
        let mut order_changed = false;
        let mut insert_at = None;
        {
            let mut state = self.inner.state.borrow_mut();
            if replace {
                let appended: Vec<&Entity> = state.models.iter().chain(&added).collect();
                order_changed = appended.len() != kept.len()
                    || appended.iter().zip(&kept).any(|(a, b)| !a.ptr_eq(b));
                state.models = kept;
            } else if !added.is_empty() {
                if sortable {
                    needs_sort = true;
                }
                let index = at.unwrap_or(state.models.len()).min(state.models.len());
                for (offset, model) in added.iter().enumerate() {
                    state.models.insert(index + offset, model.clone());
                }
                insert_at = at.map(|_| index);
            }
        }
        if needs_sort {
            if let Some(comparator) = &comparator {
                self.apply_order(comparator);
            }
        }

        if !options.silent {
            for (offset, model) in added.iter().enumerate() {
                model.bus().trigger(
                    "add",
                    Payload::Add {
                        entity: model.clone(),
                        collection: self.clone(),
                        index: insert_at.map(|index| index + offset),
                    },
                );
            }
            if needs_sort || order_changed {
                self.trigger_sort();
            }
            let changes = UpdateChanges {
                added,
                removed,
                merged,
            };
            if !changes.is_empty() {
                self.inner.bus.trigger(
                    "update",
                    Payload::Update {
                        collection: self.clone(),
                        changes,
                    },
                );
            }
        }
        resolved
    }

    /// [`set`](Self::set) for a single candidate.
    pub fn set_one(&self, model: impl Into<ModelInput>, options: &SetOptions) -> Option<Entity> {
        self.set(vec![model.into()], options).into_iter().next()
    }

    /// Adds candidates; existing members are left untouched.
    pub fn add(&self, models: impl IntoModels, options: &SetOptions) -> Vec<Entity> {
        let options = options
            .clone()
            .with_add(true)
            .with_remove(false)
            .with_merge(false);
        self.set(models, &options)
    }

    /// Removes the members matching `models` and returns them.
    pub fn remove(&self, models: impl IntoModels, options: &SetOptions) -> Vec<Entity> {
        let doomed: Vec<Entity> = models
            .into_models()
            .iter()
            .filter_map(|candidate| self.find_existing(candidate))
            .collect();
        let removed = self.remove_models(&doomed, options);
        if !options.silent && !removed.is_empty() {
            self.inner.bus.trigger(
                "update",
                Payload::Update {
                    collection: self.clone(),
                    changes: UpdateChanges {
                        removed: removed.clone(),
                        ..UpdateChanges::default()
                    },
                },
            );
        }
        removed
    }

    /// Replaces every member silently, then fires one `reset` carrying the
    /// previous members.
    pub fn reset(&self, models: impl IntoModels, options: &SetOptions) -> Vec<Entity> {
        let previous = self.models();
        for model in &previous {
            self.remove_reference(model);
        }
        {
            let mut state = self.inner.state.borrow_mut();
            state.models.clear();
            state.by_id.clear();
            state.by_cid.clear();
        }
        let added = self.add(models, &options.clone().with_silent(true));
        if !options.silent {
            self.inner.bus.trigger(
                "reset",
                Payload::Reset {
                    collection: self.clone(),
                    previous,
                },
            );
        }
        added
    }

    /// Re-orders the members with the comparator and fires `sort`.
    pub fn sort(&self, options: &SetOptions) -> Result<()> {
        let comparator = self.comparator().ok_or(Error::MissingComparator)?;
        self.apply_order(&comparator);
        if !options.silent {
            self.trigger_sort();
        }
        Ok(())
    }

    pub fn push(&self, models: impl IntoModels, options: &SetOptions) -> Vec<Entity> {
        let end = isize::try_from(self.len()).unwrap_or(isize::MAX);
        self.add(models, &options.clone().with_at(end))
    }

    pub fn pop(&self, options: &SetOptions) -> Option<Entity> {
        let last = self.last()?;
        self.remove(last, options).into_iter().next()
    }

    pub fn unshift(&self, models: impl IntoModels, options: &SetOptions) -> Vec<Entity> {
        self.add(models, &options.clone().with_at(0))
    }

    pub fn shift(&self, options: &SetOptions) -> Option<Entity> {
        let first = self.first()?;
        self.remove(first, options).into_iter().next()
    }

    /// Removes the member at `index` (negative counts from the end).
    pub fn remove_at(&self, index: isize, options: &SetOptions) -> Option<Entity> {
        let member = self.at(index)?;
        self.remove(member, options).into_iter().next()
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Identity lookup by id, cid or handle.
    #[must_use]
    pub fn get(&self, lookup: impl Into<Lookup>) -> Option<Entity> {
        let state = self.inner.state.borrow();
        match lookup.into() {
            Lookup::Key(key) => state
                .by_id
                .get(&key)
                .or_else(|| state.by_cid.get(&ClientId::from(key.as_str())))
                .cloned(),
            Lookup::Id(id) => identity_key(&id).and_then(|key| state.by_id.get(&key).cloned()),
            Lookup::Cid(cid) => state.by_cid.get(&cid).cloned(),
            Lookup::Entity(entity) => state
                .by_cid
                .get(entity.cid())
                .cloned()
                .or_else(|| {
                    let key = entity.id().as_ref().and_then(identity_key)?;
                    state.by_id.get(&key).cloned()
                }),
        }
    }

    #[must_use]
    pub fn has(&self, lookup: impl Into<Lookup>) -> bool {
        self.get(lookup).is_some()
    }

    /// Positional lookup; negative indices count from the end.
    #[must_use]
    pub fn at(&self, index: isize) -> Option<Entity> {
        let state = self.inner.state.borrow();
        let len = isize::try_from(state.models.len()).ok()?;
        let index = if index < 0 { index + len } else { index };
        let index = usize::try_from(index).ok()?;
        state.models.get(index).cloned()
    }

    /// Members whose attributes match every entry of `attrs`.
    #[must_use]
    pub fn where_matching(&self, attrs: impl IntoAttributes) -> Vec<Entity> {
        let attrs = attrs.into_attributes();
        self.filter(|member| member.matches(&attrs))
    }

    #[must_use]
    pub fn find_where(&self, attrs: impl IntoAttributes) -> Option<Entity> {
        let attrs = attrs.into_attributes();
        self.find(|member| member.matches(&attrs))
    }

    fn find_existing(&self, candidate: &ModelInput) -> Option<Entity> {
        match candidate {
            ModelInput::Entity(entity) => self.get(entity),
            ModelInput::Attributes(attrs) => {
                let id_attribute = self.kind().model().id_attribute();
                if let Some(found) = attrs
                    .get(id_attribute)
                    .and_then(Value::as_json)
                    .and_then(identity_key)
                    .and_then(|key| self.inner.state.borrow().by_id.get(&key).cloned())
                {
                    return Some(found);
                }
                let cid = attrs.get("cid").and_then(Value::as_str)?;
                self.inner.state.borrow().by_cid.get(&ClientId::from(cid)).cloned()
            }
        }
    }

    // ── Iteration ───────────────────────────────────────────────────

    /// Snapshot of the members in order.
    #[must_use]
    pub fn models(&self) -> Vec<Entity> {
        self.inner.state.borrow().models.clone()
    }

    /// Iterates over a snapshot, so the collection may change meanwhile.
    pub fn iter(&self) -> std::vec::IntoIter<Entity> {
        self.models().into_iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.borrow().models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn map<T, F>(&self, f: F) -> Vec<T>
    where
        F: FnMut(Entity) -> T,
    {
        self.iter().map(f).collect()
    }

    pub fn filter<F>(&self, mut predicate: F) -> Vec<Entity>
    where
        F: FnMut(&Entity) -> bool,
    {
        self.iter().filter(|member| predicate(member)).collect()
    }

    pub fn find<F>(&self, mut predicate: F) -> Option<Entity>
    where
        F: FnMut(&Entity) -> bool,
    {
        self.iter().find(|member| predicate(member))
    }

    pub fn fold<T, F>(&self, init: T, f: F) -> T
    where
        F: FnMut(T, Entity) -> T,
    {
        self.iter().fold(init, f)
    }

    pub fn any<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Entity) -> bool,
    {
        self.iter().any(|member| predicate(&member))
    }

    pub fn all<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Entity) -> bool,
    {
        self.iter().all(|member| predicate(&member))
    }

    /// The value at `path` for every member, in order.
    #[must_use]
    pub fn pluck(&self, path: &str) -> Vec<Option<Value>> {
        self.map(|member| member.get(path))
    }

    #[must_use]
    pub fn index_of(&self, entity: &Entity) -> Option<usize> {
        self.inner
            .state
            .borrow()
            .models
            .iter()
            .position(|member| member.ptr_eq(entity))
    }

    #[must_use]
    pub fn first(&self) -> Option<Entity> {
        self.inner.state.borrow().models.first().cloned()
    }

    #[must_use]
    pub fn last(&self) -> Option<Entity> {
        self.inner.state.borrow().models.last().cloned()
    }

    /// Members in `range`, clamped to the collection bounds.
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Vec<Entity> {
        let state = self.inner.state.borrow();
        let end = range.end.min(state.models.len());
        let start = range.start.min(end);
        state.models[start..end].to_vec()
    }

    // ── Snapshots ───────────────────────────────────────────────────

    #[must_use]
    pub fn to_json(&self) -> Json {
        Json::Array(self.iter().map(|member| member.to_json()).collect())
    }

    #[must_use]
    pub fn to_compact_json(&self) -> Json {
        Json::Array(self.iter().map(|member| member.to_compact_json()).collect())
    }

    /// A new, parentless collection of the same kind holding the same
    /// member handles and using this collection's comparator. Members keep
    /// their current owner.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        let copy = Self::blank(Rc::clone(self.kind()));
        copy.set_comparator(self.comparator());
        copy.add(self.models(), &SetOptions::silent());
        copy
    }

    // ── Topology and configuration ──────────────────────────────────

    /// The entity whose relation attribute holds this collection.
    #[must_use]
    pub fn parent(&self) -> Option<Entity> {
        self.parent_link().map(|(parent, _)| parent)
    }

    pub(crate) fn parent_link(&self) -> Option<(Entity, String)> {
        self.inner.state.borrow().parent.as_ref()?.resolve()
    }

    pub(crate) fn detach_parent(&self) {
        self.inner.state.borrow_mut().parent = None;
    }

    #[must_use]
    pub fn comparator(&self) -> Option<Comparator> {
        self.inner.state.borrow().comparator.clone()
    }

    /// Replaces the comparator. Members are not re-sorted until the next
    /// [`sort`](Self::sort) or sorting `set`.
    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.inner.state.borrow_mut().comparator = comparator;
    }

    /// Calls `handler` for every event whose name is among the
    /// whitespace-separated `names`. The returned callback unsubscribes via
    /// [`Emitter::off`].
    pub fn subscribe<F>(&self, names: &str, handler: F) -> Callback
    where
        F: Fn(&ModelEvent) + 'static,
    {
        let names: Vec<String> = names.split_whitespace().map(str::to_owned).collect();
        let listener = callback(move |event| {
            if names.iter().any(|name| name == event.name()) {
                handler(event);
            }
        });
        self.inner.bus.on(ALL, Rc::clone(&listener));
        listener
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Turns a new candidate into a member-to-be. Raw attributes that fail
    /// validation are dropped and reported as `invalid` on the collection.
    fn prepare(&self, candidate: ModelInput, options: &SetOptions) -> Option<Entity> {
        let entity = match candidate {
            ModelInput::Entity(entity) => entity,
            ModelInput::Attributes(attrs) => {
                let member_options = SetOptions::default().with_validate(options.validate);
                let entity = Entity::new(Rc::clone(self.kind().model()), attrs, &member_options);
                if let Some(error) = entity.validation_error() {
                    debug!(collection = self.kind().name(), %error, "dropping invalid candidate");
                    self.inner.bus.trigger(
                        "invalid",
                        Payload::Invalid {
                            target: Target::Collection(self.clone()),
                            error,
                        },
                    );
                    return None;
                }
                entity
            }
        };
        entity.attach_collection(self);
        Some(entity)
    }

    fn add_reference(&self, model: &Entity) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.by_cid.insert(model.cid().clone(), model.clone());
            if let Some(key) = model.id().as_ref().and_then(identity_key) {
                state.by_id.insert(key, model.clone());
            }
        }
        let weak = self.downgrade_inner();
        self.inner.bus.listen_to(
            model.bus(),
            ALL,
            callback(move |event| {
                if let Some(inner) = weak.upgrade() {
                    Collection { inner }.on_member_event(event);
                }
            }),
        );
    }

    fn remove_reference(&self, model: &Entity) {
        model.detach_collection(self);
        self.inner.bus.stop_listening(Some(model.bus()), None, None);
    }

    /// Removes members one by one, firing `remove` (with the index each one
    /// occupied) unless silent.
    fn remove_models(&self, doomed: &[Entity], options: &SetOptions) -> Vec<Entity> {
        let mut removed = Vec::new();
        for model in doomed {
            let index = {
                let mut state = self.inner.state.borrow_mut();
                let Some(index) = state.models.iter().position(|m| m.ptr_eq(model)) else {
                    continue;
                };
                state.models.remove(index);
                state.by_cid.remove(model.cid());
                if let Some(key) = model.id().as_ref().and_then(identity_key) {
                    if state.by_id.get(&key).is_some_and(|m| m.ptr_eq(model)) {
                        state.by_id.remove(&key);
                    }
                }
                index
            };
            if !options.silent {
                model.bus().trigger(
                    "remove",
                    Payload::Remove {
                        entity: model.clone(),
                        collection: self.clone(),
                        index,
                    },
                );
            }
            self.remove_reference(model);
            removed.push(model.clone());
        }
        removed
    }

    fn on_member_event(&self, event: &ModelEvent) {
        let payload = event.payload();
        match event.name() {
            "add" | "remove" => {
                if payload.collection().is_some_and(|c| !c.ptr_eq(self)) {
                    return;
                }
            }
            "destroy" => {
                if let Some(entity) = payload.entity() {
                    self.remove(entity, &SetOptions::default());
                }
            }
            "change" => {
                if let Some(entity) = payload.entity() {
                    self.rekey(&entity);
                }
            }
            _ => {}
        }
        self.inner.bus.trigger(event.name(), payload.clone());
    }

    /// Moves a member's `by_id` entry when its identity changed.
    fn rekey(&self, entity: &Entity) {
        let id_attribute = self.kind().model().id_attribute();
        let previous = entity
            .previous(id_attribute)
            .and_then(|value| value.as_json().and_then(identity_key));
        let current = entity.id().as_ref().and_then(identity_key);
        if previous == current {
            return;
        }
        let mut state = self.inner.state.borrow_mut();
        if let Some(previous) = previous {
            if state.by_id.get(&previous).is_some_and(|m| m.ptr_eq(entity)) {
                state.by_id.remove(&previous);
            }
        }
        if let Some(current) = current {
            state.by_id.insert(current, entity.clone());
        }
    }

    /// Stable sort by the comparator. The comparator runs without any
    /// borrow held.
    fn apply_order(&self, comparator: &Comparator) {
        let mut models = self.models();
        match comparator {
            Comparator::Attribute(name) => {
                let mut keyed: Vec<(Option<Value>, Entity)> =
                    models.into_iter().map(|m| (m.get(name), m)).collect();
                keyed.sort_by(|(a, _), (b, _)| compare_values(a.as_ref(), b.as_ref()));
                models = keyed.into_iter().map(|(_, m)| m).collect();
            }
            Comparator::Key(extract) => {
                let mut keyed: Vec<(Option<Value>, Entity)> =
                    models.into_iter().map(|m| (extract(&m), m)).collect();
                keyed.sort_by(|(a, _), (b, _)| compare_values(a.as_ref(), b.as_ref()));
                models = keyed.into_iter().map(|(_, m)| m).collect();
            }
            Comparator::Order(order) => models.sort_by(|a, b| order(a, b)),
        }
        self.inner.state.borrow_mut().models = models;
    }

    fn trigger_sort(&self) {
        self.inner.bus.trigger(
            "sort",
            Payload::Sort {
                collection: self.clone(),
            },
        );
    }
}

/// Clamps an insertion index into `[0, len]`; negative values wrap once.
fn clamp_at(at: isize, len: usize) -> usize {
    let len_signed = isize::try_from(len).unwrap_or(isize::MAX);
    let wrapped = if at < 0 { at + len_signed + 1 } else { at };
    usize::try_from(wrapped.clamp(0, len_signed)).unwrap_or(0)
}

impl Emitter<Payload> for Collection {
    fn bus(&self) -> &Bus {
        &self.inner.bus
    }
}

impl IntoIterator for &Collection {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Collection");
        out.field("kind", &self.inner.kind.name());
        match self.inner.state.try_borrow() {
            Ok(state) => out.field(
                "members",
                &state.models.iter().map(Entity::cid).collect::<Vec<_>>(),
            ),
            Err(_) => out.field("members", &"<borrowed>"),
        };
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::clamp_at;

    #[test]
    fn clamp_at_wraps_negative_once() {
        assert_eq!(clamp_at(-1, 3), 3);
        assert_eq!(clamp_at(-4, 3), 0);
        assert_eq!(clamp_at(-10, 3), 0);
        assert_eq!(clamp_at(1, 3), 1);
        assert_eq!(clamp_at(9, 3), 3);
    }
}
