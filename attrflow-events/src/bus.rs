//! Listener table and dispatch.
//!
//! Every bus keeps three tables:
//! - `handlers`: event name → ordered listeners
//! - `listeners`: buses that registered on this one through `listen_to`
//! - `listening_to`: buses this one registered on through `listen_to`
//!
//! The last two share one reference-counted `Listening` record per
//! (listener, source) pair. Its count tracks how many handlers on the source
//! belong to the pair; when it reaches zero the record is dropped from both
//! sides.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Wildcard event name. Listeners bound to it run after the named
/// listeners of every event and can read the real name from [`Event::name`].
pub const ALL: &str = "all";

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Identifies a listener context.
///
/// Every bus has one (its [`EventBus::id`]); standalone contexts can be
/// created to group callbacks for a later targeted [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocates a new process-unique context.
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// A delivered event: its name plus the payload passed to `trigger`.
#[derive(Debug, Clone)]
pub struct Event<P> {
    name: String,
    payload: P,
}

impl<P> Event<P> {
    /// Creates an event.
    pub fn new(name: impl Into<String>, payload: P) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// The event name (never `"all"` unless `"all"` itself was triggered).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload.
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Consumes the event, returning its payload.
    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// A listener callback. Identity (for [`EventBus::off`]) is `Rc` identity,
/// so keep a clone of the callback if it must be removed later.
pub type Callback<P> = Rc<dyn Fn(&Event<P>)>;

/// Wraps a closure into a [`Callback`].
pub fn callback<P, F>(f: F) -> Callback<P>
where
    F: Fn(&Event<P>) + 'static,
{
    Rc::new(f)
}

struct Handler<P> {
    serial: u64,
    /// What dispatch invokes (a one-shot wrapper for `once`).
    callback: Callback<P>,
    /// What `off` matches against: the callback the caller registered.
    key: Callback<P>,
    context: Option<ContextId>,
    listening: Option<Rc<Listening<P>>>,
}

impl<P> Clone for Handler<P> {
    fn clone(&self) -> Self {
        Self {
            serial: self.serial,
            callback: Rc::clone(&self.callback),
            key: Rc::clone(&self.key),
            context: self.context,
            listening: self.listening.clone(),
        }
    }
}

struct Listening<P> {
    listener: Weak<BusInner<P>>,
    listener_id: ContextId,
    source: Weak<BusInner<P>>,
    source_id: ContextId,
    count: Cell<usize>,
}

impl<P> Listening<P> {
    fn detach(&self) {
        if let Some(source) = self.source.upgrade() {
            source.listeners.borrow_mut().remove(&self.listener_id);
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.listening_to.borrow_mut().remove(&self.source_id);
        }
    }
}

struct BusInner<P> {
    id: ContextId,
    next_serial: Cell<u64>,
    handlers: RefCell<HashMap<String, Vec<Handler<P>>>>,
    listeners: RefCell<HashMap<ContextId, Rc<Listening<P>>>>,
    listening_to: RefCell<HashMap<ContextId, Rc<Listening<P>>>>,
}

/// A synchronous publish/subscribe bus.
///
/// Cloning a bus creates a new handle to the **same** listener table.
pub struct EventBus<P> {
    inner: Rc<BusInner<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<String> = self
            .inner
            .handlers
            .try_borrow()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("events", &events)
            .finish()
    }
}

impl<P: Clone + 'static> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone + 'static> EventBus<P> {
    /// Creates a bus with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(BusInner {
                id: ContextId::new(),
                next_serial: Cell::new(0),
                handlers: RefCell::new(HashMap::new()),
                listeners: RefCell::new(HashMap::new()),
                listening_to: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The context this bus uses when it listens to other buses.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Returns true if both handles point at the same bus.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Binds `callback` to every whitespace-separated name in `names`.
    pub fn on(&self, names: &str, callback: Callback<P>) -> &Self {
        self.register(names, &callback, None, None, false);
        self
    }

    /// Like [`on`](Self::on), tagging the bindings with `context`.
    pub fn on_with(&self, names: &str, callback: Callback<P>, context: ContextId) -> &Self {
        self.register(names, &callback, Some(context), None, false);
        self
    }

    /// Binds each `(name, callback)` pair of an event map.
    pub fn on_map<'a, I>(&self, map: I) -> &Self
    where
        I: IntoIterator<Item = (&'a str, Callback<P>)>,
    {
        for (names, callback) in map {
            self.register(names, &callback, None, None, false);
        }
        self
    }

    /// Binds `callback` so that it removes itself after its first run.
    ///
    /// With several names each binding fires and unregisters on its own.
    pub fn once(&self, names: &str, callback: Callback<P>) -> &Self {
        self.register(names, &callback, None, None, true);
        self
    }

    /// Like [`once`](Self::once), tagging the bindings with `context`.
    pub fn once_with(&self, names: &str, callback: Callback<P>, context: ContextId) -> &Self {
        self.register(names, &callback, Some(context), None, true);
        self
    }

    /// Removes listeners matching every given filter.
    ///
    /// `name` restricts to those events, `callback` to bindings of that
    /// callback (one-shot bindings match their original callback) and
    /// `context` to bindings tagged with it. With no filter at all this is
    /// [`off_all`](Self::off_all).
    pub fn off(
        &self,
        name: Option<&str>,
        callback: Option<&Callback<P>>,
        context: Option<ContextId>,
    ) -> &Self {
        if name.is_none() && callback.is_none() && context.is_none() {
            return self.off_all();
        }
        let names: Option<Vec<String>> =
            name.map(|n| n.split_whitespace().map(str::to_owned).collect());
        self.remove_where(names, |handler| {
            callback.is_none_or(|cb| Rc::ptr_eq(cb, &handler.key))
                && context.is_none_or(|ctx| handler.context == Some(ctx))
        });
        self
    }

    /// Removes every listener, including the bookkeeping of buses that
    /// listen to this one.
    pub fn off_all(&self) -> &Self {
        let released: Vec<Rc<Listening<P>>> = self
            .inner
            .listeners
            .borrow_mut()
            .drain()
            .map(|(_, listening)| listening)
            .collect();
        for listening in released {
            if let Some(listener) = listening.listener.upgrade() {
                listener
                    .listening_to
                    .borrow_mut()
                    .remove(&listening.source_id);
            }
        }
        self.inner.handlers.borrow_mut().clear();
        trace!(bus = %self.id(), "cleared all listeners");
        self
    }

    /// Delivers `payload` to the listeners of every whitespace-separated
    /// name in `names`, then to the `"all"` listeners.
    ///
    /// Dispatch walks a snapshot of the listener list, so bindings added or
    /// removed by a callback take effect from the next trigger on.
    pub fn trigger(&self, names: &str, payload: P) -> &Self {
        for name in names.split_whitespace() {
            self.dispatch(name, payload.clone());
        }
        self
    }

    /// Tells this bus to listen to `source`, tracking the subscription so
    /// [`stop_listening`](Self::stop_listening) can undo it.
    pub fn listen_to(&self, source: &EventBus<P>, names: &str, callback: Callback<P>) -> &Self {
        if names.split_whitespace().next().is_none() {
            return self;
        }
        let listening = self.listening_for(source);
        source.register(names, &callback, Some(self.id()), Some(&listening), false);
        self
    }

    /// One-shot variant of [`listen_to`](Self::listen_to).
    pub fn listen_to_once(
        &self,
        source: &EventBus<P>,
        names: &str,
        callback: Callback<P>,
    ) -> &Self {
        if names.split_whitespace().next().is_none() {
            return self;
        }
        let listening = self.listening_for(source);
        source.register(names, &callback, Some(self.id()), Some(&listening), true);
        self
    }

    /// Removes subscriptions this bus made on other buses.
    ///
    /// `source: None` means every bus this one listens to; `name` and
    /// `callback` narrow the removal as in [`off`](Self::off).
    pub fn stop_listening(
        &self,
        source: Option<&EventBus<P>>,
        name: Option<&str>,
        callback: Option<&Callback<P>>,
    ) -> &Self {
        let records: Vec<Rc<Listening<P>>> = {
            let listening_to = self.inner.listening_to.borrow();
            match source {
                Some(source) => listening_to.get(&source.id()).cloned().into_iter().collect(),
                None => listening_to.values().cloned().collect(),
            }
        };
        for record in records {
            match record.source.upgrade() {
                Some(inner) => {
                    EventBus { inner }.off(name, callback, Some(self.id()));
                }
                None => {
                    self.inner
                        .listening_to
                        .borrow_mut()
                        .remove(&record.source_id);
                }
            }
        }
        self
    }

    /// Returns true if any listener is bound to `name` (any event for `None`).
    #[must_use]
    pub fn has_listeners(&self, name: Option<&str>) -> bool {
        let handlers = self.inner.handlers.borrow();
        match name {
            Some(name) => handlers.get(name).is_some_and(|list| !list.is_empty()),
            None => handlers.values().any(|list| !list.is_empty()),
        }
    }

    /// Number of listeners bound to `name`.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .handlers
            .borrow()
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Returns true if this bus holds a `listen_to` subscription on `source`.
    #[must_use]
    pub fn is_listening_to(&self, source: &EventBus<P>) -> bool {
        self.inner.listening_to.borrow().contains_key(&source.id())
    }

    /// Number of buses this one currently listens to.
    #[must_use]
    pub fn listening_count(&self) -> usize {
        self.inner.listening_to.borrow().len()
    }

    fn next_serial(&self) -> u64 {
        let serial = self.inner.next_serial.get();
        self.inner.next_serial.set(serial + 1);
        serial
    }

    fn register(
        &self,
        names: &str,
        callback: &Callback<P>,
        context: Option<ContextId>,
        listening: Option<&Rc<Listening<P>>>,
        once: bool,
    ) {
        for name in names.split_whitespace() {
            let serial = self.next_serial();
            let invoked = if once {
                self.once_wrapper(name, serial, Rc::clone(callback))
            } else {
                Rc::clone(callback)
            };
            if let Some(listening) = listening {
                listening.count.set(listening.count.get() + 1);
            }
            self.inner
                .handlers
                .borrow_mut()
                .entry(name.to_owned())
                .or_default()
                .push(Handler {
                    serial,
                    callback: invoked,
                    key: Rc::clone(callback),
                    context,
                    listening: listening.cloned(),
                });
        }
    }

    fn once_wrapper(&self, name: &str, serial: u64, callback: Callback<P>) -> Callback<P> {
        let bus = Rc::downgrade(&self.inner);
        let name = name.to_owned();
        let fired = Cell::new(false);
        Rc::new(move |event: &Event<P>| {
            if fired.replace(true) {
                return;
            }
            if let Some(inner) = bus.upgrade() {
                EventBus { inner }.remove_where(Some(vec![name.clone()]), |h| h.serial == serial);
            }
            callback(event);
        })
    }

    fn listening_for(&self, source: &EventBus<P>) -> Rc<Listening<P>> {
        if let Some(existing) = self.inner.listening_to.borrow().get(&source.id()) {
            return Rc::clone(existing);
        }
        let listening = Rc::new(Listening {
            listener: Rc::downgrade(&self.inner),
            listener_id: self.id(),
            source: Rc::downgrade(&source.inner),
            source_id: source.id(),
            count: Cell::new(0),
        });
        self.inner
            .listening_to
            .borrow_mut()
            .insert(source.id(), Rc::clone(&listening));
        source
            .inner
            .listeners
            .borrow_mut()
            .insert(self.id(), Rc::clone(&listening));
        listening
    }

    fn remove_where<F>(&self, names: Option<Vec<String>>, mut matches: F)
    where
        F: FnMut(&Handler<P>) -> bool,
    {
        let mut released = Vec::new();
        {
            let mut handlers = self.inner.handlers.borrow_mut();
            let names = names.unwrap_or_else(|| handlers.keys().cloned().collect());
            for name in names {
                let Some(list) = handlers.get_mut(&name) else {
                    continue;
                };
                list.retain(|handler| {
                    if !matches(handler) {
                        return true;
                    }
                    if let Some(listening) = &handler.listening {
                        released.push(Rc::clone(listening));
                    }
                    false
                });
                if list.is_empty() {
                    handlers.remove(&name);
                }
            }
        }
        for listening in released {
            let remaining = listening.count.get().saturating_sub(1);
            listening.count.set(remaining);
            if remaining == 0 {
                listening.detach();
            }
        }
    }

    fn dispatch(&self, name: &str, payload: P) {
        let (named, wildcard) = {
            let handlers = self.inner.handlers.borrow();
            let snapshot = |key: &str| -> Vec<Callback<P>> {
                handlers
                    .get(key)
                    .map(|list| list.iter().map(|h| Rc::clone(&h.callback)).collect())
                    .unwrap_or_default()
            };
            let wildcard = if name == ALL { Vec::new() } else { snapshot(ALL) };
            (snapshot(name), wildcard)
        };
        if named.is_empty() && wildcard.is_empty() {
            return;
        }
        let event = Event::new(name, payload);
        for callback in named.iter().chain(wildcard.iter()) {
            callback(&event);
        }
    }
}
