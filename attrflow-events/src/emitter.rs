use crate::{Callback, ContextId, EventBus};

/// Mixes the [`EventBus`] surface into a type that owns a bus.
///
/// Implementors only provide [`bus`](Emitter::bus); every other method
/// forwards to it. Entities and collections implement this so callers can
/// write `entity.on("change", cb)` and `view.listen_to(&entity, ..)`.
pub trait Emitter<P: Clone + 'static> {
    /// The bus backing this emitter.
    fn bus(&self) -> &EventBus<P>;

    fn on(&self, names: &str, callback: Callback<P>) -> &Self {
        self.bus().on(names, callback);
        self
    }

    fn on_with(&self, names: &str, callback: Callback<P>, context: ContextId) -> &Self {
        self.bus().on_with(names, callback, context);
        self
    }

    fn on_map<'a, I>(&self, map: I) -> &Self
    where
        I: IntoIterator<Item = (&'a str, Callback<P>)>,
        Self: Sized,
    {
        self.bus().on_map(map);
        self
    }

    fn once(&self, names: &str, callback: Callback<P>) -> &Self {
        self.bus().once(names, callback);
        self
    }

    fn off(
        &self,
        name: Option<&str>,
        callback: Option<&Callback<P>>,
        context: Option<ContextId>,
    ) -> &Self {
        self.bus().off(name, callback, context);
        self
    }

    fn trigger(&self, names: &str, payload: P) -> &Self {
        self.bus().trigger(names, payload);
        self
    }

    /// Listen to another emitter, tracked for [`stop_listening`](Emitter::stop_listening).
    fn listen_to<E: Emitter<P>>(&self, source: &E, names: &str, callback: Callback<P>) -> &Self
    where
        Self: Sized,
    {
        self.bus().listen_to(source.bus(), names, callback);
        self
    }

    fn listen_to_once<E: Emitter<P>>(
        &self,
        source: &E,
        names: &str,
        callback: Callback<P>,
    ) -> &Self
    where
        Self: Sized,
    {
        self.bus().listen_to_once(source.bus(), names, callback);
        self
    }

    /// Detach from one source, optionally narrowed by event name and callback.
    fn stop_listening_to<E: Emitter<P>>(
        &self,
        source: &E,
        name: Option<&str>,
        callback: Option<&Callback<P>>,
    ) -> &Self
    where
        Self: Sized,
    {
        self.bus().stop_listening(Some(source.bus()), name, callback);
        self
    }

    /// Detach from every emitter this one listens to.
    fn stop_listening(&self) -> &Self {
        self.bus().stop_listening(None, None, None);
        self
    }

    fn has_listeners(&self, name: Option<&str>) -> bool {
        self.bus().has_listeners(name)
    }

    fn listener_count(&self, name: &str) -> usize {
        self.bus().listener_count(name)
    }

    fn is_listening_to<E: Emitter<P>>(&self, source: &E) -> bool
    where
        Self: Sized,
    {
        self.bus().is_listening_to(source.bus())
    }
}

impl<P: Clone + 'static> Emitter<P> for EventBus<P> {
    fn bus(&self) -> &EventBus<P> {
        self
    }
}
