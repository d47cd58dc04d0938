//! Synchronous event bus for attrflow.
//!
//! This crate provides the publish/subscribe primitive that entities and
//! collections are built on:
//! - [`EventBus`]: ordered, named listeners plus the `"all"` wildcard
//! - [`Emitter`]: mixes the bus surface into any type that owns a bus
//! - [`ContextId`]: identifies a listener context for targeted removal
//!
//! Delivery is fully synchronous and single-threaded. A `trigger` runs every
//! matching listener to completion before it returns, and listeners may
//! trigger again (depth-first). Buses are cheap `Rc` handles; cloning one
//! yields another handle to the same listener table.

mod bus;
mod emitter;

pub use bus::{ALL, Callback, ContextId, Event, EventBus, callback};
pub use emitter::Emitter;
