//! Observer slots for connection and message notifications.
//!
//! A slot holds at most one handler. Emitting an event isolates the handler:
//! a panic inside it is caught and logged, and the emitting loop carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct EventSlot<T> {
    name: &'static str,
    handler: RwLock<Option<Callback<T>>>,
}

impl<T> EventSlot<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handler: RwLock::new(None),
        }
    }

    /// Install a handler, replacing any previous one
    pub fn set<F>(&self, handler: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.set_arc(Arc::new(handler));
    }

    pub fn set_arc(&self, handler: Callback<T>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn is_set(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Invoke the handler if one is installed. Returns false when the slot is empty.
    pub fn emit(&self, event: T) -> bool {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    warn!(event = self.name, "Event handler panicked");
                }
                true
            }
            None => false,
        }
    }
}

impl<T> std::fmt::Debug for EventSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSlot")
            .field("name", &self.name)
            .field("set", &self.is_set())
            .finish()
    }
}
