//! Typed handler registration
//!
//! A component that fires events owns one [`HandlerSlot`] per event. Another
//! component registers interest by storing a handler in the slot, without
//! either side knowing the other's concrete type.
//!
//! Slots hold a single handler: registering again replaces the previous one.
//! Firing calls the handler synchronously on the firing thread; firing an
//! empty slot does nothing.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Zero-argument handler
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// One-argument handler
pub type Callback1<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Wrap a closure as a [`Callback`]
pub fn callback<F>(f: F) -> Callback
where
    F: Fn() + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`Callback1`]
pub fn callback1<A, F>(f: F) -> Callback1<A>
where
    F: Fn(A) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Registration slot for a single event handler
pub struct HandlerSlot<F: ?Sized> {
    handler: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for HandlerSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> HandlerSlot<F> {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }

    /// Register a handler, replacing any existing one.
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn set(&self, handler: Arc<F>) -> bool {
        self.handler.lock().replace(handler).is_some()
    }

    /// Remove the registered handler, returning whether one was present
    pub fn clear(&self) -> bool {
        self.handler.lock().take().is_some()
    }

    pub fn is_set(&self) -> bool {
        self.handler.lock().is_some()
    }

    // The lock is released before the handler runs, so handlers may
    // re-register or fire other slots.
    fn current(&self) -> Option<Arc<F>> {
        self.handler.lock().clone()
    }
}

impl HandlerSlot<dyn Fn() + Send + Sync> {
    /// Invoke the handler on the calling thread.
    ///
    /// Returns `false` (and does nothing) when no handler is registered.
    pub fn fire(&self) -> bool {
        match self.current() {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl<A> HandlerSlot<dyn Fn(A) + Send + Sync> {
    /// Invoke the handler with `arg` on the calling thread.
    ///
    /// Returns `false` (and drops `arg`) when no handler is registered.
    pub fn fire_with(&self, arg: A) -> bool {
        match self.current() {
            Some(handler) => {
                handler(arg);
                true
            }
            None => false,
        }
    }
}

impl<F: ?Sized> fmt::Debug for HandlerSlot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("registered", &self.is_set())
            .finish()
    }
}
