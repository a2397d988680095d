//! Event infrastructure for fieldsync-core.
//!
//! Provides `EngineEvent` for UI/monitoring and a generic `EventBus` used for
//! engine events, storage change notifications and the in-process broadcast
//! channel. Platform-specific implementations handle thread safety:
//! - Native: `Arc<EventBus>` with `RwLock` for multi-threaded Tokio runtime
//! - WASM: `Rc<EventBus>` with `RefCell` for single-threaded browser environment

use crate::model::Collection;
use serde::Serialize;

/// Events emitted by the engine for UI refresh and monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Local state of a collection changed.
    CollectionChanged {
        collection: Collection,
        /// `"local"`, `"broadcast"`, `"storage"`, `"remote"` or `"poll"`.
        origin: String,
    },
    /// A debounced or forced remote write finished.
    Flushed { collection: Collection },
    /// A background remote write failed. The next mutation re-schedules it.
    RemoteWriteFailed { collection: Collection, error: String },
    /// A poll cycle failed. Retried on the next tick.
    PollFailed { error: String },
    /// A selection record could not be bound to any current image.
    SelectionDropped {
        #[serde(rename = "instanceId")]
        instance_id: String,
        #[serde(rename = "fileName")]
        file_name: String,
        reason: String,
    },
    /// Local persistence failed; in-memory state is still current.
    StorageFailed { collection: Collection, error: String },
}

// ============================================================================
// Native (multi-threaded) implementation
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
mod platform {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock, Weak};

    /// Reference-counted handle used for shared engine collaborators.
    pub type Shared<T> = Arc<T>;

    type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

    /// Subscription handle that unsubscribes automatically when dropped.
    ///
    /// Follows the disposer pattern: hold this value to keep receiving events,
    /// drop it (or let it go out of scope) to unsubscribe.
    pub struct Subscription<E: Clone + 'static> {
        bus: Weak<EventBus<E>>,
        id: usize,
    }

    impl<E: Clone + 'static> Drop for Subscription<E> {
        fn drop(&mut self) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unsubscribe(self.id);
            }
        }
    }

    /// Event bus for publishing events to subscribers.
    ///
    /// Thread-safe for use in multi-threaded Tokio runtime.
    /// Wrap in `Arc` to enable subscriptions.
    pub struct EventBus<E: Clone + 'static> {
        callbacks: RwLock<Vec<(usize, Callback<E>)>>,
        next_id: AtomicUsize,
    }

    impl<E: Clone + 'static> Default for EventBus<E> {
        fn default() -> Self {
            Self {
                callbacks: RwLock::new(Vec::new()),
                next_id: AtomicUsize::new(0),
            }
        }
    }

    impl<E: Clone + 'static> EventBus<E> {
        pub fn new() -> Self {
            Self::default()
        }

        /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
        ///
        /// Requires `self` to be wrapped in `Arc`.
        pub fn subscribe(
            self: &Arc<Self>,
            callback: impl Fn(E) + Send + Sync + 'static,
        ) -> Subscription<E> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.callbacks
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push((id, Arc::new(callback)));
            Subscription {
                bus: Arc::downgrade(self),
                id,
            }
        }

        fn unsubscribe(&self, id: usize) {
            // Use try_write to avoid deadlock if Drop runs during panic unwinding
            // while a read lock is held (e.g., during emit).
            if let Ok(mut guard) = self.callbacks.try_write() {
                guard.retain(|(i, _)| *i != id);
            }
        }

        pub fn subscriber_count(&self) -> usize {
            self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
        }

        /// Emit an event to all subscribers.
        pub fn emit(&self, event: E) {
            // Clone the callback list to prevent deadlock if a callback calls subscribe.
            let callbacks: Vec<_> = self
                .callbacks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();

            for callback in callbacks {
                callback(event.clone());
            }
        }
    }
}

// ============================================================================
// WASM (single-threaded) implementation
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod platform {
    use std::cell::{Cell, RefCell};
    use std::rc::{Rc, Weak};

    /// Reference-counted handle used for shared engine collaborators.
    pub type Shared<T> = Rc<T>;

    type Callback<E> = Rc<dyn Fn(E)>;

    /// Subscription handle that unsubscribes automatically when dropped.
    pub struct Subscription<E: Clone + 'static> {
        bus: Weak<EventBus<E>>,
        id: usize,
    }

    impl<E: Clone + 'static> Drop for Subscription<E> {
        fn drop(&mut self) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unsubscribe(self.id);
            }
        }
    }

    /// Event bus for publishing events to subscribers.
    ///
    /// Single-threaded for WASM browser environment.
    /// Wrap in `Rc` to enable subscriptions.
    pub struct EventBus<E: Clone + 'static> {
        callbacks: RefCell<Vec<(usize, Callback<E>)>>,
        next_id: Cell<usize>,
    }

    impl<E: Clone + 'static> Default for EventBus<E> {
        fn default() -> Self {
            Self {
                callbacks: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }
        }
    }

    impl<E: Clone + 'static> EventBus<E> {
        pub fn new() -> Self {
            Self::default()
        }

        /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
        ///
        /// Requires `self` to be wrapped in `Rc`.
        pub fn subscribe(self: &Rc<Self>, callback: impl Fn(E) + 'static) -> Subscription<E> {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            self.callbacks.borrow_mut().push((id, Rc::new(callback)));
            Subscription {
                bus: Rc::downgrade(self),
                id,
            }
        }

        fn unsubscribe(&self, id: usize) {
            self.callbacks.borrow_mut().retain(|(i, _)| *i != id);
        }

        pub fn subscriber_count(&self) -> usize {
            self.callbacks.borrow().len()
        }

        /// Emit an event to all subscribers.
        pub fn emit(&self, event: E) {
            // Clone the callback list to prevent panic if a callback calls subscribe.
            let callbacks: Vec<_> = self
                .callbacks
                .borrow()
                .iter()
                .map(|(_, cb)| Rc::clone(cb))
                .collect();

            for callback in callbacks {
                callback(event.clone());
            }
        }
    }
}

pub use platform::*;
