//! Minimal typed pub/sub. Each protocol object owns one `Callbacks` list per
//! event instead of inheriting from a generic event base class; callbacks run
//! synchronously on the dispatching task, so they never overlap.

use std::sync::Arc;

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Callbacks<T> {
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn emit(&self, value: &T) {
        // Snapshot so a callback may subscribe without deadlocking.
        let listeners: Vec<Listener<T>> = self.listeners.lock().clone();
        for listener in listeners {
            listener(value);
        }
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}
