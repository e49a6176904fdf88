//! Pure-event subscriber registry, shared by both channel endpoints.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::error::panic_message;

pub type EventListener = Arc<dyn Fn(&[Value]) + Send + Sync>;

pub fn listener<F>(f: F) -> EventListener
where
    F: Fn(&[Value]) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Listeners keyed by event name, kept in registration order.
///
/// The same listener may be registered more than once and then fires once
/// per registration.
#[derive(Default)]
pub struct EventRegistry {
    listeners: Mutex<HashMap<String, Vec<EventListener>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<EventListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, event_name: &str, listener: EventListener) {
        self.lock()
            .entry(event_name.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove the most recent registration of `listener` (compared by identity).
    pub fn off(&self, event_name: &str, listener: &EventListener) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(event_name) else {
            return false;
        };
        let Some(pos) = list.iter().rposition(|l| Arc::ptr_eq(l, listener)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            listeners.remove(event_name);
        }
        true
    }

    /// Invoke every listener for `event_name`; returns how many fired.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe while handling an event. A panicking listener is logged
    /// and the remaining listeners still run.
    pub fn dispatch(&self, event_name: &str, args: &[Value]) -> usize {
        let snapshot = match self.lock().get(event_name) {
            Some(list) => list.clone(),
            None => return 0,
        };
        for listener in &snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(args))) {
                let message = panic_message(panic.as_ref());
                tracing::error!(%event_name, %message, "Event listener panicked");
            }
        }
        snapshot.len()
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.lock().get(event_name).map_or(0, Vec::len)
    }
}
