use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::status::{lock, same_handle};
use crate::transport::EventCallback;

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    callback: EventCallback,
    once: bool,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    events: HashMap<String, Vec<ListenerEntry>>,
}

/// Per-event ordered listener lists with one-shot support.
///
/// A persistent registration is a no-op while any entry for the event, one-shot
/// or not, already holds the same callback handle. One-shot registrations are
/// always appended.
#[derive(Default)]
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a new entry was appended.
    pub fn register(&self, event: &str, callback: EventCallback, once: bool) -> bool {
        let mut state = lock(&self.state);

        if !once {
            let duplicate = state.events.get(event).map_or(false, |entries| {
                entries
                    .iter()
                    .any(|e| same_handle(&e.callback, &callback))
            });
            if duplicate {
                return false;
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state
            .events
            .entry(event.to_string())
            .or_default()
            .push(ListenerEntry { id, callback, once });
        true
    }

    /// Runs every listener for `event` in registration order, awaiting each
    /// before the next, then drops the one-shot entries that fired.
    ///
    /// The pass works on a snapshot, so listeners registered by a callback
    /// during the pass only take part in the next dispatch. Returns the number
    /// of callbacks invoked.
    pub async fn dispatch(&self, event: &str, payload: Value) -> usize {
        let snapshot = {
            let state = lock(&self.state);
            match state.events.get(event) {
                Some(entries) if !entries.is_empty() => entries.clone(),
                _ => return 0,
            }
        };

        for entry in &snapshot {
            (entry.callback)(payload.clone()).await;
        }

        let fired_once: Vec<u64> = snapshot.iter().filter(|e| e.once).map(|e| e.id).collect();
        if !fired_once.is_empty() {
            let mut state = lock(&self.state);
            if let Some(entries) = state.events.get_mut(event) {
                entries.retain(|e| !fired_once.contains(&e.id));
            }
        }

        snapshot.len()
    }

    /// Removes every entry for `event` holding this callback handle. Returns
    /// how many were removed.
    pub fn unregister(&self, event: &str, callback: &EventCallback) -> usize {
        // Removed entries are dropped after the lock is released: a callback
        // may own the last handle to something that unregisters on drop.
        let removed: Vec<ListenerEntry> = {
            let mut state = lock(&self.state);
            let Some(entries) = state.events.get_mut(event) else {
                return 0;
            };

            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(entries)
                .into_iter()
                .partition(|e| same_handle(&e.callback, callback));
            if kept.is_empty() {
                state.events.remove(event);
            } else {
                *entries = kept;
            }
            removed
        };
        removed.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.state).events.get(event).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        lock(&self.state).events.clear();
    }
}
