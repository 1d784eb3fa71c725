//! Per-connection table of live calls.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::core::frame::CallId;

/// Live calls of one connection keyed by call id, with an idle signal
pub(crate) struct CallTable<S> {
    slots: Mutex<HashMap<CallId, S>>,
    idle: Notify,
}

impl<S> CallTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, S>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a call; returns false if the id is already live
    pub(crate) fn insert(&self, id: CallId, slot: S) -> bool {
        let mut slots = self.lock();
        if slots.contains_key(&id) {
            return false;
        }
        slots.insert(id, slot);
        true
    }

    pub(crate) fn remove(&self, id: CallId) -> Option<S> {
        let mut slots = self.lock();
        let removed = slots.remove(&id);
        if removed.is_some() && slots.is_empty() {
            self.idle.notify_waiters();
        }
        removed
    }

    /// Run `f` against a live call
    pub(crate) fn with<R>(&self, id: CallId, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.lock().get_mut(&id).map(f)
    }

    pub(crate) fn contains(&self, id: CallId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Remove every call
    pub(crate) fn drain(&self) -> Vec<(CallId, S)> {
        let mut slots = self.lock();
        let drained: Vec<_> = slots.drain().collect();
        if !drained.is_empty() {
            self.idle.notify_waiters();
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolve once no call is live
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
