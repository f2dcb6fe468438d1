//! At-most-one-in-flight readback coordination.
//!
//! The first `read` of an id registers a pending entry and owns the actual
//! GPU readback; later reads that arrive before completion subscribe to
//! the same entry and resolve with the same values. A `dispose` that lands
//! while a read is pending is deferred until the read completes.

use futures::channel::oneshot;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tensorloom_api::{DataId, HostValues};

#[derive(Default)]
pub struct PendingReads {
    subscribers: Mutex<HashMap<DataId, Vec<oneshot::Sender<HostValues>>>>,
    deferred_disposal: Mutex<HashSet<DataId>>,
}

impl PendingReads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, id: DataId) -> bool {
        self.subscribers
            .lock()
            .expect("pending reads poisoned")
            .contains_key(&id)
    }

    /// Register `id` as having an in-flight read. Returns false if one was
    /// already registered (the caller must subscribe instead of reading).
    pub fn begin(&self, id: DataId) -> bool {
        let mut guard = self.subscribers.lock().expect("pending reads poisoned");
        if guard.contains_key(&id) {
            return false;
        }
        guard.insert(id, Vec::new());
        true
    }

    /// Subscribe to the in-flight read of `id`. Must only be called while
    /// a read is pending.
    pub fn subscribe(&self, id: DataId) -> oneshot::Receiver<HostValues> {
        let (tx, rx) = oneshot::channel();
        self.subscribers
            .lock()
            .expect("pending reads poisoned")
            .entry(id)
            .or_default()
            .push(tx);
        rx
    }

    pub fn mark_deferred_disposal(&self, id: DataId) {
        self.deferred_disposal
            .lock()
            .expect("pending disposal poisoned")
            .insert(id);
    }

    /// Resolve every subscriber with `values`, clear the pending entry, and
    /// report whether a deferred disposal was queued for `id`.
    pub fn complete(&self, id: DataId, values: &HostValues) -> bool {
        let senders = self
            .subscribers
            .lock()
            .expect("pending reads poisoned")
            .remove(&id)
            .unwrap_or_default();
        for tx in senders {
            // A dropped subscriber future is fine; everyone else resolves.
            let _ = tx.send(values.clone());
        }
        self.deferred_disposal
            .lock()
            .expect("pending disposal poisoned")
            .remove(&id)
    }

    /// Abandon the in-flight read of `id`: subscribers observe a canceled
    /// channel, the entry clears, and any deferred-disposal mark is dropped.
    pub fn fail(&self, id: DataId) {
        self.subscribers
            .lock()
            .expect("pending reads poisoned")
            .remove(&id);
        self.deferred_disposal
            .lock()
            .expect("pending disposal poisoned")
            .remove(&id);
    }

    pub fn outstanding(&self) -> usize {
        self.subscribers
            .lock()
            .expect("pending reads poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_joins_instead_of_owning() {
        let pending = PendingReads::new();
        let id = DataId::next();
        assert!(pending.begin(id));
        assert!(!pending.begin(id));
        assert!(pending.is_pending(id));
    }

    #[test]
    fn complete_resolves_all_subscribers_with_equal_values() {
        let pending = PendingReads::new();
        let id = DataId::next();
        assert!(pending.begin(id));
        let rx1 = pending.subscribe(id);
        let rx2 = pending.subscribe(id);
        let values = HostValues::F32(vec![1.0, 2.0]);
        assert!(!pending.complete(id, &values));
        assert_eq!(pollster::block_on(rx1).unwrap(), values);
        assert_eq!(pollster::block_on(rx2).unwrap(), values);
        assert!(!pending.is_pending(id));
    }

    #[test]
    fn deferred_disposal_is_reported_once_on_completion() {
        let pending = PendingReads::new();
        let id = DataId::next();
        assert!(pending.begin(id));
        pending.mark_deferred_disposal(id);
        assert!(pending.complete(id, &HostValues::F32(vec![0.0])));
        assert!(pending.begin(id));
        assert!(!pending.complete(id, &HostValues::F32(vec![0.0])));
    }
}
