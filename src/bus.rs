//! Generic, order-preserving subscriber registry (spec.md §4.4).
//!
//! Both the File Manager's size-change notifications and the Row
//! Emitter's per-row events are built on this bus. The publish discipline
//! is fixed: copy the current callback list under a short lock, then
//! invoke callbacks without holding it, so subscribe/unsubscribe calls
//! made from inside a callback take effect on the *next* publish rather
//! than deadlocking or racing this one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

type Callback<T> = dyn Fn(T) -> Result<()> + Send + Sync;

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    cb: Arc<Callback<T>>,
}

/// A handle returned by [`SubscriberBus::subscribe`]. `unsubscribe` is
/// idempotent: calling it any number of times after the first has no
/// further effect.
#[derive(Clone)]
pub struct Unsubscribe {
    active: Arc<AtomicBool>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Order-preserving callback registry, generic over the event payload `T`.
pub struct SubscriberBus<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T: Clone> Default for SubscriberBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SubscriberBus<T> {
    pub fn new() -> Self {
        SubscriberBus {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback. Registration order is preserved in every
    /// subsequent [`publish`](Self::publish) snapshot.
    pub fn subscribe<F>(&self, cb: F) -> Unsubscribe
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push(Entry {
            id,
            active: active.clone(),
            cb: Arc::new(cb),
        });
        Unsubscribe { active }
    }

    /// A registration-ordered snapshot of currently active callbacks.
    pub fn snapshot(&self) -> Vec<Arc<Callback<T>>> {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.active.load(Ordering::SeqCst));
        entries.iter().map(|e| e.cb.clone()).collect()
    }

    /// Publish `value` to every active subscriber, in registration order,
    /// without holding the registry lock during dispatch. Stops and
    /// returns the first callback error; later subscribers in the same
    /// publish do not run.
    pub fn publish(&self, value: T) -> Result<()> {
        for cb in self.snapshot() {
            cb(value.clone())?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn preserves_registration_order() {
        let bus: SubscriberBus<u32> = SubscriberBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            bus.subscribe(move |v| {
                order.lock().push((i, v));
                Ok(())
            });
        }
        bus.publish(42).unwrap();
        let got = order.lock();
        for (idx, (i, v)) in got.iter().enumerate() {
            assert_eq!(*i, idx as i32);
            assert_eq!(*v, 42);
        }
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus: SubscriberBus<u32> = SubscriberBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(1).unwrap();
        handle.unsubscribe();
        handle.unsubscribe(); // idempotent
        bus.publish(2).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_error_stops_the_chain() {
        let bus: SubscriberBus<u32> = SubscriberBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| Err(crate::error::Error::KeyNotFound));
        let r = ran.clone();
        bus.subscribe(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(bus.publish(1).is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_during_publish_takes_effect_next_round() {
        let bus: Arc<SubscriberBus<u32>> = Arc::new(SubscriberBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let bus2 = bus.clone();
        let seen2 = seen.clone();
        bus.subscribe(move |_| {
            let s = seen2.clone();
            bus2.subscribe(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });
        bus.publish(1).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(2).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
