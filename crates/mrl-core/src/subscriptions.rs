//! Subscription index used for inbound fan-out.
//!
//! Three independent mappings, each from a key to an ordered callback list:
//!
//! - by full sender name (`servo1@R9`)
//! - by method name (`onServoEvent`)
//! - by sender and notification name (`servo1@R9.onServoEvent`)
//!
//! Registration order is invocation order. Nothing is deduplicated, so a
//! callback registered twice fires twice. Removal drops the first entry that
//! points at the same callback.

use crate::envelope::Envelope;
use crate::error::{MrlError, Result};
use crate::naming;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Subscriber callback for inbound envelopes.
pub type Callback = Arc<dyn Fn(&Envelope) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

type Index = RwLock<HashMap<String, Vec<Callback>>>;

fn add(index: &Index, key: String, cb: Callback) {
    index
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key)
        .or_default()
        .push(cb);
}

fn remove_first(index: &Index, key: &str, cb: &Callback) -> bool {
    let mut map = index.write().unwrap_or_else(PoisonError::into_inner);
    let Some(list) = map.get_mut(key) else {
        return false;
    };
    let Some(pos) = list.iter().position(|c| same_callback(c, cb)) else {
        return false;
    };
    list.remove(pos);
    if list.is_empty() {
        map.remove(key);
    }
    true
}

fn snapshot(index: &Index, key: &str) -> Vec<Callback> {
    index
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .cloned()
        .unwrap_or_default()
}

/// Move callbacks from keys `rename` maps to a new key, ahead of callbacks
/// already stored there. Returns how many keys moved.
fn rekey(index: &Index, rename: impl Fn(&str) -> Option<String>) -> usize {
    let mut map = index.write().unwrap_or_else(PoisonError::into_inner);
    let moves: Vec<(String, String)> = map
        .keys()
        .filter_map(|key| rename(key).map(|new_key| (key.clone(), new_key)))
        .collect();
    for (old_key, new_key) in &moves {
        if let Some(mut moved) = map.remove(old_key) {
            let target = map.entry(new_key.clone()).or_default();
            moved.append(target);
            *target = moved;
        }
    }
    moves.len()
}

/// The three dispatch indices of an endpoint.
#[derive(Default)]
pub struct SubscriptionIndex {
    by_name: Index,
    by_method: Index,
    by_name_method: Index,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every message sent by `full_name`.
    pub fn subscribe_by_name(&self, full_name: impl Into<String>, cb: Callback) {
        add(&self.by_name, full_name.into(), cb);
    }

    /// Subscribe to every message with the given method, whatever the sender.
    pub fn subscribe_by_method(&self, method: impl Into<String>, cb: Callback) {
        add(&self.by_method, method.into(), cb);
    }

    /// Subscribe to one method of one sender.
    ///
    /// `method` may be the topic (`publishServoEvent`) or its notification
    /// name (`onServoEvent`); both target the same key.
    pub fn subscribe_by_name_method(&self, full_name: &str, method: &str, cb: Callback) {
        add(
            &self.by_name_method,
            naming::name_method_key(full_name, method),
            cb,
        );
    }

    pub fn unsubscribe_by_name(&self, full_name: &str, cb: &Callback) -> bool {
        remove_first(&self.by_name, full_name, cb)
    }

    pub fn unsubscribe_by_method(&self, method: &str, cb: &Callback) -> bool {
        remove_first(&self.by_method, method, cb)
    }

    pub fn unsubscribe_by_name_method(&self, full_name: &str, method: &str, cb: &Callback) -> bool {
        remove_first(
            &self.by_name_method,
            &naming::name_method_key(full_name, method),
            cb,
        )
    }

    /// Callbacks subscribed to `full_name`, in registration order.
    pub fn by_name(&self, full_name: &str) -> Vec<Callback> {
        snapshot(&self.by_name, full_name)
    }

    pub fn by_method(&self, method: &str) -> Vec<Callback> {
        snapshot(&self.by_method, method)
    }

    /// Callbacks for an inbound `(sender, method)` pair.
    pub fn by_name_method(&self, full_name: &str, method: &str) -> Vec<Callback> {
        snapshot(
            &self.by_name_method,
            &naming::name_method_key(full_name, method),
        )
    }

    /// Qualify name keys stored before the remote id was known with
    /// `remote_id`. Returns how many keys moved.
    pub fn qualify(&self, remote_id: &str) -> usize {
        let by_name = rekey(&self.by_name, |key| {
            (!naming::is_full_name(key)).then(|| naming::full_name_of(key, remote_id))
        });
        let by_name_method = rekey(&self.by_name_method, |key| {
            let (name, method) = key.rsplit_once('.')?;
            (!naming::is_full_name(name))
                .then(|| format!("{}.{}", naming::full_name_of(name, remote_id), method))
        });
        by_name + by_name_method
    }

    /// Total number of registered callbacks across all indices.
    pub fn len(&self) -> usize {
        [&self.by_name, &self.by_method, &self.by_name_method]
            .iter()
            .map(|index| {
                index
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = |index: &Index| {
            let mut keys: Vec<_> = index
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect();
            keys.sort();
            keys
        };
        f.debug_struct("SubscriptionIndex")
            .field("by_name", &keys(&self.by_name))
            .field("by_method", &keys(&self.by_method))
            .field("by_name_method", &keys(&self.by_name_method))
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

/// Run one subscriber, turning an error or a panic into a [`MrlError::Callback`].
pub(crate) fn invoke(key: &str, cb: &Callback, envelope: &Envelope) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| cb(envelope))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MrlError::Callback {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(payload) => Err(MrlError::Callback {
            key: key.to_string(),
            message: format!("panicked: {}", panic_message(payload)),
        }),
    }
}

/// Plain notification listeners, used for connectivity and registry events.
pub struct Listeners<A: ?Sized> {
    label: &'static str,
    listeners: RwLock<Vec<Arc<dyn Fn(&A) + Send + Sync>>>,
}

impl<A: ?Sized> Listeners<A> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, f: F)
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    /// Call every listener in order. A panicking listener is logged and skipped.
    pub fn notify(&self, value: &A) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
                warn!(
                    "{} listener panicked: {}",
                    self.label,
                    panic_message(payload)
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: ?Sized> fmt::Debug for Listeners<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("label", &self.label)
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_duplicate_subscription_fires_twice_in_order() {
        let index = SubscriptionIndex::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = Arc::clone(&seen);
            callback(move |_| {
                seen.lock().unwrap().push("first");
                Ok(())
            })
        };
        let second = {
            let seen = Arc::clone(&seen);
            callback(move |_| {
                seen.lock().unwrap().push("second");
                Ok(())
            })
        };

        index.subscribe_by_name_method("servo1@R9", "onServoEvent", Arc::clone(&first));
        index.subscribe_by_name_method("servo1@R9", "onServoEvent", second);
        index.subscribe_by_name_method("servo1@R9", "onServoEvent", first);

        let envelope = Envelope::new(1, "runtime@E1", "servo1@R9", "onServoEvent");
        for cb in index.by_name_method("servo1@R9", "onServoEvent") {
            cb(&envelope).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "first"]);
    }

    #[test]
    fn test_topic_and_notification_share_key() {
        let index = SubscriptionIndex::new();
        let counter = Arc::new(AtomicUsize::new(0));
        index.subscribe_by_name_method("servo1@R9", "publishServoEvent", counting(&counter));

        assert_eq!(index.by_name_method("servo1@R9", "onServoEvent").len(), 1);
        assert_eq!(index.by_name_method("servo1@R9", "publishServoEvent").len(), 1);
        assert!(index.by_name_method("servo2@R9", "onServoEvent").is_empty());
    }

    #[test]
    fn test_unsubscribe_removes_first_match_only() {
        let index = SubscriptionIndex::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cb = counting(&counter);
        let other = counting(&counter);

        index.subscribe_by_method("onStatus", Arc::clone(&cb));
        index.subscribe_by_method("onStatus", Arc::clone(&other));
        index.subscribe_by_method("onStatus", Arc::clone(&cb));

        assert!(index.unsubscribe_by_method("onStatus", &cb));
        let remaining = index.by_method("onStatus");
        assert_eq!(remaining.len(), 2);
        assert!(same_callback(&remaining[0], &other));
        assert!(same_callback(&remaining[1], &cb));

        assert!(index.unsubscribe_by_method("onStatus", &cb));
        assert!(!index.unsubscribe_by_method("onStatus", &cb));
        assert!(!index.unsubscribe_by_name("nobody@R9", &cb));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_snapshot_is_independent_of_later_changes() {
        let index = SubscriptionIndex::new();
        let counter = Arc::new(AtomicUsize::new(0));
        index.subscribe_by_name("servo1@R9", counting(&counter));

        let snapshot = index.by_name("servo1@R9");
        index.subscribe_by_name("servo1@R9", counting(&counter));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(index.by_name("servo1@R9").len(), 2);
    }

    #[test]
    fn test_invoke_catches_errors_and_panics() {
        let envelope = Envelope::new(1, "a", "b", "m");

        let failing = callback(|_| Err(MrlError::Other("boom".into())));
        let err = invoke("b.m", &failing, &envelope).unwrap_err();
        assert!(err.to_string().contains("boom"));

        let panicking = callback(|_| panic!("kaboom"));
        let err = invoke("b.m", &panicking, &envelope).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_listeners_survive_panics() {
        let listeners: Listeners<bool> = Listeners::new("connectivity");
        let counter = Arc::new(AtomicUsize::new(0));

        listeners.add(|_| panic!("bad listener"));
        let c = Arc::clone(&counter);
        listeners.add(move |connected| {
            if *connected {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        listeners.notify(&true);
        listeners.notify(&false);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_qualify_moves_short_keys_ahead_of_full_ones() {
        let index = SubscriptionIndex::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |label: &'static str| {
            let order = Arc::clone(&order);
            callback(move |_| {
                order.lock().unwrap().push(label);
                Ok(())
            })
        };

        index.subscribe_by_name("servo1", push("early"));
        index.subscribe_by_name("servo1@R9", push("late"));
        index.subscribe_by_name_method("servo1", "publishServoEvent", push("event"));
        index.subscribe_by_name("arduino@R2", push("other"));

        assert_eq!(index.qualify("R9"), 2);
        assert!(index.by_name("servo1").is_empty());
        assert_eq!(index.by_name("arduino@R2").len(), 1);

        let envelope = Envelope::new(1, "runtime@E1", "servo1@R9", "onServoEvent");
        for cb in index.by_name("servo1@R9") {
            invoke("servo1@R9", &cb, &envelope).unwrap();
        }
        for cb in index.by_name_method("servo1@R9", "onServoEvent") {
            invoke("servo1@R9.onServoEvent", &cb, &envelope).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["early", "late", "event"]);
        assert_eq!(index.qualify("R9"), 0);
    }
}
