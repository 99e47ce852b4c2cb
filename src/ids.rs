//! Opaque 64-bit id registry.
//!
//! Every long-lived object that would otherwise need a raw pointer shared
//! between a transport method, the reference list, and the op list instead
//! gets registered here and referenced by id. This sidesteps the cyclic
//! ownership the method this crate is modeled on resolves with raw pointers
//! and manual refcounting (see `bmi-method-support.c`'s
//! `bmi_alloc_method_op`/`bmi_alloc_method_addr`, which allocate the object
//! and its id together). Ids are never reused while registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A registry mapping generated 64-bit ids to arbitrary values. Monotonic
/// allocation means a stale id can never alias a live one, even across
/// register/unregister churn.
pub struct IdRegistry<T> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> Default for IdRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdRegistry<T> {
    pub fn new() -> Self {
        IdRegistry {
            // 0 is reserved as "no id" by convention in the handle types
            // built on top of this registry.
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a value, returning its freshly allocated id.
    ///
    /// The counter wraps at `u64::MAX`; on wraparound it may land back on an
    /// id that is still registered (a very long-lived op sharing the
    /// registry with a burst of short-lived ones). When that happens the
    /// colliding id is skipped rather than handed out twice.
    pub fn register(&self, value: T) -> u64 {
        let mut entries = self.entries.lock();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(id) {
                slot.insert(value);
                return id;
            }
        }
    }

    pub fn unregister(&self, id: u64) -> Option<T> {
        self.entries.lock().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().contains_key(&id)
    }
}

impl<T: Clone> IdRegistry<T> {
    pub fn lookup(&self, id: u64) -> Option<T> {
        self.entries.lock().get(&id).cloned()
    }
}

impl<T> IdRegistry<T> {
    /// Apply `f` to the registered value in place, if present.
    pub fn with_mut<R>(&self, id: u64, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.entries.lock().get_mut(&id).map(f)
    }

    pub fn with<R>(&self, id: u64, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.entries.lock().get(&id).map(f)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused_while_live() {
        let reg: IdRegistry<&'static str> = IdRegistry::new();
        let a = reg.register("alpha");
        let b = reg.register("beta");
        assert_ne!(a, b);
        assert_eq!(reg.lookup(a), Some("alpha"));
        assert_eq!(reg.lookup(b), Some("beta"));
    }

    #[test]
    fn unregister_then_lookup_is_none() {
        let reg: IdRegistry<u32> = IdRegistry::new();
        let id = reg.register(7);
        assert_eq!(reg.unregister(id), Some(7));
        assert_eq!(reg.lookup(id), None);
    }

    #[test]
    fn fresh_ids_keep_climbing_past_unregistered_ones() {
        let reg: IdRegistry<u32> = IdRegistry::new();
        let a = reg.register(1);
        reg.unregister(a);
        let b = reg.register(2);
        assert_ne!(a, b, "a freed id must not be handed out again");
    }
}
