//! Token-keyed observer lists.
//!
//! Notification always works on a snapshot: the list lock is released before
//! any callback runs, so a callback may register or remove observers
//! (including itself) without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverToken(u64);

impl ObserverToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub struct ObserverSet<T> {
    next: AtomicU64,
    entries: Mutex<Vec<(ObserverToken, T)>>,
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> ObserverSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: T) -> ObserverToken {
        let token = ObserverToken(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((token, value));
        token
    }

    /// Returns false if the token was unknown or already removed.
    pub fn remove(&self, token: ObserverToken) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn snapshot_where(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, v)| keep(v))
            .map(|(_, v)| v.clone())
            .collect()
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
    use std::sync::Arc;

    #[test]
    fn tokens_are_unique_and_removal_is_once() {
        let set = ObserverSet::new();
        let a = set.insert(1);
        let b = set.insert(2);
        assert_ne!(a, b);
        assert!(set.remove(a));
        assert!(!set.remove(a));
        assert_eq!(set.snapshot(), vec![2]);
    }

    #[test]
    fn callbacks_may_mutate_the_set() {
        type Callback = Arc<dyn Fn() + Send + Sync>;
        let set: Arc<ObserverSet<Callback>> = Arc::new(ObserverSet::new());
        let inner = Arc::clone(&set);
        set.insert(Arc::new(move || {
            inner.insert(Arc::new(|| {}));
        }));
        for callback in set.snapshot() {
            callback();
        }
        assert_eq!(set.len(), 2);
    }
}
