//! Bounded, thread-safe indexed registry.
//!
//! Every long-lived collection in the node (keypairs, peers, transports,
//! pending messages, scheduled tasks) sits in a `Registry`. Capacity is
//! fixed at construction; hitting it is a loud [`RegistryError::Full`]
//! rather than silent eviction.

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry '{name}' is full (capacity {capacity})")]
    Full { name: &'static str, capacity: usize },

    #[error("registry '{name}' rejected duplicate entry")]
    Duplicate { name: &'static str },
}

#[derive(Debug)]
pub struct Registry<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
}

impl<T> Registry<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // A poisoned registry still holds consistent single-item state.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn push_back(&self, item: T) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.len() >= self.capacity {
            return Err(RegistryError::Full {
                name: self.name,
                capacity: self.capacity,
            });
        }
        inner.push_back(item);
        Ok(())
    }

    pub fn push_front(&self, item: T) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.len() >= self.capacity {
            return Err(RegistryError::Full {
                name: self.name,
                capacity: self.capacity,
            });
        }
        inner.push_front(item);
        Ok(())
    }

    /// Push unless an existing entry matches `is_same`.
    pub fn push_back_unique(
        &self,
        item: T,
        is_same: impl Fn(&T, &T) -> bool,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.iter().any(|existing| is_same(existing, &item)) {
            return Err(RegistryError::Duplicate { name: self.name });
        }
        if inner.len() >= self.capacity {
            return Err(RegistryError::Full {
                name: self.name,
                capacity: self.capacity,
            });
        }
        inner.push_back(item);
        Ok(())
    }

    pub fn pop_front(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.lock().pop_back()
    }

    /// Position of the first entry matching the predicate (linear scan).
    pub fn index_where(&self, pred: impl Fn(&T) -> bool) -> Option<usize> {
        self.lock().iter().position(|item| pred(item))
    }

    /// Remove and return the entry at `index`, shifting later entries.
    pub fn remove_at(&self, index: usize) -> Option<T> {
        self.lock().remove(index)
    }

    /// Remove and return the first entry matching the predicate.
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut inner = self.lock();
        let idx = inner.iter().position(|item| pred(item))?;
        inner.remove(idx)
    }

    /// Drop every entry matching the predicate, returning how many went.
    pub fn remove_all_where(&self, pred: impl Fn(&T) -> bool) -> usize {
        let mut inner = self.lock();
        let before = inner.len();
        inner.retain(|item| !pred(item));
        before - inner.len()
    }

    pub fn contains(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.lock().iter().any(|item| pred(item))
    }

    /// Map the first matching entry under the lock.
    pub fn find_map<R>(&self, f: impl Fn(&T) -> Option<R>) -> Option<R> {
        self.lock().iter().find_map(f)
    }

    /// Run `f` over every entry under the lock.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for item in self.lock().iter() {
            f(item);
        }
    }

    /// Mutate the first matching entry in place.
    pub fn update_where(&self, pred: impl Fn(&T) -> bool, f: impl FnOnce(&mut T)) -> bool {
        let mut inner = self.lock();
        match inner.iter_mut().find(|item| pred(item)) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        }
    }
}

impl<T: Clone> Registry<T> {
    /// Entry at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<T> {
        self.lock().get(index).cloned()
    }

    /// Clone out the whole registry for iteration without holding the lock.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    pub fn find_where(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.lock().iter().find(|item| pred(item)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_ordering() {
        let reg: Registry<u32> = Registry::new("test", 10);
        reg.push_back(1).unwrap();
        reg.push_back(2).unwrap();
        reg.push_front(0).unwrap();

        assert_eq!(reg.len(), 3);
        assert_eq!(reg.pop_front(), Some(0));
        assert_eq!(reg.pop_back(), Some(2));
        assert_eq!(reg.pop_front(), Some(1));
        assert!(reg.is_empty());
    }

    #[test]
    fn full_registry_rejects_push() {
        let reg: Registry<u32> = Registry::new("tiny", 2);
        reg.push_back(1).unwrap();
        reg.push_back(2).unwrap();
        assert_eq!(
            reg.push_back(3),
            Err(RegistryError::Full {
                name: "tiny",
                capacity: 2
            })
        );
        // The existing entries survive the failed push.
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unique_push_rejects_duplicates() {
        let reg: Registry<u32> = Registry::new("uniq", 10);
        reg.push_back_unique(5, |a, b| a == b).unwrap();
        assert_eq!(
            reg.push_back_unique(5, |a, b| a == b),
            Err(RegistryError::Duplicate { name: "uniq" })
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_where_takes_first_match() {
        let reg: Registry<u32> = Registry::new("test", 10);
        for n in [1, 2, 3, 2] {
            reg.push_back(n).unwrap();
        }
        assert_eq!(reg.remove_where(|n| *n == 2), Some(2));
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.remove_all_where(|n| *n == 2), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn index_access() {
        let reg: Registry<u32> = Registry::new("test", 10);
        for n in [10, 20, 30] {
            reg.push_back(n).unwrap();
        }
        assert_eq!(reg.get(0), Some(10));
        assert_eq!(reg.get(2), Some(30));
        assert_eq!(reg.get(3), None);
        assert_eq!(reg.index_where(|n| *n == 20), Some(1));
        assert_eq!(reg.index_where(|n| *n == 99), None);
        assert_eq!(reg.remove_at(1), Some(20));
        assert_eq!(reg.get(1), Some(30));
    }

    #[test]
    fn single_element_front_back_roundtrip() {
        let reg: Registry<u32> = Registry::new("test", 10);
        reg.push_front(42).unwrap();
        assert_eq!(reg.pop_back(), Some(42));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_preserves_order() {
        let reg: Registry<u32> = Registry::new("test", 10);
        for n in 0..5 {
            reg.push_back(n).unwrap();
        }
        assert_eq!(reg.snapshot(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn update_where_mutates_in_place() {
        let reg: Registry<(u32, bool)> = Registry::new("test", 10);
        reg.push_back((1, false)).unwrap();
        assert!(reg.update_where(|(id, _)| *id == 1, |entry| entry.1 = true));
        assert_eq!(reg.find_where(|(id, _)| *id == 1), Some((1, true)));
        assert!(!reg.update_where(|(id, _)| *id == 9, |entry| entry.1 = true));
    }

    #[test]
    fn concurrent_pushes_stay_bounded() {
        use std::sync::Arc;

        let reg: Arc<Registry<u32>> = Arc::new(Registry::new("shared", 100));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let _ = reg.push_back(t * 100 + n);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(reg.len(), 100);
    }
}
