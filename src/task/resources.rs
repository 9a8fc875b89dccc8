#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::GwtaskError;

#[derive(Debug, Default)]
struct Counters {
    global_in_use: usize,
    by_category: BTreeMap<String, usize>,
}

#[derive(Debug)]
struct Inner {
    global_limit: usize,
    category_limits: BTreeMap<String, usize>,
    counters: Mutex<Counters>,
}

impl Inner {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn headroom(&self, c: &Counters, category: &str) -> bool {
        if c.global_in_use >= self.global_limit {
            return false;
        }
        match self.category_limits.get(category) {
            Some(&limit) => c.by_category.get(category).copied().unwrap_or(0) < limit,
            None => true,
        }
    }
}

/// Concurrency slots bounded globally and per task category.
///
/// Categories without an explicit limit are bounded by the global limit only.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub global_in_use: usize,
    pub global_limit: usize,
    pub by_category: BTreeMap<String, usize>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(global_limit: usize, category_limits: BTreeMap<String, usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                global_limit,
                category_limits,
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    #[must_use]
    pub fn can_acquire(&self, category: &str) -> bool {
        let c = self.inner.counters();
        self.inner.headroom(&c, category)
    }

    pub fn try_acquire_slot(&self, category: &str, task_id: &str) -> Result<Slot, GwtaskError> {
        let mut c = self.inner.counters();
        if !self.inner.headroom(&c, category) {
            return Err(GwtaskError::ResourceExhausted {
                category: category.to_owned(),
            });
        }
        c.global_in_use += 1;
        *c.by_category.entry(category.to_owned()).or_insert(0) += 1;
        drop(c);

        tracing::debug!(category, task_id, "slot acquired");
        Ok(Slot {
            inner: Arc::clone(&self.inner),
            category: category.to_owned(),
            task_id: task_id.to_owned(),
            released: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn in_use(&self) -> ResourceUsage {
        let c = self.inner.counters();
        ResourceUsage {
            global_in_use: c.global_in_use,
            global_limit: self.inner.global_limit,
            by_category: c.by_category.clone(),
        }
    }
}

/// Capacity held by one in-flight task. Released explicitly or on drop.
#[derive(Debug)]
pub struct Slot {
    inner: Arc<Inner>,
    category: String,
    task_id: String,
    released: AtomicBool,
}

impl Slot {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut c = self.inner.counters();
        c.global_in_use = c.global_in_use.saturating_sub(1);
        if let Some(n) = c.by_category.get_mut(&self.category) {
            *n = n.saturating_sub(1);
        }
        drop(c);
        tracing::debug!(category = %self.category, task_id = %self.task_id, "slot released");
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    fn limits(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    #[test]
    fn category_limit_is_stricter_than_global() {
        let rm = ResourceManager::new(3, limits(&[("development", 1)]));
        let _dev = rm.try_acquire_slot("development", "a").unwrap();
        assert!(!rm.can_acquire("development"));
        assert!(rm.can_acquire("review"));

        let err = rm.try_acquire_slot("development", "b").unwrap_err();
        assert!(matches!(err, GwtaskError::ResourceExhausted { category } if category == "development"));
    }

    #[test]
    fn global_limit_caps_all_categories() {
        let rm = ResourceManager::new(2, BTreeMap::new());
        let _a = rm.try_acquire_slot("x", "a").unwrap();
        let _b = rm.try_acquire_slot("y", "b").unwrap();
        assert!(!rm.can_acquire("z"));
        assert!(rm.try_acquire_slot("z", "c").is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let rm = ResourceManager::new(1, BTreeMap::new());
        let slot = rm.try_acquire_slot("development", "a").unwrap();
        slot.release();
        slot.release();
        drop(slot);

        let usage = rm.in_use();
        assert_eq!(usage.global_in_use, 0);
        assert_eq!(usage.by_category.get("development"), Some(&0));

        let _again = rm.try_acquire_slot("development", "b").unwrap();
        assert!(rm.try_acquire_slot("development", "c").is_err());
    }

    #[test]
    fn dropping_a_slot_returns_capacity() {
        let rm = ResourceManager::new(1, BTreeMap::new());
        {
            let _slot = rm.try_acquire_slot("development", "a").unwrap();
            assert!(!rm.can_acquire("development"));
        }
        assert!(rm.can_acquire("development"));
    }

    #[test]
    fn concurrent_acquires_succeed_exactly_up_to_the_limit() {
        const LIMIT: usize = 4;
        const CALLERS: usize = 16;
        let rm = ResourceManager::new(LIMIT, limits(&[("development", LIMIT)]));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let rm = rm.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    rm.try_acquire_slot("development", &format!("t{i}")).ok()
                })
            })
            .collect();
        let slots: Vec<Slot> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(slots.len(), LIMIT);
        assert_eq!(rm.in_use().global_in_use, LIMIT);
        drop(slots);
        assert_eq!(rm.in_use().global_in_use, 0);
    }
}
