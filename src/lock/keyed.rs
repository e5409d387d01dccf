use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::LockError;

#[derive(Default)]
struct Slot {
    held: bool,
    waiting: usize,
}

/// Exclusive ownership of individual keys, held for as long as the returned
/// guard lives.
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Slot>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        KeyedLocks {
            slots: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn acquire(&self, key: K) -> Result<KeyedLockGuard<'_, K>, LockError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| LockError::Poisoned("keyed lock table poisoned".into()))?;

        loop {
            let slot = slots.entry(key.clone()).or_default();
            if !slot.held {
                slot.held = true;
                return Ok(KeyedLockGuard { owner: self, key });
            }

            slot.waiting += 1;
            let woken = self.released.wait(slots);
            let poisoned = woken.is_err();
            slots = woken.unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = slots.get_mut(&key) {
                slot.waiting -= 1;
            }
            if poisoned {
                evict_if_idle(&mut slots, &key);
                return Err(LockError::Poisoned(
                    "keyed lock table poisoned while waiting".into(),
                ));
            }
        }
    }

    /// Number of keys currently held or awaited.
    pub fn tracked(&self) -> usize {
        self.table().len()
    }

    fn release(&self, key: &K) {
        let mut slots = self.table();
        if let Some(slot) = slots.get_mut(key) {
            slot.held = false;
        }
        evict_if_idle(&mut slots, key);
        drop(slots);
        self.released.notify_all();
    }

    // Only slot bookkeeping happens under this mutex, so a poisoned table is
    // still consistent.
    fn table(&self) -> MutexGuard<'_, HashMap<K, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_if_idle<K: Eq + Hash>(slots: &mut HashMap<K, Slot>, key: &K) {
    if slots
        .get(key)
        .is_some_and(|slot| !slot.held && slot.waiting == 0)
    {
        slots.remove(key);
    }
}

/// Holds one key of a [`KeyedLocks`] table. Released on drop.
pub struct KeyedLockGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLocks<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for KeyedLockGuard<'_, K> {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}
