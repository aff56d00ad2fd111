//! Keep-alive registry for host values
//!
//! Values referenced from native state (callback functions, metatype
//! tables) are parked in a slab. A `RegistryKey` owns its slot and frees it
//! when dropped, so a slot is released exactly once.

use std::sync::Arc;

use parking_lot::Mutex;

use super::Value;

#[derive(Default)]
struct Slab {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Slab>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a value and return the guard that keeps it alive
    pub fn insert(&self, value: Value) -> RegistryKey {
        let mut slab = self.inner.lock();
        let index = match slab.free.pop() {
            Some(index) => {
                slab.slots[index] = Some(value);
                index
            }
            None => {
                slab.slots.push(Some(value));
                slab.slots.len() - 1
            }
        };
        RegistryKey {
            registry: self.inner.clone(),
            index,
        }
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        let slab = self.inner.lock();
        slab.slots.len() - slab.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owner of one registry slot
pub struct RegistryKey {
    registry: Arc<Mutex<Slab>>,
    index: usize,
}

impl RegistryKey {
    pub fn get(&self) -> Value {
        self.registry.lock().slots[self.index]
            .clone()
            .unwrap_or(Value::Nil)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for RegistryKey {
    fn drop(&mut self) {
        // take the value out first so its own destructor runs unlocked
        let old = {
            let mut slab = self.registry.lock();
            let old = slab.slots[self.index].take();
            slab.free.push(self.index);
            old
        };
        drop(old);
    }
}

impl std::fmt::Debug for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegistryKey({})", self.index)
    }
}
