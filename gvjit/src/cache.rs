///
/// Address Cache and Deferred Global Queue
///
/// The cache maps each entity to the one address currently standing for it.
/// Writes go through `install`, which refuses null pointers and refuses to
/// replace a live mapping; recompilation must `invalidate` first.
///
/// The deferred queue holds globals whose storage exists but whose
/// initializer has not been written yet. It is drained after the function
/// whose compilation allocated them has finished.
///

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use crate::error::{JitError, Result};
use crate::ir::{Entity, GlobalId};

/// A resolved, non-null runtime address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(NonNull<u8>);

impl Address {
    pub fn new(ptr: *const u8) -> Option<Self> {
        NonNull::new(ptr as *mut u8).map(Address)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

#[derive(Debug, Default)]
pub struct AddressCache {
    entries: HashMap<Entity, Address>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, entity: Entity) -> Option<Address> {
        self.entries.get(&entity).copied()
    }

    pub fn install(&mut self, entity: Entity, ptr: *const u8) -> Result<Address> {
        let address = Address::new(ptr).ok_or_else(|| JitError::NullAddress {
            entity: entity.to_string(),
        })?;
        if self.entries.contains_key(&entity) {
            return Err(JitError::DuplicateMapping {
                entity: entity.to_string(),
            });
        }
        self.entries.insert(entity, address);
        Ok(address)
    }

    pub fn invalidate(&mut self, entity: Entity) -> Option<Address> {
        self.entries.remove(&entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DeferredGlobals {
    pending: Vec<GlobalId>,
}

impl DeferredGlobals {
    pub fn push(&mut self, global: GlobalId) {
        self.pending.push(global);
    }

    /// Most recently deferred first.
    pub fn pop(&mut self) -> Option<GlobalId> {
        self.pending.pop()
    }

    pub fn contains(&self, global: GlobalId) -> bool {
        self.pending.contains(&global)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionId, Module, Type};

    fn some_ptr(slot: &u64) -> *const u8 {
        slot as *const u64 as *const u8
    }

    #[test]
    fn test_install_and_lookup() {
        let slot = 0u64;
        let entity = Entity::Function(FunctionId::from_index(3));
        let mut cache = AddressCache::new();

        assert_eq!(cache.lookup(entity), None);
        let addr = cache.install(entity, some_ptr(&slot)).unwrap();
        assert_eq!(cache.lookup(entity), Some(addr));
        assert_eq!(addr.as_ptr(), some_ptr(&slot));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_install_rejects_null() {
        let mut cache = AddressCache::new();
        let err = cache
            .install(Entity::Function(FunctionId::from_index(0)), std::ptr::null())
            .unwrap_err();
        assert!(matches!(err, JitError::NullAddress { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_install_never_overwrites() {
        let (a, b) = (0u64, 0u64);
        let entity = Entity::Function(FunctionId::from_index(1));
        let mut cache = AddressCache::new();

        let first = cache.install(entity, some_ptr(&a)).unwrap();
        let err = cache.install(entity, some_ptr(&b)).unwrap_err();
        assert!(matches!(err, JitError::DuplicateMapping { .. }));
        assert_eq!(cache.lookup(entity), Some(first));

        assert_eq!(cache.invalidate(entity), Some(first));
        let second = cache.install(entity, some_ptr(&b)).unwrap();
        assert_ne!(first, second);
        assert_eq!(cache.lookup(entity), Some(second));
    }

    #[test]
    fn test_deferred_queue_is_lifo() {
        let mut module = Module::new("m");
        let g1 = module.define_global("a", Type::I32, None);
        let g2 = module.define_global("b", Type::I32, None);

        let mut queue = DeferredGlobals::default();
        queue.push(g1);
        queue.push(g2);
        assert!(queue.contains(g1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(g2));
        assert_eq!(queue.pop(), Some(g1));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
