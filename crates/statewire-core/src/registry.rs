#![forbid(unsafe_code)]

//! Authoritative key → cell mapping.
//!
//! Each slot stores the same allocation twice: once as [`ErasedCell`] for
//! untyped work (tracking, diagnostics, re-broadcast) and once as `dyn Any`
//! so typed access can downcast back to `CellInner<T>`.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::cell::{CellInner, CellValue, ErasedCell};
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub(crate) struct CellSlot {
    erased: Rc<dyn ErasedCell>,
    any: Rc<dyn Any>,
}

impl CellSlot {
    fn new<T: CellValue>(cell: Rc<CellInner<T>>) -> Self {
        Self {
            erased: Rc::clone(&cell) as Rc<dyn ErasedCell>,
            any: cell as Rc<dyn Any>,
        }
    }

    fn downcast<T: CellValue>(&self, key: &str) -> Result<Rc<CellInner<T>>> {
        if self.erased.value_type_id() != TypeId::of::<T>() {
            return Err(StoreError::type_conflict::<T>(key, self.erased.type_name()));
        }
        Rc::clone(&self.any)
            .downcast::<CellInner<T>>()
            .map_err(|_| StoreError::type_conflict::<T>(key, self.erased.type_name()))
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    cells: RefCell<AHashMap<Rc<str>, CellSlot>>,
}

impl Registry {
    /// Typed lookup. `Ok(None)` when absent, `TypeConflict` on a type mismatch.
    pub(crate) fn lookup<T: CellValue>(&self, key: &str) -> Result<Option<Rc<CellInner<T>>>> {
        let slot = self.cells.borrow().get(key).cloned();
        slot.map(|slot| slot.downcast::<T>(key)).transpose()
    }

    /// Return the existing cell or create one from `initial`.
    ///
    /// The boolean is `true` when the cell was created by this call.
    pub(crate) fn get_or_create<T: CellValue>(
        &self,
        key: &str,
        initial: Option<T>,
    ) -> Result<(Rc<CellInner<T>>, bool)> {
        if let Some(cell) = self.lookup::<T>(key)? {
            return Ok((cell, false));
        }
        let Some(initial) = initial else {
            return Err(StoreError::missing_initial::<T>(key));
        };
        let cell = Rc::new(CellInner::new(Rc::from(key), initial));
        self.cells
            .borrow_mut()
            .insert(Rc::clone(cell.key()), CellSlot::new(Rc::clone(&cell)));
        tracing::debug!(key, type_name = std::any::type_name::<T>(), "cell created");
        Ok((cell, true))
    }

    pub(crate) fn erased(&self, key: &str) -> Option<Rc<dyn ErasedCell>> {
        self.cells
            .borrow()
            .get(key)
            .map(|slot| Rc::clone(&slot.erased))
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.cells.borrow().contains_key(key)
    }

    /// Detach a cell. Its listener set is released when the last handle drops.
    pub(crate) fn remove(&self, key: &str) -> bool {
        let removed = self.cells.borrow_mut().remove(key);
        // Dropped outside the borrow: listener captures may touch the store.
        let Some(slot) = removed else {
            return false;
        };
        slot.erased.detach();
        drop(slot);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cells.borrow().keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.cells.borrow_mut());
        for slot in drained.values() {
            slot.erased.detach();
        }
        drop(drained);
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        let mut cells: Vec<CellInfo> = self
            .cells
            .borrow()
            .values()
            .map(|slot| CellInfo {
                key: slot.erased.key().to_string(),
                type_name: slot.erased.type_name(),
                version: slot.erased.version(),
                listener_count: slot.erased.listener_count(),
            })
            .collect();
        cells.sort_by(|a, b| a.key.cmp(&b.key));
        RegistrySnapshot { cells }
    }
}

/// Diagnostic description of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellInfo {
    pub key: String,
    pub type_name: &'static str,
    pub version: u64,
    pub listener_count: usize,
}

/// Read-only view of the registry for debug tooling, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    cells: Vec<CellInfo>,
}

impl RegistrySnapshot {
    #[must_use]
    pub fn cells(&self) -> &[CellInfo] {
        &self.cells
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CellInfo> {
        self.cells
            .binary_search_by(|info| info.key.as_str().cmp(key))
            .ok()
            .map(|idx| &self.cells[idx])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reuse() {
        let registry = Registry::default();
        let (a, created) = registry.get_or_create("count", Some(1i64)).unwrap();
        assert!(created);
        let (b, created) = registry.get_or_create("count", Some(99i64)).unwrap();
        assert!(!created);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn missing_initial_value() {
        let registry = Registry::default();
        let err = registry.get_or_create::<String>("name", None).unwrap_err();
        assert!(matches!(err, StoreError::MissingInitialValue { .. }));
        assert!(!registry.contains("name"));
    }

    #[test]
    fn type_conflict_leaves_cell_untouched() {
        let registry = Registry::default();
        registry
            .get_or_create("user_name", Some(String::from("ada")))
            .unwrap();
        let err = registry.get_or_create("user_name", Some(5i64)).unwrap_err();
        assert!(matches!(err, StoreError::TypeConflict { .. }));
        let cell = registry.lookup::<String>("user_name").unwrap().unwrap();
        assert_eq!(cell.get(), "ada");
    }

    #[test]
    fn remove_detaches() {
        let registry = Registry::default();
        registry.get_or_create("a", Some(1u8)).unwrap();
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.lookup::<u8>("a").unwrap().is_none());
    }

    #[test]
    fn snapshot_sorted_by_key() {
        let registry = Registry::default();
        registry.get_or_create("zeta", Some(1u8)).unwrap();
        registry.get_or_create("alpha", Some(true)).unwrap();
        let snap = registry.snapshot();
        let keys: Vec<&str> = snap.cells().iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
        assert_eq!(snap.get("alpha").unwrap().type_name, "bool");
        assert!(snap.get("missing").is_none());
    }

    #[test]
    fn clear_empties_registry() {
        let registry = Registry::default();
        registry.get_or_create("a", Some(1u8)).unwrap();
        registry.get_or_create("b", Some(2u8)).unwrap();
        registry.clear();
        assert_eq!(registry.len(), 0);
        assert!(registry.keys().is_empty());
    }
}
