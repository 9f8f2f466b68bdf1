//! The process-wide function registry.
//!
//! Descriptors live in an arena keyed by [`FunctionId`]. A separate name
//! index maps each visible, case-folded name to its arena slot. Dropping a
//! function that is still in use only removes the name-index entry: the slot
//! stays in the arena, shadowed, until the last caller releases it. Ids are
//! never reused, so a shadowed slot can never collide with another one.
//!
//! Every slot carries a usage count: one for each outstanding
//! [`FunctionGuard`], plus one while the name index points at it.
//!
//! Lookups run under the read side of one lock. Insert, release and removal
//! take the write side. Libraries are released after the lock is dropped.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::abi::EntryPoints;
use crate::error::{Result, UdfError};
use crate::library::{LibraryHandle, LibraryManager};
use crate::types::{name_key, FunctionDefinition, FunctionKind, ReturnType};

/// Stable arena key of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a function can still be found by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    /// Dropped while in use; reachable only through outstanding guards.
    Shadowed,
}

struct Binding {
    entry_points: EntryPoints,
    library: LibraryHandle,
}

/// A registered function and, when its library loaded, its entry points.
pub struct FunctionDescriptor {
    definition: FunctionDefinition,
    binding: Option<Binding>,
    registered_at: DateTime<Utc>,
}

impl FunctionDescriptor {
    /// A callable function. Takes over the caller's library handle.
    pub fn bound(
        definition: FunctionDefinition,
        entry_points: EntryPoints,
        library: LibraryHandle,
    ) -> Self {
        Self {
            definition,
            binding: Some(Binding {
                entry_points,
                library,
            }),
            registered_at: Utc::now(),
        }
    }

    /// A catalog entry whose library could not be opened.
    pub fn unusable(definition: FunctionDefinition) -> Self {
        Self {
            definition,
            binding: None,
            registered_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.definition.kind
    }

    pub fn return_type(&self) -> ReturnType {
        self.definition.return_type
    }

    pub fn library_path(&self) -> &str {
        &self.definition.library_path
    }

    /// Resolved entry points; `None` for unusable descriptors.
    pub fn entry_points(&self) -> Option<&EntryPoints> {
        self.binding.as_ref().map(|b| &b.entry_points)
    }

    pub fn library(&self) -> Option<&LibraryHandle> {
        self.binding.as_ref().map(|b| &b.library)
    }

    pub fn is_usable(&self) -> bool {
        self.binding.is_some()
    }

    /// Bound despite exporting neither `_init` nor `_deinit`.
    pub fn is_suspicious(&self) -> bool {
        self.binding
            .as_ref()
            .map(|b| b.entry_points.suspicious)
            .unwrap_or(false)
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    fn into_library(self) -> Option<LibraryHandle> {
        self.binding.map(|b| b.library)
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("definition", &self.definition)
            .field("usable", &self.is_usable())
            .field("suspicious", &self.is_suspicious())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

struct Slot {
    descriptor: Arc<FunctionDescriptor>,
    usage: AtomicUsize,
    visibility: Visibility,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    slots: HashMap<FunctionId, Slot>,
    names: HashMap<String, FunctionId>,
}

impl RegistryState {
    fn visible(&self, name: &str) -> Option<(FunctionId, &Slot)> {
        let id = *self.names.get(&name_key(name))?;
        self.slots.get(&id).map(|slot| (id, slot))
    }

    /// Drop the name-index hold on `id`. Returns the descriptor if the slot
    /// was removed, or `None` if callers still hold it and it was shadowed.
    fn unlink(&mut self, id: FunctionId) -> Option<Arc<FunctionDescriptor>> {
        let slot = self.slots.get_mut(&id)?;
        let key = slot.descriptor.definition.key();
        if self.names.get(&key) == Some(&id) {
            self.names.remove(&key);
        }

        // The name index held one reference.
        let remaining = slot.usage.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.slots.remove(&id).map(|slot| slot.descriptor)
        } else {
            slot.visibility = Visibility::Shadowed;
            debug!(
                function = %slot.descriptor.name(),
                id = %id,
                in_use = remaining,
                "Function shadowed until released"
            );
            None
        }
    }
}

struct Shared {
    state: RwLock<RegistryState>,
    libraries: Arc<LibraryManager>,
}

impl Shared {
    fn release_slot(&self, id: FunctionId) {
        let removed = {
            let mut state = self.state.write();
            let slot = match state.slots.get(&id) {
                Some(slot) => slot,
                None => panic!("function {} released after it was removed", id),
            };
            let previous = slot.usage.fetch_sub(1, Ordering::AcqRel);
            assert!(previous > 0, "function {} released more often than acquired", id);
            trace!(function = %slot.descriptor.name(), usage = previous - 1, "Released function");

            if previous == 1 {
                state.slots.remove(&id).map(|slot| slot.descriptor)
            } else {
                None
            }
        };

        if let Some(descriptor) = removed {
            self.retire(descriptor);
        }
    }

    /// Give a removed descriptor's library back to the manager.
    fn retire(&self, descriptor: Arc<FunctionDescriptor>) {
        let name = descriptor.name().to_string();
        match Arc::try_unwrap(descriptor) {
            Ok(descriptor) => {
                if let Some(library) = descriptor.into_library() {
                    let path = library.path().to_path_buf();
                    if self.libraries.release(library) {
                        info!(function = %name, path = %path.display(), "Closed shared library");
                    }
                }
                debug!(function = %name, "Function removed");
            }
            Err(_) => {
                // A read-only reference is still out; the library closes
                // when it is dropped.
                debug!(function = %name, "Function removed while still referenced");
            }
        }
    }
}

/// Concurrent map from function names to descriptors.
///
/// Cheap to clone; clones share the same registry. Outside this crate the
/// registry is read-only: names are added and removed only through
/// [`CatalogSync`](crate::CatalogSync), so the catalog and the name map
/// cannot diverge.
///
/// ```compile_fail
/// fn bypass(registry: &udfhost_core::FunctionRegistry) {
///     registry.mark_for_removal("myfunc_int").unwrap();
/// }
/// ```
#[derive(Clone)]
pub struct FunctionRegistry {
    shared: Arc<Shared>,
}

impl FunctionRegistry {
    pub fn new(libraries: Arc<LibraryManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(RegistryState::default()),
                libraries,
            }),
        }
    }

    pub fn libraries(&self) -> &Arc<LibraryManager> {
        &self.shared.libraries
    }

    /// Register a descriptor under its name with a usage count of one.
    ///
    /// On a duplicate name the descriptor is discarded and its library
    /// handle released.
    pub(crate) fn insert(&self, descriptor: FunctionDescriptor) -> Result<FunctionId> {
        let key = descriptor.definition.key();
        let mut state = self.shared.state.write();

        if state.names.contains_key(&key) {
            drop(state);
            let name = descriptor.name().to_string();
            self.shared.retire(Arc::new(descriptor));
            return Err(UdfError::DuplicateName(name));
        }

        state.next_id += 1;
        let id = FunctionId(state.next_id);
        debug!(function = %descriptor.name(), id = %id, usable = descriptor.is_usable(), "Function registered");
        state.slots.insert(
            id,
            Slot {
                descriptor: Arc::new(descriptor),
                usage: AtomicUsize::new(1),
                visibility: Visibility::Visible,
            },
        );
        state.names.insert(key, id);
        Ok(id)
    }

    /// Find a callable function by name and hold it until the guard is
    /// released.
    pub fn lookup_and_acquire(&self, name: &str) -> Option<FunctionGuard> {
        let state = self.shared.state.read();
        let (id, slot) = state.visible(name)?;
        if !slot.descriptor.is_usable() {
            return None;
        }
        let usage = slot.usage.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(function = %slot.descriptor.name(), usage, "Acquired function");

        Some(FunctionGuard {
            shared: self.shared.clone(),
            id,
            descriptor: Some(slot.descriptor.clone()),
        })
    }

    /// Find a callable function by name without holding it.
    pub fn lookup_readonly(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        let state = self.shared.state.read();
        let (_, slot) = state.visible(name)?;
        slot.descriptor
            .is_usable()
            .then(|| slot.descriptor.clone())
    }

    /// Hand a guard back. Equivalent to dropping it.
    pub fn release(&self, guard: FunctionGuard) {
        assert!(
            Arc::ptr_eq(&self.shared, &guard.shared),
            "function {} released to a registry that did not hand it out",
            guard.id
        );
        drop(guard);
    }

    /// Make `name` unavailable to new lookups.
    ///
    /// The function is removed right away if nobody holds it; otherwise it is
    /// shadowed and removed by the last release.
    pub(crate) fn mark_for_removal(&self, name: &str) -> Result<()> {
        let removed = {
            let mut state = self.shared.state.write();
            let id = *state
                .names
                .get(&name_key(name))
                .ok_or_else(|| UdfError::not_found(name))?;
            state.unlink(id)
        };

        if let Some(descriptor) = removed {
            self.shared.retire(descriptor);
        }
        Ok(())
    }

    /// Undo an insert by id, with the same shadowing rules as
    /// [`mark_for_removal`](Self::mark_for_removal). Returns false if the id
    /// is no longer visible.
    pub(crate) fn withdraw(&self, id: FunctionId) -> bool {
        let removed = {
            let mut state = self.shared.state.write();
            let visible = state
                .slots
                .get(&id)
                .map(|slot| slot.visibility == Visibility::Visible)
                .unwrap_or(false);
            if !visible {
                return false;
            }
            state.unlink(id)
        };

        if let Some(descriptor) = removed {
            self.shared.retire(descriptor);
        }
        true
    }

    /// Whether a visible function, usable or not, is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.shared.state.read().visible(name).is_some()
    }

    /// The visible descriptor for `name`, including unusable ones.
    pub fn describe(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        let state = self.shared.state.read();
        state.visible(name).map(|(_, slot)| slot.descriptor.clone())
    }

    /// Current usage count of the visible function `name`.
    pub fn usage_count(&self, name: &str) -> Option<usize> {
        let state = self.shared.state.read();
        state
            .visible(name)
            .map(|(_, slot)| slot.usage.load(Ordering::Acquire))
    }

    /// Visibility of a slot, or `None` once it has been removed.
    pub fn visibility(&self, id: FunctionId) -> Option<Visibility> {
        self.shared.state.read().slots.get(&id).map(|slot| slot.visibility)
    }

    /// Declared names of all visible functions, sorted.
    pub fn names(&self) -> Vec<String> {
        let state = self.shared.state.read();
        let mut names: Vec<String> = state
            .names
            .values()
            .filter_map(|id| state.slots.get(id))
            .map(|slot| slot.descriptor.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Number of slots, shadowed ones included.
    pub fn len(&self) -> usize {
        self.shared.state.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn visible_len(&self) -> usize {
        self.shared.state.read().names.len()
    }

    /// Drop every visible function. Functions still in use are shadowed and
    /// go away with their last release. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let removed: Vec<Arc<FunctionDescriptor>>;
        let dropped;
        {
            let mut state = self.shared.state.write();
            let ids: Vec<FunctionId> = state.names.values().copied().collect();
            dropped = ids.len();
            removed = ids.into_iter().filter_map(|id| state.unlink(id)).collect();
        }

        for descriptor in removed {
            self.shared.retire(descriptor);
        }
        if dropped > 0 {
            info!(count = dropped, "Function registry cleared");
        }
        dropped
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("FunctionRegistry")
            .field("visible", &state.names.len())
            .field("slots", &state.slots.len())
            .finish()
    }
}

/// A held reference to a registered function.
///
/// The function and its library stay loaded while the guard lives, even if
/// the function is dropped in the meantime. Dropping the guard releases it.
pub struct FunctionGuard {
    shared: Arc<Shared>,
    id: FunctionId,
    // Taken on drop so the slot holds the last reference when it is retired.
    descriptor: Option<Arc<FunctionDescriptor>>,
}

impl FunctionGuard {
    pub fn id(&self) -> FunctionId {
        self.id
    }
}

impl Deref for FunctionGuard {
    type Target = FunctionDescriptor;

    fn deref(&self) -> &FunctionDescriptor {
        match &self.descriptor {
            Some(descriptor) => descriptor,
            None => unreachable!("guard used after release"),
        }
    }
}

impl fmt::Debug for FunctionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionGuard")
            .field("id", &self.id)
            .field("function", &self.descriptor.as_ref().map(|d| d.name()))
            .finish()
    }
}

impl Drop for FunctionGuard {
    fn drop(&mut self) {
        if let Some(descriptor) = self.descriptor.take() {
            drop(descriptor);
            self.shared.release_slot(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{IntFn, MainFn, UdfArgs, UdfInit};
    use crate::library::{SymbolTable, SymbolTableLoader};
    use std::ffi::{c_longlong, c_uchar, c_void};

    unsafe extern "C" fn one(
        _: *mut UdfInit,
        _: *mut UdfArgs,
        _: *mut c_uchar,
        _: *mut c_uchar,
    ) -> c_longlong {
        1
    }

    fn setup() -> (Arc<SymbolTableLoader>, FunctionRegistry) {
        let loader = Arc::new(SymbolTableLoader::new());
        loader.register(
            "libdemo.so",
            SymbolTable::new().with("one", one as IntFn as *const c_void),
        );
        let libraries = Arc::new(LibraryManager::new(loader.clone(), "/plugins"));
        (loader, FunctionRegistry::new(libraries))
    }

    fn bound(registry: &FunctionRegistry, name: &str) -> FunctionDescriptor {
        let library = registry.libraries().acquire("libdemo.so").unwrap();
        let entry_points = EntryPoints {
            main: MainFn::Int(one),
            init: None,
            deinit: None,
            aggregate: None,
            suspicious: false,
        };
        FunctionDescriptor::bound(
            FunctionDefinition::scalar(name, ReturnType::Int, "libdemo.so"),
            entry_points,
            library,
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let (_loader, registry) = setup();
        registry.insert(bound(&registry, "one")).unwrap();

        assert!(registry.contains("ONE"));
        assert_eq!(registry.usage_count("one"), Some(1));

        let guard = registry.lookup_and_acquire("One").unwrap();
        assert_eq!(guard.name(), "one");
        assert_eq!(registry.usage_count("one"), Some(2));

        assert!(registry.lookup_readonly("one").is_some());
        assert_eq!(registry.usage_count("one"), Some(2));

        registry.release(guard);
        assert_eq!(registry.usage_count("one"), Some(1));
    }

    #[test]
    fn test_duplicate_insert_releases_library() {
        let (loader, registry) = setup();
        registry.insert(bound(&registry, "one")).unwrap();

        let err = registry.insert(bound(&registry, "ONE")).unwrap_err();
        assert_eq!(err, UdfError::DuplicateName("ONE".to_string()));
        assert_eq!(registry.len(), 1);
        assert_eq!(loader.live("libdemo.so"), 1);
        let described = registry.describe("one").unwrap();
        assert_eq!(described.library().unwrap().ref_count(), 1);
    }

    #[test]
    fn test_drop_unused_function_closes_library() {
        let (loader, registry) = setup();
        registry.insert(bound(&registry, "one")).unwrap();

        registry.mark_for_removal("one").unwrap();

        assert!(registry.is_empty());
        assert_eq!(loader.closes("libdemo.so"), 1);
        assert_eq!(
            registry.mark_for_removal("one"),
            Err(UdfError::FunctionNotFound("one".to_string()))
        );
    }

    #[test]
    fn test_drop_in_use_function_is_shadowed() {
        let (loader, registry) = setup();
        registry.insert(bound(&registry, "one")).unwrap();
        let guard = registry.lookup_and_acquire("one").unwrap();

        registry.mark_for_removal("one").unwrap();

        assert!(registry.lookup_readonly("one").is_none());
        assert!(registry.lookup_and_acquire("one").is_none());
        assert_eq!(registry.visibility(guard.id()), Some(Visibility::Shadowed));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.visible_len(), 0);
        assert_eq!(loader.closes("libdemo.so"), 0);

        // Still callable through the guard.
        match guard.entry_points().unwrap().main {
            MainFn::Int(f) => {
                let value = unsafe {
                    f(
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                    )
                };
                assert_eq!(value, 1);
            }
            _ => panic!("expected an integer entry point"),
        }

        let id = guard.id();
        drop(guard);
        assert_eq!(registry.visibility(id), None);
        assert_eq!(loader.closes("libdemo.so"), 1);
    }

    #[test]
    fn test_name_reusable_while_old_version_shadowed() {
        let (loader, registry) = setup();
        let old_id = registry.insert(bound(&registry, "one")).unwrap();
        let guard = registry.lookup_and_acquire("one").unwrap();
        registry.mark_for_removal("one").unwrap();

        let new_id = registry.insert(bound(&registry, "one")).unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(registry.len(), 2);

        drop(guard);
        assert_eq!(registry.visibility(old_id), None);
        assert_eq!(registry.visibility(new_id), Some(Visibility::Visible));
        assert_eq!(loader.opens("libdemo.so"), 1);
        assert_eq!(loader.closes("libdemo.so"), 0);
    }

    #[test]
    fn test_unusable_descriptor_blocks_name_but_not_lookup() {
        let (_loader, registry) = setup();
        registry
            .insert(FunctionDescriptor::unusable(FunctionDefinition::scalar(
                "ghost",
                ReturnType::Real,
                "libgone.so",
            )))
            .unwrap();

        assert!(registry.contains("ghost"));
        assert!(!registry.describe("ghost").unwrap().is_usable());
        assert!(registry.lookup_and_acquire("ghost").is_none());
        assert!(registry.lookup_readonly("ghost").is_none());

        registry.mark_for_removal("ghost").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_withdraw_only_touches_visible_slots() {
        let (_loader, registry) = setup();
        let id = registry.insert(bound(&registry, "one")).unwrap();

        assert!(registry.withdraw(id));
        assert!(!registry.withdraw(id));
        assert!(!registry.contains("one"));
    }

    #[test]
    fn test_clear_shadows_held_functions() {
        let (loader, registry) = setup();
        registry.insert(bound(&registry, "one")).unwrap();
        registry.insert(bound(&registry, "uno")).unwrap();
        let guard = registry.lookup_and_acquire("uno").unwrap();

        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.visible_len(), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(loader.closes("libdemo.so"), 0);

        drop(guard);
        assert!(registry.is_empty());
        assert_eq!(loader.closes("libdemo.so"), 1);
    }

    #[test]
    fn test_names_are_sorted_declared_spellings() {
        let (_loader, registry) = setup();
        registry.insert(bound(&registry, "Zeta")).unwrap();
        registry.insert(bound(&registry, "alpha")).unwrap();
        assert_eq!(registry.names(), vec!["Zeta".to_string(), "alpha".to_string()]);
    }

    #[test]
    #[should_panic(expected = "did not hand it out")]
    fn test_release_to_foreign_registry_panics() {
        let (_loader, registry) = setup();
        let (_other_loader, other) = setup();
        registry.insert(bound(&registry, "one")).unwrap();
        let guard = registry.lookup_and_acquire("one").unwrap();
        other.release(guard);
    }
}
