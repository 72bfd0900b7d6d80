// ============================================================================
// Persistence Context (identity map)
// ============================================================================
//
// Owns every entity known to one session, keyed by (entity, primary key).
// At most one entry exists per key; `manage` is the only path that registers
// loaded state, and it initializes an existing proxy in place instead of
// replacing it so that handles already given out keep their identity.
//
// ============================================================================

pub mod dirty;

pub use dirty::{FieldChange, Snapshot, SnapshotValue};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::core::{CollectionKey, EntityKey, OrmError, Result};
use crate::entity::collection::ManagedCollection;
use crate::entity::{Entity, LazyList, ManagedObject, Ref, same_object};
use crate::mapping::EntityMapping;
use crate::session::SessionShared;

/// Lifecycle state of an entity instance relative to a session.
///
/// ```text
/// Transient ──persist──> Managed ──remove──> Removed ──flush──> (gone)
///                          │
///                          └──detach / close──> Detached
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Transient,
    Managed,
    Detached,
    Removed,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Transient => write!(f, "TRANSIENT"),
            EntityState::Managed => write!(f, "MANAGED"),
            EntityState::Detached => write!(f, "DETACHED"),
            EntityState::Removed => write!(f, "REMOVED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Set on entities read from the database.
    Read,
    /// Version is checked on update and delete.
    Optimistic,
    /// Version is incremented at the next flush even if nothing changed.
    OptimisticForceIncrement,
}

/// Bookkeeping for one managed instance.
pub struct EntityEntry {
    object: Arc<dyn ManagedObject>,
    mapping: &'static EntityMapping,
    state: EntityState,
    read_only: bool,
    snapshot: Option<Snapshot>,
    lock_mode: LockMode,
}

impl EntityEntry {
    pub(crate) fn new(
        object: Arc<dyn ManagedObject>,
        state: EntityState,
        snapshot: Option<Snapshot>,
        lock_mode: LockMode,
    ) -> Self {
        let mapping = object.mapping();
        Self {
            object,
            mapping,
            state,
            read_only: false,
            snapshot,
            lock_mode,
        }
    }

    pub fn object(&self) -> &Arc<dyn ManagedObject> {
        &self.object
    }

    pub fn mapping(&self) -> &'static EntityMapping {
        self.mapping
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub(crate) fn set_lock_mode(&mut self, lock_mode: LockMode) {
        self.lock_mode = lock_mode;
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Option<Snapshot>) {
        self.snapshot = snapshot;
    }

    /// Capture a fresh snapshot from the current state of the instance.
    pub(crate) fn refresh_snapshot(&mut self) -> Result<()> {
        self.snapshot = Some(dirty::snapshot(self.mapping, self.object.as_ref())?);
        Ok(())
    }

    pub(crate) fn holds(&self, object: &Arc<dyn ManagedObject>) -> bool {
        same_object(&self.object, object)
    }
}

impl fmt::Debug for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry")
            .field("entity", &self.mapping.entity_name())
            .field("state", &self.state)
            .field("initialized", &self.object.is_initialized())
            .field("read_only", &self.read_only)
            .field("lock_mode", &self.lock_mode)
            .finish()
    }
}

#[derive(Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityKey, EntityEntry>,
    collections: HashMap<CollectionKey, Arc<dyn ManagedCollection>>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub(crate) fn get_entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Key of the entry holding exactly this instance.
    pub(crate) fn find_key(&self, object: &Arc<dyn ManagedObject>) -> Option<EntityKey> {
        let key = object
            .identifier()
            .ok()
            .flatten()
            .map(|id| EntityKey::new(object.mapping().entity_name(), id))?;
        self.entries
            .get(&key)
            .filter(|entry| entry.holds(object))
            .map(|_| key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&EntityKey, &EntityEntry)> {
        self.entries.iter()
    }

    pub(crate) fn add_entry(&mut self, key: EntityKey, entry: EntityEntry) -> Result<()> {
        if let Some(existing) = self.entries.get(&key)
            && !existing.holds(&entry.object)
        {
            return Err(OrmError::IllegalState(format!(
                "a different instance with key {} is already managed",
                key
            )));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub(crate) fn remove_entry(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        self.entries.remove(key)
    }

    /// Register loaded state for `key`.
    ///
    /// - no entry: `supply` runs once; `None` means not found and nothing is registered.
    /// - entry holding an uninitialized proxy: the supplied entity initializes
    ///   the proxy in place and a snapshot is captured.
    /// - entry holding a loaded instance: the instance is returned as is and
    ///   its snapshot is kept, so pending modifications stay visible.
    ///
    /// Re-managing a loaded entry never captures a fresh snapshot; only a
    /// flush of the entity or `Session::refresh` replaces it.
    pub fn manage<T: Entity>(
        &mut self,
        key: EntityKey,
        supply: impl FnOnce(&mut Self) -> Result<Option<T>>,
        on_registered: impl FnOnce(&mut EntityEntry),
    ) -> Result<Option<Ref<T>>> {
        if let Some(entry) = self.entries.get(&key) {
            let handle = Ref::<T>::from_erased(entry.object.clone()).ok_or_else(|| {
                OrmError::Mapping(format!("entry {} holds a different entity type", key))
            })?;
            if handle.is_initialized() {
                return Ok(Some(handle));
            }

            let Some(entity) = supply(self)? else {
                return Ok(None);
            };
            handle.initialize(entity)?;
            let entry = self.entries.get_mut(&key).ok_or_else(|| {
                OrmError::IllegalState(format!("entry {} vanished while loading", key))
            })?;
            entry.refresh_snapshot()?;
            on_registered(entry);
            return Ok(Some(handle));
        }

        let Some(entity) = supply(self)? else {
            return Ok(None);
        };
        let handle = Ref::new(entity);
        let object = handle.erased();
        let snapshot = dirty::snapshot(T::mapping(), object.as_ref())?;
        let mut entry = EntityEntry::new(object, EntityState::Managed, Some(snapshot), LockMode::Read);
        on_registered(&mut entry);
        self.entries.insert(key, entry);
        Ok(Some(handle))
    }

    /// The managed instance for `key`, or a new registered proxy.
    pub(crate) fn reference<T: Entity>(
        &mut self,
        key: EntityKey,
        session: &Weak<SessionShared>,
    ) -> Result<Ref<T>> {
        if let Some(entry) = self.entries.get(&key) {
            return Ref::<T>::from_erased(entry.object.clone()).ok_or_else(|| {
                OrmError::Mapping(format!("entry {} holds a different entity type", key))
            });
        }
        let proxy = Ref::<T>::proxy(key.id().clone(), session.clone());
        let entry = EntityEntry::new(proxy.erased(), EntityState::Managed, None, LockMode::None);
        self.entries.insert(key, entry);
        Ok(proxy)
    }

    pub(crate) fn collection<T: Entity>(
        &mut self,
        key: CollectionKey,
        session: &Weak<SessionShared>,
    ) -> Result<LazyList<T>> {
        if let Some(existing) = self.collections.get(&key) {
            return LazyList::<T>::from_erased(existing.clone()).ok_or_else(|| {
                OrmError::Mapping(format!("collection {} holds a different element type", key))
            });
        }
        let list = LazyList::<T>::lazy(key.clone(), session.clone());
        self.collections.insert(key, list.erased());
        Ok(list)
    }

    pub(crate) fn forget_collections_of(&mut self, owner: &EntityKey) {
        self.collections.retain(|key, collection| {
            if key.owner() == owner {
                collection.unlink();
                false
            } else {
                true
            }
        });
    }

    /// Drop every entry and sever every proxy and collection from the session.
    pub fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.object.unlink();
        }
        for collection in self.collections.values() {
            collection.unlink();
        }
        self.entries.clear();
        self.collections.clear();
    }
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("entries", &self.entries.len())
            .field("collections", &self.collections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::test_support::Note;

    fn note(id: i64, body: &str) -> Note {
        Note {
            id,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_manage_registers_once() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 1i64);

        let first = context
            .manage::<Note>(key.clone(), |_| Ok(Some(note(1, "a"))), |_| {})
            .unwrap()
            .unwrap();
        let mut calls = 0;
        let second = context
            .manage::<Note>(
                key.clone(),
                |_| {
                    calls += 1;
                    Ok(Some(note(1, "b")))
                },
                |_| {},
            )
            .unwrap()
            .unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(calls, 0);
        assert_eq!(second.read(|n| n.body.clone()).unwrap(), "a");
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_manage_not_found_registers_nothing() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 9i64);
        let result = context.manage::<Note>(key.clone(), |_| Ok(None), |_| {}).unwrap();
        assert!(result.is_none());
        assert!(!context.contains_key(&key));
    }

    #[test]
    fn test_manage_initializes_proxy_in_place() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 3i64);
        let proxy = context.reference::<Note>(key.clone(), &Weak::new()).unwrap();
        assert!(!proxy.is_initialized());
        assert!(context.get_entry(&key).unwrap().snapshot().is_none());

        let mut registered = false;
        let managed = context
            .manage::<Note>(key.clone(), |_| Ok(Some(note(3, "loaded"))), |_| registered = true)
            .unwrap()
            .unwrap();

        assert!(managed.ptr_eq(&proxy));
        assert!(proxy.is_initialized());
        assert!(registered);
        assert!(context.get_entry(&key).unwrap().snapshot().is_some());
    }

    #[test]
    fn test_snapshot_after_manage_matches_fresh_snapshot() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 4i64);
        context
            .manage::<Note>(key.clone(), |_| Ok(Some(note(4, "same"))), |_| {})
            .unwrap();
        let entry = context.get_entry(&key).unwrap();
        let fresh = dirty::snapshot(entry.mapping(), entry.object().as_ref()).unwrap();
        assert!(entry.snapshot().unwrap().same_as(&fresh, entry.mapping()));
    }

    #[test]
    fn test_remanaging_keeps_snapshot_of_modified_instance() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 7i64);
        let managed = context
            .manage::<Note>(key.clone(), |_| Ok(Some(note(7, "loaded"))), |_| {})
            .unwrap()
            .unwrap();
        managed.write(|n| n.body = "edited".into()).unwrap();

        let again = context
            .manage::<Note>(key.clone(), |_| Ok(Some(note(7, "loaded"))), |_| {})
            .unwrap()
            .unwrap();
        assert!(again.ptr_eq(&managed));

        let changes = dirty::updated_fields(context.get_entry(&key).unwrap()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "body");
        assert_eq!(changes[0].value, Value::from("edited"));
    }

    #[test]
    fn test_clear_unlinks_proxies() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 5i64);
        let proxy = context.reference::<Note>(key, &Weak::new()).unwrap();
        context.clear();
        assert!(context.is_empty());
        assert!(matches!(proxy.read(|n| n.id), Err(OrmError::LazyLoading(_))));
    }

    #[test]
    fn test_add_entry_rejects_second_instance() {
        let mut context = PersistenceContext::new();
        let key = EntityKey::new("Note", 6i64);
        let a = Ref::new(note(6, "a"));
        let b = Ref::new(note(6, "b"));
        context
            .add_entry(key.clone(), EntityEntry::new(a.erased(), EntityState::Managed, None, LockMode::None))
            .unwrap();
        let err = context
            .add_entry(key, EntityEntry::new(b.erased(), EntityState::Managed, None, LockMode::None))
            .unwrap_err();
        assert!(matches!(err, OrmError::IllegalState(_)));
    }
}
