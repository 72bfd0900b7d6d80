use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::{Entity, Ref};
use crate::core::{CollectionKey, OrmError, Result};
use crate::session::SessionShared;

/// Type-erased view of a lazy collection, kept by the persistence context so
/// that clearing or closing a session can sever it.
pub(crate) trait ManagedCollection: Send + Sync {
    fn unlink(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

struct CollectionCell<T: Entity> {
    key: Option<CollectionKey>,
    elements: RwLock<Option<Vec<Ref<T>>>>,
    session: Mutex<Option<Weak<SessionShared>>>,
}

impl<T: Entity> ManagedCollection for CollectionCell<T> {
    fn unlink(&self) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = None;
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// The inverse side of a one-to-many association.
///
/// Elements are fetched on the first operation of any kind; a mutation before
/// that point materializes the collection first. The list is not written back:
/// the owning side is the `many_to_one` field of each element.
pub struct LazyList<T: Entity> {
    cell: Arc<CollectionCell<T>>,
}

impl<T: Entity> Clone for LazyList<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Entity> Default for LazyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> LazyList<T> {
    /// An empty, already materialized list for a transient owner.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(elements: Vec<Ref<T>>) -> Self {
        Self {
            cell: Arc::new(CollectionCell {
                key: None,
                elements: RwLock::new(Some(elements)),
                session: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn lazy(key: CollectionKey, session: Weak<SessionShared>) -> Self {
        Self {
            cell: Arc::new(CollectionCell {
                key: Some(key),
                elements: RwLock::new(None),
                session: Mutex::new(Some(session)),
            }),
        }
    }

    pub(crate) fn erased(&self) -> Arc<dyn ManagedCollection> {
        self.cell.clone()
    }

    pub(crate) fn from_erased(collection: Arc<dyn ManagedCollection>) -> Option<Self> {
        collection
            .into_any()
            .downcast::<CollectionCell<T>>()
            .ok()
            .map(|cell| Self { cell })
    }

    pub fn key(&self) -> Option<&CollectionKey> {
        self.cell.key.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.cell.elements.read().as_deref(), Ok(Some(_)))
    }

    pub fn unlink(&self) {
        self.cell.unlink();
    }

    fn materialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let key = self.cell.key.clone().ok_or_else(|| {
            OrmError::LazyLoading("collection without a key cannot be loaded".into())
        })?;
        let session = self
            .cell
            .session
            .lock()?
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                OrmError::LazyLoading(format!(
                    "collection {} is not attached to an open session",
                    key
                ))
            })?;

        let loaded = session.load_collection::<T>(&key)?;
        let mut elements = self.cell.elements.write()?;
        if elements.is_none() {
            *elements = Some(loaded);
        }
        Ok(())
    }

    /// Read access to the materialized elements.
    pub fn with<R>(&self, f: impl FnOnce(&[Ref<T>]) -> R) -> Result<R> {
        self.materialize()?;
        let elements = self.cell.elements.read()?;
        elements
            .as_deref()
            .map(f)
            .ok_or_else(|| OrmError::LazyLoading("collection was not materialized".into()))
    }

    /// Mutable access to the materialized elements.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Vec<Ref<T>>) -> R) -> Result<R> {
        self.materialize()?;
        let mut elements = self.cell.elements.write()?;
        elements
            .as_mut()
            .map(f)
            .ok_or_else(|| OrmError::LazyLoading("collection was not materialized".into()))
    }

    pub fn len(&self) -> Result<usize> {
        self.with(|elements| elements.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with(|elements| elements.is_empty())
    }

    pub fn get(&self, index: usize) -> Result<Option<Ref<T>>> {
        self.with(|elements| elements.get(index).cloned())
    }

    pub fn to_vec(&self) -> Result<Vec<Ref<T>>> {
        self.with(|elements| elements.to_vec())
    }

    pub fn contains(&self, element: &Ref<T>) -> Result<bool> {
        self.with(|elements| elements.iter().any(|e| e.ptr_eq(element)))
    }

    pub fn push(&self, element: Ref<T>) -> Result<()> {
        self.with_mut(|elements| elements.push(element))
    }

    pub fn remove(&self, index: usize) -> Result<Option<Ref<T>>> {
        self.with_mut(|elements| {
            if index < elements.len() {
                Some(elements.remove(index))
            } else {
                None
            }
        })
    }

    pub fn retain(&self, f: impl FnMut(&Ref<T>) -> bool) -> Result<()> {
        self.with_mut(|elements| elements.retain(f))
    }

    pub fn clear(&self) -> Result<()> {
        self.with_mut(|elements| elements.clear())
    }
}

impl<T: Entity> fmt::Debug for LazyList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.elements.read().as_deref() {
            Ok(Some(elements)) => f.debug_list().entries(elements.iter()).finish(),
            Ok(None) => match &self.cell.key {
                Some(key) => write!(f, "LazyList<{}, unloaded>", key),
                None => write!(f, "LazyList<unloaded>"),
            },
            Err(_) => write!(f, "LazyList<poisoned>"),
        }
    }
}
