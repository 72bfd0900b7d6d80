// ============================================================================
// Entity handles and lazy proxies
// ============================================================================
//
// Every entity the engine hands out is a `Ref<T>`: a shared handle over a cell
// that either holds the loaded entity or only its key. The unloaded variant is
// the lazy proxy; it answers `id()` from the key and loads the row through its
// session on any other access.
//
// State transitions:
// ```text
// Unloaded ──first access──> Loading ──row found──> Loaded
//                               │
//                               └──row missing──> Failed
// ```
//
// ============================================================================

pub mod collection;
pub mod hydrate;

pub use collection::LazyList;
pub use hydrate::Hydrator;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::info_span;

use crate::core::{EntityKey, OrmError, Result, Value};
use crate::mapping::EntityMapping;
use crate::session::SessionShared;

/// A type that can be mapped to a table and managed by a session.
///
/// Usually implemented through `#[derive(Entity)]`.
pub trait Entity: Send + Sync + Sized + 'static {
    /// The mapping table entry for this type, built once.
    fn mapping() -> &'static EntityMapping;

    /// Build an instance from a loaded row.
    fn hydrate(hydrator: &mut Hydrator<'_>) -> Result<Self>;
}

/// A many-to-one field: either a required `Ref<T>` or an optional one.
pub trait ReferenceField: Send + Sync + Sized + 'static {
    type Target: Entity;

    fn as_reference(&self) -> Option<&Ref<Self::Target>>;

    /// `None` when a null foreign key cannot be represented by this field type.
    fn from_reference(reference: Option<Ref<Self::Target>>) -> Option<Self>;
}

impl<T: Entity> ReferenceField for Ref<T> {
    type Target = T;

    fn as_reference(&self) -> Option<&Ref<T>> {
        Some(self)
    }

    fn from_reference(reference: Option<Ref<T>>) -> Option<Self> {
        reference
    }
}

impl<T: Entity> ReferenceField for Option<Ref<T>> {
    type Target = T;

    fn as_reference(&self) -> Option<&Ref<T>> {
        self.as_ref()
    }

    fn from_reference(reference: Option<Ref<T>>) -> Option<Self> {
        Some(reference)
    }
}

/// Type-erased view of an entity cell used by the unit of work.
pub trait ManagedObject: Send + Sync {
    fn mapping(&self) -> &'static EntityMapping;

    /// The identifier, read without triggering a load.
    fn identifier(&self) -> Result<Option<Value>>;

    fn is_initialized(&self) -> bool;

    /// Run `f` against the loaded entity. Fails for uninitialized proxies.
    fn inspect(&self, f: &mut dyn FnMut(&dyn Any) -> Result<()>) -> Result<()>;

    fn inspect_mut(&self, f: &mut dyn FnMut(&mut dyn Any) -> Result<()>) -> Result<()>;

    /// Sever the cell from its session; later loads fail fast.
    fn unlink(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub(crate) fn same_object(a: &Arc<dyn ManagedObject>, b: &Arc<dyn ManagedObject>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

enum CellState<T> {
    Unloaded(Value),
    Loading(Value),
    Loaded(T),
    Failed(Value),
}

pub(crate) struct EntityCell<T> {
    state: RwLock<CellState<T>>,
    session: Mutex<Option<Weak<SessionShared>>>,
}

impl<T: Entity> EntityCell<T> {
    fn not_loaded(&self) -> OrmError {
        let id = match self.state.read() {
            Ok(state) => match &*state {
                CellState::Unloaded(id) | CellState::Loading(id) | CellState::Failed(id) => {
                    id.to_string()
                }
                CellState::Loaded(_) => "?".to_string(),
            },
            Err(_) => "?".to_string(),
        };
        OrmError::LazyLoading(format!(
            "{}#{} is not initialized",
            T::mapping().entity_name(),
            id
        ))
    }
}

impl<T: Entity> ManagedObject for EntityCell<T> {
    fn mapping(&self) -> &'static EntityMapping {
        T::mapping()
    }

    fn identifier(&self) -> Result<Option<Value>> {
        let state = self.state.read()?;
        match &*state {
            CellState::Unloaded(id) | CellState::Loading(id) | CellState::Failed(id) => {
                Ok(Some(id.clone()))
            }
            CellState::Loaded(entity) => T::mapping().identifier(entity),
        }
    }

    fn is_initialized(&self) -> bool {
        matches!(self.state.read().as_deref(), Ok(CellState::Loaded(_)))
    }

    fn inspect(&self, f: &mut dyn FnMut(&dyn Any) -> Result<()>) -> Result<()> {
        let state = self.state.read()?;
        match &*state {
            CellState::Loaded(entity) => f(entity),
            _ => {
                drop(state);
                Err(self.not_loaded())
            }
        }
    }

    fn inspect_mut(&self, f: &mut dyn FnMut(&mut dyn Any) -> Result<()>) -> Result<()> {
        let mut state = self.state.write()?;
        match &mut *state {
            CellState::Loaded(entity) => f(entity),
            _ => {
                drop(state);
                Err(self.not_loaded())
            }
        }
    }

    fn unlink(&self) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = None;
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Shared handle to an entity instance, loaded or not.
///
/// Cloning the handle clones the reference, never the entity: two handles
/// obtained for the same key in one session point at the same cell.
pub struct Ref<T: Entity> {
    cell: Arc<EntityCell<T>>,
}

impl<T: Entity> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Entity> Ref<T> {
    /// Wrap a new (transient) entity.
    pub fn new(entity: T) -> Self {
        Self {
            cell: Arc::new(EntityCell {
                state: RwLock::new(CellState::Loaded(entity)),
                session: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn proxy(id: Value, session: Weak<SessionShared>) -> Self {
        Self {
            cell: Arc::new(EntityCell {
                state: RwLock::new(CellState::Unloaded(id)),
                session: Mutex::new(Some(session)),
            }),
        }
    }

    pub(crate) fn erased(&self) -> Arc<dyn ManagedObject> {
        self.cell.clone()
    }

    pub(crate) fn from_erased(object: Arc<dyn ManagedObject>) -> Option<Self> {
        object
            .into_any()
            .downcast::<EntityCell<T>>()
            .ok()
            .map(|cell| Self { cell })
    }

    /// The identifier. Never triggers a load.
    pub fn id(&self) -> Option<Value> {
        self.cell.identifier().ok().flatten()
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id()
            .map(|id| EntityKey::new(T::mapping().entity_name(), id))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.is_initialized()
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Read the entity, loading it first if this is an unloaded proxy.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.ensure_loaded()?;
        let state = self.cell.state.read()?;
        match &*state {
            CellState::Loaded(entity) => Ok(f(entity)),
            _ => {
                drop(state);
                Err(self.cell.not_loaded())
            }
        }
    }

    /// Mutate the entity, loading it first if needed. Changes become visible
    /// to the session at the next flush.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.ensure_loaded()?;
        let mut state = self.cell.state.write()?;
        match &mut *state {
            CellState::Loaded(entity) => Ok(f(entity)),
            _ => {
                drop(state);
                Err(self.cell.not_loaded())
            }
        }
    }

    pub fn cloned(&self) -> Result<T>
    where
        T: Clone,
    {
        self.read(T::clone)
    }

    /// Initialize an unloaded proxy from an entity fetched some other way.
    pub fn initialize(&self, entity: T) -> Result<()> {
        let mut state = self.cell.state.write()?;
        let expected = match &*state {
            CellState::Loaded(_) => {
                return Err(OrmError::IllegalState(format!(
                    "{} is already initialized",
                    T::mapping().entity_name()
                )));
            }
            CellState::Unloaded(id) | CellState::Loading(id) | CellState::Failed(id) => id.clone(),
        };
        let actual = T::mapping().read_id(&entity)?;
        if actual != expected {
            return Err(OrmError::IllegalState(format!(
                "cannot initialize proxy {}#{} with entity {}",
                T::mapping().entity_name(),
                expected,
                actual
            )));
        }
        *state = CellState::Loaded(entity);
        Ok(())
    }

    pub fn unlink(&self) {
        self.cell.unlink();
    }

    fn session(&self) -> Option<Arc<SessionShared>> {
        self.cell
            .session
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }

    fn ensure_loaded(&self) -> Result<()> {
        let id = {
            let state = self.cell.state.read()?;
            match &*state {
                CellState::Loaded(_) => return Ok(()),
                CellState::Unloaded(id) => id.clone(),
                CellState::Loading(id) => {
                    return Err(OrmError::LazyLoading(format!(
                        "{}#{} is already being loaded",
                        T::mapping().entity_name(),
                        id
                    )));
                }
                CellState::Failed(id) => {
                    return Err(OrmError::LazyLoading(format!(
                        "{}#{} no longer exists",
                        T::mapping().entity_name(),
                        id
                    )));
                }
            }
        };
        let key = EntityKey::new(T::mapping().entity_name(), id.clone());

        let session = self.session().ok_or_else(|| {
            OrmError::LazyLoading(format!("proxy {} is not attached to an open session", key))
        })?;

        {
            let mut state = self.cell.state.write()?;
            match &*state {
                CellState::Unloaded(_) => *state = CellState::Loading(id.clone()),
                CellState::Loaded(_) => return Ok(()),
                _ => {
                    return Err(OrmError::LazyLoading(format!(
                        "{} changed state while loading",
                        key
                    )));
                }
            }
        }

        let span = info_span!("proxy.load", entity = key.entity(), id = %key.id());
        let _enter = span.enter();

        let outcome = session.initialize_proxy(self);
        let mut state = self.cell.state.write()?;
        match outcome {
            Ok(_) if matches!(&*state, CellState::Loaded(_)) => Ok(()),
            Ok(_) => {
                *state = CellState::Failed(id);
                Err(OrmError::LazyLoading(format!("{} no longer exists", key)))
            }
            Err(err) => {
                if matches!(&*state, CellState::Loading(_)) {
                    *state = CellState::Unloaded(id);
                }
                Err(err)
            }
        }
    }
}

impl<T: Entity> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self
            .id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "transient".to_string());
        let state = match self.cell.state.read().as_deref() {
            Ok(CellState::Loaded(_)) => "loaded",
            Ok(CellState::Unloaded(_)) => "unloaded",
            Ok(CellState::Loading(_)) => "loading",
            Ok(CellState::Failed(_)) => "failed",
            Err(_) => "poisoned",
        };
        write!(f, "Ref<{}#{}, {}>", T::mapping().entity_name(), id, state)
    }
}
