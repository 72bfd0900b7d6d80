// ============================================================================
// Session: the unit of work
// ============================================================================
//
// A session owns one connection, one persistence context and one action
// queue. Loads go through the identity map; writes are deferred until flush:
//
//   persist ─> id assigned (sequence / uuid / assigned) ─> Insert queued
//          └─> identity strategy ─> INSERT runs now, key written back
//   remove  ─> Removed ─> Delete queued
//   flush   ─> dirty check ─> Updates queued ─> queue drained in order
//
// Proxies and lazy collections hold a weak reference to the shared session
// state and load through `initialize_proxy` / `load_collection`. The core
// lock is never held while user code runs.
//
// ============================================================================

pub mod config;
pub mod transaction;

pub use config::SessionConfig;
pub use transaction::{Transaction, TransactionState};

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{Level, event, info_span};
use uuid::Uuid;

use crate::action::{ActionQueue, EntityAction};
use crate::connection::{Connection, ConnectionProvider};
use crate::context::{EntityEntry, EntityState, LockMode, PersistenceContext, dirty};
use crate::core::{CollectionKey, EntityKey, OrmError, Result, Row, Value};
use crate::entity::{Entity, Hydrator, ManagedObject, Ref};
use crate::id::IdGenerators;
use crate::mapping::{EntityMapping, FieldKind, GenerationStrategy, MappingRegistry};
use crate::persister::EntityPersister;
use crate::query::{FilterCompiler, QueryCompiler, QueryParams};

struct FactoryInner {
    config: SessionConfig,
    registry: MappingRegistry,
    provider: Arc<dyn ConnectionProvider>,
    generators: IdGenerators,
    compiler: Arc<dyn QueryCompiler>,
}

impl FactoryInner {
    fn persister(&self, mapping: &'static EntityMapping) -> EntityPersister {
        EntityPersister::new(mapping).with_logging(self.config.log_statements)
    }

    fn mapping_of<T: Entity>(&self) -> Result<&'static EntityMapping> {
        let mapping = T::mapping();
        let registered = self.registry.for_type(mapping.entity_name())?;
        if !std::ptr::eq(registered, mapping) {
            return Err(OrmError::Mapping(format!(
                "entity name '{}' belongs to another type",
                mapping.entity_name()
            )));
        }
        mapping.check_type::<T>()?;
        Ok(mapping)
    }

    fn allocation_size(&self, allocation_size: Option<u32>) -> u32 {
        allocation_size.unwrap_or(self.config.default_allocation_size)
    }
}

/// Thread-safe factory of sessions, holding the mapping table, the
/// connection provider and the shared identifier generators.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl SessionFactory {
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::default()
    }

    pub fn open_session(&self) -> Result<Session> {
        let connection = self.inner.provider.connect()?;
        let shared = Arc::new_cyclic(|weak| SessionShared {
            factory: Arc::clone(&self.inner),
            core: Mutex::new(SessionCore {
                context: PersistenceContext::new(),
                queue: ActionQueue::new(),
                connection,
                transaction: TransactionState::NotStarted,
            }),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        event!(Level::DEBUG, factory = %self.inner.config.name, "Session opened");
        Ok(Session { shared })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn mappings(&self) -> impl Iterator<Item = &'static EntityMapping> + '_ {
        self.inner.registry.iter()
    }

    pub fn generators(&self) -> &IdGenerators {
        &self.inner.generators
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("name", &self.inner.config.name)
            .field("entities", &self.inner.registry.len())
            .finish()
    }
}

#[derive(Default)]
pub struct SessionFactoryBuilder {
    config: SessionConfig,
    mappings: Vec<&'static EntityMapping>,
    compiler: Option<Arc<dyn QueryCompiler>>,
}

impl SessionFactoryBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register<T: Entity>(mut self) -> Self {
        self.mappings.push(T::mapping());
        self
    }

    pub fn register_mapping(mut self, mapping: &'static EntityMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Replace the default `FilterCompiler`.
    pub fn query_compiler(mut self, compiler: Arc<dyn QueryCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Validate configuration and mappings, then build the factory.
    pub fn build(self, provider: impl ConnectionProvider + 'static) -> Result<SessionFactory> {
        self.config.validate()?;

        let mut registry = MappingRegistry::new();
        for mapping in self.mappings {
            registry.register(mapping)?;
        }
        registry.validate()?;

        let generators = IdGenerators::new();
        for mapping in registry.iter() {
            if let GenerationStrategy::Sequence {
                name,
                allocation_size,
            } = mapping.id().strategy()
            {
                let size = allocation_size.unwrap_or(self.config.default_allocation_size);
                generators.generator(name, size)?;
            }
        }

        let compiler = match self.compiler {
            Some(compiler) => compiler,
            None => Arc::new(FilterCompiler::new(self.config.query_cache_capacity)?),
        };

        event!(
            Level::INFO,
            factory = %self.config.name,
            entities = registry.len(),
            "Session factory built"
        );
        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                config: self.config,
                registry,
                provider: Arc::new(provider),
                generators,
                compiler,
            }),
        })
    }
}

struct SessionCore {
    context: PersistenceContext,
    queue: ActionQueue,
    connection: Box<dyn Connection>,
    transaction: TransactionState,
}

/// Session state shared with the session's transaction handle, its proxies
/// and its lazy collections.
pub struct SessionShared {
    factory: Arc<FactoryInner>,
    core: Mutex<SessionCore>,
    closed: AtomicBool,
    weak_self: Weak<SessionShared>,
}

impl SessionShared {
    fn lock(&self) -> Result<MutexGuard<'_, SessionCore>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrmError::IllegalState("session is closed".into()));
        }
        Ok(self.core.lock()?)
    }

    fn persister(&self, mapping: &'static EntityMapping) -> EntityPersister {
        self.factory.persister(mapping)
    }

    /// Register a loaded row through the identity map.
    fn register_row<T: Entity>(&self, core: &mut SessionCore, key: EntityKey, row: &Row) -> Result<Option<Ref<T>>> {
        let weak = &self.weak_self;
        let read_only = self.factory.config.default_read_only;
        let owner = key.clone();
        core.context.manage::<T>(
            key,
            |context| {
                let mut hydrator = Hydrator::new(T::mapping(), row, owner, context, weak);
                T::hydrate(&mut hydrator).map(Some)
            },
            |entry| {
                entry.set_read_only(read_only);
                entry.set_lock_mode(LockMode::Read);
            },
        )
    }

    fn key_of_row(mapping: &'static EntityMapping, row: &Row) -> Result<EntityKey> {
        let id = row.get(mapping.id().column_name()).cloned().ok_or_else(|| {
            OrmError::field_access(mapping.entity_name(), mapping.id().field(), "key column missing from row")
        })?;
        Ok(EntityKey::new(mapping.entity_name(), id))
    }

    fn load<T: Entity>(&self, core: &mut SessionCore, key: EntityKey) -> Result<Option<Ref<T>>> {
        let persister = self.persister(T::mapping());
        let Some(row) = persister.load(core.connection.as_mut(), key.id())? else {
            return Ok(None);
        };
        self.register_row::<T>(core, key, &row)
    }

    /// Load the row behind a proxy and initialize the proxy in place.
    /// `false` when the row no longer exists.
    pub(crate) fn initialize_proxy<T: Entity>(&self, proxy: &Ref<T>) -> Result<bool> {
        let mut guard = self
            .lock()
            .map_err(|_| OrmError::LazyLoading("session is closed".into()))?;
        let core = &mut *guard;
        let key = proxy
            .key()
            .ok_or_else(|| OrmError::LazyLoading("proxy without identifier".into()))?;

        let holds_proxy = core
            .context
            .get_entry(&key)
            .is_some_and(|entry| entry.holds(&proxy.erased()));
        if !holds_proxy {
            return Err(OrmError::LazyLoading(format!("{} is no longer managed by its session", key)));
        }

        let loaded = self.load::<T>(core, key)?;
        Ok(loaded.is_some())
    }

    /// Fetch the elements of a one-to-many collection.
    pub(crate) fn load_collection<T: Entity>(&self, key: &CollectionKey) -> Result<Vec<Ref<T>>> {
        let mut guard = self
            .lock()
            .map_err(|_| OrmError::LazyLoading("session is closed".into()))?;
        let core = &mut *guard;

        let owner = self.factory.registry.for_type(key.owner_entity())?;
        let field = owner.field(key.role()).ok_or_else(|| {
            OrmError::Mapping(format!("{}.{} is not mapped", owner.entity_name(), key.role()))
        })?;
        let FieldKind::OneToMany { mapped_by, .. } = field.kind() else {
            return Err(OrmError::Mapping(format!(
                "{}.{} is not a one-to-many association",
                owner.entity_name(),
                key.role()
            )));
        };

        let span = info_span!("collection.load", collection = %key);
        let _enter = span.enter();

        let mapping = T::mapping();
        let persister = self.persister(mapping);
        let column = persister.join_column(mapped_by)?;
        let rows = persister.load_by_foreign_key(core.connection.as_mut(), column, key.owner_id())?;

        let mut elements = Vec::with_capacity(rows.len());
        for row in &rows {
            let element_key = Self::key_of_row(mapping, row)?;
            if core
                .context
                .get_entry(&element_key)
                .is_some_and(|entry| entry.state() == EntityState::Removed)
            {
                continue;
            }
            if let Some(element) = self.register_row::<T>(core, element_key, row)? {
                elements.push(element);
            }
        }
        event!(Level::DEBUG, count = elements.len(), "Collection loaded");
        Ok(elements)
    }

    fn flush_core(&self, core: &mut SessionCore) -> Result<usize> {
        let span = info_span!("session.flush", session = %self.factory.config.name);
        let _enter = span.enter();

        let queue = &core.queue;
        let dirty = dirty::find_dirty_entities(&core.context, |key| {
            queue.has_pending_insert(key) || queue.has_pending_delete(key)
        })?;

        let mut updates = Vec::new();
        for entity in dirty {
            if let Some(entry) = core.context.get_entry(&entity.key) {
                let force = entry.lock_mode() == LockMode::OptimisticForceIncrement;
                updates.push((entity.key, entry.object().clone(), entry.mapping(), entity.changes, force));
            }
        }
        for (key, entry) in core.context.entries() {
            let forced = entry.lock_mode() == LockMode::OptimisticForceIncrement
                && entry.state() == EntityState::Managed
                && entry.object().is_initialized()
                && !core.queue.has_pending_insert(key)
                && !core.queue.has_pending_delete(key)
                && !updates.iter().any(|(k, ..)| k == key);
            if forced {
                updates.push((key.clone(), entry.object().clone(), entry.mapping(), Vec::new(), true));
            }
        }

        for (key, object, mapping, changes, force_version) in updates {
            let action = EntityAction::Update {
                key,
                object,
                persister: self.persister(mapping),
                changes,
                force_version,
            };
            core.queue.enqueue(action, core.connection.as_mut())?;
        }

        let context = &mut core.context;
        let executed = core
            .queue
            .execute_all(core.connection.as_mut(), |action| {
                match action {
                    EntityAction::Insert { key, .. } | EntityAction::Update { key, .. } => {
                        if let Some(entry) = context.get_entry_mut(key) {
                            entry.refresh_snapshot()?;
                            if entry.lock_mode() == LockMode::OptimisticForceIncrement {
                                entry.set_lock_mode(LockMode::Optimistic);
                            }
                        }
                    }
                    EntityAction::Delete { key, object, .. } => {
                        context.remove_entry(key);
                        context.forget_collections_of(key);
                        object.unlink();
                    }
                    EntityAction::IdentityInsert { .. } => {}
                }
                Ok(())
            })?;

        event!(Level::DEBUG, executed, "Flush complete");
        Ok(executed)
    }

    pub(crate) fn begin(&self) -> Result<()> {
        let mut core = self.lock()?;
        if core.transaction.is_active() {
            return Err(OrmError::Transaction("transaction already active".into()));
        }
        core.connection.set_auto_commit(false)?;
        core.transaction = TransactionState::Active;
        event!(Level::INFO, session = %self.factory.config.name, "Transaction started");
        Ok(())
    }

    pub(crate) fn commit(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let core = &mut *guard;
        transaction::require_active(core.transaction, "commit")?;

        let span = info_span!("session.commit", session = %self.factory.config.name);
        let _enter = span.enter();

        self.flush_core(core)?;
        if let Err(err) = core.connection.commit() {
            // The database refused the transaction; its writes are gone.
            event!(Level::WARN, error = %err, "Commit failed");
            self.abandon(core)?;
            return Err(err);
        }
        core.connection.set_auto_commit(true)?;
        core.transaction = TransactionState::Committed;
        event!(Level::INFO, "Transaction committed");
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let core = &mut *guard;
        transaction::require_active(core.transaction, "roll back")?;

        let span = info_span!("session.rollback", session = %self.factory.config.name);
        let _enter = span.enter();

        self.abandon(core)
    }

    /// Detach everything, drop queued actions and roll the connection back.
    fn abandon(&self, core: &mut SessionCore) -> Result<()> {
        let discarded = core.context.len();
        core.context.clear();
        core.queue.clear();
        core.transaction = TransactionState::RolledBack;
        core.connection.rollback()?;
        core.connection.set_auto_commit(true)?;
        event!(Level::INFO, discarded, "Transaction rolled back");
        Ok(())
    }

    pub(crate) fn transaction_state(&self) -> Result<TransactionState> {
        Ok(self.core.lock()?.transaction)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut core = self.core.lock()?;
        core.context.clear();
        core.queue.clear();
        if core.transaction.is_active() {
            core.transaction = TransactionState::RolledBack;
            core.connection.rollback()?;
        }
        core.connection.close()?;
        event!(Level::DEBUG, session = %self.factory.config.name, "Session closed");
        Ok(())
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            event!(Level::WARN, error = %err, "Failed to close session");
        }
    }
}

/// One unit of work. Not meant to be shared between threads.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    pub fn managed_count(&self) -> Result<usize> {
        Ok(self.shared.lock()?.context.len())
    }

    /// The managed instance for `id`, loading it if needed.
    pub fn find<T: Entity>(&self, id: impl Into<Value>) -> Result<Option<Ref<T>>> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let key = EntityKey::new(mapping.entity_name(), id);
        let mut guard = self.shared.lock()?;
        let core = &mut *guard;

        if let Some(entry) = core.context.get_entry(&key) {
            if entry.state() == EntityState::Removed {
                return Ok(None);
            }
            if entry.object().is_initialized() {
                return Ok(Ref::from_erased(entry.object().clone()));
            }
        }
        self.shared.load::<T>(core, key)
    }

    /// A proxy for `id`; storage is not touched until the proxy is used.
    pub fn get_reference<T: Entity>(&self, id: impl Into<Value>) -> Result<Ref<T>> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let key = EntityKey::new(mapping.entity_name(), id);
        let mut core = self.shared.lock()?;
        core.context.reference::<T>(key, &self.shared.weak_self)
    }

    /// Make a transient instance managed and schedule its insertion.
    pub fn persist<T: Entity>(&self, entity: &Ref<T>) -> Result<()> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let object = entity.erased();
        let mut guard = self.shared.lock()?;
        let core = &mut *guard;

        if let Some(key) = core.context.find_key(&object) {
            return match core.context.get_entry(&key).map(EntityEntry::state) {
                Some(EntityState::Removed) => Err(OrmError::IllegalState(format!(
                    "{} is scheduled for removal",
                    key
                ))),
                _ => Ok(()),
            };
        }
        if !object.is_initialized() {
            return Err(OrmError::IllegalState(format!(
                "cannot persist an uninitialized {} proxy",
                mapping.entity_name()
            )));
        }

        let current = object.identifier()?;
        let strategy = mapping.id().strategy();
        let id = match strategy {
            GenerationStrategy::Assigned => current.ok_or_else(|| {
                OrmError::IllegalState(format!(
                    "{} uses assigned identifiers; set '{}' before persist",
                    mapping.entity_name(),
                    mapping.id().field()
                ))
            })?,
            _ if current.is_some() => {
                return Err(OrmError::IllegalState(format!(
                    "{} already has an identifier; detached instances must be merged",
                    mapping.entity_name()
                )));
            }
            GenerationStrategy::Sequence {
                name,
                allocation_size,
            } => {
                let size = self.shared.factory.allocation_size(*allocation_size);
                let generator = self.shared.factory.generators.generator(name, size)?;
                let id = Value::Integer(generator.next(core.connection.as_mut())?);
                write_id(mapping, object.as_ref(), id.clone())?;
                id
            }
            GenerationStrategy::Uuid => {
                let id = Value::Uuid(Uuid::new_v4());
                write_id(mapping, object.as_ref(), id.clone())?;
                id
            }
            GenerationStrategy::Identity => {
                let action = EntityAction::IdentityInsert {
                    object: object.clone(),
                    persister: self.shared.persister(mapping),
                };
                let id = core.queue.enqueue(action, core.connection.as_mut())?.ok_or_else(|| {
                    OrmError::Database(format!("no key generated for {}", mapping.entity_name()))
                })?;
                let key = EntityKey::new(mapping.entity_name(), id);
                let mut entry = EntityEntry::new(object, EntityState::Managed, None, LockMode::None);
                entry.refresh_snapshot()?;
                core.context.add_entry(key, entry)?;
                return Ok(());
            }
        };

        let key = EntityKey::new(mapping.entity_name(), id);
        if core.context.contains_key(&key) {
            return Err(OrmError::IllegalState(format!(
                "a different instance with key {} is already managed",
                key
            )));
        }
        core.context.add_entry(
            key.clone(),
            EntityEntry::new(object.clone(), EntityState::Managed, None, LockMode::None),
        )?;
        let action = EntityAction::Insert {
            key,
            object,
            persister: self.shared.persister(mapping),
        };
        core.queue.enqueue(action, core.connection.as_mut())?;
        Ok(())
    }

    /// Schedule a managed instance for deletion. An instance whose insert is
    /// still queued is simply forgotten.
    pub fn remove<T: Entity>(&self, entity: &Ref<T>) -> Result<()> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let object = entity.erased();
        let mut guard = self.shared.lock()?;
        let core = &mut *guard;

        let key = core.context.find_key(&object).ok_or_else(|| {
            OrmError::IllegalState(format!("{} instance is not managed by this session", mapping.entity_name()))
        })?;
        if core.queue.cancel_insert(&key) {
            core.context.remove_entry(&key);
            core.context.forget_collections_of(&key);
            return Ok(());
        }

        let Some(entry) = core.context.get_entry_mut(&key) else {
            return Ok(());
        };
        if entry.state() == EntityState::Removed {
            return Ok(());
        }
        entry.set_state(EntityState::Removed);
        let action = EntityAction::Delete {
            key,
            object,
            persister: self.shared.persister(mapping),
        };
        core.queue.enqueue(action, core.connection.as_mut())?;
        Ok(())
    }

    /// Copy the state of a detached instance onto the managed instance with
    /// the same key and return the managed handle. Transient instances are
    /// persisted as they are.
    pub fn merge<T: Entity>(&self, entity: &Ref<T>) -> Result<Ref<T>> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        {
            let core = self.shared.lock()?;
            if core.context.find_key(&entity.erased()).is_some() {
                return Ok(entity.clone());
            }
        }

        let Some(id) = entity.read(|e| mapping.identifier(e))?? else {
            self.persist(entity)?;
            return Ok(entity.clone());
        };
        let persister = self.shared.persister(mapping);
        let row = persister.to_row(entity.erased().as_ref())?;
        let key = EntityKey::new(mapping.entity_name(), id);

        let mut guard = self.shared.lock()?;
        let core = &mut *guard;
        let managed = match core.context.get_entry(&key) {
            Some(entry) if entry.state() == EntityState::Removed => {
                return Err(OrmError::IllegalState(format!("{} is scheduled for removal", key)));
            }
            Some(entry) if entry.object().is_initialized() => Ref::<T>::from_erased(entry.object().clone()),
            _ => self.shared.load::<T>(core, key.clone())?,
        };

        let Some(managed) = managed else {
            if matches!(mapping.id().strategy(), GenerationStrategy::Assigned) {
                drop(guard);
                self.persist(entity)?;
                return Ok(entity.clone());
            }
            return Err(OrmError::EntityNotFound(key.to_string()));
        };

        let weak = &self.shared.weak_self;
        let merged = {
            let mut hydrator = Hydrator::new(mapping, &row, key, &mut core.context, weak);
            T::hydrate(&mut hydrator)?
        };
        replace_state(managed.erased().as_ref(), merged)?;
        Ok(managed)
    }

    /// Write every pending change to the connection.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.shared.lock()?;
        self.shared.flush_core(&mut guard)?;
        Ok(())
    }

    /// Detach every managed instance and release the connection.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Stop managing one instance. Queued actions for it are discarded.
    pub fn detach<T: Entity>(&self, entity: &Ref<T>) -> Result<()> {
        let object = entity.erased();
        let mut core = self.shared.lock()?;
        if let Some(key) = core.context.find_key(&object) {
            core.queue.forget(&key);
            core.context.remove_entry(&key);
            core.context.forget_collections_of(&key);
            object.unlink();
        }
        Ok(())
    }

    /// Detach everything and drop all queued actions.
    pub fn clear(&self) -> Result<()> {
        let mut core = self.shared.lock()?;
        core.context.clear();
        core.queue.clear();
        Ok(())
    }

    pub fn contains<T: Entity>(&self, entity: &Ref<T>) -> Result<bool> {
        let core = self.shared.lock()?;
        Ok(core
            .context
            .find_key(&entity.erased())
            .and_then(|key| core.context.get_entry(&key).map(EntityEntry::state))
            == Some(EntityState::Managed))
    }

    pub fn entity_state<T: Entity>(&self, entity: &Ref<T>) -> Result<EntityState> {
        let core = self.shared.lock()?;
        if let Some(state) = core
            .context
            .find_key(&entity.erased())
            .and_then(|key| core.context.get_entry(&key).map(EntityEntry::state))
        {
            return Ok(state);
        }
        Ok(if entity.id().is_some() {
            EntityState::Detached
        } else {
            EntityState::Transient
        })
    }

    /// Reload a managed instance from its row, discarding unflushed changes.
    pub fn refresh<T: Entity>(&self, entity: &Ref<T>) -> Result<()> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let mut guard = self.shared.lock()?;
        let core = &mut *guard;
        let key = core.context.find_key(&entity.erased()).ok_or_else(|| {
            OrmError::IllegalState(format!("{} instance is not managed by this session", mapping.entity_name()))
        })?;

        let row = self
            .shared
            .persister(mapping)
            .load(core.connection.as_mut(), key.id())?
            .ok_or_else(|| OrmError::EntityNotFound(key.to_string()))?;
        core.context.forget_collections_of(&key);
        let fresh = {
            let mut hydrator = Hydrator::new(mapping, &row, key.clone(), &mut core.context, &self.shared.weak_self);
            T::hydrate(&mut hydrator)?
        };
        if entity.is_initialized() {
            replace_state(entity.erased().as_ref(), fresh)?;
        } else {
            entity.initialize(fresh)?;
        }

        if let Some(entry) = core.context.get_entry_mut(&key) {
            entry.refresh_snapshot()?;
            entry.set_lock_mode(LockMode::Read);
        }
        Ok(())
    }

    /// Exclude (or re-include) a managed instance from dirty checking.
    pub fn set_read_only<T: Entity>(&self, entity: &Ref<T>, read_only: bool) -> Result<()> {
        let mut guard = self.shared.lock()?;
        let core = &mut *guard;
        let entry = managed_entry(&mut core.context, entity)?;
        if entry.is_read_only() && !read_only && entry.object().is_initialized() {
            entry.refresh_snapshot()?;
        }
        entry.set_read_only(read_only);
        Ok(())
    }

    pub fn lock<T: Entity>(&self, entity: &Ref<T>, mode: LockMode) -> Result<()> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let needs_version = matches!(mode, LockMode::Optimistic | LockMode::OptimisticForceIncrement);
        if needs_version && mapping.version_field().is_none() {
            return Err(OrmError::IllegalState(format!(
                "{} has no version field for optimistic locking",
                mapping.entity_name()
            )));
        }
        let mut guard = self.shared.lock()?;
        let entry = managed_entry(&mut guard.context, entity)?;
        if entry.state() != EntityState::Managed {
            return Err(OrmError::IllegalState(format!("cannot lock a {} instance", entry.state())));
        }
        entry.set_lock_mode(mode);
        Ok(())
    }

    /// Run a filter query; rows resolve through the identity map.
    pub fn query<T: Entity>(&self, filter: &str, params: &QueryParams) -> Result<Vec<Ref<T>>> {
        let mapping = self.shared.factory.mapping_of::<T>()?;
        let compiled = self.shared.factory.compiler.compile(mapping, filter, params)?;

        let mut guard = self.shared.lock()?;
        let core = &mut *guard;
        if self.shared.factory.config.flush_on_query {
            self.shared.flush_core(core)?;
        }

        let statement = compiled.statement();
        let rows = self.shared.persister(mapping).select(
            core.connection.as_mut(),
            statement.predicates.clone(),
            statement.order_by.clone(),
        )?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = SessionShared::key_of_row(mapping, row)?;
            if core
                .context
                .get_entry(&key)
                .is_some_and(|entry| entry.state() == EntityState::Removed)
            {
                continue;
            }
            if let Some(entity) = self.shared.register_row::<T>(core, key, row)? {
                results.push(entity);
            }
        }
        Ok(results)
    }

    /// Handle to this session's transaction. Does not begin it.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.shared))
    }

    pub fn begin_transaction(&self) -> Result<Transaction> {
        let transaction = self.transaction();
        transaction.begin()?;
        Ok(transaction)
    }

    /// Run `work` in a transaction: commit on success, roll back on error.
    pub fn with_transaction<R>(&self, work: impl FnOnce(&Session) -> Result<R>) -> Result<R> {
        let transaction = self.begin_transaction()?;
        let outcome = work(self).and_then(|value| transaction.commit().map(|_| value));
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                if transaction.is_active()
                    && let Err(rollback_err) = transaction.rollback()
                {
                    event!(Level::WARN, error = %rollback_err, "Rollback after failure failed");
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("factory", &self.shared.factory.config.name)
            .field("open", &self.is_open())
            .finish()
    }
}

fn write_id(mapping: &'static EntityMapping, object: &dyn ManagedObject, id: Value) -> Result<()> {
    object.inspect_mut(&mut |entity: &mut dyn Any| mapping.write_id(entity, id.clone()))
}

fn replace_state<T: Entity>(object: &dyn ManagedObject, state: T) -> Result<()> {
    let mut state = Some(state);
    object.inspect_mut(&mut |entity: &mut dyn Any| {
        let slot = entity.downcast_mut::<T>().ok_or_else(|| {
            OrmError::field_access(T::mapping().entity_name(), "*", "entity type mismatch")
        })?;
        if let Some(state) = state.take() {
            *slot = state;
        }
        Ok(())
    })
}

fn managed_entry<'c, T: Entity>(context: &'c mut PersistenceContext, entity: &Ref<T>) -> Result<&'c mut EntityEntry> {
    let key = context.find_key(&entity.erased()).ok_or_else(|| {
        OrmError::IllegalState(format!("{} instance is not managed by this session", T::mapping().entity_name()))
    })?;
    context
        .get_entry_mut(&key)
        .ok_or_else(|| OrmError::IllegalState(format!("{} vanished from the session", key)))
}
