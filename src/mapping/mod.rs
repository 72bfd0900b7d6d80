// ============================================================================
// Entity Mapping Table
// ============================================================================
//
// Per entity type: table, primary key, generation strategy and the ordered
// field list. Each field carries an accessor built once from typed getter /
// setter functions; the accessors operate on `&dyn Any` so the unit of work can
// read heterogeneous entities through one table. A failed downcast is the only
// way field access can fail and surfaces as `OrmError::FieldAccess`.
//
// ============================================================================

pub mod registry;

pub use registry::MappingRegistry;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::core::{OrmError, Result, Value};
use crate::entity::{Entity, ManagedObject, ReferenceField};

type ValueGetter = Box<dyn Fn(&dyn Any) -> Option<Value> + Send + Sync>;
type ValueSetter = Box<dyn Fn(&mut dyn Any, Value) -> Option<Result<()>> + Send + Sync>;
type ReferenceGetter = Box<dyn Fn(&dyn Any) -> Option<Option<Arc<dyn ManagedObject>>> + Send + Sync>;

/// How primary keys are produced for an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// The application sets the identifier before `persist`.
    Assigned,
    /// Batched values from a database sequence. `allocation_size` must equal the
    /// sequence increment; `None` falls back to the session configuration.
    Sequence {
        name: String,
        allocation_size: Option<u32>,
    },
    /// The database assigns the key while executing the INSERT.
    Identity,
    /// A random v4 UUID assigned at persist time.
    Uuid,
}

impl GenerationStrategy {
    pub fn sequence(name: impl Into<String>, allocation_size: u32) -> Self {
        Self::Sequence {
            name: name.into(),
            allocation_size: Some(allocation_size),
        }
    }

    /// Whether the identifier is known before the INSERT executes.
    pub fn is_pre_allocatable(&self) -> bool {
        !matches!(self, Self::Identity)
    }
}

/// What kind of state a mapped field holds.
#[derive(Clone, Copy)]
pub enum FieldKind {
    Basic,
    /// Optimistic lock counter, maintained by the engine.
    Version,
    /// Owning side of an association; stored as a foreign key column.
    ManyToOne {
        target: fn() -> &'static EntityMapping,
    },
    /// Inverse side of a `ManyToOne`; no column, loaded lazily.
    OneToMany {
        target: fn() -> &'static EntityMapping,
        mapped_by: &'static str,
    },
}

impl FieldKind {
    pub fn is_association(&self) -> bool {
        matches!(self, Self::ManyToOne { .. } | Self::OneToMany { .. })
    }

    pub fn target(&self) -> Option<&'static EntityMapping> {
        match self {
            Self::ManyToOne { target } | Self::OneToMany { target, .. } => Some(target()),
            _ => None,
        }
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "Basic"),
            Self::Version => write!(f, "Version"),
            Self::ManyToOne { target } => write!(f, "ManyToOne({})", target().entity_name()),
            Self::OneToMany { target, mapped_by } => {
                write!(f, "OneToMany({}.{})", target().entity_name(), mapped_by)
            }
        }
    }
}

/// A value read through the accessor table.
pub enum FieldRead {
    Value(Value),
    Reference(Option<Arc<dyn ManagedObject>>),
}

enum Accessor {
    Value {
        get: ValueGetter,
        set: Option<ValueSetter>,
    },
    Reference {
        get: ReferenceGetter,
    },
    None,
}

pub struct IdMapping {
    field: &'static str,
    column: String,
    strategy: GenerationStrategy,
    get: ValueGetter,
    set: ValueSetter,
}

impl IdMapping {
    pub fn new<T: 'static>(
        field: &'static str,
        strategy: GenerationStrategy,
        get: fn(&T) -> Value,
        set: fn(&mut T, Value) -> Result<()>,
    ) -> Self {
        Self {
            field,
            column: field.to_string(),
            strategy,
            get: Box::new(move |any: &dyn Any| any.downcast_ref::<T>().map(get)),
            set: Box::new(move |any: &mut dyn Any, value: Value| any.downcast_mut::<T>().map(|entity| set(entity, value))),
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn column_name(&self) -> &str {
        &self.column
    }

    pub fn strategy(&self) -> &GenerationStrategy {
        &self.strategy
    }
}

pub struct FieldMapping {
    name: &'static str,
    column: Option<String>,
    updatable: bool,
    insertable: bool,
    kind: FieldKind,
    accessor: Accessor,
}

impl FieldMapping {
    pub fn basic<T: 'static>(name: &'static str, get: fn(&T) -> Value) -> Self {
        Self {
            name,
            column: Some(name.to_string()),
            updatable: true,
            insertable: true,
            kind: FieldKind::Basic,
            accessor: Accessor::Value {
                get: Box::new(move |any: &dyn Any| any.downcast_ref::<T>().map(get)),
                set: None,
            },
        }
    }

    pub fn version<T: 'static>(
        name: &'static str,
        get: fn(&T) -> Value,
        set: fn(&mut T, Value) -> Result<()>,
    ) -> Self {
        Self {
            name,
            column: Some(name.to_string()),
            updatable: false,
            insertable: true,
            kind: FieldKind::Version,
            accessor: Accessor::Value {
                get: Box::new(move |any: &dyn Any| any.downcast_ref::<T>().map(get)),
                set: Some(Box::new(move |any: &mut dyn Any, value: Value| {
                    any.downcast_mut::<T>().map(|entity| set(entity, value))
                })),
            },
        }
    }

    pub fn many_to_one<T: 'static, R: ReferenceField>(name: &'static str, get: fn(&T) -> &R) -> Self {
        Self {
            name,
            column: Some(format!("{}_id", name)),
            updatable: true,
            insertable: true,
            kind: FieldKind::ManyToOne {
                target: <R::Target as Entity>::mapping,
            },
            accessor: Accessor::Reference {
                get: Box::new(move |any: &dyn Any| {
                    any.downcast_ref::<T>()
                        .map(|entity| get(entity).as_reference().map(|r| r.erased()))
                }),
            },
        }
    }

    pub fn one_to_many<U: Entity>(name: &'static str, mapped_by: &'static str) -> Self {
        Self {
            name,
            column: None,
            updatable: false,
            insertable: false,
            kind: FieldKind::OneToMany {
                target: U::mapping,
                mapped_by,
            },
            accessor: Accessor::None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        if self.column.is_some() {
            self.column = Some(column.into());
        }
        self
    }

    pub fn updatable(mut self, updatable: bool) -> Self {
        if matches!(self.kind, FieldKind::Basic | FieldKind::ManyToOne { .. }) {
            self.updatable = updatable;
        }
        self
    }

    pub fn insertable(mut self, insertable: bool) -> Self {
        if self.column.is_some() {
            self.insertable = insertable;
        }
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn column_name(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    pub fn is_insertable(&self) -> bool {
        self.insertable
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub(crate) fn read(&self, entity_name: &str, entity: &dyn Any) -> Result<FieldRead> {
        let read = match &self.accessor {
            Accessor::Value { get, .. } => get(entity).map(FieldRead::Value),
            Accessor::Reference { get } => get(entity).map(FieldRead::Reference),
            Accessor::None => {
                return Err(OrmError::field_access(
                    entity_name,
                    self.name,
                    "field has no column accessor",
                ));
            }
        };
        read.ok_or_else(|| OrmError::field_access(entity_name, self.name, "entity type mismatch"))
    }

    pub(crate) fn write(&self, entity_name: &str, entity: &mut dyn Any, value: Value) -> Result<()> {
        match &self.accessor {
            Accessor::Value { set: Some(set), .. } => set(entity, value).ok_or_else(|| {
                OrmError::field_access(entity_name, self.name, "entity type mismatch")
            })?,
            _ => Err(OrmError::field_access(entity_name, self.name, "field is not writable")),
        }
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("updatable", &self.updatable)
            .field("insertable", &self.insertable)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Immutable mapping of one entity type, built once and shared for the
/// lifetime of the program.
pub struct EntityMapping {
    entity_name: &'static str,
    table_name: String,
    type_id: TypeId,
    id: IdMapping,
    fields: Vec<FieldMapping>,
}

impl EntityMapping {
    pub fn builder<T: 'static>(
        entity_name: &'static str,
        table_name: impl Into<String>,
        id: IdMapping,
    ) -> EntityMappingBuilder {
        EntityMappingBuilder {
            mapping: EntityMapping {
                entity_name,
                table_name: table_name.into(),
                type_id: TypeId::of::<T>(),
                id,
                fields: Vec::new(),
            },
        }
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn id(&self) -> &IdMapping {
        &self.id
    }

    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Fields compared by dirty checking, in snapshot order.
    pub fn updatable_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|field| {
            field.updatable && matches!(field.kind, FieldKind::Basic | FieldKind::ManyToOne { .. })
        })
    }

    pub fn insertable_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields
            .iter()
            .filter(|field| field.insertable && field.column.is_some())
    }

    pub fn version_field(&self) -> Option<&FieldMapping> {
        self.fields
            .iter()
            .find(|field| matches!(field.kind, FieldKind::Version))
    }

    /// Every column selected when loading a row: the key first, then fields in order.
    pub fn select_columns(&self) -> Vec<String> {
        let mut columns = vec![self.id.column.clone()];
        columns.extend(
            self.fields
                .iter()
                .filter_map(|field| field.column.clone()),
        );
        columns
    }

    pub fn read_id(&self, entity: &dyn Any) -> Result<Value> {
        (self.id.get)(entity)
            .ok_or_else(|| OrmError::field_access(self.entity_name, self.id.field, "entity type mismatch"))
    }

    /// Identifier of an entity, or `None` while it is unassigned.
    pub fn identifier(&self, entity: &dyn Any) -> Result<Option<Value>> {
        let id = self.read_id(entity)?;
        if is_unassigned(&id) {
            Ok(None)
        } else {
            Ok(Some(id))
        }
    }

    pub fn write_id(&self, entity: &mut dyn Any, value: Value) -> Result<()> {
        (self.id.set)(entity, value).ok_or_else(|| {
            OrmError::field_access(self.entity_name, self.id.field, "entity type mismatch")
        })?
    }

    pub(crate) fn check_type<T: 'static>(&self) -> Result<()> {
        if self.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(OrmError::Mapping(format!(
                "mapping '{}' does not describe type {}",
                self.entity_name,
                std::any::type_name::<T>()
            )))
        }
    }
}

/// `Null`, integer zero and the empty string all mean "no identifier yet".
pub(crate) fn is_unassigned(id: &Value) -> bool {
    match id {
        Value::Null => true,
        Value::Integer(0) => true,
        Value::Text(s) => s.is_empty(),
        Value::Uuid(u) => u.is_nil(),
        _ => false,
    }
}

impl fmt::Debug for EntityMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMapping")
            .field("entity_name", &self.entity_name)
            .field("table_name", &self.table_name)
            .field("id_column", &self.id.column)
            .field("strategy", &self.id.strategy)
            .field("fields", &self.fields)
            .finish()
    }
}

pub struct EntityMappingBuilder {
    mapping: EntityMapping,
}

impl EntityMappingBuilder {
    pub fn field(mut self, field: FieldMapping) -> Self {
        self.mapping.fields.push(field);
        self
    }

    pub fn build(self) -> EntityMapping {
        self.mapping
    }
}
