use std::sync::Weak;

use super::{Entity, LazyList, ReferenceField};
use crate::context::PersistenceContext;
use crate::core::{CollectionKey, EntityKey, FieldValue, OrmError, Result, Row, Value};
use crate::mapping::{EntityMapping, FieldKind, FieldMapping};
use crate::session::SessionShared;

/// Builds one entity from a loaded row.
///
/// Associations are resolved through the persistence context: a foreign key
/// of an entity already known to the session yields that instance, anything
/// else yields a registered proxy. Collections come back unloaded.
pub struct Hydrator<'a> {
    mapping: &'static EntityMapping,
    row: &'a Row,
    owner: EntityKey,
    context: &'a mut PersistenceContext,
    session: &'a Weak<SessionShared>,
}

impl<'a> Hydrator<'a> {
    pub(crate) fn new(
        mapping: &'static EntityMapping,
        row: &'a Row,
        owner: EntityKey,
        context: &'a mut PersistenceContext,
        session: &'a Weak<SessionShared>,
    ) -> Self {
        Self {
            mapping,
            row,
            owner,
            context,
            session,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.owner
    }

    pub fn row(&self) -> &Row {
        self.row
    }

    pub fn id<V: FieldValue>(&self) -> Result<V> {
        let id = self.mapping.id();
        self.convert(id.field(), self.column(id.field(), id.column_name())?)
    }

    /// A basic or version field, converted from its column.
    pub fn value<V: FieldValue>(&self, field: &str) -> Result<V> {
        let mapping = self.field(field)?;
        let column = mapping.column_name().ok_or_else(|| {
            OrmError::field_access(self.mapping.entity_name(), field, "field has no column")
        })?;
        self.convert(field, self.column(field, column)?)
    }

    /// A many-to-one field, resolved to a managed instance or a proxy.
    pub fn reference<R: ReferenceField>(&mut self, field: &str) -> Result<R> {
        let mapping = self.field(field)?;
        if !matches!(mapping.kind(), FieldKind::ManyToOne { .. }) {
            return Err(OrmError::field_access(
                self.mapping.entity_name(),
                field,
                "field is not a many-to-one association",
            ));
        }
        let column = mapping.column_name().unwrap_or(field);
        let foreign_key = self.column(field, column)?;

        let reference = if foreign_key.is_null() {
            None
        } else {
            let target = R::Target::mapping();
            let key = EntityKey::new(target.entity_name(), foreign_key);
            Some(self.context.reference::<R::Target>(key, self.session)?)
        };

        R::from_reference(reference).ok_or_else(|| {
            OrmError::field_access(
                self.mapping.entity_name(),
                field,
                "required association has a null foreign key",
            )
        })
    }

    /// A one-to-many field, returned unloaded and bound to this session.
    pub fn collection<U: Entity>(&mut self, field: &str) -> Result<LazyList<U>> {
        let mapping = self.field(field)?;
        if !matches!(mapping.kind(), FieldKind::OneToMany { .. }) {
            return Err(OrmError::field_access(
                self.mapping.entity_name(),
                field,
                "field is not a one-to-many association",
            ));
        }
        let key = CollectionKey::new(self.owner.clone(), mapping.name());
        self.context.collection::<U>(key, self.session)
    }

    fn field(&self, field: &str) -> Result<&'static FieldMapping> {
        self.mapping.field(field).ok_or_else(|| {
            OrmError::field_access(self.mapping.entity_name(), field, "field is not mapped")
        })
    }

    fn column(&self, field: &str, column: &str) -> Result<Value> {
        self.row.get(column).cloned().ok_or_else(|| {
            OrmError::field_access(
                self.mapping.entity_name(),
                field,
                format!("column '{}' missing from row", column),
            )
        })
    }

    fn convert<V: FieldValue>(&self, field: &str, value: Value) -> Result<V> {
        V::from_value(value).map_err(|err| match err {
            OrmError::FieldAccess { reason, .. } => {
                OrmError::field_access(self.mapping.entity_name(), field, reason)
            }
            other => other,
        })
    }
}
