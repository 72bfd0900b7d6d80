use std::any::Any;

use tracing::{Level, event};

use crate::connection::{
    CompareOp, Connection, DeleteStatement, InsertStatement, Predicate, SelectStatement,
    UpdateStatement,
};
use crate::context::FieldChange;
use crate::core::{EntityKey, OrmError, Result, Row, Value};
use crate::entity::ManagedObject;
use crate::mapping::{EntityMapping, FieldKind, FieldMapping, FieldRead, GenerationStrategy};

/// Row-level access for one entity type: turns managed instances into
/// statements and executes them on a connection.
#[derive(Debug, Clone, Copy)]
pub struct EntityPersister {
    mapping: &'static EntityMapping,
    log_statements: bool,
}

impl EntityPersister {
    pub fn new(mapping: &'static EntityMapping) -> Self {
        Self {
            mapping,
            log_statements: false,
        }
    }

    pub fn with_logging(mut self, log_statements: bool) -> Self {
        self.log_statements = log_statements;
        self
    }

    pub fn mapping(&self) -> &'static EntityMapping {
        self.mapping
    }

    fn log(&self, sql: &str) {
        if self.log_statements {
            event!(Level::DEBUG, entity = self.mapping.entity_name(), sql = %sql, "statement");
        }
    }

    /// Column value of one field; references become the target's key.
    fn column_value(&self, field: &FieldMapping, entity: &dyn Any) -> Result<Value> {
        match field.read(self.mapping.entity_name(), entity)? {
            FieldRead::Value(value) => Ok(value),
            FieldRead::Reference(None) => Ok(Value::Null),
            FieldRead::Reference(Some(target)) => target.identifier()?.ok_or_else(|| {
                OrmError::IllegalState(format!(
                    "{}.{} references a transient {}; persist it first",
                    self.mapping.entity_name(),
                    field.name(),
                    target.mapping().entity_name()
                ))
            }),
        }
    }

    fn version_value(&self, entity: &dyn Any) -> Result<Option<(&'static FieldMapping, i64)>> {
        let Some(field) = self.mapping.version_field() else {
            return Ok(None);
        };
        match field.read(self.mapping.entity_name(), entity)? {
            FieldRead::Value(Value::Integer(v)) => Ok(Some((field, v))),
            FieldRead::Value(Value::Null) => Ok(Some((field, 0))),
            _ => Err(OrmError::field_access(
                self.mapping.entity_name(),
                field.name(),
                "version field must hold an integer",
            )),
        }
    }

    fn key_predicate(&self, id: &Value) -> Predicate {
        Predicate::eq(self.mapping.id().column_name(), id.clone())
    }

    /// INSERT the current state; returns the generated key for identity
    /// columns after writing it into the instance.
    pub fn insert(&self, conn: &mut dyn Connection, object: &dyn ManagedObject) -> Result<Option<Value>> {
        let identity = matches!(self.mapping.id().strategy(), GenerationStrategy::Identity);
        let mut values = Vec::new();
        object.inspect(&mut |entity: &dyn Any| {
            values.clear();
            if !identity {
                let id = self.mapping.identifier(entity)?.ok_or_else(|| {
                    OrmError::IllegalState(format!(
                        "{} has no identifier at insert time",
                        self.mapping.entity_name()
                    ))
                })?;
                values.push((self.mapping.id().column_name().to_string(), id));
            }
            for field in self.mapping.insertable_fields() {
                let column = field.column_name().unwrap_or(field.name()).to_string();
                values.push((column, self.column_value(field, entity)?));
            }
            Ok(())
        })?;

        let statement = InsertStatement {
            table: self.mapping.table_name().to_string(),
            values,
            generated_key: identity.then(|| self.mapping.id().column_name().to_string()),
        };
        self.log(&statement.sql());
        let generated = conn.insert(&statement)?;

        if identity {
            let id = generated.ok_or_else(|| {
                OrmError::Database(format!(
                    "no key generated for identity table '{}'",
                    self.mapping.table_name()
                ))
            })?;
            object.inspect_mut(&mut |entity: &mut dyn Any| self.mapping.write_id(entity, id.clone()))?;
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// UPDATE the changed columns. With a version field the row is matched on
    /// the old version and the version is incremented, also when `changes` is
    /// empty and `force_version` is set.
    pub fn update(
        &self,
        conn: &mut dyn Connection,
        key: &EntityKey,
        object: &dyn ManagedObject,
        changes: &[FieldChange],
        force_version: bool,
    ) -> Result<()> {
        let mut version = None;
        object.inspect(&mut |entity: &dyn Any| {
            version = self.version_value(entity)?;
            Ok(())
        })?;
        if changes.is_empty() && !(force_version && version.is_some()) {
            return Ok(());
        }

        let mut assignments: Vec<(String, Value)> = changes
            .iter()
            .map(|change| (change.column.clone(), change.value.clone()))
            .collect();
        let mut predicates = vec![self.key_predicate(key.id())];
        if let Some((field, old)) = version {
            let column = field.column_name().unwrap_or(field.name());
            assignments.push((column.to_string(), Value::Integer(old + 1)));
            predicates.push(Predicate::eq(column, Value::Integer(old)));
        }

        let statement = UpdateStatement {
            table: self.mapping.table_name().to_string(),
            assignments,
            predicates,
        };
        self.log(&statement.sql());
        if conn.update(&statement)? == 0 {
            return Err(OrmError::OptimisticLock(format!(
                "{} was updated or deleted by another transaction",
                key
            )));
        }

        if let Some((field, old)) = version {
            let entity_name = self.mapping.entity_name();
            object.inspect_mut(&mut |entity: &mut dyn Any| {
                field.write(entity_name, entity, Value::Integer(old + 1))
            })?;
        }
        Ok(())
    }

    pub fn delete(&self, conn: &mut dyn Connection, key: &EntityKey, object: &dyn ManagedObject) -> Result<()> {
        let mut predicates = vec![self.key_predicate(key.id())];
        if object.is_initialized() {
            let mut version = None;
            object.inspect(&mut |entity: &dyn Any| {
                version = self.version_value(entity)?;
                Ok(())
            })?;
            if let Some((field, old)) = version {
                let column = field.column_name().unwrap_or(field.name());
                predicates.push(Predicate::eq(column, Value::Integer(old)));
            }
        }

        let statement = DeleteStatement {
            table: self.mapping.table_name().to_string(),
            predicates,
        };
        self.log(&statement.sql());
        if conn.delete(&statement)? == 0 {
            return Err(OrmError::OptimisticLock(format!(
                "{} was updated or deleted by another transaction",
                key
            )));
        }
        Ok(())
    }

    /// Every mapped column of a loaded instance, key first.
    pub fn to_row(&self, object: &dyn ManagedObject) -> Result<Row> {
        let mut row = Row::new();
        object.inspect(&mut |entity: &dyn Any| {
            row = Row::new().with(self.mapping.id().column_name(), self.mapping.read_id(entity)?);
            for field in self.mapping.fields() {
                if let Some(column) = field.column_name() {
                    row.set(column, self.column_value(field, entity)?);
                }
            }
            Ok(())
        })?;
        Ok(row)
    }

    pub fn load(&self, conn: &mut dyn Connection, id: &Value) -> Result<Option<Row>> {
        let mut rows = self.select(conn, vec![self.key_predicate(id)], None)?;
        if rows.len() > 1 {
            return Err(OrmError::Database(format!(
                "{} rows share key {} in '{}'",
                rows.len(),
                id,
                self.mapping.table_name()
            )));
        }
        Ok(rows.pop())
    }

    /// Rows of the many-to-one column `column` pointing at `owner_id`.
    pub fn load_by_foreign_key(&self, conn: &mut dyn Connection, column: &str, owner_id: &Value) -> Result<Vec<Row>> {
        let order_by = Some(self.mapping.id().column_name().to_string());
        self.select(conn, vec![Predicate::new(column, CompareOp::Eq, owner_id.clone())], order_by)
    }

    pub fn select(
        &self,
        conn: &mut dyn Connection,
        predicates: Vec<Predicate>,
        order_by: Option<String>,
    ) -> Result<Vec<Row>> {
        let statement = SelectStatement {
            table: self.mapping.table_name().to_string(),
            columns: self.mapping.select_columns(),
            predicates,
            order_by,
        };
        self.log(&statement.sql());
        conn.select(&statement)
    }

    /// Foreign key column of a many-to-one field.
    pub fn join_column(&self, field: &str) -> Result<&'static str> {
        let mapping = self.mapping;
        let field = mapping.field(field).ok_or_else(|| {
            OrmError::Mapping(format!("{}.{} is not mapped", mapping.entity_name(), field))
        })?;
        match (field.kind(), field.column_name()) {
            (FieldKind::ManyToOne { .. }, Some(column)) => Ok(column),
            _ => Err(OrmError::Mapping(format!(
                "{}.{} is not a many-to-one association",
                mapping.entity_name(),
                field.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryDatabase;
    use crate::entity::{Entity, Ref};
    use crate::test_support::{Author, Note};

    fn setup() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.register_mapping(Note::mapping()).unwrap();
        db.register_mapping(Author::mapping()).unwrap();
        db.register_mapping(crate::test_support::Book::mapping()).unwrap();
        db
    }

    #[test]
    fn test_insert_and_load() {
        let db = setup();
        let mut conn = db.open();
        let persister = EntityPersister::new(Note::mapping());
        let note = Ref::new(Note {
            id: 4,
            body: "hello".into(),
        });
        assert_eq!(persister.insert(&mut conn, note.erased().as_ref()).unwrap(), None);

        let row = persister.load(&mut conn, &Value::Integer(4)).unwrap().unwrap();
        assert_eq!(row.get("body"), Some(&Value::from("hello")));
        assert!(persister.load(&mut conn, &Value::Integer(5)).unwrap().is_none());
    }

    #[test]
    fn test_identity_insert_writes_generated_id() {
        let db = setup();
        let mut conn = db.open();
        let persister = EntityPersister::new(Author::mapping());
        let author = Ref::new(Author::new(0, "Le Guin"));
        let id = persister.insert(&mut conn, author.erased().as_ref()).unwrap();
        assert_eq!(id, Some(Value::Integer(1)));
        assert_eq!(author.read(|a| a.id).unwrap(), 1);
    }

    #[test]
    fn test_versioned_update_detects_stale_state() {
        let db = setup();
        let mut conn = db.open();
        let persister = EntityPersister::new(Author::mapping());
        let author = Ref::new(Author::new(0, "Le Guin"));
        persister.insert(&mut conn, author.erased().as_ref()).unwrap();
        let key = author.key().unwrap();

        let stale = Ref::new(Author::new(1, "Stale"));
        let change = FieldChange {
            field: "name",
            column: "name".into(),
            value: Value::from("Ursula"),
        };
        persister
            .update(&mut conn, &key, author.erased().as_ref(), std::slice::from_ref(&change), false)
            .unwrap();
        assert_eq!(author.read(|a| a.version).unwrap(), 1);

        let err = persister
            .update(&mut conn, &key, stale.erased().as_ref(), &[change], false)
            .unwrap_err();
        assert!(matches!(err, OrmError::OptimisticLock(_)));

        let err = persister.delete(&mut conn, &key, stale.erased().as_ref()).unwrap_err();
        assert!(matches!(err, OrmError::OptimisticLock(_)));
        persister.delete(&mut conn, &key, author.erased().as_ref()).unwrap();
    }

    #[test]
    fn test_forced_version_increment_without_changes() {
        let db = setup();
        let mut conn = db.open();
        let persister = EntityPersister::new(Author::mapping());
        let author = Ref::new(Author::new(0, "A"));
        persister.insert(&mut conn, author.erased().as_ref()).unwrap();
        let key = author.key().unwrap();

        db.reset_stats();
        persister.update(&mut conn, &key, author.erased().as_ref(), &[], false).unwrap();
        assert_eq!(db.stats().updates, 0);
        persister.update(&mut conn, &key, author.erased().as_ref(), &[], true).unwrap();
        assert_eq!(db.stats().updates, 1);
        assert_eq!(author.read(|a| a.version).unwrap(), 1);
    }

    #[test]
    fn test_join_column() {
        let persister = EntityPersister::new(crate::test_support::Book::mapping());
        assert_eq!(persister.join_column("author").unwrap(), "author_id");
        assert!(persister.join_column("title").is_err());
    }
}
