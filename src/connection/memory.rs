use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{Level, event};

use super::pattern;
use super::statement::{
    CompareOp, DeleteStatement, InsertStatement, Predicate, SelectStatement, UpdateStatement,
};
use super::{Connection, ConnectionProvider};
use crate::core::{OrmError, Result, Row, Value};
use crate::mapping::{EntityMapping, FieldKind, GenerationStrategy};

/// Increment given to sequences whose mapping leaves the allocation size open.
pub const DEFAULT_SEQUENCE_INCREMENT: u32 = 50;

#[derive(Debug, Clone)]
struct ForeignKey {
    column: String,
    table: String,
}

#[derive(Debug, Clone)]
struct Table {
    key_column: String,
    columns: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
    identity: bool,
    rows: Vec<Row>,
}

impl Table {
    fn contains_key(&self, key: &Value) -> bool {
        self.rows
            .iter()
            .any(|row| row.get(&self.key_column) == Some(key))
    }

    fn check_column(&self, table: &str, column: &str) -> Result<()> {
        if column == self.key_column || self.columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(OrmError::Database(format!(
                "column '{}' does not exist in table '{}'",
                column, table
            )))
        }
    }
}

type Tables = HashMap<String, Table>;

#[derive(Debug, Clone, Copy)]
struct Sequence {
    current: i64,
    increment: i64,
}

/// Statement counters, used to assert database round trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementStats {
    pub selects: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub sequence_calls: u64,
}

#[derive(Default)]
struct Counters {
    selects: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    sequence_calls: AtomicU64,
}

#[derive(Default)]
struct DatabaseInner {
    tables: RwLock<Tables>,
    sequences: Mutex<HashMap<String, Sequence>>,
    identities: Mutex<HashMap<String, i64>>,
    counters: Counters,
    next_connection_id: AtomicU64,
}

/// In-process relational store.
///
/// Tables are created from entity mappings. Writes on an auto-commit
/// connection apply immediately; otherwise the connection works on a private
/// copy of all tables that replaces the shared state on commit. Sequences and
/// identity counters are never rolled back.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the table (and its sequence) described by a mapping.
    pub fn register_mapping(&self, mapping: &'static EntityMapping) -> Result<()> {
        let mut foreign_keys = Vec::new();
        let mut columns = Vec::new();
        for field in mapping.fields() {
            let Some(column) = field.column_name() else {
                continue;
            };
            columns.push(column.to_string());
            if let FieldKind::ManyToOne { target } = field.kind() {
                foreign_keys.push(ForeignKey {
                    column: column.to_string(),
                    table: target().table_name().to_string(),
                });
            }
        }

        let table = Table {
            key_column: mapping.id().column_name().to_string(),
            columns,
            foreign_keys,
            identity: matches!(mapping.id().strategy(), GenerationStrategy::Identity),
            rows: Vec::new(),
        };

        {
            let mut tables = self.inner.tables.write()?;
            if tables.contains_key(mapping.table_name()) {
                return Err(OrmError::Database(format!(
                    "table '{}' already exists",
                    mapping.table_name()
                )));
            }
            tables.insert(mapping.table_name().to_string(), table);
        }

        if let GenerationStrategy::Sequence {
            name,
            allocation_size,
        } = mapping.id().strategy()
        {
            let increment = allocation_size.unwrap_or(DEFAULT_SEQUENCE_INCREMENT);
            self.create_sequence(name, 1, i64::from(increment))?;
        }

        event!(Level::DEBUG, table = mapping.table_name(), "Table created");
        Ok(())
    }

    /// The first call of `next_sequence_value` returns `start`.
    pub fn create_sequence(&self, name: &str, start: i64, increment: i64) -> Result<()> {
        if increment <= 0 {
            return Err(OrmError::Database(format!(
                "sequence '{}' needs a positive increment",
                name
            )));
        }
        let mut sequences = self.inner.sequences.lock()?;
        if sequences.contains_key(name) {
            return Ok(());
        }
        sequences.insert(
            name.to_string(),
            Sequence {
                current: start - increment,
                increment,
            },
        );
        Ok(())
    }

    pub fn open(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1,
            database: self.clone(),
            auto_commit: true,
            pending: None,
            journal: Vec::new(),
            closed: false,
        }
    }

    /// Committed rows of a table.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let tables = self.inner.tables.read()?;
        tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| OrmError::Database(format!("table '{}' does not exist", table)))
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.rows(table)?.len())
    }

    pub fn stats(&self) -> StatementStats {
        let c = &self.inner.counters;
        StatementStats {
            selects: c.selects.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            sequence_calls: c.sequence_calls.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.inner.counters;
        for counter in [
            &c.selects,
            &c.inserts,
            &c.updates,
            &c.deletes,
            &c.sequence_calls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn next_identity(&self, table: &str) -> Result<i64> {
        let mut identities = self.inner.identities.lock()?;
        let next = identities.entry(table.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

impl ConnectionProvider for MemoryDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open()))
    }
}

fn matches_all(row: &Row, predicates: &[Predicate]) -> Result<bool> {
    for predicate in predicates {
        let value = row.get(&predicate.column).unwrap_or(&Value::Null);
        let matched = match predicate.op {
            CompareOp::IsNull => value.is_null(),
            CompareOp::IsNotNull => !value.is_null(),
            _ if value.is_null() || predicate.value.is_null() => false,
            CompareOp::Eq => value.compare(&predicate.value)?.is_eq(),
            CompareOp::NotEq => value.compare(&predicate.value)?.is_ne(),
            CompareOp::Lt => value.compare(&predicate.value)?.is_lt(),
            CompareOp::LtEq => value.compare(&predicate.value)?.is_le(),
            CompareOp::Gt => value.compare(&predicate.value)?.is_gt(),
            CompareOp::GtEq => value.compare(&predicate.value)?.is_ge(),
            CompareOp::Like => match (value.as_str(), predicate.value.as_str()) {
                (Some(text), Some(p)) => pattern::like(text, p)?,
                _ => {
                    return Err(OrmError::Query(format!(
                        "LIKE needs text operands, got {} and {}",
                        value.type_name(),
                        predicate.value.type_name()
                    )));
                }
            },
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn table<'t>(tables: &'t Tables, name: &str) -> Result<&'t Table> {
    tables
        .get(name)
        .ok_or_else(|| OrmError::Database(format!("table '{}' does not exist", name)))
}

fn table_mut<'t>(tables: &'t mut Tables, name: &str) -> Result<&'t mut Table> {
    tables
        .get_mut(name)
        .ok_or_else(|| OrmError::Database(format!("table '{}' does not exist", name)))
}

fn check_foreign_keys(tables: &Tables, name: &str, row: &Row) -> Result<()> {
    for fk in &table(tables, name)?.foreign_keys {
        let Some(value) = row.get(&fk.column).filter(|v| !v.is_null()) else {
            continue;
        };
        if !table(tables, &fk.table)?.contains_key(value) {
            return Err(OrmError::ConstraintViolation(format!(
                "{}.{} = {} has no matching row in '{}'",
                name, fk.column, value, fk.table
            )));
        }
    }
    Ok(())
}

fn check_not_referenced(tables: &Tables, name: &str, key: &Value) -> Result<()> {
    for (other_name, other) in tables {
        for fk in other.foreign_keys.iter().filter(|fk| fk.table == name) {
            if other.rows.iter().any(|row| row.get(&fk.column) == Some(key)) {
                return Err(OrmError::ConstraintViolation(format!(
                    "{} {} is still referenced by {}.{}",
                    name, key, other_name, fk.column
                )));
            }
        }
    }
    Ok(())
}

fn insert_row(tables: &mut Tables, name: &str, row: Row) -> Result<()> {
    check_foreign_keys(tables, name, &row)?;
    let t = table_mut(tables, name)?;
    let key = row.get(&t.key_column).cloned().unwrap_or(Value::Null);
    if t.contains_key(&key) {
        return Err(OrmError::ConstraintViolation(format!(
            "duplicate key {} in '{}'",
            key, name
        )));
    }
    t.rows.push(row);
    Ok(())
}

fn update_rows(tables: &mut Tables, statement: &UpdateStatement) -> Result<u64> {
    let name = statement.table.as_str();
    let t = table(tables, name)?;
    for (column, _) in &statement.assignments {
        t.check_column(name, column)?;
    }
    let mut updated = Vec::new();
    for (index, row) in t.rows.iter().enumerate() {
        if matches_all(row, &statement.predicates)? {
            let mut row = row.clone();
            for (column, value) in &statement.assignments {
                row.set(column.clone(), value.clone());
            }
            check_foreign_keys(tables, name, &row)?;
            updated.push((index, row));
        }
    }
    let count = updated.len() as u64;
    let t = table_mut(tables, name)?;
    for (index, row) in updated {
        t.rows[index] = row;
    }
    Ok(count)
}

fn delete_rows(tables: &mut Tables, statement: &DeleteStatement) -> Result<u64> {
    let name = statement.table.as_str();
    let t = table(tables, name)?;
    let mut doomed = Vec::new();
    for (index, row) in t.rows.iter().enumerate() {
        if matches_all(row, &statement.predicates)? {
            let key = row.get(&t.key_column).cloned().unwrap_or(Value::Null);
            check_not_referenced(tables, name, &key)?;
            doomed.push(index);
        }
    }
    let count = doomed.len() as u64;
    let t = table_mut(tables, name)?;
    for index in doomed.into_iter().rev() {
        t.rows.remove(index);
    }
    Ok(count)
}

/// A write made inside a transaction, replayed on the shared tables at commit.
#[derive(Debug, Clone)]
enum JournalEntry {
    Insert { table: String, row: Row },
    Update { statement: UpdateStatement, affected: u64 },
    Delete { statement: DeleteStatement, affected: u64 },
}

impl JournalEntry {
    /// Re-run the write on `tables`. A different affected-row count means a
    /// concurrent transaction committed a change to the same rows first.
    fn replay(&self, tables: &mut Tables) -> Result<()> {
        let (table, expected, actual) = match self {
            JournalEntry::Insert { table, row } => return insert_row(tables, table, row.clone()),
            JournalEntry::Update { statement, affected } => {
                (&statement.table, *affected, update_rows(tables, statement)?)
            }
            JournalEntry::Delete { statement, affected } => {
                (&statement.table, *affected, delete_rows(tables, statement)?)
            }
        };
        if actual != expected {
            return Err(OrmError::OptimisticLock(format!(
                "rows of '{}' were changed by a concurrent transaction ({} matched, {} expected)",
                table, actual, expected
            )));
        }
        Ok(())
    }
}

/// A connection to a `MemoryDatabase`.
///
/// Outside auto-commit, writes go to a private copy of the tables and are
/// journaled. Commit replays the journal on the current shared tables, so
/// key, foreign key and version predicates are checked against what other
/// connections committed in the meantime.
pub struct MemoryConnection {
    id: u64,
    database: MemoryDatabase,
    auto_commit: bool,
    pending: Option<Tables>,
    journal: Vec<JournalEntry>,
    closed: bool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(OrmError::Database(format!("connection {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> Result<R>) -> Result<R> {
        self.ensure_open()?;
        match &self.pending {
            Some(tables) => f(tables),
            None => f(&*self.database.inner.tables.read()?),
        }
    }

    fn write<R>(&mut self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        self.ensure_open()?;
        if self.auto_commit {
            let mut tables = self.database.inner.tables.write()?;
            return f(&mut tables);
        }
        if self.pending.is_none() {
            let copy = self.database.inner.tables.read()?.clone();
            self.pending = Some(copy);
        }
        match self.pending.as_mut() {
            Some(tables) => f(tables),
            None => Err(OrmError::IllegalState("no pending transaction state".into())),
        }
    }

    fn record(&mut self, entry: JournalEntry) {
        if !self.auto_commit {
            self.journal.push(entry);
        }
    }

    fn discard(&mut self) {
        self.pending = None;
        self.journal.clear();
    }

    /// Apply the journal to the shared tables. On a conflict nothing is
    /// applied and the transaction is gone.
    fn publish(&mut self) -> Result<()> {
        let journal = std::mem::take(&mut self.journal);
        if self.pending.take().is_none() {
            return Ok(());
        }
        let mut shared = self.database.inner.tables.write()?;
        let mut tables = shared.clone();
        for entry in &journal {
            entry.replay(&mut tables)?;
        }
        *shared = tables;
        event!(Level::TRACE, connection = self.id, writes = journal.len(), "publish");
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.ensure_open()?;
        if auto_commit && !self.auto_commit {
            self.publish()?;
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.publish()?;
        event!(Level::TRACE, connection = self.id, "commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.discard();
        event!(Level::TRACE, connection = self.id, "rollback");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.discard();
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn insert(&mut self, statement: &InsertStatement) -> Result<Option<Value>> {
        event!(Level::TRACE, connection = self.id, sql = %statement.sql(), "execute");
        self.database.inner.counters.inserts.fetch_add(1, Ordering::Relaxed);

        let name = statement.table.as_str();
        let (identity, key_column) = self.read(|tables| {
            let t = table(tables, name)?;
            for (column, _) in &statement.values {
                t.check_column(name, column)?;
            }
            Ok((t.identity, t.key_column.clone()))
        })?;

        let mut row = Row::from_pairs(statement.values.clone());
        let supplied = row.get(&key_column).filter(|v| !v.is_null()).cloned();
        let generated = match supplied {
            Some(_) => None,
            None if identity => Some(Value::Integer(self.database.next_identity(name)?)),
            None => {
                return Err(OrmError::ConstraintViolation(format!(
                    "{}.{} must not be null",
                    name, key_column
                )));
            }
        };
        if let Some(key) = &generated {
            row.set(key_column.clone(), key.clone());
        }

        self.write(|tables| insert_row(tables, name, row.clone()))?;
        self.record(JournalEntry::Insert {
            table: name.to_string(),
            row,
        });
        Ok(generated)
    }

    fn update(&mut self, statement: &UpdateStatement) -> Result<u64> {
        event!(Level::TRACE, connection = self.id, sql = %statement.sql(), "execute");
        self.database.inner.counters.updates.fetch_add(1, Ordering::Relaxed);

        let affected = self.write(|tables| update_rows(tables, statement))?;
        self.record(JournalEntry::Update {
            statement: statement.clone(),
            affected,
        });
        Ok(affected)
    }

    fn delete(&mut self, statement: &DeleteStatement) -> Result<u64> {
        event!(Level::TRACE, connection = self.id, sql = %statement.sql(), "execute");
        self.database.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);

        let affected = self.write(|tables| delete_rows(tables, statement))?;
        self.record(JournalEntry::Delete {
            statement: statement.clone(),
            affected,
        });
        Ok(affected)
    }

    fn select(&mut self, statement: &SelectStatement) -> Result<Vec<Row>> {
        event!(Level::TRACE, connection = self.id, sql = %statement.sql(), "execute");
        self.database.inner.counters.selects.fetch_add(1, Ordering::Relaxed);

        let name = statement.table.as_str();
        let mut rows = self.read(|tables| {
            let t = table(tables, name)?;
            for column in &statement.columns {
                t.check_column(name, column)?;
            }
            let mut rows = Vec::new();
            for row in &t.rows {
                if matches_all(row, &statement.predicates)? {
                    let projected = statement
                        .columns
                        .iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect();
                    rows.push(Row::from_pairs(projected));
                }
            }
            Ok(rows)
        })?;

        if let Some(column) = &statement.order_by {
            let mut failure = None;
            rows.sort_by(|a, b| {
                let left = a.get(column).unwrap_or(&Value::Null);
                let right = b.get(column).unwrap_or(&Value::Null);
                left.compare(right).unwrap_or_else(|err| {
                    failure.get_or_insert(err);
                    std::cmp::Ordering::Equal
                })
            });
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(rows)
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<i64> {
        self.ensure_open()?;
        self.database
            .inner
            .counters
            .sequence_calls
            .fetch_add(1, Ordering::Relaxed);
        let mut sequences = self.database.inner.sequences.lock()?;
        let seq = sequences
            .get_mut(sequence)
            .ok_or_else(|| OrmError::Database(format!("sequence '{}' does not exist", sequence)))?;
        seq.current += seq.increment;
        event!(Level::TRACE, sequence, value = seq.current, "nextval");
        Ok(seq.current)
    }
}
