//! Shared entity model and factory setup for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rustmemorm::connection::{
    DeleteStatement, InsertStatement, SelectStatement, UpdateStatement,
};
use rustmemorm::{
    Connection, ConnectionProvider, Entity, LazyList, MemoryDatabase, Ref, Result, Row,
    SessionConfig, SessionFactory, Value,
};
use uuid::Uuid;

#[derive(Entity, Debug, Clone)]
#[entity(table = "customers")]
pub struct Customer {
    #[id(strategy = "sequence", sequence = "customer_seq", allocation_size = 10)]
    pub id: i64,
    #[column(name = "full_name")]
    pub name: String,
    pub email: Option<String>,
    #[version]
    pub version: i64,
    #[one_to_many(mapped_by = "customer")]
    pub orders: LazyList<Order>,
}

impl Customer {
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            email: None,
            version: 0,
            orders: LazyList::new(),
        }
    }
}

#[derive(Entity, Debug)]
#[entity(table = "orders")]
pub struct Order {
    #[id(strategy = "sequence")]
    pub id: i64,
    pub total: f64,
    #[many_to_one]
    pub customer: Ref<Customer>,
    #[transient]
    pub display: String,
}

impl Order {
    pub fn new(total: f64, customer: &Ref<Customer>) -> Self {
        Self {
            id: 0,
            total,
            customer: customer.clone(),
            display: String::new(),
        }
    }
}

#[derive(Entity, Debug)]
#[entity(table = "audit_entries")]
pub struct AuditEntry {
    #[id(strategy = "identity")]
    pub id: i64,
    pub message: String,
}

#[derive(Entity, Debug, Clone)]
#[entity(table = "tags")]
pub struct Tag {
    #[id(column = "code")]
    pub code: String,
    pub label: String,
}

#[derive(Entity, Debug)]
#[entity(table = "tickets")]
pub struct Ticket {
    #[id(strategy = "uuid")]
    pub id: Uuid,
    pub subject: String,
    #[column(updatable = false)]
    pub opened_by: String,
}

pub fn database() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.register_mapping(Customer::mapping()).unwrap();
    db.register_mapping(Order::mapping()).unwrap();
    db.register_mapping(AuditEntry::mapping()).unwrap();
    db.register_mapping(Tag::mapping()).unwrap();
    db.register_mapping(Ticket::mapping()).unwrap();
    db
}

pub fn factory_with(config: SessionConfig, provider: impl ConnectionProvider + 'static) -> SessionFactory {
    SessionFactory::builder()
        .config(config)
        .register::<Customer>()
        .register::<Order>()
        .register::<AuditEntry>()
        .register::<Tag>()
        .register::<Ticket>()
        .build(provider)
        .unwrap()
}

pub fn setup() -> (MemoryDatabase, SessionFactory) {
    let db = database();
    let factory = factory_with(SessionConfig::new("test"), db.clone());
    (db, factory)
}

/// Store one customer in its own session and return its id.
pub fn seed_customer(factory: &SessionFactory, name: &str) -> i64 {
    let session = factory.open_session().unwrap();
    let customer = Ref::new(Customer::new(name));
    session.persist(&customer).unwrap();
    session.flush().unwrap();
    let id = customer.read(|c| c.id).unwrap();
    session.close().unwrap();
    id
}

// ============================================================================
// Statement recording
// ============================================================================

type StatementLog = Arc<Mutex<Vec<(String, String)>>>;

/// Wraps a `MemoryDatabase` and records every write statement in order.
#[derive(Clone)]
pub struct RecordingProvider {
    pub database: MemoryDatabase,
    log: StatementLog,
}

impl RecordingProvider {
    pub fn new(database: MemoryDatabase) -> Self {
        Self {
            database,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Writes as `"VERB table"`, e.g. `"INSERT customers"`.
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(summary, _)| summary.clone()).collect()
    }

    /// Full SQL of every recorded write.
    pub fn sql(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, sql)| sql.clone()).collect()
    }

    pub fn reset(&self) {
        self.log.lock().unwrap().clear();
    }
}

impl ConnectionProvider for RecordingProvider {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(RecordingConnection {
            inner: self.database.connect()?,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingConnection {
    inner: Box<dyn Connection>,
    log: StatementLog,
}

impl RecordingConnection {
    fn record(&self, verb: &str, table: &str, sql: String) {
        self.log.lock().unwrap().push((format!("{} {}", verb, table), sql));
    }
}

impl Connection for RecordingConnection {
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.inner.set_auto_commit(auto_commit)
    }

    fn auto_commit(&self) -> bool {
        self.inner.auto_commit()
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn insert(&mut self, statement: &InsertStatement) -> Result<Option<Value>> {
        self.record("INSERT", &statement.table, statement.sql());
        self.inner.insert(statement)
    }

    fn update(&mut self, statement: &UpdateStatement) -> Result<u64> {
        self.record("UPDATE", &statement.table, statement.sql());
        self.inner.update(statement)
    }

    fn delete(&mut self, statement: &DeleteStatement) -> Result<u64> {
        self.record("DELETE", &statement.table, statement.sql());
        self.inner.delete(statement)
    }

    fn select(&mut self, statement: &SelectStatement) -> Result<Vec<Row>> {
        self.inner.select(statement)
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<i64> {
        self.inner.next_sequence_value(sequence)
    }
}
