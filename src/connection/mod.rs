// ============================================================================
// Database access layer
// ============================================================================
//
// The unit of work talks to storage only through `Connection`: one physical
// connection per session, synchronous calls, statements described as plain
// structs. `MemoryDatabase` is the in-process implementation used by default
// and in tests.
//
// ============================================================================

pub mod memory;
pub mod pattern;
pub mod statement;

pub use memory::{MemoryConnection, MemoryDatabase, StatementStats};
pub use statement::{
    CompareOp, DeleteStatement, InsertStatement, Predicate, SelectStatement, UpdateStatement,
};

use crate::core::{Result, Row, Value};

/// A single physical connection.
///
/// Similar to a JDBC connection: auto-commit is on until a transaction
/// begins, and every write reports the number of affected rows.
pub trait Connection: Send {
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    fn auto_commit(&self) -> bool;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Execute an INSERT; returns the key when the database generated one.
    fn insert(&mut self, statement: &InsertStatement) -> Result<Option<Value>>;

    fn update(&mut self, statement: &UpdateStatement) -> Result<u64>;

    fn delete(&mut self, statement: &DeleteStatement) -> Result<u64>;

    fn select(&mut self, statement: &SelectStatement) -> Result<Vec<Row>>;

    /// Advance a sequence by its configured increment and return the new value.
    fn next_sequence_value(&mut self, sequence: &str) -> Result<i64>;
}

/// Opens connections for new sessions.
pub trait ConnectionProvider: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}
