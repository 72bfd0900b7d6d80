// ============================================================================
// RustMemORM Library
// ============================================================================
//
// Unit-of-work persistence engine: a per-session identity map, snapshot based
// dirty checking, a priority ordered write-behind action queue, lazy proxies
// and collections, and batched sequence identifiers shared across sessions.
//
// ```text
// Session ──find──> PersistenceContext ──miss──> EntityPersister ──> Connection
//    │                     │
//    └──flush──> dirty check ──> ActionQueue ──insert/update/delete──┘
// ```
//
// ============================================================================

extern crate self as rustmemorm;

pub mod action;
pub mod connection;
pub mod context;
pub mod core;
pub mod entity;
pub mod id;
pub mod mapping;
pub mod persister;
pub mod query;
pub mod session;

#[cfg(test)]
mod test_support;

pub use crate::core::{CollectionKey, EntityKey, FieldValue, OrmError, Result, Row, Value};
pub use context::{EntityState, LockMode};
pub use entity::{Entity, Hydrator, LazyList, Ref};
pub use mapping::{EntityMapping, FieldMapping, GenerationStrategy, IdMapping};
pub use session::{Session, SessionConfig, SessionFactory, Transaction, TransactionState};

pub use connection::{Connection, ConnectionProvider, MemoryDatabase};
pub use query::QueryParams;

/// `#[derive(Entity)]` builds the mapping table entry and row hydration.
pub use rustmemorm_derive::Entity;
