// ============================================================================
// Write-behind action queue
// ============================================================================
//
// Deferred writes ordered by (priority, insertion counter):
//
//   Insert          10   before anything that may reference the new row
//   Update          20
//   Delete          30   after rows that may still reference the victim
//
// An IdentityInsert is not queued: its key only exists once the INSERT ran,
// and actions enqueued after it may need that key for a foreign key column.
//
// Per key, a queued Delete wins over queued Updates: enqueueing a Delete
// drops them, and Updates for a key with a queued Delete are ignored.
//
// A failed flush keeps the inserts and deletes that did not run; only a
// rollback (or closing the session) discards them.
//
// ============================================================================

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{Level, event};

use crate::connection::Connection;
use crate::context::FieldChange;
use crate::core::{EntityKey, OrmError, Result, Value};
use crate::entity::ManagedObject;
use crate::persister::EntityPersister;

pub const INSERT_PRIORITY: u32 = 10;
pub const UPDATE_PRIORITY: u32 = 20;
pub const DELETE_PRIORITY: u32 = 30;

pub enum EntityAction {
    Insert {
        key: EntityKey,
        object: Arc<dyn ManagedObject>,
        persister: EntityPersister,
    },
    IdentityInsert {
        object: Arc<dyn ManagedObject>,
        persister: EntityPersister,
    },
    Update {
        key: EntityKey,
        object: Arc<dyn ManagedObject>,
        persister: EntityPersister,
        changes: Vec<FieldChange>,
        force_version: bool,
    },
    Delete {
        key: EntityKey,
        object: Arc<dyn ManagedObject>,
        persister: EntityPersister,
    },
}

impl EntityAction {
    pub fn priority(&self) -> u32 {
        match self {
            EntityAction::Insert { .. } | EntityAction::IdentityInsert { .. } => INSERT_PRIORITY,
            EntityAction::Update { .. } => UPDATE_PRIORITY,
            EntityAction::Delete { .. } => DELETE_PRIORITY,
        }
    }

    /// Whether the action waits in the queue instead of running at enqueue.
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, EntityAction::IdentityInsert { .. })
    }

    pub fn key(&self) -> Option<&EntityKey> {
        match self {
            EntityAction::Insert { key, .. }
            | EntityAction::Update { key, .. }
            | EntityAction::Delete { key, .. } => Some(key),
            EntityAction::IdentityInsert { .. } => None,
        }
    }

    pub fn object(&self) -> &Arc<dyn ManagedObject> {
        match self {
            EntityAction::Insert { object, .. }
            | EntityAction::IdentityInsert { object, .. }
            | EntityAction::Update { object, .. }
            | EntityAction::Delete { object, .. } => object,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntityAction::Insert { .. } => "insert",
            EntityAction::IdentityInsert { .. } => "identity-insert",
            EntityAction::Update { .. } => "update",
            EntityAction::Delete { .. } => "delete",
        }
    }

    /// Run against storage. Returns the generated key of an identity insert.
    pub fn execute(&self, conn: &mut dyn Connection) -> Result<Option<Value>> {
        event!(
            Level::DEBUG,
            action = self.name(),
            entity = self.object().mapping().entity_name(),
            key = ?self.key().map(|k| k.to_string()),
            "Executing action"
        );
        match self {
            EntityAction::Insert { object, persister, .. }
            | EntityAction::IdentityInsert { object, persister } => persister.insert(conn, object.as_ref()),
            EntityAction::Update {
                key,
                object,
                persister,
                changes,
                force_version,
            } => {
                persister.update(conn, key, object.as_ref(), changes, *force_version)?;
                Ok(None)
            }
            EntityAction::Delete { key, object, persister } => {
                persister.delete(conn, key, object.as_ref())?;
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for EntityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{}({})", self.name(), key),
            None => write!(f, "{}({})", self.name(), self.object().mapping().entity_name()),
        }
    }
}

struct Queued {
    priority: u32,
    seq: u64,
    action: EntityAction,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed: BinaryHeap is a max-heap and the smallest (priority, seq) runs first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct ActionQueue {
    heap: BinaryHeap<Queued>,
    counter: u64,
    inserts: HashSet<EntityKey>,
    deletes: HashSet<EntityKey>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action, or run it now when it is not scheduled.
    ///
    /// Returns the key generated by an immediately executed identity insert.
    pub fn enqueue(&mut self, action: EntityAction, conn: &mut dyn Connection) -> Result<Option<Value>> {
        if !action.is_scheduled() {
            return action.execute(conn);
        }

        match &action {
            EntityAction::Insert { key, .. } => {
                self.inserts.insert(key.clone());
            }
            EntityAction::Update { key, .. } if self.deletes.contains(key) => {
                event!(Level::DEBUG, key = %key, "Update suppressed by queued delete");
                return Ok(None);
            }
            EntityAction::Delete { key, .. } => {
                let key = key.clone();
                self.heap.retain(|queued| {
                    !matches!(&queued.action, EntityAction::Update { key: k, .. } if *k == key)
                });
                self.deletes.insert(key);
            }
            _ => {}
        }

        self.counter += 1;
        self.heap.push(Queued {
            priority: action.priority(),
            seq: self.counter,
            action,
        });
        Ok(None)
    }

    /// Drop the queued insert for `key`. Returns whether one was queued.
    pub fn cancel_insert(&mut self, key: &EntityKey) -> bool {
        if !self.inserts.remove(key) {
            return false;
        }
        self.heap.retain(|queued| {
            !matches!(&queued.action, EntityAction::Insert { key: k, .. } if k == key)
                && !matches!(&queued.action, EntityAction::Update { key: k, .. } if k == key)
        });
        true
    }

    /// Drop every queued action for `key`.
    pub fn forget(&mut self, key: &EntityKey) {
        self.inserts.remove(key);
        self.deletes.remove(key);
        self.heap.retain(|queued| queued.action.key() != Some(key));
    }

    pub fn has_pending_insert(&self, key: &EntityKey) -> bool {
        self.inserts.contains(key)
    }

    pub fn has_pending_delete(&self, key: &EntityKey) -> bool {
        self.deletes.contains(key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.inserts.clear();
        self.deletes.clear();
    }

    /// Drain the queue in order. `on_complete` sees every action that ran.
    ///
    /// The first failure stops execution and is returned. Inserts and deletes
    /// that did not run, the failing one included, stay queued for the next
    /// flush. Updates are dropped: the next dirty check rebuilds them from the
    /// snapshots, which only advance for updates that ran.
    pub fn execute_all(
        &mut self,
        conn: &mut dyn Connection,
        mut on_complete: impl FnMut(&EntityAction) -> Result<()>,
    ) -> Result<usize> {
        let mut executed = 0;
        while let Some(queued) = self.heap.pop() {
            if let Err(err) = queued.action.execute(conn) {
                let action = format!("{:?}", queued.action);
                if !matches!(queued.action, EntityAction::Update { .. }) {
                    self.heap.push(queued);
                }
                return Err(self.abort(action, err));
            }
            if let Some(key) = queued.action.key() {
                match queued.action {
                    EntityAction::Insert { .. } => {
                        self.inserts.remove(key);
                    }
                    EntityAction::Delete { .. } => {
                        self.deletes.remove(key);
                    }
                    _ => {}
                }
            }
            if let Err(err) = on_complete(&queued.action) {
                return Err(self.abort(format!("{:?}", queued.action), err));
            }
            executed += 1;
        }
        Ok(executed)
    }

    fn abort(&mut self, action: String, err: OrmError) -> OrmError {
        self.heap
            .retain(|queued| !matches!(queued.action, EntityAction::Update { .. }));
        event!(
            Level::WARN,
            action = %action,
            retained = self.heap.len(),
            error = %err,
            "Flush aborted"
        );
        err
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("queued", &self.heap.len())
            .field("pending_inserts", &self.inserts.len())
            .field("pending_deletes", &self.deletes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryDatabase;
    use crate::entity::{Entity, Ref};
    use crate::test_support::Note;

    fn note(id: i64) -> Ref<Note> {
        Ref::new(Note {
            id,
            body: format!("note {}", id),
        })
    }

    fn persister() -> EntityPersister {
        EntityPersister::new(Note::mapping())
    }

    fn insert(n: &Ref<Note>) -> EntityAction {
        EntityAction::Insert {
            key: n.key().unwrap(),
            object: n.erased(),
            persister: persister(),
        }
    }

    fn update(n: &Ref<Note>) -> EntityAction {
        EntityAction::Update {
            key: n.key().unwrap(),
            object: n.erased(),
            persister: persister(),
            changes: vec![FieldChange {
                field: "body",
                column: "body".into(),
                value: Value::from("changed"),
            }],
            force_version: false,
        }
    }

    fn delete(n: &Ref<Note>) -> EntityAction {
        EntityAction::Delete {
            key: n.key().unwrap(),
            object: n.erased(),
            persister: persister(),
        }
    }

    fn database() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.register_mapping(Note::mapping()).unwrap();
        db
    }

    fn run(queue: &mut ActionQueue, conn: &mut dyn Connection) -> Result<Vec<String>> {
        let mut order = Vec::new();
        queue.execute_all(conn, |action| {
            order.push(format!("{:?}", action));
            Ok(())
        })?;
        Ok(order)
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let db = database();
        let mut conn = db.open();
        let existing = note(1);
        persister().insert(&mut conn, existing.erased().as_ref()).unwrap();

        let mut queue = ActionQueue::new();
        queue.enqueue(update(&existing), &mut conn).unwrap();
        queue.enqueue(insert(&note(2)), &mut conn).unwrap();
        queue.enqueue(insert(&note(3)), &mut conn).unwrap();
        assert_eq!(queue.len(), 3);

        let order = run(&mut queue, &mut conn).unwrap();
        assert_eq!(order, vec!["insert(Note#2)", "insert(Note#3)", "update(Note#1)"]);
        assert!(queue.is_empty());
        assert!(!queue.has_pending_insert(&note(2).key().unwrap()));
    }

    #[test]
    fn test_delete_suppresses_updates() {
        let db = database();
        let mut conn = db.open();
        let n = note(1);
        persister().insert(&mut conn, n.erased().as_ref()).unwrap();

        let mut queue = ActionQueue::new();
        queue.enqueue(update(&n), &mut conn).unwrap();
        queue.enqueue(delete(&n), &mut conn).unwrap();
        queue.enqueue(update(&n), &mut conn).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.has_pending_delete(&n.key().unwrap()));

        let order = run(&mut queue, &mut conn).unwrap();
        assert_eq!(order, vec!["delete(Note#1)"]);
        assert_eq!(db.row_count("notes").unwrap(), 0);
    }

    #[test]
    fn test_cancel_insert() {
        let db = database();
        let mut conn = db.open();
        let n = note(1);
        let mut queue = ActionQueue::new();
        queue.enqueue(insert(&n), &mut conn).unwrap();
        assert!(queue.cancel_insert(&n.key().unwrap()));
        assert!(!queue.cancel_insert(&n.key().unwrap()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failure_keeps_unexecuted_inserts_and_deletes() {
        let db = database();
        let mut conn = db.open();
        let doomed = note(2);
        persister().insert(&mut conn, doomed.erased().as_ref()).unwrap();

        let mut queue = ActionQueue::new();
        let missing = note(1);
        let fresh = note(3);
        queue.enqueue(insert(&fresh), &mut conn).unwrap();
        queue.enqueue(update(&missing), &mut conn).unwrap();
        queue.enqueue(delete(&doomed), &mut conn).unwrap();

        let err = run(&mut queue, &mut conn).unwrap_err();
        assert!(matches!(err, OrmError::OptimisticLock(_)));
        assert_eq!(db.stats().deletes, 0);
        assert_eq!(queue.len(), 1);
        assert!(queue.has_pending_delete(&doomed.key().unwrap()));
        assert!(!queue.has_pending_insert(&fresh.key().unwrap()));

        let order = run(&mut queue, &mut conn).unwrap();
        assert_eq!(order, vec!["delete(Note#2)"]);
        assert_eq!(db.row_count("notes").unwrap(), 1);
    }

    #[test]
    fn test_failing_insert_stays_queued() {
        let db = database();
        let mut conn = db.open();
        persister().insert(&mut conn, note(1).erased().as_ref()).unwrap();

        let mut queue = ActionQueue::new();
        let duplicate = note(1);
        queue.enqueue(insert(&duplicate), &mut conn).unwrap();
        queue.enqueue(insert(&note(2)), &mut conn).unwrap();

        assert!(matches!(
            run(&mut queue, &mut conn),
            Err(OrmError::ConstraintViolation(_))
        ));
        assert_eq!(queue.len(), 2);
        assert!(queue.has_pending_insert(&duplicate.key().unwrap()));

        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.has_pending_insert(&duplicate.key().unwrap()));
    }
}
