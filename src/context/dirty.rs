use std::any::Any;
use std::sync::{Arc, Weak};

use super::{EntityEntry, EntityState, PersistenceContext};
use crate::core::{EntityKey, Result, Value};
use crate::entity::ManagedObject;
use crate::mapping::{EntityMapping, FieldRead};

/// Previous value of one updatable field.
#[derive(Clone)]
pub enum SnapshotValue {
    Value(Value),
    /// A many-to-one field: the referenced key plus the referenced instance,
    /// so that a swap between two equal-keyed instances is still detected.
    Reference {
        key: Option<EntityKey>,
        target: Option<Weak<dyn ManagedObject>>,
    },
}

impl SnapshotValue {
    fn from_read(read: FieldRead) -> Result<Self> {
        Ok(match read {
            FieldRead::Value(value) => SnapshotValue::Value(value),
            FieldRead::Reference(None) => SnapshotValue::Reference {
                key: None,
                target: None,
            },
            FieldRead::Reference(Some(object)) => {
                let key = object
                    .identifier()?
                    .map(|id| EntityKey::new(object.mapping().entity_name(), id));
                SnapshotValue::Reference {
                    key,
                    target: Some(Arc::downgrade(&object)),
                }
            }
        })
    }

    /// The value written to the field's column.
    pub fn column_value(&self) -> Value {
        match self {
            SnapshotValue::Value(value) => value.clone(),
            SnapshotValue::Reference { key: Some(key), .. } => key.id().clone(),
            SnapshotValue::Reference { key: None, .. } => Value::Null,
        }
    }

    /// Values compare by equality; references compare by key and by instance.
    pub fn matches(&self, other: &SnapshotValue) -> bool {
        match (self, other) {
            (SnapshotValue::Value(a), SnapshotValue::Value(b)) => a == b,
            (
                SnapshotValue::Reference { key: ka, target: ta },
                SnapshotValue::Reference { key: kb, target: tb },
            ) => {
                let same_target = match (ta, tb) {
                    (None, None) => true,
                    (Some(a), Some(b)) => Weak::ptr_eq(a, b),
                    _ => false,
                };
                ka == kb && same_target
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for SnapshotValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotValue::Value(value) => write!(f, "{:?}", value),
            SnapshotValue::Reference { key: Some(key), .. } => write!(f, "-> {}", key),
            SnapshotValue::Reference { key: None, target } => {
                if target.is_some() {
                    write!(f, "-> transient")
                } else {
                    write!(f, "-> null")
                }
            }
        }
    }
}

/// Field values aligned with `EntityMapping::updatable_fields`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    values: Vec<SnapshotValue>,
}

impl Snapshot {
    pub fn values(&self) -> &[SnapshotValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fields whose value in `current` differs from this snapshot.
    pub fn changes(&self, current: &Snapshot, mapping: &'static EntityMapping) -> Vec<FieldChange> {
        mapping
            .updatable_fields()
            .zip(self.values.iter().zip(current.values.iter()))
            .filter(|(_, (old, new))| !old.matches(new))
            .map(|(field, (_, new))| FieldChange {
                field: field.name(),
                column: field.column_name().unwrap_or(field.name()).to_string(),
                value: new.column_value(),
            })
            .collect()
    }

    pub fn same_as(&self, current: &Snapshot, mapping: &'static EntityMapping) -> bool {
        self.values.len() == current.values.len() && self.changes(current, mapping).is_empty()
    }
}

/// One changed column of a dirty entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: &'static str,
    pub column: String,
    pub value: Value,
}

#[derive(Debug)]
pub struct DirtyEntity {
    pub key: EntityKey,
    pub changes: Vec<FieldChange>,
}

/// Read every updatable field of a loaded instance through the accessor table.
pub fn snapshot(mapping: &'static EntityMapping, object: &dyn ManagedObject) -> Result<Snapshot> {
    let mut values = Vec::new();
    object.inspect(&mut |entity: &dyn Any| {
        values.clear();
        for field in mapping.updatable_fields() {
            let read = field.read(mapping.entity_name(), entity)?;
            values.push(SnapshotValue::from_read(read)?);
        }
        Ok(())
    })?;
    Ok(Snapshot { values })
}

/// Whether an entry takes part in dirty checking at all.
fn is_checkable(entry: &EntityEntry) -> bool {
    entry.state() == EntityState::Managed
        && !entry.is_read_only()
        && entry.snapshot().is_some()
        && entry.object().is_initialized()
}

/// Field-level deltas of one entry against its snapshot.
pub fn updated_fields(entry: &EntityEntry) -> Result<Vec<FieldChange>> {
    let Some(previous) = entry.snapshot().filter(|_| is_checkable(entry)) else {
        return Ok(Vec::new());
    };
    let current = snapshot(entry.mapping(), entry.object().as_ref())?;
    Ok(previous.changes(&current, entry.mapping()))
}

/// Every checkable entry with at least one changed field, skipping keys for
/// which `excluded` holds.
pub fn find_dirty_entities(
    context: &PersistenceContext,
    excluded: impl Fn(&EntityKey) -> bool,
) -> Result<Vec<DirtyEntity>> {
    let mut dirty = Vec::new();
    for (key, entry) in context.entries() {
        if excluded(key) || !is_checkable(entry) {
            continue;
        }
        let changes = updated_fields(entry)?;
        if !changes.is_empty() {
            dirty.push(DirtyEntity {
                key: key.clone(),
                changes,
            });
        }
    }
    dirty.sort_by(|a, b| {
        a.key
            .entity()
            .cmp(b.key.entity())
            .then_with(|| a.key.id().partial_cmp(b.key.id()).unwrap_or(std::cmp::Ordering::Equal))
    });
    Ok(dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Ref;
    use crate::test_support::{Author, Book};

    fn book(id: i64, title: &str, author: Option<Ref<Author>>) -> Book {
        Book {
            id,
            title: title.to_string(),
            author,
        }
    }

    fn managed_book(context: &mut PersistenceContext, book: Book) -> Ref<Book> {
        let key = EntityKey::new("Book", book.id);
        context
            .manage::<Book>(key, |_| Ok(Some(book)), |_| {})
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_unchanged_entity_is_clean() {
        let mut context = PersistenceContext::new();
        managed_book(&mut context, book(1, "Dune", None));
        assert!(find_dirty_entities(&context, |_| false).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_mutations_yield_final_delta() {
        let mut context = PersistenceContext::new();
        let handle = managed_book(&mut context, book(1, "Dune", None));
        handle.write(|b| b.title = "Dune II".into()).unwrap();
        handle.write(|b| b.title = "Dune Messiah".into()).unwrap();

        let dirty = find_dirty_entities(&context, |_| false).unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(
            dirty[0].changes,
            vec![FieldChange {
                field: "title",
                column: "title".into(),
                value: Value::from("Dune Messiah"),
            }]
        );
    }

    #[test]
    fn test_reverting_a_change_is_clean() {
        let mut context = PersistenceContext::new();
        let handle = managed_book(&mut context, book(1, "Dune", None));
        handle.write(|b| b.title = "Other".into()).unwrap();
        handle.write(|b| b.title = "Dune".into()).unwrap();
        assert!(find_dirty_entities(&context, |_| false).unwrap().is_empty());
    }

    #[test]
    fn test_reference_swap_with_equal_key_is_dirty() {
        let mut context = PersistenceContext::new();
        let first = Ref::new(Author::new(5, "Herbert"));
        let twin = Ref::new(Author::new(5, "Herbert"));
        let handle = managed_book(&mut context, book(1, "Dune", Some(first)));

        handle.write(|b| b.author = Some(twin)).unwrap();
        let dirty = find_dirty_entities(&context, |_| false).unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].changes[0].field, "author");
        assert_eq!(dirty[0].changes[0].value, Value::Integer(5));
    }

    #[test]
    fn test_read_only_and_excluded_entries_are_skipped() {
        let mut context = PersistenceContext::new();
        let a = managed_book(&mut context, book(1, "A", None));
        let b = managed_book(&mut context, book(2, "B", None));
        a.write(|x| x.title = "A2".into()).unwrap();
        b.write(|x| x.title = "B2".into()).unwrap();

        context
            .get_entry_mut(&EntityKey::new("Book", 1i64))
            .unwrap()
            .set_read_only(true);
        let dirty = find_dirty_entities(&context, |key| key.id() == &Value::Integer(2)).unwrap();
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_uninitialized_proxy_is_skipped() {
        let mut context = PersistenceContext::new();
        context
            .reference::<Book>(EntityKey::new("Book", 3i64), &Weak::new())
            .unwrap();
        assert!(find_dirty_entities(&context, |_| false).unwrap().is_empty());
    }
}
