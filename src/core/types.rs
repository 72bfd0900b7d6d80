use std::fmt;

use super::Value;

/// Identifies one logical row within a session: entity name plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity: &'static str,
    id: Value,
}

impl EntityKey {
    pub fn new(entity: &'static str, id: impl Into<Value>) -> Self {
        Self {
            entity,
            id: id.into(),
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Identifies one lazily loaded collection of one owning entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    owner: EntityKey,
    role: &'static str,
}

impl CollectionKey {
    pub fn new(owner: EntityKey, role: &'static str) -> Self {
        Self { owner, role }
    }

    pub fn owner(&self) -> &EntityKey {
        &self.owner
    }

    pub fn owner_entity(&self) -> &'static str {
        self.owner.entity()
    }

    pub fn owner_id(&self) -> &Value {
        self.owner.id()
    }

    /// Name of the association field on the owner.
    pub fn role(&self) -> &'static str {
        self.role
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.role)
    }
}

/// A result row, addressed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self { columns: pairs }
    }

    /// Set a column, replacing an existing value for the same column.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
