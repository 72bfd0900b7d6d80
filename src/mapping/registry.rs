use std::collections::{HashMap, HashSet};

use super::{EntityMapping, FieldKind, GenerationStrategy};
use crate::core::{OrmError, Result};

/// The mapping table consulted at runtime: entity name to mapping.
#[derive(Debug, Default, Clone)]
pub struct MappingRegistry {
    mappings: HashMap<&'static str, &'static EntityMapping>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mapping: &'static EntityMapping) -> Result<()> {
        if let Some(existing) = self.mappings.get(mapping.entity_name()) {
            if std::ptr::eq(*existing, mapping) {
                return Ok(());
            }
            return Err(OrmError::Mapping(format!(
                "entity name '{}' is registered twice",
                mapping.entity_name()
            )));
        }
        self.mappings.insert(mapping.entity_name(), mapping);
        Ok(())
    }

    pub fn for_type(&self, entity_name: &str) -> Result<&'static EntityMapping> {
        self.mappings
            .get(entity_name)
            .copied()
            .ok_or_else(|| OrmError::Mapping(format!("entity '{}' is not mapped", entity_name)))
    }

    pub fn contains(&self, entity_name: &str) -> bool {
        self.mappings.contains_key(entity_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static EntityMapping> + '_ {
        self.mappings.values().copied()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Check every registered mapping against the others.
    pub fn validate(&self) -> Result<()> {
        let mut tables = HashSet::new();
        for mapping in self.mappings.values() {
            if !tables.insert(mapping.table_name()) {
                return Err(OrmError::Mapping(format!(
                    "table '{}' is mapped by more than one entity",
                    mapping.table_name()
                )));
            }
            self.validate_mapping(mapping)?;
        }
        Ok(())
    }

    fn validate_mapping(&self, mapping: &EntityMapping) -> Result<()> {
        let entity = mapping.entity_name();
        if mapping.table_name().trim().is_empty() {
            return Err(OrmError::Mapping(format!("entity '{}' has an empty table name", entity)));
        }

        if let GenerationStrategy::Sequence {
            name,
            allocation_size,
        } = mapping.id().strategy()
        {
            if name.trim().is_empty() {
                return Err(OrmError::Mapping(format!(
                    "entity '{}' uses a sequence without a name",
                    entity
                )));
            }
            if *allocation_size == Some(0) {
                return Err(OrmError::Mapping(format!(
                    "sequence '{}' of entity '{}' has allocation size 0",
                    name, entity
                )));
            }
        }

        let mut columns = HashSet::new();
        columns.insert(mapping.id().column_name().to_string());
        let mut names = HashSet::new();
        names.insert(mapping.id().field());
        let mut versions = 0;

        for field in mapping.fields() {
            if !names.insert(field.name()) {
                return Err(OrmError::Mapping(format!(
                    "field '{}.{}' is mapped twice",
                    entity,
                    field.name()
                )));
            }
            if let Some(column) = field.column_name()
                && !columns.insert(column.to_string())
            {
                return Err(OrmError::Mapping(format!(
                    "column '{}' of table '{}' is mapped twice",
                    column,
                    mapping.table_name()
                )));
            }

            match field.kind() {
                FieldKind::Basic => {}
                FieldKind::Version => versions += 1,
                FieldKind::ManyToOne { target } => {
                    let target = target();
                    if !self.contains(target.entity_name()) {
                        return Err(OrmError::Mapping(format!(
                            "'{}.{}' references unmapped entity '{}'",
                            entity,
                            field.name(),
                            target.entity_name()
                        )));
                    }
                }
                FieldKind::OneToMany { target, mapped_by } => {
                    let target = target();
                    if !self.contains(target.entity_name()) {
                        return Err(OrmError::Mapping(format!(
                            "'{}.{}' references unmapped entity '{}'",
                            entity,
                            field.name(),
                            target.entity_name()
                        )));
                    }
                    let inverse = target.field(mapped_by).ok_or_else(|| {
                        OrmError::Mapping(format!(
                            "'{}.{}' is mapped by missing field '{}.{}'",
                            entity,
                            field.name(),
                            target.entity_name(),
                            mapped_by
                        ))
                    })?;
                    let points_back = matches!(
                        inverse.kind(),
                        FieldKind::ManyToOne { target } if target().entity_name() == entity
                    );
                    if !points_back {
                        return Err(OrmError::Mapping(format!(
                            "'{}.{}' must be a many-to-one association to '{}'",
                            target.entity_name(),
                            mapped_by,
                            entity
                        )));
                    }
                }
            }
        }

        if versions > 1 {
            return Err(OrmError::Mapping(format!(
                "entity '{}' declares more than one version field",
                entity
            )));
        }
        Ok(())
    }
}
