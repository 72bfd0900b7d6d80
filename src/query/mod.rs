// ============================================================================
// Filter queries
// ============================================================================
//
// A filter is a conjunction of field comparisons against named parameters,
// optionally followed by an ordering:
//
//   name LIKE :pattern AND total >= :min ORDER BY total
//   customer = :owner AND note IS NULL
//
// Field names are mapping field names; the compiler resolves them to columns.
// Parsed templates are cached per (entity, filter text); parameters are bound
// on every call.
//
// ============================================================================

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use regex::Regex;

use crate::connection::{CompareOp, Predicate, SelectStatement};
use crate::core::{OrmError, Result, Value};
use crate::mapping::{EntityMapping, FieldKind};

lazy_static::lazy_static! {
    static ref CONDITION: Regex = Regex::new(
        r"(?i)^([A-Za-z_][A-Za-z0-9_]*)\s*(?:(IS\s+NOT\s+NULL|IS\s+NULL)|(<>|!=|<=|>=|=|<|>|LIKE)\s*:([A-Za-z_][A-Za-z0-9_]*))$"
    ).unwrap_or_else(|e| panic!("invalid condition regex: {}", e));
    static ref AND: Regex = Regex::new(r"(?i)\s+AND\s+").unwrap_or_else(|e| panic!("invalid AND regex: {}", e));
    static ref ORDER_BY: Regex = Regex::new(r"(?i)^(.*?)\s*\bORDER\s+BY\s+([A-Za-z_][A-Za-z0-9_]*)$")
        .unwrap_or_else(|e| panic!("invalid ORDER BY regex: {}", e));
}

/// Named parameters of one query execution.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    values: HashMap<String, Value>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

#[derive(Debug, Clone)]
struct Condition {
    column: String,
    op: CompareOp,
    param: Option<String>,
}

/// A parsed filter, independent of parameter values.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    conditions: Vec<Condition>,
    order_by: Option<String>,
}

impl QueryTemplate {
    /// Parameter names in bind order.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().filter_map(|c| c.param.as_deref())
    }
}

/// A parameterized statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    statement: SelectStatement,
}

impl CompiledQuery {
    pub fn statement(&self) -> &SelectStatement {
        &self.statement
    }

    pub fn sql(&self) -> String {
        self.statement.sql()
    }

    pub fn binds(&self) -> Vec<Value> {
        self.statement.binds().into_iter().cloned().collect()
    }
}

/// Turns a textual filter plus parameters into a SELECT for one entity.
pub trait QueryCompiler: Send + Sync {
    fn compile(
        &self,
        mapping: &'static EntityMapping,
        filter: &str,
        params: &QueryParams,
    ) -> Result<CompiledQuery>;
}

pub struct FilterCompiler {
    cache: Mutex<LruCache<(&'static str, String), Arc<QueryTemplate>>>,
}

impl FilterCompiler {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            OrmError::Configuration("query cache capacity must be at least 1".into())
        })?;
        Ok(Self {
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn cached_templates(&self) -> Result<usize> {
        Ok(self.cache.lock()?.len())
    }

    pub fn template(&self, mapping: &'static EntityMapping, filter: &str) -> Result<Arc<QueryTemplate>> {
        let cache_key = (mapping.entity_name(), filter.trim().to_string());
        if let Some(template) = self.cache.lock()?.get(&cache_key) {
            return Ok(Arc::clone(template));
        }
        let template = Arc::new(parse(mapping, &cache_key.1)?);
        self.cache.lock()?.put(cache_key, Arc::clone(&template));
        Ok(template)
    }
}

impl QueryCompiler for FilterCompiler {
    fn compile(
        &self,
        mapping: &'static EntityMapping,
        filter: &str,
        params: &QueryParams,
    ) -> Result<CompiledQuery> {
        let template = self.template(mapping, filter)?;
        let mut predicates = Vec::with_capacity(template.conditions.len());
        for condition in &template.conditions {
            let value = match &condition.param {
                Some(name) => params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| OrmError::Query(format!("parameter :{} is not bound", name)))?,
                None => Value::Null,
            };
            predicates.push(Predicate::new(condition.column.clone(), condition.op, value));
        }
        Ok(CompiledQuery {
            statement: SelectStatement {
                table: mapping.table_name().to_string(),
                columns: mapping.select_columns(),
                predicates,
                order_by: template.order_by.clone(),
            },
        })
    }
}

fn column_of(mapping: &EntityMapping, field: &str) -> Result<String> {
    if field == mapping.id().field() {
        return Ok(mapping.id().column_name().to_string());
    }
    let mapped = mapping.field(field).ok_or_else(|| {
        OrmError::Query(format!("{} has no field '{}'", mapping.entity_name(), field))
    })?;
    match (mapped.kind(), mapped.column_name()) {
        (FieldKind::OneToMany { .. }, _) | (_, None) => Err(OrmError::Query(format!(
            "{}.{} cannot be used in a filter",
            mapping.entity_name(),
            field
        ))),
        (_, Some(column)) => Ok(column.to_string()),
    }
}

fn parse(mapping: &EntityMapping, filter: &str) -> Result<QueryTemplate> {
    let (conditions_text, order_by) = match ORDER_BY.captures(filter) {
        Some(captures) => (
            captures.get(1).map_or("", |m| m.as_str()),
            Some(column_of(mapping, &captures[2])?),
        ),
        None => (filter, None),
    };

    let mut conditions = Vec::new();
    let conditions_text = conditions_text.trim();
    if !conditions_text.is_empty() {
        for part in AND.split(conditions_text) {
            let part = part.trim();
            let captures = CONDITION
                .captures(part)
                .ok_or_else(|| OrmError::Query(format!("cannot parse condition '{}'", part)))?;
            let column = column_of(mapping, &captures[1])?;
            let condition = if let Some(null_test) = captures.get(2) {
                let op = if null_test.as_str().to_ascii_uppercase().contains("NOT") {
                    CompareOp::IsNotNull
                } else {
                    CompareOp::IsNull
                };
                Condition {
                    column,
                    op,
                    param: None,
                }
            } else {
                let op = CompareOp::parse(&captures[3])
                    .ok_or_else(|| OrmError::Query(format!("unknown operator '{}'", &captures[3])))?;
                Condition {
                    column,
                    op,
                    param: Some(captures[4].to_string()),
                }
            };
            conditions.push(condition);
        }
    }

    Ok(QueryTemplate {
        conditions,
        order_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::test_support::Book;

    fn compiler() -> FilterCompiler {
        FilterCompiler::new(8).unwrap()
    }

    #[test]
    fn test_compiles_conditions_to_columns() {
        let params = QueryParams::new().set("a", 3i64).set("t", "D%");
        let query = compiler()
            .compile(Book::mapping(), "author = :a AND title like :t ORDER BY title", &params)
            .unwrap();
        assert_eq!(
            query.sql(),
            "SELECT id, title, author_id FROM books WHERE author_id = ? AND title LIKE ? ORDER BY title"
        );
        assert_eq!(query.binds(), vec![Value::Integer(3), Value::from("D%")]);
    }

    #[test]
    fn test_null_tests_take_no_parameter() {
        let query = compiler()
            .compile(Book::mapping(), "author IS NOT NULL", &QueryParams::new())
            .unwrap();
        assert_eq!(query.statement().predicates[0].op, CompareOp::IsNotNull);
        assert!(query.binds().is_empty());
    }

    #[test]
    fn test_empty_filter_selects_everything() {
        let query = compiler().compile(Book::mapping(), "  ", &QueryParams::new()).unwrap();
        assert!(query.statement().predicates.is_empty());
    }

    #[test]
    fn test_errors() {
        let c = compiler();
        let missing = c.compile(Book::mapping(), "title = :t", &QueryParams::new());
        assert!(matches!(missing, Err(OrmError::Query(_))));
        let unknown = c.compile(Book::mapping(), "pages > :p", &QueryParams::new().set("p", 1i64));
        assert!(matches!(unknown, Err(OrmError::Query(_))));
        let garbage = c.compile(Book::mapping(), "title ~ :p", &QueryParams::new().set("p", 1i64));
        assert!(matches!(garbage, Err(OrmError::Query(_))));
    }

    #[test]
    fn test_templates_are_cached() {
        let c = compiler();
        let params = QueryParams::new().set("t", "x");
        c.compile(Book::mapping(), "title = :t", &params).unwrap();
        c.compile(Book::mapping(), " title = :t ", &params).unwrap();
        assert_eq!(c.cached_templates().unwrap(), 1);
        assert!(FilterCompiler::new(0).is_err());
    }
}
