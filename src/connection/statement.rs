use std::fmt;

use crate::core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol.to_ascii_uppercase().as_str() {
            "=" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::NotEq),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::LtEq),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::GtEq),
            "LIKE" => Some(Self::Like),
            _ => None,
        }
    }

    /// Whether the operator takes a bound value.
    pub fn is_binary(&self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Like => "LIKE",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        };
        write!(f, "{}", symbol)
    }
}

/// `column op value`; the value is ignored for the null tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }
}

fn render_where(sql: &mut String, predicates: &[Predicate]) {
    for (i, predicate) in predicates.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        sql.push_str(&predicate.column);
        sql.push(' ');
        sql.push_str(&predicate.op.to_string());
        if predicate.op.is_binary() {
            sql.push_str(" ?");
        }
    }
}

fn where_binds<'a>(predicates: &'a [Predicate]) -> impl Iterator<Item = &'a Value> + 'a {
    predicates
        .iter()
        .filter(|p| p.op.is_binary())
        .map(|p| &p.value)
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub values: Vec<(String, Value)>,
    /// Key column filled in by the database, if any.
    pub generated_key: Option<String>,
}

impl InsertStatement {
    pub fn sql(&self) -> String {
        let columns: Vec<&str> = self.values.iter().map(|(c, _)| c.as_str()).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders
        )
    }

    pub fn binds(&self) -> Vec<&Value> {
        self.values.iter().map(|(_, v)| v).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub predicates: Vec<Predicate>,
}

impl UpdateStatement {
    pub fn sql(&self) -> String {
        let sets: Vec<String> = self
            .assignments
            .iter()
            .map(|(column, _)| format!("{} = ?", column))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", self.table, sets.join(", "));
        render_where(&mut sql, &self.predicates);
        sql
    }

    pub fn binds(&self) -> Vec<&Value> {
        self.assignments
            .iter()
            .map(|(_, v)| v)
            .chain(where_binds(&self.predicates))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub predicates: Vec<Predicate>,
}

impl DeleteStatement {
    pub fn sql(&self) -> String {
        let mut sql = format!("DELETE FROM {}", self.table);
        render_where(&mut sql, &self.predicates);
        sql
    }

    pub fn binds(&self) -> Vec<&Value> {
        where_binds(&self.predicates).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub predicates: Vec<Predicate>,
    pub order_by: Option<String>,
}

impl SelectStatement {
    pub fn sql(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.columns.join(", "), self.table);
        render_where(&mut sql, &self.predicates);
        if let Some(column) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(column);
        }
        sql
    }

    pub fn binds(&self) -> Vec<&Value> {
        where_binds(&self.predicates).collect()
    }
}
