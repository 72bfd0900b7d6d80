use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrmError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Lazy loading error: {0}")]
    LazyLoading(String),

    #[error("Field access error on {entity}.{field}: {reason}")]
    FieldAccess {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("Optimistic lock failure: {0}")]
    OptimisticLock(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Illegal entity state: {0}")]
    IllegalState(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl OrmError {
    pub(crate) fn field_access(
        entity: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::FieldAccess {
            entity: entity.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the session that raised this error must be discarded.
    ///
    /// Accessor failures and poisoned locks mean the in-memory state can no
    /// longer be trusted. Everything else is fatal to the failing operation only.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::FieldAccess { .. } | Self::LockError(_))
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;

impl<T> From<std::sync::PoisonError<T>> for OrmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrmError::field_access("Customer", "name", "downcast failed");
        assert_eq!(
            err.to_string(),
            "Field access error on Customer.name: downcast failed"
        );
    }

    #[test]
    fn test_session_fatal_classification() {
        assert!(OrmError::field_access("A", "b", "c").is_session_fatal());
        assert!(OrmError::LockError("poisoned".into()).is_session_fatal());
        assert!(!OrmError::OptimisticLock("Customer#1".into()).is_session_fatal());
        assert!(!OrmError::Transaction("inactive".into()).is_session_fatal());
    }
}
