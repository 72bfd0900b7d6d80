use serde::{Deserialize, Serialize};

use crate::connection::memory::DEFAULT_SEQUENCE_INCREMENT;
use crate::core::{OrmError, Result};

/// Session factory configuration
///
/// Loaded from JSON or built in code:
/// ```ignore
/// let config = SessionConfig::new("billing")
///     .default_allocation_size(20)
///     .log_statements(true);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Factory name, used in log events
    pub name: String,

    /// Block size of sequences whose mapping sets none
    pub default_allocation_size: u32,

    /// Number of parsed query filters kept in the LRU cache
    pub query_cache_capacity: usize,

    /// Emit a DEBUG event for every statement
    pub log_statements: bool,

    /// Entities loaded by a session start read-only
    pub default_read_only: bool,

    /// Flush pending changes before running a query
    pub flush_on_query: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_allocation_size: DEFAULT_SEQUENCE_INCREMENT,
            query_cache_capacity: 128,
            log_statements: false,
            default_read_only: false,
            flush_on_query: true,
        }
    }
}

impl SessionConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OrmError::Configuration(format!("invalid session configuration: {}", e)))
    }

    pub fn default_allocation_size(mut self, size: u32) -> Self {
        self.default_allocation_size = size;
        self
    }

    pub fn query_cache_capacity(mut self, capacity: usize) -> Self {
        self.query_cache_capacity = capacity;
        self
    }

    pub fn log_statements(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    pub fn flush_on_query(mut self, enabled: bool) -> Self {
        self.flush_on_query = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrmError::Configuration("name must not be empty".into()));
        }
        if self.default_allocation_size == 0 {
            return Err(OrmError::Configuration(
                "default_allocation_size must be at least 1".into(),
            ));
        }
        if self.query_cache_capacity == 0 {
            return Err(OrmError::Configuration(
                "query_cache_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = SessionConfig::new("billing")
            .default_allocation_size(20)
            .log_statements(true)
            .flush_on_query(false);
        assert_eq!(config.name, "billing");
        assert_eq!(config.default_allocation_size, 20);
        assert!(config.log_statements);
        assert!(!config.flush_on_query);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = SessionConfig::from_json(r#"{"name": "app", "default_read_only": true}"#).unwrap();
        assert_eq!(config.name, "app");
        assert!(config.default_read_only);
        assert_eq!(config.query_cache_capacity, 128);
        assert!(config.flush_on_query);
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(matches!(
            SessionConfig::from_json("{not json"),
            Err(OrmError::Configuration(_))
        ));
        assert!(SessionConfig::new("").validate().is_err());
        assert!(SessionConfig::default().default_allocation_size(0).validate().is_err());
        assert!(SessionConfig::default().query_cache_capacity(0).validate().is_err());
    }
}
