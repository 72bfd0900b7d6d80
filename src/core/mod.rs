pub mod error;
pub mod types;
pub mod value;

pub use error::{OrmError, Result};
pub use types::{CollectionKey, EntityKey, Row};
pub use value::{FieldValue, Value};
