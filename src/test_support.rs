//! Entities shared by the unit tests.

use crate::Entity;
use crate::entity::{LazyList, Ref};

#[derive(Entity, Debug, Clone, Default)]
#[entity(table = "notes")]
pub struct Note {
    #[id]
    pub id: i64,
    pub body: String,
}

#[derive(Entity)]
#[entity(table = "authors")]
pub struct Author {
    #[id(strategy = "identity")]
    pub id: i64,
    pub name: String,
    #[version]
    pub version: i64,
    #[one_to_many(mapped_by = "author")]
    pub books: LazyList<Book>,
}

impl Author {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            version: 0,
            books: LazyList::new(),
        }
    }
}

#[derive(Entity)]
#[entity(table = "books")]
pub struct Book {
    #[id]
    pub id: i64,
    pub title: String,
    #[many_to_one]
    pub author: Option<Ref<Author>>,
}
