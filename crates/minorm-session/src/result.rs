//! Rows produced by session execution.
//!
//! An entity in the select list becomes one [`Item::Entity`] element
//! labelled with the entity name; every other select item stays a plain
//! value under its column label.

use crate::instance::EntityRef;
use minorm_core::{ColumnInfo, ResultRow, Value};
use std::sync::Arc;

/// One element of an ORM row.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Entity(EntityRef),
    Value(Value),
}

impl Item {
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Item::Entity(e) => Some(e),
            Item::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::Entity(_) => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityRef> {
        match self {
            Item::Entity(e) => Some(e),
            Item::Value(_) => None,
        }
    }
}

/// A row of entity instances and values.
#[derive(Debug, Clone)]
pub struct OrmRow {
    items: Vec<Item>,
    columns: Arc<ColumnInfo>,
}

impl OrmRow {
    pub(crate) fn new(items: Vec<Item>, columns: Arc<ColumnInfo>) -> Self {
        Self { items, columns }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn labels(&self) -> &[String] {
        self.columns.names()
    }

    /// The instance under `label` (an entity name).
    pub fn entity(&self, label: &str) -> Option<&EntityRef> {
        self.item(label).and_then(Item::as_entity)
    }

    pub fn value(&self, label: &str) -> Option<&Value> {
        self.item(label).and_then(Item::as_value)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Item> {
        self.items
    }
}

impl ResultRow for OrmRow {
    type Item = Item;

    fn item(&self, label: &str) -> Option<&Item> {
        self.columns.index_of(label).and_then(|i| self.items.get(i))
    }

    fn into_first(self) -> Option<Item> {
        self.items.into_iter().next()
    }
}
