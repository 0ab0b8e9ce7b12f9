//! Table layouts used to decode row events
//!
//! Binlog rows events carry column types and values but no names or
//! signedness. The [`SchemaCache`] holds the layout fetched from the source's
//! metadata for every table seen on the stream. It is owned by the
//! replication task and needs no locking.

use crate::error::ConnectError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// `database.table` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// One column as reported by `INFORMATION_SCHEMA.COLUMNS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Lower-case `DATA_TYPE`, e.g. `int`, `varchar`, `blob`
    pub data_type: String,
    pub nullable: bool,
    pub unsigned: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into().to_ascii_lowercase(),
            nullable: true,
            unsigned: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    /// Binary string or blob column; its bytes must not be read as text.
    pub fn is_binary(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "binary"
                | "varbinary"
                | "tinyblob"
                | "blob"
                | "mediumblob"
                | "longblob"
                | "geometry"
                | "point"
                | "linestring"
                | "polygon"
        )
    }
}

/// Ordered column layout of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(table: TableRef, columns: Vec<ColumnSchema>) -> Self {
        Self { table, columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Loads a table's current layout from the source.
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch(&self, table: &TableRef) -> Result<TableSchema, ConnectError>;
}

/// Table layout cache with FIFO eviction.
#[derive(Debug)]
pub struct SchemaCache {
    tables: HashMap<TableRef, TableSchema>,
    insertion_order: VecDeque<TableRef>,
    max_entries: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    const DEFAULT_MAX_ENTRIES: usize = 1000;

    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            tables: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, table: &TableRef) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    /// Insert or replace the layout for `table`.
    pub fn put(&mut self, table: TableRef, schema: TableSchema) {
        use std::collections::hash_map::Entry;

        match self.tables.entry(table.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(schema);
            }
            Entry::Vacant(entry) => {
                entry.insert(schema);
                self.insertion_order.push_back(table);
                while self.tables.len() > self.max_entries {
                    match self.insertion_order.pop_front() {
                        Some(oldest) => {
                            self.tables.remove(&oldest);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Drop the layout for `table`; `get` returns `None` until the next `put`.
    pub fn invalidate(&mut self, table: &TableRef) -> bool {
        let removed = self.tables.remove(table).is_some();
        if removed {
            self.insertion_order.retain(|t| t != table);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.insertion_order.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(db: &str, table: &str, cols: &[&str]) -> TableSchema {
        TableSchema::new(
            TableRef::new(db, table),
            cols.iter().map(|c| ColumnSchema::new(*c, "int")).collect(),
        )
    }

    #[test]
    fn test_put_get_invalidate() {
        let mut cache = SchemaCache::new();
        let t = TableRef::new("shop", "orders");
        assert!(cache.get(&t).is_none());

        cache.put(t.clone(), schema("shop", "orders", &["id", "qty"]));
        assert_eq!(cache.get(&t).unwrap().column_count(), 2);

        assert!(cache.invalidate(&t));
        assert!(cache.get(&t).is_none());
        assert!(!cache.invalidate(&t));

        cache.put(t.clone(), schema("shop", "orders", &["id", "qty", "note"]));
        assert_eq!(
            cache.get(&t).unwrap().column_names().collect::<Vec<_>>(),
            vec!["id", "qty", "note"]
        );
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let mut cache = SchemaCache::new();
        let t = TableRef::new("a", "b");
        cache.put(t.clone(), schema("a", "b", &["x"]));
        cache.put(t.clone(), schema("a", "b", &["x", "y"]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&t).unwrap().column_count(), 2);
    }

    #[test]
    fn test_fifo_eviction() {
        let mut cache = SchemaCache::with_max_entries(2);
        for name in ["t1", "t2", "t3"] {
            cache.put(TableRef::new("db", name), schema("db", name, &["id"]));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&TableRef::new("db", "t1")).is_none());
        assert!(cache.get(&TableRef::new("db", "t3")).is_some());
    }

    #[test]
    fn test_invalidated_entry_not_evicted_twice() {
        let mut cache = SchemaCache::with_max_entries(2);
        let t1 = TableRef::new("db", "t1");
        cache.put(t1.clone(), schema("db", "t1", &["id"]));
        cache.invalidate(&t1);
        cache.put(TableRef::new("db", "t2"), schema("db", "t2", &["id"]));
        cache.put(TableRef::new("db", "t3"), schema("db", "t3", &["id"]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_binary_columns() {
        assert!(ColumnSchema::new("b", "VARBINARY").is_binary());
        assert!(ColumnSchema::new("b", "longblob").is_binary());
        assert!(!ColumnSchema::new("s", "varchar").is_binary());
        assert!(!ColumnSchema::new("s", "text").is_binary());
    }
}
