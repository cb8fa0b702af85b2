/// Relations and the in-memory ordered row store
///
/// A `Schema` describes one relation: its typed columns, primary key,
/// declared secondary indexes and kind. A `Table` stores the rows of one
/// relation ordered by primary key, keeps every secondary index as an ordered
/// set of `index columns ++ primary key` tuples, and offers the seek and scan
/// primitives cursors are built on.
///
/// Tables never validate column values themselves; cursors coerce values
/// against the schema before a change is prepared.

use crate::changeset::TableChange;
use crate::column::{Column, ColumnType, ColumnValue, MAX_DECIMAL_PRECISION};
use crate::error::{CursorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound;
use std::sync::Arc;

/// Primary key (or any key tuple) of a row
pub type Key = Vec<ColumnValue>;

/// Format a key tuple for messages, e.g. `(1, abc)`
pub fn format_key(key: &[ColumnValue]) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// A declared secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    #[default]
    Table,
    ReadOnlyTable,
    MaterializedView,
}

/// Schema definition for a relation.
///
/// # Examples
///
/// ```
/// use livecursor::{Column, ColumnType, Schema};
///
/// let schema = Schema::new(
///     "orders",
///     vec![
///         Column::new("id", ColumnType::Int, false),
///         Column::new("customer", ColumnType::varchar(30), false),
///         Column::new("total", ColumnType::decimal(10, 2), true),
///     ],
///     &["id"],
/// )
/// .with_index("idx_customer", &["customer"]);
///
/// assert_eq!(schema.len(), 3);
/// assert_eq!(schema.column_index("customer"), Some(1));
/// assert!(schema.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub kind: RelationKind,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub indices: Vec<Index>,
    /// Rows carry a version checked on update
    #[serde(default)]
    pub versioned: bool,
}

impl Schema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>, primary_key: &[&str]) -> Self {
        Schema {
            name: name.into(),
            kind: RelationKind::Table,
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            indices: Vec::new(),
            versioned: false,
        }
    }

    pub fn with_index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.indices.push(Index {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn with_kind(mut self, kind: RelationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_versioning(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of columns in the schema.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.kind != RelationKind::Table
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Like `column_index`, failing with `UnknownColumn`.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| CursorError::unknown_column(&self.name, name))
    }

    /// Positions of the primary key columns, in key order.
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect()
    }

    pub fn is_primary_key_column(&self, position: usize) -> bool {
        self.primary_key
            .iter()
            .any(|c| self.column_index(c) == Some(position))
    }

    /// Ordered column lists usable for seeks: the primary key first, then
    /// every declared index.
    pub fn index_column_lists(&self) -> Vec<&[String]> {
        let mut lists: Vec<&[String]> = vec![&self.primary_key];
        lists.extend(self.indices.iter().map(|i| i.columns.as_slice()));
        lists
    }

    pub fn key_of(&self, row: &[ColumnValue]) -> Key {
        self.primary_key_positions()
            .into_iter()
            .map(|p| row[p].clone())
            .collect()
    }

    /// Check internal consistency: unique column names, a non-empty primary
    /// key and indexes over existing columns, sane decimal declarations.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            CursorError::InvalidCatalog(format!("relation '{}': {}", self.name, reason))
        };
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column '{}'", column.name)));
            }
            if let ColumnType::Decimal { precision, scale } = column.column_type {
                if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
                    return Err(invalid(format!(
                        "column '{}' has invalid type {}",
                        column.name, column.column_type
                    )));
                }
            }
        }
        if self.primary_key.is_empty() {
            return Err(invalid("primary key is empty".to_string()));
        }
        for name in &self.primary_key {
            let column = self
                .column(name)
                .ok_or_else(|| invalid(format!("primary key column '{}' does not exist", name)))?;
            if column.nullable && self.kind != RelationKind::MaterializedView {
                return Err(invalid(format!("primary key column '{}' is nullable", name)));
            }
        }
        for index in &self.indices {
            if index.columns.is_empty() {
                return Err(invalid(format!("index '{}' has no columns", index.name)));
            }
            for name in &index.columns {
                if self.column_index(name).is_none() {
                    return Err(invalid(format!(
                        "index '{}' refers to unknown column '{}'",
                        index.name, name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A stored row and its record version
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: Vec<ColumnValue>,
    pub version: u64,
}

struct SecondaryIndex {
    positions: Vec<usize>,
    /// `index columns ++ primary key` tuples
    entries: BTreeSet<Key>,
}

impl SecondaryIndex {
    fn entry(&self, pk: &Key, row: &[ColumnValue]) -> Key {
        let mut entry: Key = self.positions.iter().map(|&p| row[p].clone()).collect();
        entry.extend(pk.iter().cloned());
        entry
    }
}

/// Ordered row store for one relation.
///
/// # Examples
///
/// ```
/// use livecursor::{Column, ColumnType, ColumnValue, Schema, Table};
/// use std::sync::Arc;
///
/// let schema = Schema::new(
///     "scores",
///     vec![
///         Column::new("id", ColumnType::Int, false),
///         Column::new("score", ColumnType::Float, true),
///     ],
///     &["id"],
/// );
/// let mut table = Table::new(Arc::new(schema));
///
/// let change = table
///     .prepare_insert(vec![ColumnValue::Int(1), ColumnValue::Float(95.5)])
///     .unwrap();
/// table.apply_change(&change);
///
/// assert_eq!(table.len(), 1);
/// assert!(table.get(&[ColumnValue::Int(1)]).is_some());
/// ```
pub struct Table {
    schema: Arc<Schema>,
    pk_positions: Vec<usize>,
    rows: BTreeMap<Key, StoredRow>,
    indices: Vec<SecondaryIndex>,
}

impl Table {
    pub fn new(schema: Arc<Schema>) -> Self {
        let pk_positions = schema.primary_key_positions();
        let indices = schema
            .indices
            .iter()
            .map(|index| SecondaryIndex {
                positions: index
                    .columns
                    .iter()
                    .filter_map(|c| schema.column_index(c))
                    .collect(),
                entries: BTreeSet::new(),
            })
            .collect();
        Table {
            schema,
            pk_positions,
            rows: BTreeMap::new(),
            indices,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn key_of(&self, row: &[ColumnValue]) -> Key {
        self.pk_positions.iter().map(|&p| row[p].clone()).collect()
    }

    pub fn get(&self, key: &[ColumnValue]) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &[ColumnValue]) -> bool {
        self.rows.contains_key(key)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Describe the insertion of a new row, failing if its key is taken.
    pub fn prepare_insert(&self, values: Vec<ColumnValue>) -> Result<TableChange> {
        let key = self.key_of(&values);
        if self.rows.contains_key(&key) {
            return Err(CursorError::DuplicateKey {
                relation: self.name().to_string(),
                key: format_key(&key),
            });
        }
        Ok(TableChange::RowInserted { key, data: values })
    }

    /// Describe the replacement of an existing row.
    ///
    /// `expected_version` is checked against the stored version when the
    /// relation is versioned. Returns `None` when nothing would change.
    pub fn prepare_update(
        &self,
        values: Vec<ColumnValue>,
        expected_version: Option<u64>,
    ) -> Result<Option<TableChange>> {
        let key = self.key_of(&values);
        let stored = self.rows.get(&key).ok_or_else(|| CursorError::NotFound {
            relation: self.name().to_string(),
            key: format_key(&key),
        })?;
        if self.schema.versioned {
            if let Some(expected) = expected_version {
                if expected != stored.version {
                    return Err(CursorError::VersionConflict {
                        relation: self.name().to_string(),
                        key: format_key(&key),
                    });
                }
            }
        }
        if stored.values == values {
            return Ok(None);
        }
        Ok(Some(TableChange::RowUpdated {
            key,
            old: stored.values.clone(),
            new: values,
        }))
    }

    /// Describe the deletion of the row stored under `key`.
    pub fn prepare_delete(&self, key: &[ColumnValue]) -> Result<TableChange> {
        let stored = self.rows.get(key).ok_or_else(|| CursorError::NotFound {
            relation: self.name().to_string(),
            key: format_key(key),
        })?;
        Ok(TableChange::RowDeleted {
            key: key.to_vec(),
            data: stored.values.clone(),
        })
    }

    /// Apply a prepared change. Inserting over an existing key replaces the
    /// row, which materialized views rely on for their backing tables.
    pub fn apply_change(&mut self, change: &TableChange) {
        match change {
            TableChange::RowInserted { key, data } | TableChange::RowUpdated { key, new: data, .. } => {
                let previous = self
                    .rows
                    .get(key)
                    .map(|existing| (existing.values.clone(), existing.version));
                let version = match previous {
                    Some((old, version)) => {
                        self.unindex(key, &old);
                        version + 1
                    }
                    None => 1,
                };
                self.index(key, data);
                self.rows.insert(
                    key.clone(),
                    StoredRow {
                        values: data.clone(),
                        version,
                    },
                );
            }
            TableChange::RowDeleted { key, .. } => {
                if let Some(stored) = self.rows.remove(key) {
                    self.unindex(key, &stored.values);
                }
            }
        }
    }

    /// Remove every row.
    pub fn truncate(&mut self) {
        self.rows.clear();
        for index in &mut self.indices {
            index.entries.clear();
        }
    }

    fn index(&mut self, key: &Key, row: &[ColumnValue]) {
        for index in &mut self.indices {
            let entry = index.entry(key, row);
            index.entries.insert(entry);
        }
    }

    fn unindex(&mut self, key: &Key, row: &[ColumnValue]) {
        for index in &mut self.indices {
            let entry = index.entry(key, row);
            index.entries.remove(&entry);
        }
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// All rows in primary key order.
    pub fn rows(&self) -> impl DoubleEndedIterator<Item = (&Key, &StoredRow)> + '_ {
        self.rows.iter()
    }

    /// Rows whose primary key starts with `prefix`, in primary key order.
    pub fn rows_with_prefix<'a>(
        &'a self,
        prefix: &'a [ColumnValue],
    ) -> impl Iterator<Item = (&'a Key, &'a StoredRow)> + 'a {
        self.rows
            .range::<[ColumnValue], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
    }

    /// Primary keys in the order of a secondary index.
    pub fn keys_by_index(&self, index: usize) -> impl DoubleEndedIterator<Item = Key> + '_ {
        let width = self.indices[index].positions.len();
        self.indices[index]
            .entries
            .iter()
            .map(move |entry| entry[width..].to_vec())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Table {{ name: '{}', columns: {}, rows: {} }}",
            self.schema.name,
            self.schema.len(),
            self.rows.len()
        )
    }
}
