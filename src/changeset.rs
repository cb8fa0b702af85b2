/// Changeset - Incremental Change Propagation
///
/// Every physical write to a table is described by a `TableChange` before it
/// is applied. Writes happen in two phases:
///
/// 1. The table *prepares* the change (`Table::prepare_insert` and friends),
///    checking keys and record versions without touching storage.
/// 2. Every dependent view prepares its own delta from the same change. Only
///    when all of them succeed is the change applied to the table and the
///    deltas committed to the views.
///
/// A write therefore either reaches the table and all of its views, or none
/// of them.

use crate::column::ColumnValue;
use crate::error::Result;
use crate::table::Key;

/// Represents a single change to a table
#[derive(Debug, Clone, PartialEq)]
pub enum TableChange {
    /// A row was inserted under the given primary key
    RowInserted { key: Key, data: Vec<ColumnValue> },

    /// A row kept its primary key and changed some other columns
    RowUpdated {
        key: Key,
        old: Vec<ColumnValue>,
        new: Vec<ColumnValue>,
    },

    /// A row was deleted; `data` is the deleted image
    RowDeleted { key: Key, data: Vec<ColumnValue> },
}

impl TableChange {
    /// Returns the primary key affected by this change
    pub fn key(&self) -> &Key {
        match self {
            TableChange::RowInserted { key, .. } => key,
            TableChange::RowUpdated { key, .. } => key,
            TableChange::RowDeleted { key, .. } => key,
        }
    }

    /// The row image before the change, if the row existed
    pub fn old_row(&self) -> Option<&[ColumnValue]> {
        match self {
            TableChange::RowInserted { .. } => None,
            TableChange::RowUpdated { old, .. } => Some(old),
            TableChange::RowDeleted { data, .. } => Some(data),
        }
    }

    /// The row image after the change, if the row still exists
    pub fn new_row(&self) -> Option<&[ColumnValue]> {
        match self {
            TableChange::RowInserted { data, .. } => Some(data),
            TableChange::RowUpdated { new, .. } => Some(new),
            TableChange::RowDeleted { .. } => None,
        }
    }
}

/// Trait for views that are maintained incrementally from a source table
pub trait IncrementalView {
    /// Delta computed from a change, ready to be committed
    type Delta;

    /// Compute the effect of a change without modifying the view.
    /// Fails if the change cannot be represented (e.g. an aggregate overflows).
    fn prepare(&self, change: &TableChange) -> Result<Self::Delta>;

    /// Commit a delta produced by `prepare` against the current state.
    fn commit(&mut self, delta: Self::Delta);

    /// Apply a batch of changes in order.
    /// Returns true if the view was modified.
    fn apply_changes(&mut self, changes: &[TableChange]) -> Result<bool> {
        for change in changes {
            let delta = self.prepare(change)?;
            self.commit(delta);
        }
        Ok(!changes.is_empty())
    }

    /// Force a full rebuild from the source (fallback when incremental state
    /// is suspect)
    fn rebuild(&mut self) -> Result<()>;
}
