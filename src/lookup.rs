/// Cross-cursor lookups
///
/// A `FieldsLookup` restricts a *target* cursor to the rows whose lookup
/// columns match the lookup columns of at least one row currently visible
/// through an *auxiliary* cursor. It is a semi-join:
///
/// ```text
/// target.(t1, t2, ...) IN (SELECT a1, a2, ... FROM auxiliary WHERE <aux filters>)
/// ```
///
/// Column pairs are validated as they are added. The target-side columns
/// must cover a prefix of some index (the primary key counts) of the target
/// relation, the auxiliary-side columns likewise on the auxiliary relation,
/// and both sides must sit at the same index positions. A failed `add`
/// leaves the lookup as it was. A lookup without pairs matches every row.
///
/// The auxiliary cursor is held by a shared handle, not copied: changing its
/// filters after the lookup is installed changes what the target sees on its
/// next scan.

use crate::cursor::{Cursor, RowSource};
use crate::error::{CursorError, Result};
use crate::table::{Key, Schema};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Lookup handle; clones share the same lookup.
#[derive(Clone)]
pub struct FieldsLookup {
    inner: Rc<RefCell<LookupInner>>,
}

struct LookupInner {
    target: RowSource,
    auxiliary: RowSource,
    target_columns: Vec<String>,
    auxiliary_columns: Vec<String>,
    target_positions: Vec<usize>,
    auxiliary_positions: Vec<usize>,
    next: Option<FieldsLookup>,
}

/// One link of a compiled lookup chain: the target positions to project and
/// the auxiliary tuples they must be found in.
pub(crate) struct LookupConstraint {
    pub(crate) positions: Vec<usize>,
    pub(crate) tuples: HashSet<Key>,
}

impl LookupConstraint {
    pub(crate) fn accepts(&self, row: &[crate::column::ColumnValue]) -> bool {
        let projected: Key = self.positions.iter().map(|&p| row[p].clone()).collect();
        self.tuples.contains(&projected)
    }
}

/// Position lists of `fields` in every index of `schema` (primary key
/// included) whose leading columns are exactly `fields`, or `None` when no
/// index begins with them.
fn index_orders(schema: &Schema, fields: &[String]) -> Option<HashSet<Vec<usize>>> {
    let orders: HashSet<Vec<usize>> = schema
        .index_column_lists()
        .into_iter()
        .filter_map(|columns| {
            fields
                .iter()
                .map(|f| columns.iter().position(|c| c == f))
                .collect::<Option<Vec<usize>>>()
        })
        .filter(|order| is_prefix(order))
        .collect();
    if orders.is_empty() {
        None
    } else {
        Some(orders)
    }
}

fn is_prefix(order: &[usize]) -> bool {
    let mut sorted = order.to_vec();
    sorted.sort_unstable();
    sorted.iter().enumerate().all(|(i, &p)| i == p)
}

impl FieldsLookup {
    pub(crate) fn new(target: RowSource, auxiliary: RowSource) -> Self {
        FieldsLookup {
            inner: Rc::new(RefCell::new(LookupInner {
                target,
                auxiliary,
                target_columns: Vec::new(),
                auxiliary_columns: Vec::new(),
                target_positions: Vec::new(),
                auxiliary_positions: Vec::new(),
                next: None,
            })),
        }
    }

    /// Pair a target column with an auxiliary column.
    ///
    /// Fails, in this order, on an unknown column, on incomparable column
    /// types, when either side's columns are not covered by an index prefix,
    /// and when the two sides have no index order in common.
    pub fn add(&self, target_column: &str, auxiliary_column: &str) -> Result<&Self> {
        let mut inner = self.inner.borrow_mut();
        let target_schema = Arc::clone(&inner.target.schema);
        let auxiliary_schema = Arc::clone(&inner.auxiliary.schema);

        let target_position = target_schema.require_column(target_column)?;
        let auxiliary_position = auxiliary_schema.require_column(auxiliary_column)?;

        let target_type = target_schema.columns[target_position].column_type;
        let auxiliary_type = auxiliary_schema.columns[auxiliary_position].column_type;
        if !target_type.is_comparable_with(&auxiliary_type) {
            return Err(CursorError::TypeMismatch {
                column: format!("{}.{}", target_schema.name, target_column),
                expected: target_type.to_string(),
                found: format!("{} ({}.{})", auxiliary_type, auxiliary_schema.name, auxiliary_column),
            });
        }

        let mut target_columns = inner.target_columns.clone();
        target_columns.push(target_column.to_string());
        let mut auxiliary_columns = inner.auxiliary_columns.clone();
        auxiliary_columns.push(auxiliary_column.to_string());

        let unindexed = |schema: &Schema, columns: &[String]| CursorError::UnindexedLookup {
            relation: schema.name.clone(),
            columns: columns.to_vec(),
        };
        let target_orders = index_orders(&target_schema, &target_columns)
            .ok_or_else(|| unindexed(&target_schema, &target_columns))?;
        let auxiliary_orders = index_orders(&auxiliary_schema, &auxiliary_columns)
            .ok_or_else(|| unindexed(&auxiliary_schema, &auxiliary_columns))?;

        if target_orders.is_disjoint(&auxiliary_orders) {
            return Err(CursorError::LookupIndexMismatch {
                target: target_schema.name.clone(),
                auxiliary: auxiliary_schema.name.clone(),
            });
        }

        inner.target_columns = target_columns;
        inner.auxiliary_columns = auxiliary_columns;
        inner.target_positions.push(target_position);
        inner.auxiliary_positions.push(auxiliary_position);
        log::trace!(
            "lookup {}.{:?} in {}.{:?}",
            target_schema.name,
            inner.target_columns,
            auxiliary_schema.name,
            inner.auxiliary_columns
        );
        drop(inner);
        Ok(self)
    }

    /// Chain a further lookup against another auxiliary cursor. The target
    /// keeps only rows satisfying every lookup of the chain.
    pub fn and(&self, auxiliary: &Cursor) -> Result<FieldsLookup> {
        let target = self.inner.borrow().target.clone();
        target.check_lookup_partner(&auxiliary.source())?;
        let lookup = FieldsLookup::new(target, auxiliary.source());

        let mut tail = self.clone();
        loop {
            let next = tail.inner.borrow().next.clone();
            match next {
                Some(next) => tail = next,
                None => break,
            }
        }
        tail.inner.borrow_mut().next = Some(lookup.clone());
        Ok(lookup)
    }

    /// Independent copy of the whole chain with `target` as its target.
    /// Auxiliary cursors stay shared.
    pub(crate) fn copy_for(&self, target: &RowSource) -> FieldsLookup {
        let inner = self.inner.borrow();
        FieldsLookup {
            inner: Rc::new(RefCell::new(LookupInner {
                target: target.clone(),
                auxiliary: inner.auxiliary.clone(),
                target_columns: inner.target_columns.clone(),
                auxiliary_columns: inner.auxiliary_columns.clone(),
                target_positions: inner.target_positions.clone(),
                auxiliary_positions: inner.auxiliary_positions.clone(),
                next: inner.next.as_ref().map(|next| next.copy_for(target)),
            })),
        }
    }

    /// Number of column pairs of this link
    pub fn len(&self) -> usize {
        self.inner.borrow().target_columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn target_columns(&self) -> Vec<String> {
        self.inner.borrow().target_columns.clone()
    }

    pub fn auxiliary_columns(&self) -> Vec<String> {
        self.inner.borrow().auxiliary_columns.clone()
    }

    pub fn target_relation(&self) -> String {
        self.inner.borrow().target.schema.name.clone()
    }

    pub fn auxiliary_relation(&self) -> String {
        self.inner.borrow().auxiliary.schema.name.clone()
    }

    pub(crate) fn targets(&self, source: &RowSource) -> bool {
        self.inner.borrow().target.same_cursor(source)
    }

    /// Whether evaluating this chain reads through `source`.
    pub(crate) fn depends_on(&self, source: &RowSource) -> bool {
        let inner = self.inner.borrow();
        inner.auxiliary.depends_on(source)
            || inner.next.as_ref().map_or(false, |next| next.depends_on(source))
    }

    /// Evaluate every link against its auxiliary cursor's current state.
    /// Links without pairs are skipped.
    pub(crate) fn compile(&self) -> Vec<LookupConstraint> {
        let mut constraints = Vec::new();
        let mut link = Some(self.clone());
        while let Some(current) = link {
            let inner = current.inner.borrow();
            if !inner.target_positions.is_empty() {
                constraints.push(LookupConstraint {
                    positions: inner.target_positions.clone(),
                    tuples: inner.auxiliary.visible_projection(&inner.auxiliary_positions),
                });
            }
            link = inner.next.clone();
        }
        constraints
    }
}

impl fmt::Debug for FieldsLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("FieldsLookup")
            .field("target", &inner.target.schema.name)
            .field("auxiliary", &inner.auxiliary.schema.name)
            .field("target_columns", &inner.target_columns)
            .field("auxiliary_columns", &inner.auxiliary_columns)
            .field("chained", &inner.next.is_some())
            .finish()
    }
}
